//! Sunrise and sunset for the configured location.
//!
//! The service publishes `earth` events (entity `earth`, `command` =
//! `sunrise` or `sunset`) when the next one falls due.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SunEvent {
    Sunrise,
    Sunset,
}

impl SunEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SunEvent::Sunrise => "sunrise",
            SunEvent::Sunset => "sunset",
        }
    }
}

impl fmt::Display for SunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sunrise and sunset on `date`, in time order. Polar day and night
/// produce no events.
pub fn sun_events(latitude: f64, longitude: f64, date: NaiveDate) -> Vec<(DateTime<Utc>, SunEvent)> {
    let Some(midnight) = date.and_hms_opt(0, 0, 0).map(|t| Utc.from_utc_datetime(&t)) else {
        return Vec::new();
    };
    let (rise, set) =
        sunrise::sunrise_sunset(latitude, longitude, date.year(), date.month(), date.day());

    // The calculation degenerates to the epoch when the sun never crosses
    // the horizon.
    let plausible = |at: &DateTime<Utc>| {
        *at > midnight - Duration::days(1) && *at < midnight + Duration::days(2)
    };

    let mut events: Vec<_> = [(rise, SunEvent::Sunrise), (set, SunEvent::Sunset)]
        .into_iter()
        .filter_map(|(secs, event)| Utc.timestamp_opt(secs, 0).single().map(|at| (at, event)))
        .filter(|(at, _)| plausible(at))
        .collect();
    events.sort_by_key(|(at, _)| *at);
    events
}

/// The first sun event strictly after `after`, looking a few days ahead.
pub fn next_sun_event(
    latitude: f64,
    longitude: f64,
    after: DateTime<Utc>,
) -> Option<(DateTime<Utc>, SunEvent)> {
    let today = after.date_naive();
    (-1..=2)
        .filter_map(|offset| today.checked_add_signed(Duration::days(offset)))
        .flat_map(|date| sun_events(latitude, longitude, date))
        .filter(|(at, _)| *at > after)
        .min_by_key(|(at, _)| *at)
}
