//! Action execution context.

use crate::config::Inventory;
use chrono::{DateTime, Duration, Local, Utc};
use fsmhub_core::{Change, EventContext, Scope};
use serde_json::Value;

/// Names resolved while an action runs under a [`Change`].
///
/// Device metadata (`id`, `name`, `type`, `cap`, `group`) comes from the
/// inventory entry of the triggering entity; `duration`, `timestamp` and
/// `datetime` describe the change itself. Anything else is looked up on the
/// triggering event.
pub struct ChangeContext<'a> {
    change: &'a Change,
    devices: &'a Inventory,
}

impl<'a> ChangeContext<'a> {
    pub fn new(change: &'a Change, devices: &'a Inventory) -> Self {
        Self { change, devices }
    }

    fn device_lookup(&self, name: &str) -> Option<Value> {
        let entity = &self.change.trigger.event()?.entity;
        let device = self.devices.get(entity)?;

        match name {
            "id" => Some(Value::from(entity.as_str())),
            "name" => Some(Value::from(device.name.as_str())),
            "type" => Some(Value::from(entity.split('.').next().unwrap_or_default())),
            "cap" => device.caps.first().map(|c| Value::from(c.as_str())),
            "group" => Some(Value::from(device.group.as_str())),
            _ => None,
        }
    }
}

impl Scope for ChangeContext<'_> {
    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.device_lookup(name) {
            return Some(value);
        }

        match name {
            "duration" => Some(Value::from(friendly_duration(self.change.duration))),
            "timestamp" => Some(Value::from(clock_time(self.change.at))),
            "datetime" => Some(Value::from(stamp(self.change.at))),
            _ => {
                let event = self.change.trigger.event()?;
                EventContext::new(event).lookup(name)
            }
        }
    }
}

/// `3:04PM` in local time.
pub fn clock_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%-I:%M%p").to_string()
}

/// `Jan _2 15:04:05.000` in local time.
pub fn stamp(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%b %e %H:%M:%S%.3f").to_string()
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", n, unit)
    }
}

/// Human duration in the largest whole unit: `45 seconds`, `1 minute`,
/// `3 hours`, `2 days`.
pub fn friendly_duration(duration: Duration) -> String {
    let secs = duration.num_seconds().max(0);
    match secs {
        s if s < 60 => plural(s, "second"),
        s if s < 3600 => plural(s / 60, "minute"),
        s if s < 86400 => plural(s / 3600, "hour"),
        s => plural(s / 86400, "day"),
    }
}

/// Compact duration for status listings: `45s`, `3m`, `2h5m`, `3d4h`.
pub fn short_duration(duration: Duration) -> String {
    let secs = duration.num_seconds().max(0);
    let pair = |major: i64, major_unit: char, minor: i64, minor_unit: char| {
        if minor == 0 {
            format!("{}{}", major, major_unit)
        } else {
            format!("{}{}{}{}", major, major_unit, minor, minor_unit)
        }
    };

    match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86400 => pair(s / 3600, 'h', s % 3600 / 60, 'm'),
        s => pair(s / 86400, 'd', s % 86400 / 3600, 'h'),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConf;
    use fsmhub_bus::{Event, Fields};
    use fsmhub_core::Trigger;
    use std::sync::Arc;

    fn change(trigger: Trigger) -> Change {
        Change {
            automaton: "front_door".to_string(),
            old: "closed".to_string(),
            new: "open".to_string(),
            trigger,
            duration: Duration::minutes(3),
            at: Utc::now(),
        }
    }

    fn devices() -> Inventory {
        let mut devices = Inventory::new();
        devices.insert(
            "door.front".to_string(),
            DeviceConf {
                name: "Front door".to_string(),
                caps: vec!["door".to_string(), "battery".to_string()],
                group: "hall".to_string(),
            },
        );
        devices
    }

    fn door_event(entity: &str) -> Trigger {
        Trigger::Event(Arc::new(
            Event::new("door", entity, Fields::new())
                .with_field("command", "open")
                .with_field("name", "from-event"),
        ))
    }

    #[test]
    fn test_inventory_lookup() {
        let devices = devices();
        let change = change(door_event("door.front"));
        let ctx = ChangeContext::new(&change, &devices);

        assert_eq!(ctx.lookup("id"), Some(Value::from("door.front")));
        assert_eq!(ctx.lookup("name"), Some(Value::from("Front door")));
        assert_eq!(ctx.lookup("type"), Some(Value::from("door")));
        assert_eq!(ctx.lookup("cap"), Some(Value::from("door")));
        assert_eq!(ctx.lookup("group"), Some(Value::from("hall")));
        assert_eq!(ctx.lookup("duration"), Some(Value::from("3 minutes")));
        assert_eq!(ctx.lookup("command"), Some(Value::from("open")));
        assert_eq!(ctx.lookup("missing"), None);
        assert_eq!(ctx.interpolate("$name is $command"), "Front door is open");
    }

    #[test]
    fn test_unknown_device_falls_through() {
        let devices = devices();
        let change = change(door_event("door.garage"));
        let ctx = ChangeContext::new(&change, &devices);

        assert_eq!(ctx.lookup("name"), Some(Value::from("from-event")));
        assert_eq!(ctx.lookup("type"), Some(Value::from("door")));
        assert_eq!(ctx.lookup("group"), None);
    }

    #[test]
    fn test_admin_trigger() {
        let devices = devices();
        let change = change(Trigger::Admin);
        let ctx = ChangeContext::new(&change, &devices);

        assert_eq!(ctx.lookup("id"), None);
        assert_eq!(ctx.lookup("command"), None);
        assert!(ctx.lookup("timestamp").is_some());
        assert!(ctx.lookup("datetime").is_some());
        assert_eq!(ctx.interpolate("open for $duration"), "open for 3 minutes");
    }

    #[test]
    fn test_friendly_duration() {
        assert_eq!(friendly_duration(Duration::seconds(0)), "0 seconds");
        assert_eq!(friendly_duration(Duration::seconds(1)), "1 second");
        assert_eq!(friendly_duration(Duration::seconds(59)), "59 seconds");
        assert_eq!(friendly_duration(Duration::seconds(60)), "1 minute");
        assert_eq!(friendly_duration(Duration::minutes(90)), "1 hour");
        assert_eq!(friendly_duration(Duration::hours(5)), "5 hours");
        assert_eq!(friendly_duration(Duration::days(2)), "2 days");
        assert_eq!(friendly_duration(Duration::seconds(-5)), "0 seconds");
    }

    #[test]
    fn test_short_duration() {
        assert_eq!(short_duration(Duration::seconds(45)), "45s");
        assert_eq!(short_duration(Duration::minutes(3)), "3m");
        assert_eq!(short_duration(Duration::minutes(125)), "2h5m");
        assert_eq!(short_duration(Duration::hours(2)), "2h");
        assert_eq!(short_duration(Duration::hours(76)), "3d4h");
        assert_eq!(short_duration(Duration::days(1)), "1d");
    }

    #[test]
    fn test_time_formats() {
        let at: DateTime<Utc> = "2026-01-02T15:04:05.123Z".parse().unwrap();
        let local = at.with_timezone(&Local);

        let clock = clock_time(at);
        assert!(clock.ends_with("AM") || clock.ends_with("PM"));
        assert!(clock.contains(&format!(":{:02}", chrono::Timelike::minute(&local))));

        assert!(stamp(at).ends_with(&format!("{:02}.123", chrono::Timelike::second(&local))));
    }
}
