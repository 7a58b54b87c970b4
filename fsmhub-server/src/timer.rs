//! Named countdown timers.
//!
//! A timer that expires publishes `timer` for entity `timer.<name>` with
//! command `on`; it never touches automaton state directly. Starting a timer
//! under a name that is already running replaces it.

use crate::error::ServerError;
use fsmhub_bus::{topics, Event, Fields, Publisher};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct TimerManager {
    publisher: Arc<dyn Publisher>,
    timers: HashMap<String, JoinHandle<()>>,
}

impl TimerManager {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            publisher,
            timers: HashMap::new(),
        }
    }

    /// Starts (or restarts) a named timer.
    pub fn start(&mut self, name: &str, duration: Duration) {
        self.timers.retain(|_, handle| !handle.is_finished());
        if let Some(previous) = self.timers.remove(name) {
            previous.abort();
            tracing::debug!(timer = %name, "replaced running timer");
        }

        let publisher = Arc::clone(&self.publisher);
        let event_entity = format!("timer.{}", name);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            tracing::debug!(timer = %event_entity, "timer expired");
            let event = Event::new(topics::TIMER, event_entity, Fields::new()).with_field("command", "on");
            publisher.emit(event);
        });

        self.timers.insert(name.to_string(), handle);
    }

    /// Starts a timer from a number of seconds.
    pub fn start_secs(&mut self, name: &str, secs: f64) -> Result<Duration, ServerError> {
        let duration = Duration::try_from_secs_f64(secs).map_err(|_| ServerError::InvalidTimer {
            name: name.to_string(),
            reason: format!("invalid duration {}s", secs),
        })?;
        self.start(name, duration);
        Ok(duration)
    }

    /// Starts a timer whose duration is drawn once, uniformly from `[min, max)`.
    pub fn start_random(&mut self, name: &str, min: f64, max: f64) -> Result<Duration, ServerError> {
        if !min.is_finite() || !max.is_finite() || max <= min {
            return Err(ServerError::InvalidTimer {
                name: name.to_string(),
                reason: format!("max ({}) must be greater than min ({})", max, min),
            });
        }

        let secs = rand::thread_rng().gen_range(min..max);
        self.start_secs(name, secs)
    }

    /// Cancels a named timer. Returns true if one was running.
    pub fn cancel(&mut self, name: &str) -> bool {
        match self.timers.remove(name) {
            Some(handle) => {
                let running = !handle.is_finished();
                handle.abort();
                running
            }
            None => false,
        }
    }

    /// Number of timers still counting down.
    pub fn active(&self) -> usize {
        self.timers.values().filter(|h| !h.is_finished()).count()
    }

    /// Cancels every timer.
    pub fn shutdown(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsmhub_bus::{LocalBus, Subscriber};
    use tokio::time::Instant;

    fn manager() -> (TimerManager, fsmhub_bus::EventStream) {
        let bus = LocalBus::shared();
        let rx = bus.subscribe(&[topics::TIMER]);
        (TimerManager::new(bus), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let (mut timers, mut rx) = manager();
        let started = Instant::now();

        tokio_test::assert_ok!(timers.start_secs("kettle_on", 180.0));
        assert_eq!(timers.active(), 1);

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.entity, "timer.kettle_on");
        assert_eq!(ev.command_name(), Some("on"));
        assert!(started.elapsed() >= Duration::from_secs(180));

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(timers.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces() {
        let (mut timers, mut rx) = manager();
        let started = Instant::now();

        timers.start("kettle_on", Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(30)).await;
        timers.start("kettle_on", Duration::from_secs(60));

        rx.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(90));

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let (mut timers, mut rx) = manager();

        timers.start("porch", Duration::from_secs(10));
        assert!(timers.cancel("porch"));
        assert!(!timers.cancel("porch"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_timer_range() {
        let (mut timers, mut rx) = manager();

        let err = timers.start_random("porch", 5.0, 5.0).unwrap_err();
        assert!(matches!(err, ServerError::InvalidTimer { .. }));
        tokio_test::assert_err!(timers.start_random("porch", 8.0, 3.0));
        assert_eq!(timers.active(), 0);

        let started = Instant::now();
        let duration = timers.start_random("porch", 3.0, 8.0).unwrap();
        assert!(duration >= Duration::from_secs(3) && duration < Duration::from_secs(8));

        rx.recv().await.unwrap();
        assert!(started.elapsed() >= duration);
    }

    #[tokio::test]
    async fn test_negative_duration_rejected() {
        let (mut timers, _rx) = manager();
        assert!(timers.start_secs("x", -1.0).is_err());
        assert_eq!(timers.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_all() {
        let (mut timers, mut rx) = manager();
        timers.start("a", Duration::from_secs(5));
        timers.start("b", Duration::from_secs(5));

        timers.shutdown();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }
}
