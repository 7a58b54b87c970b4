//! Startup reconciliation.
//!
//! For a short window after startup, retained `state` events replayed by the
//! bus are applied with [`Registry::restore`]. When the window closes, every
//! automaton that was neither restored nor changed is taken to be at its
//! current (initial) state, and the caller publishes that state so the next
//! start sees it.

use chrono::{DateTime, Utc};
use fsmhub_bus::{topics, Event};
use fsmhub_core::{AutomatonState, Registry, Snapshot};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub struct Reconciler {
    deadline: Instant,
    open: bool,
    reconciled: HashSet<String>,
}

impl Reconciler {
    /// Opens a window that closes `window` from now.
    pub fn new(window: Duration) -> Self {
        Self {
            deadline: Instant::now() + window,
            open: true,
            reconciled: HashSet::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Records that an automaton's state is known.
    pub fn mark(&mut self, id: impl Into<String>) {
        if self.open {
            self.reconciled.insert(id.into());
        }
    }

    pub fn is_reconciled(&self, id: &str) -> bool {
        self.reconciled.contains(id)
    }

    /// Applies a retained `state` event while the window is open. Returns
    /// true if an automaton was restored.
    pub fn observe_retained(&mut self, registry: &mut Registry, event: &Event) -> bool {
        if !self.open || event.topic != topics::STATE {
            return false;
        }
        let Some(state) = event.string_field("state") else {
            return false;
        };
        let since = event
            .string_field("since")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(event.timestamp);

        let mut snapshot = Snapshot::new();
        snapshot.insert(
            event.entity.clone(),
            AutomatonState {
                state: state.to_string(),
                since,
            },
        );

        let restored = !registry.restore(&snapshot).is_empty();
        if restored {
            debug!(automaton = %event.entity, state, "restored from retained state");
            self.reconciled.insert(event.entity.clone());
        }
        restored
    }

    /// Closes the window. Returns the automata whose state was never
    /// confirmed, in declared order.
    pub fn close(&mut self, registry: &Registry) -> Vec<String> {
        self.open = false;
        let reconciled = std::mem::take(&mut self.reconciled);

        registry
            .automata()
            .map(|a| a.id())
            .filter(|id| !reconciled.contains(*id))
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsmhub_bus::Fields;
    use fsmhub_core::RuleSet;

    const RULES: &str = r#"
automata:
  front_door:
    initial: closed
    states: {closed: {}, open: {}}
  porch:
    initial: dark
    states: {dark: {}, lit: {}}
  kettle:
    initial: idle
    states: {idle: {}, boiling: {}}
"#;

    fn registry() -> Registry {
        Registry::new(RuleSet::from_yaml(RULES).unwrap())
    }

    fn state_event(entity: &str, state: &str) -> Event {
        Event::new(topics::STATE, entity, Fields::new())
            .with_field("state", state)
            .with_retained(true)
    }

    #[tokio::test]
    async fn test_retained_restore() {
        let mut registry = registry();
        let mut reconciler = Reconciler::new(Duration::from_secs(5));

        let since = "2026-03-01T08:00:00Z";
        let event = state_event("front_door", "open").with_field("since", since);
        assert!(reconciler.observe_retained(&mut registry, &event));

        let door = registry.get("front_door").unwrap();
        assert_eq!(door.state_name(), "open");
        assert_eq!(door.since(), since.parse::<DateTime<Utc>>().unwrap());
        assert!(reconciler.is_reconciled("front_door"));
        assert!(registry.pop_change().is_none());
        assert!(!registry.has_pending());
    }

    #[tokio::test]
    async fn test_ignored_events() {
        let mut registry = registry();
        let mut reconciler = Reconciler::new(Duration::from_secs(5));

        assert!(!reconciler.observe_retained(&mut registry, &state_event("garage", "open")));
        assert!(!reconciler.observe_retained(&mut registry, &state_event("porch", "purple")));

        let no_state = Event::new(topics::STATE, "porch", Fields::new());
        assert!(!reconciler.observe_retained(&mut registry, &no_state));

        let other = Event::new("door", "porch", Fields::new()).with_field("state", "lit");
        assert!(!reconciler.observe_retained(&mut registry, &other));

        assert_eq!(registry.state_of("porch"), Some("dark"));
    }

    #[tokio::test]
    async fn test_close_reports_unreconciled() {
        let mut registry = registry();
        let mut reconciler = Reconciler::new(Duration::from_secs(5));

        reconciler.observe_retained(&mut registry, &state_event("porch", "lit"));
        reconciler.mark("kettle");

        assert_eq!(reconciler.close(&registry), vec!["front_door".to_string()]);
        assert!(!reconciler.is_open());

        // Nothing is applied once the window has closed.
        assert!(!reconciler.observe_retained(&mut registry, &state_event("front_door", "open")));
        assert_eq!(registry.state_of("front_door"), Some("closed"));
        reconciler.mark("front_door");
        assert!(!reconciler.is_reconciled("front_door"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let reconciler = Reconciler::new(Duration::from_secs(5));
        tokio::time::sleep_until(reconciler.deadline()).await;
        assert!(Instant::now() >= reconciler.deadline());
        assert!(reconciler.is_open());
    }
}
