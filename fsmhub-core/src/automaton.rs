//! Automaton state.

use crate::definition::AutomatonDef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A live state machine for one entity.
///
/// The current state is only ever changed by the owning registry.
#[derive(Debug, Clone)]
pub struct Automaton {
    definition: Arc<AutomatonDef>,
    state: usize,
    since: DateTime<Utc>,
}

impl Automaton {
    /// Creates an automaton at its initial state.
    pub fn new(definition: Arc<AutomatonDef>, now: DateTime<Utc>) -> Self {
        let state = definition.initial;
        Self {
            definition,
            state,
            since: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &Arc<AutomatonDef> {
        &self.definition
    }

    /// Index of the current state.
    pub fn state(&self) -> usize {
        self.state
    }

    pub fn state_name(&self) -> &str {
        self.definition.state_name(self.state)
    }

    /// When the current state was entered.
    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    pub fn is_initial(&self) -> bool {
        self.state == self.definition.initial
    }

    pub(crate) fn set_state(&mut self, state: usize, since: DateTime<Utc>) {
        self.state = state;
        self.since = since;
    }

    /// Durable form of the current state.
    pub fn to_state(&self) -> AutomatonState {
        AutomatonState {
            state: self.state_name().to_string(),
            since: self.since,
        }
    }
}

/// Persisted state of one automaton.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomatonState {
    pub state: String,
    pub since: DateTime<Utc>,
}

/// Automaton id to persisted state.
pub type Snapshot = BTreeMap<String, AutomatonState>;
