//! Automaton registry and event matcher.
//!
//! The registry owns every automaton of the active rule generation and
//! is driven from a single loop. Matching an event is two-phase: every
//! guard is evaluated against the states as they were before the event,
//! then the matched transitions are applied. Applying a transition records
//! a [`Change`] and queues the leaving, transition and entering actions;
//! nothing runs inline.

use crate::automaton::{Automaton, Snapshot};
use crate::compile::{Action, Guard};
use crate::context::{EventContext, Scope};
use crate::definition::RuleSet;
use crate::error::CoreError;
use crate::function::{Function, FunctionHost};
use chrono::{DateTime, Duration, Utc};
use fsmhub_bus::Event;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What caused a change.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// An ordinary bus event.
    Event(Arc<Event>),
    /// An administrative override.
    Admin,
}

impl Trigger {
    /// Evaluates a guard against the trigger. Administrative triggers never
    /// match a guard.
    pub fn matches(&self, guard: &Guard, host: &mut dyn FunctionHost) -> Result<bool, CoreError> {
        match self {
            Trigger::Event(event) => guard.matches(&EventContext::new(event), host),
            Trigger::Admin => Ok(false),
        }
    }

    pub fn event(&self) -> Option<&Arc<Event>> {
        match self {
            Trigger::Event(event) => Some(event),
            Trigger::Admin => None,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Event(event) => write!(f, "{}", event),
            Trigger::Admin => f.write_str("user"),
        }
    }
}

/// One accepted transition.
#[derive(Debug, Clone)]
pub struct Change {
    pub automaton: String,
    pub old: String,
    pub new: String,
    pub trigger: Trigger,
    /// Time spent in the old state.
    pub duration: Duration,
    pub at: DateTime<Utc>,
}

/// An action queued by a change, executed later by the dispatcher.
#[derive(Debug, Clone)]
pub struct ScheduledAction {
    pub automaton: String,
    pub action: Arc<Action>,
    pub change: Arc<Change>,
}

/// Serves `State` lookups while guards are evaluated; every other function
/// is refused.
struct GuardHost<'a> {
    registry: &'a Registry,
}

impl FunctionHost for GuardHost<'_> {
    fn call(
        &mut self,
        function: Function,
        _ctx: &dyn Scope,
        args: Vec<Value>,
    ) -> Result<Value, CoreError> {
        match function {
            Function::State => self.registry.state_value(&args),
            other => Err(CoreError::Function {
                function: other.name(),
                reason: "not available while matching".to_string(),
            }),
        }
    }
}

/// A transition selected in the matching phase.
struct Matched {
    automaton: usize,
    to: usize,
    actions: Vec<Arc<Action>>,
}

/// Owns the automata of the active rule generation.
pub struct Registry {
    rules: Arc<RuleSet>,
    generation: u64,
    automata: IndexMap<String, Automaton>,
    changes: VecDeque<Arc<Change>>,
    actions: VecDeque<ScheduledAction>,
}

impl Registry {
    /// Creates a registry with every automaton at its initial state.
    pub fn new(rules: RuleSet) -> Self {
        let automata = build_automata(&rules, Utc::now());
        Self {
            rules: Arc::new(rules),
            generation: 1,
            automata,
            changes: VecDeque::new(),
            actions: VecDeque::new(),
        }
    }

    pub fn rules(&self) -> &Arc<RuleSet> {
        &self.rules
    }

    /// Rule generation, incremented on every successful reload.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, id: &str) -> Option<&Automaton> {
        self.automata.get(id)
    }

    /// Automata in declared order.
    pub fn automata(&self) -> impl Iterator<Item = &Automaton> {
        self.automata.values()
    }

    pub fn len(&self) -> usize {
        self.automata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.automata.is_empty()
    }

    /// Current state name of an automaton.
    pub fn state_of(&self, id: &str) -> Option<&str> {
        self.automata.get(id).map(Automaton::state_name)
    }

    /// `State(name)` as seen by expressions.
    pub fn state_value(&self, args: &[Value]) -> Result<Value, CoreError> {
        let name = args.first().and_then(Value::as_str).unwrap_or_default();
        self.state_of(name)
            .map(Value::from)
            .ok_or_else(|| CoreError::AutomatonNotFound {
                automaton: name.to_string(),
            })
    }

    /// Matches an event against every automaton. Returns the number of
    /// transitions applied.
    pub fn process(&mut self, event: Arc<Event>) -> usize {
        self.process_at(event, Utc::now())
    }

    /// Like [`Registry::process`], with an explicit clock.
    pub fn process_at(&mut self, event: Arc<Event>, now: DateTime<Utc>) -> usize {
        let trigger = Trigger::Event(event);
        let matched = self.match_transitions(&trigger);
        let count = matched.len();

        for m in matched {
            self.apply(m.automaton, m.to, &m.actions, trigger.clone(), now);
        }

        count
    }

    fn match_transitions(&self, trigger: &Trigger) -> Vec<Matched> {
        let mut host = GuardHost { registry: self };
        let mut matched = Vec::new();

        for (index, automaton) in self.automata.values().enumerate() {
            let definition = automaton.definition();

            for transition in definition.transitions_from(automaton.state()) {
                let guard = &transition.guard;
                let accepted = match trigger.matches(guard, &mut host) {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(
                            automaton = %definition.id,
                            guard = guard.source(),
                            error = %e,
                            "guard evaluation failed"
                        );
                        false
                    }
                };

                if accepted {
                    matched.push(Matched {
                        automaton: index,
                        to: transition.to,
                        actions: transition.actions.clone(),
                    });
                    break;
                }
            }
        }

        matched
    }

    /// Moves an automaton to an explicit state, bypassing guards.
    pub fn change_state(&mut self, id: &str, state: &str, trigger: Trigger) -> Result<(), CoreError> {
        self.change_state_at(id, state, trigger, Utc::now())
    }

    pub fn change_state_at(
        &mut self,
        id: &str,
        state: &str,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let index = self
            .automata
            .get_index_of(id)
            .ok_or_else(|| CoreError::AutomatonNotFound {
                automaton: id.to_string(),
            })?;
        let to = self.automata[index]
            .definition()
            .state_index(state)
            .ok_or_else(|| CoreError::StateNotFound {
                automaton: id.to_string(),
                state: state.to_string(),
            })?;

        self.apply(index, to, &[], trigger, now);
        Ok(())
    }

    fn apply(
        &mut self,
        index: usize,
        to: usize,
        actions: &[Arc<Action>],
        trigger: Trigger,
        now: DateTime<Utc>,
    ) {
        let automaton = &mut self.automata[index];
        let definition = Arc::clone(automaton.definition());
        let from = automaton.state();
        let duration = now - automaton.since();
        automaton.set_state(to, now);

        let change = Arc::new(Change {
            automaton: definition.id.clone(),
            old: definition.state_name(from).to_string(),
            new: definition.state_name(to).to_string(),
            trigger,
            duration,
            at: now,
        });
        info!(
            "[{}] {}->{} (event: {})",
            change.automaton, change.old, change.new, change.trigger
        );

        let scheduled = definition.states[from]
            .leaving
            .iter()
            .chain(actions)
            .chain(&definition.states[to].entering);
        for action in scheduled {
            self.actions.push_back(ScheduledAction {
                automaton: definition.id.clone(),
                action: Arc::clone(action),
                change: Arc::clone(&change),
            });
        }
        self.changes.push_back(change);
    }

    /// Sets states from a snapshot without emitting changes or running
    /// actions. Unknown automata and states are skipped. Returns the ids
    /// that were restored.
    pub fn restore(&mut self, snapshot: &Snapshot) -> Vec<String> {
        let mut restored = Vec::new();

        for (id, saved) in snapshot {
            let Some(automaton) = self.automata.get_mut(id) else {
                debug!(automaton = %id, "restore skipped: unknown automaton");
                continue;
            };
            let Some(state) = automaton.definition().state_index(&saved.state) else {
                debug!(automaton = %id, state = %saved.state, "restore skipped: unknown state");
                continue;
            };

            automaton.set_state(state, saved.since);
            restored.push(id.clone());
        }

        restored
    }

    /// Current state of every automaton.
    pub fn persist(&self) -> Snapshot {
        self.automata
            .iter()
            .map(|(id, a)| (id.clone(), a.to_state()))
            .collect()
    }

    /// Swaps in a new rule generation.
    ///
    /// Automata present in both generations keep their state and `since`;
    /// removed automata are dropped; new ones start at their initial state.
    /// Returns the ids that did not carry a state over.
    pub fn replace_rules(&mut self, rules: RuleSet) -> Vec<String> {
        let previous = self.persist();

        self.automata = build_automata(&rules, Utc::now());
        self.rules = Arc::new(rules);
        self.generation += 1;

        let restored: HashSet<String> = self.restore(&previous).into_iter().collect();
        self.automata
            .keys()
            .filter(|id| !restored.contains(*id))
            .cloned()
            .collect()
    }

    /// Takes the oldest pending change.
    pub fn pop_change(&mut self) -> Option<Arc<Change>> {
        self.changes.pop_front()
    }

    /// Takes the oldest pending action.
    pub fn pop_action(&mut self) -> Option<ScheduledAction> {
        self.actions.pop_front()
    }

    pub fn has_pending(&self) -> bool {
        !self.changes.is_empty() || !self.actions.is_empty()
    }
}

fn build_automata(rules: &RuleSet, now: DateTime<Utc>) -> IndexMap<String, Automaton> {
    rules
        .automata()
        .map(|def| (def.id.clone(), Automaton::new(Arc::clone(def), now)))
        .collect()
}
