//! Rule document types.
//!
//! A rule document declares named automata in YAML:
//!
//! ```yaml
//! automata:
//!   front_door:
//!     initial: closed
//!     states:
//!       closed: {}
//!       open:
//!         entering: ['Log("front door opened")']
//!       ajar: {}
//!     transitions:
//!       - from: closed
//!         to: open
//!         when: 'type == "door" && command == "open"'
//!       - from: [open, ajar]
//!         to: closed
//!         when: 'type == "door" && command == "close"'
//! ```
//!
//! A whole document compiles into one [`RuleSet`] or fails with every
//! problem found.

use crate::compile::{Action, ExpressionCache, Guard};
use crate::error::{CompileErrors, CoreError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Parsed rule document, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleDocument {
    #[serde(default)]
    pub automata: IndexMap<String, AutomatonSpec>,
}

/// One automaton as written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomatonSpec {
    pub initial: String,

    /// States in declared order. A state with no hooks may be written `name: {}`
    /// or left empty.
    #[serde(default)]
    pub states: IndexMap<String, Option<StateSpec>>,

    #[serde(default)]
    pub transitions: Vec<TransitionSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entering: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub leaving: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionSpec {
    /// Source state(s). Can be a single state or a list.
    #[serde(deserialize_with = "deserialize_from_states")]
    pub from: Vec<String>,

    pub to: String,

    /// Guard expression. Required; a missing guard is a compile error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
}

fn deserialize_from_states<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct FromStatesVisitor;

    impl<'de> Visitor<'de> for FromStatesVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a state name or list of state names")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut states = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                states.push(s);
            }
            Ok(states)
        }
    }

    deserializer.deserialize_any(FromStatesVisitor)
}

/// A compiled state and its hooks.
#[derive(Debug, Clone)]
pub struct StateDef {
    pub name: String,
    pub entering: Vec<Arc<Action>>,
    pub leaving: Vec<Arc<Action>>,
}

/// A compiled transition.
#[derive(Debug, Clone)]
pub struct TransitionDef {
    pub from: usize,
    pub to: usize,
    pub guard: Arc<Guard>,
    pub actions: Vec<Arc<Action>>,
}

/// Validated automaton definition. States are referred to by index.
#[derive(Debug, Clone)]
pub struct AutomatonDef {
    pub id: String,
    pub states: Vec<StateDef>,
    pub initial: usize,
    /// Transitions leaving each state, in declared order.
    outgoing: Vec<Vec<TransitionDef>>,
}

impl AutomatonDef {
    fn compile(
        id: &str,
        spec: &AutomatonSpec,
        cache: &mut ExpressionCache,
        errors: &mut CompileErrors,
    ) -> Option<Self> {
        let invalid = |reason: String| CoreError::InvalidDefinition {
            reason: format!("automaton '{}': {}", id, reason),
        };
        let before = errors.len();

        if spec.states.is_empty() {
            errors.push(invalid("no states declared".to_string()));
        }

        let initial = spec.states.get_index_of(&spec.initial);
        if initial.is_none() && !spec.states.is_empty() {
            errors.push(invalid(format!("unknown initial state '{}'", spec.initial)));
        }

        let mut states = Vec::with_capacity(spec.states.len());
        for (name, state) in &spec.states {
            let state = state.clone().unwrap_or_default();
            states.push(StateDef {
                name: name.clone(),
                entering: compile_actions(&state.entering, cache, errors),
                leaving: compile_actions(&state.leaving, cache, errors),
            });
        }

        let mut outgoing = vec![Vec::new(); states.len()];
        for t in &spec.transitions {
            let to = spec.states.get_index_of(&t.to);
            if to.is_none() {
                errors.push(invalid(format!("unknown transition target '{}'", t.to)));
            }
            if t.from.is_empty() {
                errors.push(invalid(format!("transition to '{}' has no source state", t.to)));
            }

            let guard = match t.when.as_deref().map(str::trim).filter(|w| !w.is_empty()) {
                Some(when) => match cache.guard(when) {
                    Ok(guard) => Some(guard),
                    Err(e) => {
                        errors.push(e);
                        None
                    }
                },
                None => {
                    errors.push(invalid(format!("transition to '{}' has no guard", t.to)));
                    None
                }
            };
            let actions = compile_actions(&t.actions, cache, errors);

            for from in &t.from {
                let Some(from) = spec.states.get_index_of(from) else {
                    errors.push(invalid(format!("unknown transition source '{}'", from)));
                    continue;
                };
                if let (Some(to), Some(guard)) = (to, &guard) {
                    outgoing[from].push(TransitionDef {
                        from,
                        to,
                        guard: guard.clone(),
                        actions: actions.clone(),
                    });
                }
            }
        }

        if errors.len() > before {
            return None;
        }

        Some(Self {
            id: id.to_string(),
            states,
            initial: initial?,
            outgoing,
        })
    }

    /// Transitions leaving the given state, in declared order.
    pub fn transitions_from(&self, state: usize) -> &[TransitionDef] {
        self.outgoing.get(state).map(Vec::as_slice).unwrap_or_default()
    }

    /// Finds a state by name.
    pub fn state_index(&self, name: &str) -> Option<usize> {
        self.states.iter().position(|s| s.name == name)
    }

    pub fn state_name(&self, index: usize) -> &str {
        &self.states[index].name
    }

    pub fn has_state(&self, name: &str) -> bool {
        self.state_index(name).is_some()
    }
}

fn compile_actions(
    sources: &[String],
    cache: &mut ExpressionCache,
    errors: &mut CompileErrors,
) -> Vec<Arc<Action>> {
    let mut actions = Vec::with_capacity(sources.len());
    for source in sources {
        match cache.action(source) {
            Ok(action) => actions.push(action),
            Err(e) => errors.push(e),
        }
    }
    actions
}

/// One validated generation of rules.
#[derive(Debug)]
pub struct RuleSet {
    automata: IndexMap<String, Arc<AutomatonDef>>,
    cache: ExpressionCache,
    checksum: String,
}

impl RuleSet {
    /// Validates and compiles a document. All problems are reported together.
    pub fn compile(document: &RuleDocument) -> Result<Self, CoreError> {
        let mut cache = ExpressionCache::new();
        let mut errors = CompileErrors::new();
        let mut automata = IndexMap::with_capacity(document.automata.len());

        for (id, spec) in &document.automata {
            if let Some(def) = AutomatonDef::compile(id, spec, &mut cache, &mut errors) {
                automata.insert(id.clone(), Arc::new(def));
            }
        }
        errors.into_result()?;

        let json_bytes = serde_json::to_vec(document)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&json_bytes));

        Ok(Self {
            automata,
            cache,
            checksum,
        })
    }

    /// Parses and compiles a YAML rule document.
    pub fn from_yaml(yaml: &str) -> Result<Self, CoreError> {
        let document: RuleDocument = serde_yaml::from_str(yaml)?;
        Self::compile(&document)
    }

    /// Automaton definitions in declared order.
    pub fn automata(&self) -> impl Iterator<Item = &Arc<AutomatonDef>> {
        self.automata.values()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<AutomatonDef>> {
        self.automata.get(id)
    }

    pub fn len(&self) -> usize {
        self.automata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.automata.is_empty()
    }

    /// Number of distinct compiled expressions.
    pub fn expression_count(&self) -> usize {
        self.cache.len()
    }

    /// Checksum of the normalized document.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }
}
