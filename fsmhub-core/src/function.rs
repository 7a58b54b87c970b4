//! The closed set of functions callable from expressions.
//!
//! Every call receives the evaluation context explicitly; the arguments
//! written in the expression follow it. Argument counts and types are
//! checked before a handler runs, so handlers only ever see well-formed
//! arguments.

use crate::context::Scope;
use crate::error::CoreError;
use serde_json::{Number, Value};
use std::fmt;

/// Expected type of a function argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    String,
    /// Any number; integers are coerced to floating point.
    Number,
}

impl ArgKind {
    fn name(self) -> &'static str {
        match self {
            ArgKind::String => "string",
            ArgKind::Number => "number",
        }
    }
}

/// A built-in function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    /// Current state of a named automaton.
    State,
    /// User-facing alert to a named channel.
    Alert,
    /// Downstream command to an entity.
    Command,
    /// Audit log entry.
    Log,
    /// Bus query whose answers are collected and discarded.
    Query,
    /// External script, run asynchronously.
    Script,
    /// Capture request forwarded to a notification target.
    Snapshot,
    /// Start or replace a named countdown timer.
    StartTimer,
    /// Start or replace a named timer with a random duration in `[min, max)`.
    RandomTimer,
}

impl Function {
    pub const ALL: [Function; 9] = [
        Function::State,
        Function::Alert,
        Function::Command,
        Function::Log,
        Function::Query,
        Function::Script,
        Function::Snapshot,
        Function::StartTimer,
        Function::RandomTimer,
    ];

    /// Name as written in expressions.
    pub fn name(self) -> &'static str {
        match self {
            Function::State => "State",
            Function::Alert => "Alert",
            Function::Command => "Command",
            Function::Log => "Log",
            Function::Query => "Query",
            Function::Script => "Script",
            Function::Snapshot => "Snapshot",
            Function::StartTimer => "StartTimer",
            Function::RandomTimer => "RandomTimer",
        }
    }

    /// Resolves a function by name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }

    /// Argument types, excluding the implicit context.
    pub fn signature(self) -> &'static [ArgKind] {
        match self {
            Function::State => &[ArgKind::String],
            Function::Alert => &[ArgKind::String, ArgKind::String],
            Function::Command => &[ArgKind::String],
            Function::Log => &[ArgKind::String],
            Function::Query => &[ArgKind::String],
            Function::Script => &[ArgKind::String],
            Function::Snapshot => &[ArgKind::String, ArgKind::String, ArgKind::String],
            Function::StartTimer => &[ArgKind::String, ArgKind::Number],
            Function::RandomTimer => &[ArgKind::String, ArgKind::Number, ArgKind::Number],
        }
    }

    /// Returns true if the function has no side effects and may appear in guards.
    pub fn is_pure(self) -> bool {
        matches!(self, Function::State)
    }

    /// Checks arity and argument types, coercing integers to floating point.
    pub fn check_arguments(self, args: &mut [Value]) -> Result<(), CoreError> {
        let signature = self.signature();
        if args.len() != signature.len() {
            return Err(CoreError::Arity {
                function: self.name(),
                expected: signature.len(),
                got: args.len(),
            });
        }

        for (i, (arg, kind)) in args.iter_mut().zip(signature).enumerate() {
            let coerced = match (kind, &*arg) {
                (ArgKind::String, Value::String(_)) => continue,
                (ArgKind::Number, Value::Number(n)) => n.as_f64().and_then(Number::from_f64),
                _ => None,
            };

            match coerced {
                Some(n) => *arg = Value::Number(n),
                None => {
                    return Err(CoreError::ArgumentType {
                        function: self.name(),
                        position: i + 1,
                        expected: kind.name(),
                        got: arg.to_string(),
                    })
                }
            }
        }

        Ok(())
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Executes built-in functions.
///
/// Implementations map each [`Function`] to a handler; `args` have already
/// passed [`Function::check_arguments`].
pub trait FunctionHost {
    fn call(
        &mut self,
        function: Function,
        ctx: &dyn Scope,
        args: Vec<Value>,
    ) -> Result<Value, CoreError>;
}
