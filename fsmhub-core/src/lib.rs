//! # fsmhub-core
//!
//! Rules engine core for fsmhub.
//!
//! This crate provides:
//! - The guard/action expression language and its closed function set
//! - Rule document parsing and whole-generation compilation
//! - Automaton state and the first-match event matcher

pub mod automaton;
pub mod compile;
pub mod context;
pub mod definition;
pub mod error;
pub mod expr;
pub mod function;
pub mod registry;

pub use automaton::{Automaton, AutomatonState, Snapshot};
pub use compile::{Action, ExpressionCache, Guard};
pub use context::{display_value, EmptyScope, EventContext, Scope};
pub use definition::{AutomatonDef, RuleDocument, RuleSet, StateDef, TransitionDef};
pub use error::{CompileErrors, CoreError};
pub use expr::{is_truthy, BinaryOp, Expr};
pub use function::{ArgKind, Function, FunctionHost};
pub use registry::{Change, Registry, ScheduledAction, Trigger};
