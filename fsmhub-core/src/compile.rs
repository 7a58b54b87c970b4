//! Compiled guards and actions.

use crate::context::Scope;
use crate::error::CoreError;
use crate::expr::{invoke, Expr};
use crate::function::{Function, FunctionHost};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A compiled transition guard.
///
/// Guards may only call side-effect free functions.
#[derive(Debug, Clone)]
pub struct Guard {
    source: String,
    expr: Expr,
}

impl Guard {
    pub fn compile(source: &str) -> Result<Self, CoreError> {
        let expr = Expr::parse(source)?;

        if let Some(impure) = expr.calls().into_iter().find(|f| !f.is_pure()) {
            return Err(CoreError::Parse {
                expr: source.trim().to_string(),
                reason: format!("{} has side effects and cannot be used in a guard", impure),
            });
        }

        Ok(Self {
            source: source.trim().to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the guard. A non-boolean result is an error.
    pub fn matches(&self, scope: &dyn Scope, host: &mut dyn FunctionHost) -> Result<bool, CoreError> {
        match self.expr.evaluate(scope, host)? {
            Value::Bool(b) => Ok(b),
            _ => Err(CoreError::NotBoolean {
                expr: self.source.clone(),
            }),
        }
    }
}

/// A compiled action: exactly one top-level function call.
#[derive(Debug, Clone)]
pub struct Action {
    source: String,
    function: Function,
    args: Vec<Expr>,
}

impl Action {
    pub fn compile(source: &str) -> Result<Self, CoreError> {
        match Expr::parse(source)? {
            Expr::Call(function, args) => Ok(Self {
                source: source.trim().to_string(),
                function,
                args,
            }),
            _ => Err(CoreError::Parse {
                expr: source.trim().to_string(),
                reason: "an action must be a single function call".to_string(),
            }),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn function(&self) -> Function {
        self.function
    }

    /// Evaluates the arguments and performs the call.
    pub fn execute(&self, scope: &dyn Scope, host: &mut dyn FunctionHost) -> Result<Value, CoreError> {
        let mut values = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            values.push(arg.evaluate(scope, host)?);
        }
        invoke(self.function, values, scope, host)
    }
}

/// Compiled expressions keyed by their source text.
///
/// One cache belongs to one rule generation; a reload starts a fresh one.
#[derive(Debug, Default)]
pub struct ExpressionCache {
    guards: HashMap<String, Arc<Guard>>,
    actions: HashMap<String, Arc<Action>>,
}

impl ExpressionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the compiled guard for `source`, compiling it on first use.
    pub fn guard(&mut self, source: &str) -> Result<Arc<Guard>, CoreError> {
        if let Some(guard) = self.guards.get(source) {
            return Ok(Arc::clone(guard));
        }
        let guard = Arc::new(Guard::compile(source)?);
        self.guards.insert(source.to_string(), Arc::clone(&guard));
        Ok(guard)
    }

    /// Returns the compiled action for `source`, compiling it on first use.
    pub fn action(&mut self, source: &str) -> Result<Arc<Action>, CoreError> {
        if let Some(action) = self.actions.get(source) {
            return Ok(Arc::clone(action));
        }
        let action = Arc::new(Action::compile(source)?);
        self.actions.insert(source.to_string(), Arc::clone(&action));
        Ok(action)
    }

    /// Number of distinct compiled expressions.
    pub fn len(&self) -> usize {
        self.guards.len() + self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EmptyScope;
    use serde_json::json;

    struct Recorder(Vec<(Function, Vec<Value>)>);

    impl FunctionHost for Recorder {
        fn call(&mut self, function: Function, _ctx: &dyn Scope, args: Vec<Value>) -> Result<Value, CoreError> {
            self.0.push((function, args));
            Ok(Value::from("idle"))
        }
    }

    #[test]
    fn test_guard_rejects_side_effects() {
        assert!(Guard::compile(r#"State("alarm") == "armed""#).is_ok());

        let err = Guard::compile(r#"Log("x") == null"#).unwrap_err();
        assert!(err.to_string().contains("Log has side effects"));
        assert!(Guard::compile(r#"a || StartTimer("t", 1)"#).is_err());
    }

    #[test]
    fn test_guard_requires_boolean() {
        let guard = Guard::compile("1 + 1").unwrap();
        let err = guard.matches(&EmptyScope, &mut Recorder(vec![])).unwrap_err();
        assert!(matches!(err, CoreError::NotBoolean { .. }));

        let guard = Guard::compile(r#"State("kettle") == "idle""#).unwrap();
        assert!(guard.matches(&EmptyScope, &mut Recorder(vec![])).unwrap());
    }

    #[test]
    fn test_action_must_be_call() {
        assert!(Action::compile(r#"Log("hello")"#).is_ok());
        for src in [r#""hello""#, "1 + 2", r#"Log("a") || Log("b")"#, "Log"] {
            assert!(Action::compile(src).is_err(), "{src}");
        }
    }

    #[test]
    fn test_action_execute() {
        let action = Action::compile(r#"Alert("door " + "open", 'phone')"#).unwrap();
        assert_eq!(action.function(), Function::Alert);

        let mut host = Recorder(vec![]);
        action.execute(&EmptyScope, &mut host).unwrap();
        assert_eq!(host.0, vec![(Function::Alert, vec![json!("door open"), json!("phone")])]);
    }

    #[test]
    fn test_cache_shares_compiled_expressions() {
        let mut cache = ExpressionCache::new();
        let a = cache.guard("x == 1").unwrap();
        let b = cache.guard("x == 1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        cache.action(r#"Log("x")"#).unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.guard("x ==").is_err());
        assert_eq!(cache.len(), 2);
    }
}
