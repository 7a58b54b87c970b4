//! Side-effecting function handlers used by actions.

use crate::config::Inventory;
use crate::error::ServerError;
use crate::script::ScriptRunner;
use crate::timer::TimerManager;
use fsmhub_bus::{topics, Event, Fields, Publisher, Subscriber};
use fsmhub_core::{CoreError, Function, FunctionHost, Registry, Scope};
use fsmhub_storage::AuditLog;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Shared resources the function handlers act on.
pub struct Effects {
    pub publisher: Arc<dyn Publisher>,
    pub subscriber: Arc<dyn Subscriber>,
    pub audit: Arc<AuditLog>,
    pub scripts: ScriptRunner,
    pub query_timeout: Duration,
    pub devices: Arc<Inventory>,
}

impl Effects {
    /// Publishes a command for an entity.
    pub fn send_command(&self, entity: &str, command: &str, fields: Fields) {
        let mut event = Event::command(entity, command);
        event.fields.extend(fields);
        self.publisher.emit(event);
    }

    /// Appends to the audit log and publishes the matching `log` event.
    pub fn log(&self, message: &str) -> Result<(), ServerError> {
        info!("Log: {}", message);
        self.audit.append(message)?;
        self.publisher.emit(
            Event::new(topics::LOG, "automata", Fields::new())
                .with_field("message", message)
                .with_field("source", "event"),
        );
        Ok(())
    }

    /// Publishes a query and collects answers carrying its id until the
    /// query timeout. Answers are discarded. Returns the correlation id.
    pub fn query(&self, text: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let (entity, question) = match text.trim().split_once(char::is_whitespace) {
            Some((entity, question)) => (entity, question.trim()),
            None => (text.trim(), ""),
        };

        // Subscribe first so no answer can slip past.
        let mut answers = self.subscriber.subscribe(&[topics::ANSWER]);
        self.publisher.emit(
            Event::new(topics::QUERY, entity, Fields::new())
                .with_field("query", question)
                .with_field("id", id.as_str()),
        );
        info!("Query {} {}", entity, question);

        let timeout = self.query_timeout;
        let query_id = id.clone();
        tokio::spawn(async move {
            let mut received = 0usize;
            let _ = tokio::time::timeout(timeout, async {
                while let Some(answer) = answers.recv().await {
                    if answer.string_field("id") == Some(query_id.as_str()) {
                        received += 1;
                    }
                }
            })
            .await;
            debug!(query = %query_id, received, "query closed");
        });

        id
    }
}

/// Parses `entity [command] key=value ...`.
///
/// A bare word after the entity names the command (default `on`). Values
/// that look like numbers become numbers.
pub fn parse_command(text: &str) -> Result<(String, String, Fields), ServerError> {
    let mut words = text.split_whitespace();
    let entity = words
        .next()
        .ok_or_else(|| ServerError::InvalidRequest("command needs an entity".to_string()))?;

    let (command, fields) = parse_arguments(words);
    Ok((entity.to_string(), command, fields))
}

/// Parses `[command] key=value ...` words.
pub fn parse_arguments<'a>(words: impl IntoIterator<Item = &'a str>) -> (String, Fields) {
    let mut command = "on".to_string();
    let mut fields = Fields::new();

    for word in words {
        match word.split_once('=') {
            Some((key, value)) => {
                fields.insert(key.to_string(), coerce(value));
            }
            None => command = word.to_string(),
        }
    }

    (command, fields)
}

fn coerce(value: &str) -> Value {
    if let Ok(n) = value.parse::<i64>() {
        return Value::from(n);
    }
    match value.parse::<f64>() {
        Ok(f) if f.is_finite() => Value::from(f),
        _ => Value::from(value),
    }
}

/// Executes functions for actions, on the service loop.
pub struct ActionHost<'a> {
    effects: &'a Effects,
    registry: &'a Registry,
    timers: &'a mut TimerManager,
}

impl<'a> ActionHost<'a> {
    pub fn new(effects: &'a Effects, registry: &'a Registry, timers: &'a mut TimerManager) -> Self {
        Self {
            effects,
            registry,
            timers,
        }
    }

    fn dispatch(&mut self, function: Function, ctx: &dyn Scope, args: &[Value]) -> Result<Value, ServerError> {
        let text = |i: usize| args.get(i).and_then(Value::as_str).unwrap_or_default();
        let number = |i: usize| args.get(i).and_then(Value::as_f64).unwrap_or_default();

        match function {
            Function::State => Ok(self.registry.state_value(args)?),
            Function::Alert => {
                let message = ctx.interpolate(text(0));
                let target = text(1);
                info!("Alert {}: {}", target, message);
                self.effects.publisher.emit(
                    Event::new(topics::ALERT, target, Fields::new())
                        .with_field("message", message)
                        .with_field("target", target),
                );
                Ok(Value::Null)
            }
            Function::Command => {
                let (entity, command, fields) = parse_command(&ctx.interpolate(text(0)))?;
                self.effects.send_command(&entity, &command, fields);
                Ok(Value::Null)
            }
            Function::Log => {
                self.effects.log(&ctx.interpolate(text(0)))?;
                Ok(Value::Null)
            }
            Function::Query => Ok(Value::from(self.effects.query(text(0)))),
            Function::Script => {
                let line = ctx.interpolate(text(0));
                self.effects.scripts.resolve(&line)?;
                info!("Running script: {}", line);
                self.effects.scripts.spawn(&line);
                Ok(Value::Null)
            }
            Function::Snapshot => {
                let mut fields = Fields::new();
                fields.insert("message".to_string(), Value::from(ctx.interpolate(text(2))));
                fields.insert("notify".to_string(), Value::from(text(1)));
                self.effects.send_command(text(0), "snapshot", fields);
                Ok(Value::Null)
            }
            Function::StartTimer => {
                let duration = self.timers.start_secs(text(0), number(1))?;
                info!("Starting timer: {} for {:.1}s", text(0), duration.as_secs_f64());
                Ok(Value::Null)
            }
            Function::RandomTimer => {
                let duration = self.timers.start_random(text(0), number(1), number(2))?;
                info!("Starting timer: {} for {:.1}s", text(0), duration.as_secs_f64());
                Ok(Value::Null)
            }
        }
    }
}

impl FunctionHost for ActionHost<'_> {
    fn call(&mut self, function: Function, ctx: &dyn Scope, args: Vec<Value>) -> Result<Value, CoreError> {
        self.dispatch(function, ctx, &args).map_err(|e| match e {
            ServerError::Core(e) => e,
            other => CoreError::Function {
                function: function.name(),
                reason: other.to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsmhub_bus::{EventStream, LocalBus};
    use fsmhub_core::{Action, EmptyScope, EventContext, RuleSet};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        bus: Arc<LocalBus>,
        effects: Effects,
        registry: Registry,
        timers: TimerManager,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let bus = LocalBus::shared();
            let audit = Arc::new(AuditLog::open(dir.path().join("events.log")).unwrap());
            let effects = Effects {
                publisher: bus.clone(),
                subscriber: bus.clone(),
                audit,
                scripts: ScriptRunner::new(dir.path()),
                query_timeout: Duration::from_secs(5),
                devices: Arc::new(Inventory::new()),
            };
            let rules = RuleSet::from_yaml(
                "automata:\n  porch:\n    initial: dark\n    states:\n      dark: {}\n      lit: {}\n",
            )
            .unwrap();

            Self {
                _dir: dir,
                timers: TimerManager::new(bus.clone()),
                bus,
                effects,
                registry: Registry::new(rules),
            }
        }

        fn run(&mut self, source: &str, scope: &dyn Scope) -> Result<Value, CoreError> {
            let action = Action::compile(source).unwrap();
            let mut host = ActionHost::new(&self.effects, &self.registry, &mut self.timers);
            action.execute(scope, &mut host)
        }

        fn subscribe(&self, topic: &str) -> EventStream {
            self.bus.subscribe(&[topic])
        }
    }

    #[test]
    fn test_parse_command() {
        let (entity, command, fields) = parse_command("light.porch off level=40 ratio=0.5 mode=dim").unwrap();
        assert_eq!(entity, "light.porch");
        assert_eq!(command, "off");
        assert_eq!(fields["level"], Value::from(40));
        assert_eq!(fields["ratio"], Value::from(0.5));
        assert_eq!(fields["mode"], Value::from("dim"));

        let (entity, command, fields) = parse_command("  scene.evening ").unwrap();
        assert_eq!(entity, "scene.evening");
        assert_eq!(command, "on");
        assert!(fields.is_empty());

        assert!(parse_command("   ").is_err());
    }

    #[test]
    fn test_coerce() {
        assert_eq!(coerce("12"), Value::from(12));
        assert_eq!(coerce("-3"), Value::from(-3));
        assert_eq!(coerce("1.25"), Value::from(1.25));
        assert_eq!(coerce("inf"), Value::from("inf"));
        assert_eq!(coerce("NaN"), Value::from("NaN"));
        assert_eq!(coerce("warm"), Value::from("warm"));
    }

    #[tokio::test]
    async fn test_command_interpolates() {
        let mut fx = Fixture::new();
        let mut rx = fx.subscribe(topics::COMMAND);

        let trigger = Event::new("motion", "motion.hall", Fields::new()).with_field("level", 70);
        let scope = EventContext::new(&trigger);
        fx.run(r#"Command("light.hall on level=$level")"#, &scope).unwrap();

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.entity, "light.hall");
        assert_eq!(ev.command_name(), Some("on"));
        assert_eq!(ev.field("level"), Some(&Value::from(70)));
    }

    #[tokio::test]
    async fn test_log_appends_and_publishes() {
        let mut fx = Fixture::new();
        let mut rx = fx.subscribe(topics::LOG);

        fx.run(r#"Log("front door opened")"#, &EmptyScope).unwrap();

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.entity, "automata");
        assert_eq!(ev.string_field("message"), Some("front door opened"));
        assert_eq!(ev.string_field("source"), Some("event"));

        let lines = fx.effects.audit.tail(10).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with(": front door opened"));
    }

    #[tokio::test]
    async fn test_alert_and_snapshot() {
        let mut fx = Fixture::new();
        let mut alerts = fx.subscribe(topics::ALERT);
        let mut commands = fx.subscribe(topics::COMMAND);

        fx.run(r#"Alert("left open $who", "phone")"#, &EmptyScope).unwrap();
        let ev = alerts.recv().await.unwrap();
        assert_eq!(ev.entity, "phone");
        assert_eq!(ev.string_field("message"), Some("left open $who"));
        assert_eq!(ev.string_field("target"), Some("phone"));

        fx.run(r#"Snapshot("camera.porch", "phone", "someone at the door")"#, &EmptyScope)
            .unwrap();
        let ev = commands.recv().await.unwrap();
        assert_eq!(ev.entity, "camera.porch");
        assert_eq!(ev.command_name(), Some("snapshot"));
        assert_eq!(ev.string_field("notify"), Some("phone"));
        assert_eq!(ev.string_field("message"), Some("someone at the door"));
    }

    #[tokio::test]
    async fn test_state_function() {
        let mut fx = Fixture::new();
        assert_eq!(fx.run(r#"State("porch")"#, &EmptyScope).unwrap(), Value::from("dark"));

        let err = fx.run(r#"State("garage")"#, &EmptyScope).unwrap_err();
        assert!(matches!(err, CoreError::AutomatonNotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers() {
        let mut fx = Fixture::new();
        let mut rx = fx.subscribe(topics::TIMER);

        fx.run(r#"StartTimer("kettle_on", 180)"#, &EmptyScope).unwrap();
        assert_eq!(fx.timers.active(), 1);

        let err = fx.run(r#"RandomTimer("porch", 5, 5)"#, &EmptyScope).unwrap_err();
        match err {
            CoreError::Function { function, reason } => {
                assert_eq!(function, "RandomTimer");
                assert!(reason.contains("greater than"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fx.timers.active(), 1);

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.entity, "timer.kettle_on");
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_collects_answers() {
        let mut fx = Fixture::new();
        let mut queries = fx.subscribe(topics::QUERY);

        let id = fx.run(r#"Query("weather forecast today")"#, &EmptyScope).unwrap();
        let id = id.as_str().unwrap().to_string();

        let ev = queries.recv().await.unwrap();
        assert_eq!(ev.entity, "weather");
        assert_eq!(ev.string_field("query"), Some("forecast today"));
        assert_eq!(ev.string_field("id"), Some(id.as_str()));

        // The collector holds one answer subscription until the timeout.
        let before = fx.bus.subscriber_count();
        fx.bus.emit(
            Event::new(topics::ANSWER, "weather", Fields::new())
                .with_field("id", id.as_str())
                .with_field("text", "sunny"),
        );
        tokio::time::sleep(Duration::from_secs(6)).await;
        fx.bus.emit(Event::new(topics::ANSWER, "weather", Fields::new()));
        assert_eq!(fx.bus.subscriber_count(), before - 1);
    }

    #[tokio::test]
    async fn test_script_rejects_empty_line() {
        let mut fx = Fixture::new();
        let err = fx.run(r#"Script("  ")"#, &EmptyScope).unwrap_err();
        assert!(matches!(err, CoreError::Function { function: "Script", .. }));
    }

    #[tokio::test]
    async fn test_argument_errors_surface() {
        let mut fx = Fixture::new();
        let err = fx.run(r#"StartTimer("kettle_on")"#, &EmptyScope).unwrap_err();
        assert!(matches!(err, CoreError::Arity { .. }));
    }
}
