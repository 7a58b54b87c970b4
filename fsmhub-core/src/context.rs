//! Name resolution for expressions.

use fsmhub_bus::Event;
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::OnceLock;

/// Resolves identifiers during evaluation.
pub trait Scope {
    /// Looks up a name. `None` means the name is unknown here.
    fn lookup(&self, name: &str) -> Option<Value>;

    /// Replaces `$name` references in a message with looked-up values.
    /// Unresolved references are left verbatim.
    fn interpolate(&self, msg: &str) -> String {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r"\$(\w+)").expect("valid interpolation pattern"));

        re.replace_all(msg, |caps: &Captures| match self.lookup(&caps[1]) {
            Some(value) => display_value(&value),
            None => caps[0].to_string(),
        })
        .into_owned()
    }
}

/// Renders a value the way it appears in messages: strings without quotes.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Read-only view over a bus event, used when evaluating guards.
///
/// Resolves `type` (entity prefix), `topic`, `timestamp`, `entity`
/// (also available as `device`), then any event field.
#[derive(Debug, Clone, Copy)]
pub struct EventContext<'a> {
    event: &'a Event,
}

impl<'a> EventContext<'a> {
    pub fn new(event: &'a Event) -> Self {
        Self { event }
    }

    pub fn event(&self) -> &'a Event {
        self.event
    }
}

impl Scope for EventContext<'_> {
    fn lookup(&self, name: &str) -> Option<Value> {
        match name {
            "type" => Some(Value::from(self.event.kind())),
            "topic" => Some(Value::from(self.event.topic.as_str())),
            "timestamp" => Some(Value::from(self.event.timestamp.to_rfc3339())),
            "entity" | "device" => Some(Value::from(self.event.entity.as_str())),
            _ => self.event.field(name).cloned(),
        }
    }
}

/// A scope that resolves nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyScope;

impl Scope for EmptyScope {
    fn lookup(&self, _name: &str) -> Option<Value> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsmhub_bus::Fields;

    fn door_event() -> Event {
        Event::new("door", "door.front", Fields::new())
            .with_field("command", "open")
            .with_field("battery", 87)
    }

    #[test]
    fn test_event_context_lookup() {
        let ev = door_event();
        let ctx = EventContext::new(&ev);

        assert_eq!(ctx.lookup("type"), Some(Value::from("door")));
        assert_eq!(ctx.lookup("topic"), Some(Value::from("door")));
        assert_eq!(ctx.lookup("device"), Some(Value::from("door.front")));
        assert_eq!(ctx.lookup("command"), Some(Value::from("open")));
        assert_eq!(ctx.lookup("battery"), Some(Value::from(87)));
        assert_eq!(ctx.lookup("missing"), None);
        assert!(ctx.lookup("timestamp").unwrap().is_string());
    }

    #[test]
    fn test_interpolate() {
        let ev = door_event();
        let ctx = EventContext::new(&ev);

        assert_eq!(
            ctx.interpolate("$device is $command (battery $battery%)"),
            "door.front is open (battery 87%)"
        );
        assert_eq!(ctx.interpolate("cost: $price"), "cost: $price");
        assert_eq!(ctx.interpolate("no refs"), "no refs");
    }

    #[test]
    fn test_empty_scope() {
        assert_eq!(EmptyScope.interpolate("$x"), "$x");
    }
}
