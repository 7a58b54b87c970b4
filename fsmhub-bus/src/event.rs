//! Canonical bus events.
//!
//! Adapters translate vendor payloads into [`Event`]s. An event names the
//! entity it concerns (`door.front`, `timer.kettle_on`) and carries a flat
//! map of string, number or boolean fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Well-known topic names.
pub mod topics {
    pub const ACK: &str = "ack";
    pub const ALERT: &str = "alert";
    pub const ANSWER: &str = "answer";
    pub const CLOCK: &str = "clock";
    pub const COMMAND: &str = "command";
    pub const CONFIG: &str = "config";
    pub const EARTH: &str = "earth";
    pub const LOG: &str = "log";
    pub const QUERY: &str = "query";
    pub const STATE: &str = "state";
    pub const TIMER: &str = "timer";
}

/// Named field values of an event.
pub type Fields = BTreeMap<String, Value>;

/// An immutable bus event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Topic the event was published on.
    pub topic: String,

    /// Entity identifier, e.g. `door.front`.
    pub entity: String,

    /// Named field values.
    #[serde(default)]
    pub fields: Fields,

    /// When the event was produced.
    pub timestamp: DateTime<Utc>,

    /// Set on delivery when the event is a replayed last-known value.
    #[serde(default)]
    pub retained: bool,
}

impl Event {
    /// Creates an event stamped with the current time.
    pub fn new(topic: impl Into<String>, entity: impl Into<String>, fields: Fields) -> Self {
        Self {
            topic: topic.into(),
            entity: entity.into(),
            fields,
            timestamp: Utc::now(),
            retained: false,
        }
    }

    /// Creates a `command` event addressed to an entity.
    pub fn command(entity: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(topics::COMMAND, entity, Fields::new()).with_field("command", command.into())
    }

    /// Adds a field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Marks the event to be retained by the bus as the last-known value.
    pub fn with_retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }

    /// Overrides the timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Returns a field value.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns a field value if it is a string.
    pub fn string_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Returns the `command` field.
    pub fn command_name(&self) -> Option<&str> {
        self.string_field("command")
    }

    /// Returns the entity type: the entity prefix before the first `.`.
    pub fn kind(&self) -> &str {
        self.entity.split('.').next().unwrap_or_default()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.entity)?;
        for (name, value) in &self.fields {
            write!(f, " {}=", name)?;
            match value {
                Value::String(s) => f.write_str(s)?,
                other => write!(f, "{}", other)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_event() {
        let ev = Event::command("light.porch", "off").with_field("level", 40);
        assert_eq!(ev.topic, topics::COMMAND);
        assert_eq!(ev.entity, "light.porch");
        assert_eq!(ev.command_name(), Some("off"));
        assert_eq!(ev.field("level"), Some(&Value::from(40)));
        assert!(!ev.retained);
    }

    #[test]
    fn test_kind() {
        let ev = Event::new("door", "door.front", Fields::new());
        assert_eq!(ev.kind(), "door");

        let ev = Event::new("clock", "clock", Fields::new());
        assert_eq!(ev.kind(), "clock");
    }

    #[test]
    fn test_display() {
        let ev = Event::new("door", "door.front", Fields::new())
            .with_field("command", "open")
            .with_field("battery", 87);
        assert_eq!(ev.to_string(), "door.front battery=87 command=open");
    }

    #[test]
    fn test_json_shape() {
        let ev = Event::new("temp", "sensor.hall", Fields::new()).with_field("temp", 21.5);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["entity"], "sensor.hall");
        assert_eq!(json["fields"]["temp"], 21.5);

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }
}
