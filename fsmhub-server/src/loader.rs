//! Rule document loading.
//!
//! The rule file is a template rendered against the device inventory
//! before it is parsed, so one rule can be stamped out per device:
//!
//! ```yaml
//! automata:
//! {% for id, device in devices|items if "door" in device.caps %}
//!   {{ id | replace(".", "_") }}:
//!     initial: closed
//!     ...
//! {% endfor %}
//! ```

use crate::config::Inventory;
use crate::error::ServerError;
use fsmhub_core::RuleSet;
use minijinja::{context, Environment};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Renders and compiles the rule document.
pub struct RuleLoader {
    path: PathBuf,
    devices: Arc<Inventory>,
}

impl RuleLoader {
    pub fn new(path: impl Into<PathBuf>, devices: Arc<Inventory>) -> Self {
        Self {
            path: path.into(),
            devices,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and renders the rule template.
    pub fn render(&self) -> Result<String, ServerError> {
        let source = std::fs::read_to_string(&self.path)?;
        self.render_str(&source)
    }

    /// Renders template text against the inventory.
    pub fn render_str(&self, source: &str) -> Result<String, ServerError> {
        let env = Environment::new();
        let rendered = env.render_str(source, context! { devices => self.devices.as_ref() })?;
        Ok(rendered)
    }

    /// Renders, parses and validates the rule document. Nothing is
    /// activated; the caller decides whether to swap the result in.
    pub fn load(&self) -> Result<RuleSet, ServerError> {
        let rendered = self.render()?;
        let rules = RuleSet::from_yaml(&rendered)?;
        tracing::debug!(
            "Loaded {} automata ({} expressions) from {}",
            rules.len(),
            rules.expression_count(),
            self.path.display()
        );
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConf;
    use tempfile::TempDir;

    const TEMPLATE: &str = r#"
automata:
{% for id, device in devices|items if "door" in device.caps %}
  {{ id | replace(".", "_") }}:
    initial: closed
    states:
      closed: {}
      open:
        entering: ['Log("{{ device.name }} opened")']
    transitions:
      - from: closed
        to: open
        when: 'device == "{{ id }}" && command == "open"'
{% endfor %}
"#;

    fn inventory() -> Arc<Inventory> {
        let mut devices = Inventory::new();
        devices.insert(
            "door.front".to_string(),
            DeviceConf {
                name: "Front door".to_string(),
                caps: vec!["door".to_string()],
                group: "hall".to_string(),
            },
        );
        devices.insert(
            "light.porch".to_string(),
            DeviceConf {
                name: "Porch light".to_string(),
                caps: vec!["switch".to_string()],
                group: "outside".to_string(),
            },
        );
        devices.insert(
            "door.back".to_string(),
            DeviceConf {
                name: "Back door".to_string(),
                caps: vec!["door".to_string()],
                group: "kitchen".to_string(),
            },
        );
        Arc::new(devices)
    }

    #[test]
    fn test_template_expands_per_device() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("automata.yaml");
        std::fs::write(&path, TEMPLATE).unwrap();

        let loader = RuleLoader::new(&path, inventory());
        let rules = loader.load().unwrap();

        let mut ids: Vec<_> = rules.automata().map(|a| a.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["door_back", "door_front"]);

        let rendered = loader.render().unwrap();
        assert!(rendered.contains(r#"Log("Front door opened")"#));
    }

    #[test]
    fn test_invalid_rules_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("automata.yaml");
        std::fs::write(
            &path,
            "automata:\n  a:\n    initial: nope\n    states: {x: {}}\n",
        )
        .unwrap();

        let err = RuleLoader::new(&path, inventory()).load().unwrap_err();
        assert!(err.is_rules_error());
        assert_eq!(err.error_code(), "INVALID_RULES");
    }

    #[test]
    fn test_template_syntax_error() {
        let loader = RuleLoader::new("unused.yaml", inventory());
        let err = loader.render_str("{% for x in %}").unwrap_err();
        assert!(matches!(err, ServerError::Template(_)));
    }

    #[test]
    fn test_missing_file() {
        let loader = RuleLoader::new("/nonexistent/automata.yaml", inventory());
        assert!(matches!(loader.load(), Err(ServerError::Io(_))));
    }
}
