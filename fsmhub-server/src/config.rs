//! Service configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via FSMHUB_CONFIG or --config)
//! 3. Environment variables

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Device inventory: entity id to device entry.
pub type Inventory = IndexMap<String, DeviceConf>;

/// Service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Rule document.
    pub rules: RulesConfig,
    /// Snapshot and audit log locations.
    pub storage: StorageConfig,
    /// Startup reconciliation.
    pub reconcile: ReconcileConfig,
    /// External scripts.
    pub scripts: ScriptsConfig,
    /// Bus queries issued by actions.
    pub query: QueryConfig,
    /// Periodic clock ticks.
    pub clock: ClockConfig,
    /// Location for sunrise and sunset events.
    pub earth: EarthConfig,
    /// Known devices, available to rule templates and action messages.
    pub devices: Inventory,
}

impl Config {
    /// Loads configuration from `path` (or `FSMHUB_CONFIG` when not given),
    /// then applies environment variable overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var("FSMHUB_CONFIG").ok().map(PathBuf::from);

        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.rules.apply_env_overrides();
        self.storage.apply_env_overrides();
        self.reconcile.apply_env_overrides();
        self.scripts.apply_env_overrides();
        self.query.apply_env_overrides();
        self.clock.apply_env_overrides();
        self.earth.apply_env_overrides();
    }

    /// Rejects settings the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rules.path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "rules.path must not be empty".to_string(),
            ));
        }
        if self.reconcile.window_secs == 0 {
            return Err(ConfigError::ValidationError(
                "reconcile.window_secs must be greater than zero".to_string(),
            ));
        }
        self.earth.validate()?;
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Rule document configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Path of the rule template.
    pub path: PathBuf,
    /// Quiet period collapsing repeated reload requests, in milliseconds.
    pub reload_debounce_ms: u64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("automata.yaml"),
            reload_debounce_ms: 500,
        }
    }
}

impl RulesConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("FSMHUB_RULES") {
            self.path = PathBuf::from(path);
        }
        if let Some(ms) = env_parse("FSMHUB_RELOAD_DEBOUNCE_MS") {
            self.reload_debounce_ms = ms;
        }
    }

    pub fn reload_debounce(&self) -> Duration {
        Duration::from_millis(self.reload_debounce_ms)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl StorageConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("FSMHUB_DATA") {
            self.data_dir = PathBuf::from(dir);
        }
    }

    /// Returns the snapshot file path.
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("automata.state")
    }

    /// Returns the audit log path.
    pub fn audit_log_path(&self) -> PathBuf {
        self.data_dir.join("events.log")
    }
}

/// Reconciliation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// How long retained state may still be replayed after startup, in seconds.
    pub window_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { window_secs: 5 }
    }
}

impl ReconcileConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(secs) = env_parse("FSMHUB_RECONCILE_SECS") {
            self.window_secs = secs;
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Script configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptsConfig {
    /// Directory scripts are resolved in.
    pub dir: PathBuf,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./scripts"),
        }
    }
}

impl ScriptsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("FSMHUB_SCRIPTS") {
            self.dir = PathBuf::from(dir);
        }
    }
}

/// Query configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// How long answers to a query are collected, in seconds.
    pub timeout_secs: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { timeout_secs: 5 }
    }
}

impl QueryConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(secs) = env_parse("FSMHUB_QUERY_TIMEOUT_SECS") {
            self.timeout_secs = secs;
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Clock tick configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Seconds between `clock` events (0 = disabled).
    pub interval_secs: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl ClockConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(secs) = env_parse("FSMHUB_CLOCK_INTERVAL_SECS") {
            self.interval_secs = secs;
        }
    }

    /// Returns the tick interval, or `None` when ticks are disabled.
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}

/// Location of the home. Sun events are only published when both
/// coordinates are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EarthConfig {
    /// Degrees north.
    pub latitude: Option<f64>,
    /// Degrees east.
    pub longitude: Option<f64>,
}

impl EarthConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(lat) = env_parse("FSMHUB_LATITUDE") {
            self.latitude = Some(lat);
        }
        if let Some(lon) = env_parse("FSMHUB_LONGITUDE") {
            self.longitude = Some(lon);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match (self.latitude, self.longitude) {
            (Some(lat), _) if !(-90.0..=90.0).contains(&lat) => Err(
                ConfigError::ValidationError("earth.latitude must be within -90..90".to_string()),
            ),
            (_, Some(lon)) if !(-180.0..=180.0).contains(&lon) => Err(
                ConfigError::ValidationError("earth.longitude must be within -180..180".to_string()),
            ),
            (Some(_), None) | (None, Some(_)) => Err(ConfigError::ValidationError(
                "earth.latitude and earth.longitude must be set together".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Returns `(latitude, longitude)` when a location is configured.
    pub fn location(&self) -> Option<(f64, f64)> {
        self.latitude.zip(self.longitude)
    }
}

/// One known device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConf {
    /// Display name.
    pub name: String,
    /// Capabilities, most significant first (`switch`, `light`, `door`, ...).
    pub caps: Vec<String>,
    /// Group, e.g. a room.
    pub group: String,
}

impl DeviceConf {
    pub fn has_cap(&self, cap: &str) -> bool {
        self.caps.iter().any(|c| c == cap)
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.rules.path, PathBuf::from("automata.yaml"));
        assert_eq!(config.rules.reload_debounce(), Duration::from_millis(500));
        assert_eq!(config.reconcile.window(), Duration::from_secs(5));
        assert_eq!(config.query.timeout(), Duration::from_secs(5));
        assert_eq!(config.clock.interval(), Some(Duration::from_secs(60)));
        assert!(config.devices.is_empty());
        assert_eq!(config.earth.location(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_storage_paths() {
        let config = StorageConfig::default();
        assert_eq!(config.snapshot_path(), PathBuf::from("./data/automata.state"));
        assert_eq!(config.audit_log_path(), PathBuf::from("./data/events.log"));
    }

    #[test]
    fn test_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fsmhub.yaml");
        std::fs::write(
            &path,
            r#"
rules:
  path: /etc/fsmhub/automata.yaml
reconcile:
  window_secs: 10
clock:
  interval_secs: 0
earth:
  latitude: 51.5
  longitude: -0.12
devices:
  light.porch:
    name: Porch light
    caps: [switch, light]
    group: outside
  door.front:
    name: Front door
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.rules.path, PathBuf::from("/etc/fsmhub/automata.yaml"));
        assert_eq!(config.rules.reload_debounce_ms, 500);
        assert_eq!(config.reconcile.window_secs, 10);
        assert_eq!(config.clock.interval(), None);
        assert_eq!(config.earth.location(), Some((51.5, -0.12)));

        let keys: Vec<_> = config.devices.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["light.porch", "door.front"]);
        assert!(config.devices["light.porch"].has_cap("switch"));
        assert!(config.devices["door.front"].caps.is_empty());
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/fsmhub.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(..)));
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        config.reconcile.window_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = Config::default();
        config.rules.path = PathBuf::new();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.earth.latitude = Some(51.5);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must be set together"));

        config.earth.longitude = Some(200.0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("earth.longitude"));

        config.earth.longitude = Some(-0.12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = Config::default();
        config.devices.insert(
            "switch.fan".to_string(),
            DeviceConf {
                name: "Fan".to_string(),
                caps: vec!["switch".to_string()],
                group: "office".to_string(),
            },
        );
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.devices, config.devices);
        assert_eq!(parsed.storage.data_dir, config.storage.data_dir);
    }
}
