//! # fsmhub-server
//!
//! The fsmhub service.
//!
//! This crate provides:
//! - Configuration and the device inventory
//! - Rule template rendering and validated reloads
//! - Named countdown timers
//! - Sunrise and sunset events
//! - The side-effecting function library used by actions
//! - Startup reconciliation of automaton state
//! - Administrative commands
//! - The single-threaded service event loop

pub mod admin;
pub mod config;
pub mod context;
pub mod earth;
pub mod error;
pub mod functions;
pub mod loader;
pub mod reconcile;
pub mod script;
pub mod service;
pub mod timer;

pub use admin::AdminCommand;
pub use config::{Config, ConfigError, DeviceConf, EarthConfig, Inventory};
pub use context::ChangeContext;
pub use earth::SunEvent;
pub use error::ServerError;
pub use functions::{ActionHost, Effects};
pub use loader::RuleLoader;
pub use reconcile::Reconciler;
pub use script::ScriptRunner;
pub use service::{AdminReply, Service, ServiceHandle};
pub use timer::TimerManager;
