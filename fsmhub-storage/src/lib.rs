//! # fsmhub-storage
//!
//! Storage layer for fsmhub.
//!
//! This crate provides:
//! - The durable automaton snapshot file
//! - The append-only audit log

pub mod audit;
pub mod error;
pub mod snapshot;

pub use audit::AuditLog;
pub use error::StorageError;
pub use snapshot::{SnapshotMeta, SnapshotStore};
