//! # fsmhub-bus
//!
//! Event bus plumbing for fsmhub.
//!
//! This crate provides:
//! - The canonical [`Event`] every adapter publishes
//! - [`Publisher`] and [`Subscriber`] capabilities the rules engine is written against
//! - [`LocalBus`], an in-process bus with retained last-value delivery

pub mod bus;
pub mod event;

pub use bus::{EventStream, LocalBus, Publisher, Subscriber};
pub use event::{topics, Event, Fields};
