//! Event system: fan-out of deployment transitions to external subscribers.

pub mod publisher;

pub use publisher::StatusPublisher;
