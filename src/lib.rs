//! Flotilla - Run and supervise fleets of isolated service containers on a
//! single host.
//!
//! The crate coordinates a container runtime, a local SQLite store, an
//! atomic port allocator, and a concurrent health monitor to keep instance
//! state consistent under concurrent operations and partial failures. The
//! lifecycle [`Engine`](crate::core::Engine) is the entry point for all
//! state-changing operations; the
//! [`HealthMonitor`](crate::core::HealthMonitor) runs independently and
//! publishes observations through a single bounded channel.

pub mod core;
pub mod error;
pub mod persistence;

pub use error::{Error, Result};
