//! Persistence module - Durable instance records and the audit trail

mod database;

pub use database::{Database, LifecycleEvent};
