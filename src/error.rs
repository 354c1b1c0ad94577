//! Error taxonomy shared by every engine component

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Typed failures surfaced by the orchestration engine.
///
/// Lower-level components only report these upward; compensating actions
/// (port release, record rollback, container cleanup) happen exclusively
/// in the lifecycle engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad caller input; never retried
    #[error("{0}")]
    Validation(String),

    /// An instance with the requested name already exists
    #[error("instance name '{0}' is already in use")]
    DuplicateName(String),

    /// The container daemon is unreachable after connection retries
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// A referenced instance, container, or volume does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation conflicts with current state (name taken at the
    /// runtime level, instance mid-transition, missing container handle)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Every port in the configured range is reserved or bound
    #[error("no available port in range {start}-{end}")]
    NoAvailablePort { start: u16, end: u16 },

    /// The persistence store failed; transient cases are retried a bounded
    /// number of times before this propagates
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A runtime call exceeded its deadline
    #[error("operation timed out after {0:?}")]
    OperationTimeout(Duration),

    /// Anything unanticipated, preserved with context
    #[error("unexpected error: {0}")]
    Unknown(String),
}

impl Error {
    /// Stable machine-readable kind, suitable for audit events and
    /// user-facing error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::DuplicateName(_) => "duplicate_name",
            Self::RuntimeUnavailable(_) => "runtime_unavailable",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::NoAvailablePort { .. } => "no_available_port",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::OperationTimeout(_) => "operation_timeout",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Whether the failure is transient enough that a caller may retry the
    /// whole operation later. Validation, conflicts, and capacity
    /// exhaustion are permanent until the user changes something.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RuntimeUnavailable(_) | Self::StoreUnavailable(_) | Self::OperationTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(Error::Validation("x".into()).kind(), "validation");
        assert_eq!(
            Error::NoAvailablePort { start: 1, end: 2 }.kind(),
            "no_available_port"
        );
        assert_eq!(Error::DuplicateName("a".into()).kind(), "duplicate_name");
    }

    #[test]
    fn transience_split() {
        assert!(Error::StoreUnavailable("busy".into()).is_transient());
        assert!(Error::RuntimeUnavailable("down".into()).is_transient());
        assert!(!Error::Validation("bad".into()).is_transient());
        assert!(!Error::NoAvailablePort { start: 1, end: 1 }.is_transient());
    }
}
