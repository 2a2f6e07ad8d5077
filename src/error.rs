use thiserror::Error;

use crate::types::SourceKind;

/// Location tracker error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackerError {
    #[error("Permission denied for {0} source")]
    PermissionDenied(SourceKind),

    #[error("Signal unavailable: {0}")]
    SignalUnavailable(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Sync failure: {0}")]
    SyncFailure(String),

    #[error("Reverse geocode failure: {0}")]
    GeocodeFailure(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Tracker already running")]
    AlreadyRunning,

    #[error("Tracker not running")]
    NotRunning,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for tracker operations
pub type TrackerResult<T> = Result<T, TrackerError>;

impl TrackerError {
    /// Transient failures are retried on the next cycle instead of surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TrackerError::SignalUnavailable(_)
                | TrackerError::SyncFailure(_)
                | TrackerError::GeocodeFailure(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            TrackerError::PermissionDenied(SourceKind::RadioWifi),
            TrackerError::SignalUnavailable("indoors".to_string()),
            TrackerError::PersistenceFailure("disk full".to_string()),
            TrackerError::SyncFailure("timeout".to_string()),
            TrackerError::GeocodeFailure("HTTP 503".to_string()),
            TrackerError::InvalidConfig("zero interval".to_string()),
            TrackerError::AlreadyRunning,
            TrackerError::NotRunning,
            TrackerError::Internal("lock".to_string()),
        ];

        for err in errors {
            assert!(!err.to_string().is_empty());
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(TrackerError::SyncFailure("x".into()).is_transient());
        assert!(!TrackerError::PersistenceFailure("x".into()).is_transient());
        assert!(!TrackerError::PermissionDenied(SourceKind::Satellite).is_transient());
    }
}
