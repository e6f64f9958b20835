//! Fehlerklassifikation
//!
//! Entscheidet anhand der getaggten Fehlerart, ob ein Fehler erneut versucht,
//! per Replace umgangen oder sofort nach oben gereicht wird.

use crate::{ApiError, RolloutError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transiente Fehler, der Rollback-Loop versucht es erneut
    Retryable,
    /// Host hat keine Kapazität, Update wird zum Replace
    CapacityFallback,
    /// Beendet alle Retry- und Rollback-Loops sofort
    Unrecoverable,
    /// Abbruch oder Deadline, nie erneut versuchen
    Cancelled,
}

impl ErrorClass {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Unrecoverable | Self::Cancelled)
    }
}

impl ApiError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::CapacityExhausted(_) => ErrorClass::CapacityFallback,
            Self::LeaseDenied(_) => ErrorClass::Unrecoverable,
            Self::Cancelled => ErrorClass::Cancelled,
            Self::NotFound(_)
            | Self::Timeout(..)
            | Self::Remote(_)
            | Self::Http(_)
            | Self::Decode(_) => ErrorClass::Retryable,
        }
    }
}

impl RolloutError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Api(err) => err.class(),
            Self::Unrecoverable { .. } => ErrorClass::Unrecoverable,
            Self::Cancelled | Self::DeadlineExceeded(_) => ErrorClass::Cancelled,
            Self::Machine { source, .. } => source.class(),
            Self::LeaseReleaseExhausted { .. } => ErrorClass::Retryable,
            Self::RollbackExhausted { .. }
            | Self::Worker(_)
            | Self::Io(_)
            | Self::Parse(_)
            | Self::Terminal(_)
            | Self::Config(_) => ErrorClass::Unrecoverable,
        }
    }

    /// Abbruch oder nicht behebbarer Fehler: kein Retry, kein Rollback.
    pub fn is_terminal(&self) -> bool {
        self.class().is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UnrecoverableCause;
    use std::time::Duration;

    #[test]
    fn test_generic_remote_failure_is_retryable() {
        let err = ApiError::Remote("502 bad gateway".to_string());
        assert_eq!(err.class(), ErrorClass::Retryable);
        assert!(!RolloutError::from(err).is_terminal());
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = ApiError::Timeout(Duration::from_secs(300), "started".to_string());
        assert_eq!(err.class(), ErrorClass::Retryable);
    }

    #[test]
    fn test_capacity_triggers_fallback() {
        let err = ApiError::CapacityExhausted("host full".to_string());
        assert_eq!(err.class(), ErrorClass::CapacityFallback);
        assert!(!err.class().is_terminal());
    }

    #[test]
    fn test_lease_denied_is_unrecoverable() {
        let err = ApiError::LeaseDenied("held by other".to_string());
        assert_eq!(err.class(), ErrorClass::Unrecoverable);
    }

    #[test]
    fn test_cancellation_is_terminal() {
        assert!(RolloutError::Cancelled.is_terminal());
        assert!(RolloutError::DeadlineExceeded(Duration::from_secs(1)).is_terminal());
        assert!(RolloutError::from(ApiError::Cancelled).is_terminal());
        assert_eq!(RolloutError::Cancelled.class(), ErrorClass::Cancelled);
    }

    #[test]
    fn test_unrecoverable_marker_survives_machine_wrapping() {
        let inner = RolloutError::Unrecoverable {
            cause: UnrecoverableCause::HealthChecks,
            source: ApiError::Remote("critical".to_string()),
        };
        let wrapped = RolloutError::Machine {
            machine_id: "m1".to_string(),
            source: Box::new(inner),
        };

        assert_eq!(wrapped.class(), ErrorClass::Unrecoverable);
        assert!(wrapped.is_terminal());
    }

    #[test]
    fn test_wrapped_transient_error_stays_retryable() {
        let wrapped = RolloutError::Machine {
            machine_id: "m2".to_string(),
            source: Box::new(ApiError::Remote("reset".to_string()).into()),
        };
        assert_eq!(wrapped.class(), ErrorClass::Retryable);
    }
}
