//! Error types for the time bank core.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, TimeBankError>;

/// Errors surfaced by the time bank components
#[derive(Error, Debug)]
pub enum TimeBankError {
    /// Referenced bank, session, or queue entry does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller supplied an invalid input (empty description, zero delta, out-of-range duration)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Debit would drive the balance negative
    #[error("insufficient balance: have {balance_seconds}s, need {required_seconds}s")]
    InsufficientBalance {
        /// Balance at the time of the rejected mutation
        balance_seconds: i64,
        /// Magnitude the operation required
        required_seconds: i64,
    },

    /// Operation attempted on a record already in a terminal state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Another mutation for the same user held the lock past the bounded wait
    #[error("balance update already in flight for user '{user_id}'")]
    Busy { user_id: String },

    /// Underlying persistence failed independent of business rules
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl TimeBankError {
    /// Whether this error is an infrastructure fault rather than a business
    /// rejection. Infrastructure faults are safe to retry with backoff and
    /// abort an offline replay batch instead of being recorded on the entry.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            TimeBankError::Busy { .. } | TimeBankError::StoreUnavailable(_)
        )
    }

    /// Shorthand for a `StoreUnavailable` wrapping a lower-level failure
    pub fn store(err: impl std::fmt::Display) -> Self {
        TimeBankError::StoreUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infrastructure_classification() {
        assert!(TimeBankError::Busy {
            user_id: "kid1".to_string()
        }
        .is_infrastructure());
        assert!(TimeBankError::StoreUnavailable("disk full".to_string()).is_infrastructure());

        assert!(!TimeBankError::NotFound("bank".to_string()).is_infrastructure());
        assert!(!TimeBankError::InsufficientBalance {
            balance_seconds: 600,
            required_seconds: 1200,
        }
        .is_infrastructure());
        assert!(!TimeBankError::InvalidArgument("zero delta".to_string()).is_infrastructure());
        assert!(!TimeBankError::InvalidState("cancelled".to_string()).is_infrastructure());
    }

    #[test]
    fn test_insufficient_balance_message_carries_amounts() {
        let err = TimeBankError::InsufficientBalance {
            balance_seconds: 600,
            required_seconds: 1200,
        };
        let msg = err.to_string();
        assert!(msg.contains("600"));
        assert!(msg.contains("1200"));
    }
}
