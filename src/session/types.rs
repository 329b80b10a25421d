use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of an unlocked session
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Running; the device is unlocked until `ends_at`
    Active,
    /// The clock passed `ends_at`
    Expired,
    /// Explicitly ended early; remaining time is forfeited
    Cancelled,
}

impl SessionStatus {
    /// Expired and cancelled sessions never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Expired | SessionStatus::Cancelled)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStatus::Active => "active",
            SessionStatus::Expired => "expired",
            SessionStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A time-boxed access grant funded by debiting the time bank
///
/// Exactly one funding ledger entry exists per session, committed before
/// the session row is written.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UnlockedSession {
    pub id: String,
    pub user_id: String,
    pub duration_seconds: i64,
    /// What the session cost the bank; equals `duration_seconds`
    pub cost_seconds: i64,
    pub started_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_identifier: Option<String>,
}

/// What a caller gets back from starting a session
#[derive(Debug, Clone)]
pub struct SessionReceipt {
    pub session_id: String,
    pub ends_at: DateTime<Utc>,
    pub new_balance_seconds: i64,
}
