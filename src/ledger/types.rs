use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user's running balance of accumulated seconds
///
/// Mutated exclusively by the balance update engine; the lifetime counters
/// decompose the balance so it can be cross-checked at any time:
/// `current_balance_seconds == lifetime_earned_seconds - lifetime_spent_seconds`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeBank {
    pub user_id: String,
    pub current_balance_seconds: i64,
    pub lifetime_earned_seconds: i64,
    pub lifetime_spent_seconds: i64,
    pub updated_at: DateTime<Utc>,
}

impl TimeBank {
    /// Create an empty bank at enrollment
    pub fn new(user_id: String) -> Self {
        Self {
            user_id,
            current_balance_seconds: 0,
            lifetime_earned_seconds: 0,
            lifetime_spent_seconds: 0,
            updated_at: Utc::now(),
        }
    }

    /// Check the balance decomposition invariant
    pub fn is_consistent(&self) -> bool {
        self.current_balance_seconds >= 0
            && self.lifetime_earned_seconds >= 0
            && self.lifetime_spent_seconds >= 0
            && self.current_balance_seconds
                == self.lifetime_earned_seconds - self.lifetime_spent_seconds
    }
}

/// Classification of a balance-changing event
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    /// Positive delta: time added to the bank
    Earn,
    /// Negative delta: time spent from the bank
    Spend,
    /// Administrative correction, either sign
    Adjustment,
}

/// Where a balance-changing event originated
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionSource {
    TaskCompletion,
    UnlockedSession,
    ParentGrant,
    AdminAdjustment,
}

impl std::fmt::Display for TransactionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionSource::TaskCompletion => "task_completion",
            TransactionSource::UnlockedSession => "unlocked_session",
            TransactionSource::ParentGrant => "parent_grant",
            TransactionSource::AdminAdjustment => "admin_adjustment",
        };
        f.write_str(name)
    }
}

/// Typed payload attached to a ledger entry, one variant per source
///
/// The source discriminant is carried by the variant itself, so an entry
/// can never pair a source with the wrong payload shape.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum EntryMetadata {
    TaskCompletion {
        task_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_title: Option<String>,
    },
    UnlockedSession {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_identifier: Option<String>,
    },
    ParentGrant {
        granted_by: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    AdminAdjustment {
        reason: String,
    },
}

impl EntryMetadata {
    /// The source this payload belongs to
    pub fn source(&self) -> TransactionSource {
        match self {
            EntryMetadata::TaskCompletion { .. } => TransactionSource::TaskCompletion,
            EntryMetadata::UnlockedSession { .. } => TransactionSource::UnlockedSession,
            EntryMetadata::ParentGrant { .. } => TransactionSource::ParentGrant,
            EntryMetadata::AdminAdjustment { .. } => TransactionSource::AdminAdjustment,
        }
    }
}

/// An immutable audit record of one balance-changing event
///
/// Created exactly once per successful mutation, never updated or deleted.
/// Entries for a user ordered by `created_at` replay to the bank's current
/// lifetime earned/spent decomposition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LedgerEntry {
    pub id: String,
    pub user_id: String,
    pub transaction_type: TransactionType,
    pub seconds_delta: i64,
    /// Snapshot of the balance after this entry was applied
    pub balance_after_seconds: i64,
    pub description: String,
    pub metadata: EntryMetadata,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

impl LedgerEntry {
    /// The source of this entry, derived from its metadata payload
    pub fn source(&self) -> TransactionSource {
        self.metadata.source()
    }
}
