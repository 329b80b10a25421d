use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, TimeBankError};
use crate::ledger::store::LedgerStore;
use crate::ledger::types::{EntryMetadata, LedgerEntry, TransactionType};

/// One requested balance mutation
#[derive(Debug, Clone)]
pub struct BalanceUpdate {
    pub user_id: String,
    /// Signed change in seconds; must be non-zero
    pub seconds_delta: i64,
    /// Explicit classification; `None` classifies by the sign of the delta.
    /// An explicit `Adjustment` is the only type allowed to carry either sign.
    pub transaction_type: Option<TransactionType>,
    pub description: String,
    pub metadata: EntryMetadata,
    /// Who requested the mutation; recorded as the entry's `created_by`
    pub actor_id: String,
}

/// Result of a successful balance mutation
#[derive(Debug, Clone)]
pub struct BalanceUpdateOutcome {
    pub new_balance_seconds: i64,
    pub entry_id: String,
}

/// The sole entry point for changing a balance
///
/// Validates the request, enforces non-negativity, maintains the lifetime
/// counters, and appends the audit entry — all inside the store's per-user
/// critical section. A rejected request mutates nothing.
pub struct BalanceUpdateEngine {
    store: Arc<LedgerStore>,
}

impl BalanceUpdateEngine {
    pub fn new(store: Arc<LedgerStore>) -> Self {
        Self { store }
    }

    /// Apply a delta to a user's balance, appending one ledger entry
    pub async fn apply(&self, update: BalanceUpdate) -> Result<BalanceUpdateOutcome> {
        let description = update.description.trim();

        // Pure rejection path: nothing is locked or mutated until the
        // request is known to be well-formed.
        if update.seconds_delta == 0 {
            return Err(TimeBankError::InvalidArgument(
                "seconds delta cannot be zero".to_string(),
            ));
        }
        if description.is_empty() {
            return Err(TimeBankError::InvalidArgument(
                "description cannot be empty".to_string(),
            ));
        }

        let transaction_type = match update.transaction_type {
            Some(TransactionType::Earn) if update.seconds_delta < 0 => {
                return Err(TimeBankError::InvalidArgument(
                    "earn requires a positive seconds delta".to_string(),
                ));
            }
            Some(TransactionType::Spend) if update.seconds_delta > 0 => {
                return Err(TimeBankError::InvalidArgument(
                    "spend requires a negative seconds delta".to_string(),
                ));
            }
            Some(explicit) => explicit,
            None => {
                if update.seconds_delta > 0 {
                    TransactionType::Earn
                } else {
                    TransactionType::Spend
                }
            }
        };

        let lock = self.store.lock_for_update(&update.user_id).await?;
        let mut bank = lock.bank().clone();

        let new_balance = bank.current_balance_seconds + update.seconds_delta;
        if new_balance < 0 {
            debug!(
                "Rejected {}s debit for user '{}': balance {}s",
                update.seconds_delta.abs(),
                update.user_id,
                bank.current_balance_seconds
            );
            return Err(TimeBankError::InsufficientBalance {
                balance_seconds: bank.current_balance_seconds,
                required_seconds: update.seconds_delta.abs(),
            });
        }

        // Adjustments feed the lifetime counters by sign as well, keeping
        // current == earned - spent true for every reachable state.
        if update.seconds_delta > 0 {
            bank.lifetime_earned_seconds += update.seconds_delta;
        } else {
            bank.lifetime_spent_seconds += -update.seconds_delta;
        }
        bank.current_balance_seconds = new_balance;

        let now = Utc::now();
        bank.updated_at = now;

        let entry = LedgerEntry {
            id: Uuid::new_v4().to_string(),
            user_id: update.user_id.clone(),
            transaction_type,
            seconds_delta: update.seconds_delta,
            balance_after_seconds: new_balance,
            description: description.to_string(),
            metadata: update.metadata,
            created_at: now,
            created_by: update.actor_id,
        };
        let entry_id = entry.id.clone();
        let source = entry.source();

        self.store.commit(lock, bank, entry).await?;

        info!(
            "Applied {:+}s to user '{}' ({}, balance now {}s)",
            update.seconds_delta, update.user_id, source, new_balance
        );

        Ok(BalanceUpdateOutcome {
            new_balance_seconds: new_balance,
            entry_id,
        })
    }
}
