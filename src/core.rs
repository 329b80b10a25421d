use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::config::{self, TimeBankConfig};
use crate::error::{Result, TimeBankError};
use crate::ledger::{
    BalanceUpdate, BalanceUpdateEngine, BalanceUpdateOutcome, LedgerEntry, LedgerStore, TimeBank,
};
use crate::offline::{NewOfflineEntry, OfflineQueueEntry, OfflineReplayQueue, ProcessingSummary};
use crate::session::{SessionManager, SessionReceipt, UnlockedSession};

/// The assembled time bank core
///
/// Wires the ledger store, balance update engine, session manager, and
/// offline replay queue together and exposes the operation surface the
/// UI/API layer consumes. All balance mutation funnels through the engine.
pub struct TimeBankCore {
    store: Arc<LedgerStore>,
    sessions: SessionManager,
    queue: OfflineReplayQueue,
    engine: Arc<BalanceUpdateEngine>,
}

impl std::fmt::Debug for TimeBankCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeBankCore").finish_non_exhaustive()
    }
}

impl TimeBankCore {
    /// Open the core against a configuration
    pub fn open(config: TimeBankConfig) -> Result<Self> {
        config::validate_config(&config)
            .map_err(|e| TimeBankError::InvalidArgument(format!("{e:#}")))?;

        let store = Arc::new(LedgerStore::open(
            &config.data_dir,
            std::time::Duration::from_secs(config.lock_wait_secs),
        )?);
        let engine = Arc::new(BalanceUpdateEngine::new(store.clone()));
        let sessions = SessionManager::open(
            &config.data_dir,
            engine.clone(),
            config.min_session_minutes,
            config.max_session_minutes,
        )?;
        let queue =
            OfflineReplayQueue::open(&config.data_dir, engine.clone(), config.max_replay_retries)?;

        info!("Opened time bank core at {}", config.data_dir.display());

        Ok(Self {
            store,
            sessions,
            queue,
            engine,
        })
    }

    /// Create a bank for a newly enrolled user
    pub async fn enroll(&self, user_id: &str) -> Result<TimeBank> {
        self.store.create_bank(user_id).await
    }

    /// Apply a delta to a user's balance (earn, spend, or adjustment)
    pub async fn apply_delta(&self, update: BalanceUpdate) -> Result<BalanceUpdateOutcome> {
        self.engine.apply(update).await
    }

    /// Start a time-boxed unlocked session funded by the user's balance
    pub async fn start_session(
        &self,
        user_id: &str,
        duration_minutes: u32,
        device_identifier: Option<String>,
    ) -> Result<SessionReceipt> {
        self.sessions
            .start_session(user_id, duration_minutes, device_identifier)
            .await
    }

    /// Expire every active session past its end time
    pub async fn expire_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        self.sessions.expire_sessions(now).await
    }

    /// Cancel an active session without refunding the debit
    pub async fn cancel_session(&self, session_id: &str) -> Result<()> {
        self.sessions.cancel_session(session_id).await
    }

    /// Record a transaction captured while the client was offline
    pub async fn enqueue_offline(&self, entry: NewOfflineEntry) -> Result<String> {
        self.queue.enqueue(entry).await
    }

    /// Replay a user's pending offline transactions
    pub async fn process_pending(&self, user_id: &str) -> Result<ProcessingSummary> {
        self.queue.process_pending(user_id).await
    }

    /// Re-open failed offline entries for another replay pass
    pub async fn retry_failed(&self, user_id: &str) -> Result<usize> {
        self.queue.retry_failed(user_id).await
    }

    /// Current bank for a user
    pub async fn balance(&self, user_id: &str) -> Result<TimeBank> {
        self.store.get_bank(user_id).await
    }

    /// Audit trail for a user, oldest first
    pub async fn history(&self, user_id: &str) -> Result<Vec<LedgerEntry>> {
        self.store.entries_for_user(user_id).await
    }

    /// Sessions for a user, most recent first
    pub async fn sessions_for_user(&self, user_id: &str) -> Result<Vec<UnlockedSession>> {
        self.sessions.sessions_for_user(user_id).await
    }

    /// Session lookup by id
    pub async fn get_session(&self, session_id: &str) -> Result<UnlockedSession> {
        self.sessions.get_session(session_id).await
    }

    /// Offline queue entries for a user, in replay order
    pub async fn offline_entries(&self, user_id: &str) -> Result<Vec<OfflineQueueEntry>> {
        self.queue.entries_for_user(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TimeBankError;
    use crate::ledger::{EntryMetadata, TransactionType};
    use tempfile::tempdir;

    fn make_core(temp_dir: &tempfile::TempDir) -> TimeBankCore {
        let config = TimeBankConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        TimeBankCore::open(config).unwrap()
    }

    fn earn(user_id: &str, seconds: i64, description: &str) -> BalanceUpdate {
        BalanceUpdate {
            user_id: user_id.to_string(),
            seconds_delta: seconds,
            transaction_type: Some(TransactionType::Earn),
            description: description.to_string(),
            metadata: EntryMetadata::TaskCompletion {
                task_id: "chores-1".to_string(),
                task_title: Some("Dishes".to_string()),
            },
            actor_id: "parent1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let temp_dir = tempdir().unwrap();
        let config = TimeBankConfig {
            data_dir: temp_dir.path().to_path_buf(),
            lock_wait_secs: 0,
            ..Default::default()
        };
        assert!(matches!(
            TimeBankCore::open(config).unwrap_err(),
            TimeBankError::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn test_earn_unlock_insufficient_scenario() {
        let temp_dir = tempdir().unwrap();
        let core = make_core(&temp_dir);

        core.enroll("kid1").await.unwrap();

        let outcome = core
            .apply_delta(earn("kid1", 1800, "task reward"))
            .await
            .unwrap();
        assert_eq!(outcome.new_balance_seconds, 1800);

        let receipt = core.start_session("kid1", 20, None).await.unwrap();
        assert_eq!(receipt.new_balance_seconds, 600);

        let session = core.get_session(&receipt.session_id).await.unwrap();
        assert_eq!(session.ends_at, session.started_at + chrono::Duration::minutes(20));

        // 600 < 1200: the second unlock is rejected and changes nothing
        let err = core.start_session("kid1", 20, None).await.unwrap_err();
        match err {
            TimeBankError::InsufficientBalance {
                balance_seconds,
                required_seconds,
            } => {
                assert_eq!(balance_seconds, 600);
                assert_eq!(required_seconds, 1200);
            }
            other => panic!("expected InsufficientBalance, got {other:?}"),
        }

        let bank = core.balance("kid1").await.unwrap();
        assert_eq!(bank.current_balance_seconds, 600);
    }

    #[tokio::test]
    async fn test_ledger_sum_matches_balance() {
        let temp_dir = tempdir().unwrap();
        let core = make_core(&temp_dir);

        core.enroll("kid1").await.unwrap();
        core.apply_delta(earn("kid1", 2400, "task 1")).await.unwrap();
        core.apply_delta(earn("kid1", 600, "task 2")).await.unwrap();
        core.start_session("kid1", 10, None).await.unwrap();
        core.apply_delta(BalanceUpdate {
            user_id: "kid1".to_string(),
            seconds_delta: -300,
            transaction_type: Some(TransactionType::Adjustment),
            description: "manual correction".to_string(),
            metadata: EntryMetadata::AdminAdjustment {
                reason: "miscounted task".to_string(),
            },
            actor_id: "admin".to_string(),
        })
        .await
        .unwrap();

        let bank = core.balance("kid1").await.unwrap();
        assert!(bank.is_consistent());

        let entries = core.history("kid1").await.unwrap();
        let sum: i64 = entries.iter().map(|e| e.seconds_delta).sum();
        assert_eq!(sum, bank.current_balance_seconds);
        assert_eq!(bank.lifetime_earned_seconds, 3000);
        assert_eq!(bank.lifetime_spent_seconds, 900);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let temp_dir = tempdir().unwrap();
        {
            let core = make_core(&temp_dir);
            core.enroll("kid1").await.unwrap();
            core.apply_delta(earn("kid1", 1200, "task reward")).await.unwrap();
            core.start_session("kid1", 10, None).await.unwrap();
        }

        let core = make_core(&temp_dir);
        let bank = core.balance("kid1").await.unwrap();
        assert_eq!(bank.current_balance_seconds, 600);
        assert_eq!(core.history("kid1").await.unwrap().len(), 2);
        assert_eq!(core.sessions_for_user("kid1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_replay_through_facade() {
        let temp_dir = tempdir().unwrap();
        let core = make_core(&temp_dir);
        core.enroll("kid1").await.unwrap();

        let base = Utc::now();
        core.enqueue_offline(NewOfflineEntry {
            user_id: "kid1".to_string(),
            transaction_type: None,
            seconds_delta: 900,
            description: "offline task".to_string(),
            metadata: EntryMetadata::TaskCompletion {
                task_id: "offline-1".to_string(),
                task_title: None,
            },
            client_timestamp: base,
            device_identifier: Some("phone".to_string()),
        })
        .await
        .unwrap();

        let summary = core.process_pending("kid1").await.unwrap();
        assert_eq!(summary.processed_count, 1);
        assert_eq!(summary.failed_count, 0);

        let bank = core.balance("kid1").await.unwrap();
        assert_eq!(bank.current_balance_seconds, 900);
    }
}
