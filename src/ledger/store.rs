use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{Result, TimeBankError};
use crate::ledger::types::{LedgerEntry, TimeBank};
use crate::storage;

/// Current ledger state file version
const LEDGER_STATE_VERSION: &str = "1.0";

/// Name of the ledger state file inside the data directory
const LEDGER_FILE: &str = "ledger.json";

/// On-disk layout: banks and entries live in one file so a balance update
/// and its audit entry are committed by a single atomic rename. A partial
/// write of one without the other is not observable.
#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct LedgerState {
    version: String,
    banks: HashMap<String, TimeBank>,
    entries: Vec<LedgerEntry>,
}

impl LedgerState {
    fn new() -> Self {
        Self {
            version: LEDGER_STATE_VERSION.to_string(),
            banks: HashMap::new(),
            entries: Vec::new(),
        }
    }
}

/// Exclusive hold on one user's balance
///
/// Returned by [`LedgerStore::lock_for_update`]; carries a snapshot of the
/// bank taken under the lock. The per-user critical section is held until
/// the lock is committed or dropped.
#[derive(Debug)]
pub struct BankLock {
    user_id: String,
    bank: TimeBank,
    _guard: OwnedMutexGuard<()>,
}

impl BankLock {
    /// The bank as read at lock acquisition
    pub fn bank(&self) -> &TimeBank {
        &self.bank
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

/// Durable storage for time banks and the append-only ledger
///
/// The store serializes all mutation per user: `lock_for_update` admits at
/// most one in-flight mutation for a given user at a time, while mutations
/// for distinct users proceed in parallel.
#[derive(Debug)]
pub struct LedgerStore {
    path: PathBuf,
    state: Mutex<LedgerState>,
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    lock_wait: Duration,
}

impl LedgerStore {
    /// Open the store, loading existing state from the data directory
    pub fn open(data_dir: &Path, lock_wait: Duration) -> Result<Self> {
        storage::ensure_directory_exists(data_dir)
            .map_err(|e| TimeBankError::store(format!("{e:#}")))?;

        let path = data_dir.join(LEDGER_FILE);
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| {
                TimeBankError::store(format!("failed to read {}: {e}", path.display()))
            })?;
            let state: LedgerState = serde_json::from_str(&content).map_err(|e| {
                TimeBankError::store(format!("failed to parse {}: {e}", path.display()))
            })?;

            if state.version != LEDGER_STATE_VERSION {
                return Err(TimeBankError::store(format!(
                    "unsupported ledger state version '{}' in {} (expected '{}')",
                    state.version,
                    path.display(),
                    LEDGER_STATE_VERSION
                )));
            }

            debug!(
                "Loaded ledger state: {} banks, {} entries",
                state.banks.len(),
                state.entries.len()
            );
            state
        } else {
            LedgerState::new()
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
            user_locks: Mutex::new(HashMap::new()),
            lock_wait,
        })
    }

    /// Create a bank for a newly enrolled user, starting at zero balance
    pub async fn create_bank(&self, user_id: &str) -> Result<TimeBank> {
        if user_id.trim().is_empty() {
            return Err(TimeBankError::InvalidArgument(
                "user id cannot be empty".to_string(),
            ));
        }

        let mut state = self.state.lock().await;

        if state.banks.contains_key(user_id) {
            return Err(TimeBankError::InvalidState(format!(
                "bank already exists for user '{user_id}'"
            )));
        }

        let bank = TimeBank::new(user_id.to_string());
        state.banks.insert(user_id.to_string(), bank.clone());
        self.persist(&state)?;

        info!("Created time bank for user '{}'", user_id);
        Ok(bank)
    }

    /// Get a user's bank
    pub async fn get_bank(&self, user_id: &str) -> Result<TimeBank> {
        let state = self.state.lock().await;
        state
            .banks
            .get(user_id)
            .cloned()
            .ok_or_else(|| TimeBankError::NotFound(format!("time bank for user '{user_id}'")))
    }

    /// All ledger entries for a user, ordered by creation time
    pub async fn entries_for_user(&self, user_id: &str) -> Result<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<LedgerEntry> = state
            .entries
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        // Entries are appended in commit order; the stable sort keeps that
        // order for same-timestamp entries.
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    /// Acquire the exclusive per-user lock and read the current bank
    ///
    /// Waits at most the configured bound for another in-flight mutation on
    /// the same user to finish, then fails with `Busy` so worst-case latency
    /// stays bounded under contention.
    pub async fn lock_for_update(&self, user_id: &str) -> Result<BankLock> {
        let user_mutex = {
            let mut locks = self.user_locks.lock().await;
            locks.entry(user_id.to_string()).or_default().clone()
        };

        let guard = timeout(self.lock_wait, user_mutex.lock_owned())
            .await
            .map_err(|_| TimeBankError::Busy {
                user_id: user_id.to_string(),
            })?;

        let bank = {
            let state = self.state.lock().await;
            state.banks.get(user_id).cloned()
        };

        let bank =
            bank.ok_or_else(|| TimeBankError::NotFound(format!("time bank for user '{user_id}'")))?;

        Ok(BankLock {
            user_id: user_id.to_string(),
            bank,
            _guard: guard,
        })
    }

    /// Atomically persist an updated bank together with its ledger entry
    ///
    /// Consumes the lock, releasing the user's critical section on return.
    /// All-or-nothing: if persistence fails, the in-memory state is rolled
    /// back and the store reports `StoreUnavailable` with nothing committed.
    pub async fn commit(&self, lock: BankLock, bank: TimeBank, entry: LedgerEntry) -> Result<()> {
        if bank.user_id != lock.user_id || entry.user_id != lock.user_id {
            return Err(TimeBankError::InvalidArgument(format!(
                "commit for user '{}' does not match lock for user '{}'",
                bank.user_id, lock.user_id
            )));
        }

        let mut state = self.state.lock().await;

        let previous = state.banks.insert(lock.user_id.clone(), bank);
        state.entries.push(entry);

        if let Err(e) = self.persist(&state) {
            state.entries.pop();
            match previous {
                Some(prev) => {
                    state.banks.insert(lock.user_id.clone(), prev);
                }
                None => {
                    state.banks.remove(&lock.user_id);
                }
            }
            return Err(e);
        }

        Ok(())
        // lock drops here, ending the user's critical section
    }

    fn persist(&self, state: &LedgerState) -> Result<()> {
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| TimeBankError::store(format!("failed to serialize ledger state: {e}")))?;

        storage::atomic_write(&self.path, content.as_bytes())
            .map_err(|e| TimeBankError::store(format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::types::{EntryMetadata, TransactionType};
    use chrono::Utc;
    use tempfile::tempdir;

    fn make_entry(user_id: &str, delta: i64, balance_after: i64) -> LedgerEntry {
        LedgerEntry {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            transaction_type: if delta > 0 {
                TransactionType::Earn
            } else {
                TransactionType::Spend
            },
            seconds_delta: delta,
            balance_after_seconds: balance_after,
            description: "test entry".to_string(),
            metadata: EntryMetadata::ParentGrant {
                granted_by: "parent1".to_string(),
                reason: None,
            },
            created_at: Utc::now(),
            created_by: "parent1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_bank() {
        let temp_dir = tempdir().unwrap();
        let store = LedgerStore::open(temp_dir.path(), Duration::from_secs(1)).unwrap();

        let bank = store.create_bank("kid1").await.unwrap();
        assert_eq!(bank.current_balance_seconds, 0);

        let fetched = store.get_bank("kid1").await.unwrap();
        assert_eq!(fetched.user_id, "kid1");
    }

    #[tokio::test]
    async fn test_create_bank_rejects_duplicate() {
        let temp_dir = tempdir().unwrap();
        let store = LedgerStore::open(temp_dir.path(), Duration::from_secs(1)).unwrap();

        store.create_bank("kid1").await.unwrap();
        let err = store.create_bank("kid1").await.unwrap_err();
        assert!(matches!(err, TimeBankError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_create_bank_rejects_empty_user() {
        let temp_dir = tempdir().unwrap();
        let store = LedgerStore::open(temp_dir.path(), Duration::from_secs(1)).unwrap();

        let err = store.create_bank("  ").await.unwrap_err();
        assert!(matches!(err, TimeBankError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_get_bank_not_found() {
        let temp_dir = tempdir().unwrap();
        let store = LedgerStore::open(temp_dir.path(), Duration::from_secs(1)).unwrap();

        let err = store.get_bank("nobody").await.unwrap_err();
        assert!(matches!(err, TimeBankError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_lock_for_update_missing_bank() {
        let temp_dir = tempdir().unwrap();
        let store = LedgerStore::open(temp_dir.path(), Duration::from_secs(1)).unwrap();

        let err = store.lock_for_update("nobody").await.unwrap_err();
        assert!(matches!(err, TimeBankError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_commit_persists_bank_and_entry_together() {
        let temp_dir = tempdir().unwrap();
        let store = LedgerStore::open(temp_dir.path(), Duration::from_secs(1)).unwrap();
        store.create_bank("kid1").await.unwrap();

        let lock = store.lock_for_update("kid1").await.unwrap();
        let mut bank = lock.bank().clone();
        bank.current_balance_seconds = 300;
        bank.lifetime_earned_seconds = 300;
        store
            .commit(lock, bank, make_entry("kid1", 300, 300))
            .await
            .unwrap();

        // A fresh store sees the committed state
        let reopened = LedgerStore::open(temp_dir.path(), Duration::from_secs(1)).unwrap();
        let bank = reopened.get_bank("kid1").await.unwrap();
        assert_eq!(bank.current_balance_seconds, 300);
        let entries = reopened.entries_for_user("kid1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].balance_after_seconds, 300);
    }

    #[tokio::test]
    async fn test_commit_rejects_mismatched_user() {
        let temp_dir = tempdir().unwrap();
        let store = LedgerStore::open(temp_dir.path(), Duration::from_secs(1)).unwrap();
        store.create_bank("kid1").await.unwrap();
        store.create_bank("kid2").await.unwrap();

        let lock = store.lock_for_update("kid1").await.unwrap();
        let other_bank = store.get_bank("kid2").await.unwrap();
        let err = store
            .commit(lock, other_bank, make_entry("kid2", 60, 60))
            .await
            .unwrap_err();
        assert!(matches!(err, TimeBankError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_second_lock_on_same_user_times_out() {
        let temp_dir = tempdir().unwrap();
        let store = LedgerStore::open(temp_dir.path(), Duration::from_millis(50)).unwrap();
        store.create_bank("kid1").await.unwrap();

        let _held = store.lock_for_update("kid1").await.unwrap();

        let err = store.lock_for_update("kid1").await.unwrap_err();
        assert!(matches!(err, TimeBankError::Busy { .. }));
    }

    #[tokio::test]
    async fn test_locks_for_distinct_users_are_independent() {
        let temp_dir = tempdir().unwrap();
        let store = LedgerStore::open(temp_dir.path(), Duration::from_millis(50)).unwrap();
        store.create_bank("kid1").await.unwrap();
        store.create_bank("kid2").await.unwrap();

        let _held = store.lock_for_update("kid1").await.unwrap();

        // kid2 is not blocked by kid1's in-flight mutation
        let lock = store.lock_for_update("kid2").await.unwrap();
        assert_eq!(lock.user_id(), "kid2");
    }

    #[tokio::test]
    async fn test_dropping_lock_releases_critical_section() {
        let temp_dir = tempdir().unwrap();
        let store = LedgerStore::open(temp_dir.path(), Duration::from_millis(50)).unwrap();
        store.create_bank("kid1").await.unwrap();

        {
            let _lock = store.lock_for_update("kid1").await.unwrap();
        }

        // Abandoned without commit; the next caller can proceed
        let lock = store.lock_for_update("kid1").await.unwrap();
        assert_eq!(lock.bank().current_balance_seconds, 0);
    }

    #[tokio::test]
    async fn test_open_rejects_version_mismatch() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join(LEDGER_FILE);
        std::fs::write(
            &path,
            r#"{"version":"0.9","banks":{},"entries":[]}"#,
        )
        .unwrap();

        let err = LedgerStore::open(temp_dir.path(), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, TimeBankError::StoreUnavailable(_)));
    }
}
