use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, TimeBankError};
use crate::ledger::{BalanceUpdate, BalanceUpdateEngine, EntryMetadata, TransactionType};
use crate::storage;

const QUEUE_STATE_VERSION: &str = "1.0";
const QUEUE_FILE: &str = "offline-queue.json";

/// A transaction recorded by a client without connectivity
///
/// Consumed exactly once per replay attempt and retained indefinitely as an
/// audit/debug trail.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct OfflineQueueEntry {
    pub id: String,
    pub user_id: String,
    /// Explicit classification; `None` classifies by the sign of the delta
    pub transaction_type: Option<TransactionType>,
    pub seconds_delta: i64,
    pub description: String,
    pub metadata: EntryMetadata,
    /// Client-asserted event time; replay applies entries in this order
    pub client_timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_identifier: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    /// Set exactly once, on the first replay attempt, success or failure
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: u32,
}

/// Fields the client-sync collaborator supplies when enqueueing
#[derive(Debug, Clone)]
pub struct NewOfflineEntry {
    pub user_id: String,
    pub transaction_type: Option<TransactionType>,
    pub seconds_delta: i64,
    pub description: String,
    pub metadata: EntryMetadata,
    pub client_timestamp: DateTime<Utc>,
    pub device_identifier: Option<String>,
}

/// Outcome of one replay batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingSummary {
    pub processed_count: usize,
    pub failed_count: usize,
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct QueueState {
    version: String,
    entries: Vec<OfflineQueueEntry>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            version: QUEUE_STATE_VERSION.to_string(),
            entries: Vec::new(),
        }
    }
}

/// Replays transactions accumulated while a client lacked connectivity
///
/// Replay is chronological by client timestamp and isolates per-entry
/// business failures: a rejected entry is recorded and skipped, never
/// blocking the entries behind it. Infrastructure faults abort the batch,
/// leaving unprocessed entries untouched for a future call.
pub struct OfflineReplayQueue {
    engine: Arc<BalanceUpdateEngine>,
    path: PathBuf,
    state: Mutex<QueueState>,
    replay_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    max_replay_retries: u32,
}

impl OfflineReplayQueue {
    /// Open the queue, loading existing entries from the data directory
    pub fn open(
        data_dir: &Path,
        engine: Arc<BalanceUpdateEngine>,
        max_replay_retries: u32,
    ) -> Result<Self> {
        let path = data_dir.join(QUEUE_FILE);
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| {
                TimeBankError::store(format!("failed to read {}: {e}", path.display()))
            })?;
            let state: QueueState = serde_json::from_str(&content).map_err(|e| {
                TimeBankError::store(format!("failed to parse {}: {e}", path.display()))
            })?;

            if state.version != QUEUE_STATE_VERSION {
                return Err(TimeBankError::store(format!(
                    "unsupported offline queue version '{}' in {}",
                    state.version,
                    path.display()
                )));
            }
            state
        } else {
            QueueState::new()
        };

        Ok(Self {
            engine,
            path,
            state: Mutex::new(state),
            replay_locks: Mutex::new(HashMap::new()),
            max_replay_retries,
        })
    }

    /// Append a transaction recorded offline
    ///
    /// Pure append; validation happens at replay time, through the engine.
    pub async fn enqueue(&self, new: NewOfflineEntry) -> Result<String> {
        if new.user_id.trim().is_empty() {
            return Err(TimeBankError::InvalidArgument(
                "user id cannot be empty".to_string(),
            ));
        }

        let entry = OfflineQueueEntry {
            id: Uuid::new_v4().to_string(),
            user_id: new.user_id,
            transaction_type: new.transaction_type,
            seconds_delta: new.seconds_delta,
            description: new.description,
            metadata: new.metadata,
            client_timestamp: new.client_timestamp,
            device_identifier: new.device_identifier,
            enqueued_at: Utc::now(),
            processed_at: None,
            error_message: None,
            retry_count: 0,
        };
        let entry_id = entry.id.clone();

        let mut state = self.state.lock().await;
        state.entries.push(entry);
        self.persist(&state)?;

        debug!("Enqueued offline entry {}", entry_id);
        Ok(entry_id)
    }

    /// Replay every unprocessed entry for a user in chronological order
    ///
    /// Batches for the same user run sequentially; entries for one user are
    /// ordered dependencies of each other, so two overlapping replays must
    /// not interleave.
    pub async fn process_pending(&self, user_id: &str) -> Result<ProcessingSummary> {
        let replay_lock = {
            let mut locks = self.replay_locks.lock().await;
            locks.entry(user_id.to_string()).or_default().clone()
        };
        let _replay_guard = replay_lock.lock().await;

        let mut pending: Vec<OfflineQueueEntry> = {
            let state = self.state.lock().await;
            state
                .entries
                .iter()
                .filter(|e| e.user_id == user_id && e.processed_at.is_none())
                .cloned()
                .collect()
        };
        // Chronological replay preserves balance-dependent ordering even
        // though entries may have arrived out of band. The tie-break keeps
        // the order total when a client stamps several events identically.
        pending.sort_by(|a, b| {
            (a.client_timestamp, a.enqueued_at, &a.id).cmp(&(
                b.client_timestamp,
                b.enqueued_at,
                &b.id,
            ))
        });

        if pending.is_empty() {
            return Ok(ProcessingSummary::default());
        }

        debug!(
            "Replaying {} offline entries for user '{}'",
            pending.len(),
            user_id
        );

        let mut summary = ProcessingSummary::default();
        for entry in pending {
            let result = self
                .engine
                .apply(BalanceUpdate {
                    user_id: entry.user_id.clone(),
                    seconds_delta: entry.seconds_delta,
                    transaction_type: entry.transaction_type,
                    description: entry.description.clone(),
                    metadata: entry.metadata.clone(),
                    actor_id: entry.user_id.clone(),
                })
                .await;

            match result {
                Ok(_) => {
                    self.mark_attempted(&entry.id, None).await?;
                    summary.processed_count += 1;
                }
                Err(e) if e.is_infrastructure() => {
                    // Abort the batch: this entry and everything behind it
                    // stay unprocessed for a future call.
                    warn!(
                        "Aborting replay for user '{}' on entry {}: {}",
                        user_id, entry.id, e
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "Offline entry {} for user '{}' failed: {}",
                        entry.id, user_id, e
                    );
                    self.mark_attempted(&entry.id, Some(e.to_string())).await?;
                    summary.failed_count += 1;
                }
            }
        }

        info!(
            "Replayed offline queue for user '{}': {} processed, {} failed",
            user_id, summary.processed_count, summary.failed_count
        );
        Ok(summary)
    }

    /// Re-open failed entries for another replay pass
    ///
    /// Explicit, bounded retry: entries whose `retry_count` has reached the
    /// configured ceiling stay terminal. Returns how many entries became
    /// eligible again.
    pub async fn retry_failed(&self, user_id: &str) -> Result<usize> {
        let mut state = self.state.lock().await;

        let mut reopened = 0;
        for entry in state.entries.iter_mut() {
            if entry.user_id == user_id
                && entry.processed_at.is_some()
                && entry.error_message.is_some()
                && entry.retry_count < self.max_replay_retries
            {
                entry.processed_at = None;
                entry.error_message = None;
                reopened += 1;
            }
        }

        if reopened > 0 {
            self.persist(&state)?;
            info!(
                "Re-opened {} failed offline entries for user '{}'",
                reopened, user_id
            );
        }

        Ok(reopened)
    }

    /// All queue entries for a user, in replay order
    pub async fn entries_for_user(&self, user_id: &str) -> Result<Vec<OfflineQueueEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<OfflineQueueEntry> = state
            .entries
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            (a.client_timestamp, a.enqueued_at, &a.id).cmp(&(
                b.client_timestamp,
                b.enqueued_at,
                &b.id,
            ))
        });
        Ok(entries)
    }

    async fn mark_attempted(&self, entry_id: &str, error: Option<String>) -> Result<()> {
        let mut state = self.state.lock().await;

        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| TimeBankError::NotFound(format!("offline entry '{entry_id}'")))?;

        entry.processed_at = Some(Utc::now());
        if error.is_some() {
            entry.retry_count += 1;
        }
        entry.error_message = error;

        self.persist(&state)
    }

    fn persist(&self, state: &QueueState) -> Result<()> {
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| TimeBankError::store(format!("failed to serialize queue: {e}")))?;

        storage::atomic_write(&self.path, content.as_bytes())
            .map_err(|e| TimeBankError::store(format!("{e:#}")))
    }
}
