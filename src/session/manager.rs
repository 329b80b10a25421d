use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, TimeBankError};
use crate::ledger::{BalanceUpdate, BalanceUpdateEngine, EntryMetadata, TransactionType};
use crate::session::types::{SessionReceipt, SessionStatus, UnlockedSession};
use crate::storage;

const SESSION_STATE_VERSION: &str = "1.0";
const SESSIONS_FILE: &str = "sessions.json";

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct SessionState {
    version: String,
    sessions: HashMap<String, UnlockedSession>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            version: SESSION_STATE_VERSION.to_string(),
            sessions: HashMap::new(),
        }
    }
}

/// Converts a balance debit into a time-boxed access grant
///
/// The session row is only written after the funding debit has committed,
/// so a failed debit leaves no session behind. Session state is owned by
/// this component; nothing else writes `sessions.json`.
pub struct SessionManager {
    engine: Arc<BalanceUpdateEngine>,
    path: PathBuf,
    state: Mutex<SessionState>,
    min_duration_minutes: u32,
    max_duration_minutes: u32,
}

impl SessionManager {
    /// Open the manager, loading existing sessions from the data directory
    pub fn open(
        data_dir: &Path,
        engine: Arc<BalanceUpdateEngine>,
        min_duration_minutes: u32,
        max_duration_minutes: u32,
    ) -> Result<Self> {
        let path = data_dir.join(SESSIONS_FILE);
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| {
                TimeBankError::store(format!("failed to read {}: {e}", path.display()))
            })?;
            let state: SessionState = serde_json::from_str(&content).map_err(|e| {
                TimeBankError::store(format!("failed to parse {}: {e}", path.display()))
            })?;

            if state.version != SESSION_STATE_VERSION {
                return Err(TimeBankError::store(format!(
                    "unsupported session state version '{}' in {}",
                    state.version,
                    path.display()
                )));
            }
            state
        } else {
            SessionState::new()
        };

        Ok(Self {
            engine,
            path,
            state: Mutex::new(state),
            min_duration_minutes,
            max_duration_minutes,
        })
    }

    /// Start an unlocked session by debiting its cost from the user's bank
    ///
    /// All-or-nothing across "debit, then create session row": if the debit
    /// fails (commonly with insufficient balance) no session is created.
    pub async fn start_session(
        &self,
        user_id: &str,
        duration_minutes: u32,
        device_identifier: Option<String>,
    ) -> Result<SessionReceipt> {
        if duration_minutes < self.min_duration_minutes
            || duration_minutes > self.max_duration_minutes
        {
            return Err(TimeBankError::InvalidArgument(format!(
                "session duration must be between {} and {} minutes, got {}",
                self.min_duration_minutes, self.max_duration_minutes, duration_minutes
            )));
        }

        let session_id = Uuid::new_v4().to_string();
        let cost_seconds = i64::from(duration_minutes) * 60;

        let outcome = self
            .engine
            .apply(BalanceUpdate {
                user_id: user_id.to_string(),
                seconds_delta: -cost_seconds,
                transaction_type: Some(TransactionType::Spend),
                description: format!("Unlocked device for {duration_minutes} minutes"),
                metadata: EntryMetadata::UnlockedSession {
                    session_id: session_id.clone(),
                    device_identifier: device_identifier.clone(),
                },
                actor_id: user_id.to_string(),
            })
            .await?;

        let now = Utc::now();
        let ends_at = now + Duration::minutes(i64::from(duration_minutes));
        let session = UnlockedSession {
            id: session_id.clone(),
            user_id: user_id.to_string(),
            duration_seconds: cost_seconds,
            cost_seconds,
            started_at: now,
            ends_at,
            status: SessionStatus::Active,
            device_identifier,
        };

        {
            let mut state = self.state.lock().await;
            state.sessions.insert(session_id.clone(), session);
            self.persist(&state)?;
        }

        info!(
            "Started session {} for user '{}': {} minutes until {}",
            session_id, user_id, duration_minutes, ends_at
        );

        Ok(SessionReceipt {
            session_id,
            ends_at,
            new_balance_seconds: outcome.new_balance_seconds,
        })
    }

    /// Transition every active session past its end time to expired
    ///
    /// Driven by an external scheduler passing in the clock. Expiry has no
    /// balance effect; the funding debit is not refunded.
    pub async fn expire_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.lock().await;

        let mut expired = 0;
        for session in state.sessions.values_mut() {
            if session.status == SessionStatus::Active && session.ends_at <= now {
                session.status = SessionStatus::Expired;
                expired += 1;
                debug!("Session {} for user '{}' expired", session.id, session.user_id);
            }
        }

        if expired > 0 {
            self.persist(&state)?;
            info!("Expired {} session(s)", expired);
        }

        Ok(expired)
    }

    /// Cancel an active session
    ///
    /// The remaining time is forfeited: cancellation does not refund the
    /// funding debit.
    pub async fn cancel_session(&self, session_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| TimeBankError::NotFound(format!("session '{session_id}'")))?;

        if session.status.is_terminal() {
            return Err(TimeBankError::InvalidState(format!(
                "session '{}' is already {}",
                session_id, session.status
            )));
        }

        session.status = SessionStatus::Cancelled;
        let user_id = session.user_id.clone();
        self.persist(&state)?;

        info!(
            "Cancelled session {} for user '{}' (remaining time forfeited)",
            session_id, user_id
        );
        Ok(())
    }

    /// Get a session by id
    pub async fn get_session(&self, session_id: &str) -> Result<UnlockedSession> {
        let state = self.state.lock().await;
        state
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| TimeBankError::NotFound(format!("session '{session_id}'")))
    }

    /// All sessions for a user, most recent first
    pub async fn sessions_for_user(&self, user_id: &str) -> Result<Vec<UnlockedSession>> {
        let state = self.state.lock().await;
        let mut sessions: Vec<UnlockedSession> = state
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| std::cmp::Reverse(s.started_at));
        Ok(sessions)
    }

    fn persist(&self, state: &SessionState) -> Result<()> {
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| TimeBankError::store(format!("failed to serialize sessions: {e}")))?;

        storage::atomic_write(&self.path, content.as_bytes())
            .map_err(|e| TimeBankError::store(format!("{e:#}")))
    }
}
