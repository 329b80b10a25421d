//! Screen Time Bank
//!
//! A per-user bank of seconds that can be earned (completed tasks, parent
//! grants) and spent (unlocking device access), backed by an immutable
//! audit ledger. The crate is organized around four components:
//!
//! - [`ledger`] - time banks, the append-only ledger, and the balance
//!   update engine that is the sole writer of balance state
//! - [`session`] - time-boxed unlocked sessions funded by balance debits
//! - [`offline`] - ordered replay of transactions recorded without
//!   connectivity
//! - `core` - the assembled `TimeBankCore` facade consumed by callers

pub mod config;
pub mod core;
pub mod error;
pub mod ledger;
pub mod offline;
pub mod session;
pub mod storage;

pub use crate::core::TimeBankCore;
pub use config::TimeBankConfig;
pub use error::{Result, TimeBankError};
pub use ledger::{
    BalanceUpdate, BalanceUpdateOutcome, EntryMetadata, LedgerEntry, TimeBank, TransactionSource,
    TransactionType,
};
pub use offline::{NewOfflineEntry, OfflineQueueEntry, ProcessingSummary};
pub use session::{SessionReceipt, SessionStatus, UnlockedSession};
