/// Ledger module: per-user time banks and the append-only audit trail
///
/// This module provides:
/// - Durable storage of banks and ledger entries with per-user locking
/// - The balance update engine, the only code path that mutates a balance

pub mod engine;
pub mod store;
pub mod types;

pub use engine::{BalanceUpdate, BalanceUpdateEngine, BalanceUpdateOutcome};
pub use store::{BankLock, LedgerStore};
pub use types::{EntryMetadata, LedgerEntry, TimeBank, TransactionSource, TransactionType};
