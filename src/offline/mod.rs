/// Offline module: deferred, ordered replay of transactions recorded
/// without connectivity

pub mod queue;

pub use queue::{NewOfflineEntry, OfflineQueueEntry, OfflineReplayQueue, ProcessingSummary};
