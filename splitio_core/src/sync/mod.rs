//! The synchronization subsystem: feed pollers, fetch-and-apply cycles, and
//! the manager coordinating polling with streaming.
pub mod backoff;
pub mod manager;
pub mod poller;
pub mod synchronizer;

pub use backoff::Backoff;
pub use manager::{ReadinessGate, SyncConfig, SyncManager, SyncMode};
pub use poller::{Poller, PollerConfig};
pub use synchronizer::{FeedFetcher, Synchronizer};
