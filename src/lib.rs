//! txwatch - transaction confirmation and retry coordinator
//!
//! Tracks asynchronously submitted ledger transactions until they confirm,
//! fail or time out, racing a push subscription against a poll loop, and
//! aggregates multi-step batches into one status. Notification, history,
//! ledger and resubmission concerns are reached through the traits in
//! [`notifier`], [`history`], [`ledger`] and [`resubmit`].

pub mod batch;
pub mod config;
pub mod dispatcher;
pub mod endpoints;
pub mod errors;
pub mod history;
pub mod ledger;
pub mod metrics;
pub mod notifier;
pub mod registry;
pub mod resubmit;
pub mod types;
pub mod watcher;

// Re-export commonly used types
pub use config::{Config, WatcherConfig};
pub use dispatcher::CallbackDispatcher;
pub use errors::{LedgerError, LedgerResult, WatcherError};
pub use history::{HistoryStore, InMemoryHistoryStore};
pub use ledger::{LedgerClient, SignatureSubscription, SolanaLedgerClient, SubscriptionHandle};
pub use notifier::{ChannelNotifier, Notifier, TracingNotifier};
pub use registry::{aggregate_status, WatchSnapshot};
pub use resubmit::{ResubmissionService, Resubmitter};
pub use types::{
    BatchMember, BatchOptions, Commitment, DetectionPath, HistoryRecord, Notification,
    NotificationDetail, SubTransaction, TxDisplay, TxOutcome, TxStatus, WatchOptions,
    WatchRegistration,
};
pub use watcher::Coordinator;
