//! Common types used throughout the coordinator
//!
//! Statuses, ledger outcomes, notification and history shapes, and the
//! option structs callers hand to `watch` / `watch_batch`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::WatcherError;

/// Lifecycle status of a watched transaction or batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    /// Submitted, outcome not yet known
    Pending,
    /// Landed without a ledger-reported error
    Confirmed,
    /// Landed but the ledger reported an execution error
    Failed,
    /// No detection path resolved within the timeout
    TimedOut,
}

impl TxStatus {
    /// Terminal statuses never transition again
    pub fn is_terminal(self) -> bool {
        !matches!(self, TxStatus::Pending)
    }

    /// Failed and timed out are both surfaced to callers as errors
    pub fn is_failure(self) -> bool {
        matches!(self, TxStatus::Failed | TxStatus::TimedOut)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Failed => "failed",
            TxStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finality tier requested from the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    Processed,
    #[default]
    Confirmed,
    Finalized,
}

impl FromStr for Commitment {
    type Err = WatcherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "processed" => Ok(Commitment::Processed),
            "confirmed" => Ok(Commitment::Confirmed),
            "finalized" => Ok(Commitment::Finalized),
            other => Err(WatcherError::InvalidCommitment(other.to_string())),
        }
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Commitment::Processed => "processed",
            Commitment::Confirmed => "confirmed",
            Commitment::Finalized => "finalized",
        };
        f.write_str(s)
    }
}

/// Ledger result for a landed transaction.
///
/// Both the push path and the poll path produce this shape, so the terminal
/// handler cannot tell which one resolved the watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutcome {
    pub id: String,
    pub slot: Option<u64>,
    /// Ledger-reported execution error (revert, slippage, ...)
    pub err: Option<String>,
}

impl TxOutcome {
    pub fn success(id: impl Into<String>, slot: Option<u64>) -> Self {
        Self {
            id: id.into(),
            slot,
            err: None,
        }
    }

    pub fn failure(id: impl Into<String>, slot: Option<u64>, err: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            slot,
            err: Some(err.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.err.is_none()
    }

    pub fn status(&self) -> TxStatus {
        if self.is_success() {
            TxStatus::Confirmed
        } else {
            TxStatus::Failed
        }
    }
}

/// Which detection path resolved a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionPath {
    /// Signature subscription event
    Push,
    /// Poll loop lookup
    Poll,
}

/// Display metadata carried into notifications and history records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxDisplay {
    pub title: String,
    pub description: String,
    pub owner_key: Option<String>,
    pub values: BTreeMap<String, String>,
}

impl TxDisplay {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_owner(mut self, owner_key: impl Into<String>) -> Self {
        self.owner_key = Some(owner_key.into());
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

/// One member entry of a batch snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTransaction {
    pub id: String,
    pub status: TxStatus,
}

impl SubTransaction {
    pub fn new(id: impl Into<String>, status: TxStatus) -> Self {
        Self {
            id: id.into(),
            status,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationDetail {
    pub title: String,
    pub description: String,
    pub error: Option<String>,
    pub path: Option<DetectionPath>,
    /// Per-member snapshot, empty for single watches
    pub sub_transactions: Vec<SubTransaction>,
}

impl NotificationDetail {
    pub fn from_display(display: &TxDisplay) -> Self {
        Self {
            title: display.title.clone(),
            description: display.description.clone(),
            ..Self::default()
        }
    }
}

/// Status-transition event handed to the external notifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Transaction id or batch id
    pub id: String,
    pub status: TxStatus,
    /// False for the initial "sent" event, true for every later one
    pub is_update: bool,
    pub detail: NotificationDetail,
}

impl Notification {
    /// Failures and timeouts are warning-level
    pub fn level(&self) -> tracing::Level {
        if self.status.is_failure() {
            tracing::Level::WARN
        } else {
            tracing::Level::INFO
        }
    }
}

/// Append-only history entry; the latest record for a key wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Transaction id or batch id
    pub key: String,
    pub status: TxStatus,
    pub title: String,
    pub description: String,
    pub owner_key: Option<String>,
    pub values: BTreeMap<String, String>,
    pub sub_transactions: Option<Vec<SubTransaction>>,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn new(key: impl Into<String>, status: TxStatus, display: &TxDisplay) -> Self {
        Self {
            key: key.into(),
            status,
            title: display.title.clone(),
            description: display.description.clone(),
            owner_key: display.owner_key.clone(),
            values: display.values.clone(),
            sub_transactions: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_sub_transactions(mut self, sub_transactions: Vec<SubTransaction>) -> Self {
        self.sub_transactions = Some(sub_transactions);
        self
    }
}

/// Zero-argument lifecycle callback
pub type Callback = Box<dyn FnOnce() + Send + 'static>;
/// Receives the ledger outcome of a confirmed transaction
pub type ConfirmedCallback = Box<dyn FnOnce(TxOutcome) + Send + 'static>;
/// Receives the ledger outcome of a failed transaction, `None` on timeout
pub type ErrorCallback = Box<dyn FnOnce(Option<TxOutcome>) + Send + 'static>;

/// Options for a single watch
#[derive(Default)]
pub struct WatchOptions {
    /// Fire-and-forget: emit "sent" and return without tracking
    pub skip_watch: bool,
    /// Already-signed transaction bytes to re-broadcast while pending
    pub signed_payload: Option<Vec<u8>>,
    /// Falls back to the coordinator's configured commitment
    pub commitment: Option<Commitment>,
    /// Falls back to the coordinator's configured timeout
    pub timeout: Option<Duration>,
    pub display: TxDisplay,
    pub(crate) on_sent: Option<Callback>,
    pub(crate) on_confirmed: Option<ConfirmedCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
}

impl WatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_watch(mut self) -> Self {
        self.skip_watch = true;
        self
    }

    pub fn with_signed_payload(mut self, payload: Vec<u8>) -> Self {
        self.signed_payload = Some(payload);
        self
    }

    pub fn with_commitment(mut self, commitment: Commitment) -> Self {
        self.commitment = Some(commitment);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_display(mut self, display: TxDisplay) -> Self {
        self.display = display;
        self
    }

    pub fn on_sent<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_sent = Some(Box::new(f));
        self
    }

    pub fn on_confirmed<F>(mut self, f: F) -> Self
    where
        F: FnOnce(TxOutcome) + Send + 'static,
    {
        self.on_confirmed = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Option<TxOutcome>) + Send + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for WatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchOptions")
            .field("skip_watch", &self.skip_watch)
            .field("has_signed_payload", &self.signed_payload.is_some())
            .field("commitment", &self.commitment)
            .field("timeout", &self.timeout)
            .field("display", &self.display)
            .finish_non_exhaustive()
    }
}

/// One member of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchMember {
    pub id: String,
    pub signed_payload: Option<Vec<u8>>,
}

impl BatchMember {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            signed_payload: None,
        }
    }

    pub fn with_signed_payload(mut self, payload: Vec<u8>) -> Self {
        self.signed_payload = Some(payload);
        self
    }
}

/// Options for a batch watch.
///
/// Callbacks are driven by a [`crate::dispatcher::CallbackDispatcher`] fed the
/// member snapshot, so each fires at most once.
#[derive(Default)]
pub struct BatchOptions {
    pub skip_watch: bool,
    pub commitment: Option<Commitment>,
    pub timeout: Option<Duration>,
    pub display: TxDisplay,
    pub(crate) on_sent: Option<Callback>,
    pub(crate) on_confirmed: Option<Callback>,
    pub(crate) on_error: Option<Callback>,
    pub(crate) on_finally: Option<Callback>,
}

impl BatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_watch(mut self) -> Self {
        self.skip_watch = true;
        self
    }

    pub fn with_commitment(mut self, commitment: Commitment) -> Self {
        self.commitment = Some(commitment);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_display(mut self, display: TxDisplay) -> Self {
        self.display = display;
        self
    }

    pub fn on_sent<F: FnOnce() + Send + 'static>(mut self, f: F) -> Self {
        self.on_sent = Some(Box::new(f));
        self
    }

    pub fn on_confirmed<F: FnOnce() + Send + 'static>(mut self, f: F) -> Self {
        self.on_confirmed = Some(Box::new(f));
        self
    }

    pub fn on_error<F: FnOnce() + Send + 'static>(mut self, f: F) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_finally<F: FnOnce() + Send + 'static>(mut self, f: F) -> Self {
        self.on_finally = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchOptions")
            .field("skip_watch", &self.skip_watch)
            .field("commitment", &self.commitment)
            .field("timeout", &self.timeout)
            .field("display", &self.display)
            .finish_non_exhaustive()
    }
}

/// What `watch` / `watch_batch` did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchRegistration {
    /// A new watch was registered
    Watching,
    /// Fire-and-forget: "sent" was emitted, nothing is tracked
    Detached,
    /// The id is already being watched; the request was ignored
    AlreadyWatching,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(!TxStatus::Pending.is_terminal());
        assert!(TxStatus::Confirmed.is_terminal());
        assert!(TxStatus::Failed.is_terminal());
        assert!(TxStatus::TimedOut.is_terminal());

        assert!(TxStatus::TimedOut.is_failure());
        assert!(!TxStatus::Confirmed.is_failure());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&TxStatus::TimedOut).unwrap();
        assert_eq!(json, "\"timed_out\"");
        assert_eq!(TxStatus::TimedOut.to_string(), "timed_out");
    }

    #[test]
    fn test_commitment_parsing() {
        assert_eq!("Finalized".parse::<Commitment>().unwrap(), Commitment::Finalized);
        assert_eq!(" processed ".parse::<Commitment>().unwrap(), Commitment::Processed);
        assert!("rooted".parse::<Commitment>().is_err());
        assert_eq!(Commitment::default(), Commitment::Confirmed);
    }

    #[test]
    fn test_outcome_classification() {
        assert_eq!(TxOutcome::success("a", Some(1)).status(), TxStatus::Confirmed);
        let failed = TxOutcome::failure("a", None, "slippage exceeded");
        assert_eq!(failed.status(), TxStatus::Failed);
        assert!(!failed.is_success());
    }

    #[test]
    fn test_notification_level() {
        let mut n = Notification {
            id: "x".to_string(),
            status: TxStatus::Confirmed,
            is_update: true,
            detail: NotificationDetail::default(),
        };
        assert_eq!(n.level(), tracing::Level::INFO);
        n.status = TxStatus::TimedOut;
        assert_eq!(n.level(), tracing::Level::WARN);
    }

    #[test]
    fn test_history_record_carries_display() {
        let display = TxDisplay::new("Swap")
            .with_description("1 SOL -> 150 USDC")
            .with_owner("owner1")
            .with_value("amount", "1");
        let record = HistoryRecord::new("sig", TxStatus::Confirmed, &display);

        assert_eq!(record.title, "Swap");
        assert_eq!(record.owner_key.as_deref(), Some("owner1"));
        assert_eq!(record.values.get("amount").map(String::as_str), Some("1"));
        assert!(record.sub_transactions.is_none());
    }
}
