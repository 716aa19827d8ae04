//! Single-transaction confirmation watcher
//!
//! Every watch races three detection paths inside one task:
//! - **push**: a signature subscription on the ledger client
//! - **poll**: a by-id lookup every `poll_interval`, capped by attempt count
//! - **timeout**: a fixed deadline from registration
//!
//! Subscribing happens inside the push branch, so a slow websocket never
//! delays the poll schedule, which is anchored at registration.
//!
//! The first path to resolve ends the `select!`, which drops the other two.
//! The terminal transition then goes through [`Registry::claim`], so a
//! concurrent `cancel` (or a stale task of an earlier registration) can never
//! produce a second terminal notification.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WatcherConfig;
use crate::errors::WatcherError;
use crate::history::HistoryStore;
use crate::ledger::{LedgerClient, SubscriptionHandle};
use crate::metrics::metrics;
use crate::notifier::Notifier;
use crate::registry::{Registry, WatchRecord, WatchSnapshot};
use crate::resubmit::Resubmitter;
use crate::types::{
    Commitment, ConfirmedCallback, DetectionPath, ErrorCallback, HistoryRecord, Notification,
    NotificationDetail, TxDisplay, TxOutcome, TxStatus, WatchOptions, WatchRegistration,
};

/// Transaction confirmation and retry coordinator.
///
/// Cheap to clone; clones share one registry. Requires a tokio runtime:
/// every tracked watch runs as a spawned task.
#[derive(Clone)]
pub struct Coordinator {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: WatcherConfig,
    pub(crate) ledger: Arc<dyn LedgerClient>,
    pub(crate) resubmitter: Arc<dyn Resubmitter>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) history: Arc<dyn HistoryStore>,
    pub(crate) registry: Mutex<Registry>,
}

/// Where a watch reports its terminal transition
pub(crate) enum Reporter {
    /// Own notification, history record and callbacks
    Standalone {
        display: TxDisplay,
        on_confirmed: Option<ConfirmedCallback>,
        on_error: Option<ErrorCallback>,
    },
    /// Folded into the owning batch's aggregate
    Member { batch_id: String },
}

pub(crate) struct WatchRequest {
    pub(crate) id: String,
    pub(crate) commitment: Commitment,
    pub(crate) timeout: Duration,
    pub(crate) reporter: Reporter,
}

pub(crate) struct Registration {
    generation: u64,
    token: CancellationToken,
    poll_attempts: Arc<AtomicU32>,
    started_at: Instant,
}

enum Resolution {
    Landed(TxOutcome, DetectionPath),
    TimedOut,
}

impl Resolution {
    fn status(&self) -> TxStatus {
        match self {
            Resolution::Landed(outcome, _) => outcome.status(),
            Resolution::TimedOut => TxStatus::TimedOut,
        }
    }
}

impl Coordinator {
    pub fn new(
        config: WatcherConfig,
        ledger: Arc<dyn LedgerClient>,
        resubmitter: Arc<dyn Resubmitter>,
        notifier: Arc<dyn Notifier>,
        history: Arc<dyn HistoryStore>,
    ) -> Result<Self, WatcherError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                ledger,
                resubmitter,
                notifier,
                history,
                registry: Mutex::new(Registry::new()),
            }),
        })
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.inner.config
    }

    /// Track one submitted transaction until it reaches a terminal status.
    ///
    /// Emits the "sent" notification and runs `on_sent` unless the id is
    /// already being watched, in which case the request is ignored.
    pub fn watch(&self, id: impl Into<String>, options: WatchOptions) -> WatchRegistration {
        let id = id.into();
        let WatchOptions {
            skip_watch,
            signed_payload,
            commitment,
            timeout,
            display,
            on_sent,
            on_confirmed,
            on_error,
        } = options;

        if skip_watch || id.is_empty() {
            self.inner.emit_sent(&id, &display);
            if let Some(callback) = on_sent {
                callback();
            }
            debug!(signature = %id, "Fire-and-forget submission, not tracking");
            return WatchRegistration::Detached;
        }

        let registration = {
            let mut registry = self.inner.registry.lock();
            self.inner
                .register_locked(&mut registry, &id, signed_payload, None)
        };
        let Some(registration) = registration else {
            metrics().duplicate_registrations.inc();
            debug!(signature = %id, "Already watching, ignoring duplicate request");
            return WatchRegistration::AlreadyWatching;
        };

        self.inner.emit_sent(&id, &display);
        if let Some(callback) = on_sent {
            callback();
        }

        let request = WatchRequest {
            id,
            commitment: commitment.unwrap_or(self.inner.config.commitment),
            timeout: timeout.unwrap_or_else(|| self.inner.config.timeout()),
            reporter: Reporter::Standalone {
                display,
                on_confirmed,
                on_error,
            },
        };
        self.inner.spawn_watch(request, registration);

        WatchRegistration::Watching
    }

    /// Force-terminate a watch or batch without waiting for any path.
    ///
    /// No notification, history record or callback is produced. Cancelling a
    /// transaction also cancels every batch waiting on it, since those can no
    /// longer reach a real aggregate. Returns once the subscriptions are
    /// released; `false` if the id was unknown.
    pub async fn cancel(&self, id: &str) -> bool {
        let (records, batches) = {
            let mut registry = self.inner.registry.lock();
            let mut records = Vec::new();
            let mut batches = Vec::new();

            if let Some(record) = registry.remove_watch(id) {
                let dependents: Vec<String> = record
                    .batch_id
                    .iter()
                    .chain(&record.listeners)
                    .cloned()
                    .collect();
                records.push(record);
                for batch_id in dependents {
                    if let Some(members) = self.inner.close_batch(&mut registry, &batch_id) {
                        records.extend(members);
                        batches.push(batch_id);
                    }
                }
            }
            if let Some(members) = self.inner.close_batch(&mut registry, id) {
                records.extend(members);
                batches.push(id.to_string());
            }
            (records, batches)
        };

        let cancelled = !records.is_empty() || !batches.is_empty();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        for record in records {
            metrics().watches_cancelled.inc();
            tasks.extend(self.inner.release(record));
        }

        if cancelled {
            info!(id = %id, batches = ?batches, "Watch cancelled");
        } else {
            debug!(id = %id, "Cancel requested for unknown id");
        }

        for task in tasks {
            if let Err(e) = task.await {
                warn!(id = %id, error = %e, "Watch task ended abnormally");
            }
        }

        cancelled
    }

    pub fn is_watching(&self, id: &str) -> bool {
        self.inner.registry.lock().contains_watch(id)
    }

    pub fn is_batch_active(&self, batch_id: &str) -> bool {
        self.inner.registry.lock().contains_batch(batch_id)
    }

    pub fn snapshot(&self, id: &str) -> Option<WatchSnapshot> {
        self.inner.registry.lock().watch(id).map(WatchRecord::snapshot)
    }

    pub fn active_watches(&self) -> usize {
        self.inner.registry.lock().watch_count()
    }

    pub fn active_batches(&self) -> usize {
        self.inner.registry.lock().batch_count()
    }
}

impl Inner {
    /// Insert a pending record and start resubmission, under the registry lock
    /// so a concurrent cancel always sees both or neither.
    pub(crate) fn register_locked(
        &self,
        registry: &mut Registry,
        id: &str,
        signed_payload: Option<Vec<u8>>,
        batch_id: Option<String>,
    ) -> Option<Registration> {
        let token = CancellationToken::new();
        let (generation, poll_attempts, started_at) =
            registry.try_register(id, signed_payload.is_some(), batch_id, token.clone())?;

        if let Some(payload) = signed_payload {
            self.resubmitter.start(id, payload);
        }

        metrics().watches_started.inc();
        metrics().active_watches.inc();

        Some(Registration {
            generation,
            token,
            poll_attempts,
            started_at,
        })
    }

    pub(crate) fn spawn_watch(self: &Arc<Self>, request: WatchRequest, registration: Registration) {
        let id = request.id.clone();
        let generation = registration.generation;

        debug!(
            signature = %id,
            commitment = %request.commitment,
            timeout_ms = request.timeout.as_millis() as u64,
            "Watching transaction"
        );

        let mut registry = self.registry.lock();
        let task = tokio::spawn(self.clone().run_watch(request, registration));
        registry.attach_task(&id, generation, task);
    }

    /// Stop everything a removed record owns. The caller awaits the returned
    /// task if it needs the subscription released before moving on.
    pub(crate) fn release(&self, record: WatchRecord) -> Option<JoinHandle<()>> {
        record.token.cancel();
        self.resubmitter.stop(&record.id);
        metrics().active_watches.dec();
        record.task
    }

    async fn run_watch(self: Arc<Self>, request: WatchRequest, registration: Registration) {
        let WatchRequest {
            id,
            commitment,
            timeout,
            reporter,
        } = request;
        let Registration {
            generation,
            token,
            poll_attempts,
            started_at,
        } = registration;

        let deadline = started_at + timeout;
        let max_attempts = self.config.max_poll_attempts(timeout);
        let opened = Mutex::new(None);

        let resolution = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            Some(outcome) = self.push_event(&id, generation, commitment, &opened) => {
                Some(Resolution::Landed(outcome, DetectionPath::Push))
            }
            Some(outcome) = self.poll_until_found(&id, commitment, started_at, max_attempts, &poll_attempts) => {
                Some(Resolution::Landed(outcome, DetectionPath::Poll))
            }
            _ = tokio::time::sleep_until(deadline) => Some(Resolution::TimedOut),
        };

        let handle = opened.lock().take();
        if let Some(handle) = handle {
            self.ledger.unsubscribe(handle).await;
        }

        match resolution {
            Some(resolution) => self.settle(&id, generation, resolution, reporter),
            None => debug!(signature = %id, "Watch task stopped by cancellation"),
        }
    }

    /// Subscribe, then wait for the single push event. The handle lands in
    /// `opened` once attached, so the task can release it whichever path wins.
    async fn push_event(
        &self,
        id: &str,
        generation: u64,
        commitment: Commitment,
        opened: &Mutex<Option<SubscriptionHandle>>,
    ) -> Option<TxOutcome> {
        let subscription = match self.ledger.subscribe_signature(id, commitment).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(
                    signature = %id,
                    error = %e,
                    "Signature subscription failed, relying on polling"
                );
                return None;
            }
        };

        let attached =
            self.registry
                .lock()
                .attach_subscription(id, generation, subscription.handle);
        if !attached {
            // Record vanished while subscribing
            self.ledger.unsubscribe(subscription.handle).await;
            return None;
        }
        *opened.lock() = Some(subscription.handle);

        subscription.events.await.ok()
    }

    /// Not-found and lookup errors are never a negative signal; only a
    /// ledger-reported error or the timeout ends a watch.
    async fn poll_until_found(
        &self,
        id: &str,
        commitment: Commitment,
        started_at: Instant,
        max_attempts: u32,
        attempts: &AtomicU32,
    ) -> Option<TxOutcome> {
        let interval = self.config.poll_interval();
        let mut ticker = tokio::time::interval_at(started_at + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for attempt in 1..=max_attempts {
            ticker.tick().await;
            attempts.store(attempt, Ordering::Relaxed);
            metrics().poll_attempts.inc();

            match self.ledger.get_transaction(id, commitment).await {
                Ok(Some(outcome)) => return Some(outcome),
                Ok(None) => {
                    debug!(signature = %id, attempt, "Transaction not found yet");
                }
                Err(e) => {
                    warn!(signature = %id, attempt, error = %e, "Poll lookup failed");
                }
            }
        }

        debug!(signature = %id, max_attempts, "Poll attempts exhausted");
        None
    }

    fn settle(&self, id: &str, generation: u64, resolution: Resolution, reporter: Reporter) {
        let status = resolution.status();
        let Some(record) = self.registry.lock().claim(id, generation, status) else {
            debug!(signature = %id, status = %status, "Watch already resolved, dropping transition");
            return;
        };

        self.resubmitter.stop(id);

        let latency = record.started_at.elapsed();
        let (outcome, path) = match resolution {
            Resolution::Landed(outcome, path) => (Some(outcome), Some(path)),
            Resolution::TimedOut => (None, None),
        };
        record_terminal(id, status, path, latency, outcome.as_ref());

        match reporter {
            Reporter::Standalone {
                display,
                on_confirmed,
                on_error,
            } => {
                let mut detail = NotificationDetail::from_display(&display);
                detail.path = path;
                detail.error = match status {
                    TxStatus::TimedOut => Some("Confirmation timed out".to_string()),
                    _ => outcome.as_ref().and_then(|o| o.err.clone()),
                };

                self.notifier.notify(Notification {
                    id: id.to_string(),
                    status,
                    is_update: true,
                    detail,
                });
                self.history.record(HistoryRecord::new(id, status, &display));

                match outcome.clone() {
                    Some(outcome) if outcome.is_success() => {
                        if let Some(callback) = on_confirmed {
                            callback(outcome);
                        }
                    }
                    outcome => {
                        if let Some(callback) = on_error {
                            callback(outcome);
                        }
                    }
                }
            }
            Reporter::Member { batch_id } => {
                self.member_settled(&batch_id, id, status, outcome.as_ref());
            }
        }

        for batch_id in &record.listeners {
            self.member_settled(batch_id, id, status, outcome.as_ref());
        }
    }

    pub(crate) fn emit_sent(&self, id: &str, display: &TxDisplay) {
        self.notifier.notify(Notification {
            id: id.to_string(),
            status: TxStatus::Pending,
            is_update: false,
            detail: NotificationDetail::from_display(display),
        });
    }
}

fn record_terminal(
    id: &str,
    status: TxStatus,
    path: Option<DetectionPath>,
    latency: Duration,
    outcome: Option<&TxOutcome>,
) {
    let m = metrics();
    m.active_watches.dec();
    m.confirmation_latency.observe(latency.as_secs_f64());
    match path {
        Some(DetectionPath::Push) => m.push_resolutions.inc(),
        Some(DetectionPath::Poll) => m.poll_resolutions.inc(),
        None => {}
    }

    let latency_ms = latency.as_millis() as u64;
    match status {
        TxStatus::Confirmed => {
            m.watches_confirmed.inc();
            info!(signature = %id, path = ?path, latency_ms, "Transaction confirmed");
        }
        TxStatus::Failed => {
            m.watches_failed.inc();
            warn!(
                signature = %id,
                path = ?path,
                latency_ms,
                error = ?outcome.and_then(|o| o.err.as_deref()),
                "Transaction failed on ledger"
            );
        }
        TxStatus::TimedOut => {
            m.watches_timed_out.inc();
            warn!(signature = %id, latency_ms, "Transaction confirmation timed out");
        }
        TxStatus::Pending => {}
    }
}
