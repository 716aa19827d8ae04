//! Periodic re-broadcast of already-signed transactions
//!
//! A transaction that has not landed yet may have been dropped by the leader
//! it was sent to. While its watch is pending the signed bytes are sent again
//! every `interval` (with jitter) until the watch stops the task.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ledger::LedgerClient;
use crate::metrics::metrics;

/// Resubmission contract used by the watchers
pub trait Resubmitter: Send + Sync {
    /// Begin re-broadcasting `signed_payload`. No-op if `id` is already active.
    fn start(&self, id: &str, signed_payload: Vec<u8>);

    /// Stop re-broadcasting. Safe to call for ids with no active task.
    fn stop(&self, id: &str);

    fn is_active(&self, id: &str) -> bool;
}

struct ResubmitTask {
    generation: u64,
    token: CancellationToken,
}

/// Resubmitter backed by [`LedgerClient::send_raw_transaction`]
pub struct ResubmissionService {
    ledger: Arc<dyn LedgerClient>,
    interval: Duration,
    max_duration: Option<Duration>,
    jitter_factor: f64,
    tasks: Arc<DashMap<String, ResubmitTask>>,
    next_generation: AtomicU64,
}

impl ResubmissionService {
    pub fn new(ledger: Arc<dyn LedgerClient>, interval: Duration) -> Self {
        Self {
            ledger,
            interval,
            max_duration: None,
            jitter_factor: 0.1,
            tasks: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Cap every task at `max_duration`, even if no watch ever stops it.
    /// Uncapped by default: a task runs until its watch terminates.
    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    fn next_delay(interval: Duration, jitter_factor: f64) -> Duration {
        if jitter_factor <= 0.0 {
            return interval;
        }
        let base = interval.as_millis() as f64;
        let jitter_range = base * jitter_factor;
        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        Duration::from_millis((base + jitter).max(1.0) as u64)
    }
}

impl Resubmitter for ResubmissionService {
    fn start(&self, id: &str, signed_payload: Vec<u8>) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        match self.tasks.entry(id.to_string()) {
            Entry::Occupied(_) => {
                debug!(signature = %id, "Resubmission already active");
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(ResubmitTask {
                    generation,
                    token: token.clone(),
                });
            }
        }
        metrics().active_resubmissions.inc();

        let ledger = self.ledger.clone();
        let tasks = self.tasks.clone();
        let interval = self.interval;
        let jitter_factor = self.jitter_factor;
        let deadline = self.max_duration.map(|d| Instant::now() + d);
        let id = id.to_string();

        tokio::spawn(async move {
            let mut broadcasts = 0u32;

            loop {
                let delay = Self::next_delay(interval, jitter_factor);
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        debug!(signature = %id, broadcasts, "Resubmission window elapsed");
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }

                match ledger.send_raw_transaction(&signed_payload).await {
                    Ok(()) => {
                        broadcasts += 1;
                        metrics().resubmissions_sent.inc();
                        debug!(signature = %id, broadcasts, "Re-broadcast signed transaction");
                    }
                    Err(e) if e.is_transient() => {
                        debug!(signature = %id, error = %e, "Re-broadcast failed, will retry");
                    }
                    Err(e) => {
                        warn!(signature = %id, error = %e, "Re-broadcast rejected");
                    }
                }
            }

            // A stop() followed by a fresh start() owns the slot by now
            if tasks
                .remove_if(&id, |_, task| task.generation == generation)
                .is_some()
            {
                metrics().active_resubmissions.dec();
            }
        });
    }

    fn stop(&self, id: &str) {
        if let Some((_, task)) = self.tasks.remove(id) {
            task.token.cancel();
            metrics().active_resubmissions.dec();
            debug!(signature = %id, "Resubmission stopped");
        }
    }

    fn is_active(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }
}
