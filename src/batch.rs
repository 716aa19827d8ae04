//! Batch watcher: one aggregate status over several member watches.
//!
//! Members run as ordinary watches with [`Reporter::Member`], so they emit no
//! notifications of their own. Every member transition folds into the batch
//! record, re-emits the aggregate, rewrites the batch history entry and feeds
//! the full snapshot to the batch's [`CallbackDispatcher`].
//!
//! A member id that is already being watched is not registered twice; the
//! batch follows the existing watch as a listener instead.

use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::CallbackDispatcher;
use crate::metrics::metrics;
use crate::registry::{BatchRecord, Registry, WatchRecord};
use crate::types::{
    BatchMember, BatchOptions, HistoryRecord, Notification, NotificationDetail, SubTransaction,
    TxDisplay, TxOutcome, TxStatus, WatchRegistration,
};
use crate::watcher::{Coordinator, Inner, Reporter, WatchRequest};

impl Coordinator {
    /// Track a group of transactions that make up one logical operation.
    ///
    /// The batch latches at its first terminal aggregate: any member failure,
    /// all members confirmed, or the batch timeout. Remaining member watches
    /// are released at that point.
    pub fn watch_batch(
        &self,
        batch_id: impl Into<String>,
        members: Vec<BatchMember>,
        options: BatchOptions,
    ) -> WatchRegistration {
        let batch_id = batch_id.into();
        let BatchOptions {
            skip_watch,
            commitment,
            timeout,
            display,
            on_sent,
            on_confirmed,
            on_error,
            on_finally,
        } = options;
        let inner = &self.inner;

        let ids: Vec<String> = members.iter().map(|m| m.id.clone()).collect();
        let initial: Vec<SubTransaction> = ids
            .iter()
            .map(|id| SubTransaction::new(id.clone(), TxStatus::Pending))
            .collect();
        let mut dispatcher = CallbackDispatcher::new(ids.len()).with_callbacks(
            on_sent,
            on_confirmed,
            on_error,
            on_finally,
        );

        if skip_watch || members.is_empty() {
            inner.emit_batch(&batch_id, TxStatus::Pending, false, &display, &initial, None);
            dispatcher.dispatch(&initial);
            debug!(batch_id = %batch_id, "Fire-and-forget batch, not tracking");
            return WatchRegistration::Detached;
        }

        let commitment = commitment.unwrap_or(inner.config.commitment);
        let timeout = timeout.unwrap_or_else(|| inner.config.timeout());
        let sent_callbacks = dispatcher.collect(&initial);
        let record = BatchRecord::new(batch_id.clone(), ids, display.clone(), dispatcher);
        let timeout_token = record.timeout_token.clone();
        let deadline = Instant::now() + timeout;

        // Members are registered together with the batch so a cancel or an
        // early latch always sees the full set.
        let registrations = {
            let mut registry = inner.registry.lock();
            if !registry.insert_batch(record) {
                drop(registry);
                metrics().duplicate_registrations.inc();
                debug!(batch_id = %batch_id, "Batch already watched, ignoring duplicate request");
                return WatchRegistration::AlreadyWatching;
            }

            let mut registrations = Vec::with_capacity(members.len());
            for member in members {
                if member.id.is_empty() {
                    warn!(batch_id = %batch_id, "Batch member without an id, left pending");
                    continue;
                }
                match inner.register_locked(
                    &mut registry,
                    &member.id,
                    member.signed_payload,
                    Some(batch_id.clone()),
                ) {
                    Some(registration) => registrations.push((member.id, registration)),
                    None => {
                        registry.add_listener(&member.id, &batch_id);
                        debug!(
                            batch_id = %batch_id,
                            signature = %member.id,
                            "Batch member already watched, following the existing watch"
                        );
                    }
                }
            }
            registrations
        };

        metrics().batches_started.inc();
        metrics().active_batches.inc();
        info!(
            batch_id = %batch_id,
            members = initial.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Watching batch"
        );

        inner.emit_batch(&batch_id, TxStatus::Pending, false, &display, &initial, None);
        for callback in sent_callbacks {
            callback();
        }

        tokio::spawn(
            inner
                .clone()
                .run_batch_timer(batch_id.clone(), timeout_token, deadline),
        );

        for (id, registration) in registrations {
            let request = WatchRequest {
                id,
                commitment,
                timeout,
                reporter: Reporter::Member {
                    batch_id: batch_id.clone(),
                },
            };
            inner.spawn_watch(request, registration);
        }

        WatchRegistration::Watching
    }

    pub fn batch_snapshot(&self, batch_id: &str) -> Option<Vec<SubTransaction>> {
        self.inner
            .registry
            .lock()
            .batch(batch_id)
            .map(BatchRecord::snapshot)
    }
}

impl Inner {
    /// Fold one member's terminal status into its batch
    pub(crate) fn member_settled(
        &self,
        batch_id: &str,
        member_id: &str,
        status: TxStatus,
        outcome: Option<&TxOutcome>,
    ) {
        let (released, callbacks) = {
            let mut registry = self.registry.lock();
            let Some(batch) = registry.batch_mut(batch_id) else {
                debug!(batch_id = %batch_id, signature = %member_id, "Batch already closed, ignoring member");
                return;
            };

            let aggregate = batch.apply(member_id, status);
            let snapshot = batch.snapshot();
            let error = match status {
                TxStatus::TimedOut => Some(format!("{} timed out", member_id)),
                _ => outcome.and_then(|o| o.err.clone()),
            };
            debug!(
                batch_id = %batch_id,
                signature = %member_id,
                member_status = %status,
                aggregate = %aggregate,
                "Batch member settled"
            );

            // Emitted under the lock so updates reach the notifier in order
            self.emit_batch(batch_id, aggregate, true, &batch.display, &snapshot, error);
            let callbacks = batch.dispatcher.collect(&snapshot);

            if !aggregate.is_terminal() {
                (Vec::new(), callbacks)
            } else {
                batch.terminal_latched = true;
                log_batch_terminal(batch_id, aggregate, batch.started_at);
                let released = self.close_batch(&mut registry, batch_id).unwrap_or_default();
                (released, callbacks)
            }
        };

        for record in released {
            drop(self.release(record));
        }
        for callback in callbacks {
            callback();
        }
    }

    /// Remove a batch, stop its timer and detach the member watches it still
    /// owns. Members another batch follows keep running. `None` if no such
    /// batch is active.
    pub(crate) fn close_batch(
        &self,
        registry: &mut Registry,
        batch_id: &str,
    ) -> Option<Vec<WatchRecord>> {
        let batch = registry.remove_batch(batch_id)?;
        batch.timeout_token.cancel();
        metrics().active_batches.dec();

        Some(
            batch
                .pending_members()
                .iter()
                .filter_map(|id| registry.remove_member(id, batch_id))
                .collect(),
        )
    }

    async fn run_batch_timer(
        self: Arc<Self>,
        batch_id: String,
        token: CancellationToken,
        deadline: Instant,
    ) {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {}
        }
        self.force_close(&batch_id);
    }

    /// Batch deadline reached with members still pending
    fn force_close(&self, batch_id: &str) {
        let (released, callbacks) = {
            let mut registry = self.registry.lock();
            let Some(batch) = registry.batch_mut(batch_id) else {
                return;
            };
            if batch.terminal_latched {
                return;
            }
            batch.terminal_latched = true;

            let pending = batch.pending_members();
            for id in &pending {
                batch.apply(id, TxStatus::TimedOut);
            }
            let snapshot = batch.snapshot();
            log_batch_terminal(batch_id, TxStatus::TimedOut, batch.started_at);

            self.emit_batch(
                batch_id,
                TxStatus::TimedOut,
                true,
                &batch.display,
                &snapshot,
                Some(format!("{} member(s) unconfirmed at deadline", pending.len())),
            );
            let callbacks = batch.dispatcher.collect(&snapshot);

            let released = self.close_batch(&mut registry, batch_id).unwrap_or_default();
            (released, callbacks)
        };

        for record in released {
            metrics().watches_timed_out.inc();
            drop(self.release(record));
        }
        for callback in callbacks {
            callback();
        }
    }

    pub(crate) fn emit_batch(
        &self,
        batch_id: &str,
        status: TxStatus,
        is_update: bool,
        display: &TxDisplay,
        snapshot: &[SubTransaction],
        error: Option<String>,
    ) {
        let mut detail = NotificationDetail::from_display(display);
        detail.error = error;
        detail.sub_transactions = snapshot.to_vec();

        self.notifier.notify(Notification {
            id: batch_id.to_string(),
            status,
            is_update,
            detail,
        });
        self.history.record(
            HistoryRecord::new(batch_id, status, display).with_sub_transactions(snapshot.to_vec()),
        );
    }
}

fn log_batch_terminal(batch_id: &str, status: TxStatus, started_at: Instant) {
    let elapsed_ms = started_at.elapsed().as_millis() as u64;
    match status {
        TxStatus::Confirmed => info!(batch_id = %batch_id, elapsed_ms, "Batch confirmed"),
        _ => warn!(batch_id = %batch_id, status = %status, elapsed_ms, "Batch ended unsuccessfully"),
    }
}
