//! Coordinator registry
//!
//! Maps transaction ids and batch ids to their live records. A record exists
//! exactly while its watch is pending: the first terminal transition removes
//! it, and every detection path checks presence (and generation) before acting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::CallbackDispatcher;
use crate::ledger::SubscriptionHandle;
use crate::types::{SubTransaction, TxDisplay, TxStatus};

/// Per-transaction tracking state
pub struct WatchRecord {
    pub id: String,
    /// Distinguishes a re-registration of the same id after cancel
    pub generation: u64,
    pub status: TxStatus,
    pub started_at: Instant,
    pub subscription: Option<SubscriptionHandle>,
    pub poll_attempts: Arc<AtomicU32>,
    pub has_signed_payload: bool,
    /// Owning batch, if this is a batch member
    pub batch_id: Option<String>,
    /// Other batches that listed this id while it was already watched
    pub listeners: Vec<String>,
    pub(crate) token: CancellationToken,
    pub(crate) task: Option<JoinHandle<()>>,
}

impl WatchRecord {
    pub fn snapshot(&self) -> WatchSnapshot {
        WatchSnapshot {
            id: self.id.clone(),
            status: self.status,
            elapsed: self.started_at.elapsed(),
            poll_attempts: self.poll_attempts.load(Ordering::Relaxed),
            has_signed_payload: self.has_signed_payload,
            subscribed: self.subscription.is_some(),
            batch_id: self.batch_id.clone(),
        }
    }
}

/// Read-only view of a pending watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSnapshot {
    pub id: String,
    pub status: TxStatus,
    pub elapsed: Duration,
    pub poll_attempts: u32,
    pub has_signed_payload: bool,
    pub subscribed: bool,
    pub batch_id: Option<String>,
}

/// Aggregate status of a set of members.
///
/// `failed` if any member failed, else `timed_out` if any timed out, else
/// `confirmed` if all confirmed, else `pending`. A pure fold, so member
/// arrival order never changes the result.
pub fn aggregate_status<I>(statuses: I) -> TxStatus
where
    I: IntoIterator<Item = TxStatus>,
{
    let mut any_timed_out = false;
    let mut all_confirmed = true;

    for status in statuses {
        match status {
            TxStatus::Failed => return TxStatus::Failed,
            TxStatus::TimedOut => any_timed_out = true,
            TxStatus::Pending => all_confirmed = false,
            TxStatus::Confirmed => {}
        }
    }

    if any_timed_out {
        TxStatus::TimedOut
    } else if all_confirmed {
        TxStatus::Confirmed
    } else {
        TxStatus::Pending
    }
}

/// Per-batch tracking state
pub struct BatchRecord {
    pub id: String,
    /// Display order, fixed at creation
    pub members: Vec<String>,
    pub member_status: HashMap<String, TxStatus>,
    pub aggregate_status: TxStatus,
    pub terminal_latched: bool,
    pub display: TxDisplay,
    pub started_at: Instant,
    pub(crate) dispatcher: CallbackDispatcher,
    pub(crate) timeout_token: CancellationToken,
}

impl BatchRecord {
    pub(crate) fn new(
        id: String,
        members: Vec<String>,
        display: TxDisplay,
        dispatcher: CallbackDispatcher,
    ) -> Self {
        let member_status = members
            .iter()
            .map(|m| (m.clone(), TxStatus::Pending))
            .collect();
        Self {
            id,
            members,
            member_status,
            aggregate_status: TxStatus::Pending,
            terminal_latched: false,
            display,
            started_at: Instant::now(),
            dispatcher,
            timeout_token: CancellationToken::new(),
        }
    }

    /// Record a member transition and recompute the aggregate.
    ///
    /// Unknown members and transitions out of a terminal status are ignored.
    pub fn apply(&mut self, member: &str, status: TxStatus) -> TxStatus {
        if let Some(current) = self.member_status.get_mut(member) {
            if !current.is_terminal() {
                *current = status;
            }
        }
        self.aggregate_status = aggregate_status(self.member_status.values().copied());
        self.aggregate_status
    }

    /// Members in display order with their last known status
    pub fn snapshot(&self) -> Vec<SubTransaction> {
        self.members
            .iter()
            .map(|id| {
                let status = self
                    .member_status
                    .get(id)
                    .copied()
                    .unwrap_or(TxStatus::Pending);
                SubTransaction::new(id.clone(), status)
            })
            .collect()
    }

    pub fn pending_members(&self) -> Vec<String> {
        self.members
            .iter()
            .filter(|id| self.member_status.get(*id) == Some(&TxStatus::Pending))
            .cloned()
            .collect()
    }
}

/// Live watch and batch records
#[derive(Default)]
pub struct Registry {
    watches: HashMap<String, WatchRecord>,
    batches: HashMap<String, BatchRecord>,
    next_generation: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_watch(&self, id: &str) -> bool {
        self.watches.contains_key(id)
    }

    pub fn contains_batch(&self, id: &str) -> bool {
        self.batches.contains_key(id)
    }

    /// Insert a pending record unless one is already active.
    ///
    /// Returns the new record's generation, or `None` for a duplicate.
    pub(crate) fn try_register(
        &mut self,
        id: &str,
        has_signed_payload: bool,
        batch_id: Option<String>,
        token: CancellationToken,
    ) -> Option<(u64, Arc<AtomicU32>, Instant)> {
        if self.watches.contains_key(id) {
            return None;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let poll_attempts = Arc::new(AtomicU32::new(0));
        let started_at = Instant::now();

        self.watches.insert(
            id.to_string(),
            WatchRecord {
                id: id.to_string(),
                generation,
                status: TxStatus::Pending,
                started_at,
                subscription: None,
                poll_attempts: poll_attempts.clone(),
                has_signed_payload,
                batch_id,
                listeners: Vec::new(),
                token,
                task: None,
            },
        );

        Some((generation, poll_attempts, started_at))
    }

    fn live_mut(&mut self, id: &str, generation: u64) -> Option<&mut WatchRecord> {
        self.watches
            .get_mut(id)
            .filter(|record| record.generation == generation)
    }

    pub(crate) fn attach_task(&mut self, id: &str, generation: u64, task: JoinHandle<()>) {
        if let Some(record) = self.live_mut(id, generation) {
            record.task = Some(task);
        }
    }

    pub(crate) fn attach_subscription(
        &mut self,
        id: &str,
        generation: u64,
        handle: SubscriptionHandle,
    ) -> bool {
        match self.live_mut(id, generation) {
            Some(record) => {
                record.subscription = Some(handle);
                true
            }
            None => false,
        }
    }

    /// First-wins check-and-set: move a live pending record to `status` and
    /// remove it. `None` if another path (or a cancel) got there first.
    pub(crate) fn claim(
        &mut self,
        id: &str,
        generation: u64,
        status: TxStatus,
    ) -> Option<WatchRecord> {
        let record = self.live_mut(id, generation)?;
        if record.status.is_terminal() {
            return None;
        }
        record.status = status;
        self.watches.remove(id)
    }

    pub(crate) fn remove_watch(&mut self, id: &str) -> Option<WatchRecord> {
        self.watches.remove(id)
    }

    /// Let `batch_id` follow an already watched id. `false` if the id is not
    /// watched, or the batch already follows it.
    pub(crate) fn add_listener(&mut self, id: &str, batch_id: &str) -> bool {
        let Some(record) = self.watches.get_mut(id) else {
            return false;
        };
        if record.batch_id.as_deref() == Some(batch_id)
            || record.listeners.iter().any(|b| b == batch_id)
        {
            return false;
        }
        record.listeners.push(batch_id.to_string());
        true
    }

    /// Remove `id` only if the live record belongs to `batch_id` and no other
    /// batch still follows it
    pub(crate) fn remove_member(&mut self, id: &str, batch_id: &str) -> Option<WatchRecord> {
        let owned = self.watches.get(id).is_some_and(|record| {
            record.batch_id.as_deref() == Some(batch_id) && record.listeners.is_empty()
        });
        if owned {
            self.watches.remove(id)
        } else {
            None
        }
    }

    pub fn watch(&self, id: &str) -> Option<&WatchRecord> {
        self.watches.get(id)
    }

    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    pub fn watch_ids(&self) -> Vec<String> {
        self.watches.keys().cloned().collect()
    }

    pub(crate) fn insert_batch(&mut self, batch: BatchRecord) -> bool {
        if self.batches.contains_key(&batch.id) {
            return false;
        }
        self.batches.insert(batch.id.clone(), batch);
        true
    }

    pub fn batch(&self, id: &str) -> Option<&BatchRecord> {
        self.batches.get(id)
    }

    pub(crate) fn batch_mut(&mut self, id: &str) -> Option<&mut BatchRecord> {
        self.batches.get_mut(id)
    }

    pub(crate) fn remove_batch(&mut self, id: &str) -> Option<BatchRecord> {
        self.batches.remove(id)
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }
}
