//! Shared fixtures for the coordinator integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use txwatch::{
    Commitment, Coordinator, InMemoryHistoryStore, LedgerClient, LedgerError, LedgerResult,
    Notification, Notifier, ResubmissionService, SignatureSubscription, SubscriptionHandle,
    TxOutcome, WatcherConfig,
};

#[derive(Default)]
struct LedgerState {
    next_handle: u64,
    /// Open subscriptions per signature
    subscribers: HashMap<String, Vec<(u64, oneshot::Sender<TxOutcome>)>>,
    /// Transactions visible to `get_transaction`
    landed: HashMap<String, TxOutcome>,
    fail_subscribe: HashSet<String>,
    /// Holds every subscribe call this long before it answers
    subscribe_delay: Option<Duration>,
    fail_polls: bool,
    subscribe_calls: HashMap<String, usize>,
    poll_calls: HashMap<String, usize>,
    unsubscribes: usize,
    raw_sends: usize,
}

/// Scripted in-memory ledger.
///
/// Nothing happens on its own: tests deliver push events with [`push`] and
/// make transactions visible to the poll path with [`land`].
///
/// [`push`]: MockLedger::push
/// [`land`]: MockLedger::land
#[derive(Default)]
pub struct MockLedger {
    state: Mutex<LedgerState>,
}

impl MockLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver a push event to an open subscription. `false` if none is open.
    pub fn push(&self, outcome: TxOutcome) -> bool {
        let sender = {
            let mut state = self.state.lock();
            state
                .subscribers
                .get_mut(&outcome.id)
                .and_then(|subs| (!subs.is_empty()).then(|| subs.remove(0)))
        };
        match sender {
            Some((_, tx)) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Make a transaction visible to the poll path
    pub fn land(&self, outcome: TxOutcome) {
        self.state.lock().landed.insert(outcome.id.clone(), outcome);
    }

    pub fn fail_subscriptions(&self, id: &str) {
        self.state.lock().fail_subscribe.insert(id.to_string());
    }

    pub fn delay_subscriptions(&self, delay: Duration) {
        self.state.lock().subscribe_delay = Some(delay);
    }

    pub fn fail_polls(&self, fail: bool) {
        self.state.lock().fail_polls = fail;
    }

    pub fn subscribe_calls(&self, id: &str) -> usize {
        self.state.lock().subscribe_calls.get(id).copied().unwrap_or(0)
    }

    pub fn poll_calls(&self, id: &str) -> usize {
        self.state.lock().poll_calls.get(id).copied().unwrap_or(0)
    }

    pub fn open_subscriptions(&self, id: &str) -> usize {
        self.state.lock().subscribers.get(id).map_or(0, Vec::len)
    }

    pub fn unsubscribes(&self) -> usize {
        self.state.lock().unsubscribes
    }

    pub fn raw_sends(&self) -> usize {
        self.state.lock().raw_sends
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn subscribe_signature(
        &self,
        id: &str,
        _commitment: Commitment,
    ) -> LedgerResult<SignatureSubscription> {
        let delay = {
            let mut state = self.state.lock();
            *state.subscribe_calls.entry(id.to_string()).or_default() += 1;
            state.subscribe_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.fail_subscribe.contains(id) {
            return Err(LedgerError::Subscription("websocket closed".to_string()));
        }

        state.next_handle += 1;
        let handle = state.next_handle;
        let (tx, rx) = oneshot::channel();
        state
            .subscribers
            .entry(id.to_string())
            .or_default()
            .push((handle, tx));

        Ok(SignatureSubscription {
            handle: SubscriptionHandle(handle),
            events: rx,
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut state = self.state.lock();
        state.unsubscribes += 1;
        for subs in state.subscribers.values_mut() {
            subs.retain(|(h, _)| *h != handle.0);
        }
    }

    async fn get_transaction(
        &self,
        id: &str,
        _commitment: Commitment,
    ) -> LedgerResult<Option<TxOutcome>> {
        let mut state = self.state.lock();
        *state.poll_calls.entry(id.to_string()).or_default() += 1;

        if state.fail_polls {
            return Err(LedgerError::Rpc {
                endpoint: None,
                message: "node behind".to_string(),
            });
        }
        Ok(state.landed.get(id).cloned())
    }

    async fn send_raw_transaction(&self, _payload: &[u8]) -> LedgerResult<()> {
        self.state.lock().raw_sends += 1;
        Ok(())
    }
}

/// Keeps every notification in arrival order
#[derive(Default)]
pub struct RecordingNotifier {
    log: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn all(&self) -> Vec<Notification> {
        self.log.lock().clone()
    }

    pub fn for_id(&self, id: &str) -> Vec<Notification> {
        self.log.lock().iter().filter(|n| n.id == id).cloned().collect()
    }

    pub fn terminal_for(&self, id: &str) -> Vec<Notification> {
        self.for_id(id)
            .into_iter()
            .filter(|n| n.status.is_terminal())
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.log.lock().push(notification);
    }
}

/// Counts invocations of a zero-argument callback
#[derive(Clone, Default)]
pub struct Calls(Arc<AtomicUsize>);

impl Calls {
    pub fn hook(&self) -> impl FnOnce() + Send + 'static {
        let count = self.0.clone();
        move || {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Captures the argument of every invocation of a one-argument callback
pub struct Captured<T>(Arc<Mutex<Vec<T>>>);

impl<T> Clone for Captured<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Default for Captured<T> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }
}

impl<T: Clone + Send + 'static> Captured<T> {
    pub fn hook(&self) -> impl FnOnce(T) + Send + 'static {
        let values = self.0.clone();
        move |value| values.lock().push(value)
    }

    pub fn values(&self) -> Vec<T> {
        self.0.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.0.lock().len()
    }
}

pub const POLL_INTERVAL: Duration = Duration::from_millis(2_000);
pub const TIMEOUT: Duration = Duration::from_millis(120_000);

/// Coordinator wired to scripted collaborators
pub struct Harness {
    pub ledger: Arc<MockLedger>,
    pub notifier: Arc<RecordingNotifier>,
    pub history: Arc<InMemoryHistoryStore>,
    pub resubmitter: Arc<ResubmissionService>,
    pub coordinator: Coordinator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(WatcherConfig::default())
    }

    pub fn with_config(config: WatcherConfig) -> Self {
        let ledger = MockLedger::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let history = Arc::new(InMemoryHistoryStore::new());
        let resubmitter = Arc::new(
            ResubmissionService::new(ledger.clone(), config.resubmit_interval()).with_jitter(0.0),
        );
        let coordinator = Coordinator::new(
            config,
            ledger.clone(),
            resubmitter.clone(),
            notifier.clone(),
            history.clone(),
        )
        .expect("valid config");

        Self {
            ledger,
            notifier,
            history,
            resubmitter,
            coordinator,
        }
    }
}

/// Advance the paused clock to `at` after the test started
pub async fn advance_to(start: tokio::time::Instant, at: Duration) {
    tokio::time::sleep_until(start + at).await;
}

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}
