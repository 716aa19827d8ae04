//! Transaction history sink
//!
//! History is append-only: the coordinator writes the latest snapshot for a
//! key every time it changes, and readers take the last write per key.

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::types::HistoryRecord;

/// Consumer of immutable history records.
///
/// Batch history is written from inside the coordinator's critical section,
/// so implementations must not block or call back into the coordinator.
/// Hand slow persistence off to a task or channel.
pub trait HistoryStore: Send + Sync {
    fn record(&self, record: HistoryRecord);
}

/// In-memory history keeping the full append log and the latest record per key
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    log: Mutex<Vec<HistoryRecord>>,
    latest: DashMap<String, HistoryRecord>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest record for a transaction or batch id
    pub fn get(&self, key: &str) -> Option<HistoryRecord> {
        self.latest.get(key).map(|r| r.clone())
    }

    /// Every write, in order
    pub fn records(&self) -> Vec<HistoryRecord> {
        self.log.lock().clone()
    }

    /// Number of writes for one key
    pub fn writes_for(&self, key: &str) -> usize {
        self.log.lock().iter().filter(|r| r.key == key).count()
    }

    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().is_empty()
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn record(&self, record: HistoryRecord) {
        self.latest.insert(record.key.clone(), record.clone());
        self.log.lock().push(record);
    }
}
