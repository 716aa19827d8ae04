//! Idempotent lifecycle callback dispatcher
//!
//! Fed the full member snapshot every time any member changes, and fires each
//! of `on_sent`, `on_confirmed`, `on_error` and `on_finally` at most once over
//! the whole sequence of snapshots:
//!
//! - any member failed (or timed out): `on_error` + `on_finally`, and nothing
//!   else is evaluated for that snapshot
//! - every expected member has an id: `on_sent` + `on_finally`
//! - every expected member is confirmed: `on_confirmed`

use crate::types::{Callback, SubTransaction, TxStatus};

pub struct CallbackDispatcher {
    expected_count: usize,
    sent_fired: bool,
    confirmed_fired: bool,
    error_fired: bool,
    finally_fired: bool,
    on_sent: Option<Callback>,
    on_confirmed: Option<Callback>,
    on_error: Option<Callback>,
    on_finally: Option<Callback>,
}

impl CallbackDispatcher {
    pub fn new(expected_count: usize) -> Self {
        Self {
            expected_count,
            sent_fired: false,
            confirmed_fired: false,
            error_fired: false,
            finally_fired: false,
            on_sent: None,
            on_confirmed: None,
            on_error: None,
            on_finally: None,
        }
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

    pub(crate) fn with_callbacks(
        mut self,
        on_sent: Option<Callback>,
        on_confirmed: Option<Callback>,
        on_error: Option<Callback>,
        on_finally: Option<Callback>,
    ) -> Self {
        self.on_sent = on_sent;
        self.on_confirmed = on_confirmed;
        self.on_error = on_error;
        self.on_finally = on_finally;
        self
    }

    /// Evaluate a snapshot and run whatever callbacks it newly triggers
    pub fn dispatch(&mut self, snapshot: &[SubTransaction]) {
        for callback in self.collect(snapshot) {
            callback();
        }
    }

    /// Evaluate a snapshot, latch, and hand back the triggered callbacks
    /// without running them (callers holding a lock run them afterwards).
    pub(crate) fn collect(&mut self, snapshot: &[SubTransaction]) -> Vec<Callback> {
        let mut fired = Vec::new();

        if snapshot.iter().any(|s| s.status.is_failure()) {
            if !self.error_fired {
                self.error_fired = true;
                fired.extend(self.on_error.take());
            }
            self.latch_finally(&mut fired);
            return fired;
        }

        let sent = snapshot.iter().filter(|s| !s.id.is_empty()).count();
        if sent == self.expected_count && !self.sent_fired {
            self.sent_fired = true;
            fired.extend(self.on_sent.take());
            self.latch_finally(&mut fired);
        }

        let confirmed = snapshot
            .iter()
            .filter(|s| s.status == TxStatus::Confirmed)
            .count();
        if confirmed == self.expected_count && !self.confirmed_fired {
            self.confirmed_fired = true;
            fired.extend(self.on_confirmed.take());
        }

        fired
    }

    fn latch_finally(&mut self, fired: &mut Vec<Callback>) {
        if !self.finally_fired {
            self.finally_fired = true;
            fired.extend(self.on_finally.take());
        }
    }

    pub fn sent_fired(&self) -> bool {
        self.sent_fired
    }

    pub fn confirmed_fired(&self) -> bool {
        self.confirmed_fired
    }

    pub fn error_fired(&self) -> bool {
        self.error_fired
    }

    pub fn finally_fired(&self) -> bool {
        self.finally_fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn recording_dispatcher(expected: usize) -> (CallbackDispatcher, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c, d) = (log.clone(), log.clone(), log.clone(), log.clone());
        let dispatcher = CallbackDispatcher::new(expected)
            .on_sent(move || a.lock().push("sent"))
            .on_confirmed(move || b.lock().push("confirmed"))
            .on_error(move || c.lock().push("error"))
            .on_finally(move || d.lock().push("finally"));
        (dispatcher, log)
    }

    fn snap(entries: &[(&str, TxStatus)]) -> Vec<SubTransaction> {
        entries
            .iter()
            .map(|(id, status)| SubTransaction::new(*id, *status))
            .collect()
    }

    #[test]
    fn test_confirmed_fires_once_after_last_member() {
        use TxStatus::*;
        let (mut d, log) = recording_dispatcher(2);

        d.dispatch(&snap(&[("a", Pending), ("b", Pending)]));
        assert_eq!(*log.lock(), vec!["sent", "finally"]);

        d.dispatch(&snap(&[("a", Confirmed), ("b", Pending)]));
        assert!(!d.confirmed_fired());

        d.dispatch(&snap(&[("a", Confirmed), ("b", Confirmed)]));
        d.dispatch(&snap(&[("a", Confirmed), ("b", Confirmed)]));
        assert_eq!(*log.lock(), vec!["sent", "finally", "confirmed"]);
    }

    #[test]
    fn test_failure_short_circuits_success() {
        use TxStatus::*;
        let (mut d, log) = recording_dispatcher(2);

        d.dispatch(&snap(&[("a", Confirmed), ("", Pending)]));
        d.dispatch(&snap(&[("a", Confirmed), ("b", Failed)]));
        d.dispatch(&snap(&[("a", Confirmed), ("b", Failed)]));

        assert_eq!(*log.lock(), vec!["error", "finally"]);
        assert!(!d.confirmed_fired());
        assert!(!d.sent_fired());
    }

    #[test]
    fn test_sent_waits_for_every_id() {
        use TxStatus::*;
        let (mut d, log) = recording_dispatcher(3);

        d.dispatch(&snap(&[("a", Pending), ("", Pending), ("", Pending)]));
        d.dispatch(&snap(&[("a", Pending), ("b", Pending), ("", Pending)]));
        assert!(log.lock().is_empty());

        d.dispatch(&snap(&[("a", Pending), ("b", Pending), ("c", Pending)]));
        assert_eq!(*log.lock(), vec!["sent", "finally"]);
    }

    #[test]
    fn test_timed_out_member_counts_as_failure() {
        use TxStatus::*;
        let (mut d, log) = recording_dispatcher(1);
        d.dispatch(&snap(&[("a", TimedOut)]));
        assert_eq!(*log.lock(), vec!["error", "finally"]);
    }

    #[test]
    fn test_missing_callbacks_still_latch() {
        let mut d = CallbackDispatcher::new(1);
        d.dispatch(&snap(&[("a", TxStatus::Confirmed)]));
        assert!(d.sent_fired());
        assert!(d.confirmed_fired());
        assert!(d.finally_fired());
        assert!(!d.error_fired());
    }

    fn status_strategy() -> impl Strategy<Value = TxStatus> {
        prop_oneof![
            Just(TxStatus::Pending),
            Just(TxStatus::Confirmed),
            Just(TxStatus::Failed),
        ]
    }

    proptest! {
        /// Monotonic snapshot sequences never fire a callback twice
        #[test]
        fn prop_each_callback_fires_at_most_once(
            finals in prop::collection::vec(status_strategy(), 1..6),
            steps in prop::collection::vec(0usize..6, 1..20),
        ) {
            let n = finals.len();
            let (mut d, log) = recording_dispatcher(n);
            let mut current = vec![SubTransaction::new("", TxStatus::Pending); n];

            for step in steps {
                let i = step % n;
                if current[i].id.is_empty() {
                    current[i].id = format!("tx{}", i);
                } else if current[i].status == TxStatus::Pending {
                    current[i].status = finals[i];
                }
                d.dispatch(&current);
            }

            let log = log.lock();
            for name in ["sent", "confirmed", "error", "finally"] {
                prop_assert!(log.iter().filter(|e| **e == name).count() <= 1);
            }
            if log.contains(&"error") {
                prop_assert!(!log.contains(&"confirmed"));
            }
        }
    }
}
