//! Notification sinks
//!
//! The coordinator writes every status transition to a [`Notifier`]. Rendering
//! belongs to whoever consumes the events.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::types::Notification;

/// Consumer of status-transition events.
///
/// Called from inside the coordinator's critical section for batch updates,
/// so implementations must not block or call back into the coordinator.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Forwards notifications to an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            debug!("Notification receiver dropped");
        }
    }
}

/// Logs notifications at their own level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, n: Notification) {
        if n.level() == tracing::Level::WARN {
            warn!(
                id = %n.id,
                status = %n.status,
                is_update = n.is_update,
                error = ?n.detail.error,
                "Transaction notification"
            );
        } else {
            info!(
                id = %n.id,
                status = %n.status,
                is_update = n.is_update,
                members = n.detail.sub_transactions.len(),
                "Transaction notification"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NotificationDetail, TxStatus};

    fn notification(status: TxStatus) -> Notification {
        Notification {
            id: "sig".to_string(),
            status,
            is_update: true,
            detail: NotificationDetail::default(),
        }
    }

    #[tokio::test]
    async fn test_channel_notifier_forwards_in_order() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier.notify(notification(TxStatus::Pending));
        notifier.notify(notification(TxStatus::Confirmed));

        assert_eq!(rx.recv().await.unwrap().status, TxStatus::Pending);
        assert_eq!(rx.recv().await.unwrap().status, TxStatus::Confirmed);
    }

    #[test]
    fn test_channel_notifier_survives_dropped_receiver() {
        let (notifier, rx) = ChannelNotifier::new();
        drop(rx);
        notifier.notify(notification(TxStatus::Failed));
    }
}
