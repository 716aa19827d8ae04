//! Ledger client seam
//!
//! The coordinator only needs three things from a node: a signature
//! subscription (push path), a by-id lookup (poll path) and raw submission
//! (resubmission). Authentication and connection management belong to the
//! implementation.

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::errors::LedgerResult;
use crate::types::{Commitment, TxOutcome};

pub mod solana;

pub use solana::SolanaLedgerClient;

/// Opaque handle of an open signature subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// An open signature subscription.
///
/// At most one event is delivered. If the sender side is dropped without
/// sending, the push path is treated as missed and the watch keeps polling.
#[derive(Debug)]
pub struct SignatureSubscription {
    pub handle: SubscriptionHandle,
    pub events: oneshot::Receiver<TxOutcome>,
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Subscribe to the status of a signature at the given commitment
    async fn subscribe_signature(
        &self,
        id: &str,
        commitment: Commitment,
    ) -> LedgerResult<SignatureSubscription>;

    /// Release a subscription. Unknown handles are ignored.
    async fn unsubscribe(&self, handle: SubscriptionHandle);

    /// Look a transaction up by id. `Ok(None)` means "not landed yet".
    async fn get_transaction(
        &self,
        id: &str,
        commitment: Commitment,
    ) -> LedgerResult<Option<TxOutcome>>;

    /// Broadcast an already-signed transaction
    async fn send_raw_transaction(&self, payload: &[u8]) -> LedgerResult<()>;
}
