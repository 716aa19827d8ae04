//! Solana implementation of the ledger client
//!
//! Push path: `signatureSubscribe` over the PubSub websocket.
//! Poll path: `getSignatureStatuses` over JSON-RPC.
//! Resubmission: `sendTransaction` with preflight skipped.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use solana_client::client_error::ClientError;
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_rpc_client_api::config::{RpcSendTransactionConfig, RpcSignatureSubscribeConfig};
use solana_rpc_client_api::response::RpcSignatureResult;
use solana_sdk::commitment_config::{CommitmentConfig, CommitmentLevel};
use solana_sdk::signature::Signature;
use solana_sdk::transaction::VersionedTransaction;
use solana_transaction_status::TransactionStatus;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{LedgerClient, SignatureSubscription, SubscriptionHandle};
use crate::config::RpcConfig;
use crate::errors::{LedgerError, LedgerResult};
use crate::types::{Commitment, TxOutcome};

fn commitment_config(commitment: Commitment) -> CommitmentConfig {
    let commitment = match commitment {
        Commitment::Processed => CommitmentLevel::Processed,
        Commitment::Confirmed => CommitmentLevel::Confirmed,
        Commitment::Finalized => CommitmentLevel::Finalized,
    };
    CommitmentConfig { commitment }
}

fn parse_signature(id: &str) -> LedgerResult<Signature> {
    Signature::from_str(id).map_err(|e| LedgerError::InvalidId(format!("{}: {}", id, e)))
}

/// A ledger error is terminal regardless of the requested commitment
fn outcome_from_status(
    id: &str,
    status: &TransactionStatus,
    commitment: Commitment,
) -> Option<TxOutcome> {
    if let Some(err) = &status.err {
        return Some(TxOutcome::failure(id, Some(status.slot), format!("{:?}", err)));
    }
    status
        .satisfies_commitment(commitment_config(commitment))
        .then(|| TxOutcome::success(id, Some(status.slot)))
}

/// Ledger client backed by a Solana RPC node
pub struct SolanaLedgerClient {
    rpc: Arc<RpcClient>,
    pubsub: Arc<PubsubClient>,
    endpoint: String,
    next_handle: AtomicU64,
    subscriptions: DashMap<u64, CancellationToken>,
}

impl SolanaLedgerClient {
    /// Connect both the JSON-RPC and the PubSub endpoints
    pub async fn connect(config: &RpcConfig) -> LedgerResult<Self> {
        info!(
            http_url = %config.http_url,
            ws_url = %config.ws_url,
            "Connecting ledger client"
        );

        let rpc = RpcClient::new_with_timeout(
            config.http_url.clone(),
            Duration::from_secs(config.timeout_secs),
        );
        let pubsub = PubsubClient::new(&config.ws_url)
            .await
            .map_err(|e| LedgerError::Subscription(format!("{}: {}", config.ws_url, e)))?;

        info!("Ledger client connected");

        Ok(Self {
            rpc: Arc::new(rpc),
            pubsub: Arc::new(pubsub),
            endpoint: config.http_url.clone(),
            next_handle: AtomicU64::new(1),
            subscriptions: DashMap::new(),
        })
    }

    fn rpc_error(&self, err: ClientError) -> LedgerError {
        LedgerError::Rpc {
            endpoint: Some(self.endpoint.clone()),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl LedgerClient for SolanaLedgerClient {
    async fn subscribe_signature(
        &self,
        id: &str,
        commitment: Commitment,
    ) -> LedgerResult<SignatureSubscription> {
        let signature = parse_signature(id)?;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.subscriptions.insert(handle, token.clone());

        let (events_tx, events_rx) = oneshot::channel();
        let client = self.pubsub.clone();
        let config = RpcSignatureSubscribeConfig {
            commitment: Some(commitment_config(commitment)),
            enable_received_notification: Some(false),
        };
        let id = id.to_string();

        // The stream borrows the client, so both live inside the task
        tokio::spawn(async move {
            let (mut notifications, unsubscribe) =
                match client.signature_subscribe(&signature, Some(config)).await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(signature = %id, error = %e, "Failed to subscribe to signature");
                        return;
                    }
                };

            tokio::select! {
                _ = token.cancelled() => {
                    debug!(signature = %id, "Signature subscription cancelled");
                }
                Some(response) = notifications.next() => {
                    if let RpcSignatureResult::ProcessedSignature(result) = response.value {
                        let outcome = TxOutcome {
                            id: id.clone(),
                            slot: Some(response.context.slot),
                            err: result.err.map(|e| format!("{:?}", e)),
                        };
                        let _ = events_tx.send(outcome);
                    }
                }
            }

            drop(notifications);
            unsubscribe().await;
        });

        Ok(SignatureSubscription {
            handle: SubscriptionHandle(handle),
            events: events_rx,
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        if let Some((_, token)) = self.subscriptions.remove(&handle.0) {
            token.cancel();
        }
    }

    async fn get_transaction(
        &self,
        id: &str,
        commitment: Commitment,
    ) -> LedgerResult<Option<TxOutcome>> {
        let signature = parse_signature(id)?;
        let response = self
            .rpc
            .get_signature_statuses(&[signature])
            .await
            .map_err(|e| self.rpc_error(e))?;

        Ok(response
            .value
            .into_iter()
            .next()
            .flatten()
            .and_then(|status| outcome_from_status(id, &status, commitment)))
    }

    async fn send_raw_transaction(&self, payload: &[u8]) -> LedgerResult<()> {
        let transaction: VersionedTransaction = bincode::deserialize(payload)
            .map_err(|e| LedgerError::InvalidPayload(e.to_string()))?;

        let config = RpcSendTransactionConfig {
            skip_preflight: true,
            max_retries: Some(0),
            ..RpcSendTransactionConfig::default()
        };

        self.rpc
            .send_transaction_with_config(&transaction, config)
            .await
            .map(|_| ())
            .map_err(|e| self.rpc_error(e))
    }
}
