//! txwatch - watch submitted Solana transactions until they settle
//!
//! Registers each signature given on the command line (or all of them as one
//! batch with `--batch`), prints every status notification as a JSON line and
//! finishes with a summary of the recorded history.

// Compiler warning configuration
#![deny(unused_imports)]
#![deny(unused_mut)]
#![deny(unused_variables)]
#![warn(dead_code)]
#![warn(unused_must_use)]

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use txwatch::endpoints;
use txwatch::{
    BatchMember, BatchOptions, ChannelNotifier, Config, Coordinator, InMemoryHistoryStore,
    LedgerClient, Notification, ResubmissionService, SolanaLedgerClient, TxDisplay,
    WatchOptions, WatchRegistration,
};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Override the confirmation timeout
    #[arg(long, env = "TXWATCH_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Watch all signatures as one batch with this id
    #[arg(long, value_name = "ID")]
    batch: Option<String>,

    /// Metrics port (defaults to the configured one)
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Transaction signatures to watch
    #[arg(required = true)]
    signatures: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose, args.json_logs)?;

    // Correlates every log line of this invocation
    let run_id = Uuid::new_v4();
    run(args).instrument(info_span!("run", run_id = %run_id)).await
}

async fn run(args: Args) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "Starting txwatch");

    let mut config = load_config(&args.config)?;
    if let Some(timeout_ms) = args.timeout_ms {
        config.watcher.timeout_ms = timeout_ms;
    }
    config.validate().context("Invalid configuration")?;

    if config.monitoring.enable_metrics {
        let metrics_port = args.metrics_port.unwrap_or(config.monitoring.metrics_port);
        info!(port = metrics_port, "Starting metrics server");
        tokio::spawn(async move {
            if let Err(e) = endpoints::endpoint_server(metrics_port).await {
                error!(error = %e, "Metrics server error");
            }
        });
    }

    info!(rpc = %config.rpc.http_url, ws = %config.rpc.ws_url, "Connecting to ledger");
    let ledger: Arc<dyn LedgerClient> = Arc::new(
        SolanaLedgerClient::connect(&config.rpc)
            .await
            .context("Failed to connect to ledger")?,
    );

    let resubmitter = Arc::new(ResubmissionService::new(
        ledger.clone(),
        config.watcher.resubmit_interval(),
    ));
    let (notifier, notifications) = ChannelNotifier::new();
    let history = Arc::new(InMemoryHistoryStore::new());

    let coordinator = Coordinator::new(
        config.watcher.clone(),
        ledger,
        resubmitter,
        Arc::new(notifier),
        history.clone(),
    )?;

    let outstanding = register(&coordinator, &args);
    if outstanding.is_empty() {
        bail!("Nothing to watch");
    }

    run_event_loop(&coordinator, notifications, outstanding).await;

    println!();
    println!("{:<90} {:<10} {}", "KEY", "STATUS", "RECORDED");
    let mut keys = HashSet::new();
    for record in history.records().into_iter().rev() {
        if keys.insert(record.key.clone()) {
            println!(
                "{:<90} {:<10} {}",
                record.key,
                record.status.as_str(),
                record.recorded_at.to_rfc3339()
            );
        }
    }

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let env_filter = if verbose {
        "txwatch=debug,info"
    } else {
        "txwatch=info,warn,error"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| env_filter.into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()?;
    }

    Ok(())
}

/// Load configuration from file with fallback to defaults
fn load_config(path: &str) -> Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file_with_env(path)
            .with_context(|| format!("Failed to load config from {}", path))
    } else {
        warn!(path = %path, "Config file not found, using defaults");
        let mut config = Config::default();
        config.apply_env_overrides()?;
        Ok(config)
    }
}

/// Register the requested watches; returns the ids whose terminal
/// notification the event loop waits for.
fn register(coordinator: &Coordinator, args: &Args) -> HashSet<String> {
    let mut outstanding = HashSet::new();

    match &args.batch {
        Some(batch_id) => {
            let members = args.signatures.iter().map(BatchMember::new).collect();
            let options = BatchOptions::new()
                .with_display(TxDisplay::new(format!("Batch {}", batch_id)));
            if coordinator.watch_batch(batch_id.clone(), members, options)
                == WatchRegistration::Watching
            {
                outstanding.insert(batch_id.clone());
            }
        }
        None => {
            for signature in &args.signatures {
                let options = WatchOptions::new().with_display(TxDisplay::new("Transaction"));
                match coordinator.watch(signature.clone(), options) {
                    WatchRegistration::Watching => {
                        outstanding.insert(signature.clone());
                    }
                    WatchRegistration::AlreadyWatching => {
                        warn!(signature = %signature, "Duplicate signature on command line");
                    }
                    WatchRegistration::Detached => {}
                }
            }
        }
    }

    outstanding
}

/// Print notifications until every outstanding watch is terminal
async fn run_event_loop(
    coordinator: &Coordinator,
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    mut outstanding: HashSet<String>,
) {
    while !outstanding.is_empty() {
        tokio::select! {
            Some(notification) = notifications.recv() => {
                match serde_json::to_string(&notification) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!(error = %e, "Failed to encode notification"),
                }
                if notification.status.is_terminal() {
                    outstanding.remove(&notification.id);
                }
            }

            // Graceful shutdown signal
            _ = tokio::signal::ctrl_c() => {
                info!(pending = outstanding.len(), "Received shutdown signal");
                for id in outstanding.drain() {
                    coordinator.cancel(&id).await;
                }
            }
        }
    }

    info!("Shutting down gracefully");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_batch() {
        let args = Args::try_parse_from(["txwatch", "--batch", "swap-1", "sigA", "sigB"]).unwrap();
        assert_eq!(args.batch.as_deref(), Some("swap-1"));
        assert_eq!(args.signatures, vec!["sigA", "sigB"]);
        assert!(!args.json_logs);
    }

    #[test]
    fn test_args_require_signature() {
        assert!(Args::try_parse_from(["txwatch"]).is_err());
    }
}
