//! Metrics collection and export module

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Global metrics registry
pub struct Metrics {
    registry: Registry,

    // Counters
    pub watches_started: IntCounter,
    pub watches_confirmed: IntCounter,
    pub watches_failed: IntCounter,
    pub watches_timed_out: IntCounter,
    pub watches_cancelled: IntCounter,
    pub duplicate_registrations: IntCounter,
    pub batches_started: IntCounter,
    pub push_resolutions: IntCounter,
    pub poll_resolutions: IntCounter,
    pub poll_attempts: IntCounter,
    pub resubmissions_sent: IntCounter,

    // Gauges
    pub active_watches: IntGauge,
    pub active_batches: IntGauge,
    pub active_resubmissions: IntGauge,

    // Histograms
    pub confirmation_latency: Histogram,
}

impl Metrics {
    /// Create new metrics instance
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let watches_started = IntCounter::with_opts(Opts::new(
            "watches_started",
            "Number of transaction watches registered",
        ))?;

        let watches_confirmed =
            IntCounter::with_opts(Opts::new("watches_confirmed", "Watches ending confirmed"))?;

        let watches_failed = IntCounter::with_opts(Opts::new(
            "watches_failed",
            "Watches ending with a ledger-reported error",
        ))?;

        let watches_timed_out = IntCounter::with_opts(Opts::new(
            "watches_timed_out",
            "Watches ending without any detection path resolving",
        ))?;

        let watches_cancelled =
            IntCounter::with_opts(Opts::new("watches_cancelled", "Watches cancelled explicitly"))?;

        let duplicate_registrations = IntCounter::with_opts(Opts::new(
            "duplicate_registrations",
            "Watch requests ignored because the id was already watched",
        ))?;

        let batches_started =
            IntCounter::with_opts(Opts::new("batches_started", "Number of batch watches registered"))?;

        let push_resolutions = IntCounter::with_opts(Opts::new(
            "push_resolutions",
            "Watches resolved by a subscription event",
        ))?;

        let poll_resolutions =
            IntCounter::with_opts(Opts::new("poll_resolutions", "Watches resolved by polling"))?;

        let poll_attempts =
            IntCounter::with_opts(Opts::new("poll_attempts", "Ledger lookups made by poll loops"))?;

        let resubmissions_sent = IntCounter::with_opts(Opts::new(
            "resubmissions_sent",
            "Signed payloads re-broadcast to the ledger",
        ))?;

        let active_watches =
            IntGauge::with_opts(Opts::new("active_watches", "Watches currently pending"))?;

        let active_batches =
            IntGauge::with_opts(Opts::new("active_batches", "Batches currently pending"))?;

        let active_resubmissions = IntGauge::with_opts(Opts::new(
            "active_resubmissions",
            "Resubmission tasks currently running",
        ))?;

        let confirmation_latency = Histogram::with_opts(
            HistogramOpts::new(
                "confirmation_latency_seconds",
                "Time from registration to a terminal status",
            )
            .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )?;

        // Register all metrics
        registry.register(Box::new(watches_started.clone()))?;
        registry.register(Box::new(watches_confirmed.clone()))?;
        registry.register(Box::new(watches_failed.clone()))?;
        registry.register(Box::new(watches_timed_out.clone()))?;
        registry.register(Box::new(watches_cancelled.clone()))?;
        registry.register(Box::new(duplicate_registrations.clone()))?;
        registry.register(Box::new(batches_started.clone()))?;
        registry.register(Box::new(push_resolutions.clone()))?;
        registry.register(Box::new(poll_resolutions.clone()))?;
        registry.register(Box::new(poll_attempts.clone()))?;
        registry.register(Box::new(resubmissions_sent.clone()))?;
        registry.register(Box::new(active_watches.clone()))?;
        registry.register(Box::new(active_batches.clone()))?;
        registry.register(Box::new(active_resubmissions.clone()))?;
        registry.register(Box::new(confirmation_latency.clone()))?;

        Ok(Self {
            registry,
            watches_started,
            watches_confirmed,
            watches_failed,
            watches_timed_out,
            watches_cancelled,
            duplicate_registrations,
            batches_started,
            push_resolutions,
            poll_resolutions,
            poll_attempts,
            resubmissions_sent,
            active_watches,
            active_batches,
            active_resubmissions,
            confirmation_latency,
        })
    }

    /// Get the registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn export_text(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Global metrics instance
pub fn metrics() -> &'static Metrics {
    static METRICS: once_cell::sync::Lazy<Metrics> =
        once_cell::sync::Lazy::new(|| Metrics::new().expect("Failed to initialize metrics"));
    &METRICS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters_increment() {
        let m = metrics();

        let before = m.watches_started.get();
        m.watches_started.inc();
        assert!(m.watches_started.get() >= before + 1);
    }

    #[test]
    fn test_histogram_records() {
        let m = metrics();
        m.confirmation_latency.observe(1.5);
        assert!(m.confirmation_latency.get_sample_count() > 0);
    }

    #[test]
    fn test_export_text_contains_registered_names() {
        let m = Metrics::new().unwrap();
        m.poll_attempts.inc();

        let text = m.export_text().unwrap();
        assert!(text.contains("poll_attempts 1"));
        assert!(text.contains("confirmation_latency_seconds"));
        assert!(text.contains("active_watches"));
    }
}
