//! Metrics collection and export module
//!
//! One `ReserveMetrics` is created at startup and shared by `Arc`; there is
//! no process-global instance.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::time::Instant;

pub struct ReserveMetrics {
    registry: Registry,

    // Counters
    pub cycles_total: IntCounterVec,
    pub fetch_failures_total: IntCounterVec,
    pub double_check_rounds: IntCounter,
    pub double_check_unstable: IntCounter,
    pub broadcast_node_failures: IntCounterVec,
    pub broadcast_no_acceptance: IntCounter,
    pub terminal_transitions: IntCounterVec,
    pub lost_escalations: IntCounter,

    // Gauges
    pub pending_activities: IntGauge,
    pub current_block: IntGauge,

    // Histograms
    pub reconcile_latency: Histogram,
}

impl ReserveMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let cycles_total = IntCounterVec::new(
            Opts::new("reserve_cycles_total", "Completed fetch cycles per domain"),
            &["domain"],
        )?;

        let fetch_failures_total = IntCounterVec::new(
            Opts::new(
                "reserve_fetch_failures_total",
                "Cycles that persisted an invalid snapshot, per domain",
            ),
            &["domain"],
        )?;

        let double_check_rounds = IntCounter::with_opts(Opts::new(
            "reserve_double_check_rounds_total",
            "Status-balance-status rounds issued",
        ))?;

        let double_check_unstable = IntCounter::with_opts(Opts::new(
            "reserve_double_check_unstable_total",
            "Sources whose statuses never stabilized within the round cap",
        ))?;

        let broadcast_node_failures = IntCounterVec::new(
            Opts::new(
                "reserve_broadcast_node_failures_total",
                "Broadcast attempts rejected or timed out, per node",
            ),
            &["node"],
        )?;

        let broadcast_no_acceptance = IntCounter::with_opts(Opts::new(
            "reserve_broadcast_no_acceptance_total",
            "Broadcasts that no node accepted",
        ))?;

        let terminal_transitions = IntCounterVec::new(
            Opts::new(
                "reserve_activity_terminal_total",
                "Activities reaching a terminal status, per kind",
            ),
            &["kind"],
        )?;

        let lost_escalations = IntCounter::with_opts(Opts::new(
            "reserve_lost_escalations_total",
            "Lost transactions escalated to failed",
        ))?;

        let pending_activities = IntGauge::with_opts(Opts::new(
            "reserve_pending_activities",
            "Activities still pending after the last reconciliation",
        ))?;

        let current_block =
            IntGauge::with_opts(Opts::new("reserve_current_block", "Last observed block"))?;

        let reconcile_latency = Histogram::with_opts(
            HistogramOpts::new(
                "reserve_reconcile_latency_seconds",
                "Reconciliation cycle latency",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]),
        )?;

        registry.register(Box::new(cycles_total.clone()))?;
        registry.register(Box::new(fetch_failures_total.clone()))?;
        registry.register(Box::new(double_check_rounds.clone()))?;
        registry.register(Box::new(double_check_unstable.clone()))?;
        registry.register(Box::new(broadcast_node_failures.clone()))?;
        registry.register(Box::new(broadcast_no_acceptance.clone()))?;
        registry.register(Box::new(terminal_transitions.clone()))?;
        registry.register(Box::new(lost_escalations.clone()))?;
        registry.register(Box::new(pending_activities.clone()))?;
        registry.register(Box::new(current_block.clone()))?;
        registry.register(Box::new(reconcile_latency.clone()))?;

        Ok(Self {
            registry,
            cycles_total,
            fetch_failures_total,
            double_check_rounds,
            double_check_unstable,
            broadcast_node_failures,
            broadcast_no_acceptance,
            terminal_transitions,
            lost_escalations,
            pending_activities,
            current_block,
            reconcile_latency,
        })
    }

    /// Get the registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_cycle(&self, domain: &str, valid: bool) {
        self.cycles_total.with_label_values(&[domain]).inc();
        if !valid {
            self.fetch_failures_total.with_label_values(&[domain]).inc();
        }
    }
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration(&self, histogram: &Histogram) {
        histogram.observe(self.start.elapsed().as_secs_f64());
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_cycle_counts_failures_separately() {
        let metrics = ReserveMetrics::new().unwrap();
        metrics.record_cycle("auth", true);
        metrics.record_cycle("auth", false);

        assert_eq!(metrics.cycles_total.with_label_values(&["auth"]).get(), 2);
        assert_eq!(metrics.fetch_failures_total.with_label_values(&["auth"]).get(), 1);
        assert!(!metrics.registry().gather().is_empty());
    }

    #[test]
    fn test_instances_are_independent() {
        let a = ReserveMetrics::new().unwrap();
        let b = ReserveMetrics::new().unwrap();
        a.lost_escalations.inc();
        assert_eq!(b.lost_escalations.get(), 0);
    }
}
