//! Process-wide bridge counters
//!
//! Every shallow copy, managed tensor and stream binding the bridge makes
//! is counted here. In a quiescent process each acquire counter equals its
//! release counter; a gap means a leak or a task still queued.
//!
//! The counters live in a `prometheus_client` registry. [`BridgeStats::export`]
//! renders them in Prometheus text format; [`StatsSnapshot`] is the JSON view.

use std::fmt;

use once_cell::sync::Lazy;
use prometheus_client::{encoding::text::encode, metrics::counter::Counter, registry::Registry};
use serde::Serialize;

/// Counters registered in a Prometheus registry
#[derive(Debug)]
pub struct BridgeStats {
    registry: Registry,
    calls_wrapped: Counter<u64>,
    tasks_pushed: Counter<u64>,
    tasks_run: Counter<u64>,
    params_released: Counter<u64>,
    shallow_copies: Counter<u64>,
    shallow_frees: Counter<u64>,
    managed_created: Counter<u64>,
    managed_released: Counter<u64>,
    stream_binds: Counter<u64>,
    stream_unbinds: Counter<u64>,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    pub calls_wrapped: u64,
    pub tasks_pushed: u64,
    pub tasks_run: u64,
    pub params_released: u64,
    pub shallow_copies: u64,
    pub shallow_frees: u64,
    pub managed_created: u64,
    pub managed_released: u64,
    pub stream_binds: u64,
    pub stream_unbinds: u64,
}

impl StatsSnapshot {
    /// Shallow copies not yet freed
    pub fn live_shallow_copies(&self) -> u64 {
        self.shallow_copies.saturating_sub(self.shallow_frees)
    }

    /// Tasks handed to the engine whose parameter block is still alive
    pub fn tasks_in_flight(&self) -> u64 {
        self.tasks_pushed.saturating_sub(self.params_released)
    }

    /// Whether every acquired resource has been released
    pub fn is_balanced(&self) -> bool {
        self.shallow_copies == self.shallow_frees
            && self.managed_created == self.managed_released
            && self.stream_binds == self.stream_unbinds
            && self.tasks_pushed == self.params_released
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn counter(registry: &mut Registry, name: &str, help: &str) -> Counter<u64> {
    let counter = Counter::default();
    registry.register(name, help, counter.clone());
    counter
}

impl BridgeStats {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let calls_wrapped = counter(
            &mut registry,
            "mxbridge_calls_wrapped",
            "Calls accepted by an async wrapper",
        );
        let tasks_pushed = counter(
            &mut registry,
            "mxbridge_tasks_pushed",
            "Tasks handed to the host engine",
        );
        let tasks_run = counter(
            &mut registry,
            "mxbridge_tasks_run",
            "Tasks the host engine ran",
        );
        let params_released = counter(
            &mut registry,
            "mxbridge_params_released",
            "Task parameter blocks released",
        );
        let shallow_copies = counter(
            &mut registry,
            "mxbridge_shallow_copies",
            "Tensor shallow copies taken",
        );
        let shallow_frees = counter(
            &mut registry,
            "mxbridge_shallow_frees",
            "Tensor shallow copies freed",
        );
        let managed_created = counter(
            &mut registry,
            "mxbridge_managed_created",
            "Managed tensors exported for a run",
        );
        let managed_released = counter(
            &mut registry,
            "mxbridge_managed_released",
            "Managed tensors released after a run",
        );
        let stream_binds = counter(
            &mut registry,
            "mxbridge_stream_binds",
            "Streams bound to a worker thread",
        );
        let stream_unbinds = counter(
            &mut registry,
            "mxbridge_stream_unbinds",
            "Streams unbound from a worker thread",
        );

        BridgeStats {
            registry,
            calls_wrapped,
            tasks_pushed,
            tasks_run,
            params_released,
            shallow_copies,
            shallow_frees,
            managed_created,
            managed_released,
            stream_binds,
            stream_unbinds,
        }
    }

    pub(crate) fn record_call(&self) {
        self.calls_wrapped.inc();
    }

    pub(crate) fn record_push(&self) {
        self.tasks_pushed.inc();
    }

    pub(crate) fn record_run(&self) {
        self.tasks_run.inc();
    }

    pub(crate) fn record_param_release(&self) {
        self.params_released.inc();
    }

    pub(crate) fn record_shallow_copy(&self) {
        self.shallow_copies.inc();
    }

    pub(crate) fn record_shallow_free(&self) {
        self.shallow_frees.inc();
    }

    pub(crate) fn record_managed_created(&self) {
        self.managed_created.inc();
    }

    pub(crate) fn record_managed_released(&self) {
        self.managed_released.inc();
    }

    pub(crate) fn record_stream_bind(&self) {
        self.stream_binds.inc();
    }

    pub(crate) fn record_stream_unbind(&self) {
        self.stream_unbinds.inc();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            calls_wrapped: self.calls_wrapped.get(),
            tasks_pushed: self.tasks_pushed.get(),
            tasks_run: self.tasks_run.get(),
            params_released: self.params_released.get(),
            shallow_copies: self.shallow_copies.get(),
            shallow_frees: self.shallow_frees.get(),
            managed_created: self.managed_created.get(),
            managed_released: self.managed_released.get(),
            stream_binds: self.stream_binds.get(),
            stream_unbinds: self.stream_unbinds.get(),
        }
    }

    /// Export the counters in Prometheus text format
    pub fn export(&self) -> Result<String, fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for BridgeStats {
    fn default() -> Self {
        Self::new()
    }
}

static STATS: Lazy<BridgeStats> = Lazy::new(BridgeStats::new);

/// Process-wide counters
pub fn global() -> &'static BridgeStats {
    &STATS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_balance() {
        let stats = BridgeStats::new();
        stats.record_push();
        stats.record_shallow_copy();
        let snapshot = stats.snapshot();
        assert!(!snapshot.is_balanced());
        assert_eq!(snapshot.live_shallow_copies(), 1);
        assert_eq!(snapshot.tasks_in_flight(), 1);

        stats.record_shallow_free();
        stats.record_param_release();
        assert!(stats.snapshot().is_balanced());
    }

    #[test]
    fn test_snapshot_serializable() {
        let stats = BridgeStats::new();
        stats.record_call();
        stats.record_stream_bind();

        let json = stats.snapshot().to_json();
        assert!(json.is_ok(), "StatsSnapshot should be JSON-serializable");

        let json_str = json.unwrap();
        assert!(json_str.contains("\"calls_wrapped\":1"));
        assert!(json_str.contains("\"stream_binds\":1"));
        assert!(json_str.contains("\"stream_unbinds\":0"));
    }

    #[test]
    fn test_text_export_lists_every_counter() {
        let stats = BridgeStats::new();
        stats.record_push();
        stats.record_push();
        stats.record_shallow_copy();

        let text = stats.export().unwrap();
        assert!(text.contains("# TYPE mxbridge_tasks_pushed counter"));
        assert!(text.contains("mxbridge_tasks_pushed_total 2"));
        assert!(text.contains("mxbridge_shallow_copies_total 1"));
        assert!(text.contains("mxbridge_stream_unbinds_total 0"));
        assert!(text.ends_with("# EOF\n"));
    }

    #[test]
    fn test_snapshot_reads_registered_counters() {
        let stats = BridgeStats::new();
        for _ in 0..3 {
            stats.record_managed_created();
        }
        stats.record_managed_released();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.managed_created, 3);
        assert_eq!(snapshot.managed_released, 1);
        assert!(stats
            .export()
            .unwrap()
            .contains("mxbridge_managed_created_total 3"));
    }
}
