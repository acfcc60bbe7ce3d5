//! Process-wide counters for the control plane
//!
//! Counters are plain atomics; [`HaMetrics::snapshot`] renders them as a
//! sorted name/value list for the admin `metrics` call.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

/// Atomic counter for metrics
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Atomic gauge for metrics (can go up and down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement, saturating at zero
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }
}

/// RPC server statistics
#[derive(Debug, Default)]
pub struct RpcMetrics {
    pub connections_total: Counter,
    pub connections_active: Gauge,
    pub auth_failures: Counter,
    pub calls_total: Counter,
    pub call_errors: Counter,
    pub call_duration_us: Counter,
    calls_by_function: RwLock<BTreeMap<String, u64>>,
}

impl RpcMetrics {
    pub fn record_connection(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    pub fn record_disconnection(&self) {
        self.connections_active.dec();
    }

    pub fn record_call(&self, function: &str, duration: Duration, ok: bool) {
        self.calls_total.inc();
        self.call_duration_us.inc_by(duration.as_micros() as u64);
        if !ok {
            self.call_errors.inc();
        }
        if let Ok(mut by_fn) = self.calls_by_function.write() {
            *by_fn.entry(function.to_string()).or_insert(0) += 1;
        }
    }

    pub fn calls_for(&self, function: &str) -> u64 {
        self.calls_by_function
            .read()
            .ok()
            .and_then(|m| m.get(function).copied())
            .unwrap_or(0)
    }
}

/// Orchestration statistics
#[derive(Debug, Default)]
pub struct HaMetrics {
    pub rpc: RpcMetrics,
    pub monitors_active: Gauge,
    pub check_cycles: Counter,
    pub probes_ok: Counter,
    pub probes_failed: Counter,
    pub failovers_ok: Counter,
    pub failovers_failed: Counter,
    pub failbacks_ok: Counter,
    pub failbacks_failed: Counter,
    pub switchovers_ok: Counter,
    pub switchovers_failed: Counter,
    pub reconcile_errors: Counter,
}

impl HaMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<(String, u64)> {
        vec![
            ("check_cycles".into(), self.check_cycles.get()),
            ("failbacks_failed".into(), self.failbacks_failed.get()),
            ("failbacks_ok".into(), self.failbacks_ok.get()),
            ("failovers_failed".into(), self.failovers_failed.get()),
            ("failovers_ok".into(), self.failovers_ok.get()),
            ("monitors_active".into(), self.monitors_active.get()),
            ("probes_failed".into(), self.probes_failed.get()),
            ("probes_ok".into(), self.probes_ok.get()),
            ("reconcile_errors".into(), self.reconcile_errors.get()),
            ("rpc_auth_failures".into(), self.rpc.auth_failures.get()),
            ("rpc_call_errors".into(), self.rpc.call_errors.get()),
            ("rpc_calls_total".into(), self.rpc.calls_total.get()),
            ("rpc_connections_active".into(), self.rpc.connections_active.get()),
            ("rpc_connections_total".into(), self.rpc.connections_total.get()),
            ("switchovers_failed".into(), self.switchovers_failed.get()),
            ("switchovers_ok".into(), self.switchovers_ok.get()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);
        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_gauge_never_underflows() {
        let gauge = Gauge::new();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
    }

    #[test]
    fn test_rpc_call_accounting() {
        let metrics = RpcMetrics::default();
        metrics.record_call("start", Duration::from_millis(3), true);
        metrics.record_call("start", Duration::from_millis(1), false);
        metrics.record_call("stop", Duration::from_millis(1), true);
        assert_eq!(metrics.calls_total.get(), 3);
        assert_eq!(metrics.call_errors.get(), 1);
        assert_eq!(metrics.calls_for("start"), 2);
        assert_eq!(metrics.calls_for("promote"), 0);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let metrics = HaMetrics::new();
        metrics.failovers_ok.inc();
        let snap = metrics.snapshot();
        let names: Vec<_> = snap.iter().map(|(n, _)| n.clone()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(snap.contains(&("failovers_ok".to_string(), 1)));
    }
}
