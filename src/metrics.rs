use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one engine run. Lanes update them concurrently.
#[derive(Debug, Default)]
pub struct RunMetrics {
    events: AtomicU64,
    actions: AtomicU64,
    executions: AtomicU64,
    collector_failures: AtomicU64,
    strategy_failures: AtomicU64,
    executor_failures: AtomicU64,
    lane_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub events: u64,
    pub actions: u64,
    pub executions: u64,
    pub collector_failures: u64,
    pub strategy_failures: u64,
    pub executor_failures: u64,
    pub lane_failures: u64,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_received(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn actions_emitted(&self, n: usize) {
        self.actions.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn execution_done(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn collector_failed(&self) {
        self.collector_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn strategy_failed(&self) {
        self.strategy_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn executor_failed(&self) {
        self.executor_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lane_failed(&self) {
        self.lane_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events: self.events.load(Ordering::Relaxed),
            actions: self.actions.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
            collector_failures: self.collector_failures.load(Ordering::Relaxed),
            strategy_failures: self.strategy_failures.load(Ordering::Relaxed),
            executor_failures: self.executor_failures.load(Ordering::Relaxed),
            lane_failures: self.lane_failures.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    pub fn failures(&self) -> u64 {
        self.collector_failures + self.strategy_failures + self.executor_failures + self.lane_failures
    }

    /// Log fields for the periodic and final stats records.
    pub fn to_fields(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}
