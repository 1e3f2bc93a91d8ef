//! Minimal namespaced metrics registry.
//!
//! Passed explicitly into the components that record metrics; there is no
//! process-wide registry singleton.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
pub struct MetricsRegistry {
    namespace: String,
    counters: HashMap<String, u64>,
    gauges: HashMap<String, u64>,
}

impl MetricsRegistry {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            counters: HashMap::new(),
            gauges: HashMap::new(),
        }
    }

    pub fn inc_counter(&mut self, name: &str, delta: u64) -> u64 {
        let key = self.qualify(name);
        let counter = self.counters.entry(key).or_insert(0);
        *counter = counter.saturating_add(delta);
        *counter
    }

    pub fn set_gauge(&mut self, name: &str, value: u64) {
        let key = self.qualify(name);
        self.gauges.insert(key, value);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.clone(),
            gauges: self.gauges.clone(),
        }
    }

    fn qualify(&self, name: &str) -> String {
        format!("{}.{}", self.namespace, name)
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn counter(&self, qualified: &str) -> u64 {
        self.counters.get(qualified).copied().unwrap_or(0)
    }

    pub fn gauge(&self, qualified: &str) -> u64 {
        self.gauges.get(qualified).copied().unwrap_or(0)
    }
}

/// Clonable handle shared between managers and the embedding process.
#[derive(Debug, Clone)]
pub struct SharedMetricsRegistry {
    inner: Arc<Mutex<MetricsRegistry>>,
}

impl SharedMetricsRegistry {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsRegistry::new(namespace))),
        }
    }

    pub fn inc_counter(&self, name: &str, delta: u64) -> u64 {
        self.inner.lock().inc_counter(name, delta)
    }

    pub fn set_gauge(&self, name: &str, value: u64) {
        self.inner.lock().set_gauge(name, value)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().snapshot()
    }
}
