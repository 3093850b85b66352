use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Process-wide metrics registry (counters + gauges).
///
/// Sinks are append-only and safe for concurrent emission. Consensus and
/// overlay code increment a counter on every locally-dropped message so the
/// silent-rejection policy stays observable.
#[derive(Clone)]
pub struct MetricsRegistry {
    counters: Arc<Mutex<HashMap<String, u64>>>,
    gauges: Arc<Mutex<HashMap<String, f64>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Mutex::new(HashMap::new())),
            gauges: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn inc(&self, name: &str) {
        let mut counters = self.counters.lock().unwrap();
        *counters.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn set_gauge(&self, name: &str, val: f64) {
        let mut gauges = self.gauges.lock().unwrap();
        gauges.insert(name.to_string(), val);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> (HashMap<String, u64>, HashMap<String, f64>) {
        (
            self.counters.lock().unwrap().clone(),
            self.gauges.lock().unwrap().clone(),
        )
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}
