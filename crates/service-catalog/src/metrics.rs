//! Write-only metrics sink used by the catalogs

use crate::model::ServiceInstance;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Live instances
pub const INSTANCES_COUNT: &str = "store.instances.count";
/// Live instances carrying metadata
pub const METADATA_INSTANCES: &str = "store.metadata.instances";
/// Live instances carrying tags
pub const TAGS_INSTANCES: &str = "store.tags.instances";
/// Instances removed by TTL expiry
pub const INSTANCES_EXPIRATION: &str = "store.instances.expiration";
/// Instance lifetime in milliseconds, recorded on removal
pub const INSTANCES_LIFETIME: &str = "store.instances.lifetime";
/// Metadata length in bytes
pub const METADATA_LENGTH: &str = "store.metadata.length";
/// Number of tags
pub const TAGS_LENGTH: &str = "store.tags.length";

/// Destination for catalog metrics; the core never reads values back
pub trait MetricsSink: Send + Sync {
    /// Increase a counter
    fn increment(&self, name: &'static str, delta: i64);

    /// Decrease a counter
    fn decrement(&self, name: &'static str, delta: i64);

    /// Mark events on a meter
    fn mark(&self, name: &'static str, count: u64);

    /// Add a histogram sample
    fn record(&self, name: &'static str, value: f64);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &'static str, _delta: i64) {}
    fn decrement(&self, _name: &'static str, _delta: i64) {}
    fn mark(&self, _name: &'static str, _count: u64) {}
    fn record(&self, _name: &'static str, _value: f64) {}
}

/// Sink forwarding to the process-wide `metrics` recorder.
///
/// Up/down counters are exported as gauges, meters as monotonic counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsFacade;

impl MetricsSink for MetricsFacade {
    fn increment(&self, name: &'static str, delta: i64) {
        metrics::increment_gauge!(name, delta as f64);
    }

    fn decrement(&self, name: &'static str, delta: i64) {
        metrics::decrement_gauge!(name, delta as f64);
    }

    fn mark(&self, name: &'static str, count: u64) {
        metrics::counter!(name, count);
    }

    fn record(&self, name: &'static str, value: f64) {
        metrics::histogram!(name, value);
    }
}

#[derive(Debug, Default)]
struct Recorded {
    counters: HashMap<&'static str, i64>,
    meters: HashMap<&'static str, u64>,
    histograms: HashMap<&'static str, Vec<f64>>,
}

/// In-process sink keeping every value for later inspection
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    inner: Mutex<Recorded>,
}

impl RecordingMetrics {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter value
    pub fn counter(&self, name: &str) -> i64 {
        self.inner.lock().counters.get(name).copied().unwrap_or(0)
    }

    /// Total marks on a meter
    pub fn meter(&self, name: &str) -> u64 {
        self.inner.lock().meters.get(name).copied().unwrap_or(0)
    }

    /// All samples of a histogram, in recording order
    pub fn histogram(&self, name: &str) -> Vec<f64> {
        self.inner
            .lock()
            .histograms
            .get(name)
            .cloned()
            .unwrap_or_default()
    }
}

impl MetricsSink for RecordingMetrics {
    fn increment(&self, name: &'static str, delta: i64) {
        *self.inner.lock().counters.entry(name).or_default() += delta;
    }

    fn decrement(&self, name: &'static str, delta: i64) {
        *self.inner.lock().counters.entry(name).or_default() -= delta;
    }

    fn mark(&self, name: &'static str, count: u64) {
        *self.inner.lock().meters.entry(name).or_default() += count;
    }

    fn record(&self, name: &'static str, value: f64) {
        self.inner
            .lock()
            .histograms
            .entry(name)
            .or_default()
            .push(value);
    }
}

/// Instance bookkeeping shared by the read-write catalogs
#[derive(Clone)]
pub(crate) struct StoreMetrics {
    sink: Arc<dyn MetricsSink>,
}

impl StoreMetrics {
    pub(crate) fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }

    /// Account for a stored registration; `previous` is the overwritten instance
    pub(crate) fn registered(&self, previous: Option<&ServiceInstance>, current: &ServiceInstance) {
        let had_metadata = previous.is_some_and(|p| !p.metadata.is_empty());
        let had_tags = previous.is_some_and(|p| !p.tags.is_empty());
        let has_metadata = !current.metadata.is_empty();
        let has_tags = !current.tags.is_empty();

        if previous.is_none() {
            self.sink.increment(INSTANCES_COUNT, 1);
        }

        match (had_metadata, has_metadata) {
            (false, true) => self.sink.increment(METADATA_INSTANCES, 1),
            (true, false) => self.sink.decrement(METADATA_INSTANCES, 1),
            _ => {}
        }
        match (had_tags, has_tags) {
            (false, true) => self.sink.increment(TAGS_INSTANCES, 1),
            (true, false) => self.sink.decrement(TAGS_INSTANCES, 1),
            _ => {}
        }

        if has_metadata {
            self.sink.record(METADATA_LENGTH, current.metadata.len() as f64);
        }
        if has_tags {
            self.sink.record(TAGS_LENGTH, current.tags.len() as f64);
        }
    }

    /// Account for a removed instance
    pub(crate) fn removed(&self, instance: &ServiceInstance) {
        if let Some(registered) = instance.registration_time {
            let lifetime = (Utc::now() - registered).num_milliseconds().max(0);
            self.sink.record(INSTANCES_LIFETIME, lifetime as f64);
        }
        self.sink.decrement(INSTANCES_COUNT, 1);
        if !instance.metadata.is_empty() {
            self.sink.decrement(METADATA_INSTANCES, 1);
        }
        if !instance.tags.is_empty() {
            self.sink.decrement(TAGS_INSTANCES, 1);
        }
    }

    /// Account for an instance removed by TTL expiry
    pub(crate) fn expired(&self, instance: &ServiceInstance) {
        self.removed(instance);
        self.sink.mark(INSTANCES_EXPIRATION, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Endpoint;

    fn instance() -> ServiceInstance {
        let mut si = ServiceInstance::new("Calc", Endpoint::new("tcp", "10.0.0.1:80"));
        si.registration_time = Some(Utc::now());
        si
    }

    #[test]
    fn test_registration_bookkeeping() {
        let recorder = Arc::new(RecordingMetrics::new());
        let metrics = StoreMetrics::new(recorder.clone());

        let first = instance().with_tags(["a"]).with_metadata(b"m".to_vec());
        metrics.registered(None, &first);
        assert_eq!(recorder.counter(INSTANCES_COUNT), 1);
        assert_eq!(recorder.counter(METADATA_INSTANCES), 1);
        assert_eq!(recorder.counter(TAGS_INSTANCES), 1);

        // Overwrite drops metadata, keeps tags
        let second = instance().with_tags(["a", "b"]);
        metrics.registered(Some(&first), &second);
        assert_eq!(recorder.counter(INSTANCES_COUNT), 1);
        assert_eq!(recorder.counter(METADATA_INSTANCES), 0);
        assert_eq!(recorder.counter(TAGS_INSTANCES), 1);
        assert_eq!(recorder.histogram(TAGS_LENGTH), vec![1.0, 2.0]);
        assert_eq!(recorder.histogram(METADATA_LENGTH), vec![1.0]);

        metrics.expired(&second);
        assert_eq!(recorder.counter(INSTANCES_COUNT), 0);
        assert_eq!(recorder.counter(TAGS_INSTANCES), 0);
        assert_eq!(recorder.meter(INSTANCES_EXPIRATION), 1);
        assert_eq!(recorder.histogram(INSTANCES_LIFETIME).len(), 1);
    }

    #[test]
    fn test_facade_without_recorder() {
        // No global recorder installed; calls must be no-ops
        let sink = MetricsFacade;
        sink.increment(INSTANCES_COUNT, 1);
        sink.decrement(INSTANCES_COUNT, 1);
        sink.mark(INSTANCES_EXPIRATION, 1);
        sink.record(TAGS_LENGTH, 2.0);
    }
}
