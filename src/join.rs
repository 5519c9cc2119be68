//! Deferred naming for always-on sub-device samples
//!
//! The aggregate's breakdown carries wattage but no names, so samples park
//! here until the descriptor cache can name their entity. A worker that
//! resolves a descriptor pokes the join for an immediate flush; a one-second
//! sweep catches entities resolved by any other path. Samples for one entity
//! always flush in arrival order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::cache::EntityCache;
use crate::records;
use crate::sink::TelemetrySink;

/// How often parked samples are rechecked against the cache
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// One sub-device sample waiting on a display name
#[derive(Debug, Clone)]
pub struct PendingSample {
    /// Monitor the sample belongs to
    pub monitor_id: String,

    /// Entity awaiting a name
    pub entity_id: String,

    /// Attributed share in watts
    pub watts: Option<f64>,

    /// Epoch seconds at which the sample was taken
    pub timestamp: i64,
}

/// Pairs nameless samples with descriptors as they resolve
pub struct NameResolutionJoin {
    cache: EntityCache,
    sink: Arc<dyn TelemetrySink>,
    pending: Mutex<HashMap<String, Vec<PendingSample>>>,
}

impl NameResolutionJoin {
    #[must_use]
    pub fn new(cache: EntityCache, sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            cache,
            sink,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Write a sample now when its entity is resolved, park it otherwise
    pub async fn record(&self, sample: PendingSample) {
        match self.cache.display_name(&sample.entity_id) {
            Some(name) => self.write_samples(&name, vec![sample]).await,
            None => {
                tracing::debug!(entity_id = %sample.entity_id, "name unresolved, parking sample");
                self.lock()
                    .entry(sample.entity_id.clone())
                    .or_default()
                    .push(sample);
            }
        }
    }

    /// Flush one entity immediately after its descriptor resolved
    pub async fn notify_resolved(&self, entity_id: &str) {
        self.flush_entity(entity_id).await;
    }

    /// Flush every parked entity the cache can now name
    pub async fn flush_ready(&self) {
        let ready: Vec<String> = {
            let pending = self.lock();
            pending
                .keys()
                .filter(|id| self.cache.display_name(id).is_some())
                .cloned()
                .collect()
        };
        for entity_id in ready {
            self.flush_entity(&entity_id).await;
        }
    }

    /// Total parked samples across all entities
    #[must_use]
    pub fn pending_total(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    /// Sweep loop; runs until shutdown
    pub async fn run(self: Arc<Self>, shutdown: Arc<Notify>) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = sweep.tick() => self.flush_ready().await,
                () = shutdown.notified() => break,
            }
        }
        tracing::debug!("name join stopped");
    }

    async fn flush_entity(&self, entity_id: &str) {
        let Some(name) = self.cache.display_name(entity_id) else {
            return;
        };
        let Some(samples) = self.lock().remove(entity_id) else {
            return;
        };

        tracing::debug!(entity_id, device_name = %name, samples = samples.len(), "flushing parked samples");
        self.write_samples(&name, samples).await;
    }

    async fn write_samples(&self, name: &str, samples: Vec<PendingSample>) {
        let points = samples
            .iter()
            .map(|sample| {
                records::always_on_device_point(
                    &sample.monitor_id,
                    &sample.entity_id,
                    name,
                    sample.watts,
                    sample.timestamp,
                )
            })
            .collect();
        self.sink.write_points(points).await;
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<PendingSample>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Descriptor;
    use crate::sink::{FieldValue, Point};
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingSink {
        points: Mutex<Vec<Point>>,
    }

    #[async_trait]
    impl TelemetrySink for RecordingSink {
        async fn write_points(&self, points: Vec<Point>) {
            self.points.lock().unwrap().extend(points);
        }
    }

    impl RecordingSink {
        fn points(&self) -> Vec<Point> {
            self.points.lock().unwrap().clone()
        }
    }

    fn named_descriptor(id: &str, name: &str) -> Arc<Descriptor> {
        let raw = format!(r#"{{"device": {{"id": "{id}", "name": "{name}"}}}}"#);
        Arc::new(serde_json::from_str(&raw).unwrap())
    }

    fn sample(entity_id: &str, watts: f64, timestamp: i64) -> PendingSample {
        PendingSample {
            monitor_id: "77".to_string(),
            entity_id: entity_id.to_string(),
            watts: Some(watts),
            timestamp,
        }
    }

    #[tokio::test]
    async fn resolved_entities_write_through_immediately() {
        let cache = EntityCache::new(Duration::from_secs(60));
        cache.insert("d1", named_descriptor("d1", "Router"));
        let sink = Arc::new(RecordingSink::default());
        let join = NameResolutionJoin::new(cache, sink.clone());

        join.record(sample("d1", 9.0, 10)).await;

        let points = sink.points();
        assert_eq!(points.len(), 1);
        assert!(points[0].tags.contains(&("device_name", "Router".to_string())));
        assert_eq!(join.pending_total(), 0);
    }

    #[tokio::test]
    async fn unresolved_samples_park_until_notified() {
        let cache = EntityCache::new(Duration::from_secs(60));
        let sink = Arc::new(RecordingSink::default());
        let join = NameResolutionJoin::new(cache.clone(), sink.clone());

        join.record(sample("d2", 1.0, 10)).await;
        join.record(sample("d2", 2.0, 11)).await;
        assert!(sink.points().is_empty());
        assert_eq!(join.pending_total(), 2);

        cache.insert("d2", named_descriptor("d2", "Modem"));
        join.notify_resolved("d2").await;

        let points = sink.points();
        assert_eq!(points.len(), 2);
        // arrival order survives the flush
        assert_eq!(points[0].fields[0], ("watts".to_string(), FieldValue::Float(1.0)));
        assert_eq!(points[1].fields[0], ("watts".to_string(), FieldValue::Float(2.0)));
        assert_eq!(join.pending_total(), 0);
    }

    #[tokio::test]
    async fn notify_without_a_cached_descriptor_keeps_samples_parked() {
        let cache = EntityCache::new(Duration::from_secs(60));
        let sink = Arc::new(RecordingSink::default());
        let join = NameResolutionJoin::new(cache, sink.clone());

        join.record(sample("d3", 4.0, 10)).await;
        join.notify_resolved("d3").await;

        assert!(sink.points().is_empty());
        assert_eq!(join.pending_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_loop_flushes_once_the_cache_resolves() {
        let cache = EntityCache::new(Duration::from_secs(60));
        let sink = Arc::new(RecordingSink::default());
        let join = Arc::new(NameResolutionJoin::new(cache.clone(), sink.clone()));
        let shutdown = Arc::new(Notify::new());
        let sweeper = tokio::spawn(Arc::clone(&join).run(Arc::clone(&shutdown)));

        join.record(sample("d6", 5.0, 10)).await;
        cache.insert("d6", named_descriptor("d6", "Lamp"));

        tokio::time::advance(SWEEP_INTERVAL).await;
        tokio::task::yield_now().await;

        assert_eq!(sink.points().len(), 1);
        assert_eq!(join.pending_total(), 0);

        shutdown.notify_waiters();
        sweeper.await.unwrap();
    }

    #[tokio::test]
    async fn sweep_flushes_only_resolvable_entities() {
        let cache = EntityCache::new(Duration::from_secs(60));
        let sink = Arc::new(RecordingSink::default());
        let join = NameResolutionJoin::new(cache.clone(), sink.clone());

        join.record(sample("d4", 1.0, 10)).await;
        join.record(sample("d5", 2.0, 11)).await;
        cache.insert("d4", named_descriptor("d4", "Doorbell"));

        join.flush_ready().await;

        let points = sink.points();
        assert_eq!(points.len(), 1);
        assert!(points[0].tags.contains(&("device_id", "d4".to_string())));
        assert_eq!(join.pending_total(), 1);
    }
}
