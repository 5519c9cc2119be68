//! Descriptor enrichment pipeline
//!
//! Stream handlers drop entity ids onto an unbounded FIFO queue; a small
//! worker pool drains it, consulting the descriptor cache before touching
//! the API. The pool size is the lookup concurrency bound, and each worker
//! pauses between lookups so a burst of ids cannot hammer the vendor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;

use crate::cache::EntityCache;
use crate::client::{Descriptor, DescriptorFetch};
use crate::join::{NameResolutionJoin, PendingSample};
use crate::records;
use crate::sink::TelemetrySink;

/// One queued lookup
#[derive(Debug, Clone)]
pub struct EnrichmentRequest {
    /// Device to look up
    pub entity_id: String,
}

/// Producer handle onto the lookup queue
#[derive(Clone)]
pub struct EnrichmentQueue {
    tx: mpsc::UnboundedSender<EnrichmentRequest>,
}

impl EnrichmentQueue {
    /// Create the queue, returning the producer handle and the worker end
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EnrichmentRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an entity for descriptor lookup
    pub fn enqueue(&self, entity_id: &str) {
        tracing::debug!(entity_id, "queueing entity for lookup");
        let request = EnrichmentRequest {
            entity_id: entity_id.to_string(),
        };
        if self.tx.send(request).is_err() {
            tracing::warn!(entity_id, "lookup queue is closed, dropping request");
        }
    }
}

/// Everything a lookup worker needs
#[derive(Clone)]
pub struct WorkerContext {
    /// Descriptor source, normally the REST client
    pub fetcher: Arc<dyn DescriptorFetch>,

    /// Shared descriptor cache
    pub cache: EntityCache,

    /// Name join fed by always-on breakdowns
    pub join: Arc<NameResolutionJoin>,

    /// Destination for descriptor records
    pub sink: Arc<dyn TelemetrySink>,

    /// Monitor the collector is bound to
    pub monitor_id: String,

    /// Pause between consecutive lookups on one worker
    pub lookup_delay: Duration,

    /// Shutdown signal
    pub shutdown: Arc<Notify>,
}

/// Spawn `count` workers sharing one queue receiver
#[must_use]
pub fn spawn_workers(
    rx: mpsc::UnboundedReceiver<EnrichmentRequest>,
    context: WorkerContext,
    count: usize,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..count)
        .map(|worker| {
            let rx = Arc::clone(&rx);
            let context = context.clone();
            tokio::spawn(worker_loop(worker, rx, context))
        })
        .collect()
}

async fn worker_loop(
    worker: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<EnrichmentRequest>>>,
    context: WorkerContext,
) {
    loop {
        let request = tokio::select! {
            request = next_request(&rx) => match request {
                Some(request) => request,
                None => break,
            },
            () = context.shutdown.notified() => break,
        };

        tracing::debug!(worker, entity_id = %request.entity_id, "lookup started");
        if let Some(descriptor) = resolve(&context, &request.entity_id).await {
            persist_descriptor(&context, &descriptor).await;
            context.join.notify_resolved(&request.entity_id).await;
        }
        tracing::debug!(worker, entity_id = %request.entity_id, "lookup finished");

        tokio::time::sleep(context.lookup_delay).await;
    }
    tracing::debug!(worker, "lookup worker stopped");
}

async fn next_request(
    rx: &Mutex<mpsc::UnboundedReceiver<EnrichmentRequest>>,
) -> Option<EnrichmentRequest> {
    rx.lock().await.recv().await
}

/// Cache-first descriptor resolution; a failed fetch resolves to nothing
async fn resolve(context: &WorkerContext, entity_id: &str) -> Option<Arc<Descriptor>> {
    if let Some(cached) = context.cache.get(entity_id) {
        tracing::debug!(entity_id, "descriptor cache hit");
        return Some(cached);
    }

    match context.fetcher.fetch_descriptor(entity_id).await {
        Ok(descriptor) => {
            let descriptor = Arc::new(descriptor);
            context.cache.insert(entity_id, Arc::clone(&descriptor));
            Some(descriptor)
        }
        Err(e) => {
            tracing::warn!(entity_id, error = %e, "descriptor lookup failed");
            None
        }
    }
}

/// Write the descriptor's detail records
///
/// The always-on aggregate also fans its sub-device samples through the name
/// join, since the breakdown names nothing.
async fn persist_descriptor(context: &WorkerContext, descriptor: &Descriptor) {
    let timestamp = chrono::Utc::now().timestamp();

    if descriptor.is_always_on() {
        let points = records::always_on_points(&context.monitor_id, descriptor, timestamp);
        context.sink.write_points(points).await;

        for device in &descriptor.always_on.devices {
            let Some(entity_id) = device.id.clone() else {
                tracing::debug!("always-on entry without id, skipping");
                continue;
            };
            context
                .join
                .record(PendingSample {
                    monitor_id: context.monitor_id.clone(),
                    entity_id,
                    watts: device.w,
                    timestamp,
                })
                .await;
        }
    } else {
        let point = records::device_detail_point(&context.monitor_id, descriptor, timestamp);
        context.sink.write_points(vec![point]).await;
    }
}
