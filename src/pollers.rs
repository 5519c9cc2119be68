//! Background REST pollers
//!
//! Fixed-rate loops beside the stream: monitor status snapshots, an
//! inventory sweep that pre-warms descriptor lookups, and a timeline poll
//! that catches events the stream missed. A failed cycle logs and waits
//! for the next tick; pollers never back off and never die.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::client::ApiClient;
use crate::dispatch::EventDispatcher;
use crate::enrichment::EnrichmentQueue;
use crate::records;
use crate::sink::TelemetrySink;
use crate::stream::wait_or_shutdown;

/// Poll monitor status and persist a snapshot per cycle
pub fn spawn_status_poller(
    client: Arc<ApiClient>,
    sink: Arc<dyn TelemetrySink>,
    monitor_id: String,
    period: Duration,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let started = Instant::now();
            match client.monitor_status().await {
                Ok(status) => {
                    let timestamp = chrono::Utc::now().timestamp();
                    let points = records::monitor_status_points(&monitor_id, &status, timestamp);
                    sink.write_points(points).await;
                }
                Err(e) => tracing::warn!(error = %e, "monitor status poll failed"),
            }

            if wait_or_shutdown(remaining(period, started.elapsed()), &shutdown).await {
                break;
            }
        }
        tracing::debug!("status poller stopped");
    })
}

/// Sweep the device inventory, queueing every entry for descriptor lookup
pub fn spawn_inventory_poller(
    client: Arc<ApiClient>,
    queue: EnrichmentQueue,
    period: Duration,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let started = Instant::now();
            match client.devices().await {
                Ok(devices) => {
                    tracing::info!(count = devices.len(), "inventory sweep queueing lookups");
                    for device in &devices {
                        match device.id.as_deref() {
                            Some(id) => queue.enqueue(id),
                            None => {
                                tracing::warn!(name = ?device.name, "inventory entry without id");
                            }
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "inventory poll failed"),
            }

            if wait_or_shutdown(remaining(period, started.elapsed()), &shutdown).await {
                break;
            }
        }
        tracing::debug!("inventory poller stopped");
    })
}

/// Poll the account timeline, persisting items through the dispatcher
pub fn spawn_timeline_poller(
    client: Arc<ApiClient>,
    dispatcher: EventDispatcher,
    period: Duration,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let started = Instant::now();
            match client.timeline().await {
                Ok(timeline) => dispatcher.handle_timeline_items(&timeline.items).await,
                Err(e) => tracing::warn!(error = %e, "timeline poll failed"),
            }

            if wait_or_shutdown(remaining(period, started.elapsed()), &shutdown).await {
                break;
            }
        }
        tracing::debug!("timeline poller stopped");
    })
}

/// Time left in a fixed-rate period after one cycle's work
fn remaining(period: Duration, elapsed: Duration) -> Duration {
    period.saturating_sub(elapsed)
}
