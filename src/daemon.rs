//! Collector daemon
//!
//! Wires the pipeline together: the Influx sink, the REST client, the
//! descriptor cache, lookup workers, the name join, the pollers, and the
//! realtime stream. Runs until the stream fails fatally or the process is
//! interrupted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use crate::auth::AuthSession;
use crate::cache::EntityCache;
use crate::client::ApiClient;
use crate::dispatch::EventDispatcher;
use crate::enrichment::{EnrichmentQueue, WorkerContext, spawn_workers};
use crate::join::NameResolutionJoin;
use crate::pollers;
use crate::sink::{InfluxSink, TelemetrySink};
use crate::stream::ConnectionManager;
use crate::{Config, Error, Result};

/// Wait this long per task for a clean stop before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The collector daemon
pub struct Collector {
    config: Config,
    session: AuthSession,
}

impl Collector {
    #[must_use]
    pub fn new(config: Config, session: AuthSession) -> Self {
        Self { config, session }
    }

    /// Run the collector until interrupted
    ///
    /// # Errors
    ///
    /// Returns an error when the REST client cannot be constructed or the
    /// stream exhausts its connect retries. Everything else is retried or
    /// logged internally.
    pub async fn run(self) -> Result<()> {
        let monitor_id = self.session.monitor_id.clone();
        tracing::info!(monitor_id, "collector starting");

        let sink: Arc<dyn TelemetrySink> = Arc::new(InfluxSink::spawn(self.config.influx.clone()));
        let client = Arc::new(ApiClient::new(&self.config.api, &self.session)?);
        let cache = EntityCache::new(self.config.lookup.cache_ttl);
        let (queue, lookup_rx) = EnrichmentQueue::new();
        let join = Arc::new(NameResolutionJoin::new(cache.clone(), Arc::clone(&sink)));
        let shutdown = Arc::new(Notify::new());

        let dispatcher = EventDispatcher::new(
            monitor_id.clone(),
            cache.clone(),
            queue.clone(),
            Arc::clone(&sink),
        );

        let mut tasks: Vec<JoinHandle<()>> = spawn_workers(
            lookup_rx,
            WorkerContext {
                fetcher: client.clone(),
                cache: cache.clone(),
                join: Arc::clone(&join),
                sink: Arc::clone(&sink),
                monitor_id: monitor_id.clone(),
                lookup_delay: self.config.lookup.delay,
                shutdown: Arc::clone(&shutdown),
            },
            self.config.lookup.workers,
        );
        tasks.push(tokio::spawn(
            Arc::clone(&join).run(Arc::clone(&shutdown)),
        ));
        tasks.push(pollers::spawn_status_poller(
            Arc::clone(&client),
            Arc::clone(&sink),
            monitor_id.clone(),
            self.config.poll.status_interval,
            Arc::clone(&shutdown),
        ));
        tasks.push(pollers::spawn_inventory_poller(
            Arc::clone(&client),
            queue.clone(),
            self.config.poll.inventory_interval,
            Arc::clone(&shutdown),
        ));
        tasks.push(pollers::spawn_timeline_poller(
            Arc::clone(&client),
            dispatcher.clone(),
            self.config.poll.timeline_interval,
            Arc::clone(&shutdown),
        ));

        let stream_url = format!(
            "{}/monitors/{}/realtimefeed",
            self.config.api.stream_base.as_str().trim_end_matches('/'),
            monitor_id,
        );
        let manager = ConnectionManager::new(
            self.config.stream.clone(),
            stream_url,
            self.session.token.clone(),
            dispatcher,
            Arc::clone(&shutdown),
        );
        let mut stream_task = tokio::spawn(manager.run());

        // Interrupt signal, forwarded so the select below stays readable
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(()).await;
            }
        });

        let result = tokio::select! {
            _ = shutdown_rx.recv() => {
                tracing::info!("shutdown requested");
                Ok(())
            }
            joined = &mut stream_task => match joined {
                Ok(outcome) => outcome,
                Err(e) => Err(Error::Stream(format!("stream task failed: {e}"))),
            },
        };

        shutdown.notify_waiters();
        // closing the queue lets idle workers drain out instead of parking
        drop(queue);

        if !stream_task.is_finished()
            && tokio::time::timeout(SHUTDOWN_GRACE, &mut stream_task)
                .await
                .is_err()
        {
            stream_task.abort();
        }
        for mut task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }

        sink.flush().await;
        tracing::info!("collector stopped");
        result
    }
}
