//! Realtime stream session management
//!
//! Owns the websocket lifecycle: connect with bounded retries, read with a
//! heartbeat watchdog, recycle the session on a fixed rotation interval,
//! and reconnect with exponential backoff after unplanned disconnects.
//! Frames are handed straight to the [`EventDispatcher`]; nothing here
//! inspects payloads.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::Result;
use crate::client::auth_headers;
use crate::config::StreamConfig;
use crate::dispatch::EventDispatcher;

/// Application-level keepalive, sent when the read side goes quiet
const PING_FRAME: &str = r#"{"type":"ping"}"#;

type WsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why the read loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    /// Session hit its rotation deadline and was recycled on purpose
    Rotation,

    /// Server closed the stream
    Closed,

    /// Nothing received within the heartbeat timeout
    Stale,

    /// Transport-level failure
    TransportError,

    /// Process shutdown requested
    Shutdown,
}

/// Reconnect delay schedule, doubling per consecutive failure up to a cap
///
/// A rotation exit resets the schedule; a successful connect does not, so
/// a session that keeps dying right after connect still backs off.
#[derive(Debug)]
struct ReconnectPolicy {
    initial: Duration,
    cap: Duration,
    next: Duration,
}

impl ReconnectPolicy {
    fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            cap,
            next: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.cap);
        delay
    }

    fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Connect-time backoff: `factor * 2^attempt` seconds
fn connect_backoff(factor: u32, attempt: u32) -> Duration {
    Duration::from_secs(u64::from(factor).saturating_mul(2_u64.saturating_pow(attempt)))
}

/// Long-running websocket session driver
pub struct ConnectionManager {
    config: StreamConfig,
    url: String,
    token: String,
    dispatcher: EventDispatcher,
    shutdown: Arc<Notify>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(
        config: StreamConfig,
        url: String,
        token: String,
        dispatcher: EventDispatcher,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            config,
            url,
            token,
            dispatcher,
            shutdown,
        }
    }

    /// Drive connect/read/reconnect until shutdown
    ///
    /// # Errors
    ///
    /// Returns an error only when a connect sequence exhausts its retry
    /// budget. Everything else reconnects internally.
    pub async fn run(self) -> Result<()> {
        let mut policy = ReconnectPolicy::new(
            self.config.reconnect_delay_initial,
            self.config.reconnect_delay_cap,
        );

        loop {
            let socket = self.connect().await?;

            match self.read_loop(socket).await {
                LoopExit::Shutdown => {
                    tracing::info!("stream shutting down");
                    return Ok(());
                }
                LoopExit::Rotation => {
                    policy.reset();
                }
                exit => {
                    let delay = policy.next_delay();
                    tracing::info!(
                        reason = ?exit,
                        delay_secs = delay.as_secs(),
                        "stream disconnected, waiting before reconnect"
                    );
                    if wait_or_shutdown(delay, &self.shutdown).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn connect(&self) -> Result<WsSocket> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.try_connect().await {
                Ok(socket) => {
                    tracing::info!(url = %self.url, "stream connected");
                    return Ok(socket);
                }
                Err(e) if attempt >= self.config.max_retries => {
                    tracing::error!(error = %e, attempt, "stream connect retries exhausted");
                    return Err(e);
                }
                Err(e) => {
                    let delay = connect_backoff(self.config.backoff_factor, attempt - 1);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_secs = delay.as_secs(),
                        "stream connect failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<WsSocket> {
        let mut request = self.url.as_str().into_client_request()?;
        request.headers_mut().extend(auth_headers(&self.token)?);

        let (socket, _response) = connect_async(request).await?;
        Ok(socket)
    }

    async fn read_loop(&self, socket: WsSocket) -> LoopExit {
        let (mut writer, mut reader) = socket.split();
        let session_started = Instant::now();
        let rotation_deadline = session_started + self.config.rotation_interval;
        let mut last_activity = Instant::now();
        let mut last_heartbeat = Instant::now();

        let exit = loop {
            let received = tokio::select! {
                received = tokio::time::timeout(self.config.heartbeat_interval, reader.next()) => received,
                () = self.shutdown.notified() => break LoopExit::Shutdown,
            };

            match received {
                Ok(Some(Ok(Message::Text(frame)))) => {
                    self.dispatcher.dispatch(frame.as_str()).await;
                    last_activity = Instant::now();
                }
                Ok(Some(Ok(Message::Close(_))) | None) => {
                    tracing::warn!("stream closed by server");
                    break LoopExit::Closed;
                }
                Ok(Some(Ok(_))) => {
                    // binary, ping and pong frames carry no telemetry
                    last_activity = Instant::now();
                }
                Ok(Some(Err(e))) => {
                    tracing::error!(error = %e, "stream transport error");
                    break LoopExit::TransportError;
                }
                Err(_) => {
                    if last_activity.elapsed() > self.config.heartbeat_timeout {
                        tracing::error!(
                            idle_secs = last_activity.elapsed().as_secs(),
                            "no traffic within the heartbeat timeout"
                        );
                        break LoopExit::Stale;
                    }
                    if last_heartbeat.elapsed() > self.config.heartbeat_interval {
                        if let Err(e) = writer.send(Message::text(PING_FRAME)).await {
                            tracing::error!(error = %e, "ping send failed");
                            break LoopExit::TransportError;
                        }
                        tracing::debug!("ping sent");
                        last_heartbeat = Instant::now();
                    }
                }
            }

            if Instant::now() > rotation_deadline {
                tracing::info!(
                    session_secs = session_started.elapsed().as_secs(),
                    "rotation deadline reached, recycling the session"
                );
                break LoopExit::Rotation;
            }
        };

        if let Err(e) = writer.close().await {
            tracing::debug!(error = %e, "stream close handshake failed");
        }
        exit
    }
}

/// Sleep for `duration`, returning early with `true` on shutdown
pub(crate) async fn wait_or_shutdown(duration: Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => false,
        () = shutdown.notified() => true,
    }
}
