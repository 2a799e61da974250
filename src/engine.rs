//! Connection engine shared by all three stream adapters.
//!
//! A four-state machine owned by a single spawned task:
//! `Disconnected → ConnectingHttp → ConnectingWs → Connected`. The
//! engine opens the TCP+TLS transport, performs the WebSocket upgrade
//! against the adapter's current path, and feeds inbound frames to the
//! adapter. Transient failures (timeouts, non-101 upgrades, remote
//! closes, dropped sockets) route through the reconnect path with
//! exponential backoff + jitter; transport open and TLS setup failures
//! are fatal and terminate the task.
//!
//! The engine performs no payload parsing -- framing, cursors, and
//! delivery semantics live in the adapters.

use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{ConnectionConfig, ReconnectStrategy};
use crate::error::Error;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

const BACKOFF_BASE: Duration = Duration::from_secs(1);

// ── Frames ───────────────────────────────────────────────────────────

/// Inbound frame delivered to an adapter, unparsed.
#[derive(Debug)]
pub(crate) enum Frame {
    Binary(Vec<u8>),
    Text(String),
    Close,
    CloseWithCode(u16, String),
}

/// Outbound control frame queued by an adapter (Jetstream filter
/// updates, Tap acks).
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum OutboundFrame {
    Text(String),
}

impl OutboundFrame {
    fn into_message(self) -> Message {
        match self {
            Self::Text(text) => Message::Text(text),
        }
    }
}

/// Why a live session ended (or an attempt failed). Transient by
/// definition -- fatal conditions terminate the engine instead.
#[derive(Debug)]
pub(crate) enum DisconnectReason {
    ConnectTimeout,
    UpgradeTimeout,
    UpgradeFailed(String),
    Transport(String),
    RemoteClose,
    StreamEnded,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectTimeout => f.write_str("connect timeout"),
            Self::UpgradeTimeout => f.write_str("upgrade timeout"),
            Self::UpgradeFailed(detail) => write!(f, "upgrade failed: {detail}"),
            Self::Transport(detail) => write!(f, "transport error: {detail}"),
            Self::RemoteClose => f.write_str("closed by server"),
            Self::StreamEnded => f.write_str("stream ended"),
        }
    }
}

// ── Adapter contract ─────────────────────────────────────────────────

/// The capability set a stream adapter exposes to the engine.
///
/// Firehose, Jetstream, and Tap are variants of this one contract; the
/// engine is generic over it and owns the adapter for the lifetime of
/// the stream instance. All methods run on the engine task, so adapter
/// state needs no synchronization.
pub(crate) trait StreamAdapter: Send + 'static {
    /// Commands reach the adapter from the outside world (handle
    /// methods, dispatcher completions) through the engine's command
    /// channel.
    type Command: Send + 'static;

    /// Request path (with query) for the upgrade. Called on every
    /// (re)connect so adapters can embed their current cursor.
    fn build_path(&mut self) -> String;

    /// Extra headers for the upgrade request.
    fn upgrade_headers(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    fn on_connected(&mut self) {}

    fn on_disconnected(&mut self, _reason: &DisconnectReason) {}

    /// Handle one inbound frame. Decode failures are the adapter's to
    /// log and drop; returning keeps the connection alive.
    fn handle_frame(&mut self, frame: Frame) -> impl Future<Output = ()> + Send;

    /// Apply a command, optionally producing an outbound frame. The
    /// frame is sent if a session is live and discarded otherwise;
    /// state changes made here stick either way.
    fn handle_command(&mut self, command: Self::Command) -> Option<OutboundFrame>;
}

// ── Backoff ──────────────────────────────────────────────────────────

/// Reconnect delay for the given attempt.
///
/// Exponential strategy: `min(1s * 2^attempt, max_backoff)` stretched
/// by a jitter factor in `[1.0, 1.1]`, seeded deterministically from
/// the attempt number to spread reconnection storms without a PRNG
/// dependency.
pub(crate) fn backoff_delay(strategy: &ReconnectStrategy, attempt: u32) -> Duration {
    match strategy {
        ReconnectStrategy::Custom(delay_for) => delay_for(attempt),
        ReconnectStrategy::Exponential { max_backoff } => {
            let base = BACKOFF_BASE.as_secs_f64() * 2.0_f64.powi(attempt.min(63) as i32);
            let capped = base.min(max_backoff.as_secs_f64());
            let unit = ((f64::from(attempt) * 7.3).sin() + 1.0) / 2.0;
            Duration::from_secs_f64(capped * (1.0 + 0.1 * unit))
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────────

enum Attempt {
    Fatal(Error),
    Retry(DisconnectReason),
}

enum SessionEnd {
    Shutdown,
    Reconnect(DisconnectReason),
}

pub(crate) struct Engine<A: StreamAdapter> {
    url: Url,
    config: ConnectionConfig,
    tls: native_tls::TlsConnector,
    adapter: A,
    commands: mpsc::Receiver<A::Command>,
    cancel: CancellationToken,
    attempts: u32,
}

impl<A: StreamAdapter> Engine<A> {
    /// Validate the connection config and bind it to an adapter.
    /// Errors here are initialization failures returned straight to
    /// the caller; nothing has been spawned yet.
    pub(crate) fn new(
        config: ConnectionConfig,
        adapter: A,
        commands: mpsc::Receiver<A::Command>,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let url = config.websocket_url()?;
        if url.host_str().is_none() {
            return Err(Error::InvalidConfig {
                message: "host URL has no host component".into(),
            });
        }
        let tls = config.tls.connector()?;
        Ok(Self {
            url,
            config,
            tls,
            adapter,
            commands,
            cancel,
            attempts: 0,
        })
    }

    pub(crate) fn spawn(self) -> tokio::task::JoinHandle<Result<(), Error>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<(), Error> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            // Commands issued while disconnected still mutate adapter
            // state (e.g. Jetstream filters) before the next path is
            // built; their outbound frames have nowhere to go.
            self.apply_pending_commands();

            let transport = match self.open_transport().await {
                Ok(transport) => transport,
                Err(Attempt::Fatal(error)) => {
                    tracing::error!(error = %error, "transport open failed, terminating engine");
                    return Err(error);
                }
                Err(Attempt::Retry(reason)) => {
                    if self.reconnect_pause(reason).await.is_break() {
                        return Ok(());
                    }
                    continue;
                }
            };

            let socket = match self.upgrade(transport).await {
                Ok(socket) => socket,
                Err(Attempt::Fatal(error)) => {
                    tracing::error!(error = %error, "upgrade failed fatally, terminating engine");
                    return Err(error);
                }
                Err(Attempt::Retry(reason)) => {
                    if self.reconnect_pause(reason).await.is_break() {
                        return Ok(());
                    }
                    continue;
                }
            };

            match self.connected(socket).await {
                SessionEnd::Shutdown => return Ok(()),
                SessionEnd::Reconnect(reason) => {
                    if self.reconnect_pause(reason).await.is_break() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// ConnectingHttp: open the TCP transport. A timeout is transient;
    /// a socket error (DNS, refused) is an initialization-class
    /// failure the caller's supervisor must decide about.
    async fn open_transport(&mut self) -> Result<TcpStream, Attempt> {
        let host = self.url.host_str().ok_or_else(|| {
            Attempt::Fatal(Error::InvalidConfig {
                message: "host URL has no host component".into(),
            })
        })?;
        let port = self
            .url
            .port_or_known_default()
            .unwrap_or(if self.url.scheme() == "wss" { 443 } else { 80 });

        tracing::info!(host, port, attempt = self.attempts, "opening transport");

        match timeout(self.config.timeout, TcpStream::connect((host, port))).await {
            Err(_) => Err(Attempt::Retry(DisconnectReason::ConnectTimeout)),
            Ok(Err(error)) => Err(Attempt::Fatal(Error::Connect(error.to_string()))),
            Ok(Ok(stream)) => Ok(stream),
        }
    }

    /// ConnectingWs: TLS handshake (for `wss`) + WebSocket upgrade on
    /// the open transport, against the adapter's freshly built path.
    async fn upgrade(&mut self, transport: TcpStream) -> Result<WsStream, Attempt> {
        let path = self.adapter.build_path();
        let target = self
            .url
            .join(&path)
            .map_err(|e| Attempt::Fatal(Error::InvalidUrl(e)))?;
        let uri: tungstenite::http::Uri = target.as_str().parse().map_err(
            |e: tungstenite::http::uri::InvalidUri| {
                Attempt::Fatal(Error::InvalidConfig {
                    message: format!("invalid upgrade URI: {e}"),
                })
            },
        )?;

        let mut request = ClientRequestBuilder::new(uri);
        for (name, value) in self.adapter.upgrade_headers() {
            request = request.with_header(name, value);
        }

        tracing::debug!(url = %target, "upgrading to WebSocket");

        let connector = Some(Connector::NativeTls(self.tls.clone()));
        match timeout(
            self.config.timeout,
            client_async_tls_with_config(request, transport, None, connector),
        )
        .await
        {
            Err(_) => Err(Attempt::Retry(DisconnectReason::UpgradeTimeout)),
            Ok(Err(tungstenite::Error::Tls(error))) => {
                Err(Attempt::Fatal(Error::Tls(error.to_string())))
            }
            Ok(Err(tungstenite::Error::Http(response))) => Err(Attempt::Retry(
                DisconnectReason::UpgradeFailed(format!("HTTP {}", response.status())),
            )),
            Ok(Err(error)) => Err(Attempt::Retry(DisconnectReason::UpgradeFailed(
                error.to_string(),
            ))),
            Ok(Ok((socket, _response))) => Ok(socket),
        }
    }

    /// Connected: pump frames to the adapter and commands/control
    /// frames back out until the session ends.
    async fn connected(&mut self, socket: WsStream) -> SessionEnd {
        tracing::info!("WebSocket connected");
        self.adapter.on_connected();
        self.attempts = 0;

        let (mut write, read) = socket.split();
        // Ingress credit: drain up to `flow` ready frames per cycle.
        let mut read = read.ready_chunks(self.config.flow.max(1));

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    let _ = write.flush().await;
                    return SessionEnd::Shutdown;
                }
                command = next_command(&mut self.commands) => {
                    if let Some(frame) = self.adapter.handle_command(command) {
                        if let Err(error) = write.send(frame.into_message()).await {
                            return SessionEnd::Reconnect(DisconnectReason::Transport(error.to_string()));
                        }
                    }
                }
                batch = read.next() => {
                    let Some(batch) = batch else {
                        return SessionEnd::Reconnect(DisconnectReason::StreamEnded);
                    };
                    for message in batch {
                        if let Some(end) = self.ingest(message, &mut write).await {
                            return end;
                        }
                    }
                }
            }
        }
    }

    /// Handle one inbound message; `Some` ends the session.
    async fn ingest(
        &mut self,
        message: Result<Message, tungstenite::Error>,
        write: &mut WsSink,
    ) -> Option<SessionEnd> {
        match message {
            Ok(Message::Binary(data)) => {
                self.adapter.handle_frame(Frame::Binary(data)).await;
                None
            }
            Ok(Message::Text(text)) => {
                self.adapter.handle_frame(Frame::Text(text)).await;
                None
            }
            Ok(Message::Ping(payload)) => match write.send(Message::Pong(payload)).await {
                Ok(()) => None,
                Err(error) => Some(SessionEnd::Reconnect(DisconnectReason::Transport(
                    error.to_string(),
                ))),
            },
            Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => None,
            Ok(Message::Close(close)) => {
                let frame = match close {
                    Some(cf) => {
                        tracing::info!(code = %cf.code, reason = %cf.reason, "close frame received");
                        Frame::CloseWithCode(cf.code.into(), cf.reason.into_owned())
                    }
                    None => {
                        tracing::info!("close frame received (no payload)");
                        Frame::Close
                    }
                };
                self.adapter.handle_frame(frame).await;
                Some(SessionEnd::Reconnect(DisconnectReason::RemoteClose))
            }
            Err(error) => Some(SessionEnd::Reconnect(DisconnectReason::Transport(
                error.to_string(),
            ))),
        }
    }

    /// Reconnect path: notify the adapter, compute the backoff, and
    /// sleep unless shutdown wins the race.
    async fn reconnect_pause(&mut self, reason: DisconnectReason) -> ControlFlow<()> {
        self.adapter.on_disconnected(&reason);

        let delay = backoff_delay(&self.config.reconnect, self.attempts);
        tracing::info!(
            reason = %reason,
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "waiting before reconnect"
        );
        self.attempts += 1;

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => ControlFlow::Break(()),
            _ = tokio::time::sleep(delay) => ControlFlow::Continue(()),
        }
    }

    fn apply_pending_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            if self.adapter.handle_command(command).is_some() {
                tracing::debug!("discarding outbound frame queued while disconnected");
            }
        }
    }
}

/// Receive the next command, parking forever once all senders are
/// gone -- the cancellation token is the sole shutdown signal.
async fn next_command<C>(commands: &mut mpsc::Receiver<C>) -> C {
    match commands.recv().await {
        Some(command) => command,
        None => std::future::pending().await,
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn backoff_stays_in_jitter_envelope() {
        let strategy = ReconnectStrategy::default();
        for attempt in 0..4u32 {
            let delay = backoff_delay(&strategy, attempt).as_secs_f64();
            let base = 2.0_f64.powi(attempt as i32);
            assert!(
                delay >= base && delay <= base * 1.1,
                "attempt {attempt}: {delay}s outside [{base}, {}]",
                base * 1.1
            );
        }
    }

    #[test]
    fn backoff_caps_at_max_backoff() {
        let strategy = ReconnectStrategy::Exponential {
            max_backoff: Duration::from_secs(60),
        };
        for attempt in 6..16u32 {
            let delay = backoff_delay(&strategy, attempt).as_secs_f64();
            assert!(
                (60.0..=66.0).contains(&delay),
                "attempt {attempt}: {delay}s outside [60, 66]"
            );
        }
    }

    #[test]
    fn backoff_respects_small_caps() {
        let strategy = ReconnectStrategy::Exponential {
            max_backoff: Duration::from_secs(4),
        };
        let delay = backoff_delay(&strategy, 10).as_secs_f64();
        assert!((4.0..=4.4).contains(&delay));
    }

    #[test]
    fn custom_strategy_is_used_verbatim() {
        let strategy =
            ReconnectStrategy::Custom(Arc::new(|attempt| Duration::from_millis(u64::from(attempt) * 250)));
        assert_eq!(backoff_delay(&strategy, 0), Duration::ZERO);
        assert_eq!(backoff_delay(&strategy, 4), Duration::from_secs(1));
    }

    #[test]
    fn backoff_is_deterministic_per_attempt() {
        let strategy = ReconnectStrategy::default();
        assert_eq!(backoff_delay(&strategy, 3), backoff_delay(&strategy, 3));
    }
}
