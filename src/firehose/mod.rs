//! Firehose stream: `com.atproto.sync.subscribeRepos`.
//!
//! Subscribes to a relay's raw repository event stream. Frames are
//! pairs of consecutive DagCBOR items (header, then payload); events
//! are dispatched in wire order with strict sequence monotonicity, and
//! the cursor is re-embedded in the upgrade path on every reconnect so
//! the server resumes from the last accepted `seq`.
//!
//! # Example
//!
//! ```rust,ignore
//! use atstream::{FirehoseConfig, FirehoseHandle};
//!
//! let mut config = FirehoseConfig::new("wss://bsky.network");
//! config.cursor = Some(1000);
//!
//! let handle = FirehoseHandle::connect(config, |event| async move {
//!     println!("{:?}", event.seq());
//! })
//! .await?;
//!
//! // ... later:
//! handle.shutdown();
//! ```

pub mod events;

use std::future::Future;
use std::io::Cursor;

use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::FirehoseConfig;
use crate::dispatch::Dispatcher;
use crate::engine::{DisconnectReason, Engine, Frame, OutboundFrame, StreamAdapter};
use crate::error::Error;
use events::FirehoseEvent;

const SUBSCRIBE_REPOS_PATH: &str = "/xrpc/com.atproto.sync.subscribeRepos";

// ── Handle ───────────────────────────────────────────────────────────

/// Handle to a running firehose subscription.
pub struct FirehoseHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<(), Error>>,
    cursor: watch::Receiver<Option<i64>>,
    // Keeps the engine's command channel open; the firehose has no
    // outbound control frames.
    _commands: mpsc::Sender<FirehoseCommand>,
}

impl FirehoseHandle {
    /// Validate the config and spawn the stream engine.
    ///
    /// `handler` is invoked on its own task per event; panics inside
    /// it are contained and logged. Returns once the engine task is
    /// running -- the first connection attempt happens asynchronously.
    pub async fn connect<H, Fut>(config: FirehoseConfig, handler: H) -> Result<Self, Error>
    where
        H: Fn(FirehoseEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (cursor_tx, cursor_rx) = watch::channel(config.cursor);
        let (command_tx, command_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let adapter = FirehoseAdapter {
            cursor: config.cursor,
            cursor_tx,
            dispatcher: Dispatcher::from_infallible(handler),
        };
        let engine = Engine::new(config.connection, adapter, command_rx, cancel.clone())?;

        Ok(Self {
            cancel,
            task: engine.spawn(),
            cursor: cursor_rx,
            _commands: command_tx,
        })
    }

    /// Last sequence number handed to dispatch. Persist this to resume
    /// across process restarts.
    pub fn cursor(&self) -> Option<i64> {
        *self.cursor.borrow()
    }

    /// Signal the engine to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for the engine task to finish, surfacing fatal errors.
    pub async fn join(self) -> Result<(), Error> {
        match self.task.await {
            Ok(result) => result,
            Err(error) => Err(Error::WebSocket(format!("engine task aborted: {error}"))),
        }
    }
}

// ── Adapter ──────────────────────────────────────────────────────────

/// The firehose never sends application frames upstream.
pub(crate) enum FirehoseCommand {}

struct FirehoseAdapter {
    cursor: Option<i64>,
    cursor_tx: watch::Sender<Option<i64>>,
    dispatcher: Dispatcher<FirehoseEvent>,
}

impl StreamAdapter for FirehoseAdapter {
    type Command = FirehoseCommand;

    fn build_path(&mut self) -> String {
        match self.cursor {
            Some(seq) => format!("{SUBSCRIBE_REPOS_PATH}?cursor={seq}"),
            None => SUBSCRIBE_REPOS_PATH.to_string(),
        }
    }

    fn on_disconnected(&mut self, reason: &DisconnectReason) {
        debug!(reason = %reason, cursor = ?self.cursor, "firehose session ended");
    }

    async fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Binary(data) => self.handle_binary(&data).await,
            Frame::Text(_) => warn!("unexpected text frame on firehose stream, dropping"),
            Frame::Close | Frame::CloseWithCode(..) => {}
        }
    }

    fn handle_command(&mut self, command: FirehoseCommand) -> Option<OutboundFrame> {
        match command {}
    }
}

impl FirehoseAdapter {
    async fn handle_binary(&mut self, data: &[u8]) {
        let (header, offset) = match decode_frame_header(data) {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!(error = %error, "dropping frame with undecodable header");
                return;
            }
        };
        let payload = &data[offset..];

        if header.op != 1 {
            if header.op == -1 {
                match serde_ipld_dagcbor::from_slice::<ErrorPayload>(payload) {
                    Ok(payload) => error!(
                        error = ?payload.error,
                        message = ?payload.message,
                        "firehose error frame"
                    ),
                    Err(_) => error!("firehose error frame (undecodable payload)"),
                }
            } else {
                warn!(op = header.op, "dropping frame with unknown op");
            }
            return;
        }

        let Some(t) = header.t.as_deref() else {
            warn!("dropping regular frame with no event type tag");
            return;
        };

        let event = match FirehoseEvent::parse(t, payload).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(event_type = %t, "ignoring unknown event type");
                return;
            }
            Err(error) => {
                warn!(event_type = %t, error = %error, "dropping undecodable event");
                return;
            }
        };

        let seq = event.seq();
        if !valid_seq(self.cursor, seq) {
            warn!(last_seq = ?self.cursor, seq = ?seq, "dropping out-of-sequence event");
            return;
        }

        self.dispatcher.dispatch(event);

        if let Some(seq) = seq {
            self.cursor = Some(seq);
            let _ = self.cursor_tx.send(Some(seq));
        }
    }
}

// ── Frame header ─────────────────────────────────────────────────────

/// Frame header: first of the two CBOR items in each binary frame.
#[derive(Debug, Deserialize)]
struct FrameHeader {
    /// 1 = regular message, -1 = error.
    op: i64,
    /// Event type tag, e.g. `#commit`.
    #[serde(default)]
    t: Option<String>,
}

/// Error payload carried by `op = -1` frames.
#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Decode the header and return it with the byte offset where the
/// payload item starts.
fn decode_frame_header(data: &[u8]) -> Result<(FrameHeader, usize), Error> {
    let mut cursor = Cursor::new(data);
    let header: FrameHeader = ciborium::from_reader(&mut cursor)
        .map_err(|e| Error::Decode(format!("failed to decode frame header: {e}")))?;
    let offset = cursor.position() as usize;
    Ok((header, offset))
}

// ── Sequence validation ──────────────────────────────────────────────

/// Accepts the first sequenced event, any unsequenced event, and any
/// strictly increasing step. Everything else is a protocol violation.
fn valid_seq(last: Option<i64>, next: Option<i64>) -> bool {
    match (last, next) {
        (_, None) => true,
        (None, Some(_)) => true,
        (Some(last), Some(next)) => next > last,
    }
}

// ── Tests ────────────────────────────────────────────────────────────
