//! Tap: managed backfill/indexer channel with per-event acks.
//!
//! A Tap server tracks a set of repos, replays their existing records,
//! and then follows the live firehose, delivering everything over one
//! WebSocket at `/channel`. Delivery is at-least-once: every event
//! carries an `id`, and the server redelivers until the client acks
//! it. The ack is emitted only after the user handler returns
//! successfully, so an event is never acknowledged before it has been
//! handled.
//!
//! The companion HTTP admin API lives in [`admin`].
//!
//! # Example
//!
//! ```rust,ignore
//! use atstream::{TapConfig, TapHandle};
//!
//! let mut config = TapConfig::new("wss://tap.example.com");
//! config.admin_password = Some("hunter2".to_string().into());
//!
//! let handle = TapHandle::connect(config, |event| async move {
//!     index(event).await?; // returning Err leaves the event unacked
//!     Ok(())
//! })
//! .await?;
//! ```

pub mod admin;
pub mod events;

use std::future::Future;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::TapConfig;
use crate::dispatch::{BoxError, Dispatcher, HandlerOutcome};
use crate::engine::{DisconnectReason, Engine, Frame, OutboundFrame, StreamAdapter};
use crate::error::Error;
use events::TapEvent;

const CHANNEL_PATH: &str = "/channel";

/// Acks queued behind this many in-flight handler completions are
/// dropped (the server redelivers after its own timeout).
const ACK_CHANNEL_CAPACITY: usize = 1024;

// ── Handle ───────────────────────────────────────────────────────────

/// Handle to a running Tap channel subscription.
pub struct TapHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<(), Error>>,
    // Keeps the ack channel open even if every dispatch task has
    // finished.
    _commands: mpsc::Sender<TapCommand>,
}

impl TapHandle {
    /// Validate the config and spawn the stream engine.
    ///
    /// The handler's outcome drives the ack policy: `Ok(())` acks the
    /// event, `Err(_)` and panics leave it unacked for the server to
    /// redeliver.
    pub async fn connect<H, Fut>(config: TapConfig, handler: H) -> Result<Self, Error>
    where
        H: Fn(TapEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel(ACK_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let adapter = TapAdapter {
            dispatcher: Dispatcher::from_fallible(handler),
            acks: command_tx.clone(),
            disable_acks: config.disable_acks,
            auth_header: config.admin_password.as_ref().map(basic_auth_header),
        };
        let engine = Engine::new(config.connection, adapter, command_rx, cancel.clone())?;

        Ok(Self {
            cancel,
            task: engine.spawn(),
            _commands: command_tx,
        })
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

/// `Authorization` value for Tap's fixed `admin` user.
pub(crate) fn basic_auth_header(password: &SecretString) -> String {
    let credentials = format!("admin:{}", password.expose_secret());
    format!("Basic {}", BASE64.encode(credentials))
}

// ── Adapter ──────────────────────────────────────────────────────────

pub(crate) enum TapCommand {
    Ack(u64),
}

#[derive(Serialize)]
struct AckFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    id: u64,
}

struct TapAdapter {
    dispatcher: Dispatcher<TapEvent>,
    acks: mpsc::Sender<TapCommand>,
    disable_acks: bool,
    auth_header: Option<String>,
}

impl StreamAdapter for TapAdapter {
    type Command = TapCommand;

    fn build_path(&mut self) -> String {
        CHANNEL_PATH.to_string()
    }

    fn upgrade_headers(&self) -> Vec<(&'static str, String)> {
        match &self.auth_header {
            Some(value) => vec![("Authorization", value.clone())],
            None => Vec::new(),
        }
    }

    fn on_disconnected(&mut self, reason: &DisconnectReason) {
        debug!(reason = %reason, "tap session ended");
    }

    async fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Text(text) => self.handle_text(&text),
            Frame::Binary(_) => warn!("unexpected binary frame on tap channel, dropping"),
            Frame::Close | Frame::CloseWithCode(..) => {}
        }
    }

    fn handle_command(&mut self, command: TapCommand) -> Option<OutboundFrame> {
        let TapCommand::Ack(id) = command;
        match serde_json::to_string(&AckFrame { kind: "ack", id }) {
            Ok(json) => Some(OutboundFrame::Text(json)),
            Err(error) => {
                error!(error = %error, id, "failed to encode ack frame");
                None
            }
        }
    }
}

impl TapAdapter {
    fn handle_text(&mut self, text: &str) {
        let event = match TapEvent::parse(text) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!("ignoring event with unknown type");
                return;
            }
            // Decode failures are dropped without ack; the server will
            // redeliver.
            Err(error) => {
                warn!(error = %error, "dropping undecodable event without ack");
                return;
            }
        };

        if self.disable_acks {
            self.dispatcher.dispatch(event);
            return;
        }

        let id = event.id();
        let acks = self.acks.clone();
        self.dispatcher.dispatch_tracked(event, move |outcome| {
            if outcome == HandlerOutcome::Ok {
                if acks.try_send(TapCommand::Ack(id)).is_err() {
                    warn!(id, "ack queue full or closed, dropping ack");
                }
            }
        });
    }
}

// ── Tests ────────────────────────────────────────────────────────────
