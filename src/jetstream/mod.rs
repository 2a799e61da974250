//! Jetstream: filtered, zstd-compressed JSON event stream.
//!
//! Jetstream trades the firehose's full-fidelity CAR frames for
//! lightweight JSON, server-side collection/DID filtering, and
//! per-frame zstd compression against a shared dictionary. The cursor
//! is the event's `time_us` and is re-embedded in the upgrade path on
//! every reconnect. Filters can be updated on a live connection with
//! [`JetstreamHandle::update_options`].
//!
//! # Example
//!
//! ```rust,ignore
//! use atstream::{JetstreamConfig, JetstreamHandle};
//!
//! let mut config = JetstreamConfig::new("wss://jetstream2.us-east.bsky.network");
//! config.wanted_collections = vec!["app.bsky.feed.post".into()];
//!
//! let handle = JetstreamHandle::connect(config, |event| async move {
//!     println!("{} @ {}", event.did(), event.time_us());
//! })
//! .await?;
//! ```

pub(crate) mod dictionary;
pub mod events;

use std::future::Future;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::form_urlencoded;
use zstd::bulk::Decompressor;

use crate::config::{JetstreamConfig, MAX_WANTED_COLLECTIONS, MAX_WANTED_DIDS};
use crate::dispatch::Dispatcher;
use crate::engine::{DisconnectReason, Engine, Frame, OutboundFrame, StreamAdapter};
use crate::error::Error;
use events::JetstreamEvent;

const SUBSCRIBE_PATH: &str = "/subscribe";

/// Decompression bound applied when the config sets no message size
/// cap.
const DEFAULT_MAX_DECOMPRESSED: usize = 16 * 1024 * 1024;

// ── Options update ───────────────────────────────────────────────────

/// Partial filter update sent over a live connection. Only provided
/// fields appear in the control frame; an empty list clears that
/// filter.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wanted_collections: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wanted_dids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_size_bytes: Option<u64>,
}

#[derive(Serialize)]
struct OptionsUpdateFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    payload: &'a OptionsUpdate,
}

pub(crate) enum JetstreamCommand {
    UpdateOptions(OptionsUpdate),
}

// ── Handle ───────────────────────────────────────────────────────────

/// Handle to a running Jetstream subscription.
pub struct JetstreamHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<(), Error>>,
    cursor: watch::Receiver<Option<u64>>,
    commands: mpsc::Sender<JetstreamCommand>,
}

impl JetstreamHandle {
    /// Validate the config and spawn the stream engine.
    pub async fn connect<H, Fut>(config: JetstreamConfig, handler: H) -> Result<Self, Error>
    where
        H: Fn(JetstreamEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        config.validate()?;

        let decompressor = dictionary::new_decompressor().map_err(|e| Error::InvalidConfig {
            message: format!("failed to initialize zstd dictionary: {e}"),
        })?;

        let (cursor_tx, cursor_rx) = watch::channel(config.cursor);
        let (command_tx, command_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let adapter = JetstreamAdapter {
            wanted_collections: config.wanted_collections,
            wanted_dids: config.wanted_dids,
            max_message_size_bytes: config.max_message_size_bytes,
            require_hello: config.require_hello,
            cursor: config.cursor,
            cursor_tx,
            decompressor,
            dispatcher: Dispatcher::from_infallible(handler),
        };
        let engine = Engine::new(config.connection, adapter, command_rx, cancel.clone())?;

        Ok(Self {
            cancel,
            task: engine.spawn(),
            cursor: cursor_rx,
            commands: command_tx,
        })
    }

    /// Update the server-side filters on the live connection.
    ///
    /// The new values become authoritative immediately: they are used
    /// for every future reconnect even if the control frame never
    /// reaches the server (the server may also reject an invalid
    /// update by closing the connection, which rides the normal
    /// reconnect path).
    pub async fn update_options(&self, update: OptionsUpdate) -> Result<(), Error> {
        if let Some(collections) = &update.wanted_collections {
            if collections.len() > MAX_WANTED_COLLECTIONS {
                return Err(Error::InvalidConfig {
                    message: format!(
                        "wanted_collections has {} entries (limit {MAX_WANTED_COLLECTIONS})",
                        collections.len()
                    ),
                });
            }
        }
        if let Some(dids) = &update.wanted_dids {
            if dids.len() > MAX_WANTED_DIDS {
                return Err(Error::InvalidConfig {
                    message: format!(
                        "wanted_dids has {} entries (limit {MAX_WANTED_DIDS})",
                        dids.len()
                    ),
                });
            }
        }
        self.commands
            .send(JetstreamCommand::UpdateOptions(update))
            .await
            .map_err(|_| Error::Closed)
    }

    /// `time_us` of the last event handed to dispatch.
    pub fn cursor(&self) -> Option<u64> {
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

struct JetstreamAdapter {
    wanted_collections: Vec<String>,
    wanted_dids: Vec<String>,
    max_message_size_bytes: Option<u64>,
    require_hello: bool,
    cursor: Option<u64>,
    cursor_tx: watch::Sender<Option<u64>>,
    decompressor: Decompressor<'static>,
    dispatcher: Dispatcher<JetstreamEvent>,
}

impl StreamAdapter for JetstreamAdapter {
    type Command = JetstreamCommand;

    fn build_path(&mut self) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("compress", "true");
        for collection in &self.wanted_collections {
            query.append_pair("wantedCollections", collection);
        }
        for did in &self.wanted_dids {
            query.append_pair("wantedDids", did);
        }
        if let Some(cursor) = self.cursor {
            query.append_pair("cursor", &cursor.to_string());
        }
        if let Some(size) = self.max_message_size_bytes {
            query.append_pair("maxMessageSizeBytes", &size.to_string());
        }
        if self.require_hello {
            query.append_pair("requireHello", "true");
        }
        format!("{SUBSCRIBE_PATH}?{}", query.finish())
    }

    fn on_disconnected(&mut self, reason: &DisconnectReason) {
        debug!(reason = %reason, cursor = ?self.cursor, "jetstream session ended");
    }

    async fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Binary(data) => {
                let capacity = self
                    .max_message_size_bytes
                    .map(|n| n as usize)
                    .unwrap_or(DEFAULT_MAX_DECOMPRESSED);
                match self.decompressor.decompress(&data, capacity) {
                    Ok(bytes) => self.handle_payload(&bytes),
                    Err(error) => warn!(error = %error, "dropping undecompressable frame"),
                }
            }
            // Not expected under compress=true; parse as plain JSON.
            Frame::Text(text) => self.handle_payload(text.as_bytes()),
            Frame::Close | Frame::CloseWithCode(..) => {}
        }
    }

    fn handle_command(&mut self, command: JetstreamCommand) -> Option<OutboundFrame> {
        let JetstreamCommand::UpdateOptions(update) = command;

        let frame = match serde_json::to_string(&OptionsUpdateFrame {
            kind: "options_update",
            payload: &update,
        }) {
            Ok(json) => json,
            Err(error) => {
                error!(error = %error, "failed to encode options_update frame");
                return None;
            }
        };

        // The updated filters are authoritative for every future
        // build_path even if this frame never reaches the server.
        if let Some(collections) = update.wanted_collections {
            self.wanted_collections = collections;
        }
        if let Some(dids) = update.wanted_dids {
            self.wanted_dids = dids;
        }
        if let Some(size) = update.max_message_size_bytes {
            self.max_message_size_bytes = Some(size);
        }

        Some(OutboundFrame::Text(frame))
    }
}

impl JetstreamAdapter {
    fn handle_payload(&mut self, bytes: &[u8]) {
        let event = match JetstreamEvent::parse(bytes) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!("ignoring event with unknown kind");
                return;
            }
            Err(error) => {
                warn!(error = %error, "dropping undecodable event");
                return;
            }
        };

        let time_us = event.time_us();
        self.dispatcher.dispatch(event);

        // Cursor advances only once the event is in dispatch's hands,
        // so a reconnect resumes at or after the last event handed out.
        self.cursor = Some(time_us);
        let _ = self.cursor_tx.send(Some(time_us));
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn adapter() -> (JetstreamAdapter, mpsc::UnboundedReceiver<JetstreamEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cursor_tx, _) = watch::channel(None);
        let adapter = JetstreamAdapter {
            wanted_collections: Vec::new(),
            wanted_dids: Vec::new(),
            max_message_size_bytes: None,
            require_hello: false,
            cursor: None,
            cursor_tx,
            decompressor: dictionary::new_decompressor().unwrap(),
            dispatcher: Dispatcher::from_infallible(move |event| {
                let event_tx = event_tx.clone();
                async move {
                    let _ = event_tx.send(event);
                }
            }),
        };
        (adapter, event_rx)
    }

    fn query_pairs(path: &str) -> Vec<(String, String)> {
        let url = Url::parse(&format!("wss://jetstream.test{path}")).unwrap();
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    // ── Path building ────────────────────────────────────────────────

    #[test]
    fn build_path_minimal() {
        let (mut adapter, _rx) = adapter();
        assert_eq!(adapter.build_path(), "/subscribe?compress=true");
    }

    #[test]
    fn build_path_repeats_filter_params() {
        let (mut adapter, _rx) = adapter();
        adapter.wanted_collections =
            vec!["app.bsky.feed.post".into(), "app.bsky.feed.like".into()];
        adapter.wanted_dids = vec!["did:plc:abc".into()];
        adapter.cursor = Some(1725519626134432);

        let pairs = query_pairs(&adapter.build_path());
        assert_eq!(
            pairs,
            vec![
                ("compress".to_string(), "true".to_string()),
                ("wantedCollections".to_string(), "app.bsky.feed.post".to_string()),
                ("wantedCollections".to_string(), "app.bsky.feed.like".to_string()),
                ("wantedDids".to_string(), "did:plc:abc".to_string()),
                ("cursor".to_string(), "1725519626134432".to_string()),
            ]
        );
    }

    #[test]
    fn build_path_includes_tuning_params() {
        let (mut adapter, _rx) = adapter();
        adapter.max_message_size_bytes = Some(1_048_576);
        adapter.require_hello = true;

        let pairs = query_pairs(&adapter.build_path());
        assert!(pairs.contains(&("maxMessageSizeBytes".to_string(), "1048576".to_string())));
        assert!(pairs.contains(&("requireHello".to_string(), "true".to_string())));
    }

    #[test]
    fn build_path_has_no_duplicate_singleton_params() {
        let (mut adapter, _rx) = adapter();
        adapter.cursor = Some(5);
        let pairs = query_pairs(&adapter.build_path());
        let cursor_count = pairs.iter().filter(|(k, _)| k == "cursor").count();
        assert_eq!(cursor_count, 1);
    }

    // ── Ingress ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn event_dispatch_advances_cursor() {
        let (mut adapter, mut events) = adapter();
        let payload = br#"{"did":"did:plc:x","time_us":1725519626134432,"kind":"commit","commit":{"rev":"r","operation":"create","collection":"c","rkey":"k"}}"#;

        adapter.handle_payload(payload);

        let event = events.recv().await.unwrap();
        assert_eq!(event.time_us(), 1725519626134432);
        assert_eq!(adapter.cursor, Some(1725519626134432));
    }

    #[tokio::test]
    async fn compressed_frame_round_trips() {
        let (mut adapter, mut events) = adapter();
        let payload = br#"{"did":"did:plc:x","time_us":99,"kind":"commit","commit":{"rev":"r","operation":"delete","collection":"c","rkey":"k"}}"#;
        let compressed = dictionary::compress(payload).unwrap();

        adapter.handle_frame(Frame::Binary(compressed)).await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.time_us(), 99);
    }

    #[tokio::test]
    async fn text_frame_falls_back_to_plain_json() {
        let (mut adapter, mut events) = adapter();
        let payload = r#"{"did":"did:plc:x","time_us":7,"kind":"identity","identity":{"handle":"a.bsky.social"}}"#;

        adapter.handle_frame(Frame::Text(payload.into())).await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.time_us(), 7);
        assert_eq!(adapter.cursor, Some(7));
    }

    #[tokio::test]
    async fn undecodable_payload_leaves_cursor_alone() {
        let (mut adapter, mut events) = adapter();
        adapter.cursor = Some(41);

        adapter.handle_payload(b"not json");
        adapter.handle_frame(Frame::Binary(vec![0xDE, 0xAD])).await;

        assert!(events.try_recv().is_err());
        assert_eq!(adapter.cursor, Some(41));
    }

    // ── Options updates ──────────────────────────────────────────────

    #[test]
    fn options_update_emits_exact_frame() {
        let (mut adapter, _rx) = adapter();
        adapter.wanted_collections = vec!["app.bsky.feed.post".into()];

        let frame = adapter.handle_command(JetstreamCommand::UpdateOptions(OptionsUpdate {
            wanted_collections: Some(Vec::new()),
            ..OptionsUpdate::default()
        }));

        assert_eq!(
            frame,
            Some(OutboundFrame::Text(
                r#"{"type":"options_update","payload":{"wantedCollections":[]}}"#.to_string()
            ))
        );
    }

    #[test]
    fn options_update_is_authoritative_for_reconnects() {
        let (mut adapter, _rx) = adapter();
        adapter.wanted_collections = vec!["app.bsky.feed.post".into()];

        adapter.handle_command(JetstreamCommand::UpdateOptions(OptionsUpdate {
            wanted_collections: Some(vec!["app.bsky.graph.follow".into()]),
            wanted_dids: Some(vec!["did:plc:abc".into()]),
            max_message_size_bytes: Some(2048),
        }));

        let pairs = query_pairs(&adapter.build_path());
        assert!(pairs.contains(&(
            "wantedCollections".to_string(),
            "app.bsky.graph.follow".to_string()
        )));
        assert!(pairs.contains(&("wantedDids".to_string(), "did:plc:abc".to_string())));
        assert!(pairs.contains(&("maxMessageSizeBytes".to_string(), "2048".to_string())));
        assert!(!pairs
            .iter()
            .any(|(_, v)| v == "app.bsky.feed.post"));
    }

    #[test]
    fn options_update_with_no_fields_sends_empty_payload() {
        let (mut adapter, _rx) = adapter();
        let frame = adapter.handle_command(JetstreamCommand::UpdateOptions(OptionsUpdate::default()));
        assert_eq!(
            frame,
            Some(OutboundFrame::Text(
                r#"{"type":"options_update","payload":{}}"#.to_string()
            ))
        );
    }
}
