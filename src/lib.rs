//! Async Rust client for AT Protocol event streams.
//!
//! This crate consumes the three event stream surfaces of the ATProto
//! sync ecosystem behind one connection substrate:
//!
//! - **Firehose** ([`FirehoseHandle`]) — the raw, whole-network
//!   repository stream (`com.atproto.sync.subscribeRepos`). CAR/DagCBOR
//!   frames, strict sequence monotonicity, integer cursor carried
//!   across reconnects.
//!
//! - **Jetstream** ([`JetstreamHandle`]) — filtered, zstd-compressed
//!   JSON events with server-side collection/DID filters that can be
//!   updated on a live connection. Microsecond-timestamp cursor.
//!
//! - **Tap** ([`TapHandle`]) — a managed backfill/indexer channel with
//!   per-event acknowledgment driven by the handler's outcome, plus a
//!   companion HTTP admin API ([`TapAdmin`]).
//!
//! All three share the same engine: a single task owns the TLS +
//! WebSocket session, enforces connect/upgrade timeouts, and recovers
//! from transient failures with exponential backoff + jitter. Events
//! are handed to a concurrent dispatcher that runs the user callback
//! on its own task per event; a slow or panicking handler never stalls
//! the stream or the cursor.
//!
//! Cursors are tracked in memory only. Callers resuming across process
//! restarts persist the handle's `cursor()` themselves and feed it
//! back through the config.

pub mod config;
mod dispatch;
mod engine;
pub mod error;
pub mod firehose;
pub mod jetstream;
pub mod tap;

pub use config::{
    ConnectionConfig, FirehoseConfig, JetstreamConfig, ReconnectStrategy, TapConfig, TlsMode,
};
pub use dispatch::BoxError;
pub use error::Error;
pub use firehose::events as firehose_events;
pub use firehose::FirehoseHandle;
pub use jetstream::events as jetstream_events;
pub use jetstream::{JetstreamHandle, OptionsUpdate};
pub use tap::admin::{StatsKind, TapAdmin};
pub use tap::events as tap_events;
pub use tap::TapHandle;
