use thiserror::Error;

/// Top-level error type for the `atstream` crate.
///
/// Only two classes of failure ever reach the caller: initialization
/// errors (bad configuration, DNS failure, TLS setup failure) surfaced
/// from `connect()` or a handle's `join()`, and Tap admin API errors
/// returned from individual requests. Everything transient -- connect
/// timeouts, upgrade failures, remote closes, dropped sockets -- is
/// absorbed by the reconnect path and never propagated.
#[derive(Debug, Error)]
pub enum Error {
    // ── Initialization ──────────────────────────────────────────────
    /// Configuration rejected before any connection was attempted.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Host URL failed to parse.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS connector setup or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Transport could not be opened (DNS failure, connection refused).
    /// Fatal to the stream instance; the caller or its supervisor decides
    /// whether to start a new one.
    #[error("connection failed: {0}")]
    Connect(String),

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket-level failure that terminated the engine task.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    // ── Data ────────────────────────────────────────────────────────
    /// A frame payload could not be decoded (CBOR, JSON, zstd, CAR, or
    /// a malformed timestamp). Never surfaced through a stream handle;
    /// the adapters log and drop the offending frame.
    #[error("decode error: {0}")]
    Decode(String),

    // ── Tap admin API ───────────────────────────────────────────────
    /// Non-2xx response from the Tap admin API, with the raw body.
    #[error("admin API error (HTTP {status}): {body}")]
    AdminApi { status: u16, body: String },

    /// HTTP transport error from the admin client.
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    // ── Lifecycle ───────────────────────────────────────────────────
    /// The stream's engine task is no longer running.
    #[error("stream handle is closed")]
    Closed,
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying.
    ///
    /// The engine retries these internally; the predicate exists for
    /// callers wrapping the admin client in their own retry loops.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::WebSocket(_) => true,
            Self::AdminApi { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Returns `true` if this error is fatal to the stream instance.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. } | Self::InvalidUrl(_) | Self::Tls(_) | Self::Connect(_)
        )
    }
}
