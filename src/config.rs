// ── Stream connection configuration ──
//
// These types describe *how* to reach an upstream relay, Jetstream
// instance, or Tap server. They carry connection tuning and credential
// data but never touch disk. The caller constructs a per-stream config
// and hands it to `connect()`; it is never mutated afterwards (the
// Jetstream filter set is the single exception, updated through
// `JetstreamHandle::update_options`).

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use crate::error::Error;

/// Connect/upgrade timeout applied to each attempt.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Ingress frames granted per read cycle.
pub const DEFAULT_FLOW: usize = 10;

/// Upper bound on exponential reconnect backoff.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Jetstream rejects subscriptions with more collections than this.
pub const MAX_WANTED_COLLECTIONS: usize = 100;

/// Jetstream rejects subscriptions with more DIDs than this.
pub const MAX_WANTED_DIDS: usize = 10_000;

// ── TlsMode ──────────────────────────────────────────────────────────

/// TLS verification strategy for the WebSocket and admin transports.
#[derive(Debug, Clone, Default)]
pub enum TlsMode {
    /// System CA store, peer verification and hostname matching on.
    #[default]
    System,
    /// Use a custom CA certificate from the given PEM file.
    CustomCa(PathBuf),
    /// Accept any certificate (for self-hosted relays behind
    /// self-signed certs). Never use against public infrastructure.
    DangerAcceptInvalid,
}

impl TlsMode {
    /// Build a `native_tls` connector for the WebSocket transport.
    pub(crate) fn connector(&self) -> Result<native_tls::TlsConnector, Error> {
        let mut builder = native_tls::TlsConnector::builder();
        match self {
            Self::System => {}
            Self::CustomCa(path) => {
                let pem = std::fs::read(path)
                    .map_err(|e| Error::Tls(format!("failed to read CA cert: {e}")))?;
                let cert = native_tls::Certificate::from_pem(&pem)
                    .map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
                builder.add_root_certificate(cert);
            }
            Self::DangerAcceptInvalid => {
                builder.danger_accept_invalid_certs(true);
                builder.danger_accept_invalid_hostnames(true);
            }
        }
        builder
            .build()
            .map_err(|e| Error::Tls(format!("failed to build TLS connector: {e}")))
    }
}

// ── ReconnectStrategy ────────────────────────────────────────────────

/// How reconnect delays are computed after a transient failure.
#[derive(Clone)]
pub enum ReconnectStrategy {
    /// `min(1s * 2^attempt, max_backoff)` plus up to 10% jitter.
    Exponential {
        /// Upper bound on the pre-jitter delay. Default: 60s.
        max_backoff: Duration,
    },
    /// Caller-supplied pure function of the attempt index. Lets
    /// implementers encode decorrelated-jitter schemes without library
    /// changes.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        Self::Exponential {
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl fmt::Debug for ReconnectStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exponential { max_backoff } => f
                .debug_struct("Exponential")
                .field("max_backoff", max_backoff)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

// ── ConnectionConfig ─────────────────────────────────────────────────

/// Transport settings shared by all three stream kinds.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Base URL of the upstream endpoint. Accepts `ws`, `wss`, `http`,
    /// or `https` schemes; HTTP schemes are normalized to their
    /// WebSocket equivalents for the socket.
    pub host: String,
    /// Connect and upgrade timeout, each scoped to a single attempt.
    pub timeout: Duration,
    /// Ingress credit: frames drained per read cycle before handling.
    pub flow: usize,
    /// TLS verification strategy.
    pub tls: TlsMode,
    /// Reconnect backoff policy.
    pub reconnect: ReconnectStrategy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl ConnectionConfig {
    /// Connection settings for `host` with library defaults.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            timeout: DEFAULT_TIMEOUT,
            flow: DEFAULT_FLOW,
            tls: TlsMode::default(),
            reconnect: ReconnectStrategy::default(),
        }
    }

    /// Parse and normalize the host URL to a `ws`/`wss` base.
    pub(crate) fn websocket_url(&self) -> Result<Url, Error> {
        let mut url = Url::parse(&self.host)?;
        let scheme = match url.scheme() {
            "ws" | "wss" => return Ok(url),
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(Error::InvalidConfig {
                    message: format!("unsupported URL scheme `{other}` in host"),
                })
            }
        };
        url.set_scheme(scheme).map_err(|_| Error::InvalidConfig {
            message: format!("host URL cannot use scheme `{scheme}`"),
        })?;
        Ok(url)
    }

    /// Derive the `http`/`https` base for the companion admin API,
    /// with any trailing `/` trimmed.
    pub(crate) fn http_base(&self) -> Result<String, Error> {
        let mut url = Url::parse(&self.host)?;
        let scheme = match url.scheme() {
            "http" | "https" => None,
            "ws" => Some("http"),
            "wss" => Some("https"),
            other => {
                return Err(Error::InvalidConfig {
                    message: format!("unsupported URL scheme `{other}` in host"),
                })
            }
        };
        if let Some(scheme) = scheme {
            url.set_scheme(scheme).map_err(|_| Error::InvalidConfig {
                message: format!("host URL cannot use scheme `{scheme}`"),
            })?;
        }
        Ok(url.as_str().trim_end_matches('/').to_string())
    }
}

// ── Per-stream configuration ─────────────────────────────────────────

/// Configuration for a firehose subscription
/// (`com.atproto.sync.subscribeRepos`).
#[derive(Debug, Clone)]
pub struct FirehoseConfig {
    pub connection: ConnectionConfig,
    /// Sequence number to resume from. `None` starts at the live tip.
    pub cursor: Option<i64>,
}

impl FirehoseConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(host),
            cursor: None,
        }
    }
}

/// Configuration for a Jetstream subscription.
#[derive(Debug, Clone, Default)]
pub struct JetstreamConfig {
    pub connection: ConnectionConfig,
    /// NSID filter; empty means all collections. At most
    /// [`MAX_WANTED_COLLECTIONS`].
    pub wanted_collections: Vec<String>,
    /// DID filter; empty means all repos. At most [`MAX_WANTED_DIDS`].
    pub wanted_dids: Vec<String>,
    /// Unix-microseconds timestamp to resume from.
    pub cursor: Option<u64>,
    /// Ask the server to hold the stream until the first
    /// `options_update` control frame arrives.
    pub require_hello: bool,
    /// Server-side cap on emitted message size; also bounds local
    /// decompression.
    pub max_message_size_bytes: Option<u64>,
}

impl JetstreamConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(host),
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.wanted_collections.len() > MAX_WANTED_COLLECTIONS {
            return Err(Error::InvalidConfig {
                message: format!(
                    "wanted_collections has {} entries (limit {MAX_WANTED_COLLECTIONS})",
                    self.wanted_collections.len()
                ),
            });
        }
        if self.wanted_dids.len() > MAX_WANTED_DIDS {
            return Err(Error::InvalidConfig {
                message: format!(
                    "wanted_dids has {} entries (limit {MAX_WANTED_DIDS})",
                    self.wanted_dids.len()
                ),
            });
        }
        Ok(())
    }
}

/// Configuration for a Tap channel subscription and its admin API.
#[derive(Debug, Clone, Default)]
pub struct TapConfig {
    pub connection: ConnectionConfig,
    /// HTTP Basic credential (user is always `admin`), sent on the
    /// upgrade request and on every admin API call.
    pub admin_password: Option<SecretString>,
    /// Suppress all ack emissions. Events are still decoded and
    /// dispatched.
    pub disable_acks: bool,
}

impl TapConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(host),
            ..Self::default()
        }
    }
}
