// Tap admin API HTTP client
//
// Companion to the `/channel` WebSocket, separate transport. Wraps
// `reqwest::Client` with the Tap server's endpoints and the same
// HTTP Basic credential as the upgrade request. Requests are never
// retried internally; errors come back to the caller.

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::{TapConfig, TlsMode};
use crate::error::Error;

/// Which `/stats/{kind}` counter to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsKind {
    RepoCount,
    RecordCount,
    OutboxBuffer,
    ResyncBuffer,
    Cursors,
}

impl StatsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RepoCount => "repo-count",
            Self::RecordCount => "record-count",
            Self::OutboxBuffer => "outbox-buffer",
            Self::ResyncBuffer => "resync-buffer",
            Self::Cursors => "cursors",
        }
    }
}

#[derive(Serialize)]
struct DidsBody<'a> {
    dids: &'a [String],
}

/// HTTP client for a Tap server's admin API.
///
/// Independent of the stream handle; admin calls run on the caller's
/// task and may be issued whether or not a channel is connected.
pub struct TapAdmin {
    http: reqwest::Client,
    base_url: String,
    password: Option<SecretString>,
}

impl TapAdmin {
    /// Build an admin client from the same config as the stream.
    ///
    /// The base URL is derived from the configured host (`ws`/`wss`
    /// map to `http`/`https`) with any trailing `/` trimmed.
    pub fn new(config: &TapConfig) -> Result<Self, Error> {
        let base_url = config.connection.http_base()?;

        let mut builder = reqwest::Client::builder().timeout(config.connection.timeout);
        match &config.connection.tls {
            TlsMode::System => {}
            TlsMode::CustomCa(path) => {
                let pem = std::fs::read(path)
                    .map_err(|e| Error::Tls(format!("failed to read CA cert: {e}")))?;
                let cert = reqwest::Certificate::from_pem(&pem)
                    .map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
                builder = builder.add_root_certificate(cert);
            }
            TlsMode::DangerAcceptInvalid => {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }
        let http = builder
            .build()
            .map_err(|e| Error::Tls(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            password: config.admin_password.clone(),
        })
    }

    /// Start tracking the given repos.
    pub async fn add_repos(&self, dids: &[String]) -> Result<Value, Error> {
        self.post("repos/add", &DidsBody { dids }).await
    }

    /// Stop tracking the given repos.
    pub async fn remove_repos(&self, dids: &[String]) -> Result<Value, Error> {
        self.post("repos/remove", &DidsBody { dids }).await
    }

    /// Resolve a DID through the server's identity directory.
    pub async fn resolve(&self, did: &str) -> Result<Value, Error> {
        self.get(&format!("resolve/{did}")).await
    }

    /// Tracking state of a single repo.
    pub async fn info(&self, did: &str) -> Result<Value, Error> {
        self.get(&format!("info/{did}")).await
    }

    /// One of the server's counters.
    pub async fn stats(&self, kind: StatsKind) -> Result<Value, Error> {
        self.get(&format!("stats/{}", kind.as_str())).await
    }

    /// Liveness probe.
    pub async fn health(&self) -> Result<Value, Error> {
        self.get("health").await
    }

    // ── Request helpers ──────────────────────────────────────────────

    async fn get(&self, path: &str) -> Result<Value, Error> {
        let url = format!("{}/{path}", self.base_url);
        debug!("GET {url}");

        let mut request = self.http.get(&url);
        if let Some(password) = &self.password {
            request = request.basic_auth("admin", Some(password.expose_secret()));
        }
        let response = request.send().await.map_err(Error::Transport)?;
        Self::parse_response(response).await
    }

    async fn post(&self, path: &str, body: &impl Serialize) -> Result<Value, Error> {
        let url = format!("{}/{path}", self.base_url);
        debug!("POST {url}");

        let mut request = self.http.post(&url).json(body);
        if let Some(password) = &self.password {
            request = request.basic_auth("admin", Some(password.expose_secret()));
        }
        let response = request.send().await.map_err(Error::Transport)?;
        Self::parse_response(response).await
    }

    async fn parse_response(response: reqwest::Response) -> Result<Value, Error> {
        let status = response.status();
        let body = response.text().await.map_err(Error::Transport)?;

        if !status.is_success() {
            return Err(Error::AdminApi {
                status: status.as_u16(),
                body,
            });
        }
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| Error::Decode(e.to_string()))
    }
}
