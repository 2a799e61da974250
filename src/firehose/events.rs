//! Typed events for `com.atproto.sync.subscribeRepos`.
//!
//! Payloads arrive as DagCBOR maps following the lexicon; parsing is
//! total and lenient -- unknown string enums are preserved as raw
//! strings, unknown event type tags yield `None` for the adapter to
//! log and drop. Record payloads stay schema-free at this layer and
//! surface as [`Ipld`] values (primitives, nested maps/lists, and CID
//! links).

use std::collections::HashMap;
use std::io::Cursor;

use chrono::{DateTime, Utc};
use ipld_core::cid::Cid;
use ipld_core::ipld::Ipld;
use iroh_car::CarReader;
use serde::Deserialize;
use tracing::trace;

use crate::error::Error;

// ── Public event model ───────────────────────────────────────────────

/// One event from the firehose, discriminated by the frame header's
/// `t` tag.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum FirehoseEvent {
    Commit(CommitEvent),
    Sync(SyncEvent),
    Identity(IdentityEvent),
    Account(AccountEvent),
    Info(InfoEvent),
}

impl FirehoseEvent {
    /// Stream sequence number; `#info` frames carry none.
    pub fn seq(&self) -> Option<i64> {
        match self {
            Self::Commit(event) => Some(event.seq),
            Self::Sync(event) => Some(event.seq),
            Self::Identity(event) => Some(event.seq),
            Self::Account(event) => Some(event.seq),
            Self::Info(_) => None,
        }
    }
}

/// An atomic repo update: one or more record operations plus the CAR
/// slice proving them.
#[derive(Debug, Clone)]
pub struct CommitEvent {
    pub seq: i64,
    /// DID of the repo this commit applies to.
    pub repo: String,
    /// CID of the commit object itself.
    pub commit: Cid,
    /// Repo revision (TID) of this commit.
    pub rev: String,
    /// Revision the emitting host believes the consumer has.
    pub since: Option<String>,
    pub time: DateTime<Utc>,
    pub ops: Vec<RepoOp>,
    /// Decoded block archive, keyed by CID string. Ops resolve their
    /// records against this map.
    pub blocks: HashMap<String, Ipld>,
    /// Deprecated lexicon field, preserved for compatibility.
    pub rebase: bool,
    /// Deprecated lexicon field, preserved for compatibility.
    pub too_big: bool,
    /// Deprecated lexicon field, preserved for compatibility.
    pub blobs: Vec<Cid>,
}

/// A mutation of a single record within a commit.
#[derive(Debug, Clone)]
pub struct RepoOp {
    pub action: RepoOpAction,
    /// `collection/rkey` path of the record.
    pub path: String,
    pub cid: Option<Cid>,
    pub prev: Option<Cid>,
    /// Record decoded from the commit's block archive, when present.
    pub record: Option<Ipld>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RepoOpAction {
    Create,
    Update,
    Delete,
    Other(String),
}

impl From<&str> for RepoOpAction {
    fn from(raw: &str) -> Self {
        match raw {
            "create" => Self::Create,
            "update" => Self::Update,
            "delete" => Self::Delete,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Whole-repo state update used to recover from broken commit streams.
#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub seq: i64,
    pub did: String,
    /// Raw CAR bytes; not decoded at this layer.
    pub blocks: Vec<u8>,
    pub rev: String,
    pub time: DateTime<Utc>,
}

/// Identity change: updated handle, signing key, or PDS endpoint.
#[derive(Debug, Clone)]
pub struct IdentityEvent {
    pub seq: i64,
    pub did: String,
    pub time: DateTime<Utc>,
    pub handle: Option<String>,
}

/// Account status change at the emitting host.
#[derive(Debug, Clone)]
pub struct AccountEvent {
    pub seq: i64,
    pub did: String,
    pub time: DateTime<Utc>,
    pub active: bool,
    pub status: Option<AccountStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AccountStatus {
    Takendown,
    Suspended,
    Deleted,
    Deactivated,
    Desynchronized,
    Throttled,
    Other(String),
}

impl From<&str> for AccountStatus {
    fn from(raw: &str) -> Self {
        match raw {
            "takendown" => Self::Takendown,
            "suspended" => Self::Suspended,
            "deleted" => Self::Deleted,
            "deactivated" => Self::Deactivated,
            "desynchronized" => Self::Desynchronized,
            "throttled" => Self::Throttled,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Informational frame from the server (e.g. `OutdatedCursor`).
#[derive(Debug, Clone)]
pub struct InfoEvent {
    pub name: String,
    pub message: Option<String>,
}

// ── Wire payloads ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCommit {
    seq: i64,
    repo: String,
    commit: Cid,
    rev: String,
    #[serde(default)]
    since: Option<String>,
    #[serde(with = "serde_bytes", default)]
    blocks: Option<Vec<u8>>,
    ops: Vec<RawRepoOp>,
    time: String,
    #[serde(default)]
    rebase: bool,
    #[serde(default)]
    too_big: bool,
    #[serde(default)]
    blobs: Vec<Cid>,
}

#[derive(Debug, Deserialize)]
struct RawRepoOp {
    action: String,
    path: String,
    #[serde(default)]
    cid: Option<Cid>,
    #[serde(default)]
    prev: Option<Cid>,
}

#[derive(Debug, Deserialize)]
struct RawSync {
    seq: i64,
    did: String,
    #[serde(with = "serde_bytes")]
    blocks: Vec<u8>,
    rev: String,
    time: String,
}

#[derive(Debug, Deserialize)]
struct RawIdentity {
    seq: i64,
    did: String,
    time: String,
    #[serde(default)]
    handle: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    seq: i64,
    did: String,
    time: String,
    active: bool,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    name: String,
    #[serde(default)]
    message: Option<String>,
}

// ── Parsing ──────────────────────────────────────────────────────────

impl FirehoseEvent {
    /// Build a typed event from an event type tag and its DagCBOR
    /// payload. Unknown tags yield `Ok(None)`; a malformed payload
    /// (including a malformed `time`) fails the whole event.
    pub(crate) async fn parse(t: &str, payload: &[u8]) -> Result<Option<Self>, Error> {
        let event = match t {
            "#commit" => Self::Commit(parse_commit(payload).await?),
            "#sync" => {
                let raw: RawSync = decode(payload)?;
                Self::Sync(SyncEvent {
                    seq: raw.seq,
                    did: raw.did,
                    blocks: raw.blocks,
                    rev: raw.rev,
                    time: parse_datetime(&raw.time)?,
                })
            }
            "#identity" => {
                let raw: RawIdentity = decode(payload)?;
                Self::Identity(IdentityEvent {
                    seq: raw.seq,
                    did: raw.did,
                    time: parse_datetime(&raw.time)?,
                    handle: raw.handle,
                })
            }
            "#account" => {
                let raw: RawAccount = decode(payload)?;
                Self::Account(AccountEvent {
                    seq: raw.seq,
                    did: raw.did,
                    time: parse_datetime(&raw.time)?,
                    active: raw.active,
                    status: raw.status.as_deref().map(AccountStatus::from),
                })
            }
            "#info" => {
                let raw: RawInfo = decode(payload)?;
                Self::Info(InfoEvent {
                    name: raw.name,
                    message: raw.message,
                })
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

async fn parse_commit(payload: &[u8]) -> Result<CommitEvent, Error> {
    let raw: RawCommit = decode(payload)?;
    let time = parse_datetime(&raw.time)?;

    let blocks = match &raw.blocks {
        Some(data) if !data.is_empty() => decode_block_archive(data).await?,
        _ => HashMap::new(),
    };

    let ops = raw
        .ops
        .into_iter()
        .map(|op| {
            let record = op
                .cid
                .as_ref()
                .and_then(|cid| blocks.get(&cid.to_string()).cloned());
            RepoOp {
                action: RepoOpAction::from(op.action.as_str()),
                path: op.path,
                cid: op.cid,
                prev: op.prev,
                record,
            }
        })
        .collect();

    Ok(CommitEvent {
        seq: raw.seq,
        repo: raw.repo,
        commit: raw.commit,
        rev: raw.rev,
        since: raw.since,
        time,
        ops,
        blocks,
        rebase: raw.rebase,
        too_big: raw.too_big,
        blobs: raw.blobs,
    })
}

/// Decode a commit's CAR slice into a CID -> value map. Blocks that
/// are not DagCBOR (none in practice) are skipped.
async fn decode_block_archive(data: &[u8]) -> Result<HashMap<String, Ipld>, Error> {
    let mut reader = CarReader::new(Cursor::new(data))
        .await
        .map_err(|e| Error::Decode(format!("invalid CAR archive: {e}")))?;

    let mut blocks = HashMap::new();
    loop {
        let block = reader
            .next_block()
            .await
            .map_err(|e| Error::Decode(format!("failed to read CAR block: {e}")))?;
        let Some((cid, data)) = block else { break };

        match serde_ipld_dagcbor::from_slice::<Ipld>(&data) {
            Ok(value) => {
                blocks.insert(cid.to_string(), value);
            }
            Err(error) => trace!(cid = %cid, error = %error, "skipping undecodable block"),
        }
    }
    Ok(blocks)
}

fn decode<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, Error> {
    serde_ipld_dagcbor::from_slice(payload).map_err(|e| Error::Decode(e.to_string()))
}

pub(crate) fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Decode(format!("malformed timestamp `{raw}`: {e}")))
}

// ── Tests ────────────────────────────────────────────────────────────
