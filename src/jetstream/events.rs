//! Typed events for the Jetstream JSON stream.
//!
//! Every ingress message carries `did`, `time_us`, and a `kind` tag
//! naming the nested object to read. Records stay schema-free and
//! surface as [`serde_json::Value`].

use serde::Deserialize;
use serde_json::Value;

use crate::error::Error;

/// One event from a Jetstream subscription, routed by `kind`.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum JetstreamEvent {
    Commit(JetstreamCommit),
    Identity(JetstreamIdentity),
    Account(JetstreamAccount),
}

impl JetstreamEvent {
    pub fn did(&self) -> &str {
        match self {
            Self::Commit(event) => &event.did,
            Self::Identity(event) => &event.did,
            Self::Account(event) => &event.did,
        }
    }

    /// Unix-microseconds timestamp; doubles as the stream cursor.
    pub fn time_us(&self) -> u64 {
        match self {
            Self::Commit(event) => event.time_us,
            Self::Identity(event) => event.time_us,
            Self::Account(event) => event.time_us,
        }
    }

    /// Parse a decompressed frame. Unknown `kind` values yield
    /// `Ok(None)` for the adapter to log and drop.
    pub(crate) fn parse(bytes: &[u8]) -> Result<Option<Self>, Error> {
        let raw: RawEvent =
            serde_json::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))?;

        let event = match raw.kind.as_str() {
            "commit" => {
                let commit = raw.commit.ok_or_else(|| {
                    Error::Decode("commit event without `commit` object".into())
                })?;
                Self::Commit(JetstreamCommit {
                    did: raw.did,
                    time_us: raw.time_us,
                    operation: commit.operation,
                    collection: commit.collection,
                    rkey: commit.rkey,
                    rev: commit.rev,
                    record: commit.record,
                    cid: commit.cid,
                })
            }
            "identity" => {
                let identity = raw.identity.ok_or_else(|| {
                    Error::Decode("identity event without `identity` object".into())
                })?;
                Self::Identity(JetstreamIdentity {
                    did: raw.did,
                    time_us: raw.time_us,
                    handle: identity.handle,
                })
            }
            "account" => {
                let account = raw.account.ok_or_else(|| {
                    Error::Decode("account event without `account` object".into())
                })?;
                Self::Account(JetstreamAccount {
                    did: raw.did,
                    time_us: raw.time_us,
                    active: account.active,
                    status: account.status,
                })
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// A single record operation, pre-filtered server-side.
#[derive(Debug, Clone)]
pub struct JetstreamCommit {
    pub did: String,
    pub time_us: u64,
    pub operation: CommitOperation,
    /// NSID of the record's collection.
    pub collection: String,
    pub rkey: String,
    pub rev: String,
    /// Present for create/update; absent for delete.
    pub record: Option<Value>,
    pub cid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitOperation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct JetstreamIdentity {
    pub did: String,
    pub time_us: u64,
    pub handle: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JetstreamAccount {
    pub did: String,
    pub time_us: u64,
    pub active: bool,
    /// Raw status string when the account is not active.
    pub status: Option<String>,
}

// ── Wire shapes ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawEvent {
    did: String,
    time_us: u64,
    kind: String,
    #[serde(default)]
    commit: Option<RawCommit>,
    #[serde(default)]
    identity: Option<RawIdentity>,
    #[serde(default)]
    account: Option<RawAccount>,
}

#[derive(Debug, Deserialize)]
struct RawCommit {
    rev: String,
    operation: CommitOperation,
    collection: String,
    rkey: String,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    cid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawIdentity {
    #[serde(default)]
    handle: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    active: bool,
    #[serde(default)]
    status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_commit_event() {
        let raw = br#"{"did":"did:plc:x","time_us":1725519626134432,"kind":"commit","commit":{"rev":"r","operation":"create","collection":"c","rkey":"k"}}"#;
        let event = JetstreamEvent::parse(raw).unwrap().unwrap();

        assert_eq!(event.did(), "did:plc:x");
        assert_eq!(event.time_us(), 1725519626134432);
        let JetstreamEvent::Commit(commit) = event else {
            panic!("expected commit");
        };
        assert_eq!(commit.operation, CommitOperation::Create);
        assert_eq!(commit.collection, "c");
        assert_eq!(commit.rkey, "k");
        assert!(commit.record.is_none());
    }

    #[test]
    fn parse_commit_with_record() {
        let raw = br#"{"did":"did:plc:x","time_us":1,"kind":"commit","commit":{"rev":"r","operation":"update","collection":"app.bsky.actor.profile","rkey":"self","record":{"displayName":"x"},"cid":"bafyreib"}}"#;
        let event = JetstreamEvent::parse(raw).unwrap().unwrap();
        let JetstreamEvent::Commit(commit) = event else {
            panic!("expected commit");
        };
        assert_eq!(commit.operation, CommitOperation::Update);
        assert_eq!(commit.record.unwrap()["displayName"], "x");
        assert_eq!(commit.cid.as_deref(), Some("bafyreib"));
    }

    #[test]
    fn parse_identity_event() {
        let raw = br#"{"did":"did:plc:y","time_us":2,"kind":"identity","identity":{"did":"did:plc:y","handle":"someone.bsky.social","seq":9,"time":"2024-09-05T06:20:26Z"}}"#;
        let event = JetstreamEvent::parse(raw).unwrap().unwrap();
        let JetstreamEvent::Identity(identity) = event else {
            panic!("expected identity");
        };
        assert_eq!(identity.handle.as_deref(), Some("someone.bsky.social"));
    }

    #[test]
    fn parse_account_event() {
        let raw = br#"{"did":"did:plc:z","time_us":3,"kind":"account","account":{"active":false,"did":"did:plc:z","status":"takendown","seq":4,"time":"2024-09-05T06:20:26Z"}}"#;
        let event = JetstreamEvent::parse(raw).unwrap().unwrap();
        let JetstreamEvent::Account(account) = event else {
            panic!("expected account");
        };
        assert!(!account.active);
        assert_eq!(account.status.as_deref(), Some("takendown"));
    }

    #[test]
    fn unknown_kind_yields_none() {
        let raw = br#"{"did":"did:plc:x","time_us":4,"kind":"migration"}"#;
        assert!(JetstreamEvent::parse(raw).unwrap().is_none());
    }

    #[test]
    fn missing_nested_object_is_a_decode_error() {
        let raw = br#"{"did":"did:plc:x","time_us":5,"kind":"commit"}"#;
        assert!(matches!(
            JetstreamEvent::parse(raw),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn unknown_operation_is_a_decode_error() {
        let raw = br#"{"did":"did:plc:x","time_us":6,"kind":"commit","commit":{"rev":"r","operation":"upsert","collection":"c","rkey":"k"}}"#;
        assert!(matches!(
            JetstreamEvent::parse(raw),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        assert!(matches!(
            JetstreamEvent::parse(b"not json"),
            Err(Error::Decode(_))
        ));
    }
}
