//! Typed events for the Tap channel stream.
//!
//! Every ingress frame is a JSON object carrying an `id` (the ack key)
//! and a `type` tag naming the nested object to read.

use serde::Deserialize;
use serde_json::Value;

use crate::error::Error;

/// One event from a Tap channel, routed by `type`.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum TapEvent {
    Record(TapRecord),
    Identity(TapIdentity),
}

impl TapEvent {
    /// Monotonic ack key assigned by the server.
    pub fn id(&self) -> u64 {
        match self {
            Self::Record(event) => event.id,
            Self::Identity(event) => event.id,
        }
    }

    /// Parse a text frame. Unknown `type` values yield `Ok(None)` for
    /// the adapter to log and drop (without ack).
    pub(crate) fn parse(text: &str) -> Result<Option<Self>, Error> {
        let raw: RawEvent =
            serde_json::from_str(text).map_err(|e| Error::Decode(e.to_string()))?;

        let event = match raw.kind.as_str() {
            "record" => {
                let record = raw
                    .record
                    .ok_or_else(|| Error::Decode("record event without `record` object".into()))?;
                Self::Record(TapRecord {
                    id: raw.id,
                    live: record.live,
                    rev: record.rev,
                    did: record.did,
                    collection: record.collection,
                    rkey: record.rkey,
                    action: record.action,
                    cid: record.cid,
                    record: record.record,
                })
            }
            "identity" => {
                let identity = raw.identity.ok_or_else(|| {
                    Error::Decode("identity event without `identity` object".into())
                })?;
                Self::Identity(TapIdentity {
                    id: raw.id,
                    did: identity.did,
                    handle: identity.handle,
                    is_active: identity.is_active,
                    status: identity.status,
                })
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// A record mutation, either live off the firehose or replayed from a
/// backfill.
#[derive(Debug, Clone)]
pub struct TapRecord {
    pub id: u64,
    /// `true` for live events, `false` for backfill replay.
    pub live: bool,
    pub rev: String,
    pub did: String,
    pub collection: String,
    pub rkey: String,
    pub action: TapAction,
    pub cid: Option<String>,
    pub record: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TapAction {
    Create,
    Update,
    Delete,
}

/// Identity snapshot for a tracked repo.
#[derive(Debug, Clone)]
pub struct TapIdentity {
    pub id: u64,
    pub did: String,
    pub handle: Option<String>,
    pub is_active: bool,
    pub status: Option<String>,
}

// ── Wire shapes ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: u64,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    record: Option<RawRecord>,
    #[serde(default)]
    identity: Option<RawIdentity>,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    live: bool,
    rev: String,
    did: String,
    collection: String,
    rkey: String,
    action: TapAction,
    #[serde(default)]
    cid: Option<String>,
    #[serde(default)]
    record: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawIdentity {
    did: String,
    #[serde(default)]
    handle: Option<String>,
    is_active: bool,
    #[serde(default)]
    status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_record_event() {
        let raw = r#"{"id":7,"type":"record","record":{"live":true,"rev":"r","did":"d","collection":"c","rkey":"k","action":"create"}}"#;
        let event = TapEvent::parse(raw).unwrap().unwrap();

        assert_eq!(event.id(), 7);
        let TapEvent::Record(record) = event else {
            panic!("expected record");
        };
        assert!(record.live);
        assert_eq!(record.action, TapAction::Create);
        assert!(record.cid.is_none());
    }

    #[test]
    fn parse_record_with_payload() {
        let raw = r#"{"id":8,"type":"record","record":{"live":false,"rev":"r2","did":"did:plc:x","collection":"app.bsky.feed.post","rkey":"3k","action":"update","cid":"bafyreib","record":{"text":"hi"}}}"#;
        let event = TapEvent::parse(raw).unwrap().unwrap();
        let TapEvent::Record(record) = event else {
            panic!("expected record");
        };
        assert!(!record.live);
        assert_eq!(record.record.unwrap()["text"], "hi");
        assert_eq!(record.cid.as_deref(), Some("bafyreib"));
    }

    #[test]
    fn parse_identity_event() {
        let raw = r#"{"id":9,"type":"identity","identity":{"did":"did:plc:y","handle":"y.bsky.social","is_active":true,"status":null}}"#;
        let event = TapEvent::parse(raw).unwrap().unwrap();
        let TapEvent::Identity(identity) = event else {
            panic!("expected identity");
        };
        assert_eq!(identity.id, 9);
        assert!(identity.is_active);
        assert_eq!(identity.handle.as_deref(), Some("y.bsky.social"));
    }

    #[test]
    fn unknown_type_yields_none() {
        let raw = r#"{"id":10,"type":"heartbeat"}"#;
        assert!(TapEvent::parse(raw).unwrap().is_none());
    }

    #[test]
    fn unknown_action_is_a_decode_error() {
        let raw = r#"{"id":11,"type":"record","record":{"live":true,"rev":"r","did":"d","collection":"c","rkey":"k","action":"merge"}}"#;
        assert!(matches!(TapEvent::parse(raw), Err(Error::Decode(_))));
    }

    #[test]
    fn missing_nested_object_is_a_decode_error() {
        let raw = r#"{"id":12,"type":"record"}"#;
        assert!(matches!(TapEvent::parse(raw), Err(Error::Decode(_))));
    }
}
