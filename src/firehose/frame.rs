//! Firehose wire frames.
//!
//! Every binary websocket message is two concatenated DAG-CBOR items: a
//! header map `{op, t}` and a body. `op == -1` marks an error frame; `op == 1`
//! carries a message whose shape is named by `t`. Only `#commit` bodies are
//! decoded here; everything else is skipped.
//!
//! Malformed-message policy (matching the upstream's observed quirks): a
//! commit missing the optional `prev` field is accepted as if it were null; a
//! commit missing its `blocks` payload is dropped without terminating the
//! stream; CAR framing errors are treated as benign and skipped quietly.

use super::car::BlockStore;
use super::cbor::{Cid, Value};
use crate::{Error, Result};
use minicbor::Decoder;

/// One decoded firehose frame.
#[derive(Debug)]
pub enum Frame {
    /// A repository commit event.
    Commit(CommitEvent),
    /// A valid message we do not consume (`#identity`, `#account`, ...), or a
    /// commit dropped under the malformed-message policy.
    Skip,
}

/// Action of a single record operation within a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpAction {
    Create,
    Update,
    Delete,
}

/// One record operation within a commit.
#[derive(Debug, Clone)]
pub struct RepoOp {
    pub action: OpAction,
    /// `<collection>/<rkey>` path within the repository.
    pub path: String,
    /// Block reference for creates/updates; absent for deletes.
    pub cid: Option<Cid>,
}

/// One repository commit from the firehose.
#[derive(Debug)]
pub struct CommitEvent {
    /// Monotonic sequence number; sole ordering and resumption key.
    pub seq: u64,
    /// Repository (author) DID.
    pub repo: String,
    /// Ordered record operations.
    pub ops: Vec<RepoOp>,
    /// Raw block store for create/update ops.
    pub blocks: BlockStore,
}

/// Decode one binary websocket message into a [`Frame`].
pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
    let mut d = Decoder::new(bytes);
    let header = super::cbor::decode_value(&mut d)?;

    let op = header
        .get("op")
        .and_then(Value::as_int)
        .ok_or_else(|| Error::Frame("header missing op".to_string()))?;

    let body_start = d.position();
    let body = Value::decode(&bytes[body_start..])?;

    if op == -1 {
        return Err(Error::ErrorFrame {
            code: body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            message: body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }

    let kind = header.get("t").and_then(Value::as_str).unwrap_or_default();
    if kind != "#commit" {
        return Ok(Frame::Skip);
    }

    decode_commit(&body)
}

fn decode_commit(body: &Value) -> Result<Frame> {
    let seq = body
        .get("seq")
        .and_then(Value::as_int)
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| Error::Frame("commit missing seq".to_string()))?;
    let repo = body
        .get("repo")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Frame("commit missing repo".to_string()))?
        .to_string();

    // A commit without its blocks payload cannot be processed; drop it
    // without killing the stream.
    let Some(car_bytes) = body.get_non_null("blocks").and_then(Value::as_bytes) else {
        tracing::debug!(seq, "commit without blocks dropped");
        return Ok(Frame::Skip);
    };
    let blocks = BlockStore::parse(car_bytes)?;

    let mut ops = Vec::new();
    if let Some(raw_ops) = body.get("ops").and_then(Value::as_array) {
        for raw in raw_ops {
            let action = match raw.get("action").and_then(Value::as_str) {
                Some("create") => OpAction::Create,
                Some("update") => OpAction::Update,
                Some("delete") => OpAction::Delete,
                _ => continue,
            };
            let Some(path) = raw.get("path").and_then(Value::as_str) else {
                continue;
            };
            ops.push(RepoOp {
                action,
                path: path.to_string(),
                cid: raw.get_non_null("cid").and_then(Value::as_cid).cloned(),
            });
        }
    }

    Ok(Frame::Commit(CommitEvent {
        seq,
        repo,
        ops,
        blocks,
    }))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::super::car::test_support::build_car;
    use super::super::cbor::Cid;
    use minicbor::data::Tag;
    use minicbor::Encoder;

    pub struct TestOp {
        pub action: &'static str,
        pub path: String,
        pub cid: Option<Cid>,
    }

    fn encode_cid(enc: &mut Encoder<&mut Vec<u8>>, cid: &Cid) {
        let mut payload = vec![0x00];
        payload.extend_from_slice(&cid.0);
        enc.tag(Tag::new(42)).unwrap().bytes(&payload).unwrap();
    }

    /// Build a binary `#commit` frame (header + body).
    pub fn build_commit_frame(
        seq: u64,
        repo: &str,
        ops: &[TestOp],
        blocks: &[(Cid, Vec<u8>)],
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(2).unwrap();
        enc.str("op").unwrap().u64(1).unwrap();
        enc.str("t").unwrap().str("#commit").unwrap();

        let car = build_car(blocks);
        enc.map(4).unwrap();
        enc.str("seq").unwrap().u64(seq).unwrap();
        enc.str("repo").unwrap().str(repo).unwrap();
        enc.str("blocks").unwrap().bytes(&car).unwrap();
        enc.str("ops").unwrap().array(ops.len() as u64).unwrap();
        for op in ops {
            enc.map(3).unwrap();
            enc.str("action").unwrap().str(op.action).unwrap();
            enc.str("path").unwrap().str(&op.path).unwrap();
            enc.str("cid").unwrap();
            match &op.cid {
                Some(cid) => encode_cid(&mut enc, cid),
                None => {
                    enc.null().unwrap();
                }
            }
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::super::car::test_support::test_cid;
    use super::test_support::{build_commit_frame, TestOp};
    use super::*;
    use minicbor::Encoder;

    #[test]
    fn decodes_commit_frame() {
        let cid = test_cid(0x11);
        let frame = build_commit_frame(
            1000,
            "did:plc:alice",
            &[TestOp {
                action: "create",
                path: "app.bsky.feed.post/3jt64ar2lvs2a".to_string(),
                cid: Some(cid.clone()),
            }],
            &[(cid.clone(), vec![0xa0])],
        );

        match decode_frame(&frame).unwrap() {
            Frame::Commit(evt) => {
                assert_eq!(evt.seq, 1000);
                assert_eq!(evt.repo, "did:plc:alice");
                assert_eq!(evt.ops.len(), 1);
                assert_eq!(evt.ops[0].action, OpAction::Create);
                assert_eq!(evt.ops[0].cid.as_ref(), Some(&cid));
                assert!(evt.blocks.get(&cid).is_some());
            }
            other => panic!("expected commit, got {other:?}"),
        }
    }

    #[test]
    fn skips_non_commit_messages() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(2).unwrap();
        enc.str("op").unwrap().u64(1).unwrap();
        enc.str("t").unwrap().str("#identity").unwrap();
        enc.map(1).unwrap();
        enc.str("did").unwrap().str("did:plc:bob").unwrap();

        assert!(matches!(decode_frame(&buf).unwrap(), Frame::Skip));
    }

    #[test]
    fn error_frames_surface_as_errors() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(1).unwrap();
        enc.str("op").unwrap().i64(-1).unwrap();
        enc.map(2).unwrap();
        enc.str("error").unwrap().str("FutureCursor").unwrap();
        enc.str("message").unwrap().str("cursor in the future").unwrap();

        match decode_frame(&buf) {
            Err(Error::ErrorFrame { code, .. }) => assert_eq!(code, "FutureCursor"),
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[test]
    fn commit_without_blocks_is_dropped() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(2).unwrap();
        enc.str("op").unwrap().u64(1).unwrap();
        enc.str("t").unwrap().str("#commit").unwrap();
        enc.map(2).unwrap();
        enc.str("seq").unwrap().u64(5).unwrap();
        enc.str("repo").unwrap().str("did:plc:carol").unwrap();

        assert!(matches!(decode_frame(&buf).unwrap(), Frame::Skip));
    }
}
