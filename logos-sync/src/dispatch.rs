//! Message dispatch shared by the provider and the server rooms.
//!
//! | type            | handler                                  | reply                 |
//! |-----------------|------------------------------------------|-----------------------|
//! | Sync            | sync responder against the document      | iff it wrote one      |
//! | Awareness       | merge into the registry, tagged origin   | none                  |
//! | Auth            | auth reader, permission-denied callback  | none                  |
//! | QueryAwareness  | encode the full registry                 | Awareness frame       |
//! | anything else   | logged and dropped                       | none                  |
//!
//! Awareness frames never produce a direct reply: the registry's own update
//! notification drives any re-broadcast.

use yrs::encoding::read::Read;
use yrs::encoding::write::Write;
use yrs::{Doc, Origin, StateVector};

use crate::awareness::{Awareness, AwarenessChanges};
use crate::protocol::{decode_envelope, encode_envelope, has_body, MessageType, ProtocolError};
use crate::sync::{self, SyncStep};

/// What handling one frame did.
#[derive(Debug, Default)]
pub struct Outcome {
    /// `None` for unknown tags.
    pub message_type: Option<MessageType>,
    pub sync_step: Option<SyncStep>,
    pub awareness_changes: Option<AwarenessChanges>,
    pub permission_denied: Option<String>,
    /// Frame to send back to whoever sent this one.
    pub reply: Option<Vec<u8>>,
}

/// Decode `frame` and run it against `doc` and `awareness`.
///
/// Every mutation is tagged with `origin`.
pub fn dispatch(
    frame: &[u8],
    doc: &Doc,
    awareness: &Awareness,
    origin: &Origin,
) -> Result<Outcome, ProtocolError> {
    let (tag, mut cursor) = decode_envelope(frame)?;
    let message_type = MessageType::from_tag(tag);
    let mut outcome = Outcome {
        message_type,
        ..Outcome::default()
    };

    match message_type {
        Some(MessageType::Sync) => {
            let mut reply = encode_envelope(MessageType::Sync, |_| {});
            outcome.sync_step = Some(sync::read_sync_message(&mut cursor, &mut reply, doc, origin)?);
            if has_body(&reply) {
                outcome.reply = Some(reply);
            }
        }
        Some(MessageType::Awareness) => {
            let update = cursor.read_buf()?;
            outcome.awareness_changes = Some(awareness.apply_update(update, Some(origin))?);
        }
        Some(MessageType::Auth) => {
            sync::read_auth_message(&mut cursor, |reason| {
                outcome.permission_denied = Some(reason.to_string());
            })?;
        }
        Some(MessageType::QueryAwareness) => {
            outcome.reply = Some(awareness_frame(&awareness.encode_full_update()));
        }
        None => {
            log::warn!("Dropping frame with unknown message type {tag}");
        }
    }

    Ok(outcome)
}

// ─── Frame builders ───────────────────────────────────────────────────

pub fn sync_step1_frame(doc: &Doc) -> Vec<u8> {
    encode_envelope(MessageType::Sync, |buf| sync::write_sync_step1(buf, doc))
}

/// Step 2 answering `remote`; the default state vector yields the full state.
pub fn sync_step2_frame(doc: &Doc, remote: &StateVector) -> Vec<u8> {
    encode_envelope(MessageType::Sync, |buf| sync::write_sync_step2(buf, doc, remote))
}

pub fn update_frame(update: &[u8]) -> Vec<u8> {
    encode_envelope(MessageType::Sync, |buf| sync::write_update(buf, update))
}

pub fn awareness_frame(update: &[u8]) -> Vec<u8> {
    encode_envelope(MessageType::Awareness, |buf| buf.write_buf(update))
}

pub fn query_awareness_frame() -> Vec<u8> {
    encode_envelope(MessageType::QueryAwareness, |_| {})
}

pub fn permission_denied_frame(reason: &str) -> Vec<u8> {
    encode_envelope(MessageType::Auth, |buf| sync::write_permission_denied(buf, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use yrs::{GetString, ReadTxn, Text, Transact, WriteTxn};

    fn origin() -> Origin {
        Origin::from("test")
    }

    #[test]
    fn test_unknown_type_is_noop() {
        let doc = Doc::new();
        let awareness = Awareness::with_client_id(1);
        let outcome = dispatch(&[99], &doc, &awareness, &origin()).unwrap();
        assert!(outcome.message_type.is_none());
        assert!(outcome.reply.is_none());
    }

    #[test]
    fn test_empty_frame_is_error() {
        let doc = Doc::new();
        let awareness = Awareness::with_client_id(1);
        assert!(dispatch(&[], &doc, &awareness, &origin()).is_err());
    }

    #[test]
    fn test_step1_gets_reply_update_does_not() {
        let server = Doc::new();
        {
            let mut txn = server.transact_mut();
            txn.get_or_insert_text("t").insert(&mut txn, 0, "abc");
        }
        let client = Doc::new();
        let awareness = Awareness::with_client_id(1);

        let outcome = dispatch(&sync_step1_frame(&client), &server, &awareness, &origin()).unwrap();
        assert_eq!(outcome.sync_step, Some(SyncStep::Step1));
        let reply = outcome.reply.unwrap();

        let outcome = dispatch(&reply, &client, &awareness, &origin()).unwrap();
        assert_eq!(outcome.sync_step, Some(SyncStep::Step2));
        assert!(outcome.reply.is_none());

        let txn = client.transact();
        assert_eq!(txn.get_text("t").unwrap().get_string(&txn), "abc");
    }

    #[test]
    fn test_awareness_frame_applies_without_reply() {
        let doc = Doc::new();
        let remote = Awareness::with_client_id(7);
        remote.set_local_field("cursor", json!(5));
        let local = Awareness::with_client_id(1);

        let frame = awareness_frame(&remote.encode_update(&[7]));
        let outcome = dispatch(&frame, &doc, &local, &origin()).unwrap();
        assert!(outcome.reply.is_none());
        assert_eq!(outcome.awareness_changes.unwrap().added, vec![7]);
        assert_eq!(local.state(7), Some(json!({"cursor": 5})));
    }

    #[test]
    fn test_query_awareness_replies_with_snapshot() {
        let doc = Doc::new();
        let local = Awareness::with_client_id(1);
        let outcome = dispatch(&query_awareness_frame(), &doc, &local, &origin()).unwrap();
        let reply = outcome.reply.unwrap();

        let other = Awareness::with_client_id(2);
        dispatch(&reply, &doc, &other, &origin()).unwrap();
        assert_eq!(other.state(1), Some(json!({})));
    }

    #[test]
    fn test_permission_denied_surfaces_reason() {
        let doc = Doc::new();
        let awareness = Awareness::with_client_id(1);
        let outcome =
            dispatch(&permission_denied_frame("nope"), &doc, &awareness, &origin()).unwrap();
        assert_eq!(outcome.permission_denied.as_deref(), Some("nope"));
        assert!(outcome.reply.is_none());
    }
}
