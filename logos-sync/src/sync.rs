//! Sync and auth sub-protocols carried inside the envelope.
//!
//! ```text
//! Sync payload:  varuint subtype │ varUint8Array body
//!   0 = step 1 (encoded state vector)
//!   1 = step 2 (encoded update answering a step 1)
//!   2 = update (incremental encoded update)
//!
//! Auth payload:  varuint subtype │ varString reason
//!   0 = permission denied
//! ```

use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Transact, Update};

use crate::protocol::ProtocolError;

pub const SYNC_STEP1: u64 = 0;
pub const SYNC_STEP2: u64 = 1;
pub const SYNC_UPDATE: u64 = 2;

pub const PERMISSION_DENIED: u64 = 0;

/// Which sync sub-message a frame carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    Step1,
    Step2,
    Update,
}

/// Write a step 1 request carrying the document's state vector.
pub fn write_sync_step1(buf: &mut Vec<u8>, doc: &Doc) {
    let sv = doc.transact().state_vector().encode_v1();
    buf.write_var(SYNC_STEP1);
    buf.write_buf(sv);
}

/// Write a step 2 answer with everything `doc` has that `remote` lacks.
pub fn write_sync_step2(buf: &mut Vec<u8>, doc: &Doc, remote: &StateVector) {
    let update = doc.transact().encode_state_as_update_v1(remote);
    buf.write_var(SYNC_STEP2);
    buf.write_buf(update);
}

/// Write an incremental update.
pub fn write_update(buf: &mut Vec<u8>, update: &[u8]) {
    buf.write_var(SYNC_UPDATE);
    buf.write_buf(update);
}

/// Read one sync sub-message and apply it to `doc`.
///
/// A step 1 is answered by appending a step 2 to `reply`. Step 2 and update
/// payloads are applied in a transaction tagged with `origin`, so update
/// observers can tell remote changes from local ones.
pub fn read_sync_message(
    cursor: &mut Cursor<'_>,
    reply: &mut Vec<u8>,
    doc: &Doc,
    origin: &Origin,
) -> Result<SyncStep, ProtocolError> {
    let subtype: u64 = cursor.read_var()?;
    match subtype {
        SYNC_STEP1 => {
            let sv = StateVector::decode_v1(cursor.read_buf()?)?;
            write_sync_step2(reply, doc, &sv);
            Ok(SyncStep::Step1)
        }
        SYNC_STEP2 => {
            apply_update(cursor.read_buf()?, doc, origin)?;
            Ok(SyncStep::Step2)
        }
        SYNC_UPDATE => {
            apply_update(cursor.read_buf()?, doc, origin)?;
            Ok(SyncStep::Update)
        }
        other => Err(ProtocolError::UnknownSyncMessage(other)),
    }
}

fn apply_update(payload: &[u8], doc: &Doc, origin: &Origin) -> Result<(), ProtocolError> {
    let update = Update::decode_v1(payload)?;
    let mut txn = doc.transact_mut_with(origin.clone());
    txn.apply_update(update)
        .map_err(|e| ProtocolError::InvalidUpdate(e.to_string()))
}

/// Write a permission-denied auth message.
pub fn write_permission_denied(buf: &mut Vec<u8>, reason: &str) {
    buf.write_var(PERMISSION_DENIED);
    buf.write_string(reason);
}

/// Read an auth message, invoking `on_denied` with the reason on denial.
pub fn read_auth_message<F>(cursor: &mut Cursor<'_>, on_denied: F) -> Result<(), ProtocolError>
where
    F: FnOnce(&str),
{
    let subtype: u64 = cursor.read_var()?;
    match subtype {
        PERMISSION_DENIED => {
            let reason = cursor.read_string()?;
            on_denied(reason);
            Ok(())
        }
        other => Err(ProtocolError::UnknownAuthMessage(other)),
    }
}
