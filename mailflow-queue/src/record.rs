//! Encoding of the object record
//!
//! The object record is the bincode encoding of a [`Mail`] without its
//! content. The content record is the raw message bytes and needs no codec.

use mailflow_common::Mail;

use crate::{
    Result,
    error::{QueueError, SerializationError},
    types::RecordKey,
};

/// Encode the metadata half of `mail`
///
/// # Errors
/// Returns a serialization error if bincode rejects the mail
pub fn encode(mail: &Mail) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(mail, bincode::config::standard())
        .map_err(|e| SerializationError::Encode(e).into())
}

/// Decode an object record and re-attach its content
///
/// The id stored inside the record must agree with the key it was found
/// under; a mismatch means the pair was tampered with or mixed up.
///
/// # Errors
/// Returns a serialization error for undecodable bytes and
/// [`QueueError::Corrupt`] if the ids disagree
pub fn decode(key: &RecordKey, object: &[u8], content: Vec<u8>) -> Result<Mail> {
    let (mut mail, _): (Mail, usize) =
        bincode::serde::decode_from_slice(object, bincode::config::standard())
            .map_err(SerializationError::Decode)?;

    if mail.id() != key.id() {
        return Err(QueueError::Corrupt {
            key: *key,
            reason: format!("object record holds mail {}", mail.id()),
        });
    }

    mail.attach_content(content.into());
    Ok(mail)
}
