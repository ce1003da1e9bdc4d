//! Wire envelope, chunk framing, and validation.
//!
//! All payloads are opaque `serde_json::Value` objects — the protocol core
//! only enforces envelope shape, never interprets `type`/`payload` content.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CtProtoError;

const ID_LEN: usize = 10;
const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";
const CHUNK_HEADER_LEN: usize = 18;

/// Generates the 10-character `[A-Za-z0-9_-]` ids used for `messageId` and
/// `fileId`. Pluggable so callers can swap in a deterministic generator for
/// tests.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Default generator backed by `rand`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandIdGenerator;

impl IdGenerator for RandIdGenerator {
    fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..ID_LEN)
            .map(|_| {
                let idx = rng.gen_range(0..ID_ALPHABET.len());
                ID_ALPHABET[idx] as char
            })
            .collect()
    }
}

fn is_valid_id(id: &str) -> bool {
    id.len() == ID_LEN && id.bytes().all(|b| ID_ALPHABET.contains(&b))
}

/// A request or server-initiated update: carries `type` + `payload` under a
/// fresh or caller-supplied `messageId`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewMessage {
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

/// A reply to a prior `NewMessage`, correlated by `messageId`. Carries no
/// `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseMessage {
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub payload: Value,
}

/// An unpacked binary chunk frame (see §3 of the wire format: 18-byte
/// header followed by raw chunk bytes followed by a JSON sidecar).
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFrame {
    pub file_id: String,
    pub chunk_number: u32,
    pub data: Vec<u8>,
    pub sidecar: Value,
}

/// Builds a [`NewMessage`] with a fresh id.
pub fn build_new(gen: &dyn IdGenerator, kind: impl Into<String>, payload: Value) -> NewMessage {
    NewMessage {
        message_id: gen.generate(),
        kind: kind.into(),
        payload,
    }
}

/// Builds a [`ResponseMessage`] correlated to `message_id`.
pub fn build_response(message_id: impl Into<String>, payload: Value) -> ResponseMessage {
    ResponseMessage {
        message_id: message_id.into(),
        payload,
    }
}

/// Builds the reserved `"error"` NewMessage the server emits on a format
/// failure.
pub fn build_error(gen: &dyn IdGenerator, text: impl Into<String>) -> NewMessage {
    build_new(
        gen,
        "error",
        serde_json::json!({ "error": text.into() }),
    )
}

/// Packs a chunk into the wire layout: 10-byte fileId, 4-byte little-endian
/// chunkNumber, 4-byte little-endian dataSize, raw data, JSON sidecar.
pub fn pack_chunk(file_id: &str, chunk_number: u32, data: &[u8], sidecar: &Value) -> Vec<u8> {
    debug_assert!(is_valid_id(file_id));
    let sidecar_bytes = serde_json::to_vec(sidecar).expect("sidecar must serialize");
    let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + data.len() + sidecar_bytes.len());
    out.extend_from_slice(file_id.as_bytes());
    out.extend_from_slice(&chunk_number.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(&sidecar_bytes);
    out
}

/// Validates and parses a text frame into a [`NewMessage`].
///
/// `raw` must already be known to be a UTF-8 string (the transport layer
/// hands text frames as `String`/`&str`, never raw bytes) — non-UTF-8 input
/// belongs to [`validate_binary`]'s frame-too-short class of failure, not
/// this function.
pub fn validate_text(raw: &str) -> Result<NewMessage, CtProtoError> {
    let value: Value = serde_json::from_str(raw).map_err(|_| parse_failure())?;
    let obj = value.as_object().ok_or_else(parse_failure)?;

    let message_id = extract_message_id(obj)?;
    let kind = extract_type(obj)?;
    let payload = extract_payload(obj)?;

    Ok(NewMessage {
        message_id,
        kind,
        payload,
    })
}

/// Validates and parses a text frame that is expected to be a bare
/// response (no `type` field) — used by the client's pending-request
/// lookup, which must accept both NewMessage-shaped server pushes and
/// ResponseMessage-shaped replies on the same wire.
pub fn validate_inbound_text(raw: &str) -> Result<InboundText, CtProtoError> {
    let value: Value = serde_json::from_str(raw).map_err(|_| parse_failure())?;
    let obj = value.as_object().ok_or_else(parse_failure)?;

    let message_id = extract_message_id(obj)?;
    let payload = extract_payload(obj)?;
    let kind = match obj.get("type") {
        None => None,
        Some(_) => Some(extract_type(obj)?),
    };

    Ok(InboundText {
        message_id,
        kind,
        payload,
    })
}

/// A text frame as seen from the client: always has `messageId` and
/// `payload`; `type` is present on NewMessage-shaped frames (requests,
/// server pushes) and absent on pure ResponseMessage replies.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundText {
    pub message_id: String,
    pub kind: Option<String>,
    pub payload: Value,
}

fn extract_message_id(obj: &Map<String, Value>) -> Result<String, CtProtoError> {
    match obj.get("messageId") {
        None => Err(format_failure("'messageId' field missed")),
        Some(Value::String(s)) => {
            if is_valid_id(s) {
                Ok(s.clone())
            } else {
                Err(format_failure("Invalid message id"))
            }
        }
        Some(_) => Err(format_failure("'messageId' should be a string")),
    }
}

fn extract_type(obj: &Map<String, Value>) -> Result<String, CtProtoError> {
    match obj.get("type") {
        None => Err(format_failure("'type' field missed")),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(format_failure("'type' should be a string")),
    }
}

fn extract_payload(obj: &Map<String, Value>) -> Result<Value, CtProtoError> {
    match obj.get("payload") {
        None => Err(format_failure("'payload' field missed")),
        Some(v @ Value::Object(_)) => Ok(v.clone()),
        Some(_) => Err(format_failure("'payload' should be an object")),
    }
}

/// Validates and unpacks a binary chunk frame.
pub fn validate_binary(frame: &[u8]) -> Result<ChunkFrame, CtProtoError> {
    if frame.len() < CHUNK_HEADER_LEN {
        return Err(parse_failure());
    }

    let file_id = std::str::from_utf8(&frame[0..10]).map_err(|_| parse_failure())?;
    if !is_valid_id(file_id) {
        return Err(format_failure("Invalid file id"));
    }

    let chunk_number = u32::from_le_bytes(frame[10..14].try_into().unwrap());
    let data_size = u32::from_le_bytes(frame[14..18].try_into().unwrap()) as usize;

    let data_end = CHUNK_HEADER_LEN
        .checked_add(data_size)
        .ok_or_else(parse_failure)?;
    if frame.len() < data_end {
        return Err(parse_failure());
    }

    let data = frame[CHUNK_HEADER_LEN..data_end].to_vec();
    let sidecar_bytes = &frame[data_end..];
    let sidecar: Value = serde_json::from_slice(sidecar_bytes).map_err(|_| parse_failure())?;

    Ok(ChunkFrame {
        file_id: file_id.to_string(),
        chunk_number,
        data,
        sidecar,
    })
}

fn parse_failure() -> CtProtoError {
    CtProtoError::Parse("Unsupported data".to_string())
}

fn format_failure(msg: &str) -> CtProtoError {
    CtProtoError::Format(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_round_trip_matches_alphabet() {
        let gen = RandIdGenerator;
        for _ in 0..50 {
            let id = gen.generate();
            assert_eq!(id.len(), ID_LEN);
            assert!(is_valid_id(&id));
        }
    }

    #[test]
    fn build_new_produces_valid_envelope() {
        let gen = RandIdGenerator;
        let msg = build_new(&gen, "ping", serde_json::json!({}));
        let json = serde_json::to_string(&msg).unwrap();
        let parsed = validate_text(&json).unwrap();
        assert_eq!(parsed.kind, "ping");
        assert_eq!(parsed.payload, serde_json::json!({}));
        assert!(is_valid_id(&parsed.message_id));
    }

    #[test]
    fn validate_text_rejects_missing_message_id() {
        let err = validate_text(r#"{"type":"ping","payload":{}}"#).unwrap_err();
        assert_eq!(err.to_string(), "'messageId' field missed");
        assert!(!err.is_fatal());
    }

    #[test]
    fn validate_text_rejects_missing_type() {
        let err = validate_text(r#"{"messageId":"abcdefghij","payload":{}}"#).unwrap_err();
        assert_eq!(err.to_string(), "'type' field missed");
    }

    #[test]
    fn validate_text_rejects_missing_payload() {
        let err = validate_text(r#"{"messageId":"abcdefghij","type":"ping"}"#).unwrap_err();
        assert_eq!(err.to_string(), "'payload' field missed");
    }

    #[test]
    fn validate_text_rejects_wrong_types() {
        let err =
            validate_text(r#"{"messageId":5,"type":"ping","payload":{}}"#).unwrap_err();
        assert_eq!(err.to_string(), "'messageId' should be a string");

        let err = validate_text(r#"{"messageId":"abcdefghij","type":5,"payload":{}}"#)
            .unwrap_err();
        assert_eq!(err.to_string(), "'type' should be a string");

        let err = validate_text(r#"{"messageId":"abcdefghij","type":"ping","payload":5}"#)
            .unwrap_err();
        assert_eq!(err.to_string(), "'payload' should be an object");
    }

    #[test]
    fn validate_text_rejects_bad_id_shape() {
        let err =
            validate_text(r#"{"messageId":"short","type":"ping","payload":{}}"#).unwrap_err();
        assert_eq!(err.to_string(), "Invalid message id");
    }

    #[test]
    fn validate_text_rejects_non_json() {
        let err = validate_text("not json").unwrap_err();
        assert_eq!(err.to_string(), "Unsupported data");
        assert!(err.is_fatal());
    }

    #[test]
    fn pack_and_validate_binary_round_trip() {
        let data = b"hello world";
        let sidecar = serde_json::json!({ "messageId": "abcdefghij" });
        let frame = pack_chunk("0123456789", 3, data, &sidecar);
        let parsed = validate_binary(&frame).unwrap();
        assert_eq!(parsed.file_id, "0123456789");
        assert_eq!(parsed.chunk_number, 3);
        assert_eq!(parsed.data, data);
        assert_eq!(parsed.sidecar, sidecar);
    }

    #[test]
    fn validate_binary_rejects_short_frame() {
        let err = validate_binary(&[0u8; 10]).unwrap_err();
        assert_eq!(err.to_string(), "Unsupported data");
        assert!(err.is_fatal());
    }

    #[test]
    fn validate_binary_rejects_bad_file_id() {
        let data = b"x";
        let sidecar = serde_json::json!({});
        let frame = pack_chunk("0000000000", 0, data, &sidecar);
        let mut frame = frame;
        frame[0] = b'!'; // outside the id alphabet
        let err = validate_binary(&frame).unwrap_err();
        assert_eq!(err.to_string(), "Invalid file id");
        assert!(!err.is_fatal());
    }
}
