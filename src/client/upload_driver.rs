//! Upload Driver: sequential, stop-and-wait chunk sender with per-chunk
//! acknowledgement and bounded retry (§4.6).
//!
//! Grounded on `other_examples`'s `ChunkUploader::upload_chunk_with_retry`:
//! a `for` loop over chunks, each sent through a bounded retry loop that
//! races a per-attempt sleep against a completion signal. Adapted from
//! HTTP multipart PUT-per-chunk to CTProto's binary-frame-over-websocket
//! stop-and-wait protocol — instead of awaiting an HTTP response, each
//! attempt arms a `tokio::time::sleep` ack timer raced against the oneshot
//! resolver the send engine's pending-request table fulfills when the
//! matching `ResponseMessage` arrives. Chunk acks and the final completion
//! response both correlate by `messageId`, so they reuse that same table
//! rather than a separate upload-specific one.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{CtProtoError, UploadError};

use super::send_engine::Shared;
use super::ClientHooks;

/// Bytes per chunk (§4.6: "chunk size = 10,000 bytes; never split across
/// boundaries differently").
pub(crate) const CHUNK_SIZE: usize = 10_000;

/// Client-side sending state for one in-flight upload. Kept in
/// [`Shared::uploads`] for the lifetime of the job so the reconnect path
/// can re-slice a queued chunk's bytes without re-reading the caller's
/// original buffer.
pub(crate) struct UploadJob {
    buffer: Vec<u8>,
}

impl UploadJob {
    fn total_chunks(&self) -> u32 {
        (self.buffer.len().div_ceil(CHUNK_SIZE)).max(1) as u32
    }

    pub(crate) fn chunk_data(&self, chunk_number: u32) -> Vec<u8> {
        let start = chunk_number as usize * CHUNK_SIZE;
        let end = (start + CHUNK_SIZE).min(self.buffer.len());
        if start >= self.buffer.len() {
            return Vec::new();
        }
        self.buffer[start..end].to_vec()
    }
}

/// Drives one file to completion: emits chunk 0 with the type/payload/
/// chunk-count sidecar, then every subsequent chunk stop-and-wait, and
/// finally awaits the `messageId = fileId` completion response (§4.6).
pub(crate) async fn send_file<H: ClientHooks>(
    shared: &Arc<Shared<H>>,
    kind: String,
    file: Vec<u8>,
    payload: Value,
) -> Result<Value, CtProtoError> {
    let file_id = shared.config.id_gen.generate();
    let job = Arc::new(UploadJob { buffer: file });
    let total_chunks = job.total_chunks();
    shared.uploads.insert(file_id.clone(), Arc::clone(&job));

    // Registered up front so a completion response that races ahead of the
    // final chunk's own ack is never lost.
    let (completion_tx, completion_rx) = tokio::sync::oneshot::channel();
    shared.pending.insert(file_id.clone(), completion_tx);

    for chunk_number in 0..total_chunks {
        let data = job.chunk_data(chunk_number);
        let sidecar = if chunk_number == 0 {
            serde_json::json!({
                "type": kind,
                "payload": payload,
                "chunks": total_chunks,
            })
        } else {
            serde_json::json!({})
        };

        if let Err(e) = send_chunk_with_retry(shared, &file_id, chunk_number, &data, sidecar).await {
            shared.pending.remove(&file_id);
            shared.uploads.remove(&file_id);
            return Err(e);
        }
    }

    let result = completion_rx.await.map_err(|_| {
        CtProtoError::Disconnected("reconnect budget exhausted before upload completed".to_string())
    });
    shared.uploads.remove(&file_id);
    result
}

/// Emits one chunk and waits for its ack, re-emitting the identical frame
/// on every 5-second timeout up to 5 retries (6 total sends) before
/// failing the job (§4.6, §8 scenario S6).
async fn send_chunk_with_retry<H: ClientHooks>(
    shared: &Arc<Shared<H>>,
    file_id: &str,
    chunk_number: u32,
    data: &[u8],
    mut sidecar: Value,
) -> Result<(), CtProtoError> {
    let message_id = shared.config.id_gen.generate();
    sidecar["messageId"] = Value::String(message_id.clone());

    let (tx, mut rx) = tokio::sync::oneshot::channel();
    shared.pending.insert(message_id.clone(), tx);

    let mut retries = 0u32;
    loop {
        shared.try_emit_binary(file_id, chunk_number, data, &sidecar);

        tokio::select! {
            res = &mut rx => {
                return match res {
                    Ok(ack_payload) => verify_ack(&ack_payload, file_id, chunk_number),
                    Err(_) => Err(UploadError::ReconnectExhausted.into()),
                };
            }
            _ = tokio::time::sleep(shared.config.chunk_ack_timeout) => {
                retries += 1;
                if retries > 5 {
                    shared.pending.remove(&message_id);
                    return Err(UploadError::RetryBudgetExhausted {
                        chunk: chunk_number,
                        attempts: retries,
                    }
                    .into());
                }
                if !shared.config.disable_logs {
                    tracing::debug!(file_id, chunk_number, retries, "chunk ack timed out, retrying");
                }
            }
        }
    }
}

fn verify_ack(payload: &Value, file_id: &str, chunk_number: u32) -> Result<(), CtProtoError> {
    let ack_chunk = payload.get("chunkNumber").and_then(Value::as_u64);
    let ack_file = payload.get("fileId").and_then(Value::as_str);
    match (ack_chunk, ack_file) {
        (Some(n), Some(f)) if n as u32 == chunk_number && f == file_id => Ok(()),
        (Some(n), _) => Err(UploadError::OutOfOrderAck {
            expected: chunk_number,
            received: n as u32,
        }
        .into()),
        _ => Err(CtProtoError::Format("Unsupported data".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_matches_spec_example() {
        let job = UploadJob {
            buffer: vec![0u8; 25_000],
        };
        assert_eq!(job.total_chunks(), 3);
        assert_eq!(job.chunk_data(0).len(), 10_000);
        assert_eq!(job.chunk_data(1).len(), 10_000);
        assert_eq!(job.chunk_data(2).len(), 5_000);
    }

    #[test]
    fn empty_file_still_produces_one_chunk() {
        let job = UploadJob { buffer: Vec::new() };
        assert_eq!(job.total_chunks(), 1);
        assert_eq!(job.chunk_data(0).len(), 0);
    }

    #[test]
    fn verify_ack_accepts_matching_chunk_and_file() {
        let payload = serde_json::json!({"chunkNumber": 2, "fileId": "0123456789", "type": "store"});
        assert!(verify_ack(&payload, "0123456789", 2).is_ok());
    }

    #[test]
    fn verify_ack_rejects_mismatched_chunk_number() {
        let payload = serde_json::json!({"chunkNumber": 1, "fileId": "0123456789"});
        let err = verify_ack(&payload, "0123456789", 2).unwrap_err();
        assert!(matches!(err, CtProtoError::Upload(UploadError::OutOfOrderAck { .. })));
    }
}
