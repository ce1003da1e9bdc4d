//! Error taxonomy shared by both halves of the protocol engine.

use thiserror::Error;

/// Every error the protocol engine can produce, grouped by the kind of
/// handling it demands rather than by the layer that raised it.
#[derive(Debug, Error)]
pub enum CtProtoError {
    /// Inbound frame could not be parsed at all: not UTF-8, not JSON, not an
    /// object, or a binary frame shorter than the 18-byte header. Always
    /// fatal to the connection.
    #[error("{0}")]
    Parse(String),

    /// Inbound frame parsed but its shape is wrong: a missing/mistyped field
    /// or an id that fails the alphabet/length check. Never fatal.
    #[error("{0}")]
    Format(String),

    /// The connection violated the protocol's opening handshake or auth
    /// contract (wrong first message, auth timeout, `onAuth` rejection).
    #[error("{0}")]
    Policy(String),

    /// An application-supplied hook (`onMessage`/`onUploadMessage`) returned
    /// an error. Logged and dropped; the connection is unaffected.
    #[error("application handler failed: {0}")]
    Application(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The upload sub-protocol's own retry/ordering budget was exhausted.
    #[error("upload failed: {0}")]
    Upload(#[from] UploadError),

    /// The underlying duplex transport itself failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    Ws(#[from] axum::Error),

    #[error("websocket client error: {0}")]
    WsClient(#[from] tokio_tungstenite::tungstenite::Error),

    /// A client-side request (or queued upload chunk) whose resolver was
    /// dropped because the reconnect budget (§9's "Reconnect-budget
    /// semantics") was exhausted before a response arrived. The source
    /// leaks these; this crate rejects them instead.
    #[error("disconnected: {0}")]
    Disconnected(String),
}

impl CtProtoError {
    /// Whether this error must close the connection (`Parse`, `Policy`) or
    /// can be reported without tearing anything down (`Format`,
    /// `Application`).
    pub fn is_fatal(&self) -> bool {
        matches!(self, CtProtoError::Parse(_) | CtProtoError::Policy(_))
    }
}

/// Chunked-upload-specific failures, client side.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("chunk {chunk} exceeded retry budget after {attempts} attempts")]
    RetryBudgetExhausted { chunk: u32, attempts: u32 },

    #[error("ack for chunk {received} did not match expected chunk {expected}")]
    OutOfOrderAck { expected: u32, received: u32 },

    #[error("reconnect budget exhausted before upload could resume")]
    ReconnectExhausted,
}
