//! CTProto — a bidirectional, message-oriented application protocol layered
//! on a persistent duplex connection.
//!
//! Two cooperating halves live in this crate: [`server`] drives one
//! connection's auth-wait/authorized/closed state machine and the chunked
//! upload reassembler, while [`client`] drives the send/await-reply engine
//! and the chunked upload driver. [`protocol`] defines the wire envelope and
//! chunk frame shared by both.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use error::CtProtoError;
pub use protocol::{ChunkFrame, NewMessage, ResponseMessage};
