//! Server-side half of the protocol: the per-connection state machine, the
//! client registry, and the chunked-upload reassembler.

mod connection;
mod reassembler;
mod registry;

pub use connection::run_connection;
pub use reassembler::{ChunkOutcome, ReassemblerEvent, UploadReassembler};
pub use registry::{ClientHandle, ClientQuery, ClientRegistry, ServerFrame};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::protocol::{IdGenerator, RandIdGenerator};

/// External collaborator hooks supplied by the embedding application.
/// `auth_data` is the opaque value returned by [`ServerHooks::on_auth`] and
/// threaded back into every subsequent call on that connection.
pub trait ServerHooks: Send + Sync + 'static {
    /// Validates an `"authorize"` payload. An `Err` closes the connection
    /// with policy code `1008`, the error's message appended to the reason.
    fn on_auth(
        &self,
        payload: Value,
    ) -> impl Future<Output = Result<Value, Box<dyn std::error::Error + Send + Sync>>> + Send;

    /// Handles a non-authorize text message. A returned `Some(payload)`
    /// becomes a ResponseMessage; `Ok(None)` emits nothing; `Err` is logged
    /// and dropped (the connection survives).
    fn on_message(
        &self,
        auth_data: &Value,
        envelope: &crate::protocol::NewMessage,
    ) -> impl Future<Output = Result<Option<Value>, Box<dyn std::error::Error + Send + Sync>>> + Send;

    /// Handles a fully reassembled upload. Same return contract as
    /// [`ServerHooks::on_message`].
    fn on_upload_message(
        &self,
        auth_data: &Value,
        kind: &str,
        payload: &Value,
        file: Vec<u8>,
    ) -> impl Future<Output = Result<Option<Value>, Box<dyn std::error::Error + Send + Sync>>> + Send;
}

/// Server-side configuration: timers, logging, and the embedding
/// application's hooks.
pub struct ServerConfig<H: ServerHooks> {
    pub hooks: H,
    pub auth_timeout: Duration,
    pub upload_idle_timeout: Duration,
    pub disable_logs: bool,
    pub id_gen: Arc<dyn IdGenerator>,
}

impl<H: ServerHooks> ServerConfig<H> {
    pub fn new(hooks: H) -> Self {
        Self {
            hooks,
            auth_timeout: Duration::from_millis(3000),
            upload_idle_timeout: Duration::from_secs(15),
            disable_logs: false,
            id_gen: Arc::new(RandIdGenerator),
        }
    }
}
