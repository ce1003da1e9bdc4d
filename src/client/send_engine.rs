//! Send Engine: pending-request table, send-queue during disconnection,
//! and the bounded reconnect loop.
//!
//! Grounded on `umbra-relay::federation::Federation::peer_connection_loop`
//! / `connect_to_peer`: `connect_async`, split into sender/receiver halves,
//! a spawned sender task draining an `mpsc::unbounded_channel`, and a
//! `while let Some(msg) = ws_receiver.next()` pump. Unlike the teacher's
//! unbounded exponential-backoff mesh reconnect, this loop is bounded to a
//! fixed delay and attempt count (§4.5/§9) because callers here — pending
//! request resolvers, queued sends — are blocked on the link succeeding,
//! where a federation peer link has no caller waiting on it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as TMessage;

use crate::error::CtProtoError;
use crate::protocol::{self, NewMessage};

use super::upload_driver::UploadJob;
use super::{ClientConfig, ClientHooks};

/// One outbound frame handed to the connection's writer task.
pub(crate) enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

enum ConnState {
    Connecting,
    Open(mpsc::UnboundedSender<Outbound>),
    Closed,
}

pub(crate) struct QueuedText {
    pub message_id: String,
    pub kind: String,
    pub payload: Value,
    pub resolver: oneshot::Sender<Value>,
}

pub(crate) struct QueuedChunk {
    pub file_id: String,
    pub chunk_number: u32,
    pub sidecar: Value,
}

/// Shared state behind the `Client<H>` handle. One instance per logical
/// connection; the connect loop, the public `send`/`send_file` calls, and
/// the chunk-ack retry tasks all hold an `Arc` to the same `Shared`.
pub struct Shared<H: ClientHooks> {
    pub(crate) config: ClientConfig<H>,
    state: RwLock<ConnState>,
    pub(crate) pending: DashMap<String, oneshot::Sender<Value>>,
    text_queue: std::sync::Mutex<VecDeque<QueuedText>>,
    chunk_queue: std::sync::Mutex<VecDeque<QueuedChunk>>,
    pub(crate) uploads: DashMap<String, Arc<UploadJob>>,
    reconnect_attempts: AtomicU32,
    shutting_down: AtomicBool,
}

impl<H: ClientHooks> Shared<H> {
    pub(crate) fn new(config: ClientConfig<H>) -> Self {
        Self {
            config,
            state: RwLock::new(ConnState::Connecting),
            pending: DashMap::new(),
            text_queue: std::sync::Mutex::new(VecDeque::new()),
            chunk_queue: std::sync::Mutex::new(VecDeque::new()),
            uploads: DashMap::new(),
            reconnect_attempts: AtomicU32::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let ConnState::Open(tx) = &*self.state.read().unwrap() {
            let _ = tx.send(Outbound::Close);
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Sends a request and awaits its response (§4.5). Queues the envelope
    /// if the connection is not open; the request resolver is rejected
    /// with [`CtProtoError::Disconnected`] if the reconnect budget is
    /// exhausted before a response arrives.
    pub(crate) async fn send(self: &Arc<Self>, kind: String, payload: Value) -> Result<Value, CtProtoError> {
        let message_id = self.config.id_gen.generate();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(message_id.clone(), tx);

        if !self.try_emit_new_message(&message_id, &kind, &payload) {
            if let Some((_, resolver)) = self.pending.remove(&message_id) {
                self.text_queue.lock().unwrap().push_back(QueuedText {
                    message_id,
                    kind,
                    payload,
                    resolver,
                });
            }
        }

        rx.await
            .map_err(|_| CtProtoError::Disconnected("reconnect budget exhausted".to_string()))
    }

    /// Emits a `NewMessage` with an already-chosen `messageId` if the
    /// connection is open. Returns whether it was actually sent.
    fn try_emit_new_message(&self, message_id: &str, kind: &str, payload: &Value) -> bool {
        let state = self.state.read().unwrap();
        match &*state {
            ConnState::Open(tx) => {
                let envelope = NewMessage {
                    message_id: message_id.to_string(),
                    kind: kind.to_string(),
                    payload: payload.clone(),
                };
                let json = serde_json::to_string(&envelope).expect("envelope must serialize");
                let _ = tx.send(Outbound::Text(json));
                true
            }
            _ => false,
        }
    }

    /// Emits a chunk frame if the connection is open, otherwise queues it
    /// for the reconnect path to re-drive (§3's `chunkQueue`). Returns
    /// whether it was actually sent.
    pub(crate) fn try_emit_binary(
        &self,
        file_id: &str,
        chunk_number: u32,
        data: &[u8],
        sidecar: &Value,
    ) -> bool {
        let tx = match &*self.state.read().unwrap() {
            ConnState::Open(tx) => Some(tx.clone()),
            _ => None,
        };
        match tx {
            Some(tx) => {
                let frame = protocol::pack_chunk(file_id, chunk_number, data, sidecar);
                let _ = tx.send(Outbound::Binary(frame));
                true
            }
            None => {
                self.chunk_queue.lock().unwrap().push_back(QueuedChunk {
                    file_id: file_id.to_string(),
                    chunk_number,
                    sidecar: sidecar.clone(),
                });
                false
            }
        }
    }

    async fn dispatch_inbound(self: &Arc<Self>, inbound: protocol::InboundText) {
        if let Some((_, resolver)) = self.pending.remove(&inbound.message_id) {
            let _ = resolver.send(inbound.payload.clone());
        }
        if let Some(kind) = inbound.kind {
            let envelope = NewMessage {
                message_id: inbound.message_id,
                kind,
                payload: inbound.payload,
            };
            // §5: the engine must not dispatch the next inbound frame until
            // this in-progress application call returns.
            self.config.hooks.on_message(&envelope).await;
        }
    }

    /// Issues the automatic `"authorize"` priming send on connection open
    /// (§4.5) in its own task so the pump loop stays free to deliver the
    /// response that resolves it.
    fn prime_authorize(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let payload = shared.config.auth_request_payload.clone();
            match shared.send("authorize".to_string(), payload).await {
                Ok(auth_payload) => shared.config.hooks.on_auth(auth_payload).await,
                Err(e) => {
                    if !shared.config.disable_logs {
                        tracing::warn!(error = %e, "authorize priming failed");
                    }
                }
            }
        });
    }

    /// Flushes `textQueue` then `chunkQueue` onto the freshly opened
    /// connection (§4.5: "On success, flush textQueue first, then
    /// chunkQueue").
    fn flush_queues(&self) {
        let texts: Vec<QueuedText> = self.text_queue.lock().unwrap().drain(..).collect();
        for queued in texts {
            self.pending.insert(queued.message_id.clone(), queued.resolver);
            self.try_emit_new_message(&queued.message_id, &queued.kind, &queued.payload);
        }

        let chunks: Vec<QueuedChunk> = self.chunk_queue.lock().unwrap().drain(..).collect();
        for queued in chunks {
            if let Some(job) = self.uploads.get(&queued.file_id) {
                let data = job.chunk_data(queued.chunk_number);
                self.try_emit_binary(&queued.file_id, queued.chunk_number, &data, &queued.sidecar);
            }
        }
    }

    /// Drops every outstanding resolver: in-flight pending requests, queued
    /// text sends, and (since upload acks/completions are resolved through
    /// the same pending table) in-flight uploads. This is the spec's noted
    /// intentional extension over the source, which leaks these (§9).
    fn fail_all_pending(&self) {
        self.pending.clear();
        self.text_queue.lock().unwrap().clear();
        self.chunk_queue.lock().unwrap().clear();
    }
}

/// The background connect/reconnect loop. Runs until [`Shared::shutdown`]
/// is called or the reconnect budget is exhausted.
pub(crate) async fn run<H: ClientHooks>(shared: Arc<Shared<H>>) {
    loop {
        if shared.is_shutting_down() {
            break;
        }

        let attempt = shared.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > shared.config.max_reconnect_attempts {
            if !shared.config.disable_logs {
                tracing::warn!("reconnect budget exhausted, giving up");
            }
            *shared.state.write().unwrap() = ConnState::Closed;
            shared.fail_all_pending();
            break;
        }

        match connect_once(&shared).await {
            Ok(()) => {
                if !shared.config.disable_logs {
                    tracing::info!("connection closed");
                }
            }
            Err(e) => {
                if !shared.config.disable_logs {
                    tracing::warn!(error = %e, "connection attempt failed");
                }
            }
        }

        if shared.is_shutting_down() {
            break;
        }

        tokio::time::sleep(shared.config.reconnect_delay).await;
    }
}

async fn connect_once<H: ClientHooks>(shared: &Arc<Shared<H>>) -> Result<(), CtProtoError> {
    *shared.state.write().unwrap() = ConnState::Connecting;

    let (ws_stream, _) = connect_async(&shared.config.api_url).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    *shared.state.write().unwrap() = ConnState::Open(out_tx);
    shared.reconnect_attempts.store(0, Ordering::SeqCst);

    if !shared.config.disable_logs {
        tracing::info!(url = %shared.config.api_url, "connected");
    }

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let (msg, is_close) = match frame {
                Outbound::Text(t) => (TMessage::Text(t.into()), false),
                Outbound::Binary(b) => (TMessage::Binary(b.into()), false),
                Outbound::Close => (TMessage::Close(None), true),
            };
            if ws_tx.send(msg).await.is_err() || is_close {
                break;
            }
        }
    });

    shared.prime_authorize();
    shared.flush_queues();

    let result = loop {
        match ws_rx.next().await {
            None => break Ok(()),
            Some(Err(e)) => break Err(CtProtoError::from(e)),
            Some(Ok(TMessage::Close(_))) => break Ok(()),
            Some(Ok(TMessage::Ping(_))) | Some(Ok(TMessage::Pong(_))) => continue,
            Some(Ok(TMessage::Frame(_))) => continue,
            Some(Ok(TMessage::Binary(_))) => {
                // The wire protocol never sends binary frames toward the
                // client; ignore rather than treat as fatal.
                continue;
            }
            Some(Ok(TMessage::Text(text))) => match protocol::validate_inbound_text(&text) {
                Ok(inbound) => shared.dispatch_inbound(inbound).await,
                Err(e) => {
                    if !shared.config.disable_logs {
                        tracing::warn!(error = %e, "received malformed frame");
                    }
                }
            },
        }
    };

    *shared.state.write().unwrap() = ConnState::Connecting;
    writer_task.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;

    struct NoopHooks;
    impl ClientHooks for NoopHooks {
        fn on_auth(&self, _payload: Value) -> impl Future<Output = ()> + Send {
            async {}
        }
        fn on_message(&self, _envelope: &NewMessage) -> impl Future<Output = ()> + Send {
            async {}
        }
    }

    fn shared() -> Arc<Shared<NoopHooks>> {
        let config = ClientConfig::new("ws://localhost:0", serde_json::json!({}), NoopHooks);
        Arc::new(Shared::new(config))
    }

    #[tokio::test]
    async fn send_while_disconnected_queues_and_waits() {
        let shared = shared();
        let s = Arc::clone(&shared);
        let handle = tokio::spawn(async move { s.send("ping".to_string(), serde_json::json!({})).await });

        tokio::task::yield_now().await;
        assert_eq!(shared.text_queue.lock().unwrap().len(), 1);

        handle.abort();
    }

    #[tokio::test]
    async fn reconnect_budget_exhausted_rejects_pending() {
        let shared = shared();
        let (tx, rx) = oneshot::channel();
        shared.pending.insert("abcdefghij".to_string(), tx);

        shared.fail_all_pending();

        assert!(rx.await.is_err());
        assert_eq!(shared.pending.len(), 0);
    }

    #[tokio::test]
    async fn dispatch_inbound_resolves_pending_and_calls_on_message() {
        let shared = shared();
        let (tx, rx) = oneshot::channel();
        shared.pending.insert("abcdefghij".to_string(), tx);

        shared
            .dispatch_inbound(protocol::InboundText {
                message_id: "abcdefghij".to_string(),
                kind: None,
                payload: serde_json::json!({"ok": true}),
            })
            .await;

        assert_eq!(rx.await.unwrap(), serde_json::json!({"ok": true}));
    }
}
