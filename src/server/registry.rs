//! Client Registry: fluent lookup/broadcast over the set of authorized
//! connections.
//!
//! Grounded on `RelayState`'s `online_clients: Arc<DashMap<String,
//! ClientSender>>` — same choice of a sharded concurrent map instead of a
//! single mutex around a `HashMap`, generalized from a flat DID→sender map
//! to records carrying opaque auth data plus a predicate-based query.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::{self, IdGenerator};

/// An outbound frame handed to a connection's writer task.
#[derive(Debug, Clone)]
pub enum ServerFrame {
    Text(String),
    Close(u16, String),
}

/// A registered, authorized connection.
#[derive(Clone)]
pub struct ClientHandle {
    pub id: String,
    pub auth_data: Value,
    sender: mpsc::UnboundedSender<ServerFrame>,
}

impl ClientHandle {
    fn send_frame(&self, frame: ServerFrame) {
        // The receiver only disappears once the connection's writer task has
        // already exited; a failed send here just means we lost a race with
        // that exit, which is not itself an error.
        let _ = self.sender.send(frame);
    }
}

/// Concurrent map of authorized clients, keyed by client id.
#[derive(Clone)]
pub struct ClientRegistry {
    clients: Arc<DashMap<String, ClientHandle>>,
    id_gen: Arc<dyn IdGenerator>,
}

impl ClientRegistry {
    pub fn new(id_gen: Arc<dyn IdGenerator>) -> Self {
        Self {
            clients: Arc::new(DashMap::new()),
            id_gen,
        }
    }

    /// Registers a newly authorized connection and returns its id.
    pub fn add(&self, auth_data: Value, sender: mpsc::UnboundedSender<ServerFrame>) -> String {
        let id = self.id_gen.generate();
        self.clients.insert(
            id.clone(),
            ClientHandle {
                id: id.clone(),
                auth_data,
                sender,
            },
        );
        tracing::debug!(client_id = %id, "client registered");
        id
    }

    /// Removes a client by id. Idempotent: removing twice is a no-op.
    pub fn remove(&self, id: &str) {
        if self.clients.remove(id).is_some() {
            tracing::debug!(client_id = %id, "client removed");
        }
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Starts a fluent query over every client matching `predicate`.
    pub fn find(&self, predicate: impl Fn(&ClientHandle) -> bool) -> ClientQuery {
        let matched: Vec<String> = self
            .clients
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        ClientQuery {
            registry: self.clone(),
            matched,
        }
    }
}

/// A snapshot of client ids matched by a [`ClientRegistry::find`] call.
/// Mutating operations (`remove`, `send`, `close`) act on every matched
/// client and return `self` so calls can be chained; `exists`, `current`,
/// and `to_array` are terminals.
pub struct ClientQuery {
    registry: ClientRegistry,
    matched: Vec<String>,
}

impl ClientQuery {
    pub fn exists(&self) -> bool {
        !self.matched.is_empty()
    }

    pub fn current(&self) -> Option<ClientHandle> {
        self.matched
            .first()
            .and_then(|id| self.registry.clients.get(id).map(|e| e.value().clone()))
    }

    pub fn to_array(&self) -> Vec<ClientHandle> {
        self.matched
            .iter()
            .filter_map(|id| self.registry.clients.get(id).map(|e| e.value().clone()))
            .collect()
    }

    /// Builds a NewMessage from `(type, payload)` and emits it to every
    /// matched client.
    pub fn send(self, kind: impl Into<String>, payload: Value) -> Self {
        let kind = kind.into();
        let msg = protocol::build_new(self.registry.id_gen.as_ref(), kind, payload);
        let json = serde_json::to_string(&msg).expect("envelope must serialize");
        for id in &self.matched {
            if let Some(entry) = self.registry.clients.get(id) {
                entry.send_frame(ServerFrame::Text(json.clone()));
            }
        }
        self
    }

    /// Closes every matched connection with the given code/reason.
    pub fn close(self, code: u16, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        for id in &self.matched {
            if let Some(entry) = self.registry.clients.get(id) {
                entry.send_frame(ServerFrame::Close(code, reason.clone()));
            }
        }
        self
    }

    /// Closes and then removes every matched client from the registry.
    pub fn remove(self) -> Self {
        for id in &self.matched {
            if let Some(entry) = self.registry.clients.get(id) {
                entry.send_frame(ServerFrame::Close(1000, "Normal".to_string()));
            }
            self.registry.remove(id);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RandIdGenerator;

    fn registry() -> ClientRegistry {
        ClientRegistry::new(Arc::new(RandIdGenerator))
    }

    #[test]
    fn add_and_find_round_trip() {
        let reg = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = reg.add(serde_json::json!({"userId": "u1"}), tx);

        let query = reg.find(|c| c.id == id);
        assert!(query.exists());
        assert_eq!(query.current().unwrap().auth_data["userId"], "u1");
    }

    #[test]
    fn removal_is_idempotent() {
        let reg = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = reg.add(serde_json::json!({}), tx);

        reg.remove(&id);
        reg.remove(&id);
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn send_emits_to_every_matched_client() {
        let reg = registry();
        let (tx, mut rx) = mpsc::unbounded_channel();
        reg.add(serde_json::json!({}), tx);

        reg.find(|_| true).send("ping", serde_json::json!({}));

        match rx.try_recv().unwrap() {
            ServerFrame::Text(json) => assert!(json.contains("\"type\":\"ping\"")),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn remove_closes_before_deleting() {
        let reg = registry();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = reg.add(serde_json::json!({}), tx);

        reg.find(|c| c.id == id).remove();

        assert!(matches!(rx.try_recv().unwrap(), ServerFrame::Close(1000, _)));
        assert_eq!(reg.count(), 0);
    }
}
