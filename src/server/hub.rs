use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::types::ServerFrame;

struct Connection {
    client_id: Uuid,
    tx: mpsc::UnboundedSender<ServerFrame>,
}

/// The live WebSocket of each session; at most one per session.
#[derive(Clone, Default)]
pub struct ConnectionHub {
    connections: Arc<Mutex<HashMap<String, Connection>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket, replacing (and thereby closing) any previous one.
    pub fn register(&self, session_id: &str) -> (Uuid, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client_id = Uuid::new_v4();
        let previous = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.to_string(), Connection { client_id, tx });
        if previous.is_some() {
            tracing::info!(session_id, "replacing existing WebSocket connection");
        }
        (client_id, rx)
    }

    /// Remove the socket if it is still the registered one.
    pub fn unregister(&self, session_id: &str, client_id: Uuid) {
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if connections
            .get(session_id)
            .is_some_and(|c| c.client_id == client_id)
        {
            connections.remove(session_id);
            tracing::debug!(session_id, "WebSocket unregistered");
        }
    }

    pub fn is_connected(&self, session_id: &str) -> bool {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .is_some_and(|c| !c.tx.is_closed())
    }

    /// Queue a frame; a dead socket is dropped and `false` returned.
    pub fn send(&self, session_id: &str, frame: ServerFrame) -> bool {
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(connection) = connections.get(session_id) else {
            tracing::debug!(session_id, "no WebSocket for frame");
            return false;
        };
        if connection.tx.send(frame).is_err() {
            tracing::warn!(session_id, "WebSocket gone, unregistering");
            connections.remove(session_id);
            return false;
        }
        true
    }

    pub fn len(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
