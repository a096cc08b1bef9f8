//! Fan-out of broadcast events to connected real-time clients.
//!
//! Each client is an unbounded queue drained by its socket writer. A client
//! whose queue is closed is pruned on the next publish; nothing is retried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error};
use sensor_relay_types::BroadcastEvent;
use tokio::sync::mpsc;

pub const WELCOME_MESSAGE: &str = "Connected to server.";
pub const RESET_MESSAGE: &str = "New client connected - resetting all sensors";

pub type ClientId = u64;

/// Shared reference to the hub, handed to every component that publishes.
pub type SharedBroadcastHub = Arc<BroadcastHub>;

/// Receiving end of one client's queue.
#[derive(Debug)]
pub struct ClientHandle {
    pub id: ClientId,
    pub rx: mpsc::UnboundedReceiver<String>,
}

#[derive(Debug, Default)]
pub struct BroadcastHub {
    clients: Mutex<HashMap<ClientId, mpsc::UnboundedSender<String>>>,
    next_client: AtomicU64,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// The client map stays usable after a panic elsewhere; each operation
    /// leaves it consistent.
    fn clients(&self) -> MutexGuard<'_, HashMap<ClientId, mpsc::UnboundedSender<String>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a client without any greeting.
    pub fn register(&self) -> ClientHandle {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients().insert(id, tx);
        ClientHandle { id, rx }
    }

    /// Register a new real-time connection: greet it, then tell everyone
    /// (the newcomer included) to reset their sensor state.
    pub fn connect(&self) -> ClientHandle {
        let handle = self.register();
        self.send_to(handle.id, &BroadcastEvent::status(WELCOME_MESSAGE));
        let delivered = self.publish(&BroadcastEvent::reset_sensors(RESET_MESSAGE));
        debug!(
            "[HUB] Client {} connected, reset sent to {delivered} clients",
            handle.id
        );
        handle
    }

    pub fn disconnect(&self, id: ClientId) {
        self.clients().remove(&id);
    }

    /// Send an event to every open client. Returns the number of deliveries.
    pub fn publish(&self, event: &BroadcastEvent) -> usize {
        let Some(text) = serialize(event) else {
            return 0;
        };

        let mut clients = self.clients();
        let mut delivered = 0;
        clients.retain(|_, tx| {
            let open = tx.send(text.clone()).is_ok();
            if open {
                delivered += 1;
            }
            open
        });
        debug!("[HUB] Published {} to {delivered} clients", event.kind());
        delivered
    }

    /// Send an event to a single client. Returns false if it is gone.
    pub fn send_to(&self, id: ClientId, event: &BroadcastEvent) -> bool {
        let Some(text) = serialize(event) else {
            return false;
        };

        let mut clients = self.clients();
        match clients.get(&id) {
            Some(tx) if tx.send(text).is_ok() => true,
            Some(_) => {
                clients.remove(&id);
                false
            }
            None => false,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients().len()
    }
}

fn serialize(event: &BroadcastEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(text) => Some(text),
        Err(e) => {
            error!("[HUB] Failed to serialize {} event: {e}", event.kind());
            None
        }
    }
}
