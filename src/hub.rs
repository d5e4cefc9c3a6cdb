//! The hub owns the set of live push connections.
//!
//! All mutation of that set, and every broadcast fan-out, happens inside a
//! single task that drains one ordered event queue. Other tasks talk to it
//! through a clonable [`HubHandle`].

use crate::error::{Error, Result};
use crate::message::Message;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Capacity of the hub's inbound event queue.
const EVENT_QUEUE_CAPACITY: usize = 64;

/// Opaque identity of one push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug)]
enum HubEvent {
    Register {
        id: ConnectionId,
        outbound: Sender<Message>,
    },
    Unregister(ConnectionId),
    Broadcast(Message),
    Snapshot(oneshot::Sender<Vec<ConnectionId>>),
}

/// Counts from a single fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub dropped: usize,
}

/// The coordinating side of the hub. Run it with [`Hub::run`] or [`Hub::spawn`].
pub struct Hub {
    connections: HashMap<ConnectionId, Sender<Message>>,
    events: Receiver<HubEvent>,
}

/// Cheap, clonable access to a running [`Hub`].
#[derive(Clone)]
pub struct HubHandle {
    events: Sender<HubEvent>,
    next_id: Arc<AtomicU64>,
}

impl Hub {
    /// Creates a hub and the handle used to reach it.
    pub fn new() -> (Hub, HubHandle) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let hub = Hub {
            connections: HashMap::new(),
            events: rx,
        };
        let handle = HubHandle {
            events: tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (hub, handle)
    }

    /// Creates a hub and runs it on a background task.
    pub fn spawn() -> HubHandle {
        let (hub, handle) = Hub::new();
        tokio::spawn(hub.run());
        handle
    }

    /// Processes events one at a time until every handle is dropped.
    pub async fn run(mut self) {
        info!("Hub started.");
        while let Some(event) = self.events.recv().await {
            self.handle(event);
        }
        info!(
            "All hub handles dropped, hub stopping with {} connection(s).",
            self.connections.len()
        );
    }

    fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Register { id, outbound } => self.insert(id, outbound),
            HubEvent::Unregister(id) => self.remove(id),
            HubEvent::Broadcast(message) => {
                let fan_out = self.fan_out(&message);
                debug!(
                    "Broadcast {:?}: delivered to {}, dropped {}.",
                    message, fan_out.delivered, fan_out.dropped
                );
            }
            HubEvent::Snapshot(reply) => {
                let _ = reply.send(self.ids());
            }
        }
    }

    fn insert(&mut self, id: ConnectionId, outbound: Sender<Message>) {
        self.connections.insert(id, outbound);
        info!(
            "Registered {}, {} active connection(s).",
            id,
            self.connections.len()
        );
    }

    /// Removing the entry drops the hub's sender, which closes the queue.
    fn remove(&mut self, id: ConnectionId) {
        if self.connections.remove(&id).is_some() {
            info!(
                "Unregistered {}, {} active connection(s).",
                id,
                self.connections.len()
            );
        } else {
            debug!("Unregister for {} ignored, not active.", id);
        }
    }

    fn fan_out(&mut self, message: &Message) -> FanOut {
        let mut fan_out = FanOut::default();
        self.connections
            .retain(|id, outbound| match outbound.try_send(message.clone()) {
                Ok(()) => {
                    fan_out.delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!("Outbound queue for {} is full, dropping connection.", id);
                    fan_out.dropped += 1;
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Outbound pump for {} is gone, dropping connection.", id);
                    fan_out.dropped += 1;
                    false
                }
            });
        fan_out
    }

    fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.keys().copied().collect();
        ids.sort();
        ids
    }
}

impl HubHandle {
    /// Allocates a fresh identity for a connection about to register.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Adds a connection whose outbound queue is fed by `outbound`.
    ///
    /// The hub must hold the only sender for the queue; dropping it is how the
    /// hub closes the queue.
    pub async fn register(&self, id: ConnectionId, outbound: Sender<Message>) -> Result<()> {
        self.send(HubEvent::Register { id, outbound }).await
    }

    /// Removes a connection and closes its queue. Unknown ids are ignored.
    pub async fn unregister(&self, id: ConnectionId) -> Result<()> {
        self.send(HubEvent::Unregister(id)).await
    }

    /// Queues `message` for every active connection.
    pub async fn broadcast(&self, message: Message) -> Result<()> {
        self.send(HubEvent::Broadcast(message)).await
    }

    /// Ids of the active connections, in allocation order.
    pub async fn active_connections(&self) -> Result<Vec<ConnectionId>> {
        let (tx, rx) = oneshot::channel();
        self.send(HubEvent::Snapshot(tx)).await?;
        rx.await.map_err(|_| Error::HubClosed)
    }

    async fn send(&self, event: HubEvent) -> Result<()> {
        self.events.send(event).await.map_err(|_| Error::HubClosed)
    }
}
