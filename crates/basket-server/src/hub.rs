//! Registry of live connections and fan-out.
//!
//! The registry is owned by a single task. Register, unregister and
//! broadcast arrive on one command queue and are applied one at a time, so
//! no client can join or leave while a broadcast is iterating.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use basket_core::BasketKey;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One serialized outbound frame, shared between recipients.
pub type Frame = Arc<str>;

/// Unique connection identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl Default for ClientId {
    fn default() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }
}

impl ClientId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The hub's end of a client queue. Dropping it closes the queue and
/// resolves the matching [`Mailbox::detached`].
pub struct Outbound {
    frames: mpsc::Sender<Frame>,
    _detach: oneshot::Sender<()>,
}

/// The connection's end of a client queue.
pub struct Mailbox {
    pub frames: mpsc::Receiver<Frame>,
    /// Resolves once the hub has dropped the client, even while frames are
    /// still buffered.
    pub detached: oneshot::Receiver<()>,
}

/// Bounded outbound queue for one client.
pub fn mailbox(capacity: usize) -> (Outbound, Mailbox) {
    let (frames_tx, frames_rx) = mpsc::channel(capacity);
    let (detach, detached) = oneshot::channel();
    (
        Outbound {
            frames: frames_tx,
            _detach: detach,
        },
        Mailbox {
            frames: frames_rx,
            detached,
        },
    )
}

/// What a connection keeps for replying to its own peer.
///
/// Holds only a weak sender: the hub owns the single strong sender, so
/// dropping the registration is what closes the queue.
#[derive(Clone, Debug)]
pub struct ClientHandle {
    pub id: ClientId,
    pub basket: BasketKey,
    outbound: mpsc::WeakSender<Frame>,
}

impl ClientHandle {
    pub fn new(id: ClientId, basket: BasketKey, outbound: &Outbound) -> Self {
        Self {
            id,
            basket,
            outbound: outbound.frames.downgrade(),
        }
    }

    /// Queue a frame for this client without waiting. Returns `false` if the
    /// queue is full or already closed.
    pub fn send(&self, frame: Frame) -> bool {
        let Some(tx) = self.outbound.upgrade() else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                warn!(client_id = %self.id, frame_len = frame.len(), "send queue full, dropping reply");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

enum HubCommand {
    Register {
        client: ClientId,
        basket: BasketKey,
        outbound: Outbound,
    },
    Unregister {
        client: ClientId,
    },
    Broadcast {
        sender: ClientId,
        basket: BasketKey,
        frame: Frame,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
}

struct Registration {
    basket: BasketKey,
    outbound: Outbound,
}

/// Cheap, cloneable front of the hub task.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Add a client to the live set. The hub keeps `outbound` until the client
    /// is unregistered or evicted.
    pub async fn register(&self, client: ClientId, basket: BasketKey, outbound: Outbound) {
        self.submit(HubCommand::Register {
            client,
            basket,
            outbound,
        })
        .await;
    }

    /// Remove a client and close its queue. A no-op if it is already gone.
    pub async fn unregister(&self, client: ClientId) {
        self.submit(HubCommand::Unregister { client }).await;
    }

    /// Deliver `frame` to every other client of `basket`.
    pub async fn broadcast(&self, sender: ClientId, basket: BasketKey, frame: Frame) {
        self.submit(HubCommand::Broadcast {
            sender,
            basket,
            frame,
        })
        .await;
    }

    /// Number of live clients, or `0` if the hub has stopped.
    pub async fn client_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::Count { reply }).await;
        rx.await.unwrap_or(0)
    }

    async fn submit(&self, command: HubCommand) {
        if self.commands.send(command).await.is_err() {
            debug!("hub stopped, command dropped");
        }
    }
}

/// Start the hub task. It runs until every [`HubHandle`] is dropped.
pub fn spawn(queue: usize) -> (HubHandle, JoinHandle<()>) {
    let (commands, rx) = mpsc::channel(queue);
    let hub = Hub {
        clients: HashMap::new(),
        commands: rx,
    };
    (HubHandle { commands }, tokio::spawn(hub.run()))
}

struct Hub {
    clients: HashMap<ClientId, Registration>,
    commands: mpsc::Receiver<HubCommand>,
}

impl Hub {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            self.apply(command);
        }
        info!(clients = self.clients.len(), "hub stopped");
    }

    fn apply(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register {
                client,
                basket,
                outbound,
            } => {
                info!(client_id = %client, basket = %basket, "client registered");
                let _ = self.clients.insert(client, Registration { basket, outbound });
            }
            HubCommand::Unregister { client } => {
                if self.clients.remove(&client).is_some() {
                    info!(client_id = %client, "client unregistered");
                }
            }
            HubCommand::Broadcast {
                sender,
                basket,
                frame,
            } => self.broadcast(&sender, &basket, &frame),
            HubCommand::Count { reply } => {
                let _ = reply.send(self.clients.len());
            }
        }
    }

    fn broadcast(&mut self, sender: &ClientId, basket: &BasketKey, frame: &Frame) {
        let mut evicted = Vec::new();
        let mut delivered = 0usize;

        for (id, registration) in &self.clients {
            if id == sender || &registration.basket != basket {
                continue;
            }
            match registration.outbound.frames.try_send(Arc::clone(frame)) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client_id = %id, "send queue full, evicting client");
                    evicted.push(id.clone());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(client_id = %id, "send queue closed, removing client");
                    evicted.push(id.clone());
                }
            }
        }

        // Dropping the registration closes the queue and fires `detached`.
        for id in &evicted {
            let _ = self.clients.remove(id);
        }

        debug!(
            sender = %sender,
            basket = %basket,
            delivered,
            evicted = evicted.len(),
            "broadcast"
        );
    }
}
