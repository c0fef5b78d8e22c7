//! Duplex broadcast hub: one control loop per transport.
//!
//! The [`Hub`] task owns a [`ClientManager`] and is the only code that touches
//! it. Everything else talks to it through a cloneable [`HubHandle`], whose
//! broadcast path never waits: it encodes the message once and hands the
//! shared frame to the control loop with `try_send`. The loop in turn
//! enqueues the frame on every client queue with `try_send` and drops any
//! client whose queue is full. Activity reports travel on their own channel
//! so a burst of inbound traffic cannot crowd broadcasts out of the control
//! queue.

use crate::client_manager::{
    Client, ClientCounts, ClientId, ClientInfo, ClientKind, ClientManager, Frame,
};
use crate::config::HubConfig;
use log::{debug, error, info, warn};
use shared::{Message, ProtocolError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Error)]
pub enum HubError {
    #[error("hub {0} has shut down")]
    Closed(&'static str),

    #[error("hub {0} is saturated, message dropped")]
    Busy(&'static str),

    #[error("hub {0} is full")]
    Full(&'static str),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Requests handled by the control loop
#[derive(Debug)]
pub enum HubCommand {
    Register {
        client: Client,
        reply: oneshot::Sender<bool>,
    },
    Unregister {
        id: ClientId,
        connection: u64,
    },
    Broadcast(Frame),
    SendTo {
        id: ClientId,
        frame: Frame,
    },
    SetKind {
        id: ClientId,
        kind: ClientKind,
    },
    List(oneshot::Sender<Vec<ClientInfo>>),
    Shutdown,
}

/// Names one connection's membership in a hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientTicket {
    pub id: ClientId,
    pub connection: u64,
}

/// A connection's ticket and the receiving end of its outbound queue.
#[derive(Debug)]
pub struct Registration {
    pub ticket: ClientTicket,
    pub outbound: mpsc::Receiver<Frame>,
}

pub struct Hub {
    name: &'static str,
    clients: ClientManager,
    commands: mpsc::Receiver<HubCommand>,
    activity: mpsc::Receiver<ClientTicket>,
    counts: watch::Sender<ClientCounts>,
    idle_timeout: Duration,
}

impl Hub {
    pub fn new(name: &'static str, config: &HubConfig) -> (Self, HubHandle) {
        let (command_tx, command_rx) = mpsc::channel(config.command_queue.max(1));
        let (activity_tx, activity_rx) = mpsc::channel(config.command_queue.max(1));
        let (counts_tx, counts_rx) = watch::channel(ClientCounts::default());

        let hub = Self {
            name,
            clients: ClientManager::new(config.max_clients),
            commands: command_rx,
            activity: activity_rx,
            counts: counts_tx,
            idle_timeout: config.idle_timeout,
        };
        let handle = HubHandle {
            name,
            commands: command_tx,
            activity: activity_tx,
            counts: counts_rx,
            client_queue: config.client_queue.max(1),
            next_connection: Arc::new(AtomicU64::new(1)),
        };
        (hub, handle)
    }

    /// Starts the control loop on the current runtime.
    pub fn spawn(name: &'static str, config: &HubConfig) -> HubHandle {
        let (hub, handle) = Self::new(name, config);
        tokio::spawn(hub.run());
        handle
    }

    /// Serves commands until shutdown or until every handle is gone, then
    /// closes all client queues.
    pub async fn run(mut self) {
        info!("Hub {} started", self.name);

        let mut sweep = interval(self.idle_timeout.max(Duration::from_secs(1)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip the first tick since it fires immediately
        sweep.tick().await;

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle(command) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                Some(ticket) = self.activity.recv() => {
                    self.clients.touch(&ticket.id, ticket.connection);
                }
                _ = sweep.tick() => self.evict_idle(),
            }
        }

        self.clients.clear();
        self.publish_counts();
        info!("Hub {} stopped", self.name);
    }

    fn handle(&mut self, command: HubCommand) -> bool {
        match command {
            HubCommand::Register { client, reply } => {
                let admitted = self.clients.add_client(client);
                let _ = reply.send(admitted);
                self.publish_counts();
            }
            HubCommand::Unregister { id, connection } => {
                if self.clients.remove_client(&id, Some(connection)) {
                    self.publish_counts();
                }
            }
            HubCommand::Broadcast(frame) => {
                let dropped = self.clients.fan_out(&frame);
                if !dropped.is_empty() {
                    warn!("Hub {} dropped slow clients: {:?}", self.name, dropped);
                    self.publish_counts();
                }
            }
            HubCommand::SendTo { id, frame } => {
                let before = self.clients.len();
                self.clients.send_to(&id, &frame);
                if self.clients.len() != before {
                    self.publish_counts();
                }
            }
            HubCommand::SetKind { id, kind } => {
                if self.clients.set_kind(&id, kind) {
                    debug!("Hub {} client {} is now {:?}", self.name, id, kind);
                    self.publish_counts();
                }
            }
            HubCommand::List(reply) => {
                let _ = reply.send(self.clients.clients());
            }
            HubCommand::Shutdown => return false,
        }
        true
    }

    fn evict_idle(&mut self) {
        let idle = self.clients.idle_clients(self.idle_timeout);
        if idle.is_empty() {
            return;
        }

        for id in &idle {
            self.clients.remove_client(id, None);
        }
        info!("Hub {} evicted idle clients: {:?}", self.name, idle);
        self.publish_counts();
    }

    fn publish_counts(&self) {
        let counts = self.clients.counts();
        self.counts.send_if_modified(|current| {
            if *current == counts {
                false
            } else {
                *current = counts;
                true
            }
        });
    }
}

/// Cloneable front door to a running [`Hub`].
#[derive(Clone)]
pub struct HubHandle {
    name: &'static str,
    commands: mpsc::Sender<HubCommand>,
    activity: mpsc::Sender<ClientTicket>,
    counts: watch::Receiver<ClientCounts>,
    client_queue: usize,
    next_connection: Arc<AtomicU64>,
}

impl HubHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Registers a new connection and returns its outbound queue.
    pub async fn register(
        &self,
        id: impl Into<ClientId>,
        kind: ClientKind,
    ) -> Result<Registration, HubError> {
        let id = id.into();
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (sender, outbound) = mpsc::channel(self.client_queue);
        let (reply, admitted) = oneshot::channel();

        let client = Client::new(id.clone(), kind, connection, sender);
        self.commands
            .send(HubCommand::Register { client, reply })
            .await
            .map_err(|_| HubError::Closed(self.name))?;

        match admitted.await {
            Ok(true) => Ok(Registration {
                ticket: ClientTicket { id, connection },
                outbound,
            }),
            Ok(false) => Err(HubError::Full(self.name)),
            Err(_) => Err(HubError::Closed(self.name)),
        }
    }

    pub async fn unregister(&self, ticket: &ClientTicket) {
        let command = HubCommand::Unregister {
            id: ticket.id.clone(),
            connection: ticket.connection,
        };
        if self.commands.send(command).await.is_err() {
            debug!("Hub {} already closed", self.name);
        }
    }

    /// Encodes `message` once and queues it for every client. Never waits.
    ///
    /// When the control queue is full the frame is dropped for every client,
    /// healthy ones included, and [`HubError::Busy`] is returned. Size
    /// `command_queue` for the burst the dispatcher can produce.
    pub fn broadcast(&self, message: &Message) -> Result<(), HubError> {
        let frame: Frame = Arc::from(message.encode_frame()?);
        self.try_command(HubCommand::Broadcast(frame))
    }

    /// Queues `message` for a single client. Never waits.
    pub fn send_to(&self, id: &str, message: &Message) -> Result<(), HubError> {
        let frame: Frame = Arc::from(message.encode_frame()?);
        self.try_command(HubCommand::SendTo {
            id: id.to_string(),
            frame,
        })
    }

    pub async fn set_client_kind(&self, id: &str, kind: ClientKind) -> Result<(), HubError> {
        self.commands
            .send(HubCommand::SetKind {
                id: id.to_string(),
                kind,
            })
            .await
            .map_err(|_| HubError::Closed(self.name))
    }

    /// Records inbound activity. Never competes with broadcasts for the
    /// control queue; a report is skipped when its own queue is full, since
    /// the next one carries the same information.
    pub fn touch(&self, ticket: &ClientTicket) {
        if let Err(TrySendError::Full(_)) = self.activity.try_send(ticket.clone()) {
            debug!("Hub {} activity queue full, skipping touch", self.name);
        }
    }

    pub async fn clients(&self) -> Result<Vec<ClientInfo>, HubError> {
        let (reply, listing) = oneshot::channel();
        self.commands
            .send(HubCommand::List(reply))
            .await
            .map_err(|_| HubError::Closed(self.name))?;
        listing.await.map_err(|_| HubError::Closed(self.name))
    }

    /// Stops the control loop, closing every client queue.
    pub async fn shutdown(&self) {
        if self.commands.send(HubCommand::Shutdown).await.is_err() {
            debug!("Hub {} already closed", self.name);
        }
    }

    /// Latest client counts.
    pub fn counts(&self) -> ClientCounts {
        *self.counts.borrow()
    }

    /// Receiver that wakes on every change of the client counts.
    pub fn subscribe_counts(&self) -> watch::Receiver<ClientCounts> {
        self.counts.clone()
    }

    fn try_command(&self, command: HubCommand) -> Result<(), HubError> {
        match self.commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                error!("Hub {} control queue full, dropping message", self.name);
                Err(HubError::Busy(self.name))
            }
            Err(TrySendError::Closed(_)) => Err(HubError::Closed(self.name)),
        }
    }
}
