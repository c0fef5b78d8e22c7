//! Client registry owned by a hub's control loop
//!
//! This module tracks every connection registered with a hub:
//! - Registration with capacity limits and replacement of stale connections
//! - Client categories (admin page, display screen, buzzer) and their counts
//! - Bounded outbound queues with drop-on-full delivery
//! - Activity timestamps for monitoring
//!
//! The registry is plain synchronous data. Only the hub's control loop holds
//! it, so it never needs a lock.

use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;

/// An encoded message shared by every queue it is delivered to.
pub type Frame = Arc<str>;

/// Identity of a connection within one hub.
pub type ClientId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientKind {
    Admin,
    Display,
    Device,
}

impl ClientKind {
    /// Parses the `TYPE` a page announces with SET_CLIENT_TYPE.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "admin" => Some(ClientKind::Admin),
            "tv" | "display" => Some(ClientKind::Display),
            "device" | "bumper" => Some(ClientKind::Device),
            _ => None,
        }
    }
}

/// Connected clients per category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientCounts {
    pub admin: usize,
    pub display: usize,
    pub device: usize,
}

impl ClientCounts {
    pub fn total(&self) -> usize {
        self.admin + self.display + self.device
    }
}

/// What a hub reports about one of its clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub kind: ClientKind,
    pub idle: Duration,
}

/// A registered connection and the sending half of its outbound queue
#[derive(Debug)]
pub struct Client {
    pub id: ClientId,
    pub kind: ClientKind,
    /// Distinguishes successive connections that share an id
    pub connection: u64,
    /// Last time this connection showed inbound activity
    pub last_seen: Instant,
    sender: mpsc::Sender<Frame>,
}

impl Client {
    pub fn new(id: ClientId, kind: ClientKind, connection: u64, sender: mpsc::Sender<Frame>) -> Self {
        Self {
            id,
            kind,
            connection,
            last_seen: Instant::now(),
            sender,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Returns true if nothing was heard from this client within `timeout`
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }

    /// Enqueues without waiting. False when the queue is full or closed.
    fn deliver(&self, frame: &Frame) -> bool {
        match self.sender.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Client {} is not keeping up, dropping it", self.id);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// All clients of one hub, keyed by id
pub struct ClientManager {
    clients: HashMap<ClientId, Client>,
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            max_clients,
        }
    }

    /// Registers a client, replacing any connection already using its id.
    ///
    /// Returns false when the hub is full. A replacement never counts against
    /// the limit. Dropping the replaced client closes its queue, which ends
    /// its writer.
    pub fn add_client(&mut self, client: Client) -> bool {
        if let Some(previous) = self.clients.remove(&client.id) {
            info!(
                "Client {} reconnected, closing connection {}",
                previous.id, previous.connection
            );
        } else if self.clients.len() >= self.max_clients {
            warn!("Refusing client {}: {} clients connected", client.id, self.clients.len());
            return false;
        }

        info!("Client {} connected as {:?}", client.id, client.kind);
        self.clients.insert(client.id.clone(), client);
        true
    }

    /// Removes a client. With a connection token, only that connection is
    /// removed, so a closing stale socket cannot evict its replacement.
    pub fn remove_client(&mut self, id: &str, connection: Option<u64>) -> bool {
        let matches = self
            .clients
            .get(id)
            .is_some_and(|client| connection.map_or(true, |c| c == client.connection));

        if matches {
            self.clients.remove(id);
            info!("Client {} disconnected", id);
        }
        matches
    }

    pub fn set_kind(&mut self, id: &str, kind: ClientKind) -> bool {
        match self.clients.get_mut(id) {
            Some(client) => {
                client.kind = kind;
                true
            }
            None => false,
        }
    }

    pub fn touch(&mut self, id: &str, connection: u64) {
        if let Some(client) = self.clients.get_mut(id) {
            if client.connection == connection {
                client.touch();
            }
        }
    }

    /// Enqueues `frame` for every client and drops the ones whose queue
    /// was full or closed. Returns the dropped ids.
    pub fn fan_out(&mut self, frame: &Frame) -> Vec<ClientId> {
        let dropped: Vec<ClientId> = self
            .clients
            .values()
            .filter(|client| !client.deliver(frame))
            .map(|client| client.id.clone())
            .collect();

        for id in &dropped {
            self.clients.remove(id);
        }
        dropped
    }

    /// Enqueues `frame` for one client, dropping it if its queue is full.
    pub fn send_to(&mut self, id: &str, frame: &Frame) -> bool {
        let Some(client) = self.clients.get(id) else {
            warn!("No client {} to send to", id);
            return false;
        };

        if client.deliver(frame) {
            return true;
        }
        self.clients.remove(id);
        false
    }

    pub fn counts(&self) -> ClientCounts {
        let mut counts = ClientCounts::default();
        for client in self.clients.values() {
            match client.kind {
                ClientKind::Admin => counts.admin += 1,
                ClientKind::Display => counts.display += 1,
                ClientKind::Device => counts.device += 1,
            }
        }
        counts
    }

    /// Ids of clients silent for longer than `timeout`
    pub fn idle_clients(&self, timeout: Duration) -> Vec<ClientId> {
        self.clients
            .values()
            .filter(|client| client.is_timed_out(timeout))
            .map(|client| client.id.clone())
            .collect()
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        let mut infos: Vec<ClientInfo> = self
            .clients
            .values()
            .map(|client| ClientInfo {
                id: client.id.clone(),
                kind: client.kind,
                idle: client.last_seen.elapsed(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Drops every client, closing all outbound queues.
    pub fn clear(&mut self) {
        self.clients.clear();
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    fn test_client(id: &str, capacity: usize) -> (Client, mpsc::Receiver<Frame>) {
        test_client_with(id, ClientKind::Admin, 1, capacity)
    }

    fn test_client_with(
        id: &str,
        kind: ClientKind,
        connection: u64,
        capacity: usize,
    ) -> (Client, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Client::new(id.to_string(), kind, connection, tx), rx)
    }

    fn frame(text: &str) -> Frame {
        Arc::from(text)
    }

    #[test]
    fn test_client_manager_creation() {
        let manager = ClientManager::new(4);
        assert_eq!(manager.len(), 0);
        assert!(manager.is_empty());
        assert_eq!(manager.counts(), ClientCounts::default());
    }

    #[test]
    fn test_capacity_limit() {
        let mut manager = ClientManager::new(2);
        let (a, _ra) = test_client("a", 4);
        let (b, _rb) = test_client("b", 4);
        let (c, _rc) = test_client("c", 4);

        assert!(manager.add_client(a));
        assert!(manager.add_client(b));
        assert!(!manager.add_client(c));
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_reconnect_replaces_and_closes_old_queue() {
        let mut manager = ClientManager::new(1);
        let (old, mut old_rx) = test_client_with("10.0.0.5", ClientKind::Device, 1, 4);
        let (new, _new_rx) = test_client_with("10.0.0.5", ClientKind::Device, 2, 4);

        assert!(manager.add_client(old));
        assert!(manager.add_client(new));
        assert_eq!(manager.len(), 1);
        assert!(matches!(old_rx.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[test]
    fn test_stale_unregister_keeps_replacement() {
        let mut manager = ClientManager::new(4);
        let (old, _old_rx) = test_client_with("dev", ClientKind::Device, 1, 4);
        let (new, _new_rx) = test_client_with("dev", ClientKind::Device, 2, 4);
        manager.add_client(old);
        manager.add_client(new);

        assert!(!manager.remove_client("dev", Some(1)));
        assert!(manager.contains("dev"));
        assert!(manager.remove_client("dev", Some(2)));
        assert!(!manager.remove_client("dev", None));
    }

    #[test]
    fn test_fan_out_drops_only_full_client() {
        let mut manager = ClientManager::new(8);
        let mut receivers = Vec::new();
        for id in ["a", "b", "c", "d"] {
            let (client, rx) = test_client(id, 1);
            manager.add_client(client);
            receivers.push((id, rx));
        }

        // pre-fill c's queue to capacity
        assert!(manager.send_to("c", &frame("stale")));

        let dropped = manager.fan_out(&frame("update"));
        assert_eq!(dropped, vec!["c".to_string()]);
        assert_eq!(manager.len(), 3);

        for (id, rx) in receivers.iter_mut() {
            let got = rx.try_recv().unwrap();
            if *id == "c" {
                assert_eq!(&*got, "stale");
            } else {
                assert_eq!(&*got, "update");
            }
        }
    }

    #[test]
    fn test_fan_out_shares_one_encoding() {
        let mut manager = ClientManager::new(8);
        let (a, mut ra) = test_client("a", 2);
        let (b, mut rb) = test_client("b", 2);
        manager.add_client(a);
        manager.add_client(b);

        let encoded = frame("{\"ACTION\":\"UPDATE\"}");
        manager.fan_out(&encoded);

        let from_a = ra.try_recv().unwrap();
        let from_b = rb.try_recv().unwrap();
        assert!(Arc::ptr_eq(&from_a, &from_b));
    }

    #[test]
    fn test_fan_out_drops_closed_client() {
        let mut manager = ClientManager::new(8);
        let (a, ra) = test_client("a", 2);
        manager.add_client(a);
        drop(ra);

        assert_eq!(manager.fan_out(&frame("x")), vec!["a".to_string()]);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_counts_by_kind() {
        let mut manager = ClientManager::new(8);
        let (a, _ra) = test_client_with("a", ClientKind::Admin, 1, 1);
        let (b, _rb) = test_client_with("b", ClientKind::Admin, 2, 1);
        let (c, _rc) = test_client_with("c", ClientKind::Device, 3, 1);
        manager.add_client(a);
        manager.add_client(b);
        manager.add_client(c);

        assert!(manager.set_kind("b", ClientKind::Display));
        assert!(!manager.set_kind("zz", ClientKind::Display));

        let counts = manager.counts();
        assert_eq!(
            counts,
            ClientCounts {
                admin: 1,
                display: 1,
                device: 1
            }
        );
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn test_client_timeout() {
        let (mut client, _rx) = test_client("a", 1);
        assert!(!client.is_timed_out(Duration::from_secs(5)));

        client.last_seen = Instant::now() - Duration::from_secs(6);
        assert!(client.is_timed_out(Duration::from_secs(5)));

        client.touch();
        assert!(!client.is_timed_out(Duration::from_secs(5)));
    }

    #[test]
    fn test_idle_clients_and_touch() {
        let mut manager = ClientManager::new(4);
        let (a, _ra) = test_client_with("a", ClientKind::Admin, 7, 1);
        manager.add_client(a);
        assert!(manager.idle_clients(Duration::from_secs(60)).is_empty());

        if let Some(client) = manager.clients.get_mut("a") {
            client.last_seen = Instant::now() - Duration::from_secs(120);
        }
        assert_eq!(manager.idle_clients(Duration::from_secs(60)), vec!["a".to_string()]);

        // wrong connection token leaves the timestamp alone
        manager.touch("a", 8);
        assert_eq!(manager.idle_clients(Duration::from_secs(60)).len(), 1);
        manager.touch("a", 7);
        assert!(manager.idle_clients(Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_client_kind_tags() {
        assert_eq!(ClientKind::from_tag("tv"), Some(ClientKind::Display));
        assert_eq!(ClientKind::from_tag("ADMIN"), Some(ClientKind::Admin));
        assert_eq!(ClientKind::from_tag("toaster"), None);
    }

    #[test]
    fn test_clear_closes_queues() {
        let mut manager = ClientManager::new(4);
        let (a, mut ra) = test_client("a", 1);
        manager.add_client(a);
        manager.clear();
        assert!(matches!(ra.try_recv(), Err(TryRecvError::Disconnected)));
    }
}
