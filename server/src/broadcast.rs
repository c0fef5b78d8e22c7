//! Send-only UDP fan-out to buzzers.
//!
//! There is no client set here. Every send recomputes the broadcast address
//! of each usable IPv4 interface and writes the stream-encoded message to all
//! of them. A send succeeds if at least one destination accepted it.

use log::{debug, warn};
use shared::{Message, ProtocolError};
use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use thiserror::Error;
use tokio::net::UdpSocket;

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("udp socket error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("broadcast failed on all {attempted} destinations: {last}")]
    AllFailed { attempted: usize, last: io::Error },
}

/// Source of subnet broadcast addresses.
pub trait InterfaceSource: Send + Sync {
    fn broadcast_addresses(&self) -> io::Result<Vec<Ipv4Addr>>;
}

/// Reads the host's network interfaces.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn broadcast_addresses(&self) -> io::Result<Vec<Ipv4Addr>> {
        let addresses = if_addrs::get_if_addrs()?
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .filter_map(|iface| match iface.addr {
                if_addrs::IfAddr::V4(v4) => Some(
                    v4.broadcast
                        .unwrap_or_else(|| subnet_broadcast(v4.ip, v4.netmask)),
                ),
                if_addrs::IfAddr::V6(_) => None,
            })
            .collect();
        Ok(addresses)
    }
}

/// `ip | !netmask`
pub fn subnet_broadcast(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

pub struct DeviceBroadcaster {
    socket: UdpSocket,
    port: u16,
    fallback: Ipv4Addr,
    interfaces: Box<dyn InterfaceSource>,
}

impl DeviceBroadcaster {
    /// Opens an ephemeral broadcast-enabled socket targeting `port`.
    pub async fn bind(port: u16, fallback: Ipv4Addr) -> Result<Self, BroadcastError> {
        Self::with_interfaces(port, fallback, Box::new(SystemInterfaces)).await
    }

    pub async fn with_interfaces(
        port: u16,
        fallback: Ipv4Addr,
        interfaces: Box<dyn InterfaceSource>,
    ) -> Result<Self, BroadcastError> {
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
        socket.set_broadcast(true)?;
        debug!("UDP broadcaster ready, target port {}", port);

        Ok(Self {
            socket,
            port,
            fallback,
            interfaces,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Current destination set, de-duplicated. Falls back to the configured
    /// address when no interface qualifies.
    pub fn destinations(&self) -> Vec<Ipv4Addr> {
        let mut addresses = match self.interfaces.broadcast_addresses() {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!("Failed to enumerate interfaces: {}", e);
                Vec::new()
            }
        };
        let mut seen = HashSet::new();
        addresses.retain(|addr| seen.insert(*addr));

        if addresses.is_empty() {
            addresses.push(self.fallback);
        }
        addresses
    }

    /// Returns how many destinations accepted the datagram.
    pub async fn broadcast(&self, message: &Message) -> Result<usize, BroadcastError> {
        let data = message.encode_stream()?;
        let destinations = self.destinations();

        let mut delivered = 0;
        let mut last_error = None;
        for ip in &destinations {
            let target = SocketAddrV4::new(*ip, self.port);
            match self.socket.send_to(&data, target).await {
                Ok(sent) => {
                    debug!("Broadcast {} bytes to {} ({})", sent, target, message.action);
                    delivered += 1;
                }
                Err(e) => {
                    warn!("Broadcast to {} failed: {}", target, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(last) if delivered == 0 => Err(BroadcastError::AllFailed {
                attempted: destinations.len(),
                last,
            }),
            _ => Ok(delivered),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{decode_single, Action};
    use std::time::Duration;
    use tokio::time::timeout;

    struct FixedInterfaces(Vec<Ipv4Addr>);

    impl InterfaceSource for FixedInterfaces {
        fn broadcast_addresses(&self) -> io::Result<Vec<Ipv4Addr>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenInterfaces;

    impl InterfaceSource for BrokenInterfaces {
        fn broadcast_addresses(&self) -> io::Result<Vec<Ipv4Addr>> {
            Err(io::Error::new(io::ErrorKind::Other, "no interfaces"))
        }
    }

    #[test]
    fn test_subnet_broadcast() {
        assert_eq!(
            subnet_broadcast(Ipv4Addr::new(192, 168, 4, 17), Ipv4Addr::new(255, 255, 255, 0)),
            Ipv4Addr::new(192, 168, 4, 255)
        );
        assert_eq!(
            subnet_broadcast(Ipv4Addr::new(10, 1, 2, 3), Ipv4Addr::new(255, 0, 0, 0)),
            Ipv4Addr::new(10, 255, 255, 255)
        );
    }

    #[tokio::test]
    async fn test_destinations_deduplicated() {
        let local = Ipv4Addr::new(10, 0, 0, 255);
        let source = FixedInterfaces(vec![local, local, Ipv4Addr::new(10, 1, 0, 255)]);
        let broadcaster =
            DeviceBroadcaster::with_interfaces(1234, Ipv4Addr::new(192, 168, 4, 255), Box::new(source))
                .await
                .unwrap();

        assert_eq!(
            broadcaster.destinations(),
            vec![local, Ipv4Addr::new(10, 1, 0, 255)]
        );
    }

    #[tokio::test]
    async fn test_fallback_without_interfaces() {
        let fallback = Ipv4Addr::new(192, 168, 4, 255);

        let empty = DeviceBroadcaster::with_interfaces(1234, fallback, Box::new(FixedInterfaces(vec![])))
            .await
            .unwrap();
        assert_eq!(empty.destinations(), vec![fallback]);

        let broken = DeviceBroadcaster::with_interfaces(1234, fallback, Box::new(BrokenInterfaces))
            .await
            .unwrap();
        assert_eq!(broken.destinations(), vec![fallback]);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_listener() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let source = FixedInterfaces(vec![Ipv4Addr::LOCALHOST]);
        let broadcaster = DeviceBroadcaster::with_interfaces(port, Ipv4Addr::LOCALHOST, Box::new(source))
            .await
            .unwrap();

        let delivered = broadcaster
            .broadcast(&Message::empty(Action::Ping))
            .await
            .unwrap();
        assert_eq!(delivered, 1);

        let mut buffer = [0u8; 1024];
        let (len, _) = timeout(Duration::from_secs(2), receiver.recv_from(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buffer[len - 2..len], b"\n\0");
        let message = decode_single(&buffer[..len]).unwrap();
        assert_eq!(message.action, Action::Ping);
    }
}
