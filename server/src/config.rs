//! Runtime settings handed to each component at construction.
//!
//! Nothing in the library reads the environment; the `server` binary builds a
//! [`ServerConfig`] from its command line and passes pieces of it down.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Settings for the game engine.
#[derive(Debug, Clone)]
pub struct GameConfig {
    /// Countdown used by START when the admin does not send one, in seconds.
    pub default_delay: i64,
    /// Period of one countdown step.
    pub tick_interval: Duration,
    /// Score events kept in memory; the oldest are dropped first.
    pub history_limit: usize,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            default_delay: 30,
            tick_interval: Duration::from_secs(1),
            history_limit: 1000,
        }
    }
}

/// Settings shared by every duplex hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each client's outbound queue before it is dropped.
    pub client_queue: usize,
    /// Capacity of the hub's control channel.
    pub command_queue: usize,
    pub max_clients: usize,
    /// Interval between keepalive pings (frame transports only).
    pub heartbeat_interval: Duration,
    /// A connection with no inbound traffic for this long is closed.
    pub idle_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            client_queue: 256,
            command_queue: 256,
            max_clients: 128,
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Where buzzers connect (stream framing).
    pub tcp_addr: SocketAddr,
    /// Where admin and display pages connect (WebSocket).
    pub ws_addr: SocketAddr,
    /// Destination port for device broadcasts, `None` to disable UDP.
    pub udp_port: Option<u16>,
    /// Broadcast address used when no interface can be enumerated.
    pub udp_fallback: Ipv4Addr,
    /// Capacity of the queue feeding the dispatcher.
    pub inbound_queue: usize,
    /// Size of each TCP read.
    pub read_chunk: usize,
    pub game: GameConfig,
    pub web_hub: HubConfig,
    pub device_hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_addr: SocketAddr::from(([0, 0, 0, 0], shared::DEVICE_TCP_PORT)),
            ws_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            udp_port: Some(shared::DEVICE_UDP_PORT),
            udp_fallback: Ipv4Addr::new(192, 168, 4, 255),
            inbound_queue: 100,
            read_chunk: 4096,
            game: GameConfig::default(),
            web_hub: HubConfig::default(),
            device_hub: HubConfig {
                idle_timeout: Duration::from_secs(300),
                ..HubConfig::default()
            },
        }
    }
}
