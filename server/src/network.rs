//! Transport listeners wiring raw connections to a hub and the dispatcher.
//!
//! Every accepted connection gets two tasks: a reader that decodes messages
//! and forwards them to the shared inbound queue, and a writer that drains the
//! connection's outbound queue. Whichever finishes first tears the connection
//! down and unregisters it from its hub.

use crate::client_manager::{ClientKind, Frame};
use crate::config::ServerConfig;
use crate::hub::{ClientTicket, HubHandle, Registration};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{decode_single, now_micros, FrameParser, Message, ProtocolError, FRAME_DELIMITER};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Which listener a message arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Device,
    Web,
}

/// A decoded message tagged with its origin, as queued for the dispatcher.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub transport: Transport,
    /// Hub id of the connection the message came from.
    pub connection: String,
    /// The message `ID` when present, otherwise the connection id.
    pub sender: String,
    pub message: Message,
    /// Server receive time in epoch microseconds.
    pub received_at: i64,
}

impl Inbound {
    pub fn new(transport: Transport, connection: &str, message: Message) -> Self {
        let sender = message
            .id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(connection)
            .to_string();

        Self {
            transport,
            connection: connection.to_string(),
            sender,
            message,
            received_at: now_micros(),
        }
    }
}

/// Queues a message without waiting. Returns false once the dispatcher is gone.
fn forward(inbound: &mpsc::Sender<Inbound>, message: Inbound) -> bool {
    match inbound.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(dropped)) => {
            warn!(
                "Inbound queue full, dropping {} from {}",
                dropped.message.action, dropped.connection
            );
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Accept errors such as descriptor exhaustion are retried after a short pause.
async fn accept_backoff(listener: &str, err: io::Error) {
    error!("{} accept failed: {}", listener, err);
    sleep(Duration::from_millis(100)).await;
}

/// Listens for buzzers speaking the delimited stream protocol.
pub struct DeviceListener {
    listener: TcpListener,
    hub: HubHandle,
    inbound: mpsc::Sender<Inbound>,
    idle_timeout: Duration,
    read_chunk: usize,
}

impl DeviceListener {
    pub async fn bind(
        config: &ServerConfig,
        hub: HubHandle,
        inbound: mpsc::Sender<Inbound>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.tcp_addr).await?;
        info!("Device listener on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            hub,
            inbound,
            idle_timeout: config.device_hub.idle_timeout,
            read_chunk: config.read_chunk.max(1),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let connection = DeviceConnection {
                        hub: self.hub.clone(),
                        inbound: self.inbound.clone(),
                        idle_timeout: self.idle_timeout,
                        read_chunk: self.read_chunk,
                    };
                    tokio::spawn(connection.serve(stream, peer));
                }
                Err(e) => accept_backoff("Device listener", e).await,
            }
        }
    }
}

struct DeviceConnection {
    hub: HubHandle,
    inbound: mpsc::Sender<Inbound>,
    idle_timeout: Duration,
    read_chunk: usize,
}

impl DeviceConnection {
    async fn serve(self, stream: TcpStream, peer: SocketAddr) {
        // Buzzers reconnect from the same address, so the IP is the identity
        let id = peer.ip().to_string();
        let Registration { ticket, outbound } =
            match self.hub.register(id, ClientKind::Device).await {
                Ok(registration) => registration,
                Err(e) => {
                    warn!("Device {} rejected: {}", peer, e);
                    return;
                }
            };
        info!("Device connected from {}", peer);

        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay on {} failed: {}", peer, e);
        }
        let (reader, writer) = stream.into_split();
        let mut writer_task = tokio::spawn(write_stream(writer, outbound));

        tokio::select! {
            result = self.read_stream(reader, &ticket) => {
                if let Err(e) = result {
                    debug!("Read from device {} failed: {}", ticket.id, e);
                }
            }
            result = &mut writer_task => {
                if let Ok(Err(e)) = result {
                    debug!("Write to device {} failed: {}", ticket.id, e);
                }
            }
        }

        writer_task.abort();
        self.hub.unregister(&ticket).await;
        info!("Device {} disconnected", peer);
    }

    async fn read_stream(&self, mut reader: OwnedReadHalf, ticket: &ClientTicket) -> io::Result<()> {
        let mut parser = FrameParser::new();
        let mut buffer = vec![0u8; self.read_chunk];

        loop {
            let read = match timeout(self.idle_timeout, reader.read(&mut buffer)).await {
                Ok(result) => result?,
                Err(_) => {
                    info!("Device {} silent for {:?}, closing", ticket.id, self.idle_timeout);
                    return Ok(());
                }
            };
            if read == 0 {
                return Ok(());
            }

            self.hub.touch(ticket);
            parser.append(&buffer[..read]);
            for message in parser.parse() {
                if !forward(&self.inbound, Inbound::new(Transport::Device, &ticket.id, message)) {
                    return Ok(());
                }
            }
        }
    }
}

/// Drains the outbound queue, terminating every frame with `\n\0`.
async fn write_stream(mut writer: OwnedWriteHalf, mut outbound: mpsc::Receiver<Frame>) -> io::Result<()> {
    while let Some(frame) = outbound.recv().await {
        let mut bytes = Vec::with_capacity(frame.len() + 2);
        bytes.extend_from_slice(frame.as_bytes());
        bytes.push(b'\n');
        bytes.push(FRAME_DELIMITER);
        writer.write_all(&bytes).await?;
    }
    // The hub closed the queue: evicted, replaced or shut down
    writer.shutdown().await
}

/// Listens for admin and display pages over WebSocket.
pub struct WebListener {
    listener: TcpListener,
    hub: HubHandle,
    inbound: mpsc::Sender<Inbound>,
    heartbeat: Duration,
    idle_timeout: Duration,
}

impl WebListener {
    pub async fn bind(
        config: &ServerConfig,
        hub: HubHandle,
        inbound: mpsc::Sender<Inbound>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.ws_addr).await?;
        info!("WebSocket listener on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            hub,
            inbound,
            heartbeat: config.web_hub.heartbeat_interval.max(Duration::from_millis(10)),
            idle_timeout: config.web_hub.idle_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let connection = WebConnection {
                        hub: self.hub.clone(),
                        inbound: self.inbound.clone(),
                        heartbeat: self.heartbeat,
                        idle_timeout: self.idle_timeout,
                    };
                    tokio::spawn(connection.serve(stream, peer));
                }
                Err(e) => accept_backoff("WebSocket listener", e).await,
            }
        }
    }
}

struct WebConnection {
    hub: HubHandle,
    inbound: mpsc::Sender<Inbound>,
    heartbeat: Duration,
    idle_timeout: Duration,
}

impl WebConnection {
    async fn serve(self, stream: TcpStream, peer: SocketAddr) {
        let socket = match tokio_tungstenite::accept_async(stream).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("WebSocket handshake with {} failed: {}", peer, e);
                return;
            }
        };

        // Pages start as admins and may reclassify with SET_CLIENT_TYPE
        let Registration { ticket, outbound } =
            match self.hub.register(peer.to_string(), ClientKind::Admin).await {
                Ok(registration) => registration,
                Err(e) => {
                    warn!("Web client {} rejected: {}", peer, e);
                    return;
                }
            };
        info!("Web client connected from {}", peer);

        let (sink, source) = socket.split();
        let mut writer_task = tokio::spawn(write_frames(sink, outbound, self.heartbeat));

        tokio::select! {
            _ = self.read_frames(source, &ticket) => {}
            _ = &mut writer_task => debug!("Writer for {} finished", ticket.id),
        }

        writer_task.abort();
        self.hub.unregister(&ticket).await;
        info!("Web client {} disconnected", peer);
    }

    async fn read_frames(&self, mut source: WsSource, ticket: &ClientTicket) {
        loop {
            let frame = match timeout(self.idle_timeout, source.next()).await {
                Err(_) => {
                    info!("Web client {} silent for {:?}, closing", ticket.id, self.idle_timeout);
                    return;
                }
                Ok(None) => return,
                Ok(Some(Err(e))) => {
                    debug!("Read from {} failed: {}", ticket.id, e);
                    return;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            self.hub.touch(ticket);
            let decoded = match frame {
                WsMessage::Text(text) => decode_single(text.as_bytes()),
                WsMessage::Binary(data) => decode_single(&data),
                WsMessage::Close(_) => return,
                // Pings and pongs only count as activity
                _ => continue,
            };

            match decoded {
                Ok(message) => {
                    if !forward(&self.inbound, Inbound::new(Transport::Web, &ticket.id, message)) {
                        return;
                    }
                }
                Err(ProtocolError::Incomplete) => {}
                Err(e) => warn!("Bad frame from {}: {}", ticket.id, e),
            }
        }
    }
}

/// Sends queued frames as text messages and pings on a fixed interval.
async fn write_frames(mut sink: WsSink, mut outbound: mpsc::Receiver<Frame>, heartbeat: Duration) {
    let mut ping = interval(heartbeat);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return;
                };
                if sink.send(WsMessage::text(frame.to_string())).await.is_err() {
                    return;
                }
            }
            _ = ping.tick() => {
                if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    return;
                }
            }
        }
    }
}
