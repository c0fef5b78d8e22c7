use clap::Parser;
use log::{error, info, warn};
use server::broadcast::DeviceBroadcaster;
use server::config::ServerConfig;
use server::dispatch::{Dispatcher, EventForwarder, QuestionBank};
use server::game::{Engine, Observers};
use server::hub::Hub;
use server::network::{DeviceListener, WebListener};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address to bind both listeners to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port buzzers connect to
    #[arg(short = 't', long, default_value_t = shared::DEVICE_TCP_PORT)]
    tcp_port: u16,

    /// Port admin pages and screens connect to over WebSocket
    #[arg(short = 'w', long, default_value = "8080")]
    ws_port: u16,

    /// Destination port of UDP broadcasts to buzzers
    #[arg(short = 'u', long, default_value_t = shared::DEVICE_UDP_PORT)]
    udp_port: u16,

    /// Send buzzer messages over their TCP connections instead of UDP
    #[arg(long)]
    no_udp: bool,

    /// Broadcast address used when no interface can be enumerated
    #[arg(long, default_value = "192.168.4.255")]
    udp_fallback: Ipv4Addr,

    /// Countdown in seconds when START carries none
    #[arg(short = 'd', long, default_value = "30")]
    default_delay: i64,

    /// JSON question bank, either a map keyed by id or a list
    #[arg(short = 'q', long)]
    questions: Option<PathBuf>,

    /// Score events kept in memory
    #[arg(long, default_value = "1000")]
    history_limit: usize,

    /// Outbound messages buffered per client before it is dropped
    #[arg(long, default_value = "256")]
    client_queue: usize,

    /// Inbound messages buffered for the dispatcher
    #[arg(long, default_value = "100")]
    inbound_queue: usize,

    /// Seconds of silence before a page is disconnected
    #[arg(long, default_value = "60")]
    web_timeout: u64,

    /// Seconds of silence before a buzzer is disconnected
    #[arg(long, default_value = "300")]
    device_timeout: u64,
}

impl Args {
    fn config(&self) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.tcp_addr = SocketAddr::new(self.host, self.tcp_port);
        config.ws_addr = SocketAddr::new(self.host, self.ws_port);
        config.udp_port = (!self.no_udp).then_some(self.udp_port);
        config.udp_fallback = self.udp_fallback;
        config.inbound_queue = self.inbound_queue.max(1);
        config.game.default_delay = self.default_delay;
        config.game.history_limit = self.history_limit;
        config.web_hub.client_queue = self.client_queue;
        config.web_hub.idle_timeout = Duration::from_secs(self.web_timeout);
        config.device_hub.client_queue = self.client_queue;
        config.device_hub.idle_timeout = Duration::from_secs(self.device_timeout);
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.config();

    let questions = match &args.questions {
        Some(path) => {
            let bank = QuestionBank::from_json(&std::fs::read_to_string(path)?)?;
            info!("Loaded {} questions from {}", bank.len(), path.display());
            bank
        }
        None => QuestionBank::new(),
    };

    let (forwarder, events) = EventForwarder::channel();
    let engine = Engine::with_observers(&config.game, Observers::all(Arc::new(forwarder)));

    let web = Hub::spawn("web", &config.web_hub);
    let devices = Hub::spawn("devices", &config.device_hub);
    let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue);

    let mut dispatcher = Dispatcher::new(engine, web.clone(), devices.clone(), questions, &config.game);
    if let Some(port) = config.udp_port {
        match DeviceBroadcaster::bind(port, config.udp_fallback).await {
            Ok(udp) => {
                info!("Broadcasting to buzzers on UDP port {}", port);
                dispatcher = dispatcher.with_udp(udp);
            }
            Err(e) => warn!("UDP broadcast unavailable, using TCP: {}", e),
        }
    }

    // A listener that fails to bind only takes its own transport down
    let mut listening = 0;
    match DeviceListener::bind(&config, devices.clone(), inbound_tx.clone()).await {
        Ok(listener) => {
            tokio::spawn(listener.run());
            listening += 1;
        }
        Err(e) => error!("Device listener on {} failed: {}", config.tcp_addr, e),
    }
    match WebListener::bind(&config, web.clone(), inbound_tx).await {
        Ok(listener) => {
            tokio::spawn(listener.run());
            listening += 1;
        }
        Err(e) => error!("WebSocket listener on {} failed: {}", config.ws_addr, e),
    }
    if listening == 0 {
        return Err("no listener could be started".into());
    }

    let dispatcher_handle = tokio::spawn(dispatcher.run(inbound_rx, events));

    tokio::select! {
        result = dispatcher_handle => {
            if let Err(e) = result {
                error!("Dispatcher task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    web.shutdown().await;
    devices.shutdown().await;
    Ok(())
}
