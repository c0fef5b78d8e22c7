//! A software buzzer for exercising the server without hardware.
//!
//! Connects over TCP, announces itself with HELLO, answers PING with PONG and
//! presses a random button a random moment after START.

use clap::Parser;
use log::{debug, info, warn};
use rand::Rng;
use shared::payload::{ButtonPayload, HelloPayload};
use shared::{decode_single, Action, FrameParser, Message};
use std::error::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

const BUTTONS: [&str; 4] = ["A", "B", "C", "D"];

#[derive(Parser, Debug)]
#[command(author, version, about = "Simulated quiz buzzer")]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:1234")]
    server: String,

    /// Hardware address to report, random when omitted
    #[arg(short = 'i', long)]
    id: Option<String>,

    #[arg(short = 'n', long, default_value = "Simulated buzzer")]
    name: String,

    #[arg(short = 't', long)]
    team: Option<String>,

    /// Longest reaction time after START, in milliseconds
    #[arg(long, default_value = "3000")]
    max_reaction: u64,

    /// Also listen for UDP broadcasts on this port
    #[arg(short = 'u', long)]
    listen_udp: Option<u16>,
}

fn random_address() -> String {
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| format!("{:02X}", rng.gen::<u8>()))
        .collect::<Vec<_>>()
        .join(":")
}

struct Buzzer {
    id: String,
    hello: HelloPayload,
    max_reaction: u64,
    outgoing: mpsc::UnboundedSender<Message>,
}

impl Buzzer {
    fn send(&self, message: Message) {
        if self.outgoing.send(message.with_id(self.id.clone())).is_err() {
            warn!("Connection writer is gone");
        }
    }

    fn say_hello(&self) {
        match Message::new(Action::Hello, &self.hello) {
            Ok(message) => self.send(message),
            Err(e) => warn!("Failed to encode HELLO: {}", e),
        }
    }

    fn handle(&self, message: Message) {
        match message.action {
            Action::Ping => {
                debug!("PING, answering PONG");
                self.send(Message::empty(Action::Pong));
            }
            Action::Hello | Action::Reset => self.say_hello(),
            Action::Start => self.press_later(),
            Action::Reveal => info!("Answer revealed: {}", message.msg.unwrap_or_default()),
            Action::Stop => info!("Round stopped"),
            other => debug!("Received {}", other),
        }
    }

    /// Stamps the press when it happens, not when START arrived.
    fn press_later(&self) {
        let (delay, button) = {
            let mut rng = rand::thread_rng();
            let delay = rng.gen_range(0..=self.max_reaction);
            (delay, BUTTONS[rng.gen_range(0..BUTTONS.len())])
        };
        let outgoing = self.outgoing.clone();
        let id = self.id.clone();

        tokio::spawn(async move {
            sleep(Duration::from_millis(delay)).await;
            let payload = ButtonPayload {
                button: button.to_string(),
                device: None,
            };
            match Message::new(Action::Button, &payload) {
                Ok(message) => {
                    info!("Pressing {} after {} ms", button, delay);
                    let _ = outgoing.send(message.with_id(id));
                }
                Err(e) => warn!("Failed to encode BUTTON: {}", e),
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let id = args.id.clone().unwrap_or_else(random_address);

    let stream = TcpStream::connect(&args.server).await?;
    info!("Connected to {} as {}", args.server, id);
    let (mut reader, mut writer) = stream.into_split();

    let (outgoing, mut queue) = mpsc::unbounded_channel::<Message>();
    let writer_task = tokio::spawn(async move {
        while let Some(message) = queue.recv().await {
            let bytes = match message.encode_stream() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to encode {}: {}", message.action, e);
                    continue;
                }
            };
            if let Err(e) = writer.write_all(&bytes).await {
                warn!("Write failed: {}", e);
                break;
            }
        }
    });

    let buzzer = Buzzer {
        id,
        hello: HelloPayload {
            ip: None,
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            name: Some(args.name.clone()),
            team: args.team.clone(),
        },
        max_reaction: args.max_reaction,
        outgoing,
    };
    buzzer.say_hello();

    let udp = match args.listen_udp {
        Some(port) => Some(UdpSocket::bind(("0.0.0.0", port)).await?),
        None => None,
    };

    let mut parser = FrameParser::new();
    let mut buffer = [0u8; 4096];
    let mut datagram = [0u8; 4096];

    loop {
        tokio::select! {
            read = reader.read(&mut buffer) => {
                let read = read?;
                if read == 0 {
                    info!("Server closed the connection");
                    break;
                }
                parser.append(&buffer[..read]);
                for message in parser.parse() {
                    buzzer.handle(message);
                }
            }
            received = async { udp.as_ref()?.recv_from(&mut datagram).await.ok() }, if udp.is_some() => {
                if let Some((len, from)) = received {
                    match decode_single(&datagram[..len]) {
                        Ok(message) => buzzer.handle(message),
                        Err(e) => debug!("Ignoring datagram from {}: {}", from, e),
                    }
                }
            }
        }
    }

    writer_task.abort();
    Ok(())
}
