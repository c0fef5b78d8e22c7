//! # Buzzer Wire Protocol
//!
//! Types and codecs shared by the quiz server, its integration tests and the
//! buzzer simulator. Every message on every transport is the same JSON
//! envelope; only the framing differs between transports.
//!
//! ## Envelope
//!
//! A [`Message`] carries a required `ACTION` tag and optional `ID`, `VERSION`,
//! `MSG`, `FSINFO`, `TIME_EVENT` and `seq` fields. The `MSG` payload is kept as
//! raw JSON and only decoded into a typed shape (see [`payload`]) by whoever
//! dispatches the action.
//!
//! ## Framing
//!
//! - Stream transports (buzzer TCP sockets) terminate each message with
//!   `\n` followed by a `0x00` byte. [`FrameParser`] reassembles messages from
//!   arbitrary read chunks.
//! - Frame transports (WebSocket) carry exactly one JSON message per frame
//!   with no terminator, decoded by [`decode_single`].
//!
//! ```rust
//! use shared::{Action, FrameParser, Message};
//!
//! let bytes = Message::empty(Action::Ping).encode_stream().unwrap();
//! let mut parser = FrameParser::new();
//! parser.append(&bytes[..5]);
//! assert!(parser.parse().is_empty());
//! parser.append(&bytes[5..]);
//! assert_eq!(parser.parse()[0].action, Action::Ping);
//! ```

pub mod action;
pub mod error;
pub mod framing;
pub mod message;
pub mod payload;

pub use action::Action;
pub use error::{ProtocolError, Result};
pub use framing::{decode_single, FrameParser, FRAME_DELIMITER, MAX_BUFFER_SIZE, RETAINED_TAIL};
pub use message::{now_micros, FsInfo, Message};

/// Default TCP port buzzers connect to.
pub const DEVICE_TCP_PORT: u16 = 1234;
/// Default UDP port buzzers listen on for broadcasts.
pub const DEVICE_UDP_PORT: u16 = 1234;
