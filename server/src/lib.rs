//! # Buzzer Control Server Library
//!
//! This library is the real-time core of a live quiz: it takes buzz-ins from
//! physical buzzers, drives the round state machine, and pushes the
//! authoritative game state to every admin page and display screen.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Game State
//! The [`game::Engine`] owns the round phase, the active question, the team
//! and buzzer rosters and every score. Connected pages never edit state
//! directly; they send actions and redraw from the snapshots broadcast back.
//!
//! ### Buzz Resolution
//! Buzzes are ordered by the timestamp each buzzer stamps on its message, not
//! by arrival order. Each device keeps its first buzz of the round, and each
//! team keeps its fastest member.
//!
//! ### Fan-out Without Stalls
//! Each transport has a [`hub::Hub`] whose broadcast encodes a message once
//! and enqueues it on every client without waiting. A client whose queue is
//! full is dropped so a dead screen never delays the buzzers.
//!
//! ## Architecture Design
//!
//! ### Task Layout
//! - **Listeners** accept buzzer (TCP) and page (WebSocket) connections and
//!   spawn a reader and a writer task per connection
//! - **Hub control loops** own the client sets, one per transport
//! - **Countdown** is a task per running round that steps the engine clock
//! - **Dispatcher** is a single task that turns inbound messages and engine
//!   events into engine calls and broadcasts
//!
//! ### Lock Discipline
//! The engine keeps its state behind one lock and releases it before calling
//! any observer, so observers may call straight back into the engine.
//!
//! ## Module Organization
//!
//! ### Configuration (`config`)
//! Settings built once by the binary and passed down by reference.
//!
//! ### Model (`model`)
//! Phases, teams, buzzers, questions and the snapshot shapes put on the wire.
//!
//! ### Game Module (`game`)
//! The state machine, its observer traits and the countdown.
//!
//! ### Client Manager (`client_manager`) and Hub (`hub`)
//! Per-transport client registries with bounded outbound queues, kinds,
//! last-activity tracking and client-count publication.
//!
//! ### Network Module (`network`)
//! TCP listener for buzzers using the `\0`-delimited stream framing and a
//! WebSocket listener for pages using one message per frame.
//!
//! ### Broadcast Module (`broadcast`)
//! Best-effort UDP fan-out to every local subnet's broadcast address.
//!
//! ### Dispatch Module (`dispatch`)
//! The action vocabulary mapped onto engine calls, plus the question bank.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::dispatch::{Dispatcher, EventForwarder, QuestionBank};
//! use server::game::{Engine, Observers};
//! use server::hub::Hub;
//! use server::network::{DeviceListener, WebListener};
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!
//!     // Engine notifications are queued for the dispatcher
//!     let (forwarder, events) = EventForwarder::channel();
//!     let engine = Engine::with_observers(&config.game, Observers::all(Arc::new(forwarder)));
//!
//!     let web = Hub::spawn("web", &config.web_hub);
//!     let devices = Hub::spawn("devices", &config.device_hub);
//!     let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue);
//!
//!     let buzzers = DeviceListener::bind(&config, devices.clone(), inbound_tx.clone()).await?;
//!     let pages = WebListener::bind(&config, web.clone(), inbound_tx).await?;
//!     tokio::spawn(buzzers.run());
//!     tokio::spawn(pages.run());
//!
//!     let dispatcher = Dispatcher::new(engine, web, devices, QuestionBank::new(), &config.game);
//!     dispatcher.run(inbound_rx, events).await;
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod client_manager;
pub mod config;
pub mod dispatch;
pub mod game;
pub mod hub;
pub mod model;
pub mod network;
