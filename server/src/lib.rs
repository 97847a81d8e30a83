//! # Tracking Stream Server Library
//!
//! This library provides the network server that exposes a live stream of
//! tracked frames (poses, images, named fields) and a remote-command
//! interface to any number of simultaneous clients over a framed binary
//! protocol. The wire format itself lives in the `shared` crate.
//!
//! ## Core Responsibilities
//!
//! ### Connection Lifecycle
//! Every accepted socket becomes a session in the client registry with a
//! process-wide unique id, a subscription set and a negotiated header
//! version. Sessions leave the registry exactly once, either because the
//! peer closed the socket or because sends to it kept failing.
//!
//! ### Request Handling
//! Each session has its own receive loop that reads framed messages and
//! dispatches them by type:
//! - Subscription updates and header version negotiation
//! - Status requests answered immediately
//! - Remote commands (legacy string form and structured form), deduplicated
//!   by their numeric uid and executed by the command processor
//! - Start/stop tracking-data requests, acknowledged immediately
//! - Named resource requests served by a [`resource::ResourceLoader`]
//!
//! Unknown or malformed messages are skipped by their declared body size;
//! they never close the connection.
//!
//! ### Streaming
//! A single broadcast loop pulls frames newer than its watermark from a
//! [`frame::FrameSource`], builds per-client messages according to each
//! subscription and writes them with a bounded retry. It also delivers
//! queued replies and sends keep-alives when there is nothing to stream.
//!
//! ## Architecture Design
//!
//! ### Independent Loops
//! The acceptor, the broadcast loop and each receive loop run as separate
//! tokio tasks. They share only the client registry and the reply queues.
//! Every loop runs under a [`control::LoopControl`] so that an owner can
//! request a stop and wait until the loop has observably exited.
//!
//! ### Adaptive Pacing
//! The broadcast loop measures how long a frame takes to stream and sizes
//! the next batch so that one tick stays within the configured processing
//! budget. If the source has already evicted frames the watermark points at,
//! the loop jumps forward instead of replaying a backlog.
//!
//! ### Lock Discipline
//! Socket IO never happens while the registry lock is held: the broadcast
//! loop copies [`session::SendTarget`]s out, sends, then writes back the
//! per-client timestamps.
//!
//! ## Module Organization
//!
//! - `server`: composition root with start/stop and query operations
//! - `acceptor`, `receiver`: connection intake and per-client dispatch
//! - `broadcast`, `packer`: streaming, pacing and per-client message building
//! - `command`: command queueing, execution and reply packaging
//! - `client_registry`, `session`, `pending`: shared client state
//! - `config`, `error`, `control`, `retry`, `frame`, `resource`: supporting
//!   types
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::command::{CommandRegistry, CommandRequest, CommandResult};
//! use server::config::ServerConfig;
//! use server::frame::FrameBuffer;
//! use server::server::Server;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source = Arc::new(FrameBuffer::new("TrackerStream", 1000));
//!
//!     let mut commands = CommandRegistry::new();
//!     commands.register("Echo", |request: &CommandRequest| {
//!         CommandResult::success(request.content.clone())
//!     });
//!
//!     let mut server = Server::new();
//!     let addr = server
//!         .start(source.clone(), commands, ServerConfig::new(18944, "TrackerStream"))
//!         .await?;
//!     println!("listening on {}", addr);
//!
//!     // Push frames into `source` from the acquisition side, then:
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

pub mod acceptor;
pub mod broadcast;
pub mod client_registry;
pub mod command;
pub mod config;
pub mod control;
pub mod error;
pub mod frame;
pub mod packer;
pub mod pending;
pub mod receiver;
pub mod resource;
pub mod retry;
pub mod server;
pub mod session;
