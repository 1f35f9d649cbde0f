//! Blocking RPC client over a duplex socket.
//!
//! Many caller threads share one connection. Each request carries a fresh
//! id; the listener thread matches responses back to the waiting caller and
//! routes live-query notifications to registered callbacks.
//!
//! # Architecture
//!
//! ```text
//!  caller threads                listener thread               server
//! ┌──────────────┐  outbound   ┌───────────────────┐  frames  ┌────────┐
//! │ Client::send │ ──────────► │ write loop        │ ───────► │        │
//! │   (blocks)   │             │                   │          │        │
//! │              │ ◄────────── │ read task         │ ◄─────── │        │
//! └──────────────┘ correlation └─────────┬─────────┘          └────────┘
//!                     store              │ pushes
//!                                        ▼
//!                                 notifier thread ──► live callbacks
//! ```
//!
//! # Transports
//!
//! - `ws://` / `wss://` (and `http://` / `https://`, rewritten): WebSocket
//!   text frames
//! - `unix:///path/to.sock`: Unix domain socket with Content-Length framing
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use surreal_rpc::config::ClientConfig;
//! use surreal_rpc::rpc::Client;
//!
//! let client = Client::connect(ClientConfig::new("ws://localhost:8000"))?;
//! let live = client.live("article", false, Arc::new(|n| println!("{:?}", n)))?;
//! ```

mod client;
mod connection;
mod correlation;
mod framing;
mod listener;
mod redact;
mod registry;
mod transport;

pub use client::{Client, ClientError};
pub use connection::ConnectionState;
pub use framing::{read_message, write_message};
pub use registry::LiveCallback;
pub use transport::Endpoint;
