//! surreal-rpc library
//!
//! A blocking, thread-safe RPC client for SurrealDB-style servers:
//!
//! - `rpc` - the [`Client`](rpc::Client) and its transports
//! - `models` - request, response and notification wire types
//! - `config` - connection settings, from code or the environment
//!
//! # Example
//!
//! ```ignore
//! use surreal_rpc::config::ClientConfig;
//! use surreal_rpc::rpc::Client;
//! use serde_json::json;
//!
//! let client = Client::connect(ClientConfig::from_env()?)?;
//! client.send("signin", vec![json!({"user": "root", "pass": "root"})], None)?;
//! let result = client.send("query", vec![json!("SELECT * FROM article")], None)?;
//! ```

pub mod config;
pub mod models;
pub mod rpc;
