//! surreal-rpc - send one RPC request from the command line.
//!
//! ```text
//! surreal-rpc <url> <method> [params-json]
//! ```
//!
//! `params-json` is a JSON array of parameters, or a single JSON value used
//! as the only parameter. For `live` requests, notifications are printed
//! until `SURREAL_LIVE_SECS` (default 30) elapse, then the query is killed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use surreal_rpc::config::ClientConfig;
use surreal_rpc::models::{Notification, LIVE_METHOD};
use surreal_rpc::rpc::{Client, LiveCallback};

/// How long a `live` request keeps printing notifications by default.
const DEFAULT_LIVE_SECS: u64 = 30;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "surreal_rpc=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (url, method, raw_params) = match args.as_slice() {
        [url, method] => (url, method, None),
        [url, method, params] => (url, method, Some(params.as_str())),
        _ => bail!("usage: surreal-rpc <url> <method> [params-json]"),
    };
    let params = parse_params(raw_params)?;

    let mut config = ClientConfig::new(url.as_str());
    if let Ok(env_config) = ClientConfig::from_env() {
        config = env_config.with_endpoint(url.as_str());
    }

    tracing::info!("Starting surreal-rpc v{}", env!("CARGO_PKG_VERSION"));
    let client = Client::connect(config)?;

    let callback: Option<LiveCallback> = if method == LIVE_METHOD {
        Some(Arc::new(print_notification))
    } else {
        None
    };

    let result = client.send(method, params, callback)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to format result")?
    );
    if result.is_error() {
        client.close();
        bail!("{} failed", method);
    }

    if method == LIVE_METHOD {
        if let Some(token) = result.result.as_str() {
            std::thread::sleep(live_window()?);
            client.kill(token)?;
        }
    }

    client.close();
    Ok(())
}

fn parse_params(raw: Option<&str>) -> Result<Vec<Value>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let value: Value = serde_json::from_str(raw)
        .with_context(|| format!("params are not valid JSON: {}", raw))?;
    Ok(match value {
        Value::Array(items) => items,
        other => vec![other],
    })
}

fn live_window() -> Result<Duration> {
    match std::env::var("SURREAL_LIVE_SECS") {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Duration::from_secs)
            .with_context(|| format!("SURREAL_LIVE_SECS is not a number: {}", raw)),
        Err(_) => Ok(Duration::from_secs(DEFAULT_LIVE_SECS)),
    }
}

fn print_notification(notification: &Notification) {
    match serde_json::to_string(notification) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::warn!("Failed to format notification: {}", e),
    }
}
