//! Client configuration.

use std::time::Duration;

use crate::rpc::ClientError;

/// Default per-call response timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Default connection establishment timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Settings for [`Client::connect`](crate::rpc::Client::connect).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server URL: `ws://`, `wss://`, `http://`, `https://` or `unix://`.
    pub endpoint: String,
    /// Default time `send` waits for a response.
    pub timeout: Duration,
    /// Time `connect` waits for the transport to open.
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Build a config from `SURREAL_URL`, `SURREAL_TIMEOUT_SECS` and
    /// `SURREAL_CONNECT_TIMEOUT_SECS`.
    ///
    /// # Errors
    ///
    /// `ClientError::Config` if `SURREAL_URL` is unset or a timeout is not a
    /// whole number of seconds.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ClientError> {
        let endpoint = lookup("SURREAL_URL")
            .ok_or_else(|| ClientError::Config("SURREAL_URL is not set".into()))?;
        let mut config = Self::new(endpoint);

        if let Some(secs) = seconds(&lookup, "SURREAL_TIMEOUT_SECS")? {
            config.timeout = secs;
        }
        if let Some(secs) = seconds(&lookup, "SURREAL_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout = secs;
        }
        Ok(config)
    }
}

fn seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<Duration>, ClientError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|e| ClientError::Config(format!("{}={:?}: {}", key, raw, e))),
    }
}
