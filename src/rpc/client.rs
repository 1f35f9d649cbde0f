//! Blocking RPC client with id correlation and live-query callbacks.
//!
//! [`Client`] owns a listener thread that performs every socket read and
//! write. Callers on any number of threads block in [`Client::send`] until
//! the response carrying their request id arrives, the per-call timeout
//! elapses, or the connection dies.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use super::connection::{join_or_detach, ConnectionState, Shared};
use super::listener::{self, ListenerArgs, Outbound, WriteFailure};
use super::redact;
use super::registry::{LiveCallback, Notifier};
use super::transport::Endpoint;
use crate::config::ClientConfig;
use crate::models::{FrameError, Request, RpcResult, KILL_METHOD, LIVE_METHOD};

/// Client-side failures.
///
/// Remote RPC errors are not in here: they come back inside [`RpcResult`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The transport could not be opened, or did not open in time.
    #[error("Not connected to {url}: {reason}")]
    ConnectionEstablishment { url: String, reason: String },

    /// An inbound frame could not be decoded. Logged by the listener, never
    /// returned from `send`.
    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),

    /// No response arrived for the request within the call timeout.
    #[error("No response for request {id} within {timeout:?}")]
    ResponseTimeout { id: String, timeout: Duration },

    /// The connection is (or became) disconnected.
    #[error("Connection closed while client waits on it")]
    ConnectionClosed,

    /// The request could not be written to the transport.
    #[error("Transport write failed: {0}")]
    TransportWrite(String),

    /// The request could not be serialized.
    #[error("Failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    /// Invalid client configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Failed to start a background thread.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// Blocking, thread-safe RPC client over one duplex connection.
///
/// # Example
///
/// ```ignore
/// use surreal_rpc::config::ClientConfig;
/// use surreal_rpc::rpc::Client;
/// use serde_json::json;
///
/// let client = Client::connect(ClientConfig::new("ws://localhost:8000"))?;
/// client.send("use", vec![json!("test"), json!("test")], None)?;
/// let rows = client.send("select", vec![json!("article")], None)?;
/// ```
pub struct Client {
    endpoint: Endpoint,
    shared: Arc<Shared>,
    outbound: UnboundedSender<Outbound>,
    timeout: Duration,
    listener: Mutex<Option<JoinHandle<()>>>,
    notifier: Mutex<Option<Notifier>>,
}

impl Client {
    /// Open a connection, blocking until it is established.
    ///
    /// # Errors
    ///
    /// - `ClientError::Config` if the endpoint cannot be parsed
    /// - `ClientError::ConnectionEstablishment` if the transport refuses the
    ///   connection or is not connected within `config.connect_timeout`
    pub fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let endpoint = Endpoint::parse(&config.endpoint)?;
        let shared = Arc::new(Shared::new());

        let (notifier, pushes) =
            Notifier::spawn(Arc::clone(&shared.registry)).map_err(ClientError::Io)?;
        let (outbound_tx, outbound_rx) = tokio::sync::mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let handle = listener::spawn(ListenerArgs {
            endpoint: endpoint.clone(),
            connect_timeout: config.connect_timeout,
            shared: Arc::clone(&shared),
            pushes,
            outbound: outbound_rx,
            ready: ready_tx,
        })
        .map_err(ClientError::Io)?;

        let client = Self {
            endpoint,
            shared,
            outbound: outbound_tx,
            timeout: config.timeout,
            listener: Mutex::new(Some(handle)),
            notifier: Mutex::new(Some(notifier)),
        };

        let reason = match ready_rx.recv_timeout(config.connect_timeout) {
            Ok(Ok(())) if client.is_connected() => {
                info!(
                    "Connected to {}, timeout is {:?}",
                    client.endpoint, client.timeout
                );
                return Ok(client);
            }
            Ok(Ok(())) => "connection closed during handshake".to_string(),
            Ok(Err(reason)) => reason,
            Err(RecvTimeoutError::Timeout) => {
                format!("not connected within {:?}", config.connect_timeout)
            }
            Err(RecvTimeoutError::Disconnected) => "listener exited".to_string(),
        };

        let url = client.endpoint.to_string();
        warn!("Not connected to {}: {}", url, reason);
        client.close();
        Err(ClientError::ConnectionEstablishment { url, reason })
    }

    /// Send a request and block for its response using the default timeout.
    ///
    /// `callback` is only consulted for `live` requests: on success it is
    /// registered under the returned subscription token.
    pub fn send(
        &self,
        method: &str,
        params: Vec<Value>,
        callback: Option<LiveCallback>,
    ) -> Result<RpcResult, ClientError> {
        self.send_with_timeout(method, params, callback, self.timeout)
    }

    /// Send a request and block for its response, waiting at most `timeout`.
    ///
    /// `timeout` covers both queueing the write and waiting for the response.
    ///
    /// # Errors
    ///
    /// - `ClientError::ConnectionClosed` if the client is disconnected before
    ///   or while waiting
    /// - `ClientError::TransportWrite` if the request cannot be written
    /// - `ClientError::ResponseTimeout` if no response arrives in time
    pub fn send_with_timeout(
        &self,
        method: &str,
        params: Vec<Value>,
        callback: Option<LiveCallback>,
        timeout: Duration,
    ) -> Result<RpcResult, ClientError> {
        match self.shared.state.get() {
            ConnectionState::Connected => {}
            ConnectionState::Disconnected => return Err(ClientError::ConnectionClosed),
            ConnectionState::Connecting => {
                return Err(ClientError::TransportWrite(format!(
                    "not connected to {}",
                    self.endpoint
                )))
            }
        }

        let deadline = Instant::now() + timeout;
        let request = Request::new(method, params);
        let text = serde_json::to_string(&request).map_err(ClientError::Encode)?;
        debug!("Send data: {}", redact::crop(&redact::mask_credentials(&request)));

        self.shared.store.reserve(&request.id)?;
        if let Err(e) = self.transmit(&request.id, text, deadline, timeout) {
            self.shared.store.discard(&request.id);
            return Err(e);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let response = self
            .shared
            .store
            .await_and_take(&request.id, remaining)
            .map_err(|e| match e {
                ClientError::ResponseTimeout { id, .. } => {
                    ClientError::ResponseTimeout { id, timeout }
                }
                other => other,
            })?;
        if response.is_ok() {
            self.track_subscription(&request, &response.outcome, callback);
        }
        Ok(response.into())
    }

    /// Open a live query on `table`, delivering each notification to `callback`.
    ///
    /// With `diff` set, notifications carry JSON-patch lists instead of
    /// full records. The subscription token is the result of a successful call.
    pub fn live(
        &self,
        table: &str,
        diff: bool,
        callback: LiveCallback,
    ) -> Result<RpcResult, ClientError> {
        self.send(LIVE_METHOD, vec![json!(table), json!(diff)], Some(callback))
    }

    /// Kill the live query identified by `token`.
    pub fn kill(&self, token: &str) -> Result<RpcResult, ClientError> {
        self.send(KILL_METHOD, vec![json!(token)], None)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Number of live-query callbacks currently registered.
    pub fn subscriptions(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn url(&self) -> String {
        self.endpoint.to_string()
    }

    /// Disconnect, close the transport and drop all pending state.
    ///
    /// Every blocked caller fails with `ClientError::ConnectionClosed`.
    /// Safe to call repeatedly, and from inside a live-query callback.
    pub fn close(&self) {
        let previous = self.shared.disconnect();
        self.shared.registry.close();
        // The listener may already be gone; nothing to close then.
        let _ = self.outbound.send(Outbound::Close);

        if let Some(handle) = self.listener.lock().take() {
            join_or_detach(handle, "Listener");
        }
        // Dropping the notifier joins its thread once the listener released
        // the queue sender.
        drop(self.notifier.lock().take());

        if previous != ConnectionState::Disconnected {
            debug!("Client is closed connection to {}", self.endpoint);
        }
    }

    /// Hand `text` to the listener and wait until it is on the wire.
    fn transmit(
        &self,
        id: &str,
        text: String,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let timed_out = || ClientError::ResponseTimeout {
            id: id.to_string(),
            timeout,
        };
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        let frame = Outbound::Frame {
            text,
            deadline,
            ack: ack_tx,
        };
        if self.outbound.send(frame).is_err() {
            return Err(self.write_failure("listener is gone"));
        }

        match ack_rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(WriteFailure::Expired | WriteFailure::Stalled)) => Err(timed_out()),
            Ok(Err(WriteFailure::Failed(reason))) => Err(ClientError::TransportWrite(reason)),
            Ok(Err(WriteFailure::Closed)) => Err(ClientError::ConnectionClosed),
            // The listener skips the frame once the deadline passes.
            Err(RecvTimeoutError::Timeout) => Err(timed_out()),
            Err(RecvTimeoutError::Disconnected) => {
                Err(self.write_failure("write dropped by listener"))
            }
        }
    }

    fn write_failure(&self, reason: &str) -> ClientError {
        if self.shared.state.get() == ConnectionState::Disconnected {
            ClientError::ConnectionClosed
        } else {
            ClientError::TransportWrite(reason.to_string())
        }
    }

    fn track_subscription(
        &self,
        request: &Request,
        outcome: &Result<Value, crate::models::RpcError>,
        callback: Option<LiveCallback>,
    ) {
        if request.is_live() {
            let token = outcome.as_ref().ok().and_then(Value::as_str);
            match (token, callback) {
                (Some(token), Some(callback)) => {
                    if !self.shared.registry.register(token, callback) {
                        debug!("Client closed, not registering live query {}", token);
                    }
                }
                (Some(token), None) => debug!("Live query {} opened without a callback", token),
                (None, _) => warn!("Live query result is not a token: {:?}", outcome),
            }
        } else if request.is_kill() {
            if let Some(token) = request.kill_token() {
                self.shared.registry.unregister(token);
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}
