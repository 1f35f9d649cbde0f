//! Listener thread: owns the transport for the lifetime of a client.
//!
//! The thread hosts a single-threaded tokio runtime. A read task decodes
//! every inbound frame and routes it, while the main loop drains the
//! outbound queue and acknowledges each write back to the blocked caller.
//! When either side ends the connection is marked disconnected, which wakes
//! every waiter.
//!
//! Every queued frame carries its caller's deadline. A frame whose deadline
//! passed while it sat in the queue is never written. A write still in
//! progress at the deadline tears the connection down, since a partly
//! written frame leaves the stream unusable.

use std::io;
use std::sync::mpsc::{Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, warn};

use super::client::ClientError;
use super::connection::Shared;
use super::redact::crop;
use super::transport::{self, Endpoint, FrameReader, FrameWriter};
use crate::models::{Frame, Notification};

/// Upper bound on the close handshake when shutting down.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a queued frame did not reach the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WriteFailure {
    /// The deadline passed while the frame was queued; nothing was written.
    Expired,
    /// The deadline passed mid-write; the connection was dropped.
    Stalled,
    /// The transport failed; the connection was dropped.
    Failed(String),
    /// The listener stopped before taking the frame off the queue.
    Closed,
}

/// Commands from the client facade to the listener.
pub(crate) enum Outbound {
    /// Write one text frame before `deadline` and report the outcome on `ack`.
    Frame {
        text: String,
        deadline: Instant,
        ack: SyncSender<Result<(), WriteFailure>>,
    },
    /// Close the transport and stop.
    Close,
}

pub(crate) struct ListenerArgs {
    pub(crate) endpoint: Endpoint,
    pub(crate) connect_timeout: Duration,
    pub(crate) shared: Arc<Shared>,
    pub(crate) pushes: Sender<Notification>,
    pub(crate) outbound: UnboundedReceiver<Outbound>,
    /// Signalled once: `Ok` after the transport opened, `Err` with the reason otherwise.
    pub(crate) ready: SyncSender<Result<(), String>>,
}

/// Spawn the listener thread.
pub(crate) fn spawn(args: ListenerArgs) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("surreal-rpc-listener".into())
        .spawn(move || run(args))
}

fn run(args: ListenerArgs) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start listener runtime: {}", e);
            args.shared.disconnect();
            let _ = args.ready.send(Err(format!("failed to start runtime: {}", e)));
            return;
        }
    };
    runtime.block_on(serve(args));
}

async fn serve(args: ListenerArgs) {
    let ListenerArgs {
        endpoint,
        connect_timeout,
        shared,
        pushes,
        mut outbound,
        ready,
    } = args;

    let (reader, mut writer) = match transport::open(&endpoint, connect_timeout).await {
        Ok(halves) => halves,
        Err(e) => {
            let reason = format!("{:#}", e);
            error!("Connection to {} gets an error {}", endpoint, reason);
            shared.disconnect();
            let _ = ready.send(Err(reason));
            return;
        }
    };

    if !shared.state.mark_connected() {
        debug!("Client closed before {} opened", endpoint);
        close_writer(&mut writer).await;
        let _ = ready.send(Err("client closed during handshake".into()));
        return;
    }
    let _ = ready.send(Ok(()));

    let dispatcher = Dispatcher::new(Arc::clone(&shared), pushes);
    let mut read_task = tokio::spawn(read_loop(reader, dispatcher));

    loop {
        tokio::select! {
            _ = &mut read_task => break,
            command = outbound.recv() => match command {
                Some(Outbound::Frame { text, deadline, ack }) => {
                    let outcome = write_frame(&mut writer, text, deadline).await;
                    let fatal = matches!(
                        outcome,
                        Err(WriteFailure::Stalled) | Err(WriteFailure::Failed(_))
                    );
                    match &outcome {
                        Ok(()) => {}
                        Err(WriteFailure::Stalled) => error!(
                            "Write to {} stalled past the caller deadline, dropping the connection",
                            endpoint
                        ),
                        Err(WriteFailure::Failed(reason)) => {
                            error!("Write to {} failed: {}", endpoint, reason)
                        }
                        Err(_) => debug!("Skipping a frame whose caller already gave up"),
                    }
                    let _ = ack.send(outcome);
                    if fatal {
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    close_writer(&mut writer).await;
                    break;
                }
            }
        }
    }

    read_task.abort();
    shared.disconnect();
    outbound.close();
    while let Ok(command) = outbound.try_recv() {
        if let Outbound::Frame { ack, .. } = command {
            let _ = ack.send(Err(WriteFailure::Closed));
        }
    }
    debug!("Close connection to {}", endpoint);
}

async fn write_frame(
    writer: &mut FrameWriter,
    text: String,
    deadline: Instant,
) -> Result<(), WriteFailure> {
    if Instant::now() >= deadline {
        return Err(WriteFailure::Expired);
    }
    let deadline = tokio::time::Instant::from_std(deadline);
    match tokio::time::timeout_at(deadline, writer.send(text)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(WriteFailure::Failed(format!("{:#}", e))),
        Err(_) => Err(WriteFailure::Stalled),
    }
}

async fn close_writer(writer: &mut FrameWriter) {
    match tokio::time::timeout(CLOSE_TIMEOUT, writer.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Closing transport: {:#}", e),
        Err(_) => debug!("Close handshake did not finish within {:?}", CLOSE_TIMEOUT),
    }
}

async fn read_loop(mut reader: FrameReader, dispatcher: Dispatcher) {
    loop {
        match reader.next_frame().await {
            Ok(Some(text)) => {
                dispatcher.dispatch(&text);
            }
            Ok(None) => {
                debug!("Server closed the connection");
                break;
            }
            Err(e) => {
                error!("Connection gets an error {:#}", e);
                break;
            }
        }
    }
    dispatcher.shared.disconnect();
}

/// Where a decoded frame went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatched {
    Response,
    Push,
    Dropped,
}

/// Routes decoded frames: responses to the correlation store, pushes to the
/// notifier queue.
pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    pushes: Sender<Notification>,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<Shared>, pushes: Sender<Notification>) -> Self {
        Self { shared, pushes }
    }

    /// Decode and route one text frame. Never fails: bad frames are logged
    /// and dropped.
    pub(crate) fn dispatch(&self, text: &str) -> Dispatched {
        debug!("Get message {}", crop(text));
        match Frame::decode(text) {
            Ok(Frame::Response(response)) => {
                self.shared.store.publish(response);
                Dispatched::Response
            }
            Ok(Frame::Push(notification)) => {
                let token = notification.id.clone();
                if self.pushes.send(notification).is_err() {
                    warn!("Notifier stopped, dropping notification for {}", token);
                    return Dispatched::Dropped;
                }
                Dispatched::Push
            }
            Err(e) => {
                let err = ClientError::from(e);
                warn!("{}; dropping {}", err, crop(text));
                Dispatched::Dropped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LiveAction;
    use serde_json::json;
    use std::sync::mpsc;

    fn dispatcher() -> (Dispatcher, Arc<Shared>, mpsc::Receiver<Notification>) {
        let shared = Arc::new(Shared::new());
        let (tx, rx) = mpsc::channel();
        (Dispatcher::new(Arc::clone(&shared), tx), shared, rx)
    }

    #[test]
    fn test_response_is_published() {
        let (dispatcher, shared, _rx) = dispatcher();
        shared.store.reserve("abc").unwrap();

        assert_eq!(
            dispatcher.dispatch(r#"{"id":"abc","result":"ok"}"#),
            Dispatched::Response
        );
        let response = shared
            .store
            .await_and_take("abc", Duration::from_millis(10))
            .unwrap();
        assert_eq!(response.outcome, Ok(json!("ok")));
    }

    #[test]
    fn test_push_is_queued_for_notifier() {
        let (dispatcher, _shared, rx) = dispatcher();

        assert_eq!(
            dispatcher.dispatch(r#"{"result":{"id":"tok-1","action":"DELETE","result":{}}}"#),
            Dispatched::Push
        );
        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.id, "tok-1");
        assert_eq!(notification.action, LiveAction::Delete);
    }

    #[test]
    fn test_malformed_frames_are_dropped() {
        let (dispatcher, shared, rx) = dispatcher();

        for text in ["garbage", "[]", r#"{"result":1}"#, r#"{"id":"x","error":7}"#] {
            assert_eq!(dispatcher.dispatch(text), Dispatched::Dropped, "{}", text);
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(shared.store.len(), 0);
    }

    #[test]
    fn test_push_after_notifier_stopped_is_dropped() {
        let (dispatcher, _shared, rx) = dispatcher();
        drop(rx);
        assert_eq!(
            dispatcher.dispatch(r#"{"result":{"id":"tok-1","action":"CREATE"}}"#),
            Dispatched::Dropped
        );
    }

    #[test]
    fn test_connect_failure_is_reported_on_ready() {
        let dir = tempfile::tempdir().unwrap();
        let shared = Arc::new(Shared::new());
        let (pushes, _rx) = mpsc::channel();
        let (_outbound_tx, outbound) = tokio::sync::mpsc::unbounded_channel();
        let (ready, ready_rx) = mpsc::sync_channel(1);

        let handle = spawn(ListenerArgs {
            endpoint: Endpoint::Unix(dir.path().join("missing.sock")),
            connect_timeout: Duration::from_secs(1),
            shared: Arc::clone(&shared),
            pushes,
            outbound,
            ready,
        })
        .unwrap();

        let outcome = ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(outcome.is_err());
        handle.join().unwrap();
        assert_eq!(
            shared.state.get(),
            crate::rpc::ConnectionState::Disconnected
        );
    }
}
