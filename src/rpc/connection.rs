//! Connection lifecycle state shared between the facade and the listener.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use super::correlation::CorrelationStore;
use super::registry::SubscriptionRegistry;

/// Lifecycle of one client connection.
///
/// `Connecting -> Connected -> Disconnected`. `Disconnected` is terminal:
/// a new client must be built to reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Disconnected => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

/// Atomic cell holding a [`ConnectionState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Connecting.as_u8()))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Connecting -> Connected. Fails if the connection was already torn down.
    pub(crate) fn mark_connected(&self) -> bool {
        self.0
            .compare_exchange(
                ConnectionState::Connecting.as_u8(),
                ConnectionState::Connected.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Move to Disconnected, returning the previous state.
    pub(crate) fn mark_disconnected(&self) -> ConnectionState {
        ConnectionState::from_u8(
            self.0
                .swap(ConnectionState::Disconnected.as_u8(), Ordering::SeqCst),
        )
    }
}

/// State shared by the client facade, the listener thread and the notifier.
pub(crate) struct Shared {
    pub(crate) state: StateCell,
    pub(crate) store: CorrelationStore,
    pub(crate) registry: Arc<SubscriptionRegistry>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            state: StateCell::new(),
            store: CorrelationStore::new(),
            registry: Arc::new(SubscriptionRegistry::new()),
        }
    }

    /// Flip to Disconnected and wake every blocked waiter.
    pub(crate) fn disconnect(&self) -> ConnectionState {
        let previous = self.state.mark_disconnected();
        self.store.disconnect();
        previous
    }
}

/// Join a background thread, detaching it if it does not finish quickly.
///
/// Never blocks the caller for more than ~100ms, and never joins the
/// calling thread itself (a callback may close the client).
pub(crate) fn join_or_detach(handle: JoinHandle<()>, name: &str) {
    const QUICK_CHECK_INTERVAL: Duration = Duration::from_millis(10);
    const MAX_QUICK_CHECKS: u32 = 10;

    if handle.thread().id() == thread::current().id() {
        debug!("{} closing from its own thread - detaching", name);
        return;
    }

    for _ in 0..MAX_QUICK_CHECKS {
        if handle.is_finished() {
            if let Err(e) = handle.join() {
                warn!("{} thread panicked during shutdown: {:?}", name, e);
            } else {
                debug!("{} thread shut down gracefully", name);
            }
            return;
        }
        thread::sleep(QUICK_CHECK_INTERVAL);
    }

    debug!(
        "{} still running after {}ms - detaching",
        name,
        QUICK_CHECK_INTERVAL.as_millis() * MAX_QUICK_CHECKS as u128
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_starts_connecting() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), ConnectionState::Connecting);
    }

    #[test]
    fn test_connecting_to_connected_to_disconnected() {
        let cell = StateCell::new();
        assert!(cell.mark_connected());
        assert_eq!(cell.get(), ConnectionState::Connected);

        assert_eq!(cell.mark_disconnected(), ConnectionState::Connected);
        assert_eq!(cell.get(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_disconnected_is_terminal() {
        let cell = StateCell::new();
        assert_eq!(cell.mark_disconnected(), ConnectionState::Connecting);
        assert!(!cell.mark_connected());
        assert_eq!(cell.get(), ConnectionState::Disconnected);
        assert_eq!(cell.mark_disconnected(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_shared_disconnect_closes_store() {
        let shared = Shared::new();
        assert!(shared.state.mark_connected());
        assert!(shared.store.reserve("a").is_ok());

        assert_eq!(shared.disconnect(), ConnectionState::Connected);
        assert!(shared.store.reserve("b").is_err());
    }

    #[test]
    fn test_join_or_detach_joins_finished_thread() {
        let handle = thread::spawn(|| {});
        // Returns promptly either way; the point is it must not hang.
        join_or_detach(handle, "test");
    }

    #[test]
    fn test_join_or_detach_detaches_slow_thread() {
        let handle = thread::spawn(|| thread::sleep(Duration::from_secs(2)));
        let started = std::time::Instant::now();
        join_or_detach(handle, "slow");
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
