//! Live-query subscriptions: token -> callback.
//!
//! Push frames are not delivered on the listener thread. The listener hands
//! them to a [`Notifier`], a dedicated thread draining a FIFO queue, so a slow
//! callback never stalls correlation of unrelated requests while notifications
//! for one token still arrive in receipt order.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::connection::join_or_detach;
use crate::models::Notification;

/// Callback invoked for every notification of a live query.
pub type LiveCallback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Thread-safe map from subscription token to callback.
///
/// Once closed it stays empty: later registrations are refused.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    callbacks: HashMap<String, LiveCallback>,
    closed: bool,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Associate `callback` with `token`, replacing any earlier entry.
    ///
    /// Returns `false` without registering once the registry is closed.
    pub(crate) fn register(&self, token: &str, callback: LiveCallback) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        debug!("Set callback for {}", token);
        inner.callbacks.insert(token.to_string(), callback);
        true
    }

    /// Remove the entry for `token`; unknown tokens are a no-op.
    pub(crate) fn unregister(&self, token: &str) {
        if self.inner.lock().callbacks.remove(token).is_some() {
            debug!("Delete callback for {}", token);
        }
    }

    /// Invoke the callback registered for `token`.
    ///
    /// Returns `false` (after logging a warning) when no callback is
    /// registered; the notification is dropped. A panicking callback is
    /// logged and contained.
    pub(crate) fn dispatch(&self, token: &str, notification: &Notification) -> bool {
        // Never hold the lock while user code runs.
        let callback = self.inner.lock().callbacks.get(token).cloned();
        let Some(callback) = callback else {
            warn!(
                "Got notification for {}, but no callback to work with (action {})",
                token,
                notification.action.as_str()
            );
            return false;
        };

        debug!("Use callback for {}", token);
        if panic::catch_unwind(AssertUnwindSafe(|| callback(notification))).is_err() {
            error!("Live query callback for {} panicked", token);
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, token: &str) -> bool {
        self.inner.lock().callbacks.contains_key(token)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    /// Drop every callback and refuse new ones.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.callbacks.clear();
    }
}

/// Background thread delivering notifications to registry callbacks.
///
/// The thread exits once every queue sender has been dropped.
pub(crate) struct Notifier {
    handle: Option<JoinHandle<()>>,
}

impl Notifier {
    /// Spawn the notifier thread, returning it with the queue sender.
    pub(crate) fn spawn(
        registry: Arc<SubscriptionRegistry>,
    ) -> std::io::Result<(Self, Sender<Notification>)> {
        let (tx, rx) = mpsc::channel::<Notification>();
        let handle = thread::Builder::new()
            .name("surreal-rpc-notifier".into())
            .spawn(move || {
                for notification in rx {
                    registry.dispatch(&notification.id, &notification);
                }
                debug!("Notification queue closed");
            })?;

        Ok((
            Self {
                handle: Some(handle),
            },
            tx,
        ))
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            join_or_detach(handle, "Notifier");
        }
    }
}
