//! Subscription hub for session data and exit notifications.
//!
//! Transport code registers callbacks here instead of attaching to
//! individual sessions. Callbacks are invoked in registration order and
//! receive the originating session id with each payload.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use super::pty::ExitStatus;

/// Callback receiving a batch of session output.
pub type DataCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Callback receiving a session exit notification.
pub type ExitCallback = Arc<dyn Fn(&str, &ExitStatus) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Data,
    Exit,
}

#[derive(Default)]
struct HubInner {
    next_id: AtomicU64,
    data: RwLock<Vec<(u64, DataCallback)>>,
    exit: RwLock<Vec<(u64, ExitCallback)>>,
}

/// Registry of data and exit subscribers shared by all sessions.
#[derive(Clone, Default)]
pub struct SubscriptionHub {
    inner: Arc<HubInner>,
}

/// Handle returned by [`SubscriptionHub::on_data`] and
/// [`SubscriptionHub::on_exit`].
///
/// Dropping the handle keeps the callback registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
#[must_use = "dropping a Subscription leaves the callback registered; call unsubscribe to remove it"]
pub struct Subscription {
    hub: Weak<HubInner>,
    channel: Channel,
    id: u64,
}

impl Subscription {
    /// Removes the callback. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(hub) = self.hub.upgrade() else {
            return false;
        };
        let removed = match self.channel {
            Channel::Data => remove(&hub.data, self.id),
            Channel::Exit => remove(&hub.exit, self.id),
        };
        tracing::debug!(subscription = self.id, channel = ?self.channel, removed, "Unsubscribed");
        removed
    }
}

fn remove<T>(list: &RwLock<Vec<(u64, T)>>, id: u64) -> bool {
    let mut list = list.write().unwrap_or_else(PoisonError::into_inner);
    let before = list.len();
    list.retain(|(entry, _)| *entry != id);
    list.len() != before
}

fn snapshot<T: Clone>(list: &RwLock<Vec<(u64, T)>>) -> Vec<T> {
    list.read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(_, cb)| cb.clone())
        .collect()
}

impl SubscriptionHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for output batches.
    pub fn on_data<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        self.handle(Channel::Data, id)
    }

    /// Registers a callback for session exits.
    pub fn on_exit<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&str, &ExitStatus) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .exit
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        self.handle(Channel::Exit, id)
    }

    fn handle(&self, channel: Channel, id: u64) -> Subscription {
        tracing::debug!(subscription = id, channel = ?channel, "Subscribed");
        Subscription {
            hub: Arc::downgrade(&self.inner),
            channel,
            id,
        }
    }

    /// Delivers an output batch to every data subscriber.
    ///
    /// The subscriber list is snapshotted first, so callbacks may subscribe
    /// or unsubscribe without deadlocking.
    pub fn emit_data(&self, session_id: &str, data: &[u8]) {
        for callback in snapshot(&self.inner.data) {
            callback(session_id, data);
        }
    }

    /// Delivers an exit notification to every exit subscriber.
    pub fn emit_exit(&self, session_id: &str, status: &ExitStatus) {
        for callback in snapshot(&self.inner.exit) {
            callback(session_id, status);
        }
    }

    /// Number of registered data callbacks.
    pub fn data_subscriber_count(&self) -> usize {
        self.inner
            .data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of registered exit callbacks.
    pub fn exit_subscriber_count(&self) -> usize {
        self.inner
            .exit
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
