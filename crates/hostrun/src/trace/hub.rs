//! # Trace Hub
//!
//! Listener collection for one execution environment. Writes fan out to every
//! registered listener; listeners are called outside the lock, so a listener
//! may add or remove listeners without deadlocking.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::RwLock;

/// Receiver of trace writes.
pub trait TraceListener: Send + Sync + 'static {
    fn write(&self, message: &str);
}

impl<F> TraceListener for F
where
    F: Fn(&str) + Send + Sync + 'static,
{
    fn write(&self, message: &str) {
        self(message)
    }
}

/// Strong type for listener registrations.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct ListenerId(pub u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

type Listeners = Vec<(ListenerId, Arc<dyn TraceListener>)>;

/// Shared trace sink. Cloning yields another handle to the same listener list.
#[derive(Clone, Default)]
pub struct TraceHub {
    listeners: Arc<RwLock<Listeners>>,
    next_id: Arc<AtomicU64>,
}

impl TraceHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener and returns the id needed to remove it.
    pub fn add(&self, listener: Arc<dyn TraceListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.listeners.write().push((id, listener));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Delivers a message to every listener registered at the time of the call.
    pub fn write(&self, message: &str) {
        let snapshot: Vec<Arc<dyn TraceListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in snapshot {
            listener.write(message);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }
}

impl std::fmt::Debug for TraceHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceHub")
            .field("listeners", &self.len())
            .finish()
    }
}
