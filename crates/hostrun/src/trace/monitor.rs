//! # Trace Monitor
//!
//! A listener that captures trace writes in memory for inspection. Test
//! harnesses register one on the host hub and wait for relayed output.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::trace::hub::TraceListener;

/// Captures every message written to it.
#[derive(Clone, Default)]
pub struct TraceMonitor {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    messages: Mutex<Vec<String>>,
    changed: Condvar,
}

impl TraceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns this monitor as a listener suitable for `TraceHub::add`.
    pub fn listener(&self) -> Arc<dyn TraceListener> {
        Arc::new(self.clone())
    }

    pub fn count(&self) -> usize {
        self.inner.messages.lock().len()
    }

    /// Returns a snapshot of the captured messages.
    pub fn messages(&self) -> Vec<String> {
        self.inner.messages.lock().clone()
    }

    pub fn clear(&self) {
        self.inner.messages.lock().clear();
        self.inner.changed.notify_all();
    }

    /// Blocks until a captured message satisfies `pred` or the timeout expires.
    pub fn wait_for<P>(&self, timeout: Duration, mut pred: P) -> Option<String>
    where
        P: FnMut(&str) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut messages = self.inner.messages.lock();
        let mut seen = 0;
        loop {
            // `clear` may have shrunk the buffer while we slept.
            seen = seen.min(messages.len());
            if let Some(found) = messages[seen..].iter().find(|m| pred(m)) {
                return Some(found.clone());
            }
            seen = messages.len();
            if self
                .inner
                .changed
                .wait_until(&mut messages, deadline)
                .timed_out()
            {
                seen = seen.min(messages.len());
                return messages[seen..].iter().find(|m| pred(m)).cloned();
            }
        }
    }

    /// Blocks until at least `count` messages were captured or the timeout expires.
    pub fn wait_for_count(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut messages = self.inner.messages.lock();
        while messages.len() < count {
            if self
                .inner
                .changed
                .wait_until(&mut messages, deadline)
                .timed_out()
            {
                return messages.len() >= count;
            }
        }
        true
    }
}

impl TraceListener for TraceMonitor {
    fn write(&self, message: &str) {
        self.inner.messages.lock().push(message.to_string());
        self.inner.changed.notify_all();
    }
}

impl std::fmt::Debug for TraceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceMonitor")
            .field("count", &self.count())
            .finish()
    }
}
