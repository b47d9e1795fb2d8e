//! # Trace Relay
//!
//! Forwards everything written to a context's trace hub back to the host.
//!
//! ```text
//!   context thread                        host relay pool
//!   ──────────────                        ───────────────
//!   tracing event ─► HubLayer ─► TraceHub
//!                                  │
//!                              RelaySink ──try_send──► bounded channel
//!                                                          │
//!                                                     forwarder task
//!                                                          │
//!                                           RelayReceiver::remote_write
//!                                                          │
//!                                                   host TraceHub
//! ```
//!
//! The sink never blocks the context: when the channel is full the message is
//! dropped and counted. A relay moves through `Uninitialized → Listening →
//! Disposed` and is disposed exactly once, explicitly or on drop.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::context::IsolationContext;
use crate::remote::CallError;
use crate::remote::Remote;
use crate::trace::hub::ListenerId;
use crate::trace::hub::TraceHub;
use crate::trace::hub::TraceListener;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to start trace relay for context '{context}': {source}")]
    Startup {
        context: String,
        #[source]
        source: CallError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RelayOptions {
    /// Prefix forwarded messages with their origin identity.
    pub show_origin: bool,
    /// Bound of the forwarding channel.
    pub capacity: usize,
    /// Create the endpoint but do not start listening.
    pub skip: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            show_origin: true,
            capacity: 1024,
            skip: false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RelayState {
    Uninitialized,
    Listening,
    Disposed,
}

/// Host-side end of a relay: writes forwarded messages into the host hub.
pub struct RelayReceiver {
    identity: String,
    show_origin: bool,
    hub: TraceHub,
    /// Writers hold the read side for the whole write; `close` takes the
    /// write side, so no write is in flight once it returns.
    closed: RwLock<bool>,
}

impl RelayReceiver {
    pub fn new(identity: impl Into<String>, show_origin: bool, hub: TraceHub) -> Self {
        Self {
            identity: identity.into(),
            show_origin,
            hub,
            closed: RwLock::new(false),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Writes `message` from `origin` into the host hub.
    ///
    /// With `show_origin`, messages from another identity are written as
    /// `"<origin>: <message>"`. Does nothing once the receiver is closed.
    pub fn remote_write(&self, origin: &str, message: &str) {
        let closed = self.closed.read();
        if *closed {
            return;
        }
        if self.show_origin && origin != self.identity {
            self.hub.write(&format!("{}: {}", origin, message));
        } else {
            self.hub.write(message);
        }
    }

    /// Stops further writes, waiting for any write already in progress.
    pub fn close(&self) {
        *self.closed.write() = true;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read()
    }
}

struct Forward {
    origin: Arc<str>,
    message: String,
}

#[derive(Default)]
struct RelayShared {
    tx: RwLock<Option<mpsc::Sender<Forward>>>,
    dropped: AtomicU64,
}

/// Listener installed in the context hub.
struct RelaySink {
    origin: Arc<str>,
    shared: Arc<RelayShared>,
}

impl TraceListener for RelaySink {
    fn write(&self, message: &str) {
        let tx = self.shared.tx.read();
        let Some(tx) = tx.as_ref() else {
            return;
        };
        let forward = Forward {
            origin: self.origin.clone(),
            message: message.to_string(),
        };
        if let Err(TrySendError::Full(_)) = tx.try_send(forward) {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Context-side end of a relay. Lives in the context's object table and owns
/// the sink registration in the context hub.
pub struct RelayEndpoint {
    hub: TraceHub,
    identity: String,
    listener: Option<ListenerId>,
}

impl RelayEndpoint {
    pub fn new(hub: TraceHub, identity: String) -> Self {
        Self {
            hub,
            identity,
            listener: None,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    /// Registers `sink` in the context hub. Returns false if already listening.
    pub fn start_listening(&mut self, sink: Arc<dyn TraceListener>) -> bool {
        if self.listener.is_some() {
            return false;
        }
        self.listener = Some(self.hub.add(sink));
        true
    }

    /// Removes the sink. Returns false if it was not registered.
    pub fn stop_listening(&mut self) -> bool {
        match self.listener.take() {
            Some(id) => self.hub.remove(id),
            None => false,
        }
    }
}

impl Drop for RelayEndpoint {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

/// A running relay from one context to the host.
pub struct TraceRelay {
    context: IsolationContext,
    origin: String,
    receiver: Arc<RelayReceiver>,
    endpoint: Remote<RelayEndpoint>,
    shared: Arc<RelayShared>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<RelayState>,
}

impl TraceRelay {
    /// Creates the endpoint inside `context` and starts forwarding its trace
    /// output to `receiver`, using `runtime` for the forwarding task.
    pub fn start(
        context: &IsolationContext,
        receiver: Arc<RelayReceiver>,
        runtime: &Handle,
        options: RelayOptions,
    ) -> Result<Self> {
        let startup = |source: CallError| Error::Startup {
            context: context.name().to_string(),
            source,
        };

        let endpoint = context
            .create_object(|env| RelayEndpoint::new(env.trace().clone(), env.identity()))
            .map_err(startup)?;

        let relay = Self {
            context: context.clone(),
            origin: context.identity(),
            receiver,
            endpoint,
            shared: Arc::new(RelayShared::default()),
            forwarder: Mutex::new(None),
            state: Mutex::new(RelayState::Uninitialized),
        };

        if options.skip {
            tracing::info!(context = context.name(), "Trace relay listening skipped");
            return Ok(relay);
        }

        let (tx, mut rx) = mpsc::channel::<Forward>(options.capacity.max(1));
        *relay.shared.tx.write() = Some(tx);

        let receiver = relay.receiver.clone();
        let forwarder = runtime.spawn(async move {
            while let Some(forward) = rx.recv().await {
                receiver.remote_write(&forward.origin, &forward.message);
            }
        });
        *relay.forwarder.lock() = Some(forwarder);

        let sink: Arc<dyn TraceListener> = Arc::new(RelaySink {
            origin: Arc::from(relay.origin.as_str()),
            shared: relay.shared.clone(),
        });

        // On failure `relay` is dropped here, which tears down what was started.
        relay
            .endpoint
            .call(move |endpoint| endpoint.start_listening(sink))
            .map_err(startup)?;

        *relay.state.lock() = RelayState::Listening;
        tracing::debug!(
            context = context.name(),
            origin = %relay.origin,
            receiver = relay.receiver.identity(),
            "Trace relay listening"
        );
        Ok(relay)
    }

    pub fn state(&self) -> RelayState {
        *self.state.lock()
    }

    pub fn context(&self) -> &IsolationContext {
        &self.context
    }

    /// Identity of the receiving (host) side.
    pub fn local_identity(&self) -> &str {
        self.receiver.identity()
    }

    /// Identity forwarded messages are attributed to.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Messages dropped because the forwarding channel was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Stops forwarding. Idempotent; after it returns nothing more reaches
    /// the host hub through this relay.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if *state == RelayState::Disposed {
            return;
        }
        let was_listening = *state == RelayState::Listening;
        *state = RelayState::Disposed;

        if was_listening {
            match self.endpoint.call(|endpoint| endpoint.stop_listening()) {
                Ok(_) => {}
                Err(e) if e.is_peer_gone() => {}
                Err(e) => tracing::debug!(context = self.context.name(), "Relay stop failed: {}", e),
            }
        }

        *self.shared.tx.write() = None;
        self.receiver.close();
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
        let _ = self.endpoint.clone().release();

        tracing::debug!(
            context = self.context.name(),
            dropped = self.dropped(),
            "Trace relay disposed"
        );
    }
}

impl Drop for TraceRelay {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for TraceRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceRelay")
            .field("context", &self.context.name())
            .field("origin", &self.origin)
            .field("state", &self.state())
            .finish()
    }
}
