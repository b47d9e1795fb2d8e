//! # Unhandled Faults
//!
//! Panics that happen inside an isolated context with nobody waiting for the
//! result (fire-and-forget posts, supervised background tasks, object drops
//! during teardown) are raised as [`Fault`]s on the context's [`FaultHooks`].
//! They never unwind into the host.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Dispatch;

use crate::context::IsolationContext;

/// An unobserved panic inside an isolated context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fault {
    pub context: String,
    pub message: String,
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fault in context '{}': {}", self.context, self.message)
    }
}

pub type FaultHandler = Arc<dyn Fn(&Fault) + Send + Sync>;

/// Per-context fault event. Handlers are keyed by owner so that subscribing
/// twice under the same owner replaces the earlier handler.
#[derive(Clone, Default)]
pub struct FaultHooks {
    handlers: Arc<RwLock<Vec<(&'static str, FaultHandler)>>>,
}

impl FaultHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, owner: &'static str, handler: FaultHandler) {
        let mut handlers = self.handlers.write();
        handlers.retain(|(existing, _)| *existing != owner);
        handlers.push((owner, handler));
    }

    /// Removes the handler registered by `owner`. Returns false if none was.
    pub fn unsubscribe(&self, owner: &'static str) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != owner);
        handlers.len() != before
    }

    pub fn is_subscribed(&self, owner: &'static str) -> bool {
        self.handlers.read().iter().any(|(existing, _)| *existing == owner)
    }

    /// Notifies every handler and returns how many were called.
    pub fn raise(&self, fault: &Fault) -> usize {
        let snapshot: Vec<FaultHandler> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        if snapshot.is_empty() {
            tracing::debug!(context = %fault.context, "No fault handler subscribed: {}", fault.message);
        }

        for handler in &snapshot {
            handler(fault);
        }
        snapshot.len()
    }
}

impl std::fmt::Debug for FaultHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let owners: Vec<&'static str> = self.handlers.read().iter().map(|(o, _)| *o).collect();
        f.debug_struct("FaultHooks").field("owners", &owners).finish()
    }
}

/// Logs faults raised inside hosted contexts.
///
/// Faults are raised on the context thread, whose `tracing` dispatcher feeds
/// the context's own trace hub. `attach` captures the dispatcher current on
/// the attaching thread and the handler logs through it, so warnings land in
/// the host log even if that subscriber was installed after the host.
#[derive(Clone, Debug, Default)]
pub struct UnhandledFailureReporter;

impl UnhandledFailureReporter {
    pub const OWNER: &'static str = "unhandled-failure-reporter";

    pub fn new() -> Self {
        Self
    }

    /// Hooks the reporter into the context's fault event.
    pub fn attach(&self, context: &IsolationContext) {
        let dispatch: Dispatch = tracing::dispatcher::get_default(|current| current.clone());
        context.faults().subscribe(
            Self::OWNER,
            Arc::new(move |fault: &Fault| {
                tracing::dispatcher::with_default(&dispatch, || {
                    tracing::warn!(context = %fault.context, "Unobserved fault: {}", fault.message);
                });
            }),
        );
    }

    /// Unhooks the reporter. Returns false if it was not attached.
    pub fn detach(&self, context: &IsolationContext) -> bool {
        context.faults().unsubscribe(Self::OWNER)
    }
}
