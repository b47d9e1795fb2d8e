//! # Cross-Boundary References
//!
//! [`Remote<T>`] is the host-side stub for an object that lives inside an
//! isolated context. Calls ship a closure to the context thread, run it
//! against the object there and block for the reply. The stub is `Send` and
//! `Sync` whatever `T` is, because `T` itself never leaves the context.

use std::marker::PhantomData;

use crate::context::ContextState;
use crate::context::IsolationContext;

/// Strong type for objects in a context's object table.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "object-{}", self.0)
    }
}

/// Failure of a cross-boundary call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// The context was unloaded before the call completed.
    #[error("Context '{context}' is gone")]
    PeerGone { context: String },
    /// The call panicked inside the context.
    #[error("Call into context '{context}' faulted: {message}")]
    Faulted { context: String, message: String },
    /// The object was released or has a different type.
    #[error("{object} not found in context '{context}'")]
    ObjectMissing { context: String, object: ObjectId },
    /// A blocking call from a context into itself.
    #[error("Re-entrant call into context '{context}' from its own thread")]
    Reentrant { context: String },
}

impl CallError {
    pub fn is_peer_gone(&self) -> bool {
        matches!(self, Self::PeerGone { .. })
    }
}

pub type Result<T> = std::result::Result<T, CallError>;

/// Typed reference to an object living inside an isolated context.
pub struct Remote<T: 'static> {
    context: IsolationContext,
    object: ObjectId,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> Remote<T> {
    pub(crate) fn new(context: IsolationContext, object: ObjectId) -> Self {
        Self {
            context,
            object,
            _marker: PhantomData,
        }
    }

    pub fn context(&self) -> &IsolationContext {
        &self.context
    }

    pub fn object_id(&self) -> ObjectId {
        self.object
    }

    /// Calls `f` with the object on the context thread and returns its result.
    pub fn call<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut T) -> R + Send + 'static,
        R: Send + 'static,
    {
        let object = self.object;
        let context = self.context.name().to_string();
        self.context
            .invoke(move |state: &mut ContextState| match state.object_mut::<T>(object) {
                Some(target) => Ok(f(target)),
                None => Err(CallError::ObjectMissing { context, object }),
            })?
    }

    /// Queues `f` against the object without waiting.
    ///
    /// Panics inside `f` surface as faults on the context, not to the caller.
    pub fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        let object = self.object;
        self.context.post(move |state: &mut ContextState| {
            if let Some(target) = state.object_mut::<T>(object) {
                f(target);
            }
        })
    }

    /// Drops the object inside the context. Other stubs for it start failing
    /// with `ObjectMissing`.
    pub fn release(self) -> Result<bool> {
        let object = self.object;
        self.context.invoke(move |state| state.remove(object))
    }

    /// Returns false once the object or its context is gone.
    pub fn is_alive(&self) -> bool {
        let object = self.object;
        self.context
            .invoke(move |state| state.contains(object))
            .unwrap_or(false)
    }
}

impl<T: 'static> Clone for Remote<T> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            object: self.object,
            _marker: PhantomData,
        }
    }
}

impl<T: 'static> std::fmt::Debug for Remote<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("type", &std::any::type_name::<T>())
            .field("context", &self.context.name())
            .field("object", &self.object)
            .finish()
    }
}
