//! # Trace
//!
//! Diagnostic output plumbing. Every execution environment (the host and each
//! isolated context) owns a [`TraceHub`]: a list of listeners that receive
//! every trace write. Inside a context, `tracing` events are fed into the hub
//! by [`HubLayer`]; a [`TraceRelay`] forwards a context's hub back to the host.

pub mod hub;
pub mod layer;
pub mod monitor;
pub mod relay;

pub use hub::ListenerId;
pub use hub::TraceHub;
pub use hub::TraceListener;
pub use layer::HubLayer;
pub use monitor::TraceMonitor;
pub use relay::RelayOptions;
pub use relay::RelayState;
pub use relay::TraceRelay;
