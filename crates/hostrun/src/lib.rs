pub mod config;
pub mod context;
pub mod exec_id;
pub mod factory;
pub mod fault;
pub mod host;
pub mod loader;
pub mod logging;
pub mod registry;
pub mod remote;
pub mod testing;
pub mod trace;
pub mod version;

pub use config::HostConfig;
pub use context::ContextEnv;
pub use context::ContextSetup;
pub use context::IsolationContext;
pub use exec_id::ExecutionId;
pub use fault::Fault;
pub use fault::UnhandledFailureReporter;
pub use host::ServerHost;
pub use loader::ComponentDescriptor;
pub use loader::HostedComponent;
pub use loader::ModuleCatalog;
pub use loader::ModuleManifest;
pub use registry::HostRegistry;
pub use registry::HostedComponentHandle;
pub use remote::CallError;
pub use remote::Remote;
pub use trace::TraceHub;
pub use trace::TraceMonitor;
pub use trace::TraceRelay;
