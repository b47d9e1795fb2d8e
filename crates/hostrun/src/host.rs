//! # Server Host
//!
//! The explicit owner of everything a host process needs to run hosted
//! components: the registry, the controller trace hub, the host execution id
//! and the worker pool that forwards relayed trace output.
//!
//! ```ignore
//! let catalog = ModuleCatalog::new();
//! testserver::register(&catalog);
//!
//! let host = ServerHost::new(HostConfig::default(), catalog)?;
//! let server = host.create_and_load::<Server>("server-a")?;
//! let _relay = host.start_trace_relay(server.context(), true)?;
//! server.component().call(|s| s.init_server())?;
//! host.unload_all();
//! ```

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::runtime::Runtime;

use crate::config;
use crate::config::HostConfig;
use crate::context::IsolationContext;
use crate::exec_id;
use crate::exec_id::ExecutionId;
use crate::factory::IsolationContextFactory;
use crate::fault::UnhandledFailureReporter;
use crate::loader::ComponentLoader;
use crate::loader::HostedComponent;
use crate::loader::ModuleCatalog;
use crate::registry;
use crate::registry::HostRegistry;
use crate::registry::HostedComponentHandle;
use crate::trace::TraceHub;
use crate::trace::relay;
use crate::trace::relay::RelayOptions;
use crate::trace::relay::RelayReceiver;
use crate::trace::relay::TraceRelay;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error("Failed to start relay worker pool: {0}")]
    Runtime(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub struct ServerHost {
    config: HostConfig,
    registry: HostRegistry,
    exec_id: ExecutionId,
    hub: TraceHub,
    relay_handle: Handle,
    relay_runtime: Option<Runtime>,
}

impl ServerHost {
    pub fn new(config: HostConfig, catalog: ModuleCatalog) -> Result<Self> {
        let relay_runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.relay_workers.max(1))
            .thread_name("hostrun-relay")
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;

        let loader = ComponentLoader::new(
            catalog,
            config.primary_extension.clone(),
            config.fallback_extension.clone(),
        );
        let registry = HostRegistry::new(
            IsolationContextFactory::new(config.clone()),
            loader,
            UnhandledFailureReporter::new(),
        );

        let hub = TraceHub::new();
        if config.echo_trace {
            // Relayed writes arrive on relay workers, which use the host's
            // global subscriber.
            hub.add(Arc::new(|message: &str| {
                tracing::info!(target: "hostrun::relay", "{}", message);
            }));
        }

        let host = Self {
            config,
            registry,
            exec_id: ExecutionId::new(),
            hub,
            relay_handle: relay_runtime.handle().clone(),
            relay_runtime: Some(relay_runtime),
        };
        tracing::debug!(host = %host.identity(), "Server host started");
        Ok(host)
    }

    /// Builds a host from `HOSTRUN_*` environment variables.
    pub fn from_env(catalog: ModuleCatalog) -> Result<Self> {
        Self::new(HostConfig::from_env()?, catalog)
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    /// The controller trace hub relayed output is written to.
    pub fn trace(&self) -> &TraceHub {
        &self.hub
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.exec_id
    }

    pub fn identity(&self) -> String {
        exec_id::identity(&self.config.host_name, &self.exec_id)
    }

    pub fn create_and_load<T: HostedComponent>(&self, name: &str) -> registry::Result<HostedComponentHandle<T>> {
        self.registry.create_and_load::<T>(name)
    }

    pub fn unload(&self, context: Option<&IsolationContext>) {
        self.registry.unload(context);
    }

    pub fn unload_all(&self) {
        self.registry.unload_all();
    }

    /// Starts forwarding `context`'s trace output to the host hub.
    pub fn start_trace_relay(&self, context: &IsolationContext, show_origin: bool) -> relay::Result<TraceRelay> {
        let options = RelayOptions {
            show_origin,
            capacity: self.config.relay_capacity,
            skip: self.config.skip_trace_relay,
        };
        let receiver = Arc::new(RelayReceiver::new(self.identity(), show_origin, self.hub.clone()));
        TraceRelay::start(context, receiver, &self.relay_handle, options)
    }
}

impl Drop for ServerHost {
    fn drop(&mut self) {
        self.registry.unload_all();
        if let Some(runtime) = self.relay_runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for ServerHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHost")
            .field("host", &self.config.host_name)
            .field("registry", &self.registry)
            .finish()
    }
}
