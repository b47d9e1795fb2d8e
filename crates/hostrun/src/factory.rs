//! # Context Factory
//!
//! Derives the setup of a new isolated context from the host's own
//! configuration and spawns it.

use crate::config::HostConfig;
use crate::context;
use crate::context::ContextSetup;
use crate::context::IsolationContext;

#[derive(Clone, Debug)]
pub struct IsolationContextFactory {
    config: HostConfig,
}

impl IsolationContextFactory {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Copies the host setup. The application base is the configured base
    /// directory, else the working directory at the time of the call.
    pub fn derive_setup(&self) -> std::io::Result<ContextSetup> {
        let application_base = match &self.config.base_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };

        Ok(ContextSetup {
            application_base,
            configuration_file: self.config.configuration_file.clone(),
            shadow_copy_files: self.config.shadow_copy_files,
            shadow_copy_directories: self.config.shadow_copy_directories.clone(),
            cache_path: self.config.cache_path.clone(),
            trace_level: self.config.context_trace_level,
        })
    }

    /// Spawns a context named `name` with `setup`.
    pub fn new_context(&self, name: &str, setup: ContextSetup) -> context::Result<IsolationContext> {
        tracing::debug!(
            context = name,
            base = %setup.application_base.display(),
            shadow_copy = setup.shadow_copy_files,
            "Creating isolation context"
        );
        IsolationContext::spawn(name, setup)
    }
}
