//! # Test Server
//!
//! A small server-like component for exercising `hostrun`. Hosts register it
//! in their catalog with [`register`] and put its module manifest next to
//! their modules with [`write_manifest`].

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use hostrun::HostedComponent;
use hostrun::ModuleCatalog;
use hostrun::ModuleManifest;
use hostrun::version::VersionInfo;
use parking_lot::Mutex;

pub const MODULE: &str = "testserver";

/// Counts server drops per component name, across contexts.
#[derive(Debug, Default)]
pub struct DropLedger {
    drops: Mutex<HashMap<String, usize>>,
}

impl DropLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, name: &str) {
        *self.drops.lock().entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn drops(&self, name: &str) -> usize {
        self.drops.lock().get(name).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.drops.lock().values().sum()
    }
}

pub struct Server {
    name: String,
    started: bool,
    ledger: Option<Arc<DropLedger>>,
}

impl HostedComponent for Server {
    const MODULE: &'static str = MODULE;
    const TYPE_NAME: &'static str = "Server";
}

impl Server {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            started: false,
            ledger: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn init_server(&mut self) {
        self.started = true;
        tracing::info!(server = %self.name, "Server initialized");
    }

    /// Runs one unit of work. Returns the exit code.
    pub fn run(&mut self) -> i32 {
        tracing::info!(server = %self.name, "Server running");
        0
    }

    pub fn echo(&self, message: &str) -> String {
        tracing::debug!(server = %self.name, "echo {}", message);
        message.to_string()
    }

    /// Writes `message` to the context's diagnostic output.
    pub fn emit(&self, message: &str) {
        tracing::info!("{}", message);
    }

    pub fn fail(&self) -> i32 {
        panic!("server {} failed", self.name);
    }

    /// Starts a background task that panics. Returns false outside a context.
    pub fn spawn_fault(&self) -> bool {
        let Some(env) = hostrun::context::current() else {
            return false;
        };
        let name = self.name.clone();
        env.spawn(async move {
            panic!("background task of {} failed", name);
        });
        true
    }

    /// Name and identity of the context the server runs in.
    pub fn whereami(&self) -> Option<(String, String)> {
        hostrun::context::current().map(|env| (env.name().to_string(), env.identity()))
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        tracing::debug!(server = %self.name, "Server dropped");
        if let Some(ledger) = &self.ledger {
            ledger.record(&self.name);
        }
    }
}

/// Registers [`Server`] in `catalog`.
pub fn register(catalog: &ModuleCatalog) {
    catalog.register_type::<Server, _>(Server::new);
}

/// Registers [`Server`] so that every drop is recorded in `ledger`.
pub fn register_with_ledger(catalog: &ModuleCatalog, ledger: Arc<DropLedger>) {
    catalog.register_type::<Server, _>(move |name: &str| {
        let mut server = Server::new(name);
        server.ledger = Some(ledger.clone());
        server
    });
}

/// Writes the module manifest into `dir` and returns its path.
pub fn write_manifest(dir: &Path) -> hostrun::loader::Result<PathBuf> {
    let path = dir.join(format!("{}.toml", MODULE));
    ModuleManifest::new(
        MODULE,
        Some(env!("CARGO_PKG_VERSION").to_string()),
        vec![Server::TYPE_NAME.to_string()],
    )
    .write_to(&path)?;
    Ok(path)
}

/// Version of the test server package.
pub fn version() -> VersionInfo {
    VersionInfo::for_package(
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        option_env!("TESTSERVER_FILE_VERSION"),
    )
}
