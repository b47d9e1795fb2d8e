//! Shared setup for the integration suites.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use hostrun::HostConfig;
use hostrun::ModuleCatalog;
use hostrun::ServerHost;
use hostrun::testing::HostFixture;
use tempfile::TempDir;
use testserver::DropLedger;

pub const WAIT: Duration = Duration::from_secs(5);

/// A host whose application base is a temporary module directory.
pub struct TestHost {
    pub fixture: HostFixture,
    pub catalog: ModuleCatalog,
    pub modules: TempDir,
}

impl std::ops::Deref for TestHost {
    type Target = ServerHost;

    fn deref(&self) -> &ServerHost {
        &self.fixture
    }
}

pub fn config_in(modules: &TempDir) -> HostConfig {
    HostConfig {
        host_name: "test-host".to_string(),
        base_dir: Some(modules.path().to_path_buf()),
        echo_trace: false,
        ..HostConfig::default()
    }
}

/// Builds a host with the test server registered and its manifest in place.
pub fn host() -> TestHost {
    host_with(|_| {})
}

pub fn host_with<F>(tweak: F) -> TestHost
where
    F: FnOnce(&mut HostConfig),
{
    build(tweak, |catalog| testserver::register(catalog), true)
}

/// Like [`host`], but servers record their drops in `ledger`.
pub fn host_with_ledger(ledger: Arc<DropLedger>) -> TestHost {
    build(|_| {}, move |catalog| testserver::register_with_ledger(catalog, ledger), true)
}

/// A host with an empty catalog and no manifests.
pub fn bare_host() -> TestHost {
    build(|_| {}, |_| {}, false)
}

fn build<F, R>(tweak: F, register: R, manifest: bool) -> TestHost
where
    F: FnOnce(&mut HostConfig),
    R: FnOnce(&ModuleCatalog),
{
    hostrun::logging::init_for_tests();

    let modules = TempDir::new().expect("Failed to create module dir");
    if manifest {
        testserver::write_manifest(modules.path()).expect("Failed to write manifest");
    }

    let mut config = config_in(&modules);
    tweak(&mut config);

    let catalog = ModuleCatalog::new();
    register(&catalog);

    let host = ServerHost::new(config, catalog.clone()).expect("Failed to start host");
    TestHost {
        fixture: HostFixture::new(host),
        catalog,
        modules,
    }
}
