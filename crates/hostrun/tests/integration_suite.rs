//! Integration tests for hosting servers in isolated contexts.

mod common;

use std::sync::Arc;
use std::sync::Barrier;

use hostrun::CallError;
use hostrun::ComponentDescriptor;
use hostrun::Fault;
use hostrun::HostedComponent;
use hostrun::UnhandledFailureReporter;
use hostrun::loader;
use hostrun::loader::Instance;
use hostrun::registry;
use testserver::DropLedger;
use testserver::Server;

use common::WAIT;

// --- Test 1: Create and load ---

#[test]
fn test_create_and_load_returns_named_handle() {
    let host = common::host();

    for name in ["server-a", "server-b:worker", "サーバー"] {
        let handle = host
            .create_and_load::<Server>(name)
            .expect("Failed to load server");

        assert_eq!(handle.name(), name);
        assert_eq!(handle.context().name(), name);
        assert!(!handle.context().is_unloaded());
        assert!(handle.component().is_alive());

        let server_name = handle
            .component()
            .call(|server| server.name().to_string())
            .expect("Call failed");
        assert_eq!(server_name, name);
    }

    assert_eq!(host.registry().len(), 3);
}

#[test]
fn test_server_runs_inside_its_context() -> anyhow::Result<()> {
    let host = common::host();
    let handle = host.create_and_load::<Server>("runner")?;
    let server = handle.component();

    server.call(|s| s.init_server())?;
    assert!(server.call(|s| s.is_started())?);
    assert_eq!(server.call(|s| s.run())?, 0);
    assert_eq!(server.call(|s| s.echo("ping"))?, "ping");

    let (name, identity) = server
        .call(|s| s.whereami())?
        .expect("Server is not inside a context");
    assert_eq!(name, "runner");
    assert_eq!(identity, handle.context().identity());
    Ok(())
}

// --- Test 2: Argument and module errors ---

#[test]
fn test_empty_name_is_invalid() {
    let host = common::host();
    match host.create_and_load::<Server>("") {
        Err(registry::Error::InvalidArgument { argument, .. }) => assert_eq!(argument, "name"),
        other => panic!("Expected InvalidArgument, got {:?}", other.map(|_| ())),
    }
    assert!(host.registry().is_empty());
}

#[test]
fn test_missing_module_is_reported() {
    let host = common::bare_host();
    match host.create_and_load::<Server>("nowhere") {
        Err(registry::Error::Load(loader::Error::ModuleNotFound { module, .. })) => {
            assert_eq!(module, testserver::MODULE);
        }
        other => panic!("Expected ModuleNotFound, got {:?}", other.map(|_| ())),
    }
    assert!(host.registry().is_empty());
}

#[test]
fn test_type_mismatch_is_reported() {
    let host = common::host();
    host.catalog.register(
        ComponentDescriptor::of::<Server>(),
        Arc::new(|name: &str| Some(Box::new(name.to_string()) as Box<dyn Instance>)),
    );

    match host.create_and_load::<Server>("impostor") {
        Err(registry::Error::Load(loader::Error::TypeMismatch {
            actual,
            expected,
            module_path,
            ..
        })) => {
            assert!(actual.contains("String"));
            assert!(expected.ends_with("Server"));
            assert!(module_path.ends_with("testserver.toml"));
        }
        other => panic!("Expected TypeMismatch, got {:?}", other.map(|_| ())),
    }
    assert!(host.registry().get("impostor").is_none());
}

#[test]
fn test_empty_constructor_is_instantiation_failure() {
    let host = common::host();
    host.catalog.register(
        ComponentDescriptor::new(testserver::MODULE, Server::TYPE_NAME),
        Arc::new(|_: &str| -> Option<Box<dyn Instance>> { None }),
    );

    match host.create_and_load::<Server>("hollow") {
        Err(registry::Error::Load(loader::Error::InstantiationFailed { context, .. })) => {
            assert_eq!(context, "hollow");
        }
        other => panic!("Expected InstantiationFailed, got {:?}", other.map(|_| ())),
    }
    assert!(host.registry().is_empty());
}

// --- Test 3: Duplicates ---

#[test]
fn test_duplicate_name_is_rejected_until_unloaded() -> anyhow::Result<()> {
    let host = common::host();
    let first = host.create_and_load::<Server>("dup")?;

    match host.create_and_load::<Server>("dup") {
        Err(registry::Error::AlreadyExists { name }) => assert_eq!(name, "dup"),
        other => panic!("Expected AlreadyExists, got {:?}", other.map(|_| ())),
    }
    assert!(first.component().is_alive());

    host.unload(Some(first.context()));
    let second = host.create_and_load::<Server>("dup")?;
    assert!(second.component().is_alive());
    assert!(!first.component().is_alive());
    Ok(())
}

#[test]
fn test_concurrent_creators_of_one_name() {
    let host = common::host();
    let barrier = Barrier::new(8);

    let results: Vec<bool> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    match host.create_and_load::<Server>("contested") {
                        Ok(_) => true,
                        Err(registry::Error::AlreadyExists { .. }) => false,
                        Err(e) => panic!("Unexpected error: {}", e),
                    }
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|won| **won).count(), 1);
    assert_eq!(host.registry().names(), vec!["contested".to_string()]);
}

// --- Test 4: Unloading ---

#[test]
fn test_unload_all_destroys_every_context() -> anyhow::Result<()> {
    let ledger = DropLedger::new();
    let host = common::host_with_ledger(ledger.clone());

    let handles: Vec<_> = ["A", "B", "C"]
        .into_iter()
        .map(|name| host.create_and_load::<Server>(name))
        .collect::<Result<_, _>>()?;

    host.unload_all();

    assert!(host.registry().is_empty());
    for handle in &handles {
        assert!(handle.context().is_unloaded());
        assert_eq!(ledger.drops(handle.name()), 1);
        match handle.component().call(|s| s.run()) {
            Err(CallError::PeerGone { context }) => assert_eq!(context, handle.name()),
            other => panic!("Expected PeerGone, got {:?}", other),
        }
    }

    host.unload_all();
    assert_eq!(ledger.total(), 3);
    Ok(())
}

#[test]
fn test_concurrent_unload_all_destroys_once() -> anyhow::Result<()> {
    let ledger = DropLedger::new();
    let host = common::host_with_ledger(ledger.clone());

    let handles: Vec<_> = ["A", "B", "C"]
        .into_iter()
        .map(|name| host.create_and_load::<Server>(name))
        .collect::<Result<_, _>>()?;

    let barrier = Barrier::new(10);
    std::thread::scope(|scope| {
        for _ in 0..10 {
            scope.spawn(|| {
                barrier.wait();
                host.unload_all();
            });
        }
    });

    assert!(host.registry().is_empty());
    for handle in &handles {
        assert!(handle.context().is_unloaded());
        assert_eq!(ledger.drops(handle.name()), 1, "{} destroyed more than once", handle.name());
    }
    assert_eq!(ledger.total(), 3);
    Ok(())
}

#[test]
fn test_unload_is_tolerant() -> anyhow::Result<()> {
    let host = common::host();
    host.unload(None);

    let handle = host.create_and_load::<Server>("tolerant")?;
    handle.context().unload()?;

    // Already unloaded behind the registry's back.
    host.unload(Some(handle.context()));
    host.unload(Some(handle.context()));
    assert!(host.registry().is_empty());
    Ok(())
}

#[test]
fn test_fixture_unloads_on_drop() -> anyhow::Result<()> {
    let ledger = DropLedger::new();
    let context = {
        let host = common::host_with_ledger(ledger.clone());
        let handle = host.create_and_load::<Server>("scoped")?;
        handle.context().clone()
    };

    assert!(context.is_unloaded());
    assert_eq!(ledger.drops("scoped"), 1);
    Ok(())
}

// --- Test 5: Faults ---

#[test]
fn test_call_panic_is_faulted_and_server_survives() -> anyhow::Result<()> {
    let host = common::host();
    let handle = host.create_and_load::<Server>("fragile")?;

    match handle.component().call(|s| s.fail()) {
        Err(CallError::Faulted { context, message }) => {
            assert_eq!(context, "fragile");
            assert!(message.contains("server fragile failed"));
        }
        other => panic!("Expected Faulted, got {:?}", other),
    }
    assert_eq!(handle.component().call(|s| s.run())?, 0);
    Ok(())
}

#[test]
fn test_background_fault_is_reported_not_propagated() -> anyhow::Result<()> {
    let host = common::host();
    let handle = host.create_and_load::<Server>("faulty")?;
    let faults = handle.context().faults();
    assert!(faults.is_subscribed(UnhandledFailureReporter::OWNER));

    let (tx, rx) = crossbeam_channel::unbounded();
    faults.subscribe(
        "observer",
        Arc::new(move |fault: &Fault| {
            let _ = tx.send(fault.clone());
        }),
    );

    assert!(handle.component().call(|s| s.spawn_fault())?);
    let fault = rx.recv_timeout(WAIT)?;
    assert_eq!(fault.context, "faulty");
    assert!(fault.message.contains("background task of faulty failed"));

    assert!(!handle.context().is_unloaded());
    assert_eq!(handle.component().call(|s| s.echo("still here"))?, "still here");
    Ok(())
}

#[test]
fn test_posted_panic_is_reported() -> anyhow::Result<()> {
    let host = common::host();
    let handle = host.create_and_load::<Server>("posted")?;

    let (tx, rx) = crossbeam_channel::unbounded();
    handle.context().faults().subscribe(
        "observer",
        Arc::new(move |fault: &Fault| {
            let _ = tx.send(fault.message.clone());
        }),
    );

    handle.component().post(|s| {
        s.fail();
    })?;
    assert!(rx.recv_timeout(WAIT)?.contains("server posted failed"));
    assert_eq!(handle.component().call(|s| s.run())?, 0);
    Ok(())
}

// --- Test 6: Host surface ---

#[test]
fn test_host_identity_and_version() {
    let host = common::host();
    let identity = host.identity();
    assert!(identity.starts_with("test-host-"));
    assert_eq!(identity, format!("test-host-{}", host.execution_id().short()));

    let version = hostrun::version::library();
    assert!(!version.current.is_empty());
    assert!(version.current.contains('.'));
    assert!(!version.current.starts_with("1.0.0.0"));
    assert!(!version.api_version.chars().all(|c| c == '0' || c == '.'));
}

#[test]
fn test_testserver_reports_its_own_version() -> anyhow::Result<()> {
    let version = testserver::version();
    assert_eq!(version.package, "testserver");
    assert_eq!(version.api_version, "0.1.0");
    assert_ne!(version.package, hostrun::version::library().package);

    let dir = tempfile::TempDir::new()?;
    let manifest = loader::read_manifest(&testserver::write_manifest(dir.path())?)?;
    assert_eq!(manifest.name, testserver::MODULE);
    assert_eq!(manifest.version.as_deref(), Some(version.api_version.as_str()));
    assert!(manifest.exports(Server::TYPE_NAME));
    Ok(())
}
