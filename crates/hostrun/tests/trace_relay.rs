//! Integration tests for relaying context trace output to the host.

mod common;

use std::time::Duration;
use std::time::Instant;

use hostrun::CallError;
use hostrun::TraceMonitor;
use hostrun::trace::RelayState;
use hostrun::trace::relay;
use testserver::Server;

use common::WAIT;

const QUIET: Duration = Duration::from_millis(200);

fn monitor_host(host: &hostrun::ServerHost) -> TraceMonitor {
    let monitor = TraceMonitor::new();
    host.trace().add(monitor.listener());
    monitor
}

#[test]
fn test_relay_forwards_with_origin() -> anyhow::Result<()> {
    let host = common::host();
    let monitor = monitor_host(&host);
    let handle = host.create_and_load::<Server>("server-a")?;

    let relay = host.start_trace_relay(handle.context(), true)?;
    assert_eq!(relay.state(), RelayState::Listening);
    assert_eq!(relay.origin(), handle.context().identity());
    assert_eq!(relay.local_identity(), host.identity());

    handle.component().call(|s| s.init_server())?;

    let line = monitor
        .wait_for(WAIT, |m| m.contains("Server initialized"))
        .expect("No relayed message");
    assert!(line.starts_with(&format!("{}: ", handle.context().identity())));
    assert!(line.contains("server=server-a"));
    Ok(())
}

#[test]
fn test_relay_without_origin_writes_unmodified() -> anyhow::Result<()> {
    let host = common::host();
    let monitor = monitor_host(&host);
    let handle = host.create_and_load::<Server>("plain")?;

    let _relay = host.start_trace_relay(handle.context(), false)?;
    handle.component().call(|s| s.emit("unadorned"))?;

    let line = monitor
        .wait_for(WAIT, |m| m.contains("unadorned"))
        .expect("No relayed message");
    assert!(line.starts_with("INFO"));
    Ok(())
}

#[test]
fn test_relays_attribute_each_context() -> anyhow::Result<()> {
    let host = common::host();
    let monitor = monitor_host(&host);
    let a = host.create_and_load::<Server>("worker:a")?;
    let b = host.create_and_load::<Server>("worker:b")?;

    let _relay_a = host.start_trace_relay(a.context(), true)?;
    let _relay_b = host.start_trace_relay(b.context(), true)?;

    a.component().call(|s| s.emit("from a"))?;
    b.component().call(|s| s.emit("from b"))?;

    let from_a = monitor.wait_for(WAIT, |m| m.contains("from a")).expect("Nothing from a");
    let from_b = monitor.wait_for(WAIT, |m| m.contains("from b")).expect("Nothing from b");

    // Both friendly names are "worker"; the execution ids tell them apart.
    assert!(from_a.starts_with(&format!("{}: ", a.context().identity())));
    assert!(from_b.starts_with(&format!("{}: ", b.context().identity())));
    assert_ne!(a.context().identity(), b.context().identity());
    Ok(())
}

#[test]
fn test_dispose_stops_forwarding() -> anyhow::Result<()> {
    let host = common::host();
    let monitor = monitor_host(&host);
    let handle = host.create_and_load::<Server>("disposable")?;
    let relay = host.start_trace_relay(handle.context(), true)?;

    handle.component().call(|s| s.emit("before dispose"))?;
    assert!(monitor.wait_for(WAIT, |m| m.contains("before dispose")).is_some());

    relay.dispose();
    assert_eq!(relay.state(), RelayState::Disposed);
    assert!(handle.context().trace().is_empty());
    relay.dispose();

    handle.component().call(|s| s.emit("after dispose"))?;
    assert!(monitor.wait_for(QUIET, |m| m.contains("after dispose")).is_none());
    Ok(())
}

#[test]
fn test_drop_disposes_relay() -> anyhow::Result<()> {
    let host = common::host();
    let handle = host.create_and_load::<Server>("dropped")?;

    let relay = host.start_trace_relay(handle.context(), true)?;
    assert_eq!(handle.context().trace().len(), 1);
    drop(relay);

    assert!(handle.context().trace().is_empty());
    Ok(())
}

#[test]
fn test_skip_option_leaves_relay_uninitialized() -> anyhow::Result<()> {
    let host = common::host_with(|config| config.skip_trace_relay = true);
    let monitor = monitor_host(&host);
    let handle = host.create_and_load::<Server>("skipped")?;

    let relay = host.start_trace_relay(handle.context(), true)?;
    assert_eq!(relay.state(), RelayState::Uninitialized);
    assert!(handle.context().trace().is_empty());

    handle.component().call(|s| s.emit("not forwarded"))?;
    assert!(monitor.wait_for(QUIET, |m| m.contains("not forwarded")).is_none());
    Ok(())
}

#[test]
fn test_relay_startup_fails_for_unloaded_context() -> anyhow::Result<()> {
    let host = common::host();
    let handle = host.create_and_load::<Server>("late")?;
    host.unload(Some(handle.context()));

    match host.start_trace_relay(handle.context(), true) {
        Err(relay::Error::Startup { context, source }) => {
            assert_eq!(context, "late");
            assert!(matches!(source, CallError::PeerGone { .. }));
        }
        Ok(_) => panic!("Relay started on an unloaded context"),
    }
    Ok(())
}

#[test]
fn test_dispose_after_context_unload() -> anyhow::Result<()> {
    let host = common::host();
    let handle = host.create_and_load::<Server>("short-lived")?;
    let relay = host.start_trace_relay(handle.context(), true)?;

    host.unload(Some(handle.context()));
    relay.dispose();
    assert_eq!(relay.state(), RelayState::Disposed);
    Ok(())
}

#[test]
fn test_full_channel_drops_are_counted() -> anyhow::Result<()> {
    const BURST: usize = 500;

    let host = common::host_with(|config| config.relay_capacity = 1);
    let monitor = monitor_host(&host);
    let handle = host.create_and_load::<Server>("bursty")?;
    let relay = host.start_trace_relay(handle.context(), true)?;

    handle.component().call(|s| {
        for i in 0..BURST {
            s.emit(&format!("burst {}", i));
        }
    })?;

    let deadline = Instant::now() + WAIT;
    loop {
        let delivered = monitor
            .messages()
            .iter()
            .filter(|m| m.contains("burst "))
            .count();
        if delivered + relay.dropped() as usize >= BURST {
            break;
        }
        assert!(Instant::now() < deadline, "Burst neither delivered nor counted");
        std::thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

#[test]
fn test_single_producer_order_is_preserved() -> anyhow::Result<()> {
    const COUNT: usize = 200;

    let host = common::host();
    let monitor = monitor_host(&host);
    let handle = host.create_and_load::<Server>("ordered")?;
    let relay = host.start_trace_relay(handle.context(), false)?;

    handle.component().call(|s| {
        for i in 0..COUNT {
            s.emit(&format!("seq-{}-end", i));
        }
    })?;

    let deadline = Instant::now() + WAIT;
    let sequence = loop {
        let sequence: Vec<usize> = monitor
            .messages()
            .iter()
            .filter_map(|m| m.split("seq-").nth(1)?.split("-end").next()?.parse().ok())
            .collect();
        if sequence.len() >= COUNT {
            break sequence;
        }
        assert!(Instant::now() < deadline, "Only {} of {} messages relayed", sequence.len(), COUNT);
        std::thread::sleep(Duration::from_millis(10));
    };

    assert_eq!(relay.dropped(), 0);
    assert_eq!(sequence, (0..COUNT).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_echo_listener_is_installed_on_request() {
    let quiet = common::host();
    assert!(quiet.trace().is_empty());

    let echoing = common::host_with(|config| config.echo_trace = true);
    assert_eq!(echoing.trace().len(), 1);
}
