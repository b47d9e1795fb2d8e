//! # Test Fixture
//!
//! Scoped helper for harnesses that host several servers per test.

use std::ops::Deref;

use crate::host::ServerHost;

/// Owns a [`ServerHost`] and unloads everything it loaded when dropped, even
/// if the test panics.
pub struct HostFixture {
    host: ServerHost,
}

impl HostFixture {
    pub fn new(host: ServerHost) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &ServerHost {
        &self.host
    }
}

impl Deref for HostFixture {
    type Target = ServerHost;

    fn deref(&self) -> &ServerHost {
        &self.host
    }
}

impl Drop for HostFixture {
    fn drop(&mut self) {
        tracing::debug!(loaded = self.host.registry().len(), "Host fixture teardown");
        self.host.unload_all();
    }
}
