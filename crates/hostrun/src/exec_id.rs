//! # Execution Id
//!
//! A unique identifier for one execution environment (the host itself, or one
//! isolated context). Used to tell apart trace origins whose friendly names
//! share a prefix.

use parking_lot::Mutex;

/// Lazily generated, single-flight unique id.
///
/// The value is drawn the first time it is requested and never changes
/// afterwards. Concurrent first reads are serialized by the lock, so every
/// reader observes the same value.
#[derive(Debug, Default)]
pub struct ExecutionId {
    value: Mutex<Option<u128>>,
}

impl ExecutionId {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }

    /// Returns the id, generating it on first use.
    pub fn value(&self) -> u128 {
        let mut guard = self.value.lock();
        *guard.get_or_insert_with(|| loop {
            // zero doubles as "unset" in diagnostics, never hand it out
            let candidate = rand::random::<u128>();
            if candidate != 0 {
                break candidate;
            }
        })
    }

    /// Returns a 32-bit fold of the id, short enough for log prefixes.
    pub fn short(&self) -> u32 {
        let value = self.value();
        let folded = (value as u64) ^ ((value >> 64) as u64);
        (folded as u32) ^ ((folded >> 32) as u32)
    }

    /// Returns true once the id has been generated.
    pub fn is_initialized(&self) -> bool {
        self.value.lock().is_some()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.value())
    }
}

/// Builds the trace identity `<friendly name>-<short id>`.
///
/// The friendly name is cut at the first `:` (when it is not the leading
/// character), so decorated names such as `server-a:worker` still group under
/// `server-a`.
pub fn identity(name: &str, id: &ExecutionId) -> String {
    format!("{}-{}", friendly_name(name), id.short())
}

pub(crate) fn friendly_name(name: &str) -> &str {
    match name.find(':') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    }
}
