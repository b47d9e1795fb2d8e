//! # Host Configuration
//!
//! [`HostConfig`] is everything a [`ServerHost`](crate::host::ServerHost)
//! needs to derive context setups and run its trace relays. Values come from
//! `HOSTRUN_*` environment variables layered over [`Default`].
//!
//! | Variable | Field |
//! |----------|-------|
//! | `HOSTRUN_HOST_NAME` | `host_name` |
//! | `HOSTRUN_BASE_DIR` | `base_dir` |
//! | `HOSTRUN_CONFIG_FILE` | `configuration_file` |
//! | `HOSTRUN_SHADOW_COPY` | `shadow_copy_files` |
//! | `HOSTRUN_SHADOW_COPY_DIRS` | `shadow_copy_directories` (path list) |
//! | `HOSTRUN_CACHE_PATH` | `cache_path` |
//! | `HOSTRUN_MODULE_EXTENSIONS` | `primary_extension`,`fallback_extension` |
//! | `HOSTRUN_RELAY_CAPACITY` | `relay_capacity` |
//! | `HOSTRUN_RELAY_WORKERS` | `relay_workers` |
//! | `HOSTRUN_SKIP_TRACE_RELAY` | `skip_trace_relay` |
//! | `HOSTRUN_CONTEXT_TRACE_LEVEL` | `context_trace_level` |
//! | `HOSTRUN_ECHO_TRACE` | `echo_trace` |

use std::path::PathBuf;
use std::str::FromStr;

use tracing::Level;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Invalid value '{value}' for {key}")]
    Invalid { key: String, value: String },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostConfig {
    /// Friendly name of the host, used for its trace identity.
    pub host_name: String,
    /// Application base for new contexts. `None` means the working directory
    /// at the time a context is created.
    pub base_dir: Option<PathBuf>,
    pub configuration_file: Option<PathBuf>,
    pub shadow_copy_files: bool,
    pub shadow_copy_directories: Vec<PathBuf>,
    pub cache_path: Option<PathBuf>,
    pub primary_extension: String,
    pub fallback_extension: String,
    /// Bound of each relay's forwarding channel.
    pub relay_capacity: usize,
    /// Worker threads of the host relay pool.
    pub relay_workers: usize,
    /// Create relay endpoints but never start listening.
    pub skip_trace_relay: bool,
    pub context_trace_level: Level,
    /// Re-emit relayed messages through the host's `tracing` subscriber.
    pub echo_trace: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_name: "host".to_string(),
            base_dir: None,
            configuration_file: None,
            shadow_copy_files: false,
            shadow_copy_directories: Vec::new(),
            cache_path: None,
            primary_extension: "toml".to_string(),
            fallback_extension: "json".to_string(),
            relay_capacity: 1024,
            relay_workers: 1,
            skip_trace_relay: false,
            context_trace_level: Level::DEBUG,
            echo_trace: true,
        }
    }
}

impl HostConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(name) = var("HOSTRUN_HOST_NAME") {
            config.host_name = name;
        }
        config.base_dir = var("HOSTRUN_BASE_DIR").map(PathBuf::from);
        config.configuration_file = var("HOSTRUN_CONFIG_FILE").map(PathBuf::from);
        if let Some(value) = var("HOSTRUN_SHADOW_COPY") {
            config.shadow_copy_files = parse_bool("HOSTRUN_SHADOW_COPY", &value)?;
        }
        if let Some(value) = var("HOSTRUN_SHADOW_COPY_DIRS") {
            config.shadow_copy_directories = std::env::split_paths(&value).collect();
        }
        config.cache_path = var("HOSTRUN_CACHE_PATH").map(PathBuf::from);
        if let Some(value) = var("HOSTRUN_MODULE_EXTENSIONS") {
            let (primary, fallback) = parse_extensions(&value)?;
            config.primary_extension = primary;
            config.fallback_extension = fallback;
        }
        if let Some(value) = var("HOSTRUN_RELAY_CAPACITY") {
            config.relay_capacity = parse_positive("HOSTRUN_RELAY_CAPACITY", &value)?;
        }
        if let Some(value) = var("HOSTRUN_RELAY_WORKERS") {
            config.relay_workers = parse_positive("HOSTRUN_RELAY_WORKERS", &value)?;
        }
        if let Some(value) = var("HOSTRUN_SKIP_TRACE_RELAY") {
            config.skip_trace_relay = parse_bool("HOSTRUN_SKIP_TRACE_RELAY", &value)?;
        }
        if let Some(value) = var("HOSTRUN_CONTEXT_TRACE_LEVEL") {
            config.context_trace_level = Level::from_str(value.trim())
                .map_err(|_| invalid("HOSTRUN_CONTEXT_TRACE_LEVEL", &value))?;
        }
        if let Some(value) = var("HOSTRUN_ECHO_TRACE") {
            config.echo_trace = parse_bool("HOSTRUN_ECHO_TRACE", &value)?;
        }

        Ok(config)
    }
}

fn invalid(key: &str, value: &str) -> Error {
    Error::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_positive(key: &str, value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(invalid(key, value)),
    }
}

/// `"toml,json"` or a single `"toml"` (the fallback then stays the default).
fn parse_extensions(value: &str) -> Result<(String, String)> {
    let key = "HOSTRUN_MODULE_EXTENSIONS";
    let parts: Vec<&str> = value
        .split(',')
        .map(|part| part.trim().trim_start_matches('.'))
        .collect();

    match parts.as_slice() {
        [primary] if !primary.is_empty() => Ok((
            primary.to_string(),
            HostConfig::default().fallback_extension,
        )),
        [primary, fallback] if !primary.is_empty() && !fallback.is_empty() => {
            Ok((primary.to_string(), fallback.to_string()))
        }
        _ => Err(invalid(key, value)),
    }
}
