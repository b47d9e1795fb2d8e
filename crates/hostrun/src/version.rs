//! # Version
//!
//! Read-only version surface of the library and of the packages it hosts.

/// Version strings of one build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionInfo {
    /// Name of the package the version belongs to.
    pub package: String,
    /// Semantic version of the public API.
    pub api_version: String,
    /// Version stamped by the build, if any, else the API version.
    pub file_version: String,
    /// `file_version` followed by the build profile.
    pub current: String,
}

impl VersionInfo {
    /// Version of a package. An empty or missing `file_version` falls back
    /// to `api_version`.
    ///
    /// Call it from the package itself, passing its own `CARGO_PKG_*`
    /// variables. The profile suffix follows the build of `hostrun`.
    pub fn for_package(package: &str, api_version: &str, file_version: Option<&str>) -> Self {
        let file_version = file_version
            .filter(|v| !v.is_empty())
            .unwrap_or(api_version)
            .to_string();

        let profile = if cfg!(debug_assertions) {
            "(Debug)"
        } else {
            "(Release)"
        };

        Self {
            package: package.to_string(),
            api_version: api_version.to_string(),
            current: format!("{} {}", file_version, profile),
            file_version,
        }
    }
}

/// Version of the `hostrun` library.
pub fn library() -> VersionInfo {
    VersionInfo::for_package(
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        option_env!("HOSTRUN_FILE_VERSION"),
    )
}

impl std::fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.current)
    }
}
