//! cloud-sql-proxy binary lookup.
//!
//! Resolution order:
//! 1. An explicit path supplied by the caller
//! 2. The `CLOUD_SQL_PROXY_PATH` environment variable
//! 3. Every directory on `PATH`
//! 4. The per-platform install locations in [`Platform::candidates`]

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::defaults;
use crate::error::{Error, Result};

/// Host platforms with a known install layout for cloud-sql-proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    MacOsIntel,
    MacOsArm,
    Linux,
    Windows,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::MacOsIntel,
        Platform::MacOsArm,
        Platform::Linux,
        Platform::Windows,
    ];

    /// Detect the running platform, or `None` if it has no install layout.
    pub fn current() -> Option<Self> {
        Self::from_os_arch(std::env::consts::OS, std::env::consts::ARCH)
    }

    fn from_os_arch(os: &str, arch: &str) -> Option<Self> {
        match (os, arch) {
            ("macos", "aarch64") => Some(Platform::MacOsArm),
            ("macos", _) => Some(Platform::MacOsIntel),
            ("linux", _) => Some(Platform::Linux),
            ("windows", _) => Some(Platform::Windows),
            _ => None,
        }
    }

    /// File name of the proxy executable on this platform.
    pub fn binary_name(self) -> &'static str {
        match self {
            Platform::Windows => defaults::PROXY_BINARY_NAME_WINDOWS,
            _ => defaults::PROXY_BINARY_NAME,
        }
    }

    /// Conventional install locations, most specific first.
    pub fn candidates(self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = match self {
            Platform::MacOsArm => vec![
                "/opt/homebrew/bin/cloud-sql-proxy".into(),
                "/usr/local/bin/cloud-sql-proxy".into(),
            ],
            Platform::MacOsIntel => vec!["/usr/local/bin/cloud-sql-proxy".into()],
            Platform::Linux => vec![
                "/usr/local/bin/cloud-sql-proxy".into(),
                "/usr/bin/cloud-sql-proxy".into(),
                "/usr/lib/google-cloud-sdk/bin/cloud-sql-proxy".into(),
            ],
            Platform::Windows => vec![
                r"C:\Program Files\Google\Cloud SDK\google-cloud-sdk\bin\cloud-sql-proxy.exe".into(),
            ],
        };

        // Per-user Cloud SDK installs
        match self {
            Platform::Windows => {
                if cfg!(windows) {
                    if let Some(local) = dirs::data_local_dir() {
                        paths.push(local.join(
                            r"Google\Cloud SDK\google-cloud-sdk\bin\cloud-sql-proxy.exe",
                        ));
                    }
                }
                paths.push(defaults::PROXY_BINARY_NAME_WINDOWS.into());
            }
            _ => {
                if let Some(home) = dirs::home_dir() {
                    paths.push(PathBuf::from(format!(
                        "{}/google-cloud-sdk/bin/cloud-sql-proxy",
                        home.display()
                    )));
                }
            }
        }

        paths
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::MacOsIntel => "macos-x86_64",
            Platform::MacOsArm => "macos-aarch64",
            Platform::Linux => "linux",
            Platform::Windows => "windows",
        };
        f.write_str(name)
    }
}

/// Locates the cloud-sql-proxy executable.
///
/// Holds the inputs of the lookup so tests can pin them instead of
/// depending on the machine running them.
#[derive(Debug, Clone)]
pub struct ProxyLocator {
    platform: Option<Platform>,
    env_override: Option<PathBuf>,
    search_path: Option<OsString>,
}

impl ProxyLocator {
    /// Build a locator from the running platform and process environment.
    pub fn from_env() -> Self {
        Self {
            platform: Platform::current(),
            env_override: std::env::var_os(defaults::PROXY_PATH_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            search_path: std::env::var_os("PATH"),
        }
    }

    /// Build a locator for `platform` with no environment inputs.
    pub fn for_platform(platform: Platform) -> Self {
        Self {
            platform: Some(platform),
            env_override: None,
            search_path: None,
        }
    }

    pub fn with_env_override(mut self, path: impl Into<PathBuf>) -> Self {
        self.env_override = Some(path.into());
        self
    }

    pub fn with_search_path(mut self, path: impl Into<OsString>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    pub fn platform(&self) -> Option<Platform> {
        self.platform
    }

    /// Every path the lookup would check after the explicit path, in order.
    pub fn search_order(&self) -> Vec<PathBuf> {
        let mut order = Vec::new();

        if let Some(ref path) = self.env_override {
            order.push(path.clone());
        }

        let binary = self
            .platform
            .map(Platform::binary_name)
            .unwrap_or(defaults::PROXY_BINARY_NAME);
        if let Some(ref search_path) = self.search_path {
            order.extend(std::env::split_paths(search_path).map(|dir| dir.join(binary)));
        }

        if let Some(platform) = self.platform {
            for candidate in platform.candidates() {
                if !order.contains(&candidate) {
                    order.push(candidate);
                }
            }
        }

        order
    }

    /// Resolve the proxy executable.
    pub fn locate(&self, explicit_path: Option<&Path>) -> Result<PathBuf> {
        self.locate_with(explicit_path, is_executable)
    }

    /// Resolve the proxy executable using `usable` in place of the
    /// filesystem check.
    pub fn locate_with<F>(&self, explicit_path: Option<&Path>, usable: F) -> Result<PathBuf>
    where
        F: Fn(&Path) -> bool,
    {
        let mut searched = Vec::new();

        if let Some(path) = explicit_path {
            if usable(path) {
                return Ok(path.to_path_buf());
            }
            log::debug!("Explicit proxy path {:?} is not an executable file", path);
            searched.push(path.to_path_buf());
        }

        for candidate in self.search_order() {
            if usable(&candidate) {
                log::debug!("Using cloud-sql-proxy at {:?}", candidate);
                return Ok(candidate);
            }
            searched.push(candidate);
        }

        Err(Error::ProxyBinaryNotFound {
            platform: self.platform_label(),
            searched,
        })
    }

    fn platform_label(&self) -> String {
        match self.platform {
            Some(platform) => platform.to_string(),
            None => format!(
                "{}-{} (unsupported)",
                std::env::consts::OS,
                std::env::consts::ARCH
            ),
        }
    }
}

impl Default for ProxyLocator {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Find the cloud-sql-proxy executable for the running platform.
pub fn locate_proxy_binary(explicit_path: Option<&Path>) -> Result<PathBuf> {
    ProxyLocator::from_env().locate(explicit_path)
}

/// Check that `path` is a regular file the current user could execute.
pub fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        true
    }
}
