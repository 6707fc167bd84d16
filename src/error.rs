//! Error types for cloudsql-postgres.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// cloudsql-postgres error type.
///
/// Failures raised by `sqlx` while talking to the database are not part of
/// this enum; they reach the caller unchanged from the pool.
#[derive(Error, Debug)]
pub enum Error {
    /// No usable cloud-sql-proxy executable was found
    #[error(
        "cloud-sql-proxy not found for platform {platform}; searched: {}. \
         Install it or pass an explicit path",
        display_paths(.searched)
    )]
    ProxyBinaryNotFound {
        platform: String,
        searched: Vec<PathBuf>,
    },

    /// Instance connection name is not `project:region:instance`
    #[error(
        "Invalid Cloud SQL instance connection name: '{0}'. \
         Expected format: 'project-id:region:instance-name' \
         (e.g., 'my-project:us-central1:my-instance')"
    )]
    InvalidInstanceName(String),

    /// A required connection parameter was empty
    #[error("Missing required connection parameter: {0}")]
    MissingParameter(&'static str),

    /// Something else already accepts connections on the proxy's port
    #[error("Port {port} on 127.0.0.1 is already in use; cloud-sql-proxy cannot listen there")]
    ProxyPortInUse { port: u16 },

    /// The proxy executable could not be started
    #[error("Failed to spawn cloud-sql-proxy at {path:?}: {source}")]
    ProxySpawnFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The proxy exited before accepting connections
    #[error("cloud-sql-proxy exited with {status} before becoming ready. Output:\n{output}")]
    ProxyExited { status: ExitStatus, output: String },

    /// The proxy did not accept connections within the startup timeout
    #[error(
        "cloud-sql-proxy did not become ready within {}ms. Output:\n{output}",
        .timeout.as_millis()
    )]
    ProxyStartupTimeout { timeout: Duration, output: String },

    /// The proxy process could not be killed or reaped
    #[error("Failed to tear down cloud-sql-proxy (pid {pid}): {reason}")]
    ProxyTeardownFailed { pid: u32, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "(nothing)".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias for cloudsql-postgres operations.
pub type Result<T> = std::result::Result<T, Error>;
