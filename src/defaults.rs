//! Default values for proxy lookup, proxy lifecycle and connection pools.

use std::time::Duration;

pub const PROXY_BINARY_NAME: &str = "cloud-sql-proxy";
pub const PROXY_BINARY_NAME_WINDOWS: &str = "cloud-sql-proxy.exe";
pub const PROXY_PATH_ENV: &str = "CLOUD_SQL_PROXY_PATH";

pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

pub const URL_SCHEME: &str = "postgresql+pg8000";
pub const CLOUD_SQL_SOCKET_DIR: &str = "/cloudsql";
pub const CLOUD_SQL_SOCKET_DIR_ENV: &str = "CLOUD_SQL_SOCKET_DIR";
pub const CLOUD_SQL_PORT: u16 = 5432;

pub const POOL_SIZE: u32 = 5;
pub const MAX_OVERFLOW: u32 = 10;
pub const POOL_TIMEOUT_SECS: u64 = 30;

pub fn pool_size() -> u32 { POOL_SIZE }
pub fn max_overflow() -> u32 { MAX_OVERFLOW }
pub fn pool_timeout() -> u64 { POOL_TIMEOUT_SECS }
