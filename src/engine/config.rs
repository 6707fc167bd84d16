//! Database connection and pool configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::engine::url::DatabaseUrl;
use crate::error::{Error, Result};
use crate::proxy::instance::validate_instance_name;
use crate::proxy::lifecycle::ProxyEndpoint;

/// Connection pool knobs, handed to the pool builder as given.
///
/// Names and defaults follow SQLAlchemy's `QueuePool`. Durations are in
/// seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "defaults::pool_size")]
    pub pool_size: u32,
    #[serde(default = "defaults::max_overflow")]
    pub max_overflow: u32,
    #[serde(default = "defaults::pool_timeout")]
    pub pool_timeout: u64,
    #[serde(default)]
    pub pool_recycle: Option<u64>,
}

impl PoolSettings {
    /// Upper bound on open connections.
    pub fn max_connections(&self) -> u32 {
        self.pool_size.saturating_add(self.max_overflow)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_timeout)
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        self.pool_recycle.map(Duration::from_secs)
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_size: defaults::POOL_SIZE,
            max_overflow: defaults::MAX_OVERFLOW,
            pool_timeout: defaults::POOL_TIMEOUT_SECS,
            pool_recycle: None,
        }
    }
}

/// Where an engine's connections go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineTarget {
    /// A PostgreSQL server reached over TCP.
    Postgres { host: String, port: Option<u16> },
    /// A Cloud SQL instance reached through its Unix socket directory.
    CloudSql {
        instance_connection_name: String,
        socket_dir: PathBuf,
    },
}

/// Everything needed to build an engine.
///
/// For Cloud SQL, `host` holds the instance connection name.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub database: String,
    #[serde(default)]
    pub google_cloud_project_id: Option<String>,
    #[serde(default)]
    pub cloud_sql_socket_dir: Option<PathBuf>,
    #[serde(default)]
    pub pool: PoolSettings,
}

impl DatabaseConfig {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        host: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            host: host.into(),
            port: None,
            database: database.into(),
            google_cloud_project_id: None,
            cloud_sql_socket_dir: None,
            pool: PoolSettings::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_google_cloud_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.google_cloud_project_id = Some(project_id.into());
        self
    }

    pub fn with_cloud_sql_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cloud_sql_socket_dir = Some(dir.into());
        self
    }

    pub fn with_pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    /// Parse a config from JSON.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a config from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Whether a Google Cloud project id is set, selecting Cloud SQL.
    pub fn uses_cloud_sql(&self) -> bool {
        self.google_cloud_project_id
            .as_deref()
            .is_some_and(|id| !id.is_empty())
    }

    /// Check the required fields without touching the network.
    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() {
            return Err(Error::MissingParameter("username"));
        }
        if self.host.is_empty() {
            return Err(Error::MissingParameter("host"));
        }
        if self.database.is_empty() {
            return Err(Error::MissingParameter("database"));
        }
        if self.uses_cloud_sql() {
            validate_instance_name(&self.host)?;
        }
        Ok(())
    }

    /// Route to a plain Postgres server or to Cloud SQL.
    pub fn target(&self) -> EngineTarget {
        if self.uses_cloud_sql() {
            EngineTarget::CloudSql {
                instance_connection_name: self.host.clone(),
                socket_dir: self.socket_dir(),
            }
        } else {
            EngineTarget::Postgres {
                host: self.host.clone(),
                port: self.port,
            }
        }
    }

    fn socket_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.cloud_sql_socket_dir {
            return dir.clone();
        }
        std::env::var_os(defaults::CLOUD_SQL_SOCKET_DIR_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(defaults::CLOUD_SQL_SOCKET_DIR))
    }

    /// SQLAlchemy-style URL for this config.
    pub fn url(&self) -> DatabaseUrl {
        let url = DatabaseUrl::new(&self.username, &self.password, &self.host, &self.database);
        match self.port {
            Some(port) => url.with_port(port),
            None => url,
        }
    }

    /// The same credentials, pointed at a locally running proxy.
    pub fn through_proxy(&self, endpoint: &ProxyEndpoint) -> Self {
        Self {
            host: endpoint.address().ip().to_string(),
            port: Some(endpoint.port),
            google_cloud_project_id: None,
            ..self.clone()
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("username", &self.username)
            .field("password", &"***")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("google_cloud_project_id", &self.google_cloud_project_id)
            .field("cloud_sql_socket_dir", &self.cloud_sql_socket_dir)
            .field("pool", &self.pool)
            .finish()
    }
}
