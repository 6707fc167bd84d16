//! cloudsql-postgres - PostgreSQL engines for local servers and Google Cloud SQL,
//! plus lifecycle management for `cloud-sql-proxy`.

mod defaults;
pub mod error;

pub mod engine;
pub mod proxy;

pub use error::{Error, Result};

pub use engine::{
    create_database_engine, create_engine, create_postgres_engine,
    create_postgres_engine_in_cloud_sql, create_sqlalchemy_url, DatabaseConfig, DatabaseUrl,
    EngineTarget, PoolSettings,
};

pub use proxy::{
    cloud_sql_proxy_running, cloud_sql_proxy_running_async, is_gcp_style_instance_name,
    is_valid_cloud_sql_instance_name, locate_proxy_binary, CloudSqlProxy, Platform,
    ProxyEndpoint, ProxyLocator, ProxyOptions, ProxyState,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
