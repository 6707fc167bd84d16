//! Engine construction for PostgreSQL and Cloud SQL.
//!
//! Engines are lazily connected `sqlx` pools: building one never opens a
//! connection, so connection and authentication failures surface as
//! `sqlx::Error` on first use.

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use crate::defaults;
use crate::engine::config::{DatabaseConfig, EngineTarget, PoolSettings};
use crate::error::Result;
use crate::proxy::instance::validate_instance_name;

/// Pool builder carrying `settings`.
pub fn pool_options(settings: &PoolSettings) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(settings.max_connections())
        .acquire_timeout(settings.acquire_timeout())
        .max_lifetime(settings.max_lifetime())
}

/// Connection options for `config` routed to `target`.
pub fn connect_options(config: &DatabaseConfig, target: &EngineTarget) -> PgConnectOptions {
    let options = PgConnectOptions::new()
        .username(&config.username)
        .password(&config.password)
        .database(&config.database);

    match target {
        EngineTarget::Postgres { host, port } => {
            let options = options.host(host);
            match port {
                Some(port) => options.port(*port),
                None => options,
            }
        }
        EngineTarget::CloudSql {
            instance_connection_name,
            socket_dir,
        } => options
            .socket(socket_dir.join(instance_connection_name))
            // The socket file is `.s.PGSQL.<port>`; never inherit PGPORT here
            .port(config.port.unwrap_or(defaults::CLOUD_SQL_PORT)),
    }
}

/// Build an engine from a full config, routing on the project id.
///
/// Must be called inside a tokio runtime.
pub fn create_engine(config: &DatabaseConfig) -> Result<PgPool> {
    config.validate()?;
    let target = config.target();

    match target {
        EngineTarget::Postgres { ref host, .. } => {
            log::debug!("Creating Postgres engine for {}/{}", host, config.database);
        }
        EngineTarget::CloudSql {
            ref instance_connection_name,
            ref socket_dir,
        } => {
            log::info!(
                "Creating Cloud SQL engine for {} via {}",
                instance_connection_name,
                socket_dir.display()
            );
        }
    }

    let options = connect_options(config, &target);
    Ok(pool_options(&config.pool).connect_lazy_with(options))
}

/// Create an engine for a PostgreSQL server that is not on Cloud SQL.
pub fn create_postgres_engine(
    username: &str,
    password: &str,
    host: &str,
    database: &str,
) -> Result<PgPool> {
    create_engine(&DatabaseConfig::new(username, password, host, database))
}

/// Create an engine for a Cloud SQL instance.
///
/// `host` is the instance connection name (`project:region:instance`).
pub fn create_postgres_engine_in_cloud_sql(
    username: &str,
    password: &str,
    host: &str,
    database: &str,
) -> Result<PgPool> {
    validate_instance_name(host)?;
    // The project segment of a valid name is never empty, so this routes to Cloud SQL
    let project_id = host.split(':').next().unwrap_or_default();
    let config = DatabaseConfig::new(username, password, host, database)
        .with_google_cloud_project_id(project_id);
    create_engine(&config)
}

/// Create a Cloud SQL engine when `google_cloud_project_id` is set and
/// non-empty, otherwise a plain Postgres engine.
pub fn create_database_engine(
    username: &str,
    password: &str,
    host: &str,
    database: &str,
    google_cloud_project_id: Option<&str>,
) -> Result<PgPool> {
    match google_cloud_project_id {
        Some(id) if !id.is_empty() => {
            create_postgres_engine_in_cloud_sql(username, password, host, database)
        }
        _ => create_postgres_engine(username, password, host, database),
    }
}
