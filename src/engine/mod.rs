//! Engine construction for PostgreSQL.
//!
//! This module provides:
//! - Connection URL construction (`url`)
//! - Connection and pool configuration (`config`)
//! - Engine constructors and routing (`create`)

pub mod config;
pub mod create;
pub mod url;

pub use config::{DatabaseConfig, EngineTarget, PoolSettings};
pub use create::{
    create_database_engine, create_engine, create_postgres_engine,
    create_postgres_engine_in_cloud_sql,
};
pub use url::{create_sqlalchemy_url, DatabaseUrl};
