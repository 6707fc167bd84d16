//! cloud-sql-proxy management.
//!
//! This module provides:
//! - Binary lookup across platforms (`locator`)
//! - Instance connection name validation (`instance`)
//! - Process lifecycle management (`lifecycle`)
//! - Signal escalation and reaping (`process`)

pub mod instance;
pub mod lifecycle;
pub mod locator;
pub mod process;

pub use instance::{is_gcp_style_instance_name, is_valid_cloud_sql_instance_name};
pub use lifecycle::{
    cloud_sql_proxy_running, cloud_sql_proxy_running_async, CloudSqlProxy, ProxyEndpoint,
    ProxyOptions, ProxyState,
};
pub use locator::{locate_proxy_binary, Platform, ProxyLocator};
