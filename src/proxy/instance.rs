//! Cloud SQL instance connection name validation.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

/// `project:region:instance`, three non-empty segments.
fn shape() -> &'static Regex {
    static SHAPE: OnceLock<Regex> = OnceLock::new();
    SHAPE.get_or_init(|| Regex::new(r"^[^:]+:[^:]+:[^:]+$").expect("static regex"))
}

/// GCP naming rules: project ids are 6-30 chars starting with a letter,
/// regions look like `us-central1`, instance names are lowercase.
fn gcp_style() -> &'static Regex {
    static GCP: OnceLock<Regex> = OnceLock::new();
    GCP.get_or_init(|| {
        Regex::new(r"^[a-z][a-z0-9-]{5,29}:[a-z]+(-[a-z]+)*\d+:[a-z0-9-]+$").expect("static regex")
    })
}

/// Check whether `name` has the `project:region:instance` shape.
///
/// ```
/// use cloudsql_postgres::is_valid_cloud_sql_instance_name;
///
/// assert!(is_valid_cloud_sql_instance_name("my-project:us-central1:my-instance"));
/// assert!(!is_valid_cloud_sql_instance_name("invalid-format"));
/// assert!(!is_valid_cloud_sql_instance_name("project:instance"));
/// ```
pub fn is_valid_cloud_sql_instance_name(name: &str) -> bool {
    shape().is_match(name)
}

/// Check whether `name` also follows GCP's naming rules for each segment.
pub fn is_gcp_style_instance_name(name: &str) -> bool {
    gcp_style().is_match(name)
}

/// Validate an instance connection name, failing with `InvalidInstanceName`.
///
/// Names that are well formed but break GCP naming rules are accepted with a
/// warning.
pub fn validate_instance_name(name: &str) -> Result<()> {
    if !is_valid_cloud_sql_instance_name(name) {
        return Err(Error::InvalidInstanceName(name.to_string()));
    }
    if !is_gcp_style_instance_name(name) {
        log::warn!(
            "Instance connection name '{}' does not follow GCP naming rules",
            name
        );
    }
    Ok(())
}
