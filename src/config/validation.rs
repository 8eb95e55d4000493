//! Runtime configuration validation.
//!
//! Serde handles syntax; this checks values. Every problem is reported, not
//! just the first.

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::RuntimeConfig;
use crate::registry::RegistryAddr;

/// One semantic problem with a configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self { field, message: message.into() }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

fn is_segment(value: &str) -> bool {
    !value.is_empty() && !value.contains('/') && value != "." && value != ".."
}

pub fn validate_config(config: &RuntimeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if let Err(e) = RegistryAddr::parse(&config.registry.address) {
        errors.push(ValidationError::new("registry.address", e.to_string()));
    }

    for (field, value) in [
        ("cluster.platform", &config.cluster.platform),
        ("cluster.system", &config.cluster.system),
        ("cluster.name", &config.cluster.name),
    ] {
        if !is_segment(value) {
            errors.push(ValidationError::new(field, format!("'{}' is not a valid path segment", value)));
        }
    }
    if let Some(instance) = &config.cluster.instance_name {
        if !is_segment(instance) {
            errors.push(ValidationError::new(
                "cluster.instance_name",
                format!("'{}' is not a valid path segment", instance),
            ));
        }
    }

    if config.servers.types.is_empty() {
        errors.push(ValidationError::new("servers.types", "at least one server type is required"));
    }
    let mut seen = std::collections::BTreeSet::new();
    for server_type in &config.servers.types {
        if !seen.insert(*server_type) {
            errors.push(ValidationError::new("servers.types", format!("'{}' listed twice", server_type)));
        }
    }

    if config.watch.debounce_ms == 0 {
        errors.push(ValidationError::new("watch.debounce_ms", "must be greater than zero"));
    }
    if config.lifecycle.drain_timeout_secs == 0 {
        errors.push(ValidationError::new("lifecycle.drain_timeout_secs", "must be greater than zero"));
    }

    for (field, policy) in [
        ("registry.reconnect", &config.registry.reconnect),
        ("lifecycle.publish_retry", &config.lifecycle.publish_retry),
    ] {
        if policy.base_delay_ms == 0 {
            errors.push(ValidationError::new(field, "base_delay_ms must be greater than zero"));
        }
        if policy.max_delay_ms < policy.base_delay_ms {
            errors.push(ValidationError::new(field, "max_delay_ms must not be below base_delay_ms"));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
