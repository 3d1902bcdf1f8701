//! Configuration validation
//!
//! Reports every problem at once instead of stopping at the first one.

use super::postbox_config::PostboxConfig;
use crate::MailError;

/// One configuration problem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub type ValidationResult = std::result::Result<(), Vec<ConfigIssue>>;

/// Validate a configuration
pub fn validate_config(config: &PostboxConfig) -> ValidationResult {
    let mut issues = Vec::new();

    let limits = &config.limits;
    if limits.max_recipients == 0 {
        issues.push(ConfigIssue::new(
            "limits.max_recipients",
            "Must allow at least one recipient",
        ));
    }
    if limits.max_groups == 0 {
        issues.push(ConfigIssue::new(
            "limits.max_groups",
            "Must allow at least one group",
        ));
    }
    if limits.max_body_lines == 0 {
        issues.push(ConfigIssue::new(
            "limits.max_body_lines",
            "Must allow at least one line",
        ));
    }

    if config.retention.max_age_days == Some(0) {
        issues.push(ConfigIssue::new(
            "retention.max_age_days",
            "Use a positive number of days, or remove the key to disable the sweeper",
        ));
    }
    if config.retention.sweep_interval_secs == 0 {
        issues.push(ConfigIssue::new(
            "retention.sweep_interval_secs",
            "Interval must be greater than 0",
        ));
    }
    if config.retention.notify_interval_secs == 0 {
        issues.push(ConfigIssue::new(
            "retention.notify_interval_secs",
            "Interval must be greater than 0",
        ));
    }

    if config.boxes.slots == 0 || config.boxes.slots % 9 != 0 {
        issues.push(ConfigIssue::new(
            "boxes.slots",
            format!(
                "Box size {} must be a positive multiple of 9",
                config.boxes.slots
            ),
        ));
    }
    if config.boxes.max_stack == 0 {
        issues.push(ConfigIssue::new(
            "boxes.max_stack",
            "Stack size must be greater than 0",
        ));
    }

    for (field, url) in [
        ("identity.endpoint", &config.identity.endpoint),
        ("identity.batch_endpoint", &config.identity.batch_endpoint),
    ] {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            issues.push(ConfigIssue::new(
                field,
                format!("Invalid URL: {}", url),
            ));
        }
    }
    if !config.identity.endpoint.contains("{name}") {
        issues.push(ConfigIssue::new(
            "identity.endpoint",
            "Endpoint must contain the {name} placeholder",
        ));
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

/// Validate and fold the issues into a single error
pub fn validate_config_result(config: &PostboxConfig) -> crate::Result<()> {
    validate_config(config).map_err(|issues| {
        let joined = issues
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        MailError::Config(joined)
    })
}
