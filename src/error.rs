//! Error types for postbox
//!
//! One error enum covers every failure the mail subsystem can report. The
//! variants fall into the categories callers care about: validation problems
//! (actionable, record unchanged), transient unavailability, persistence
//! failures, escrow failures and identity lookup failures.

use crate::escrow::EscrowError;
use crate::identity::retry::{RetryDecision, RetryableError};
use crate::model::{ActorError, GroupNameError, ValidationError};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for postbox operations
pub type Result<T> = std::result::Result<T, MailError>;

/// Message shown to users when the failure is not theirs to fix
pub const TRY_AGAIN_LATER: &str = "The mail system is busy, please try again later.";

#[derive(Error, Debug)]
pub enum MailError {
    /// Caller supplied something the record rules reject
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The file index is still being built
    #[error("Mail store is still loading")]
    NotReady,

    #[error("Mail not found: #{0}")]
    NotFound(u64),

    #[error("No draft for {0}")]
    DraftNotFound(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Group already exists: {0}")]
    GroupExists(String),

    #[error("Invalid group name: {0}")]
    GroupName(#[from] GroupNameError),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Cash-on-delivery failures
    #[error("Escrow error: {0}")]
    Escrow(#[from] EscrowError),

    #[error("Actor error: {0}")]
    Actor(#[from] ActorError),

    #[error("Identity lookup error: {0}")]
    Identity(String),

    /// Rate limited by the identity service (retry-after in seconds)
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),

    #[error("{0:#}")]
    Anyhow(#[from] anyhow::Error),
}

impl MailError {
    /// Whether this failure came from the storage layer
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            MailError::Storage(_)
                | MailError::Io(_)
                | MailError::Yaml(_)
                | MailError::Json(_)
                | MailError::Database(_)
        )
    }

    /// Text safe to show to a player
    ///
    /// Validation and escrow failures explain what to fix; storage problems
    /// and the loading state degrade to a generic retry hint.
    pub fn user_message(&self) -> String {
        match self {
            MailError::NotReady => TRY_AGAIN_LATER.to_string(),
            e if e.is_persistence() => TRY_AGAIN_LATER.to_string(),
            MailError::Http(_) | MailError::RateLimited(_) | MailError::Anyhow(_) => {
                TRY_AGAIN_LATER.to_string()
            }
            MailError::Validation(e) => capitalize(&e.to_string()),
            MailError::Escrow(e) => e.user_message(),
            other => other.to_string(),
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl RetryableError for MailError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            MailError::RateLimited(secs) => RetryDecision::RetryAfter(Duration::from_secs(*secs)),
            MailError::Http(e) => {
                if e.is_connect() || e.is_timeout() {
                    RetryDecision::Retry
                } else {
                    match e.status().map(|s| s.as_u16()) {
                        Some(429) => RetryDecision::RetryAfter(Duration::from_secs(60)),
                        Some(500..=599) => RetryDecision::Retry,
                        _ => RetryDecision::NoRetry,
                    }
                }
            }
            _ => RetryDecision::NoRetry,
        }
    }
}
