//! Configuration system
//!
//! Loads ~/.config/postbox/config.yaml with sections for:
//! - Storage backend selection and paths
//! - Capacity limits
//! - Retention and notification cadence
//! - Cash-on-delivery switches
//! - Attachment box geometry
//! - The remote identity service

mod postbox_config;
pub mod validation;

pub use postbox_config::{
    BackendKind, BoxConfig, EscrowConfig, IdentityConfig, PostboxConfig, RetentionConfig,
    StorageConfig,
};
pub use validation::{validate_config, validate_config_result, ConfigIssue};
