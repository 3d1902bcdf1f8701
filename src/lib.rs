//! Postbox - persistent in-game mail
//!
//! Postbox stores messages between players, the console, blocks and synthetic
//! actors. A message starts as a per-sender draft, is sent exactly once, and
//! may carry item attachments gated behind a cash-on-delivery price.
//!
//! # Architecture
//!
//! - **model**: Actors, mail records, item stacks and groups
//! - **store**: The `MailStore` contract with a flat-file and a SQLite backend
//! - **groups**: Static group registry and address resolution
//! - **escrow**: Cash-on-delivery protocol with compensating rollback
//! - **boxes**: Attachment box sessions synchronized back into records
//! - **identity**: Actor ids and remote player name lookup
//! - **sweeper**: Retention and deferred notification passes
//! - **service**: Orchestration over all of the above

// Core modules
pub mod config;
pub mod error;
pub mod model;
pub mod store;

// Components
pub mod boxes;
pub mod collaborators;
pub mod escrow;
pub mod groups;
pub mod identity;
pub mod service;
pub mod sweeper;

// Ambient
pub mod logging;
pub mod metrics;

// Re-exports
pub use error::{MailError, Result};
pub use service::{MailService, MailServiceBuilder};
