//! Actor identities
//!
//! - [`registry`]: stable integer ids for actors, per backend
//! - [`lookup`]: player name to account id resolution over a remote service
//! - [`retry`]: backoff and rate-limit handling for the remote service

pub mod lookup;
pub mod registry;
pub mod retry;

pub use lookup::{CachingNameResolver, HttpNameSource, NameSource};
pub use registry::{IdentityRegistry, MemoryIdentityRegistry, SqliteIdentityRegistry};
pub use retry::{with_retry, RetryConfig, RetryDecision, RetryableError};
