//! Address groups
//!
//! Static groups live in the [`GroupRegistry`] and are persisted by a
//! [`GroupStorage`] backend. Dynamic groups (`All`, `All-Connected`,
//! `All-Ever-Logged-In`, `External-permission-group:<name>`) are computed by
//! the [`AddressResolver`] when a mail is sent.

pub mod registry;
pub mod resolver;
pub mod storage;

pub use registry::{GroupAction, GroupRegistry};
pub use resolver::AddressResolver;
pub use storage::{GroupStorage, SqliteGroupStorage, YamlGroupStorage};
