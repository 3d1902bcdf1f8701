//! Core data model
//!
//! - [`Actor`]: who sends and receives mail
//! - [`MailRecord`]: one message in draft or sent state
//! - [`ItemStack`]: attachment items and item prices
//! - [`Group`] / [`DynamicGroup`]: address groups

mod actor;
pub mod group;
pub mod items;
mod mail;

pub use actor::{Actor, ActorError, ActorKey, ActorKind, BlockPos, Location};
pub use group::{DynamicGroup, Group, GroupMode, GroupNameError};
pub use items::ItemStack;
pub use mail::{MailBuilder, MailLimits, MailParts, MailRecord, Price, ValidationError};
