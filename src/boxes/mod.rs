//! Attachment box sessions

pub mod session;

pub use session::{AttachmentBox, BoxKey, BoxRegistry, SharedBox};
