//! Host-side collaborators
//!
//! The mail subsystem runs inside a game server that owns presence,
//! permissions and chat output. These traits are the seams to it; the
//! in-memory implementations back the CLI and the tests.

use crate::model::{Actor, MailRecord};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

/// Who is connected, and who has ever connected
pub trait Presence: Send + Sync {
    /// Actors currently online
    fn online(&self) -> BTreeSet<Actor>;

    fn is_online(&self, actor: &Actor) -> bool {
        self.online().contains(actor)
    }

    /// Every actor that ever connected
    fn ever_seen(&self) -> BTreeSet<Actor>;
}

/// External permission checks
pub trait PermissionOracle: Send + Sync {
    /// Whether the actor holds the elevated operator permission
    fn is_operator(&self, actor: &Actor) -> bool;

    /// Members of an external permission group
    fn members_of(&self, group: &str) -> BTreeSet<Actor>;

    /// Whether the actor may send attachments to several recipients at once
    fn can_multi_attach(&self, actor: &Actor) -> bool {
        self.is_operator(actor)
    }
}

/// Tells online actors about new mail
pub trait Notifier: Send + Sync {
    fn notify_new_mail(&self, recipient: &Actor, mail: &MailRecord);
}

/// Re-displays mail detail views after a box is closed
pub trait MailView: Send + Sync {
    fn show_mail(&self, viewer: &Actor, mail: &MailRecord);
    fn show_draft(&self, viewer: &Actor, draft: &MailRecord);
}

/// Presence backed by two sets
#[derive(Debug, Default)]
pub struct MemoryPresence {
    online: RwLock<BTreeSet<Actor>>,
    seen: RwLock<BTreeSet<Actor>>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an actor as connected (and therefore seen)
    pub fn connect(&self, actor: &Actor) {
        if let Ok(mut online) = self.online.write() {
            online.insert(actor.clone());
        }
        self.remember(actor);
    }

    pub fn disconnect(&self, actor: &Actor) {
        if let Ok(mut online) = self.online.write() {
            online.remove(actor);
        }
    }

    /// Record an actor as having connected at some point
    pub fn remember(&self, actor: &Actor) {
        if let Ok(mut seen) = self.seen.write() {
            seen.insert(actor.clone());
        }
    }
}

impl Presence for MemoryPresence {
    fn online(&self) -> BTreeSet<Actor> {
        self.online.read().map(|s| s.clone()).unwrap_or_default()
    }

    fn is_online(&self, actor: &Actor) -> bool {
        self.online
            .read()
            .map(|s| s.contains(actor))
            .unwrap_or(false)
    }

    fn ever_seen(&self) -> BTreeSet<Actor> {
        self.seen.read().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Permissions backed by an operator set and named groups
#[derive(Debug, Default)]
pub struct MemoryPermissions {
    operators: RwLock<BTreeSet<Actor>>,
    groups: RwLock<HashMap<String, BTreeSet<Actor>>>,
    multi_attach: RwLock<BTreeSet<Actor>>,
}

impl MemoryPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant_operator(&self, actor: &Actor) {
        if let Ok(mut ops) = self.operators.write() {
            ops.insert(actor.clone());
        }
    }

    pub fn grant_multi_attach(&self, actor: &Actor) {
        if let Ok(mut set) = self.multi_attach.write() {
            set.insert(actor.clone());
        }
    }

    pub fn add_to_group(&self, group: &str, actor: &Actor) {
        if let Ok(mut groups) = self.groups.write() {
            groups
                .entry(group.to_lowercase())
                .or_default()
                .insert(actor.clone());
        }
    }
}

impl PermissionOracle for MemoryPermissions {
    fn is_operator(&self, actor: &Actor) -> bool {
        // The console is always trusted
        actor.is_console()
            || self
                .operators
                .read()
                .map(|ops| ops.contains(actor))
                .unwrap_or(false)
    }

    fn members_of(&self, group: &str) -> BTreeSet<Actor> {
        self.groups
            .read()
            .ok()
            .and_then(|groups| groups.get(&group.to_lowercase()).cloned())
            .unwrap_or_default()
    }

    fn can_multi_attach(&self, actor: &Actor) -> bool {
        self.is_operator(actor)
            || self
                .multi_attach
                .read()
                .map(|set| set.contains(actor))
                .unwrap_or(false)
    }
}

/// Notifier that remembers every notification, for the CLI and tests
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: RwLock<Vec<(Actor, u64)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// (recipient, mail id) pairs in notification order
    pub fn notifications(&self) -> Vec<(Actor, u64)> {
        self.sent.read().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn count_for(&self, actor: &Actor) -> usize {
        self.sent
            .read()
            .map(|v| v.iter().filter(|(a, _)| a == actor).count())
            .unwrap_or(0)
    }
}

impl Notifier for RecordingNotifier {
    fn notify_new_mail(&self, recipient: &Actor, mail: &MailRecord) {
        tracing::info!(
            recipient = %recipient,
            mail_id = mail.id(),
            from = %mail.sender(),
            "New mail"
        );
        if let Ok(mut sent) = self.sent.write() {
            sent.push((recipient.clone(), mail.id()));
        }
    }
}

impl MailView for RecordingNotifier {
    fn show_mail(&self, viewer: &Actor, mail: &MailRecord) {
        tracing::debug!(viewer = %viewer, mail_id = mail.id(), "Re-displaying mail");
    }

    fn show_draft(&self, viewer: &Actor, _draft: &MailRecord) {
        tracing::debug!(viewer = %viewer, "Re-displaying draft");
    }
}

/// View that ignores every call
#[derive(Debug, Default, Clone, Copy)]
pub struct NoView;

impl MailView for NoView {
    fn show_mail(&self, _viewer: &Actor, _mail: &MailRecord) {}
    fn show_draft(&self, _viewer: &Actor, _draft: &MailRecord) {}
}
