//! Address resolution
//!
//! Expands a record's direct recipients and group names into the concrete
//! recipient set frozen at send time.

use super::registry::GroupRegistry;
use crate::collaborators::{PermissionOracle, Presence};
use crate::identity::IdentityRegistry;
use crate::model::{Actor, DynamicGroup, MailRecord};
use crate::store::RecipientResolver;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct AddressResolver {
    groups: Arc<GroupRegistry>,
    presence: Arc<dyn Presence>,
    permissions: Arc<dyn PermissionOracle>,
    identities: Arc<dyn IdentityRegistry>,
}

impl AddressResolver {
    pub fn new(
        groups: Arc<GroupRegistry>,
        presence: Arc<dyn Presence>,
        permissions: Arc<dyn PermissionOracle>,
        identities: Arc<dyn IdentityRegistry>,
    ) -> Self {
        Self {
            groups,
            presence,
            permissions,
            identities,
        }
    }

    /// Current members of a group name, static or dynamic
    ///
    /// Unknown names expand to nobody.
    pub fn expand(&self, name: &str) -> BTreeSet<Actor> {
        if let Some(dynamic) = DynamicGroup::parse(name) {
            return self.expand_dynamic(&dynamic);
        }

        match self.groups.members(name) {
            Some(members) => members,
            None => {
                debug!(group = %name, "Group no longer exists, skipping");
                BTreeSet::new()
            }
        }
    }

    fn expand_dynamic(&self, group: &DynamicGroup) -> BTreeSet<Actor> {
        match group {
            DynamicGroup::All => {
                let mut all = self.presence.ever_seen();
                all.extend(self.presence.online());
                match self.identities.known() {
                    Ok(known) => all.extend(known),
                    Err(e) => warn!(error = %e, "Could not list known actors"),
                }
                all
            }
            DynamicGroup::Connected => self.presence.online(),
            DynamicGroup::EverLoggedIn => self.presence.ever_seen(),
            DynamicGroup::Permission(name) => self.permissions.members_of(name),
        }
    }
}

impl RecipientResolver for AddressResolver {
    fn resolve_total(&self, record: &MailRecord) -> BTreeSet<Actor> {
        let mut total: BTreeSet<Actor> = record.recipients().iter().cloned().collect();
        for name in record.recipient_groups() {
            total.extend(self.expand(name));
        }
        total
    }
}
