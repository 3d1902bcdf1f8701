//! Group registry
//!
//! Owns the static groups and answers permission questions about them. The
//! registry is read-heavy: lookups take a shared lock, and mutations write
//! through to storage before updating memory.

use super::storage::GroupStorage;
use crate::collaborators::PermissionOracle;
use crate::identity::IdentityRegistry;
use crate::model::group::{group_key, validate_group_name};
use crate::model::{Actor, DynamicGroup, Group, GroupMode};
use crate::{MailError, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Which group action is being checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupAction {
    Send,
    Modify,
    Dissolve,
}

impl GroupAction {
    fn mode(self, group: &Group) -> GroupMode {
        match self {
            GroupAction::Send => group.send_mode,
            GroupAction::Modify => group.modify_mode,
            GroupAction::Dissolve => group.dissolution_mode,
        }
    }

    fn verb(self) -> &'static str {
        match self {
            GroupAction::Send => "send to",
            GroupAction::Modify => "modify",
            GroupAction::Dissolve => "dissolve",
        }
    }
}

pub struct GroupRegistry {
    groups: RwLock<HashMap<String, Group>>,
    storage: Box<dyn GroupStorage>,
    permissions: Arc<dyn PermissionOracle>,
    identities: Option<Arc<dyn IdentityRegistry>>,
}

impl GroupRegistry {
    /// Load every group from storage
    pub fn load(
        storage: Box<dyn GroupStorage>,
        permissions: Arc<dyn PermissionOracle>,
    ) -> Result<Self> {
        let mut groups = HashMap::new();
        for group in storage.load_all()? {
            groups.insert(group.key(), group);
        }
        debug!(groups = groups.len(), "Groups loaded");

        Ok(Self {
            groups: RwLock::new(groups),
            storage,
            permissions,
            identities: None,
        })
    }

    /// Record group owners and members in the store's identity registry
    ///
    /// Actors that only ever appear in a group are still reachable through
    /// the "All" group this way, whatever the backend.
    pub fn with_identities(mut self, identities: Arc<dyn IdentityRegistry>) -> Result<Self> {
        for group in self.read()?.values() {
            intern_group(identities.as_ref(), group)?;
        }
        self.identities = Some(identities);
        Ok(self)
    }

    fn remember(&self, group: &Group) -> Result<()> {
        match &self.identities {
            Some(identities) => intern_group(identities.as_ref(), group),
            None => Ok(()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Group>>> {
        self.groups
            .read()
            .map_err(|_| MailError::Storage("group registry lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Group>>> {
        self.groups
            .write()
            .map_err(|_| MailError::Storage("group registry lock poisoned".to_string()))
    }

    pub fn get(&self, name: &str) -> Option<Group> {
        self.read().ok()?.get(&group_key(name)).cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Every static group, sorted by name
    pub fn list(&self) -> Vec<Group> {
        let mut groups: Vec<Group> = self
            .read()
            .map(|g| g.values().cloned().collect())
            .unwrap_or_default();
        groups.sort_by_key(|g| g.key());
        groups
    }

    /// Groups the actor owns or belongs to
    pub fn groups_of(&self, actor: &Actor) -> Vec<Group> {
        self.list()
            .into_iter()
            .filter(|g| g.is_owner(actor) || g.is_member(actor))
            .collect()
    }

    /// Current members of a static group
    pub fn members(&self, name: &str) -> Option<BTreeSet<Actor>> {
        self.get(name).map(|g| g.members)
    }

    // ------------------------------------------------------------------
    // Permissions
    // ------------------------------------------------------------------

    /// Evaluate one of the group's permission modes for an actor
    pub fn allows(&self, actor: &Actor, group: &Group, action: GroupAction) -> bool {
        match action.mode(group) {
            GroupMode::OwnerOnly => group.is_owner(actor),
            GroupMode::Members => group.is_owner(actor) || group.is_member(actor),
            GroupMode::Everyone => true,
            GroupMode::Operator => self.permissions.is_operator(actor),
        }
    }

    pub fn can_send(&self, actor: &Actor, group: &Group) -> bool {
        self.allows(actor, group, GroupAction::Send)
    }

    pub fn can_modify(&self, actor: &Actor, group: &Group) -> bool {
        self.allows(actor, group, GroupAction::Modify)
    }

    pub fn can_dissolve(&self, actor: &Actor, group: &Group) -> bool {
        self.allows(actor, group, GroupAction::Dissolve)
    }

    /// Check that an actor may address a group by name
    ///
    /// Dynamic groups reach many actors at once and need the operator
    /// permission.
    pub fn check_send(&self, actor: &Actor, name: &str) -> Result<()> {
        if DynamicGroup::parse(name).is_some() {
            if self.permissions.is_operator(actor) {
                return Ok(());
            }
            return Err(MailError::PermissionDenied(format!(
                "only operators may send to {}",
                name
            )));
        }

        let group = self
            .get(name)
            .ok_or_else(|| MailError::GroupNotFound(name.to_string()))?;
        self.require(actor, &group, GroupAction::Send)
    }

    fn require(&self, actor: &Actor, group: &Group, action: GroupAction) -> Result<()> {
        if self.allows(actor, group, action) {
            Ok(())
        } else {
            Err(MailError::PermissionDenied(format!(
                "you may not {} group {}",
                action.verb(),
                group.name
            )))
        }
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Create a group owned by `owner`
    pub fn create(&self, owner: &Actor, name: &str) -> Result<Group> {
        validate_group_name(name)?;
        let mut groups = self.write()?;
        if groups.contains_key(&group_key(name)) {
            return Err(MailError::GroupExists(name.to_string()));
        }

        let group = Group::new(name, owner.clone());
        self.remember(&group)?;
        self.storage.save(&group)?;
        groups.insert(group.key(), group.clone());
        info!(group = %name, owner = %owner, "Group created");
        Ok(group)
    }

    /// Apply a permission-checked change and persist it
    fn modify_group(
        &self,
        actor: &Actor,
        name: &str,
        action: GroupAction,
        change: impl FnOnce(&mut Group) -> bool,
    ) -> Result<bool> {
        let mut groups = self.write()?;
        let key = group_key(name);
        let current = groups
            .get(&key)
            .ok_or_else(|| MailError::GroupNotFound(name.to_string()))?;
        self.require(actor, current, action)?;

        let mut updated = current.clone();
        if !change(&mut updated) {
            return Ok(false);
        }
        self.remember(&updated)?;
        self.storage.save(&updated)?;
        groups.insert(key, updated);
        Ok(true)
    }

    /// Add a member; returns false if already a member
    pub fn add_member(&self, actor: &Actor, name: &str, member: Actor) -> Result<bool> {
        let added = self.modify_group(actor, name, GroupAction::Modify, |g| {
            g.members.insert(member.clone())
        })?;
        if added {
            debug!(group = %name, member = %member, "Member added");
        }
        Ok(added)
    }

    /// Remove a member; returns false if not a member
    ///
    /// Mail already sent to the group keeps its recipient set.
    pub fn remove_member(&self, actor: &Actor, name: &str, member: &Actor) -> Result<bool> {
        self.modify_group(actor, name, GroupAction::Modify, |g| {
            g.members.remove(member)
        })
    }

    /// Change the three permission modes
    pub fn set_modes(
        &self,
        actor: &Actor,
        name: &str,
        send: GroupMode,
        modify: GroupMode,
        dissolve: GroupMode,
    ) -> Result<bool> {
        self.modify_group(actor, name, GroupAction::Modify, |g| {
            let changed =
                g.send_mode != send || g.modify_mode != modify || g.dissolution_mode != dissolve;
            g.send_mode = send;
            g.modify_mode = modify;
            g.dissolution_mode = dissolve;
            changed
        })
    }

    /// Dissolve a group
    ///
    /// Mail that named the group keeps the name; it just expands to nobody.
    pub fn delete(&self, actor: &Actor, name: &str) -> Result<Group> {
        let mut groups = self.write()?;
        let key = group_key(name);
        let group = groups
            .get(&key)
            .ok_or_else(|| MailError::GroupNotFound(name.to_string()))?;
        self.require(actor, group, GroupAction::Dissolve)?;

        self.storage.remove(name)?;
        let removed = groups
            .remove(&key)
            .ok_or_else(|| MailError::GroupNotFound(name.to_string()))?;
        info!(group = %removed.name, by = %actor, "Group dissolved");
        Ok(removed)
    }

    /// Store a group as-is, bypassing permission checks (migration)
    pub fn import(&self, group: Group) -> Result<()> {
        let mut groups = self.write()?;
        self.remember(&group)?;
        self.storage.save(&group)?;
        groups.insert(group.key(), group);
        Ok(())
    }
}

fn intern_group(identities: &dyn IdentityRegistry, group: &Group) -> Result<()> {
    identities.intern(&group.owner)?;
    for member in &group.members {
        identities.intern(member)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MemoryPermissions;
    use crate::groups::storage::YamlGroupStorage;
    use crate::identity::MemoryIdentityRegistry;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        registry: GroupRegistry,
        permissions: Arc<MemoryPermissions>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let permissions = Arc::new(MemoryPermissions::new());
        let registry = GroupRegistry::load(
            Box::new(YamlGroupStorage::in_dir(dir.path())),
            permissions.clone(),
        )
        .unwrap();
        Fixture {
            _dir: dir,
            registry,
            permissions,
        }
    }

    #[test]
    fn test_names_are_case_insensitive() {
        let f = fixture();
        let owner = Actor::dummy("owner");
        f.registry.create(&owner, "Guild").unwrap();

        assert!(f.registry.exists("guild"));
        assert!(matches!(
            f.registry.create(&owner, "GUILD"),
            Err(MailError::GroupExists(_))
        ));
        assert!(matches!(
            f.registry.create(&owner, "All"),
            Err(MailError::GroupName(_))
        ));
    }

    #[test]
    fn test_default_modes() {
        let f = fixture();
        let owner = Actor::dummy("owner");
        let member = Actor::dummy("member");
        let stranger = Actor::dummy("stranger");
        f.registry.create(&owner, "Guild").unwrap();
        f.registry
            .add_member(&owner, "Guild", member.clone())
            .unwrap();

        let group = f.registry.get("Guild").unwrap();
        assert!(f.registry.can_send(&member, &group));
        assert!(!f.registry.can_send(&stranger, &group));
        assert!(!f.registry.can_modify(&member, &group));
        assert!(f.registry.can_dissolve(&owner, &group));

        assert!(matches!(
            f.registry.add_member(&member, "Guild", stranger.clone()),
            Err(MailError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_operator_mode() {
        let f = fixture();
        let owner = Actor::dummy("owner");
        let op = Actor::dummy("op");
        f.registry.create(&owner, "Staff").unwrap();
        f.registry
            .set_modes(
                &owner,
                "Staff",
                GroupMode::Everyone,
                GroupMode::Operator,
                GroupMode::Operator,
            )
            .unwrap();

        assert!(f.registry.delete(&owner, "Staff").is_err());
        f.permissions.grant_operator(&op);
        f.registry.delete(&op, "staff").unwrap();
        assert!(!f.registry.exists("Staff"));
    }

    #[test]
    fn test_check_send() {
        let f = fixture();
        let owner = Actor::dummy("owner");
        f.registry.create(&owner, "Guild").unwrap();

        assert!(f.registry.check_send(&owner, "guild").is_ok());
        assert!(matches!(
            f.registry.check_send(&owner, "Nowhere"),
            Err(MailError::GroupNotFound(_))
        ));
        assert!(matches!(
            f.registry.check_send(&owner, "All-Connected"),
            Err(MailError::PermissionDenied(_))
        ));
        assert!(f.registry.check_send(&Actor::Console, "All").is_ok());
    }

    #[test]
    fn test_groups_persist() {
        let dir = TempDir::new().unwrap();
        let permissions: Arc<dyn PermissionOracle> = Arc::new(MemoryPermissions::new());
        let owner = Actor::dummy("owner");
        {
            let registry = GroupRegistry::load(
                Box::new(YamlGroupStorage::in_dir(dir.path())),
                permissions.clone(),
            )
            .unwrap();
            registry.create(&owner, "Guild").unwrap();
            registry
                .add_member(&owner, "Guild", Actor::dummy("b"))
                .unwrap();
        }

        let registry = GroupRegistry::load(
            Box::new(YamlGroupStorage::in_dir(dir.path())),
            permissions,
        )
        .unwrap();
        assert_eq!(registry.members("GUILD").unwrap().len(), 1);
        assert_eq!(registry.groups_of(&owner).len(), 1);
    }

    #[test]
    fn test_group_actors_become_known_identities() {
        let dir = TempDir::new().unwrap();
        let permissions: Arc<dyn PermissionOracle> = Arc::new(MemoryPermissions::new());
        let owner = Actor::dummy("owner");
        {
            let registry = GroupRegistry::load(
                Box::new(YamlGroupStorage::in_dir(dir.path())),
                permissions.clone(),
            )
            .unwrap();
            registry.create(&owner, "Guild").unwrap();
            registry
                .add_member(&owner, "Guild", Actor::dummy("early"))
                .unwrap();
        }

        let identities = Arc::new(MemoryIdentityRegistry::default());
        let registry = GroupRegistry::load(
            Box::new(YamlGroupStorage::in_dir(dir.path())),
            permissions,
        )
        .unwrap()
        .with_identities(identities.clone())
        .unwrap();

        let known = identities.known().unwrap();
        assert!(known.contains(&owner));
        assert!(known.contains(&Actor::dummy("early")));

        registry
            .add_member(&owner, "Guild", Actor::dummy("late"))
            .unwrap();
        registry.create(&Actor::dummy("founder"), "Club").unwrap();
        let known = identities.known().unwrap();
        assert!(known.contains(&Actor::dummy("late")));
        assert!(known.contains(&Actor::dummy("founder")));
    }
}
