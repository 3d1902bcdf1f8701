//! Address groups
//!
//! Static groups are owned by an actor and carry an explicit member list.
//! Dynamic groups are computed when a mail is sent and have no stored
//! membership.

use super::Actor;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Longest allowed static group name
pub const MAX_GROUP_NAME_LEN: usize = 32;

/// Name of the dynamic group containing every known actor
pub const ALL: &str = "All";

/// Name of the dynamic group containing every connected actor
pub const ALL_CONNECTED: &str = "All-Connected";

/// Name of the dynamic group containing every actor that ever connected
pub const ALL_EVER_LOGGED_IN: &str = "All-Ever-Logged-In";

/// Prefix of dynamic groups backed by an external permission group
pub const PERMISSION_GROUP_PREFIX: &str = "External-permission-group:";

/// Error type for group names
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GroupNameError {
    #[error("group name cannot be empty")]
    Empty,

    #[error("group name is longer than {MAX_GROUP_NAME_LEN} characters: '{0}'")]
    TooLong(String),

    #[error("group name contains invalid characters: '{0}'")]
    InvalidCharacters(String),

    #[error("group name is reserved: '{0}'")]
    Reserved(String),
}

/// Who may perform an action on a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum GroupMode {
    /// Only the owner
    OwnerOnly = 0,
    /// The owner and every member
    Members = 1,
    /// Anyone
    Everyone = 2,
    /// Actors holding the operator permission
    Operator = 3,
}

impl GroupMode {
    pub fn as_i64(self) -> i64 {
        self as u8 as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(GroupMode::OwnerOnly),
            1 => Some(GroupMode::Members),
            2 => Some(GroupMode::Everyone),
            3 => Some(GroupMode::Operator),
            _ => None,
        }
    }
}

impl fmt::Display for GroupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GroupMode::OwnerOnly => "owner",
            GroupMode::Members => "members",
            GroupMode::Everyone => "everyone",
            GroupMode::Operator => "operator",
        };
        f.write_str(name)
    }
}

/// A static, persisted address group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub owner: Actor,
    #[serde(default)]
    pub members: BTreeSet<Actor>,
    #[serde(rename = "sendMode")]
    pub send_mode: GroupMode,
    #[serde(rename = "modifyMode")]
    pub modify_mode: GroupMode,
    #[serde(rename = "dissolutionMode")]
    pub dissolution_mode: GroupMode,
}

impl Group {
    /// Create a group with default permission modes
    ///
    /// Members may send to the group; only the owner may modify or dissolve it.
    pub fn new(name: impl Into<String>, owner: Actor) -> Self {
        Self {
            name: name.into(),
            owner,
            members: BTreeSet::new(),
            send_mode: GroupMode::Members,
            modify_mode: GroupMode::OwnerOnly,
            dissolution_mode: GroupMode::OwnerOnly,
        }
    }

    pub fn with_member(mut self, member: Actor) -> Self {
        self.members.insert(member);
        self
    }

    pub fn with_modes(mut self, send: GroupMode, modify: GroupMode, dissolve: GroupMode) -> Self {
        self.send_mode = send;
        self.modify_mode = modify;
        self.dissolution_mode = dissolve;
        self
    }

    pub fn is_owner(&self, actor: &Actor) -> bool {
        &self.owner == actor
    }

    pub fn is_member(&self, actor: &Actor) -> bool {
        self.members.contains(actor)
    }

    /// Case-insensitive registry key
    pub fn key(&self) -> String {
        group_key(&self.name)
    }
}

/// A group whose membership is computed on demand
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DynamicGroup {
    /// Every known actor
    All,
    /// Every actor currently connected
    Connected,
    /// Every actor that ever connected
    EverLoggedIn,
    /// Members of an external permission group
    Permission(String),
}

impl DynamicGroup {
    /// Recognize a dynamic group name (case-insensitive)
    pub fn parse(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case(ALL) {
            return Some(DynamicGroup::All);
        }
        if name.eq_ignore_ascii_case(ALL_CONNECTED) {
            return Some(DynamicGroup::Connected);
        }
        if name.eq_ignore_ascii_case(ALL_EVER_LOGGED_IN) {
            return Some(DynamicGroup::EverLoggedIn);
        }

        let prefix_len = PERMISSION_GROUP_PREFIX.len();
        match name.get(..prefix_len) {
            Some(prefix) if prefix.eq_ignore_ascii_case(PERMISSION_GROUP_PREFIX) => {
                let group = &name[prefix_len..];
                if group.is_empty() {
                    None
                } else {
                    Some(DynamicGroup::Permission(group.to_string()))
                }
            }
            _ => None,
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, DynamicGroup::All)
    }
}

impl fmt::Display for DynamicGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DynamicGroup::All => f.write_str(ALL),
            DynamicGroup::Connected => f.write_str(ALL_CONNECTED),
            DynamicGroup::EverLoggedIn => f.write_str(ALL_EVER_LOGGED_IN),
            DynamicGroup::Permission(name) => write!(f, "{}{}", PERMISSION_GROUP_PREFIX, name),
        }
    }
}

/// Whether a recipient group entry names the "All" dynamic group
pub fn is_all_group(name: &str) -> bool {
    name.eq_ignore_ascii_case(ALL)
}

/// Case-insensitive key for a group name
pub fn group_key(name: &str) -> String {
    name.to_lowercase()
}

/// Validate the name of a new static group
pub fn validate_group_name(name: &str) -> Result<(), GroupNameError> {
    if name.is_empty() {
        return Err(GroupNameError::Empty);
    }
    if name.chars().count() > MAX_GROUP_NAME_LEN {
        return Err(GroupNameError::TooLong(name.to_string()));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(GroupNameError::InvalidCharacters(name.to_string()));
    }
    if DynamicGroup::parse(name).is_some() {
        return Err(GroupNameError::Reserved(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_group_parsing() {
        assert_eq!(DynamicGroup::parse("all"), Some(DynamicGroup::All));
        assert_eq!(
            DynamicGroup::parse("ALL-CONNECTED"),
            Some(DynamicGroup::Connected)
        );
        assert_eq!(
            DynamicGroup::parse("All-Ever-Logged-In"),
            Some(DynamicGroup::EverLoggedIn)
        );
        assert_eq!(
            DynamicGroup::parse("External-permission-group:Moderators"),
            Some(DynamicGroup::Permission("Moderators".to_string()))
        );
        assert_eq!(DynamicGroup::parse("External-permission-group:"), None);
        assert_eq!(DynamicGroup::parse("Guild"), None);
    }

    #[test]
    fn test_dynamic_group_display_round_trips() {
        for group in [
            DynamicGroup::All,
            DynamicGroup::Connected,
            DynamicGroup::EverLoggedIn,
            DynamicGroup::Permission("vip".to_string()),
        ] {
            assert_eq!(DynamicGroup::parse(&group.to_string()), Some(group));
        }
    }

    #[test]
    fn test_group_name_validation() {
        assert!(validate_group_name("Guild_Alpha-2").is_ok());
        assert_eq!(validate_group_name(""), Err(GroupNameError::Empty));
        assert!(matches!(
            validate_group_name("has space"),
            Err(GroupNameError::InvalidCharacters(_))
        ));
        assert!(matches!(
            validate_group_name("all"),
            Err(GroupNameError::Reserved(_))
        ));
        assert!(matches!(
            validate_group_name(&"x".repeat(MAX_GROUP_NAME_LEN + 1)),
            Err(GroupNameError::TooLong(_))
        ));
    }

    #[test]
    fn test_group_modes_serialize_as_integers() {
        let group = Group::new("Guild", Actor::Console);
        let yaml = serde_yaml::to_string(&group).unwrap();
        assert!(yaml.contains("sendMode: 1"));
        assert!(yaml.contains("modifyMode: 0"));
        let parsed: Group = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, group);
    }
}
