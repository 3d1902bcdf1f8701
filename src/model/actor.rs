//! Mail actors
//!
//! An actor is anything that can send or receive mail: a player, the server
//! console, a command block placed in the world, or a synthetic dummy sender
//! used for announcements.
//!
//! # Token Format
//!
//! Actors persist as compact text tokens:
//!
//! - `player:<uuid>` - A player, identified by their account id
//! - `console` - The server console
//! - `block:<name>@<world>:<x>:<y>:<z>` - A command block
//! - `dummy:<name>` - A synthetic sender
//!
//! # Examples
//!
//! ```
//! use postbox::model::Actor;
//!
//! let console: Actor = "console".parse().unwrap();
//! assert!(console.is_console());
//!
//! let dummy = Actor::dummy("Server News");
//! assert_eq!(dummy.to_string(), "dummy:Server News");
//! ```

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Error type for actor token parsing
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActorError {
    #[error("invalid actor token: '{0}'")]
    InvalidToken(String),

    #[error("invalid player id: '{0}'")]
    InvalidPlayerId(String),

    #[error("invalid block location: '{0}'")]
    InvalidLocation(String),

    #[error("actor name cannot be empty")]
    EmptyName,
}

/// Integer coordinates of a block in a world
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockPos {
    pub world: String,
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl BlockPos {
    pub fn new(world: impl Into<String>, x: i64, y: i64, z: i64) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
        }
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.world, self.x, self.y, self.z)
    }
}

impl FromStr for BlockPos {
    type Err = ActorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // World names may contain ':' so split coordinates from the right
        let mut parts = s.rsplitn(4, ':');
        let z = parts.next();
        let y = parts.next();
        let x = parts.next();
        let world = parts.next();

        match (world, x, y, z) {
            (Some(world), Some(x), Some(y), Some(z)) if !world.is_empty() => {
                let coord = |v: &str| {
                    v.parse::<i64>()
                        .map_err(|_| ActorError::InvalidLocation(s.to_string()))
                };
                Ok(Self::new(world, coord(x)?, coord(y)?, coord(z)?))
            }
            _ => Err(ActorError::InvalidLocation(s.to_string())),
        }
    }
}

/// A participant in the mail system
///
/// Equality, ordering and hashing follow the actor's identity only: players
/// compare by account id, blocks by position and dummies by name. A block
/// that was renamed is still the same block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Actor {
    /// A player account
    Player(Uuid),

    /// The server console
    Console,

    /// A command block in the world
    Block { name: String, pos: BlockPos },

    /// A synthetic sender with no backing account
    Dummy(String),
}

/// Identity key used for comparisons
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActorKey<'a> {
    Console,
    Player(&'a Uuid),
    Block(&'a BlockPos),
    Dummy(&'a str),
}

/// Actor kind, as stored in the relational `senders` table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActorKind {
    Player,
    Console,
    Block,
    Dummy,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorKind::Player => "player",
            ActorKind::Console => "console",
            ActorKind::Block => "block",
            ActorKind::Dummy => "dummy",
        }
    }
}

impl Actor {
    /// Create a player actor
    pub fn player(id: Uuid) -> Self {
        Actor::Player(id)
    }

    /// Create a command block actor
    pub fn block(name: impl Into<String>, pos: BlockPos) -> Self {
        Actor::Block {
            name: name.into(),
            pos,
        }
    }

    /// Create a dummy actor
    pub fn dummy(name: impl Into<String>) -> Self {
        Actor::Dummy(name.into())
    }

    /// Identity key of this actor
    pub fn key(&self) -> ActorKey<'_> {
        match self {
            Actor::Player(id) => ActorKey::Player(id),
            Actor::Console => ActorKey::Console,
            Actor::Block { pos, .. } => ActorKey::Block(pos),
            Actor::Dummy(name) => ActorKey::Dummy(name),
        }
    }

    /// Identity key as text: account id, block position or dummy name
    ///
    /// Unique per [`ActorKind`]; unlike the full token it survives a block
    /// rename.
    pub fn identity(&self) -> String {
        match self {
            Actor::Player(id) => id.to_string(),
            Actor::Console => "console".to_string(),
            Actor::Block { pos, .. } => pos.to_string(),
            Actor::Dummy(name) => name.clone(),
        }
    }

    pub fn kind(&self) -> ActorKind {
        match self {
            Actor::Player(_) => ActorKind::Player,
            Actor::Console => ActorKind::Console,
            Actor::Block { .. } => ActorKind::Block,
            Actor::Dummy(_) => ActorKind::Dummy,
        }
    }

    pub fn is_player(&self) -> bool {
        matches!(self, Actor::Player(_))
    }

    pub fn is_console(&self) -> bool {
        matches!(self, Actor::Console)
    }

    /// Player id, if this actor is a player
    pub fn player_id(&self) -> Option<&Uuid> {
        match self {
            Actor::Player(id) => Some(id),
            _ => None,
        }
    }

    /// Human-readable name for display, without identity lookups
    pub fn display_name(&self) -> String {
        match self {
            Actor::Player(id) => id.to_string(),
            Actor::Console => "Console".to_string(),
            Actor::Block { name, .. } => name.clone(),
            Actor::Dummy(name) => name.clone(),
        }
    }

    /// Whether the actor can ever be online and receive notifications
    pub fn can_be_online(&self) -> bool {
        matches!(self, Actor::Player(_) | Actor::Console)
    }
}

impl PartialEq for Actor {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Actor {}

impl Hash for Actor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for Actor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Actor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl FromStr for Actor {
    type Err = ActorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "console" {
            return Ok(Actor::Console);
        }

        let (kind, rest) = s
            .split_once(':')
            .ok_or_else(|| ActorError::InvalidToken(s.to_string()))?;

        match kind {
            "player" => Uuid::parse_str(rest)
                .map(Actor::Player)
                .map_err(|_| ActorError::InvalidPlayerId(rest.to_string())),
            "block" => {
                // Names may contain '@'; positions never do
                let (name, pos) = rest
                    .rsplit_once('@')
                    .ok_or_else(|| ActorError::InvalidToken(s.to_string()))?;
                if name.is_empty() {
                    return Err(ActorError::EmptyName);
                }
                Ok(Actor::block(name, pos.parse()?))
            }
            "dummy" => {
                if rest.is_empty() {
                    return Err(ActorError::EmptyName);
                }
                Ok(Actor::dummy(rest))
            }
            _ => Err(ActorError::InvalidToken(s.to_string())),
        }
    }
}

impl TryFrom<String> for Actor {
    type Error = ActorError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Actor> for String {
    fn from(actor: Actor) -> Self {
        actor.to_string()
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Player(id) => write!(f, "player:{}", id),
            Actor::Console => write!(f, "console"),
            Actor::Block { name, pos } => write!(f, "block:{}@{}", name, pos),
            Actor::Dummy(name) => write!(f, "dummy:{}", name),
        }
    }
}

/// A precise position in a world, recorded as a mail's origin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub yaw: f32,
    #[serde(default)]
    pub pitch: f32,
}

impl Location {
    pub fn new(world: impl Into<String>, x: f64, y: f64, z: f64) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
            yaw: 0.0,
            pitch: 0.0,
        }
    }

    pub fn with_rotation(mut self, yaw: f32, pitch: f32) -> Self {
        self.yaw = yaw;
        self.pitch = pitch;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_player_token() {
        let id = Uuid::new_v4();
        let actor = Actor::player(id);
        let token = actor.to_string();
        assert_eq!(token, format!("player:{}", id));
        assert_eq!(token.parse::<Actor>().unwrap(), actor);
    }

    #[test]
    fn test_block_token_with_colon_in_world() {
        let actor: Actor = "block:Mailer@world:nether:10:-64:300".parse().unwrap();
        match &actor {
            Actor::Block { name, pos } => {
                assert_eq!(name, "Mailer");
                assert_eq!(pos.world, "world:nether");
                assert_eq!((pos.x, pos.y, pos.z), (10, -64, 300));
            }
            other => panic!("expected block, got {:?}", other),
        }
        assert_eq!(actor.to_string(), "block:Mailer@world:nether:10:-64:300");
    }

    #[test]
    fn test_block_name_with_at_sign() {
        let actor: Actor = "block:Post@Office@world:1:2:3".parse().unwrap();
        match &actor {
            Actor::Block { name, pos } => {
                assert_eq!(name, "Post@Office");
                assert_eq!(pos.world, "world");
                assert_eq!((pos.x, pos.y, pos.z), (1, 2, 3));
            }
            other => panic!("expected block, got {:?}", other),
        }

        let token = actor.to_string();
        assert_eq!(token, "block:Post@Office@world:1:2:3");
        let again: Actor = token.parse().unwrap();
        assert_eq!(again.display_name(), "Post@Office");
        assert_eq!(again, actor);
    }

    #[test]
    fn test_block_identity_ignores_name() {
        let pos = BlockPos::new("world", 1, 2, 3);
        let a = Actor::block("Old name", pos.clone());
        let b = Actor::block("New name", pos);
        assert_eq!(a, b);

        assert_eq!(a.identity(), b.identity());
        assert_eq!(a.identity(), "world:1:2:3");

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_invalid_tokens() {
        assert!(matches!(
            "nobody".parse::<Actor>(),
            Err(ActorError::InvalidToken(_))
        ));
        assert!(matches!(
            "player:not-a-uuid".parse::<Actor>(),
            Err(ActorError::InvalidPlayerId(_))
        ));
        assert!(matches!(
            "block:x@world:1:2".parse::<Actor>(),
            Err(ActorError::InvalidLocation(_))
        ));
        assert!(matches!("dummy:".parse::<Actor>(), Err(ActorError::EmptyName)));
    }

    #[test]
    fn test_serde_as_token() {
        let actor = Actor::dummy("Postmaster");
        let json = serde_json::to_string(&actor).unwrap();
        assert_eq!(json, "\"dummy:Postmaster\"");
        let parsed: Actor = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, actor);
    }
}
