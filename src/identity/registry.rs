//! Identity registry
//!
//! Maps actors to stable integer ids so stores do not repeat actor data per
//! mail. The file backend keeps the registry in memory (rebuilt from the mail
//! files on load); the relational backend keeps it in the `senders` table.
//! Every interned actor is also "known", which is what the `All` dynamic
//! group expands to.

use crate::model::Actor;
use crate::store::sqlite::SharedConnection;
use crate::{MailError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

pub trait IdentityRegistry: Send + Sync {
    /// Id of the actor, assigning one on first sight
    fn intern(&self, actor: &Actor) -> Result<i64>;

    /// Id of the actor if it was interned before
    fn id_of(&self, actor: &Actor) -> Result<Option<i64>>;

    fn lookup(&self, id: i64) -> Result<Option<Actor>>;

    /// Every actor ever interned
    fn known(&self) -> Result<BTreeSet<Actor>>;
}

#[derive(Debug, Default)]
struct MemoryState {
    actors: Vec<Actor>,
    ids: HashMap<Actor, i64>,
}

/// In-memory registry used by the file backend
#[derive(Debug, Default)]
pub struct MemoryIdentityRegistry {
    state: RwLock<MemoryState>,
}

impl MemoryIdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern many actors at once
    pub fn extend<'a>(&self, actors: impl IntoIterator<Item = &'a Actor>) {
        if let Ok(mut state) = self.state.write() {
            for actor in actors {
                intern_locked(&mut state, actor);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.actors.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn intern_locked(state: &mut MemoryState, actor: &Actor) -> i64 {
    if let Some(id) = state.ids.get(actor).copied() {
        // Same identity under a new name (a renamed block)
        if let Some(stored) = state.actors.get_mut((id - 1) as usize) {
            if stored.display_name() != actor.display_name() {
                *stored = actor.clone();
            }
        }
        return id;
    }
    state.actors.push(actor.clone());
    let id = state.actors.len() as i64;
    state.ids.insert(actor.clone(), id);
    id
}

fn poisoned() -> MailError {
    MailError::Storage("identity registry lock poisoned".to_string())
}

impl IdentityRegistry for MemoryIdentityRegistry {
    fn intern(&self, actor: &Actor) -> Result<i64> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        Ok(intern_locked(&mut state, actor))
    }

    fn id_of(&self, actor: &Actor) -> Result<Option<i64>> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.ids.get(actor).copied())
    }

    fn lookup(&self, id: i64) -> Result<Option<Actor>> {
        let state = self.state.read().map_err(|_| poisoned())?;
        if id < 1 {
            return Ok(None);
        }
        Ok(state.actors.get((id - 1) as usize).cloned())
    }

    fn known(&self) -> Result<BTreeSet<Actor>> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.actors.iter().cloned().collect())
    }
}

/// Registry over the `senders` table of the relational backend
#[derive(Clone)]
pub struct SqliteIdentityRegistry {
    conn: SharedConnection,
}

impl SqliteIdentityRegistry {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }
}

impl IdentityRegistry for SqliteIdentityRegistry {
    fn intern(&self, actor: &Actor) -> Result<i64> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        intern_sender(&conn, actor)
    }

    fn id_of(&self, actor: &Actor) -> Result<Option<i64>> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        sender_id(&conn, actor)
    }

    fn lookup(&self, id: i64) -> Result<Option<Actor>> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        sender_by_id(&conn, id)
    }

    fn known(&self) -> Result<BTreeSet<Actor>> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        known_senders(&conn)
    }
}

// ----------------------------------------------------------------------
// SQL helpers shared with the relational mail store
// ----------------------------------------------------------------------

/// Id of the actor's `senders` row, inserting it if missing
///
/// Rows are keyed by kind and identity, so a renamed block keeps its row;
/// the stored token and name follow the latest one seen.
pub(crate) fn intern_sender(conn: &Connection, actor: &Actor) -> Result<i64> {
    let token = actor.to_string();
    let location = match actor {
        Actor::Block { pos, .. } => Some(pos.to_string()),
        _ => None,
    };

    let existing: Option<(i64, String)> = conn
        .query_row(
            "SELECT id, token FROM senders WHERE kind = ?1 AND identity = ?2",
            params![actor.kind().as_str(), actor.identity()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match existing {
        Some((id, stored)) if stored == token => Ok(id),
        Some((id, _)) => {
            conn.execute(
                "UPDATE senders SET token = ?1, name = ?2, location = ?3 WHERE id = ?4",
                params![token, actor.display_name(), location, id],
            )?;
            Ok(id)
        }
        None => {
            conn.execute(
                "INSERT INTO senders (token, kind, identity, name, location)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    token,
                    actor.kind().as_str(),
                    actor.identity(),
                    actor.display_name(),
                    location
                ],
            )?;
            Ok(conn.last_insert_rowid())
        }
    }
}

pub(crate) fn sender_id(conn: &Connection, actor: &Actor) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM senders WHERE kind = ?1 AND identity = ?2",
            params![actor.kind().as_str(), actor.identity()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

pub(crate) fn sender_by_id(conn: &Connection, id: i64) -> Result<Option<Actor>> {
    let token: Option<String> = conn
        .query_row(
            "SELECT token FROM senders WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    match token {
        Some(token) => Ok(Some(token.parse()?)),
        None => Ok(None),
    }
}

pub(crate) fn known_senders(conn: &Connection) -> Result<BTreeSet<Actor>> {
    let mut stmt = conn.prepare("SELECT token FROM senders")?;
    let tokens = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut actors = BTreeSet::new();
    for token in tokens {
        match token.parse::<Actor>() {
            Ok(actor) => {
                actors.insert(actor);
            }
            Err(e) => tracing::warn!(token = %token, "Skipping unreadable sender row: {}", e),
        }
    }
    Ok(actors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlockPos;
    use crate::store::sqlite::open_shared;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn sample_actors() -> Vec<Actor> {
        vec![
            Actor::player(Uuid::new_v4()),
            Actor::Console,
            Actor::block("Mailbox", BlockPos::new("world", 10, 64, -3)),
            Actor::dummy("Server News"),
        ]
    }

    fn check_registry(registry: &dyn IdentityRegistry) {
        let actors = sample_actors();
        let ids: Vec<i64> = actors.iter().map(|a| registry.intern(a).unwrap()).collect();

        for (actor, id) in actors.iter().zip(&ids) {
            assert_eq!(registry.intern(actor).unwrap(), *id);
            assert_eq!(registry.id_of(actor).unwrap(), Some(*id));
            assert_eq!(registry.lookup(*id).unwrap().as_ref(), Some(actor));
        }

        let renamed = Actor::block("Post Office", BlockPos::new("world", 10, 64, -3));
        assert_eq!(registry.intern(&renamed).unwrap(), ids[2]);
        assert_eq!(registry.id_of(&renamed).unwrap(), Some(ids[2]));
        let current = registry.lookup(ids[2]).unwrap().unwrap();
        assert_eq!(current.display_name(), "Post Office");

        let known = registry.known().unwrap();
        assert_eq!(known.len(), actors.len());
        assert!(registry.lookup(9999).unwrap().is_none());
        assert!(registry.id_of(&Actor::dummy("nobody")).unwrap().is_none());
    }

    #[test]
    fn test_memory_registry() {
        let registry = MemoryIdentityRegistry::new();
        check_registry(&registry);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_sqlite_registry() {
        let dir = TempDir::new().unwrap();
        let conn = open_shared(&dir.path().join("mail.db"), false).unwrap();
        let registry = SqliteIdentityRegistry::new(conn);
        check_registry(&registry);
    }
}
