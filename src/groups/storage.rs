//! Group persistence
//!
//! The file backend keeps every group in one `groups.yml`; the relational
//! backend uses the `groups` and `group_members` tables next to the mail.

use crate::identity::registry::intern_sender;
use crate::model::{Actor, Group, GroupMode};
use crate::store::sqlite::{lock, SharedConnection};
use crate::{MailError, Result};
use rusqlite::params;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait GroupStorage: Send + Sync {
    fn load_all(&self) -> Result<Vec<Group>>;

    /// Insert or replace a group with its members
    fn save(&self, group: &Group) -> Result<()>;

    /// Remove a group (name is case-insensitive)
    fn remove(&self, name: &str) -> Result<()>;
}

/// All groups in one YAML file
pub struct YamlGroupStorage {
    path: PathBuf,
    // Serializes read-modify-write cycles on the file
    write_lock: Mutex<()>,
}

impl YamlGroupStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Storage at `<data_dir>/groups.yml`
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(crate::store::filesystem::GROUPS_FILE))
    }

    fn read(&self) -> Result<Vec<Group>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_yaml::from_str(&content)?)
    }

    fn write(&self, groups: &[Group]) -> Result<()> {
        let yaml = serde_yaml::to_string(groups)?;
        crate::store::filesystem::write_atomic(&self.path, &yaml)
    }

    fn modify(&self, f: impl FnOnce(&mut Vec<Group>)) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| MailError::Storage("group file lock poisoned".to_string()))?;
        let mut groups = self.read()?;
        f(&mut groups);
        self.write(&groups)
    }
}

impl GroupStorage for YamlGroupStorage {
    fn load_all(&self) -> Result<Vec<Group>> {
        self.read()
    }

    fn save(&self, group: &Group) -> Result<()> {
        self.modify(|groups| {
            match groups.iter_mut().find(|g| g.key() == group.key()) {
                Some(existing) => *existing = group.clone(),
                None => groups.push(group.clone()),
            }
        })
    }

    fn remove(&self, name: &str) -> Result<()> {
        let key = crate::model::group::group_key(name);
        self.modify(|groups| groups.retain(|g| g.key() != key))
    }
}

/// Groups in the relational database
pub struct SqliteGroupStorage {
    conn: SharedConnection,
}

impl SqliteGroupStorage {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }
}

fn mode_from_column(value: i64) -> Result<GroupMode> {
    GroupMode::from_i64(value)
        .ok_or_else(|| MailError::Storage(format!("unknown group mode {}", value)))
}

impl GroupStorage for SqliteGroupStorage {
    fn load_all(&self) -> Result<Vec<Group>> {
        let conn = lock(&self.conn)?;

        let mut stmt = conn.prepare(
            "SELECT g.name, s.token, g.send_mode, g.modify_mode, g.dissolution_mode
             FROM groups g JOIN senders s ON s.id = g.owner
             ORDER BY g.name",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut members_stmt = conn.prepare(
            "SELECT s.token FROM group_members m JOIN senders s ON s.id = m.member
             WHERE m.group_name = ?1",
        )?;

        let mut groups = Vec::with_capacity(rows.len());
        for (name, owner, send, modify, dissolve) in rows {
            let owner: Actor = owner.parse()?;
            let tokens = members_stmt
                .query_map(params![name], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut group = Group::new(name, owner).with_modes(
                mode_from_column(send)?,
                mode_from_column(modify)?,
                mode_from_column(dissolve)?,
            );
            for token in tokens {
                group.members.insert(token.parse()?);
            }
            groups.push(group);
        }
        Ok(groups)
    }

    fn save(&self, group: &Group) -> Result<()> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;

        let owner = intern_sender(&tx, &group.owner)?;
        tx.execute(
            "INSERT INTO groups (name, owner, send_mode, modify_mode, dissolution_mode)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET
                 owner = excluded.owner,
                 send_mode = excluded.send_mode,
                 modify_mode = excluded.modify_mode,
                 dissolution_mode = excluded.dissolution_mode",
            params![
                group.name,
                owner,
                group.send_mode.as_i64(),
                group.modify_mode.as_i64(),
                group.dissolution_mode.as_i64()
            ],
        )?;

        tx.execute(
            "DELETE FROM group_members WHERE group_name = ?1",
            params![group.name],
        )?;
        for member in &group.members {
            let member = intern_sender(&tx, member)?;
            tx.execute(
                "INSERT INTO group_members (group_name, member) VALUES (?1, ?2)",
                params![group.name, member],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute("DELETE FROM groups WHERE name = ?1", params![name])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::open_in_memory;
    use tempfile::TempDir;

    fn sample() -> Group {
        Group::new("Guild", Actor::dummy("owner"))
            .with_member(Actor::dummy("b"))
            .with_member(Actor::dummy("c"))
            .with_modes(GroupMode::Everyone, GroupMode::Members, GroupMode::Operator)
    }

    fn check_storage(storage: &dyn GroupStorage) {
        assert!(storage.load_all().unwrap().is_empty());

        let mut group = sample();
        storage.save(&group).unwrap();
        assert_eq!(storage.load_all().unwrap(), vec![group.clone()]);

        group.members.remove(&Actor::dummy("c"));
        storage.save(&group).unwrap();
        let loaded = storage.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].members.len(), 1);

        storage.remove("GUILD").unwrap();
        assert!(storage.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_yaml_storage() {
        let dir = TempDir::new().unwrap();
        check_storage(&YamlGroupStorage::in_dir(dir.path()));
        assert!(dir.path().join("groups.yml").exists());
    }

    #[test]
    fn test_sqlite_storage() {
        check_storage(&SqliteGroupStorage::new(open_in_memory().unwrap()));
    }
}
