//! Relational mail store
//!
//! Sent mail and drafts use parallel table families (`mail*` and
//! `draft_mail*`). Actors are stored once in `senders` and referenced by id.
//! Every child table cascades deletes and updates from its parent row, so
//! replacing or deleting a mail is a single statement on the parent.
//!
//! All statements are parameterized; actor tokens, group names and item
//! data never end up in SQL text.

use super::query::MailQuery;
use super::{
    apply_draft_update, apply_update, seal_draft, MailStore, Mutation, RecipientResolver,
    SEND_ATTEMPTS,
};
use crate::config::BackendKind;
use crate::identity::registry::{intern_sender, sender_id};
use crate::identity::{IdentityRegistry, SqliteIdentityRegistry};
use crate::metrics;
use crate::model::{Actor, ItemStack, Location, MailLimits, MailParts, MailRecord, Price};
use crate::model::ValidationError;
use crate::{MailError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

const BACKEND: &str = "sqlite";

/// Connection shared by the mail store, the group storage and the identity
/// registry
pub type SharedConnection = Arc<Mutex<Connection>>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS senders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    token TEXT NOT NULL,
    kind TEXT NOT NULL,
    identity TEXT NOT NULL,
    name TEXT NOT NULL,
    location TEXT,
    UNIQUE (kind, identity)
);

CREATE TABLE IF NOT EXISTS mail (
    id INTEGER PRIMARY KEY,
    sender INTEGER NOT NULL,
    message TEXT NOT NULL,
    cost_money INTEGER NOT NULL DEFAULT 0,
    cost_item TEXT,
    is_attachments_opened INTEGER NOT NULL DEFAULT 0,
    is_attachments_cancelled INTEGER NOT NULL DEFAULT 0,
    is_attachments_refused INTEGER NOT NULL DEFAULT 0,
    refused_reason TEXT,
    sent_at INTEGER NOT NULL,
    location TEXT,
    FOREIGN KEY (sender) REFERENCES senders(id) ON DELETE CASCADE ON UPDATE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_mail_sender ON mail(sender);
CREATE INDEX IF NOT EXISTS idx_mail_sent_at ON mail(sent_at);

CREATE TABLE IF NOT EXISTS mail_direct_recipients (
    mail_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    recipient INTEGER NOT NULL,
    PRIMARY KEY (mail_id, position),
    FOREIGN KEY (mail_id) REFERENCES mail(id) ON DELETE CASCADE ON UPDATE CASCADE,
    FOREIGN KEY (recipient) REFERENCES senders(id) ON DELETE CASCADE ON UPDATE CASCADE
);

CREATE TABLE IF NOT EXISTS mail_recipients (
    mail_id INTEGER NOT NULL,
    recipient INTEGER NOT NULL,
    is_read INTEGER NOT NULL DEFAULT 0,
    is_trash INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (mail_id, recipient),
    FOREIGN KEY (mail_id) REFERENCES mail(id) ON DELETE CASCADE ON UPDATE CASCADE,
    FOREIGN KEY (recipient) REFERENCES senders(id) ON DELETE CASCADE ON UPDATE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_mail_recipients_recipient ON mail_recipients(recipient);

CREATE TABLE IF NOT EXISTS mail_recipient_groups (
    mail_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    group_name TEXT NOT NULL,
    PRIMARY KEY (mail_id, position),
    FOREIGN KEY (mail_id) REFERENCES mail(id) ON DELETE CASCADE ON UPDATE CASCADE
);

CREATE TABLE IF NOT EXISTS mail_attachment_box (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mail_id INTEGER NOT NULL,
    item TEXT NOT NULL,
    FOREIGN KEY (mail_id) REFERENCES mail(id) ON DELETE CASCADE ON UPDATE CASCADE
);

CREATE TABLE IF NOT EXISTS mail_attachment_snapshot (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mail_id INTEGER NOT NULL,
    item TEXT NOT NULL,
    FOREIGN KEY (mail_id) REFERENCES mail(id) ON DELETE CASCADE ON UPDATE CASCADE
);

CREATE TABLE IF NOT EXISTS draft_mail (
    sender INTEGER PRIMARY KEY,
    message TEXT NOT NULL,
    cost_money INTEGER NOT NULL DEFAULT 0,
    cost_item TEXT,
    FOREIGN KEY (sender) REFERENCES senders(id) ON DELETE CASCADE ON UPDATE CASCADE
);

CREATE TABLE IF NOT EXISTS draft_mail_recipients (
    sender INTEGER NOT NULL,
    position INTEGER NOT NULL,
    recipient INTEGER NOT NULL,
    PRIMARY KEY (sender, position),
    FOREIGN KEY (sender) REFERENCES draft_mail(sender) ON DELETE CASCADE ON UPDATE CASCADE,
    FOREIGN KEY (recipient) REFERENCES senders(id) ON DELETE CASCADE ON UPDATE CASCADE
);

CREATE TABLE IF NOT EXISTS draft_mail_recipient_groups (
    sender INTEGER NOT NULL,
    position INTEGER NOT NULL,
    group_name TEXT NOT NULL,
    PRIMARY KEY (sender, position),
    FOREIGN KEY (sender) REFERENCES draft_mail(sender) ON DELETE CASCADE ON UPDATE CASCADE
);

CREATE TABLE IF NOT EXISTS draft_mail_attachment_box (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender INTEGER NOT NULL,
    item TEXT NOT NULL,
    FOREIGN KEY (sender) REFERENCES draft_mail(sender) ON DELETE CASCADE ON UPDATE CASCADE
);

CREATE TABLE IF NOT EXISTS groups (
    name TEXT PRIMARY KEY COLLATE NOCASE,
    owner INTEGER NOT NULL,
    send_mode INTEGER NOT NULL,
    modify_mode INTEGER NOT NULL,
    dissolution_mode INTEGER NOT NULL,
    FOREIGN KEY (owner) REFERENCES senders(id) ON DELETE CASCADE ON UPDATE CASCADE
);

CREATE TABLE IF NOT EXISTS group_members (
    group_name TEXT NOT NULL COLLATE NOCASE,
    member INTEGER NOT NULL,
    PRIMARY KEY (group_name, member),
    FOREIGN KEY (group_name) REFERENCES groups(name) ON DELETE CASCADE ON UPDATE CASCADE,
    FOREIGN KEY (member) REFERENCES senders(id) ON DELETE CASCADE ON UPDATE CASCADE
);
"#;

fn init_schema(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Open or create a database file
pub fn open_shared(path: &Path, wal_mode: bool) -> Result<SharedConnection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    info!(path = %path.display(), "Opening mail database");

    let conn = Connection::open(path)?;
    if wal_mode {
        conn.pragma_update(None, "journal_mode", "WAL")?;
    }
    init_schema(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Open a private in-memory database
pub fn open_in_memory() -> Result<SharedConnection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

pub(crate) fn lock(conn: &SharedConnection) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| MailError::Storage("database lock poisoned".to_string()))
}

/// Mail store over SQLite
pub struct SqliteMailStore {
    conn: SharedConnection,
    limits: MailLimits,
    identities: Arc<SqliteIdentityRegistry>,
}

impl SqliteMailStore {
    pub fn new(conn: SharedConnection, limits: MailLimits) -> Self {
        let identities = Arc::new(SqliteIdentityRegistry::new(conn.clone()));
        Self {
            conn,
            limits,
            identities,
        }
    }

    pub fn open(path: &Path, limits: MailLimits) -> Result<Self> {
        Ok(Self::new(open_shared(path, true)?, limits))
    }

    pub fn in_memory(limits: MailLimits) -> Result<Self> {
        Ok(Self::new(open_in_memory()?, limits))
    }

    /// Handle to the underlying connection
    pub fn connection(&self) -> SharedConnection {
        self.conn.clone()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        lock(&self.conn)
    }

    /// Seal a draft and write it in one transaction
    fn store_sealed(
        &self,
        conn: &mut Connection,
        draft: MailRecord,
        total: BTreeSet<Actor>,
        origin: Option<Location>,
        drop_draft_of: Option<&Actor>,
    ) -> Result<MailRecord> {
        let tx = conn.transaction()?;
        let id: i64 = tx.query_row("SELECT COALESCE(MAX(id), 0) + 1 FROM mail", [], |row| {
            row.get(0)
        })?;

        let sent = seal_draft(draft, id as u64, &self.limits, total, origin)?;
        save_sent(&tx, &sent)?;
        if let Some(sender) = drop_draft_of {
            delete_draft(&tx, sender)?;
        }
        tx.commit()?;
        Ok(sent)
    }
}

// ----------------------------------------------------------------------
// Row mapping
// ----------------------------------------------------------------------

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
    Ok(serde_json::from_str(text)?)
}

fn opt_json<T: serde::de::DeserializeOwned>(text: Option<String>) -> Result<Option<T>> {
    text.as_deref().map(from_json).transpose()
}

fn parse_actor(token: &str) -> Result<Actor> {
    Ok(token.parse()?)
}

fn item_json(price: &Price) -> Result<Option<String>> {
    price.item_price().map(to_json).transpose()
}

fn actor_list(conn: &Connection, sql: &str, key: i64) -> Result<Vec<Actor>> {
    let mut stmt = conn.prepare(sql)?;
    let tokens = stmt
        .query_map(params![key], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    tokens.iter().map(|t| parse_actor(t)).collect()
}

fn string_list(conn: &Connection, sql: &str, key: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let values = stmt
        .query_map(params![key], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(values)
}

fn item_list(conn: &Connection, sql: &str, key: i64) -> Result<Vec<ItemStack>> {
    string_list(conn, sql, key)?
        .iter()
        .map(|text| from_json(text))
        .collect()
}

fn millis_to_time(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| MailError::Storage(format!("invalid timestamp {}", millis)))
}

struct MailRow {
    sender: String,
    message: String,
    cost_money: i64,
    cost_item: Option<String>,
    opened: bool,
    cancelled: bool,
    refused: bool,
    refused_reason: Option<String>,
    sent_at: i64,
    location: Option<String>,
}

fn load_sent(conn: &Connection, id: u64) -> Result<Option<MailRecord>> {
    let key = id as i64;
    let row = conn
        .query_row(
            "SELECT s.token, m.message, m.cost_money, m.cost_item, m.is_attachments_opened,
                    m.is_attachments_cancelled, m.is_attachments_refused, m.refused_reason,
                    m.sent_at, m.location
             FROM mail m JOIN senders s ON s.id = m.sender
             WHERE m.id = ?1",
            params![key],
            |row| {
                Ok(MailRow {
                    sender: row.get(0)?,
                    message: row.get(1)?,
                    cost_money: row.get(2)?,
                    cost_item: row.get(3)?,
                    opened: row.get(4)?,
                    cancelled: row.get(5)?,
                    refused: row.get(6)?,
                    refused_reason: row.get(7)?,
                    sent_at: row.get(8)?,
                    location: row.get(9)?,
                })
            },
        )
        .optional()?;

    let row = match row {
        Some(row) => row,
        None => return Ok(None),
    };

    let mut total = BTreeSet::new();
    let mut read_by = BTreeSet::new();
    let mut trashed_by = BTreeSet::new();
    {
        let mut stmt = conn.prepare(
            "SELECT s.token, r.is_read, r.is_trash
             FROM mail_recipients r JOIN senders s ON s.id = r.recipient
             WHERE r.mail_id = ?1",
        )?;
        let flags = stmt
            .query_map(params![key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, bool>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (token, is_read, is_trash) in flags {
            let actor = parse_actor(&token)?;
            if is_read {
                read_by.insert(actor.clone());
            }
            if is_trash {
                trashed_by.insert(actor.clone());
            }
            total.insert(actor);
        }
    }

    let parts = MailParts {
        id,
        sender: Some(parse_actor(&row.sender)?),
        recipients: actor_list(
            conn,
            "SELECT s.token FROM mail_direct_recipients r JOIN senders s ON s.id = r.recipient
             WHERE r.mail_id = ?1 ORDER BY r.position",
            key,
        )?,
        recipient_groups: string_list(
            conn,
            "SELECT group_name FROM mail_recipient_groups WHERE mail_id = ?1 ORDER BY position",
            key,
        )?,
        total_recipients: Some(total),
        body: from_json(&row.message)?,
        attachments: item_list(
            conn,
            "SELECT item FROM mail_attachment_box WHERE mail_id = ?1 ORDER BY id",
            key,
        )?,
        attachments_original: item_list(
            conn,
            "SELECT item FROM mail_attachment_snapshot WHERE mail_id = ?1 ORDER BY id",
            key,
        )?,
        price: Price::from_columns(row.cost_money, opt_json(row.cost_item)?),
        read_by,
        trashed_by,
        attachments_opened: row.opened,
        attachments_cancelled: row.cancelled,
        attachments_refused: row.refused,
        refusal_reason: row.refused_reason,
        sent_at: Some(millis_to_time(row.sent_at)?),
        origin: opt_json(row.location)?,
    };
    MailRecord::from_parts(parts)
        .map(Some)
        .ok_or_else(|| MailError::Storage(format!("mail #{} has no sender", id)))
}

fn require_sent(conn: &Connection, id: u64) -> Result<MailRecord> {
    load_sent(conn, id)?.ok_or(MailError::NotFound(id))
}

/// Replace every row of a sent mail
fn save_sent(conn: &Connection, record: &MailRecord) -> Result<()> {
    let key = record.id() as i64;
    let sender = intern_sender(conn, record.sender())?;
    let sent_at = record
        .sent_at()
        .ok_or_else(|| MailError::Storage(format!("mail #{} has no send time", key)))?;

    conn.execute("DELETE FROM mail WHERE id = ?1", params![key])?;
    conn.execute(
        "INSERT INTO mail (id, sender, message, cost_money, cost_item, is_attachments_opened,
                           is_attachments_cancelled, is_attachments_refused, refused_reason,
                           sent_at, location)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            key,
            sender,
            to_json(&record.body())?,
            record.price().money_amount(),
            item_json(record.price())?,
            record.attachments_opened(),
            record.attachments_cancelled(),
            record.attachments_refused(),
            record.refusal_reason(),
            sent_at.timestamp_millis(),
            record.origin().map(to_json).transpose()?,
        ],
    )?;

    for (position, recipient) in record.recipients().iter().enumerate() {
        let recipient = intern_sender(conn, recipient)?;
        conn.execute(
            "INSERT INTO mail_direct_recipients (mail_id, position, recipient) VALUES (?1, ?2, ?3)",
            params![key, position as i64, recipient],
        )?;
    }
    for (position, group) in record.recipient_groups().iter().enumerate() {
        conn.execute(
            "INSERT INTO mail_recipient_groups (mail_id, position, group_name) VALUES (?1, ?2, ?3)",
            params![key, position as i64, group],
        )?;
    }
    if let Some(total) = record.total_recipients() {
        for actor in total {
            let recipient = intern_sender(conn, actor)?;
            conn.execute(
                "INSERT INTO mail_recipients (mail_id, recipient, is_read, is_trash)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    key,
                    recipient,
                    record.is_read_by(actor),
                    record.is_trashed_by(actor)
                ],
            )?;
        }
    }
    for stack in record.attachments() {
        conn.execute(
            "INSERT INTO mail_attachment_box (mail_id, item) VALUES (?1, ?2)",
            params![key, to_json(stack)?],
        )?;
    }
    for stack in record.attachments_original() {
        conn.execute(
            "INSERT INTO mail_attachment_snapshot (mail_id, item) VALUES (?1, ?2)",
            params![key, to_json(stack)?],
        )?;
    }
    Ok(())
}

fn load_draft(conn: &Connection, sender: &Actor) -> Result<Option<MailRecord>> {
    let key = match sender_id(conn, sender)? {
        Some(key) => key,
        None => return Ok(None),
    };

    let row = conn
        .query_row(
            "SELECT message, cost_money, cost_item FROM draft_mail WHERE sender = ?1",
            params![key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()?;
    let (message, cost_money, cost_item) = match row {
        Some(row) => row,
        None => return Ok(None),
    };

    let parts = MailParts {
        id: 0,
        sender: Some(sender.clone()),
        recipients: actor_list(
            conn,
            "SELECT s.token FROM draft_mail_recipients r JOIN senders s ON s.id = r.recipient
             WHERE r.sender = ?1 ORDER BY r.position",
            key,
        )?,
        recipient_groups: string_list(
            conn,
            "SELECT group_name FROM draft_mail_recipient_groups WHERE sender = ?1
             ORDER BY position",
            key,
        )?,
        body: from_json(&message)?,
        attachments: item_list(
            conn,
            "SELECT item FROM draft_mail_attachment_box WHERE sender = ?1 ORDER BY id",
            key,
        )?,
        price: Price::from_columns(cost_money, opt_json(cost_item)?),
        ..Default::default()
    };
    Ok(MailRecord::from_parts(parts))
}

/// Replace every row of a draft
fn save_draft(conn: &Connection, draft: &MailRecord) -> Result<()> {
    let key = intern_sender(conn, draft.sender())?;

    conn.execute("DELETE FROM draft_mail WHERE sender = ?1", params![key])?;
    conn.execute(
        "INSERT INTO draft_mail (sender, message, cost_money, cost_item) VALUES (?1, ?2, ?3, ?4)",
        params![
            key,
            to_json(&draft.body())?,
            draft.price().money_amount(),
            item_json(draft.price())?,
        ],
    )?;
    for (position, recipient) in draft.recipients().iter().enumerate() {
        let recipient = intern_sender(conn, recipient)?;
        conn.execute(
            "INSERT INTO draft_mail_recipients (sender, position, recipient) VALUES (?1, ?2, ?3)",
            params![key, position as i64, recipient],
        )?;
    }
    for (position, group) in draft.recipient_groups().iter().enumerate() {
        conn.execute(
            "INSERT INTO draft_mail_recipient_groups (sender, position, group_name)
             VALUES (?1, ?2, ?3)",
            params![key, position as i64, group],
        )?;
    }
    for stack in draft.attachments() {
        conn.execute(
            "INSERT INTO draft_mail_attachment_box (sender, item) VALUES (?1, ?2)",
            params![key, to_json(stack)?],
        )?;
    }
    Ok(())
}

fn delete_draft(conn: &Connection, sender: &Actor) -> Result<bool> {
    match sender_id(conn, sender)? {
        Some(key) => {
            let removed = conn.execute("DELETE FROM draft_mail WHERE sender = ?1", params![key])?;
            Ok(removed > 0)
        }
        None => Ok(false),
    }
}

fn query_sql(query: &MailQuery) -> &'static str {
    match query {
        MailQuery::Inbox(_) => {
            "SELECT m.id FROM mail m JOIN mail_recipients r ON r.mail_id = m.id
             WHERE r.recipient = ?1 AND r.is_trash = 0
             ORDER BY m.sent_at DESC, m.id DESC"
        }
        MailQuery::Unread(_) => {
            "SELECT m.id FROM mail m JOIN mail_recipients r ON r.mail_id = m.id
             WHERE r.recipient = ?1 AND r.is_trash = 0 AND r.is_read = 0
             ORDER BY m.sent_at DESC, m.id DESC"
        }
        MailQuery::Outbox(_) => {
            "SELECT m.id FROM mail m WHERE m.sender = ?1 ORDER BY m.sent_at DESC, m.id DESC"
        }
        MailQuery::Trash(_) => {
            "SELECT m.id FROM mail m JOIN mail_recipients r ON r.mail_id = m.id
             WHERE r.recipient = ?1 AND r.is_trash = 1
             ORDER BY m.sent_at DESC, m.id DESC"
        }
        MailQuery::Related(_) => {
            "SELECT m.id FROM mail m
             WHERE m.sender = ?1
                OR EXISTS (SELECT 1 FROM mail_recipients r
                           WHERE r.mail_id = m.id AND r.recipient = ?1)
             ORDER BY m.sent_at DESC, m.id DESC"
        }
    }
}

fn ids(conn: &Connection, sql: &str, param: i64) -> Result<Vec<u64>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(params![param], |row| row.get::<_, i64>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids.into_iter().map(|id| id as u64).collect())
}

fn load_many(conn: &Connection, ids: Vec<u64>) -> Result<Vec<MailRecord>> {
    let mut mails = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(mail) = load_sent(conn, id)? {
            mails.push(mail);
        }
    }
    Ok(mails)
}

impl MailStore for SqliteMailStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn limits(&self) -> &MailLimits {
        &self.limits
    }

    fn identities(&self) -> Arc<dyn IdentityRegistry> {
        self.identities.clone()
    }

    fn create_draft(&self, sender: &Actor) -> Result<MailRecord> {
        let mut conn = self.lock()?;
        if let Some(draft) = load_draft(&conn, sender)? {
            return Ok(draft);
        }
        let draft = MailRecord::draft(sender.clone());
        let tx = conn.transaction()?;
        save_draft(&tx, &draft)?;
        tx.commit()?;
        Ok(draft)
    }

    fn draft(&self, sender: &Actor) -> Result<Option<MailRecord>> {
        let conn = self.lock()?;
        load_draft(&conn, sender)
    }

    fn mutate_draft(&self, sender: &Actor, update: Mutation<'_>) -> Result<MailRecord> {
        let mut conn = self.lock()?;
        let current = load_draft(&conn, sender)?
            .ok_or_else(|| MailError::DraftNotFound(sender.to_string()))?;
        let updated = apply_draft_update(&current, &self.limits, update)?;

        let tx = conn.transaction()?;
        save_draft(&tx, &updated)?;
        tx.commit()?;
        Ok(updated)
    }

    fn discard_draft(&self, sender: &Actor) -> Result<bool> {
        let conn = self.lock()?;
        delete_draft(&conn, sender)
    }

    fn send(
        &self,
        sender: &Actor,
        resolver: &dyn RecipientResolver,
        origin: Option<Location>,
    ) -> Result<MailRecord> {
        // Resolving may read the identity registry, which shares this
        // connection, so it runs without the lock held.
        let mut draft = self
            .draft(sender)?
            .ok_or_else(|| MailError::DraftNotFound(sender.to_string()))?;

        for _ in 0..SEND_ATTEMPTS {
            let total = resolver.resolve_total(&draft);

            let mut conn = self.lock()?;
            let current = load_draft(&conn, sender)?
                .ok_or_else(|| MailError::DraftNotFound(sender.to_string()))?;
            if current != draft {
                debug!(from = %sender, "Draft changed while resolving recipients");
                draft = current;
                continue;
            }

            let sent = self
                .store_sealed(&mut conn, draft, total, origin, Some(sender))
                .inspect_err(|e| {
                    if e.is_persistence() {
                        warn!(from = %sender, "Failed to store mail: {}", e);
                    }
                })?;

            info!(mail_id = sent.id(), from = %sender, "Mail sent");
            metrics::record_sent(BACKEND, "draft");
            return Ok(sent);
        }

        Err(MailError::Storage(format!(
            "draft of {} kept changing while sending",
            sender
        )))
    }

    fn deliver(
        &self,
        record: MailRecord,
        resolver: &dyn RecipientResolver,
        origin: Option<Location>,
    ) -> Result<MailRecord> {
        let total = resolver.resolve_total(&record);
        let mut conn = self.lock()?;
        let sent = self.store_sealed(&mut conn, record, total, origin, None)?;
        debug!(mail_id = sent.id(), from = %sent.sender(), "Mail delivered");
        metrics::record_sent(BACKEND, "direct");
        Ok(sent)
    }

    fn get(&self, id: u64) -> Result<MailRecord> {
        let conn = self.lock()?;
        require_sent(&conn, id)
    }

    fn query(&self, query: &MailQuery) -> Result<Vec<MailRecord>> {
        let conn = self.lock()?;
        let actor = match sender_id(&conn, query.actor())? {
            Some(id) => id,
            None => return Ok(Vec::new()),
        };
        let found = ids(&conn, query_sql(query), actor)?;
        load_many(&conn, found)
    }

    fn mutate(&self, id: u64, update: Mutation<'_>) -> Result<MailRecord> {
        let mut conn = self.lock()?;
        let current = require_sent(&conn, id)?;
        let updated = apply_update(&current, update)?;
        if updated.id() != id {
            return Err(MailError::Storage(format!(
                "update changed the id of mail #{}",
                id
            )));
        }

        let tx = conn.transaction()?;
        save_sent(&tx, &updated)?;
        tx.commit()
            .inspect_err(|e| warn!(mail_id = id, "Failed to update mail: {}", e))?;
        Ok(updated)
    }

    fn delete(&self, id: u64) -> Result<bool> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM mail WHERE id = ?1", params![id as i64])?;
        if removed > 0 {
            debug!(mail_id = id, "Mail deleted");
        }
        Ok(removed > 0)
    }

    fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM mail WHERE sent_at < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(removed)
    }

    fn latest_id(&self) -> Result<u64> {
        let conn = self.lock()?;
        let id: i64 = conn.query_row("SELECT COALESCE(MAX(id), 0) FROM mail", [], |row| {
            row.get(0)
        })?;
        Ok(id as u64)
    }

    fn sent_after(&self, id: u64) -> Result<Vec<MailRecord>> {
        let conn = self.lock()?;
        let found = ids(
            &conn,
            "SELECT id FROM mail WHERE id > ?1 ORDER BY id",
            id as i64,
        )?;
        load_many(&conn, found)
    }

    fn all_sent(&self) -> Result<Vec<MailRecord>> {
        self.sent_after(0)
    }

    fn import(&self, record: &MailRecord) -> Result<()> {
        if record.is_draft() {
            return Err(ValidationError::NotSent.into());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        save_sent(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        // Drafts are written on every change
        Ok(())
    }
}
