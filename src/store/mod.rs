//! Mail storage
//!
//! A [`MailStore`] owns drafts and sent mail. Two backends implement it:
//!
//! - [`FileMailStore`]: one YAML file per sent mail, with a full in-memory
//!   index built in the background at startup
//! - [`SqliteMailStore`]: a relational database, always ready
//!
//! Both go through the same record mutators and the same sealing helper, so
//! callers observe identical results from either one.

pub mod filesystem;
mod layout;
pub mod query;
pub mod sqlite;

pub use filesystem::FileMailStore;
pub use query::MailQuery;
pub use sqlite::{SharedConnection, SqliteMailStore};

use crate::config::{BackendKind, PostboxConfig};
use crate::identity::IdentityRegistry;
use crate::model::{Actor, Location, MailLimits, MailRecord};
use crate::{MailError, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Expands a record's destinations into the concrete recipient set
pub trait RecipientResolver: Send + Sync {
    fn resolve_total(&self, record: &MailRecord) -> BTreeSet<Actor>;
}

/// Resolver that only knows direct recipients
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectOnly;

impl RecipientResolver for DirectOnly {
    fn resolve_total(&self, record: &MailRecord) -> BTreeSet<Actor> {
        record.recipients().iter().cloned().collect()
    }
}

/// Update applied to a record in place
pub type Mutation<'a> = &'a mut dyn FnMut(&mut MailRecord) -> Result<()>;

pub trait MailStore: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Whether operations can be served (the file backend loads first)
    fn is_ready(&self) -> bool;

    fn limits(&self) -> &MailLimits;

    /// Actors known to this store
    fn identities(&self) -> Arc<dyn IdentityRegistry>;

    // ------------------------------------------------------------------
    // Drafts
    // ------------------------------------------------------------------

    /// The sender's draft, created empty if there is none
    fn create_draft(&self, sender: &Actor) -> Result<MailRecord>;

    fn draft(&self, sender: &Actor) -> Result<Option<MailRecord>>;

    /// Edit the sender's draft
    ///
    /// The update runs on a copy; nothing is stored if it fails or breaks a
    /// limit.
    fn mutate_draft(&self, sender: &Actor, update: Mutation<'_>) -> Result<MailRecord>;

    fn discard_draft(&self, sender: &Actor) -> Result<bool>;

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send the sender's draft and delete it
    fn send(
        &self,
        sender: &Actor,
        resolver: &dyn RecipientResolver,
        origin: Option<Location>,
    ) -> Result<MailRecord>;

    /// Send a mail that was built outside the sender's draft
    fn deliver(
        &self,
        record: MailRecord,
        resolver: &dyn RecipientResolver,
        origin: Option<Location>,
    ) -> Result<MailRecord>;

    // ------------------------------------------------------------------
    // Sent mail
    // ------------------------------------------------------------------

    fn get(&self, id: u64) -> Result<MailRecord>;

    /// Sent mail matching a query, newest first
    fn query(&self, query: &MailQuery) -> Result<Vec<MailRecord>>;

    fn inbox(&self, actor: &Actor) -> Result<Vec<MailRecord>> {
        self.query(&MailQuery::Inbox(actor.clone()))
    }

    fn unread(&self, actor: &Actor) -> Result<Vec<MailRecord>> {
        self.query(&MailQuery::Unread(actor.clone()))
    }

    fn outbox(&self, actor: &Actor) -> Result<Vec<MailRecord>> {
        self.query(&MailQuery::Outbox(actor.clone()))
    }

    fn trashbox(&self, actor: &Actor) -> Result<Vec<MailRecord>> {
        self.query(&MailQuery::Trash(actor.clone()))
    }

    fn related(&self, actor: &Actor) -> Result<Vec<MailRecord>> {
        self.query(&MailQuery::Related(actor.clone()))
    }

    /// Apply an update to a sent mail and persist it
    fn mutate(&self, id: u64, update: Mutation<'_>) -> Result<MailRecord>;

    fn delete(&self, id: u64) -> Result<bool>;

    /// Delete sent mail older than `cutoff`; returns how many were removed
    fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    fn delete_older_than(&self, days: u32) -> Result<usize> {
        self.delete_sent_before(truncate_millis(
            Utc::now() - Duration::days(i64::from(days)),
        ))
    }

    /// Highest id allocated so far (0 when empty)
    fn latest_id(&self) -> Result<u64>;

    /// Sent mail with an id above `id`, oldest first
    fn sent_after(&self, id: u64) -> Result<Vec<MailRecord>>;

    /// Every sent mail, oldest first
    fn all_sent(&self) -> Result<Vec<MailRecord>>;

    /// Store a sent mail under its existing id (used by migration)
    fn import(&self, record: &MailRecord) -> Result<()>;

    /// Persist anything held only in memory
    fn flush(&self) -> Result<()>;
}

/// Open the backend selected in the configuration
///
/// The file backend is returned still loading; call
/// [`FileMailStore::spawn_load`] or [`FileMailStore::load`] on it.
pub fn open_configured(config: &PostboxConfig) -> Result<OpenedStore> {
    match config.storage.backend {
        BackendKind::Files => {
            let store = Arc::new(FileMailStore::open(
                &config.storage.data_dir,
                config.limits,
            )?);
            Ok(OpenedStore::Files(store))
        }
        BackendKind::Sqlite => {
            let conn = sqlite::open_shared(&config.storage.database, config.storage.wal_mode)?;
            Ok(OpenedStore::Sqlite(Arc::new(SqliteMailStore::new(
                conn,
                config.limits,
            ))))
        }
    }
}

/// A freshly opened store, by backend
pub enum OpenedStore {
    Files(Arc<FileMailStore>),
    Sqlite(Arc<SqliteMailStore>),
}

impl OpenedStore {
    pub fn as_store(&self) -> Arc<dyn MailStore> {
        match self {
            OpenedStore::Files(store) => store.clone(),
            OpenedStore::Sqlite(store) => store.clone(),
        }
    }

    /// Connection to share with the group storage, if relational
    pub fn connection(&self) -> Option<SharedConnection> {
        match self {
            OpenedStore::Files(_) => None,
            OpenedStore::Sqlite(store) => Some(store.connection()),
        }
    }
}

// ----------------------------------------------------------------------
// Helpers shared by both backends
// ----------------------------------------------------------------------

/// How often `send` re-reads a draft that changed while recipients were
/// being resolved
pub(crate) const SEND_ATTEMPTS: usize = 3;

/// Drop everything below the millisecond, the precision both backends store
pub(crate) fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

pub(crate) fn now_millis() -> DateTime<Utc> {
    truncate_millis(Utc::now())
}

/// Turn a draft into a sent mail with the given id
///
/// `total` is the resolved recipient set. It is computed before any storage
/// lock is taken, since resolving may read the identity registry.
pub(crate) fn seal_draft(
    draft: MailRecord,
    id: u64,
    limits: &MailLimits,
    total: BTreeSet<Actor>,
    origin: Option<Location>,
) -> Result<MailRecord> {
    if draft.is_sent() {
        return Err(MailError::Validation(
            crate::model::ValidationError::AlreadySent(draft.id()),
        ));
    }
    if !draft.has_destination() {
        return Err(crate::model::ValidationError::EmptyRecipients.into());
    }
    limits.check(&draft)?;

    let sealed = draft.seal(id, total, now_millis(), origin)?;
    Ok(sealed)
}

/// Run an update on a copy of a draft, then re-check the limits
pub(crate) fn apply_draft_update(
    draft: &MailRecord,
    limits: &MailLimits,
    update: Mutation<'_>,
) -> Result<MailRecord> {
    let mut copy = draft.clone();
    update(&mut copy)?;
    if copy.is_sent() {
        return Err(crate::model::ValidationError::AlreadySent(copy.id()).into());
    }
    limits.check(&copy)?;
    Ok(copy)
}

/// Run an update on a copy of a sent mail
pub(crate) fn apply_update(mail: &MailRecord, update: Mutation<'_>) -> Result<MailRecord> {
    let mut copy = mail.clone();
    update(&mut copy)?;
    Ok(copy)
}

/// Every actor a record mentions
pub(crate) fn actors_of(record: &MailRecord) -> Vec<&Actor> {
    let mut actors = vec![record.sender()];
    actors.extend(record.recipients());
    if let Some(total) = record.total_recipients() {
        actors.extend(total);
    }
    actors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ItemStack, Price};

    #[test]
    fn test_seal_draft_checks_limits_first() {
        let limits = MailLimits {
            max_recipients: 1,
            ..Default::default()
        };
        let draft = MailRecord::builder(Actor::Console)
            .to(Actor::dummy("a"))
            .to(Actor::dummy("b"))
            .build();
        let total = DirectOnly.resolve_total(&draft);
        let err = seal_draft(draft, 1, &limits, total, None).unwrap_err();
        assert!(matches!(err, MailError::Validation(_)));
    }

    #[test]
    fn test_seal_draft_truncates_to_millis() {
        let draft = MailRecord::builder(Actor::Console)
            .to(Actor::dummy("a"))
            .attach(ItemStack::new("stone", 1))
            .price(Price::Money(3))
            .build();
        let total = DirectOnly.resolve_total(&draft);
        let sent = seal_draft(draft, 7, &MailLimits::default(), total, None).unwrap();
        let at = sent.sent_at().unwrap();
        assert_eq!(at.timestamp_subsec_nanos() % 1_000_000, 0);
        assert_eq!(sent.price(), &Price::Money(3));
    }

    #[test]
    fn test_truncate_millis_drops_sub_millisecond_part() {
        let at = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let cut = truncate_millis(at);
        assert_eq!(cut.timestamp_millis(), at.timestamp_millis());
        assert_eq!(cut.timestamp_subsec_nanos(), 123_000_000);
        assert!(cut <= at);
    }

    #[test]
    fn test_failed_draft_update_leaves_original() {
        let draft = MailRecord::draft(Actor::Console);
        let limits = MailLimits {
            max_body_lines: 1,
            ..Default::default()
        };
        let result = apply_draft_update(&draft, &limits, &mut |d| {
            d.push_line("one")?;
            d.push_line("two")?;
            Ok(())
        });
        assert!(result.is_err());
        assert!(draft.body().is_empty());
    }
}
