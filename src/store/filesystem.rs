//! File-based mail store
//!
//! Sent mail lives in one YAML file per mail (see the layout module); drafts
//! live in memory and are written to `drafts.yml` only at shutdown. On
//! startup the whole mail directory is read into an in-memory index. Until
//! that finishes every operation fails with [`MailError::NotReady`].
//!
//! Writes go to disk first. The index is only updated once the file is in
//! place, so a failed write never leaves memory ahead of disk.

use super::layout::{self, DraftsFile, MailFile, DRAFTS_FILE, MAIL_DIR};
pub use super::layout::{write_atomic, GROUPS_FILE};
use super::query::newest_first;
use super::{
    actors_of, apply_draft_update, apply_update, seal_draft, truncate_millis, MailQuery,
    MailStore, Mutation, RecipientResolver, SEND_ATTEMPTS,
};
use crate::config::BackendKind;
use crate::identity::{IdentityRegistry, MemoryIdentityRegistry};
use crate::metrics;
use crate::model::{Actor, Location, MailLimits, MailRecord, ValidationError};
use crate::{MailError, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const BACKEND: &str = "files";

/// Load phase of the index
#[derive(Debug)]
enum LoadState {
    Loading,
    Ready(Index),
    Failed(String),
}

#[derive(Debug, Default)]
struct Index {
    mails: BTreeMap<u64, MailRecord>,
    drafts: HashMap<Actor, MailRecord>,
}

impl Index {
    fn next_id(&self) -> u64 {
        self.mails.keys().next_back().copied().unwrap_or(0) + 1
    }
}

/// Mail store over a directory of YAML files
pub struct FileMailStore {
    root: PathBuf,
    mail_dir: PathBuf,
    limits: MailLimits,
    state: RwLock<LoadState>,
    identities: Arc<MemoryIdentityRegistry>,
}

impl FileMailStore {
    /// Open a store rooted at `root`, in the loading state
    pub fn open(root: impl AsRef<Path>, limits: MailLimits) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let mail_dir = root.join(MAIL_DIR);
        fs::create_dir_all(&mail_dir)?;

        Ok(Self {
            root,
            mail_dir,
            limits,
            state: RwLock::new(LoadState::Loading),
            identities: Arc::new(MemoryIdentityRegistry::new()),
        })
    }

    /// Open and load synchronously
    pub fn open_loaded(root: impl AsRef<Path>, limits: MailLimits) -> Result<Self> {
        let store = Self::open(root, limits)?;
        store.load()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Build the index from disk
    ///
    /// Does nothing if the index is already built.
    pub fn load(&self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }

        let started = Instant::now();
        let result = self.build_index();
        let mut state = self.write_state()?;
        if matches!(*state, LoadState::Ready(_)) {
            return Ok(());
        }

        match result {
            Ok(index) => {
                info!(
                    mails = index.mails.len(),
                    drafts = index.drafts.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Mail index loaded"
                );
                metrics::record_load_duration(BACKEND, started.elapsed().as_secs_f64());
                *state = LoadState::Ready(index);
                Ok(())
            }
            Err(e) => {
                warn!(root = %self.root.display(), "Failed to load mail index: {}", e);
                *state = LoadState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Build the index on a blocking worker thread
    pub fn spawn_load(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.load())
    }

    fn build_index(&self) -> Result<Index> {
        let mut index = Index::default();

        for entry in fs::read_dir(&self.mail_dir)? {
            let path = entry?.path();
            if layout::parse_mail_file_name(&path).is_none() {
                continue;
            }
            match layout::read_mail(&path) {
                Ok(record) if record.is_sent() => {
                    index.mails.insert(record.id(), record);
                }
                Ok(_) => warn!(path = %path.display(), "Skipping unsent mail file"),
                // Log but don't fail on individual mail errors
                Err(e) => warn!(path = %path.display(), "Failed to read mail: {}", e),
            }
        }

        index.drafts = self.take_drafts_file()?;

        for record in index.mails.values().chain(index.drafts.values()) {
            self.identities.extend(actors_of(record));
        }

        Ok(index)
    }

    /// Read the drafts file and remove it
    fn take_drafts_file(&self) -> Result<HashMap<Actor, MailRecord>> {
        let path = self.root.join(DRAFTS_FILE);
        let mut drafts = HashMap::new();
        if !path.exists() {
            return Ok(drafts);
        }

        let content = fs::read_to_string(&path)?;
        let parsed: std::result::Result<DraftsFile, _> = serde_yaml::from_str(&content);
        match parsed {
            Ok(file) => {
                for (token, entry) in file {
                    match entry.into_record() {
                        Ok(draft) if draft.is_draft() => {
                            if draft.sender().to_string() != token {
                                debug!(token = %token, "Draft key does not match its sender");
                            }
                            drafts.insert(draft.sender().clone(), draft);
                        }
                        Ok(_) => warn!(token = %token, "Skipping sent mail in drafts file"),
                        Err(e) => warn!(token = %token, "Failed to read draft: {}", e),
                    }
                }
                fs::remove_file(&path)?;
            }
            Err(e) => {
                let broken = self.root.join(format!("{}.broken", DRAFTS_FILE));
                warn!(
                    path = %path.display(),
                    moved_to = %broken.display(),
                    "Unreadable drafts file: {}",
                    e
                );
                fs::rename(&path, &broken)?;
            }
        }
        Ok(drafts)
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, LoadState>> {
        self.state
            .read()
            .map_err(|_| MailError::Storage("mail index lock poisoned".to_string()))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, LoadState>> {
        self.state
            .write()
            .map_err(|_| MailError::Storage("mail index lock poisoned".to_string()))
    }

    fn with_index<R>(&self, f: impl FnOnce(&Index) -> Result<R>) -> Result<R> {
        let state = self.read_state()?;
        match &*state {
            LoadState::Ready(index) => f(index),
            LoadState::Loading => {
                metrics::record_not_ready(BACKEND);
                Err(MailError::NotReady)
            }
            LoadState::Failed(msg) => Err(MailError::Storage(msg.clone())),
        }
    }

    fn with_index_mut<R>(&self, f: impl FnOnce(&mut Index) -> Result<R>) -> Result<R> {
        let mut state = self.write_state()?;
        match &mut *state {
            LoadState::Ready(index) => f(index),
            LoadState::Loading => {
                metrics::record_not_ready(BACKEND);
                Err(MailError::NotReady)
            }
            LoadState::Failed(msg) => Err(MailError::Storage(msg.clone())),
        }
    }

    fn remember(&self, record: &MailRecord) {
        self.identities.extend(actors_of(record));
    }

    /// Seal and write a draft, then add it to the index
    fn store_sealed(
        &self,
        index: &mut Index,
        draft: MailRecord,
        total: BTreeSet<Actor>,
        origin: Option<Location>,
    ) -> Result<MailRecord> {
        let id = index.next_id();
        let sent = seal_draft(draft, id, &self.limits, total, origin)?;

        if let Err(e) = layout::write_mail(&self.mail_dir, &sent) {
            warn!(mail_id = id, "Failed to write mail: {}", e);
            return Err(e);
        }

        index.mails.insert(id, sent.clone());
        self.remember(&sent);
        Ok(sent)
    }

    fn remove_file(&self, id: u64) -> Result<()> {
        let path = self.mail_dir.join(layout::mail_file_name(id));
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(mail_id = id, "Failed to delete mail file: {}", e);
                Err(e.into())
            }
        }
    }
}

fn draft_not_found(sender: &Actor) -> MailError {
    MailError::DraftNotFound(sender.to_string())
}

impl MailStore for FileMailStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Files
    }

    fn is_ready(&self) -> bool {
        self.state
            .read()
            .map(|s| matches!(*s, LoadState::Ready(_)))
            .unwrap_or(false)
    }

    fn limits(&self) -> &MailLimits {
        &self.limits
    }

    fn identities(&self) -> Arc<dyn IdentityRegistry> {
        self.identities.clone()
    }

    fn create_draft(&self, sender: &Actor) -> Result<MailRecord> {
        self.with_index_mut(|index| {
            let draft = index
                .drafts
                .entry(sender.clone())
                .or_insert_with(|| MailRecord::draft(sender.clone()))
                .clone();
            self.identities.intern(sender)?;
            Ok(draft)
        })
    }

    fn draft(&self, sender: &Actor) -> Result<Option<MailRecord>> {
        self.with_index(|index| Ok(index.drafts.get(sender).cloned()))
    }

    fn mutate_draft(&self, sender: &Actor, update: Mutation<'_>) -> Result<MailRecord> {
        self.with_index_mut(|index| {
            let current = index
                .drafts
                .get(sender)
                .ok_or_else(|| draft_not_found(sender))?;
            let updated = apply_draft_update(current, &self.limits, update)?;
            index.drafts.insert(sender.clone(), updated.clone());
            self.remember(&updated);
            Ok(updated)
        })
    }

    fn discard_draft(&self, sender: &Actor) -> Result<bool> {
        self.with_index_mut(|index| Ok(index.drafts.remove(sender).is_some()))
    }

    fn send(
        &self,
        sender: &Actor,
        resolver: &dyn RecipientResolver,
        origin: Option<Location>,
    ) -> Result<MailRecord> {
        // Recipients are resolved outside the index lock; the draft is
        // re-checked before sealing.
        let mut draft = self.draft(sender)?.ok_or_else(|| draft_not_found(sender))?;

        for _ in 0..SEND_ATTEMPTS {
            let total = resolver.resolve_total(&draft);
            let sealed = self.with_index_mut(|index| {
                let current = index
                    .drafts
                    .get(sender)
                    .cloned()
                    .ok_or_else(|| draft_not_found(sender))?;
                if current != draft {
                    return Ok(None);
                }
                let sent = self.store_sealed(index, current, total, origin.clone())?;
                index.drafts.remove(sender);
                Ok(Some(sent))
            })?;

            match sealed {
                Some(sent) => {
                    info!(mail_id = sent.id(), from = %sender, "Mail sent");
                    metrics::record_sent(BACKEND, "draft");
                    return Ok(sent);
                }
                None => {
                    debug!(from = %sender, "Draft changed while resolving recipients");
                    draft = self.draft(sender)?.ok_or_else(|| draft_not_found(sender))?;
                }
            }
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
        self.with_index_mut(|index| {
            let sent = self.store_sealed(index, record, total, origin)?;
            debug!(mail_id = sent.id(), from = %sent.sender(), "Mail delivered");
            metrics::record_sent(BACKEND, "direct");
            Ok(sent)
        })
    }

    fn get(&self, id: u64) -> Result<MailRecord> {
        self.with_index(|index| index.mails.get(&id).cloned().ok_or(MailError::NotFound(id)))
    }

    fn query(&self, query: &MailQuery) -> Result<Vec<MailRecord>> {
        self.with_index(|index| {
            let mut found: Vec<MailRecord> = index
                .mails
                .values()
                .filter(|m| query.matches(m))
                .cloned()
                .collect();
            found.sort_by(newest_first);
            Ok(found)
        })
    }

    fn mutate(&self, id: u64, update: Mutation<'_>) -> Result<MailRecord> {
        self.with_index_mut(|index| {
            let current = index.mails.get(&id).ok_or(MailError::NotFound(id))?;
            let updated = apply_update(current, update)?;
            if updated.id() != id {
                return Err(MailError::Storage(format!(
                    "update changed the id of mail #{}",
                    id
                )));
            }

            if let Err(e) = layout::write_mail(&self.mail_dir, &updated) {
                warn!(mail_id = id, "Failed to write mail: {}", e);
                return Err(e);
            }
            index.mails.insert(id, updated.clone());
            Ok(updated)
        })
    }

    fn delete(&self, id: u64) -> Result<bool> {
        self.with_index_mut(|index| {
            if !index.mails.contains_key(&id) {
                return Ok(false);
            }
            self.remove_file(id)?;
            index.mails.remove(&id);
            debug!(mail_id = id, "Mail deleted");
            Ok(true)
        })
    }

    fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff = truncate_millis(cutoff);
        self.with_index_mut(|index| {
            let expired: Vec<u64> = index
                .mails
                .values()
                .filter(|m| {
                    m.sent_at()
                        .map(|at| truncate_millis(at) < cutoff)
                        .unwrap_or(false)
                })
                .map(|m| m.id())
                .collect();

            let mut deleted = 0;
            for id in expired {
                self.remove_file(id)?;
                index.mails.remove(&id);
                deleted += 1;
            }
            Ok(deleted)
        })
    }

    fn latest_id(&self) -> Result<u64> {
        self.with_index(|index| Ok(index.next_id() - 1))
    }

    fn sent_after(&self, id: u64) -> Result<Vec<MailRecord>> {
        self.with_index(|index| {
            Ok(index
                .mails
                .range((Bound::Excluded(id), Bound::Unbounded))
                .map(|(_, m)| m.clone())
                .collect())
        })
    }

    fn all_sent(&self) -> Result<Vec<MailRecord>> {
        self.with_index(|index| Ok(index.mails.values().cloned().collect()))
    }

    fn import(&self, record: &MailRecord) -> Result<()> {
        if record.is_draft() {
            return Err(ValidationError::NotSent.into());
        }
        self.with_index_mut(|index| {
            layout::write_mail(&self.mail_dir, record)?;
            index.mails.insert(record.id(), record.clone());
            self.remember(record);
            Ok(())
        })
    }

    /// Write every draft to the drafts file
    fn flush(&self) -> Result<()> {
        let state = self.read_state()?;
        let index = match &*state {
            LoadState::Ready(index) => index,
            _ => return Ok(()),
        };

        let path = self.root.join(DRAFTS_FILE);
        if index.drafts.is_empty() {
            if path.exists() {
                fs::remove_file(&path)?;
            }
            return Ok(());
        }

        let file: DraftsFile = index
            .drafts
            .iter()
            .map(|(sender, draft)| (sender.to_string(), MailFile::from(draft)))
            .collect();
        let yaml = serde_yaml::to_string(&file)?;
        layout::write_atomic(&path, &yaml)?;
        info!(drafts = index.drafts.len(), "Drafts saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ItemStack;
    use crate::store::DirectOnly;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> FileMailStore {
        FileMailStore::open_loaded(dir.path(), MailLimits::default()).unwrap()
    }

    fn send_to(store: &FileMailStore, from: &Actor, to: &Actor, line: &str) -> MailRecord {
        store.create_draft(from).unwrap();
        store
            .mutate_draft(from, &mut |d| {
                d.add_recipient(to.clone())?;
                d.push_line(line)?;
                Ok(())
            })
            .unwrap();
        store.send(from, &DirectOnly, None).unwrap()
    }

    #[test]
    fn test_not_ready_until_loaded() {
        let dir = TempDir::new().unwrap();
        let store = FileMailStore::open(dir.path(), MailLimits::default()).unwrap();

        assert!(!store.is_ready());
        assert!(matches!(
            store.inbox(&Actor::Console),
            Err(MailError::NotReady)
        ));
        assert!(matches!(
            store.create_draft(&Actor::Console),
            Err(MailError::NotReady)
        ));

        store.load().unwrap();
        assert!(store.is_ready());
        assert!(store.inbox(&Actor::Console).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_load() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir);
            send_to(&store, &Actor::Console, &Actor::dummy("b"), "hi");
        }

        let store = Arc::new(FileMailStore::open(dir.path(), MailLimits::default()).unwrap());
        store.spawn_load().await.unwrap().unwrap();
        assert_eq!(store.latest_id().unwrap(), 1);
    }

    #[test]
    fn test_mail_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let b = Actor::dummy("b");
        let sent = {
            let store = open(&dir);
            send_to(&store, &Actor::Console, &b, "persisted")
        };
        assert!(dir.path().join("mail").join("00000001.yml").exists());

        let store = open(&dir);
        assert_eq!(store.get(1).unwrap(), sent);
        assert!(store.identities().known().unwrap().contains(&b));
    }

    #[test]
    fn test_drafts_file_lifecycle() {
        let dir = TempDir::new().unwrap();
        let drafts_path = dir.path().join(DRAFTS_FILE);
        {
            let store = open(&dir);
            store.create_draft(&Actor::Console).unwrap();
            store
                .mutate_draft(&Actor::Console, &mut |d| {
                    d.push_line("unsent")?;
                    d.set_attachments(vec![ItemStack::new("stone", 4)]);
                    Ok(())
                })
                .unwrap();
            store.flush().unwrap();
        }
        assert!(drafts_path.exists());

        let store = open(&dir);
        assert!(!drafts_path.exists());
        let draft = store.draft(&Actor::Console).unwrap().unwrap();
        assert_eq!(draft.body(), ["unsent".to_string()]);
        assert_eq!(draft.attachments(), [ItemStack::new("stone", 4)]);
    }

    #[test]
    fn test_unreadable_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir);
            send_to(&store, &Actor::Console, &Actor::dummy("b"), "ok");
        }
        fs::write(dir.path().join("mail").join("00000002.yml"), "from: [not, an, actor").unwrap();
        fs::write(dir.path().join("mail").join("notes.txt"), "ignored").unwrap();

        let store = open(&dir);
        assert_eq!(store.all_sent().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_write_leaves_index_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let b = Actor::dummy("b");
        send_to(&store, &Actor::Console, &b, "first");

        // Replace the mail directory with a plain file so writes fail
        fs::remove_dir_all(dir.path().join("mail")).unwrap();
        fs::write(dir.path().join("mail"), "").unwrap();

        let result = store.mutate(1, &mut |m| {
            m.mark_read(&b)?;
            Ok(())
        });
        assert!(result.is_err());
        assert!(!store.get(1).unwrap().is_read_by(&b));
    }
}
