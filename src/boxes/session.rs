//! Attachment box sessions
//!
//! A box is a slot container holding a mail's attachments while someone
//! looks at them. Boxes for sent mail are shared by every viewer; a draft's
//! box belongs to its sender. Closing a box writes its compacted contents
//! back into the record.

use crate::collaborators::{MailView, Presence};
use crate::config::BoxConfig;
use crate::metrics;
use crate::model::{items, Actor, ItemStack, MailRecord};
use crate::store::MailStore;
use crate::{MailError, Result};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// What a box is attached to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BoxKey {
    Mail(u64),
    Draft(Actor),
}

impl fmt::Display for BoxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoxKey::Mail(id) => write!(f, "mail #{}", id),
            BoxKey::Draft(sender) => write!(f, "draft of {}", sender),
        }
    }
}

#[derive(Debug)]
pub struct AttachmentBox {
    key: BoxKey,
    slots: Vec<Option<ItemStack>>,
    viewers: BTreeSet<Actor>,
}

impl AttachmentBox {
    /// A box with at least `slots` slots, filled with `contents` in order
    fn new(key: BoxKey, slots: usize, contents: &[ItemStack]) -> Self {
        Self {
            key,
            slots: fill_slots(slots, contents),
            viewers: BTreeSet::new(),
        }
    }

    pub fn key(&self) -> &BoxKey {
        &self.key
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> Option<&ItemStack> {
        self.slots.get(index).and_then(|s| s.as_ref())
    }

    pub fn viewers(&self) -> &BTreeSet<Actor> {
        &self.viewers
    }

    /// Place a stack in a slot, returning what was there
    pub fn put(&mut self, index: usize, stack: ItemStack) -> Result<Option<ItemStack>> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| MailError::Other(format!("no slot {} in {}", index, self.key)))?;
        let stack = Some(stack).filter(|s| !s.is_empty());
        Ok(std::mem::replace(slot, stack).filter(|s| !s.is_empty()))
    }

    /// Put a stack in the first free slot
    pub fn add(&mut self, stack: ItemStack) -> Result<usize> {
        let index = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or_else(|| MailError::Other(format!("{} is full", self.key)))?;
        self.slots[index] = Some(stack);
        Ok(index)
    }

    pub fn take(&mut self, index: usize) -> Option<ItemStack> {
        self.slots.get_mut(index).and_then(|s| s.take())
    }

    /// Empty every slot
    pub fn take_all(&mut self) -> Vec<ItemStack> {
        self.slots.iter_mut().filter_map(|s| s.take()).collect()
    }

    /// Non-empty stacks in slot order
    pub fn contents(&self) -> Vec<ItemStack> {
        self.slots
            .iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect()
    }

    pub fn item_count(&self) -> u64 {
        items::total_count(&self.contents())
    }

    /// Replace the contents with a compacted copy, keeping the slot count
    fn refill(&mut self, contents: &[ItemStack]) {
        self.slots = fill_slots(self.slots.len(), contents);
    }
}

/// Contents in the first slots, padded with empty ones
///
/// A box never holds fewer slots than it has stacks.
fn fill_slots(slots: usize, contents: &[ItemStack]) -> Vec<Option<ItemStack>> {
    let mut filled: Vec<Option<ItemStack>> = contents.iter().cloned().map(Some).collect();
    if filled.len() < slots {
        filled.resize(slots, None);
    }
    filled
}

/// A box shared between viewers
pub type SharedBox = Arc<Mutex<AttachmentBox>>;

fn lock_box(shared: &SharedBox) -> Result<MutexGuard<'_, AttachmentBox>> {
    shared
        .lock()
        .map_err(|_| MailError::Storage("attachment box lock poisoned".to_string()))
}

/// Tracks every open box
pub struct BoxRegistry {
    store: Arc<dyn MailStore>,
    presence: Arc<dyn Presence>,
    view: Arc<dyn MailView>,
    config: BoxConfig,
    boxes: Mutex<HashMap<BoxKey, SharedBox>>,
}

impl BoxRegistry {
    pub fn new(
        store: Arc<dyn MailStore>,
        presence: Arc<dyn Presence>,
        view: Arc<dyn MailView>,
        config: BoxConfig,
    ) -> Self {
        Self {
            store,
            presence,
            view,
            config,
            boxes: Mutex::new(HashMap::new()),
        }
    }

    fn open_boxes(&self) -> Result<MutexGuard<'_, HashMap<BoxKey, SharedBox>>> {
        self.boxes
            .lock()
            .map_err(|_| MailError::Storage("box registry lock poisoned".to_string()))
    }

    pub fn open_count(&self) -> usize {
        self.open_boxes().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_open(&self, key: &BoxKey) -> bool {
        self.open_boxes()
            .map(|b| b.contains_key(key))
            .unwrap_or(false)
    }

    /// Open the box of a sent mail
    ///
    /// Recipients may open it until the attachments are cancelled; after that
    /// only the sender may, to take the items back. An open box is shared.
    pub fn open_mail(&self, viewer: &Actor, id: u64) -> Result<SharedBox> {
        let mail = self.store.get(id)?;
        let allowed = if mail.attachments_cancelled() {
            mail.sender() == viewer
        } else {
            mail.is_recipient(viewer)
        };
        if !allowed {
            return Err(MailError::PermissionDenied(format!(
                "you cannot open the attachments of mail #{}",
                id
            )));
        }
        self.open(viewer, BoxKey::Mail(id), mail.attachments())
    }

    /// Open the box of the viewer's own draft, creating the draft if needed
    pub fn open_draft(&self, sender: &Actor) -> Result<SharedBox> {
        let draft = self.store.create_draft(sender)?;
        self.open(sender, BoxKey::Draft(sender.clone()), draft.attachments())
    }

    fn open(&self, viewer: &Actor, key: BoxKey, contents: &[ItemStack]) -> Result<SharedBox> {
        let mut boxes = self.open_boxes()?;
        let shared = boxes
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(key = %key, "Opening attachment box");
                Arc::new(Mutex::new(AttachmentBox::new(
                    key.clone(),
                    self.config.slots,
                    contents,
                )))
            })
            .clone();
        lock_box(&shared)?.viewers.insert(viewer.clone());
        metrics::set_open_boxes(boxes.len());
        Ok(shared)
    }

    /// Close a viewer's box and write its contents back
    ///
    /// The box stays open while other viewers remain. Returns the updated
    /// record.
    pub fn close(&self, viewer: &Actor, key: &BoxKey) -> Result<MailRecord> {
        let shared = self
            .open_boxes()?
            .get(key)
            .cloned()
            .ok_or_else(|| MailError::Other(format!("{} is not open", key)))?;

        let (record, last_viewer) = {
            let mut open = lock_box(&shared)?;
            let record = self.sync(&mut open)?;
            open.viewers.remove(viewer);
            (record, open.viewers.is_empty())
        };

        if last_viewer {
            let mut boxes = self.open_boxes()?;
            // Someone may have joined since the box was released
            if lock_box(&shared)?.viewers.is_empty() {
                boxes.remove(key);
            }
            metrics::set_open_boxes(boxes.len());
        }

        if self.presence.is_online(viewer) {
            match key {
                BoxKey::Mail(_) => self.view.show_mail(viewer, &record),
                BoxKey::Draft(_) => self.view.show_draft(viewer, &record),
            }
        }
        Ok(record)
    }

    /// Close every open box (shutdown)
    ///
    /// Each box is synchronized; failures are logged and the first one is
    /// returned after all boxes were attempted.
    pub fn close_all(&self) -> Result<usize> {
        let drained: Vec<(BoxKey, SharedBox)> = self.open_boxes()?.drain().collect();
        metrics::set_open_boxes(0);

        let mut closed = 0;
        let mut first_error = None;
        for (key, shared) in drained {
            let result = lock_box(&shared).and_then(|mut open| self.sync(&mut open));
            match result {
                Ok(_) => closed += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to synchronize box on close");
                    first_error.get_or_insert(e);
                }
            }
        }

        if closed > 0 {
            info!(boxes = closed, "Closed all attachment boxes");
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(closed),
        }
    }

    /// Compact the box and store it as the record's attachments
    fn sync(&self, open: &mut AttachmentBox) -> Result<MailRecord> {
        let compacted = items::compact(open.contents(), self.config.max_stack);
        let stacks = compacted.clone();
        let record = match open.key() {
            BoxKey::Mail(id) => self.store.mutate(*id, &mut |m| {
                m.set_attachments(stacks.clone());
                Ok(())
            })?,
            BoxKey::Draft(sender) => self.store.mutate_draft(sender, &mut |d| {
                d.set_attachments(stacks.clone());
                Ok(())
            })?,
        };
        open.refill(&compacted);
        debug!(key = %open.key(), stacks = compacted.len(), "Attachment box synchronized");
        Ok(record)
    }
}
