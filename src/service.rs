//! Mail service
//!
//! The orchestration layer over the store, groups, escrow and boxes. It owns
//! the rules the store deliberately does not enforce: who may address a
//! group, who may send attachments to several recipients, and who gets told
//! about new mail.
//!
//! # Example
//!
//! ```no_run
//! use postbox::config::PostboxConfig;
//! use postbox::model::Actor;
//! use postbox::service::MailService;
//!
//! # fn main() -> postbox::Result<()> {
//! let config = PostboxConfig::new().with_data_dir("/tmp/postbox");
//! let service = MailService::builder(config).build()?;
//!
//! let alice = Actor::dummy("alice");
//! service.add_recipient(&alice, Actor::dummy("bob"))?;
//! service.push_line(&alice, "hi")?;
//! let sent = service.send(&alice, None)?;
//! println!("sent mail #{}", sent.id());
//! # Ok(())
//! # }
//! ```

use crate::boxes::{BoxKey, BoxRegistry, SharedBox};
use crate::collaborators::{
    MailView, MemoryPermissions, MemoryPresence, NoView, Notifier, PermissionOracle, Presence,
    RecordingNotifier,
};
use crate::config::PostboxConfig;
use crate::escrow::{AttachmentEscrow, Economy, EscrowError, Inventory, MemoryInventory, OpenDecision};
use crate::groups::{AddressResolver, GroupRegistry, GroupStorage, SqliteGroupStorage, YamlGroupStorage};
use crate::identity::{CachingNameResolver, NameSource};
use crate::model::{Actor, Group, GroupMode, Location, MailRecord, Price};
use crate::store::{self, FileMailStore, MailStore, OpenedStore, RecipientResolver};
use crate::sweeper::{NotificationSweep, RetentionSweeper};
use crate::{MailError, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Name resolver over any boxed source
pub type NameResolver = CachingNameResolver<Arc<dyn NameSource>>;

pub struct MailService {
    config: PostboxConfig,
    store: Arc<dyn MailStore>,
    file_store: Option<Arc<FileMailStore>>,
    groups: Arc<GroupRegistry>,
    resolver: Arc<AddressResolver>,
    escrow: Arc<AttachmentEscrow>,
    boxes: Arc<BoxRegistry>,
    presence: Arc<dyn Presence>,
    permissions: Arc<dyn PermissionOracle>,
    notifier: Arc<dyn Notifier>,
    names: Option<Arc<NameResolver>>,
    retention: Arc<RetentionSweeper>,
    notifications: Arc<NotificationSweep>,
    shutdown: watch::Sender<bool>,
}

impl MailService {
    pub fn builder(config: PostboxConfig) -> MailServiceBuilder {
        MailServiceBuilder::new(config)
    }

    pub fn config(&self) -> &PostboxConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MailStore> {
        &self.store
    }

    pub fn groups(&self) -> &Arc<GroupRegistry> {
        &self.groups
    }

    pub fn boxes(&self) -> &Arc<BoxRegistry> {
        &self.boxes
    }

    pub fn escrow(&self) -> &Arc<AttachmentEscrow> {
        &self.escrow
    }

    pub fn notifications(&self) -> &Arc<NotificationSweep> {
        &self.notifications
    }

    pub fn retention(&self) -> &Arc<RetentionSweeper> {
        &self.retention
    }

    /// Tell online recipients about a sent mail
    fn notify(&self, mail: &MailRecord) {
        if let Some(total) = mail.total_recipients() {
            for recipient in total {
                if self.presence.is_online(recipient) {
                    self.notifier.notify_new_mail(recipient, mail);
                }
            }
        }
        self.notifications.advance(mail.id());
    }

    // ------------------------------------------------------------------
    // Background work
    // ------------------------------------------------------------------

    /// Start loading the file index and the periodic sweeps
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(files) = &self.file_store {
            let load = files.spawn_load();
            handles.push(tokio::spawn(async move {
                match load.await {
                    Ok(Ok(())) => debug!("Mail index ready"),
                    Ok(Err(e)) => warn!(error = %e, "Mail index failed to load"),
                    Err(e) => warn!(error = %e, "Mail index loader panicked"),
                }
            }));
        }

        if let Some(handle) = self.retention.clone().spawn(self.shutdown.subscribe()) {
            handles.push(handle);
        }
        handles.push(self.notifications.clone().spawn(self.shutdown.subscribe()));
        handles
    }

    /// Stop the sweeps, close every box and flush drafts
    ///
    /// Every step runs even if an earlier one fails; the first failure is
    /// returned.
    pub fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown.send(true);

        let boxes = self.boxes.close_all();
        if let Err(e) = &boxes {
            warn!(error = %e, "Some attachment boxes could not be saved");
        }
        let flushed = self.store.flush();
        if let Err(e) = &flushed {
            warn!(error = %e, "Drafts could not be saved");
        }

        info!("Mail service stopped");
        boxes.and(flushed)
    }

    // ------------------------------------------------------------------
    // Drafts
    // ------------------------------------------------------------------

    pub fn draft(&self, sender: &Actor) -> Result<MailRecord> {
        self.store.create_draft(sender)
    }

    fn edit_draft(
        &self,
        sender: &Actor,
        mut update: impl FnMut(&mut MailRecord) -> Result<()>,
    ) -> Result<MailRecord> {
        self.store.create_draft(sender)?;
        self.store.mutate_draft(sender, &mut update)
    }

    pub fn add_recipient(&self, sender: &Actor, recipient: Actor) -> Result<MailRecord> {
        self.edit_draft(sender, |d| {
            d.add_recipient(recipient.clone())?;
            Ok(())
        })
    }

    /// Add a player recipient by name, resolving the account id remotely
    pub async fn add_recipient_by_name(&self, sender: &Actor, name: &str) -> Result<MailRecord> {
        let names = self
            .names
            .as_ref()
            .ok_or_else(|| MailError::Identity("player name lookup is not configured".to_string()))?;
        let id = names
            .resolve(name)
            .await?
            .ok_or_else(|| MailError::Identity(format!("unknown player '{}'", name)))?;
        self.add_recipient(sender, Actor::player(id))
    }

    pub fn remove_recipient(&self, sender: &Actor, recipient: &Actor) -> Result<MailRecord> {
        self.edit_draft(sender, |d| {
            d.remove_recipient(recipient)?;
            Ok(())
        })
    }

    /// Address a group; the sender must be allowed to send to it
    pub fn add_group(&self, sender: &Actor, group: &str) -> Result<MailRecord> {
        self.groups.check_send(sender, group)?;
        self.edit_draft(sender, |d| {
            d.add_group(group)?;
            Ok(())
        })
    }

    pub fn remove_group(&self, sender: &Actor, group: &str) -> Result<MailRecord> {
        self.edit_draft(sender, |d| {
            d.remove_group(group)?;
            Ok(())
        })
    }

    pub fn push_line(&self, sender: &Actor, line: &str) -> Result<MailRecord> {
        self.edit_draft(sender, |d| Ok(d.push_line(line)?))
    }

    pub fn set_body(&self, sender: &Actor, lines: Vec<String>) -> Result<MailRecord> {
        self.edit_draft(sender, |d| Ok(d.set_body(lines.clone())?))
    }

    /// Set the cash-on-delivery price of the draft
    pub fn set_price(&self, sender: &Actor, price: Price) -> Result<MailRecord> {
        let enabled = match &price {
            Price::Free => true,
            Price::Money(_) => self.config.escrow.money_price_enabled,
            Price::Item(_) => self.config.escrow.item_price_enabled,
        };
        if !enabled {
            return Err(MailError::PermissionDenied(
                "this kind of price is disabled".to_string(),
            ));
        }
        self.edit_draft(sender, |d| Ok(d.set_price(price.clone())?))
    }

    pub fn discard_draft(&self, sender: &Actor) -> Result<bool> {
        let key = BoxKey::Draft(sender.clone());
        if self.boxes.is_open(&key) {
            self.boxes.close(sender, &key)?;
        }
        self.store.discard_draft(sender)
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send the sender's draft
    ///
    /// Group permissions are checked again, and attachments may only go to
    /// several recipients with the multi-attach capability.
    pub fn send(&self, sender: &Actor, origin: Option<Location>) -> Result<MailRecord> {
        let key = BoxKey::Draft(sender.clone());
        if self.boxes.is_open(&key) {
            self.boxes.close(sender, &key)?;
        }

        let draft = self
            .store
            .draft(sender)?
            .ok_or_else(|| MailError::DraftNotFound(sender.to_string()))?;

        for group in draft.recipient_groups() {
            self.groups.check_send(sender, group)?;
        }
        if draft.has_attachments() {
            let recipients = self.resolver.resolve_total(&draft).len();
            if recipients > 1 && !self.permissions.can_multi_attach(sender) {
                return Err(MailError::PermissionDenied(format!(
                    "attachments can only be sent to one recipient (this mail has {})",
                    recipients
                )));
            }
        }

        let sent = self.store.send(sender, self.resolver.as_ref(), origin)?;
        debug!(
            mail_id = sent.id(),
            recipients = sent.total_recipients().map(|t| t.len()).unwrap_or(0),
            "Notifying recipients"
        );
        self.notify(&sent);
        Ok(sent)
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    /// A mail the actor sent or received
    pub fn get(&self, actor: &Actor, id: u64) -> Result<MailRecord> {
        let mail = self.store.get(id)?;
        if mail.sender() != actor && !mail.is_recipient(actor) && !self.permissions.is_operator(actor) {
            return Err(MailError::NotFound(id));
        }
        Ok(mail)
    }

    /// Open a mail, marking it read for a recipient
    pub fn read(&self, actor: &Actor, id: u64) -> Result<MailRecord> {
        let mail = self.get(actor, id)?;
        if !mail.is_recipient(actor) || mail.is_read_by(actor) {
            return Ok(mail);
        }
        self.store.mutate(id, &mut |m| {
            m.mark_read(actor)?;
            Ok(())
        })
    }

    pub fn mark_unread(&self, actor: &Actor, id: u64) -> Result<MailRecord> {
        self.store.mutate(id, &mut |m| {
            m.mark_unread(actor)?;
            Ok(())
        })
    }

    pub fn trash(&self, actor: &Actor, id: u64) -> Result<MailRecord> {
        self.store.mutate(id, &mut |m| {
            m.mark_trashed(actor)?;
            Ok(())
        })
    }

    pub fn restore(&self, actor: &Actor, id: u64) -> Result<MailRecord> {
        self.store.mutate(id, &mut |m| {
            m.restore_from_trash(actor)?;
            Ok(())
        })
    }

    pub fn inbox(&self, actor: &Actor) -> Result<Vec<MailRecord>> {
        self.store.inbox(actor)
    }

    pub fn unread(&self, actor: &Actor) -> Result<Vec<MailRecord>> {
        self.store.unread(actor)
    }

    pub fn outbox(&self, actor: &Actor) -> Result<Vec<MailRecord>> {
        self.store.outbox(actor)
    }

    pub fn trashbox(&self, actor: &Actor) -> Result<Vec<MailRecord>> {
        self.store.trashbox(actor)
    }

    // ------------------------------------------------------------------
    // Attachments
    // ------------------------------------------------------------------

    /// Open a mail's attachment box, if no price is due
    pub fn open_attachments(&self, actor: &Actor, id: u64) -> Result<SharedBox> {
        match self.escrow.request_open(actor, id)? {
            OpenDecision::Granted => {
                let mail = self.store.get(id)?;
                if mail.is_recipient(actor) && !mail.attachments_cancelled() {
                    self.escrow.mark_opened(actor, id)?;
                }
                self.boxes.open_mail(actor, id)
            }
            OpenDecision::PaymentRequired(_) => Err(EscrowError::PaymentDue(id).into()),
        }
    }

    /// Pay the price of a mail and open its box
    pub fn confirm_payment(&self, actor: &Actor, id: u64) -> Result<SharedBox> {
        let (_, payment) = self.escrow.confirm_payment(actor, id)?;
        if let Some(payment) = payment {
            self.notify(&payment);
        }
        self.boxes.open_mail(actor, id)
    }

    /// Close a box and write its contents back
    pub fn close_box(&self, actor: &Actor, key: &BoxKey) -> Result<MailRecord> {
        self.boxes.close(actor, key)
    }

    /// Open the sender's own draft box
    pub fn open_draft_box(&self, sender: &Actor) -> Result<SharedBox> {
        self.boxes.open_draft(sender)
    }

    pub fn cancel_attachments(&self, sender: &Actor, id: u64) -> Result<MailRecord> {
        self.escrow.cancel(sender, id)
    }

    /// Refuse attachments; the sender gets them back in a new mail
    pub fn refuse_attachments(
        &self,
        recipient: &Actor,
        id: u64,
        reason: Option<String>,
    ) -> Result<MailRecord> {
        let (original, reply) = self.escrow.refuse(recipient, id, reason)?;
        self.notify(&reply);
        Ok(original)
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    pub fn create_group(&self, owner: &Actor, name: &str) -> Result<Group> {
        self.groups.create(owner, name)
    }

    pub fn delete_group(&self, actor: &Actor, name: &str) -> Result<Group> {
        self.groups.delete(actor, name)
    }

    pub fn add_group_member(&self, actor: &Actor, group: &str, member: Actor) -> Result<bool> {
        self.groups.add_member(actor, group, member)
    }

    pub fn remove_group_member(&self, actor: &Actor, group: &str, member: &Actor) -> Result<bool> {
        self.groups.remove_member(actor, group, member)
    }

    pub fn set_group_modes(
        &self,
        actor: &Actor,
        group: &str,
        send: GroupMode,
        modify: GroupMode,
        dissolve: GroupMode,
    ) -> Result<bool> {
        self.groups.set_modes(actor, group, send, modify, dissolve)
    }
}

/// Assembles a [`MailService`]
///
/// Defaults: the backend from the configuration, in-memory presence and
/// permissions, a logging notifier, no mail view, no economy and no name
/// lookup.
pub struct MailServiceBuilder {
    config: PostboxConfig,
    opened: Option<OpenedStore>,
    group_storage: Option<Box<dyn GroupStorage>>,
    presence: Option<Arc<dyn Presence>>,
    permissions: Option<Arc<dyn PermissionOracle>>,
    notifier: Option<Arc<dyn Notifier>>,
    view: Option<Arc<dyn MailView>>,
    economy: Option<Arc<dyn Economy>>,
    inventory: Option<Arc<dyn Inventory>>,
    name_source: Option<Arc<dyn NameSource>>,
}

impl MailServiceBuilder {
    pub fn new(config: PostboxConfig) -> Self {
        Self {
            config,
            opened: None,
            group_storage: None,
            presence: None,
            permissions: None,
            notifier: None,
            view: None,
            economy: None,
            inventory: None,
            name_source: None,
        }
    }

    /// Use an already opened store instead of opening one from the config
    pub fn store(mut self, opened: OpenedStore) -> Self {
        self.opened = Some(opened);
        self
    }

    pub fn group_storage(mut self, storage: Box<dyn GroupStorage>) -> Self {
        self.group_storage = Some(storage);
        self
    }

    pub fn presence(mut self, presence: Arc<dyn Presence>) -> Self {
        self.presence = Some(presence);
        self
    }

    pub fn permissions(mut self, permissions: Arc<dyn PermissionOracle>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn view(mut self, view: Arc<dyn MailView>) -> Self {
        self.view = Some(view);
        self
    }

    pub fn economy(mut self, economy: Arc<dyn Economy>) -> Self {
        self.economy = Some(economy);
        self
    }

    pub fn inventory(mut self, inventory: Arc<dyn Inventory>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub fn name_source(mut self, source: Arc<dyn NameSource>) -> Self {
        self.name_source = Some(source);
        self
    }

    pub fn build(self) -> Result<MailService> {
        let config = self.config;
        let opened = match self.opened {
            Some(opened) => opened,
            None => store::open_configured(&config)?,
        };
        let store = opened.as_store();
        let file_store = match &opened {
            OpenedStore::Files(files) => Some(files.clone()),
            OpenedStore::Sqlite(_) => None,
        };

        let group_storage = match self.group_storage {
            Some(storage) => storage,
            None => match opened.connection() {
                Some(conn) => Box::new(SqliteGroupStorage::new(conn)) as Box<dyn GroupStorage>,
                None => Box::new(YamlGroupStorage::in_dir(&config.storage.data_dir)),
            },
        };

        let presence = self
            .presence
            .unwrap_or_else(|| Arc::new(MemoryPresence::new()));
        let permissions = self
            .permissions
            .unwrap_or_else(|| Arc::new(MemoryPermissions::new()));
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(RecordingNotifier::new()));
        let view = self.view.unwrap_or_else(|| Arc::new(NoView));
        let inventory = self
            .inventory
            .unwrap_or_else(|| Arc::new(MemoryInventory::new()));

        let groups = Arc::new(
            GroupRegistry::load(group_storage, permissions.clone())?
                .with_identities(store.identities())?,
        );
        let resolver = Arc::new(AddressResolver::new(
            groups.clone(),
            presence.clone(),
            permissions.clone(),
            store.identities(),
        ));
        let escrow = Arc::new(AttachmentEscrow::new(
            store.clone(),
            self.economy,
            inventory,
            config.escrow.clone(),
        ));
        let boxes = Arc::new(BoxRegistry::new(
            store.clone(),
            presence.clone(),
            view,
            config.boxes.clone(),
        ));
        let names = self
            .name_source
            .map(|source| Arc::new(CachingNameResolver::from_config(source, &config.identity)));
        let retention = Arc::new(RetentionSweeper::new(store.clone(), &config.retention));
        let notifications = Arc::new(NotificationSweep::new(
            store.clone(),
            presence.clone(),
            notifier.clone(),
            &config.retention,
        ));
        let (shutdown, _) = watch::channel(false);

        debug!(backend = %store.backend(), "Mail service assembled");
        Ok(MailService {
            config,
            store,
            file_store,
            groups,
            resolver,
            escrow,
            boxes,
            presence,
            permissions,
            notifier,
            names,
            retention,
            notifications,
            shutdown,
        })
    }
}
