//! Mail records
//!
//! A [`MailRecord`] is either a draft (id 0, freely editable, one per sender)
//! or a sent mail (permanent id, frozen recipient set). Every mutator on the
//! record enforces the state rules, so a record handed back by a store is
//! always internally consistent regardless of which backend produced it.

use super::group::is_all_group;
use super::{Actor, ItemStack, Location};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Validation failures reported synchronously to the caller
///
/// A record is never modified when one of these is returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("mail has no recipients")]
    EmptyRecipients,

    #[error("too many recipients (max {max})")]
    TooManyRecipients { max: usize },

    #[error("too many recipient groups (max {max})")]
    TooManyGroups { max: usize },

    #[error("message is too long (max {max} lines)")]
    BodyTooLong { max: usize },

    #[error("price cannot be negative: {0}")]
    NegativePrice(i64),

    #[error("item price must name an item and a positive amount")]
    InvalidItemPrice,

    #[error("invalid group name: {0}")]
    InvalidGroupName(String),

    #[error("mail #{0} has already been sent")]
    AlreadySent(u64),

    #[error("mail has not been sent yet")]
    NotSent,

    #[error("not a recipient of mail #{0}")]
    NotARecipient(u64),

    #[error("mail must be read before it can be trashed")]
    TrashRequiresRead,

    #[error("mail still carries attachments and cannot be trashed")]
    TrashRequiresEmptyAttachments,

    #[error("mail #{0} has no attachments")]
    NoAttachments(u64),

    #[error("attachments of mail #{0} were already opened")]
    AttachmentsOpened(u64),

    #[error("attachments of mail #{0} were cancelled")]
    AttachmentsCancelled(u64),

    #[error("mail #{0} cannot be priced without attachments")]
    PriceWithoutAttachments(u64),
}

/// Cash-on-delivery price gating a mail's attachments
///
/// A price is either money or a single item stack, never both.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Price {
    #[default]
    Free,
    Money(i64),
    Item(ItemStack),
}

impl Price {
    /// Money price; zero becomes [`Price::Free`]
    pub fn money(amount: i64) -> Result<Self, ValidationError> {
        match amount {
            a if a < 0 => Err(ValidationError::NegativePrice(a)),
            0 => Ok(Price::Free),
            a => Ok(Price::Money(a)),
        }
    }

    /// Item price
    pub fn item(stack: ItemStack) -> Result<Self, ValidationError> {
        if stack.is_empty() {
            return Err(ValidationError::InvalidItemPrice);
        }
        Ok(Price::Item(stack))
    }

    pub fn is_free(&self) -> bool {
        matches!(self, Price::Free)
    }

    /// Money component (zero unless this is a money price)
    pub fn money_amount(&self) -> i64 {
        match self {
            Price::Money(amount) => *amount,
            _ => 0,
        }
    }

    /// Item component, if this is an item price
    pub fn item_price(&self) -> Option<&ItemStack> {
        match self {
            Price::Item(stack) => Some(stack),
            _ => None,
        }
    }

    /// Rebuild from the two persisted columns
    ///
    /// An item price wins over a money price, matching the rule that an item
    /// price forces the money price to zero.
    pub fn from_columns(money: i64, item: Option<ItemStack>) -> Self {
        match item {
            Some(stack) if !stack.is_empty() => Price::Item(stack),
            _ if money > 0 => Price::Money(money),
            _ => Price::Free,
        }
    }
}

/// Capacity bounds applied to every mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailLimits {
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    #[serde(default = "default_max_groups")]
    pub max_groups: usize,

    #[serde(default = "default_max_body_lines")]
    pub max_body_lines: usize,
}

fn default_max_recipients() -> usize {
    64
}

fn default_max_groups() -> usize {
    16
}

fn default_max_body_lines() -> usize {
    64
}

impl Default for MailLimits {
    fn default() -> Self {
        Self {
            max_recipients: default_max_recipients(),
            max_groups: default_max_groups(),
            max_body_lines: default_max_body_lines(),
        }
    }
}

impl MailLimits {
    /// Check a record against these limits
    pub fn check(&self, record: &MailRecord) -> Result<(), ValidationError> {
        if record.recipients.len() > self.max_recipients {
            return Err(ValidationError::TooManyRecipients {
                max: self.max_recipients,
            });
        }
        if record.recipient_groups.len() > self.max_groups {
            return Err(ValidationError::TooManyGroups {
                max: self.max_groups,
            });
        }
        if record.body.len() > self.max_body_lines {
            return Err(ValidationError::BodyTooLong {
                max: self.max_body_lines,
            });
        }
        Ok(())
    }
}

/// Every field of a record, used by storage backends to rebuild one
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MailParts {
    pub id: u64,
    pub sender: Option<Actor>,
    pub recipients: Vec<Actor>,
    pub recipient_groups: Vec<String>,
    pub total_recipients: Option<BTreeSet<Actor>>,
    pub body: Vec<String>,
    pub attachments: Vec<ItemStack>,
    pub attachments_original: Vec<ItemStack>,
    pub price: Price,
    pub read_by: BTreeSet<Actor>,
    pub trashed_by: BTreeSet<Actor>,
    pub attachments_opened: bool,
    pub attachments_cancelled: bool,
    pub attachments_refused: bool,
    pub refusal_reason: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub origin: Option<Location>,
}

/// One message, draft or sent
#[derive(Debug, Clone, PartialEq)]
pub struct MailRecord {
    id: u64,
    sender: Actor,
    recipients: Vec<Actor>,
    recipient_groups: Vec<String>,
    total_recipients: Option<BTreeSet<Actor>>,
    body: Vec<String>,
    attachments: Vec<ItemStack>,
    attachments_original: Vec<ItemStack>,
    price: Price,
    read_by: BTreeSet<Actor>,
    trashed_by: BTreeSet<Actor>,
    attachments_opened: bool,
    attachments_cancelled: bool,
    attachments_refused: bool,
    refusal_reason: Option<String>,
    sent_at: Option<DateTime<Utc>>,
    origin: Option<Location>,
}

impl MailRecord {
    /// Create an empty draft
    pub fn draft(sender: Actor) -> Self {
        Self {
            id: 0,
            sender,
            recipients: Vec::new(),
            recipient_groups: Vec::new(),
            total_recipients: None,
            body: Vec::new(),
            attachments: Vec::new(),
            attachments_original: Vec::new(),
            price: Price::Free,
            read_by: BTreeSet::new(),
            trashed_by: BTreeSet::new(),
            attachments_opened: false,
            attachments_cancelled: false,
            attachments_refused: false,
            refusal_reason: None,
            sent_at: None,
            origin: None,
        }
    }

    /// Start building a draft
    pub fn builder(sender: Actor) -> MailBuilder {
        MailBuilder::new(sender)
    }

    /// Rebuild a record from stored parts
    ///
    /// Derived flags are normalized: a refusal implies a cancellation, a
    /// cancellation clears the price, and a sent record always has a
    /// recipient set.
    pub fn from_parts(parts: MailParts) -> Option<Self> {
        let sender = parts.sender?;
        let mut record = Self {
            id: parts.id,
            sender,
            recipients: parts.recipients,
            recipient_groups: parts.recipient_groups,
            total_recipients: parts.total_recipients,
            body: parts.body,
            attachments: parts.attachments,
            attachments_original: parts.attachments_original,
            price: parts.price,
            read_by: parts.read_by,
            trashed_by: parts.trashed_by,
            attachments_opened: parts.attachments_opened,
            attachments_cancelled: parts.attachments_cancelled || parts.attachments_refused,
            attachments_refused: parts.attachments_refused,
            refusal_reason: parts.refusal_reason,
            sent_at: parts.sent_at,
            origin: parts.origin,
        };

        if record.attachments_cancelled {
            record.price = Price::Free;
        }
        if record.id == 0 {
            record.total_recipients = None;
            record.read_by.clear();
            record.trashed_by.clear();
        } else if record.total_recipients.is_none() {
            record.total_recipients = Some(BTreeSet::new());
        }
        Some(record)
    }

    /// Copy every field out
    pub fn to_parts(&self) -> MailParts {
        MailParts {
            id: self.id,
            sender: Some(self.sender.clone()),
            recipients: self.recipients.clone(),
            recipient_groups: self.recipient_groups.clone(),
            total_recipients: self.total_recipients.clone(),
            body: self.body.clone(),
            attachments: self.attachments.clone(),
            attachments_original: self.attachments_original.clone(),
            price: self.price.clone(),
            read_by: self.read_by.clone(),
            trashed_by: self.trashed_by.clone(),
            attachments_opened: self.attachments_opened,
            attachments_cancelled: self.attachments_cancelled,
            attachments_refused: self.attachments_refused,
            refusal_reason: self.refusal_reason.clone(),
            sent_at: self.sent_at,
            origin: self.origin.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Permanent id; 0 while this is a draft
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_draft(&self) -> bool {
        self.id == 0
    }

    pub fn is_sent(&self) -> bool {
        self.id > 0
    }

    pub fn sender(&self) -> &Actor {
        &self.sender
    }

    pub fn recipients(&self) -> &[Actor] {
        &self.recipients
    }

    pub fn recipient_groups(&self) -> &[String] {
        &self.recipient_groups
    }

    /// Frozen recipient set; `None` while this is a draft
    pub fn total_recipients(&self) -> Option<&BTreeSet<Actor>> {
        self.total_recipients.as_ref()
    }

    pub fn body(&self) -> &[String] {
        &self.body
    }

    pub fn attachments(&self) -> &[ItemStack] {
        &self.attachments
    }

    /// Attachments as they were when the mail was sent
    pub fn attachments_original(&self) -> &[ItemStack] {
        &self.attachments_original
    }

    pub fn price(&self) -> &Price {
        &self.price
    }

    pub fn read_by(&self) -> &BTreeSet<Actor> {
        &self.read_by
    }

    pub fn trashed_by(&self) -> &BTreeSet<Actor> {
        &self.trashed_by
    }

    pub fn attachments_opened(&self) -> bool {
        self.attachments_opened
    }

    pub fn attachments_cancelled(&self) -> bool {
        self.attachments_cancelled
    }

    pub fn attachments_refused(&self) -> bool {
        self.attachments_refused
    }

    pub fn refusal_reason(&self) -> Option<&str> {
        self.refusal_reason.as_deref()
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.sent_at
    }

    pub fn origin(&self) -> Option<&Location> {
        self.origin.as_ref()
    }

    /// Whether the actor is in the frozen recipient set
    pub fn is_recipient(&self, actor: &Actor) -> bool {
        self.total_recipients
            .as_ref()
            .map(|total| total.contains(actor))
            .unwrap_or(false)
    }

    pub fn is_read_by(&self, actor: &Actor) -> bool {
        self.read_by.contains(actor)
    }

    pub fn is_trashed_by(&self, actor: &Actor) -> bool {
        self.trashed_by.contains(actor)
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Whether the mail names any destination at all
    pub fn has_destination(&self) -> bool {
        !self.recipients.is_empty() || !self.recipient_groups.is_empty()
    }

    /// Whether the "All" dynamic group is the destination
    pub fn is_addressed_to_all(&self) -> bool {
        self.recipient_groups.iter().any(|g| is_all_group(g))
    }

    // ------------------------------------------------------------------
    // Draft editing
    // ------------------------------------------------------------------

    fn ensure_draft(&self) -> Result<(), ValidationError> {
        if self.is_sent() {
            return Err(ValidationError::AlreadySent(self.id));
        }
        Ok(())
    }

    /// Add a direct recipient; returns false if already present
    ///
    /// A mail addressed to "All" stops being so once a specific recipient is
    /// added.
    pub fn add_recipient(&mut self, actor: Actor) -> Result<bool, ValidationError> {
        self.ensure_draft()?;
        if self.recipients.contains(&actor) {
            return Ok(false);
        }
        self.recipient_groups.retain(|g| !is_all_group(g));
        self.recipients.push(actor);
        Ok(true)
    }

    pub fn remove_recipient(&mut self, actor: &Actor) -> Result<bool, ValidationError> {
        self.ensure_draft()?;
        let before = self.recipients.len();
        self.recipients.retain(|a| a != actor);
        Ok(self.recipients.len() != before)
    }

    /// Add a group reference; returns false if already present
    ///
    /// Adding "All" clears every other destination.
    pub fn add_group(&mut self, name: impl Into<String>) -> Result<bool, ValidationError> {
        self.ensure_draft()?;
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::InvalidGroupName(name));
        }
        if self
            .recipient_groups
            .iter()
            .any(|g| g.eq_ignore_ascii_case(&name))
        {
            return Ok(false);
        }

        if is_all_group(&name) {
            self.recipients.clear();
            self.recipient_groups.clear();
        } else {
            self.recipient_groups.retain(|g| !is_all_group(g));
        }
        self.recipient_groups.push(name);
        Ok(true)
    }

    pub fn remove_group(&mut self, name: &str) -> Result<bool, ValidationError> {
        self.ensure_draft()?;
        let before = self.recipient_groups.len();
        self.recipient_groups
            .retain(|g| !g.eq_ignore_ascii_case(name));
        Ok(self.recipient_groups.len() != before)
    }

    /// Drop every direct recipient and group reference
    pub fn clear_destinations(&mut self) -> Result<(), ValidationError> {
        self.ensure_draft()?;
        self.recipients.clear();
        self.recipient_groups.clear();
        Ok(())
    }

    pub fn set_body(&mut self, lines: Vec<String>) -> Result<(), ValidationError> {
        self.ensure_draft()?;
        self.body = lines;
        Ok(())
    }

    pub fn push_line(&mut self, line: impl Into<String>) -> Result<(), ValidationError> {
        self.ensure_draft()?;
        self.body.push(line.into());
        Ok(())
    }

    /// Set the cash-on-delivery price of a draft
    pub fn set_price(&mut self, price: Price) -> Result<(), ValidationError> {
        self.ensure_draft()?;
        if let Price::Money(amount) = price {
            if amount < 0 {
                return Err(ValidationError::NegativePrice(amount));
            }
        }
        if let Price::Item(ref stack) = price {
            if stack.is_empty() {
                return Err(ValidationError::InvalidItemPrice);
            }
        }
        self.price = match price {
            Price::Money(0) => Price::Free,
            other => other,
        };
        Ok(())
    }

    // ------------------------------------------------------------------
    // Attachments (draft or sent)
    // ------------------------------------------------------------------

    /// Replace the current attachment list
    ///
    /// Used when an attachment box is synchronized. The original snapshot of a
    /// sent mail is never touched.
    pub fn set_attachments(&mut self, stacks: Vec<ItemStack>) {
        self.attachments = stacks.into_iter().filter(|s| !s.is_empty()).collect();
    }

    /// Clear the price once it has been paid
    pub fn clear_price(&mut self) {
        self.price = Price::Free;
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Turn a draft into a sent mail
    ///
    /// Freezes the recipient set, snapshots the attachments and drops the
    /// price if there is nothing left to pay for.
    pub fn seal(
        mut self,
        id: u64,
        total: BTreeSet<Actor>,
        sent_at: DateTime<Utc>,
        origin: Option<Location>,
    ) -> Result<Self, ValidationError> {
        self.ensure_draft()?;
        if !self.has_destination() {
            return Err(ValidationError::EmptyRecipients);
        }
        debug_assert!(id > 0, "sent mail ids start at 1");

        self.id = id;
        self.total_recipients = Some(total);
        self.attachments_original = self.attachments.clone();
        if self.attachments.is_empty() {
            self.price = Price::Free;
        }
        self.sent_at = Some(sent_at);
        self.origin = origin;
        self.read_by.clear();
        self.trashed_by.clear();
        Ok(self)
    }

    // ------------------------------------------------------------------
    // Per-recipient flags
    // ------------------------------------------------------------------

    fn ensure_recipient(&self, actor: &Actor) -> Result<(), ValidationError> {
        if self.is_draft() {
            return Err(ValidationError::NotSent);
        }
        if !self.is_recipient(actor) {
            return Err(ValidationError::NotARecipient(self.id));
        }
        Ok(())
    }

    /// Mark as read for a recipient; returns false if it already was
    pub fn mark_read(&mut self, actor: &Actor) -> Result<bool, ValidationError> {
        self.ensure_recipient(actor)?;
        Ok(self.read_by.insert(actor.clone()))
    }

    pub fn mark_unread(&mut self, actor: &Actor) -> Result<bool, ValidationError> {
        self.ensure_recipient(actor)?;
        Ok(self.read_by.remove(actor))
    }

    /// Move to a recipient's trash
    ///
    /// Only read mail without remaining attachments can be trashed.
    pub fn mark_trashed(&mut self, actor: &Actor) -> Result<bool, ValidationError> {
        self.ensure_recipient(actor)?;
        if !self.read_by.contains(actor) {
            return Err(ValidationError::TrashRequiresRead);
        }
        if !self.attachments.is_empty() {
            return Err(ValidationError::TrashRequiresEmptyAttachments);
        }
        Ok(self.trashed_by.insert(actor.clone()))
    }

    /// Take a mail back out of a recipient's trash
    pub fn restore_from_trash(&mut self, actor: &Actor) -> Result<bool, ValidationError> {
        self.ensure_recipient(actor)?;
        Ok(self.trashed_by.remove(actor))
    }

    // ------------------------------------------------------------------
    // Escrow state
    // ------------------------------------------------------------------

    /// Record that a recipient opened the attachments
    ///
    /// Returns true the first time.
    pub fn mark_attachments_opened(&mut self) -> Result<bool, ValidationError> {
        if self.is_draft() {
            return Err(ValidationError::NotSent);
        }
        if self.attachments_cancelled {
            return Err(ValidationError::AttachmentsCancelled(self.id));
        }
        let first = !self.attachments_opened;
        self.attachments_opened = true;
        Ok(first)
    }

    /// Cancel delivery of the attachments (sender side)
    pub fn cancel_attachments(&mut self) -> Result<(), ValidationError> {
        if self.is_draft() {
            return Err(ValidationError::NotSent);
        }
        if self.attachments_opened {
            return Err(ValidationError::AttachmentsOpened(self.id));
        }
        if self.attachments_cancelled {
            return Err(ValidationError::AttachmentsCancelled(self.id));
        }
        if self.attachments.is_empty() {
            return Err(ValidationError::NoAttachments(self.id));
        }
        self.attachments_cancelled = true;
        self.price = Price::Free;
        Ok(())
    }

    /// Refuse the attachments (recipient side)
    ///
    /// Returns the refused items; the mail keeps no attachments afterwards and
    /// counts as cancelled.
    pub fn refuse_attachments(
        &mut self,
        reason: Option<String>,
    ) -> Result<Vec<ItemStack>, ValidationError> {
        if self.is_draft() {
            return Err(ValidationError::NotSent);
        }
        if self.attachments_opened {
            return Err(ValidationError::AttachmentsOpened(self.id));
        }
        if self.attachments_cancelled {
            return Err(ValidationError::AttachmentsCancelled(self.id));
        }
        if self.attachments.is_empty() {
            return Err(ValidationError::NoAttachments(self.id));
        }
        self.attachments_refused = true;
        self.attachments_cancelled = true;
        self.refusal_reason = reason.filter(|r| !r.trim().is_empty());
        self.price = Price::Free;
        Ok(std::mem::take(&mut self.attachments))
    }
}

/// Builder for drafts with named defaults
///
/// Defaults: no recipients, no groups, empty body, no attachments, free.
#[derive(Debug, Clone)]
pub struct MailBuilder {
    record: MailRecord,
}

impl MailBuilder {
    pub fn new(sender: Actor) -> Self {
        Self {
            record: MailRecord::draft(sender),
        }
    }

    pub fn to(mut self, actor: Actor) -> Self {
        if !self.record.recipients.contains(&actor) {
            self.record.recipients.push(actor);
        }
        self
    }

    pub fn to_group(mut self, name: impl Into<String>) -> Self {
        // add_group only fails for sent mail or blank names
        let _ = self.record.add_group(name);
        self
    }

    pub fn line(mut self, line: impl Into<String>) -> Self {
        self.record.body.push(line.into());
        self
    }

    pub fn body(mut self, lines: Vec<String>) -> Self {
        self.record.body = lines;
        self
    }

    pub fn attach(mut self, stack: ItemStack) -> Self {
        if !stack.is_empty() {
            self.record.attachments.push(stack);
        }
        self
    }

    pub fn price(mut self, price: Price) -> Self {
        self.record.price = price;
        self
    }

    pub fn build(self) -> MailRecord {
        self.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn player() -> Actor {
        Actor::player(Uuid::new_v4())
    }

    fn sent_to(recipient: &Actor, attachments: Vec<ItemStack>) -> MailRecord {
        let mut builder = MailRecord::builder(player()).to(recipient.clone()).line("hello");
        for stack in attachments {
            builder = builder.attach(stack);
        }
        let total = [recipient.clone()].into_iter().collect();
        builder.build().seal(1, total, Utc::now(), None).unwrap()
    }

    #[test]
    fn test_price_constructors() {
        assert_eq!(Price::money(0).unwrap(), Price::Free);
        assert_eq!(Price::money(25).unwrap(), Price::Money(25));
        assert_eq!(Price::money(-1), Err(ValidationError::NegativePrice(-1)));
        assert_eq!(
            Price::item(ItemStack::new("gold", 0)),
            Err(ValidationError::InvalidItemPrice)
        );
        assert_eq!(
            Price::from_columns(50, Some(ItemStack::new("gold", 2))),
            Price::Item(ItemStack::new("gold", 2))
        );
    }

    #[test]
    fn test_seal_requires_destination() {
        let draft = MailRecord::draft(player());
        let err = draft
            .seal(1, BTreeSet::new(), Utc::now(), None)
            .unwrap_err();
        assert_eq!(err, ValidationError::EmptyRecipients);
    }

    #[test]
    fn test_seal_snapshots_attachments_and_drops_orphan_price() {
        let to = player();
        let draft = MailRecord::builder(player())
            .to(to.clone())
            .price(Price::Money(10))
            .build();
        let total: BTreeSet<Actor> = [to.clone()].into_iter().collect();
        let sent = draft.seal(3, total.clone(), Utc::now(), None).unwrap();
        assert_eq!(sent.id(), 3);
        assert_eq!(sent.total_recipients(), Some(&total));
        assert!(sent.price().is_free());

        let mail = sent_to(&to, vec![ItemStack::new("diamond", 2)]);
        assert_eq!(mail.attachments_original(), mail.attachments());
    }

    #[test]
    fn test_sent_mail_rejects_draft_edits() {
        let to = player();
        let mut mail = sent_to(&to, vec![]);
        assert_eq!(
            mail.add_recipient(player()),
            Err(ValidationError::AlreadySent(1))
        );
        assert_eq!(
            mail.set_price(Price::Money(5)),
            Err(ValidationError::AlreadySent(1))
        );
    }

    #[test]
    fn test_all_group_is_exclusive() {
        let mut draft = MailRecord::draft(player());
        draft.add_recipient(player()).unwrap();
        draft.add_group("Guild").unwrap();
        draft.add_group("all").unwrap();
        assert!(draft.recipients().is_empty());
        assert_eq!(draft.recipient_groups(), ["all".to_string()]);

        draft.add_group("Guild").unwrap();
        assert_eq!(draft.recipient_groups(), ["Guild".to_string()]);
    }

    #[test]
    fn test_trash_requires_read_and_no_attachments() {
        let to = player();
        let mut mail = sent_to(&to, vec![ItemStack::new("stone", 1)]);

        assert_eq!(
            mail.mark_trashed(&to),
            Err(ValidationError::TrashRequiresRead)
        );
        mail.mark_read(&to).unwrap();
        assert_eq!(
            mail.mark_trashed(&to),
            Err(ValidationError::TrashRequiresEmptyAttachments)
        );
        mail.set_attachments(vec![]);
        assert!(mail.mark_trashed(&to).unwrap());
        assert!(mail.is_trashed_by(&to));
    }

    #[test]
    fn test_flags_only_for_recipients() {
        let to = player();
        let mut mail = sent_to(&to, vec![]);
        let stranger = player();
        assert_eq!(
            mail.mark_read(&stranger),
            Err(ValidationError::NotARecipient(1))
        );
        assert!(mail.read_by().is_empty());
    }

    #[test]
    fn test_opened_blocks_cancel_and_refuse() {
        let to = player();
        let mut mail = sent_to(&to, vec![ItemStack::new("stone", 1)]);
        assert!(mail.mark_attachments_opened().unwrap());
        assert!(!mail.mark_attachments_opened().unwrap());

        assert_eq!(
            mail.cancel_attachments(),
            Err(ValidationError::AttachmentsOpened(1))
        );
        assert_eq!(
            mail.refuse_attachments(None),
            Err(ValidationError::AttachmentsOpened(1))
        );
        assert!(!mail.attachments_cancelled());
    }

    #[test]
    fn test_refusal_implies_cancellation() {
        let to = player();
        let mut mail = MailRecord::builder(player())
            .to(to.clone())
            .attach(ItemStack::new("emerald", 3))
            .price(Price::Money(40))
            .build()
            .seal(9, [to].into_iter().collect(), Utc::now(), None)
            .unwrap();

        let items = mail
            .refuse_attachments(Some("no thanks".to_string()))
            .unwrap();
        assert_eq!(items, vec![ItemStack::new("emerald", 3)]);
        assert!(mail.attachments().is_empty());
        assert!(mail.attachments_refused());
        assert!(mail.attachments_cancelled());
        assert!(mail.price().is_free());
        assert_eq!(mail.refusal_reason(), Some("no thanks"));
        assert_eq!(mail.attachments_original(), items.as_slice());
    }

    #[test]
    fn test_from_parts_normalizes_flags() {
        let parts = MailParts {
            id: 4,
            sender: Some(Actor::Console),
            recipients: vec![Actor::dummy("x")],
            price: Price::Money(10),
            attachments_refused: true,
            ..Default::default()
        };
        let record = MailRecord::from_parts(parts).unwrap();
        assert!(record.attachments_cancelled());
        assert!(record.price().is_free());
        assert_eq!(record.total_recipients(), Some(&BTreeSet::new()));
    }

    #[test]
    fn test_limits() {
        let limits = MailLimits {
            max_recipients: 1,
            max_groups: 1,
            max_body_lines: 1,
        };
        let record = MailRecord::builder(player())
            .to(player())
            .to(player())
            .build();
        assert_eq!(
            limits.check(&record),
            Err(ValidationError::TooManyRecipients { max: 1 })
        );

        let record = MailRecord::builder(player()).line("a").line("b").build();
        assert_eq!(
            limits.check(&record),
            Err(ValidationError::BodyTooLong { max: 1 })
        );
    }
}
