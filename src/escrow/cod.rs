//! Cash-on-delivery protocol
//!
//! A sent mail's attachments move through four states: open, cancelled (by
//! the sender), refused (by a recipient, which also cancels) and opened.
//! Priced attachments need a two-step confirm: [`AttachmentEscrow::request_open`]
//! quotes the price without side effects, [`AttachmentEscrow::confirm_payment`]
//! collects it. Collection is not transactional; a failed step is compensated
//! by restoring the snapshots taken before it started.

use super::economy::{Economy, Inventory};
use super::EscrowError;
use crate::config::EscrowConfig;
use crate::metrics;
use crate::model::{Actor, ItemStack, MailRecord, Price};
use crate::store::{DirectOnly, MailStore};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Price shown to a recipient before confirming
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub mail_id: u64,
    pub price: Price,
    /// Human-readable price
    pub display: String,
}

/// Outcome of asking to open a mail's attachments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenDecision {
    /// The box may be opened right away
    Granted,
    /// A price has to be confirmed first
    PaymentRequired(Quote),
}

pub struct AttachmentEscrow {
    store: Arc<dyn MailStore>,
    economy: Option<Arc<dyn Economy>>,
    inventory: Arc<dyn Inventory>,
    config: EscrowConfig,
}

impl AttachmentEscrow {
    pub fn new(
        store: Arc<dyn MailStore>,
        economy: Option<Arc<dyn Economy>>,
        inventory: Arc<dyn Inventory>,
        config: EscrowConfig,
    ) -> Self {
        Self {
            store,
            economy,
            inventory,
            config,
        }
    }

    fn economy(&self) -> std::result::Result<&Arc<dyn Economy>, EscrowError> {
        self.economy.as_ref().ok_or(EscrowError::EconomyUnavailable)
    }

    /// The price still due on a mail, with disabled price kinds waived
    fn price_due(&self, mail: &MailRecord) -> Price {
        match mail.price() {
            Price::Money(_) if !self.config.money_price_enabled => Price::Free,
            Price::Item(_) if !self.config.item_price_enabled => Price::Free,
            price => price.clone(),
        }
    }

    fn display_price(&self, price: &Price) -> String {
        match price {
            Price::Free => "free".to_string(),
            Price::Money(amount) => match &self.economy {
                Some(economy) => economy.format(*amount),
                None => amount.to_string(),
            },
            Price::Item(stack) => stack.to_string(),
        }
    }

    /// Whether a recipient may act on the attachments at all
    fn check_recipient_state(
        mail: &MailRecord,
        actor: &Actor,
    ) -> std::result::Result<(), EscrowError> {
        if !mail.is_recipient(actor) {
            return Err(EscrowError::NotRecipient(mail.id()));
        }
        if mail.attachments_cancelled() {
            return Err(EscrowError::AlreadyCancelled(mail.id()));
        }
        if !mail.has_attachments() {
            return Err(EscrowError::NoAttachments(mail.id()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Opening
    // ------------------------------------------------------------------

    /// First step: may `actor` open the attachments, and at what price?
    ///
    /// Read-only. Fails early when the actor cannot afford the price.
    pub fn request_open(&self, actor: &Actor, id: u64) -> Result<OpenDecision> {
        let mail = self.store.get(id)?;

        // The sender takes back cancelled attachments for free
        if mail.sender() == actor && mail.attachments_cancelled() {
            if !mail.has_attachments() {
                return Err(EscrowError::NoAttachments(id).into());
            }
            return Ok(OpenDecision::Granted);
        }

        Self::check_recipient_state(&mail, actor)?;
        let price = self.price_due(&mail);
        match &price {
            Price::Free => Ok(OpenDecision::Granted),
            Price::Money(amount) => {
                let economy = self.economy()?;
                if !economy.has(actor, *amount) {
                    metrics::record_escrow("insufficient");
                    return Err(EscrowError::InsufficientFunds {
                        needed: economy.format(*amount),
                    }
                    .into());
                }
                Ok(OpenDecision::PaymentRequired(self.quote(id, price)))
            }
            Price::Item(stack) => {
                let held = self.inventory.count(actor, &stack.item);
                if held < u64::from(stack.amount) {
                    metrics::record_escrow("insufficient");
                    return Err(EscrowError::InsufficientItems {
                        needed: stack.clone(),
                        held,
                    }
                    .into());
                }
                Ok(OpenDecision::PaymentRequired(self.quote(id, price)))
            }
        }
    }

    fn quote(&self, mail_id: u64, price: Price) -> Quote {
        Quote {
            mail_id,
            display: self.display_price(&price),
            price,
        }
    }

    /// Record that a recipient opened free attachments
    ///
    /// Returns the updated mail. A mail with a price still due is rejected.
    pub fn mark_opened(&self, actor: &Actor, id: u64) -> Result<MailRecord> {
        let mail = self.store.get(id)?;
        Self::check_recipient_state(&mail, actor)?;
        if !self.price_due(&mail).is_free() {
            return Err(EscrowError::PaymentDue(id).into());
        }

        let updated = self.store.mutate(id, &mut |m| {
            if m.mark_attachments_opened()? {
                debug!(mail_id = m.id(), "Attachments opened for the first time");
            }
            Ok(())
        })?;
        metrics::record_escrow("granted");
        Ok(updated)
    }

    /// Second step: collect the price and open the attachments
    ///
    /// Returns the updated mail and, for item prices, the payment mail sent
    /// to the original sender.
    pub fn confirm_payment(
        &self,
        actor: &Actor,
        id: u64,
    ) -> Result<(MailRecord, Option<MailRecord>)> {
        let mail = self.store.get(id)?;
        Self::check_recipient_state(&mail, actor)?;

        match self.price_due(&mail) {
            Price::Free => Err(EscrowError::NoPriceDue(id).into()),
            Price::Money(amount) => {
                let updated = self.collect_money(actor, &mail, amount)?;
                Ok((updated, None))
            }
            Price::Item(stack) => {
                let (updated, payment) = self.collect_items(actor, &mail, &stack)?;
                Ok((updated, Some(payment)))
            }
        }
    }

    fn collect_money(&self, payer: &Actor, mail: &MailRecord, amount: i64) -> Result<MailRecord> {
        let economy = self.economy()?;
        let payee = mail.sender();
        let id = mail.id();

        if !economy.has(payer, amount) {
            metrics::record_escrow("insufficient");
            return Err(EscrowError::InsufficientFunds {
                needed: economy.format(amount),
            }
            .into());
        }

        let payer_before = economy.balance(payer);
        let payee_before = economy.balance(payee);
        let rollback = |reason: &str| {
            warn!(mail_id = id, payer = %payer, payee = %payee, reason, "Rolling back payment");
            economy.set_balance(payer, payer_before);
            economy.set_balance(payee, payee_before);
            metrics::record_escrow("rolled_back");
        };

        if !economy.withdraw(payer, amount) {
            rollback("withdraw refused");
            return Err(EscrowError::WithdrawFailed.into());
        }
        // Read after the withdraw: payer and payee may be the same actor
        let payee_funded = economy.balance(payee);
        if !economy.deposit(payee, amount) {
            rollback("deposit refused");
            return Err(EscrowError::DepositFailed.into());
        }
        if self.config.verify_deposit {
            let actual = economy.balance(payee);
            let expected = payee_funded.saturating_add(amount);
            if actual != expected {
                rollback("deposit mismatch");
                return Err(EscrowError::DepositMismatch { expected, actual }.into());
            }
        }

        let updated = self.store.mutate(id, &mut |m| {
            m.clear_price();
            m.mark_attachments_opened()?;
            Ok(())
        });
        match updated {
            Ok(updated) => {
                info!(mail_id = id, payer = %payer, amount, "Money price collected");
                metrics::record_escrow("paid_money");
                Ok(updated)
            }
            Err(e) => {
                rollback("mail update failed");
                Err(e)
            }
        }
    }

    fn collect_items(
        &self,
        payer: &Actor,
        mail: &MailRecord,
        price: &ItemStack,
    ) -> Result<(MailRecord, MailRecord)> {
        let id = mail.id();
        let held = self.inventory.count(payer, &price.item);
        if held < u64::from(price.amount) || !self.inventory.take(payer, price) {
            metrics::record_escrow("insufficient");
            return Err(EscrowError::InsufficientItems {
                needed: price.clone(),
                held,
            }
            .into());
        }

        let refund = |reason: &str| {
            warn!(mail_id = id, payer = %payer, reason, "Returning item payment");
            if !self.inventory.give(payer, price) {
                warn!(mail_id = id, payer = %payer, item = %price, "Could not return item payment");
            }
            metrics::record_escrow("rolled_back");
        };

        // The payment travels to the sender as a mail of its own
        let payment = MailRecord::builder(payer.clone())
            .to(mail.sender().clone())
            .line(format!("Payment for mail #{}", id))
            .attach(price.clone())
            .build();
        let payment = match self.store.deliver(payment, &DirectOnly, None) {
            Ok(payment) => payment,
            Err(e) => {
                refund("payment mail not delivered");
                return Err(e);
            }
        };

        let updated = self.store.mutate(id, &mut |m| {
            m.clear_price();
            m.mark_attachments_opened()?;
            Ok(())
        });
        match updated {
            Ok(updated) => {
                info!(mail_id = id, payer = %payer, item = %price, payment_id = payment.id(), "Item price collected");
                metrics::record_escrow("paid_item");
                Ok((updated, payment))
            }
            Err(e) => {
                if let Err(cleanup) = self.store.delete(payment.id()) {
                    warn!(payment_id = payment.id(), error = %cleanup, "Could not remove payment mail");
                }
                refund("mail update failed");
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Cancelling and refusing
    // ------------------------------------------------------------------

    /// Sender withdraws the attachments before anyone opened them
    pub fn cancel(&self, sender: &Actor, id: u64) -> Result<MailRecord> {
        let mail = self.store.get(id)?;
        if mail.sender() != sender {
            return Err(EscrowError::NotSender(id).into());
        }
        Self::check_unopened(&mail)?;

        let updated = self.store.mutate(id, &mut |m| Ok(m.cancel_attachments()?))?;
        info!(mail_id = id, sender = %sender, "Attachments cancelled");
        metrics::record_escrow("cancelled");
        Ok(updated)
    }

    /// Recipient sends the attachments back to the sender
    ///
    /// The items travel in a new mail to the sender, created before the
    /// original is touched. Returns `(original, reply)`.
    pub fn refuse(
        &self,
        recipient: &Actor,
        id: u64,
        reason: Option<String>,
    ) -> Result<(MailRecord, MailRecord)> {
        let mail = self.store.get(id)?;
        if !mail.is_recipient(recipient) {
            return Err(EscrowError::NotRecipient(id).into());
        }
        Self::check_unopened(&mail)?;

        let mut preview = mail.clone();
        let items = preview.refuse_attachments(reason.clone())?;

        let mut reply = MailRecord::builder(recipient.clone())
            .to(mail.sender().clone())
            .line(format!("Attachments of mail #{} refused", id));
        if let Some(reason) = preview.refusal_reason() {
            reply = reply.line(format!("Reason: {}", reason));
        }
        for stack in items {
            reply = reply.attach(stack);
        }
        let reply = self.store.deliver(reply.build(), &DirectOnly, None)?;

        let updated = self.store.mutate(id, &mut |m| {
            m.refuse_attachments(reason.clone())?;
            Ok(())
        });
        match updated {
            Ok(updated) => {
                info!(mail_id = id, recipient = %recipient, reply_id = reply.id(), "Attachments refused");
                metrics::record_escrow("refused");
                Ok((updated, reply))
            }
            Err(e) => {
                if let Err(cleanup) = self.store.delete(reply.id()) {
                    warn!(reply_id = reply.id(), error = %cleanup, "Could not remove refusal reply");
                }
                Err(e)
            }
        }
    }

    fn check_unopened(mail: &MailRecord) -> std::result::Result<(), EscrowError> {
        if mail.attachments_opened() {
            return Err(EscrowError::AlreadyOpened(mail.id()));
        }
        if mail.attachments_cancelled() {
            return Err(EscrowError::AlreadyCancelled(mail.id()));
        }
        if !mail.has_attachments() {
            return Err(EscrowError::NoAttachments(mail.id()));
        }
        Ok(())
    }
}
