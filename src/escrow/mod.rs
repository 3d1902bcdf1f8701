//! Attachment escrow
//!
//! Collect-on-delivery gating of mail attachments behind a money or item
//! price, plus the cancel and refuse flows.

pub mod cod;
pub mod economy;

pub use cod::{AttachmentEscrow, OpenDecision, Quote};
pub use economy::{Economy, Inventory, MemoryEconomy, MemoryInventory};

use crate::model::ItemStack;
use thiserror::Error;

/// Why attachments could not be released, cancelled or refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EscrowError {
    #[error("insufficient funds: {needed} required")]
    InsufficientFunds { needed: String },

    #[error("insufficient items: {needed} required, {held} held")]
    InsufficientItems { needed: ItemStack, held: u64 },

    #[error("the economy refused the withdrawal")]
    WithdrawFailed,

    #[error("the economy refused the deposit")]
    DepositFailed,

    /// The sender's balance did not grow by the fee (capped deposit)
    #[error("deposit mismatch: expected balance {expected}, found {actual}")]
    DepositMismatch { expected: i64, actual: i64 },

    #[error("attachments of mail #{0} were already opened")]
    AlreadyOpened(u64),

    #[error("attachments of mail #{0} were cancelled")]
    AlreadyCancelled(u64),

    #[error("not a recipient of mail #{0}")]
    NotRecipient(u64),

    #[error("not the sender of mail #{0}")]
    NotSender(u64),

    #[error("mail #{0} has no attachments")]
    NoAttachments(u64),

    #[error("mail #{0} has a price to pay first")]
    PaymentDue(u64),

    #[error("mail #{0} has no price to pay")]
    NoPriceDue(u64),

    #[error("no economy is available")]
    EconomyUnavailable,
}

impl EscrowError {
    /// Text shown to the player
    pub fn user_message(&self) -> String {
        match self {
            EscrowError::InsufficientFunds { needed } => {
                format!("You do not have enough money. You need {}.", needed)
            }
            EscrowError::InsufficientItems { needed, .. } => {
                format!("You do not have enough items. You need {}.", needed)
            }
            EscrowError::WithdrawFailed => {
                "The payment could not be taken from your account.".to_string()
            }
            EscrowError::DepositFailed => {
                "The payment could not be delivered to the sender. Nothing was charged."
                    .to_string()
            }
            EscrowError::DepositMismatch { .. } => {
                "The sender cannot receive this payment right now. Nothing was charged."
                    .to_string()
            }
            EscrowError::EconomyUnavailable => {
                "Paid attachments are unavailable right now.".to_string()
            }
            other => {
                let text = other.to_string();
                let mut chars = text.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => text,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages_distinguish_failures() {
        let funds = EscrowError::InsufficientFunds {
            needed: "5 coins".to_string(),
        };
        assert!(funds.user_message().contains("5 coins"));
        assert_ne!(
            EscrowError::DepositFailed.user_message(),
            EscrowError::DepositMismatch {
                expected: 1,
                actual: 0
            }
            .user_message()
        );
        assert_eq!(
            EscrowError::NotSender(4).user_message(),
            "Not the sender of mail #4"
        );
    }
}
