//! On-disk layout of the file backend
//!
//! ```text
//! <data_dir>/
//!   mail/
//!     00000001.yml    # one file per sent mail, named by zero-padded id
//!     00000002.yml
//!   drafts.yml        # every draft, keyed by sender token
//!   groups.yml        # static groups
//! ```
//!
//! Field names follow the long-standing file format so existing mail
//! directories stay readable.

use crate::model::{Actor, ItemStack, Location, MailParts, MailRecord, Price};
use crate::{MailError, Result};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const MAIL_DIR: &str = "mail";
pub const DRAFTS_FILE: &str = "drafts.yml";
pub const GROUPS_FILE: &str = "groups.yml";

/// File name of a sent mail
pub fn mail_file_name(id: u64) -> String {
    format!("{:08}.yml", id)
}

/// Id encoded in a mail file name, if it is one
pub fn parse_mail_file_name(path: &Path) -> Option<u64> {
    if path.extension().map(|e| e != "yml").unwrap_or(true) {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// Serialized form of one mail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailFile {
    #[serde(default)]
    pub to: Vec<Actor>,

    #[serde(default, rename = "toGroups")]
    pub to_groups: Vec<String>,

    #[serde(default, rename = "toTotal", skip_serializing_if = "Option::is_none")]
    pub to_total: Option<Vec<Actor>>,

    pub from: Actor,

    #[serde(default)]
    pub message: Vec<String>,

    #[serde(default)]
    pub attachments: Vec<ItemStack>,

    #[serde(default, rename = "attachmentsOriginal")]
    pub attachments_original: Vec<ItemStack>,

    #[serde(default, rename = "costMoney")]
    pub cost_money: i64,

    #[serde(default, rename = "costItem", skip_serializing_if = "Option::is_none")]
    pub cost_item: Option<ItemStack>,

    #[serde(default)]
    pub index: u64,

    #[serde(default, rename = "readFlags")]
    pub read_flags: Vec<Actor>,

    #[serde(default, rename = "trashFlags")]
    pub trash_flags: Vec<Actor>,

    /// Epoch millis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,

    #[serde(default, rename = "isAttachmentsOpened")]
    pub attachments_opened: bool,

    #[serde(default, rename = "isAttachmentsCancelled")]
    pub attachments_cancelled: bool,

    #[serde(default, rename = "isAttachmentsRefused")]
    pub attachments_refused: bool,

    #[serde(
        default,
        rename = "attachmentsRefusedReason",
        skip_serializing_if = "Option::is_none"
    )]
    pub refused_reason: Option<String>,
}

impl From<&MailRecord> for MailFile {
    fn from(record: &MailRecord) -> Self {
        let price = record.price();
        Self {
            to: record.recipients().to_vec(),
            to_groups: record.recipient_groups().to_vec(),
            to_total: record
                .total_recipients()
                .map(|total| total.iter().cloned().collect()),
            from: record.sender().clone(),
            message: record.body().to_vec(),
            attachments: record.attachments().to_vec(),
            attachments_original: record.attachments_original().to_vec(),
            cost_money: price.money_amount(),
            cost_item: price.item_price().cloned(),
            index: record.id(),
            read_flags: record.read_by().iter().cloned().collect(),
            trash_flags: record.trashed_by().iter().cloned().collect(),
            date: record.sent_at().map(|at| at.timestamp_millis()),
            location: record.origin().cloned(),
            attachments_opened: record.attachments_opened(),
            attachments_cancelled: record.attachments_cancelled(),
            attachments_refused: record.attachments_refused(),
            refused_reason: record.refusal_reason().map(str::to_string),
        }
    }
}

impl MailFile {
    pub fn into_record(self) -> Result<MailRecord> {
        let sent_at = match self.date {
            Some(millis) => Some(DateTime::from_timestamp_millis(millis).ok_or_else(|| {
                MailError::Storage(format!("mail #{} has an invalid date {}", self.index, millis))
            })?),
            None => None,
        };
        if self.index > 0 && sent_at.is_none() {
            return Err(MailError::Storage(format!(
                "mail #{} has no date",
                self.index
            )));
        }

        let parts = MailParts {
            id: self.index,
            sender: Some(self.from),
            recipients: self.to,
            recipient_groups: self.to_groups,
            total_recipients: self.to_total.map(|t| t.into_iter().collect()),
            body: self.message,
            attachments: self.attachments,
            attachments_original: self.attachments_original,
            price: Price::from_columns(self.cost_money, self.cost_item),
            read_by: self.read_flags.into_iter().collect(),
            trashed_by: self.trash_flags.into_iter().collect(),
            attachments_opened: self.attachments_opened,
            attachments_cancelled: self.attachments_cancelled,
            attachments_refused: self.attachments_refused,
            refusal_reason: self.refused_reason,
            sent_at,
            origin: self.location,
        };
        MailRecord::from_parts(parts)
            .ok_or_else(|| MailError::Storage(format!("mail #{} has no sender", self.index)))
    }
}

/// Drafts file contents, keyed by sender token
pub type DraftsFile = BTreeMap<String, MailFile>;

/// Write a file through a temporary sibling and rename it into place
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

pub fn write_mail(dir: &Path, record: &MailRecord) -> Result<()> {
    let yaml = serde_yaml::to_string(&MailFile::from(record))?;
    write_atomic(&dir.join(mail_file_name(record.id())), &yaml)
}

pub fn read_mail(path: &Path) -> Result<MailRecord> {
    let content = fs::read_to_string(path)?;
    let file: MailFile = serde_yaml::from_str(&content)?;
    let expected = parse_mail_file_name(path);
    let record = file.into_record()?;
    if expected.is_some() && expected != Some(record.id()) {
        return Err(MailError::Storage(format!(
            "{} holds mail #{}",
            path.display(),
            record.id()
        )));
    }
    Ok(record)
}
