//! Mailbox queries
//!
//! Each query is a predicate over sent mail for one actor. The file backend
//! evaluates [`MailQuery::matches`] against its in-memory index; the relational
//! backend translates the same predicate to SQL. Results are always ordered
//! newest first, with the id breaking ties.

use crate::model::{Actor, MailRecord};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailQuery {
    /// Received and not trashed
    Inbox(Actor),
    /// Received, not trashed and not read
    Unread(Actor),
    /// Sent by the actor
    Outbox(Actor),
    /// Received and trashed
    Trash(Actor),
    /// Sent or received by the actor
    Related(Actor),
}

impl MailQuery {
    pub fn actor(&self) -> &Actor {
        match self {
            MailQuery::Inbox(a)
            | MailQuery::Unread(a)
            | MailQuery::Outbox(a)
            | MailQuery::Trash(a)
            | MailQuery::Related(a) => a,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MailQuery::Inbox(_) => "inbox",
            MailQuery::Unread(_) => "unread",
            MailQuery::Outbox(_) => "outbox",
            MailQuery::Trash(_) => "trash",
            MailQuery::Related(_) => "related",
        }
    }

    /// Whether a mail belongs in this actor's view
    pub fn matches(&self, mail: &MailRecord) -> bool {
        if !mail.is_sent() {
            return false;
        }
        match self {
            MailQuery::Inbox(a) => mail.is_recipient(a) && !mail.is_trashed_by(a),
            MailQuery::Unread(a) => {
                mail.is_recipient(a) && !mail.is_trashed_by(a) && !mail.is_read_by(a)
            }
            MailQuery::Outbox(a) => mail.sender() == a,
            MailQuery::Trash(a) => mail.is_recipient(a) && mail.is_trashed_by(a),
            MailQuery::Related(a) => mail.sender() == a || mail.is_recipient(a),
        }
    }
}

impl fmt::Display for MailQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {}", self.name(), self.actor())
    }
}

/// Newest first; the higher id wins when two mails share a timestamp
pub fn newest_first(a: &MailRecord, b: &MailRecord) -> Ordering {
    b.sent_at()
        .cmp(&a.sent_at())
        .then_with(|| b.id().cmp(&a.id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn sent(id: u64, from: &Actor, to: &Actor, at: chrono::DateTime<Utc>) -> MailRecord {
        MailRecord::builder(from.clone())
            .to(to.clone())
            .line("x")
            .build()
            .seal(id, [to.clone()].into_iter().collect(), at, None)
            .unwrap()
    }

    #[test]
    fn test_predicates() {
        let a = Actor::dummy("a");
        let b = Actor::dummy("b");
        let mut mail = sent(1, &a, &b, Utc::now());

        assert!(MailQuery::Inbox(b.clone()).matches(&mail));
        assert!(MailQuery::Unread(b.clone()).matches(&mail));
        assert!(MailQuery::Outbox(a.clone()).matches(&mail));
        assert!(!MailQuery::Inbox(a.clone()).matches(&mail));
        assert!(MailQuery::Related(a.clone()).matches(&mail));
        assert!(MailQuery::Related(b.clone()).matches(&mail));

        mail.mark_read(&b).unwrap();
        assert!(!MailQuery::Unread(b.clone()).matches(&mail));
        mail.mark_trashed(&b).unwrap();
        assert!(!MailQuery::Inbox(b.clone()).matches(&mail));
        assert!(MailQuery::Trash(b.clone()).matches(&mail));
    }

    #[test]
    fn test_drafts_never_match() {
        let a = Actor::dummy("a");
        let draft = MailRecord::builder(a.clone()).to(a.clone()).build();
        assert!(!MailQuery::Outbox(a).matches(&draft));
    }

    #[test]
    fn test_ordering() {
        let a = Actor::dummy("a");
        let b = Actor::dummy("b");
        let now = Utc::now();
        let mut mails = vec![
            sent(1, &a, &b, now - Duration::hours(1)),
            sent(2, &a, &b, now),
            sent(3, &a, &b, now),
        ];
        mails.sort_by(newest_first);
        let ids: Vec<u64> = mails.iter().map(|m| m.id()).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }
}
