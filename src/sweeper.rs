//! Periodic background work
//!
//! - [`RetentionSweeper`]: deletes sent mail older than the configured age
//! - [`NotificationSweep`]: tells online recipients about mail they were not
//!   notified of at send time (inserted by another process sharing the
//!   database)
//!
//! Both run on a tokio interval until the shutdown channel flips to `true`.
//! Store calls are synchronous and run on the blocking pool.

use crate::collaborators::{Notifier, Presence};
use crate::config::RetentionConfig;
use crate::metrics;
use crate::store::MailStore;
use crate::{MailError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Run `tick` every `period` until shutdown
async fn run_every<F>(name: &'static str, period: Duration, mut shutdown: watch::Receiver<bool>, tick: F)
where
    F: Fn() -> Result<usize> + Send + Sync + Clone + 'static,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let tick = tick.clone();
                match tokio::task::spawn_blocking(tick).await {
                    Ok(Ok(n)) if n > 0 => debug!(task = name, count = n, "Background pass done"),
                    Ok(Ok(_)) => {}
                    Ok(Err(MailError::NotReady)) => debug!(task = name, "Store still loading, skipping"),
                    Ok(Err(e)) => warn!(task = name, error = %e, "Background pass failed"),
                    Err(e) => warn!(task = name, error = %e, "Background pass panicked"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(task = name, "Stopping");
                    break;
                }
            }
        }
    }
}

/// Deletes old sent mail
pub struct RetentionSweeper {
    store: Arc<dyn MailStore>,
    max_age_days: Option<u32>,
    period: Duration,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn MailStore>, config: &RetentionConfig) -> Self {
        Self {
            store,
            max_age_days: config.max_age_days,
            period: config.sweep_interval(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_age_days.is_some()
    }

    /// One pass; returns how many mails were deleted
    pub fn sweep_once(&self) -> Result<usize> {
        let Some(days) = self.max_age_days else {
            return Ok(0);
        };
        let deleted = self.store.delete_older_than(days)?;
        if deleted > 0 {
            info!(deleted, days, "Deleted expired mail");
            metrics::record_sweep(self.store.backend().as_str(), deleted);
        }
        Ok(deleted)
    }

    /// Sweep on the configured interval until shutdown
    ///
    /// Returns `None` when retention is disabled.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if !self.is_enabled() {
            return None;
        }
        let period = self.period;
        Some(tokio::spawn(run_every(
            "retention",
            period,
            shutdown,
            move || self.sweep_once(),
        )))
    }
}

/// Notifies online recipients about mail above a remembered id
pub struct NotificationSweep {
    store: Arc<dyn MailStore>,
    presence: Arc<dyn Presence>,
    notifier: Arc<dyn Notifier>,
    cursor: Arc<AtomicU64>,
    period: Duration,
}

/// Cursor value before the first pass has seen a ready store
const UNPRIMED: u64 = u64::MAX;

impl NotificationSweep {
    pub fn new(
        store: Arc<dyn MailStore>,
        presence: Arc<dyn Presence>,
        notifier: Arc<dyn Notifier>,
        config: &RetentionConfig,
    ) -> Self {
        Self {
            store,
            presence,
            notifier,
            cursor: Arc::new(AtomicU64::new(UNPRIMED)),
            period: config.notify_interval(),
        }
    }

    /// Highest id already taken care of, if known
    pub fn cursor(&self) -> Option<u64> {
        match self.cursor.load(Ordering::SeqCst) {
            UNPRIMED => None,
            id => Some(id),
        }
    }

    /// Record that mail up to `id` was already notified
    pub fn advance(&self, id: u64) {
        let _ = self
            .cursor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if current == UNPRIMED || id > current {
                    Some(id)
                } else {
                    None
                }
            });
    }

    /// One pass; returns how many notifications were sent
    ///
    /// The first pass on a ready store only records the latest id.
    pub fn sweep_once(&self) -> Result<usize> {
        let Some(cursor) = self.cursor() else {
            let latest = self.store.latest_id()?;
            self.advance(latest);
            debug!(latest, "Notification cursor primed");
            return Ok(0);
        };

        let fresh = self.store.sent_after(cursor)?;
        let mut sent = 0;
        for mail in &fresh {
            if let Some(total) = mail.total_recipients() {
                for recipient in total {
                    if !mail.is_read_by(recipient) && self.presence.is_online(recipient) {
                        self.notifier.notify_new_mail(recipient, mail);
                        sent += 1;
                    }
                }
            }
            self.advance(mail.id());
        }
        Ok(sent)
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = self.period;
        tokio::spawn(run_every(
            "notify",
            period,
            shutdown,
            move || self.sweep_once(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{MemoryPresence, RecordingNotifier};
    use crate::model::{Actor, MailLimits, MailRecord};
    use crate::store::{DirectOnly, FileMailStore, SqliteMailStore};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn sqlite_store() -> Arc<dyn MailStore> {
        Arc::new(SqliteMailStore::in_memory(MailLimits::default()).unwrap())
    }

    fn import_aged(store: &Arc<dyn MailStore>, id: u64, days: i64) {
        let recipient = Actor::dummy("b");
        let record = MailRecord::builder(Actor::dummy("a"))
            .to(recipient.clone())
            .line("old news")
            .build()
            .seal(
                id,
                BTreeSet::from([recipient]),
                Utc::now() - ChronoDuration::days(days),
                None,
            )
            .unwrap();
        store.import(&record).unwrap();
    }

    #[test]
    fn test_retention_deletes_only_old_mail() {
        let store = sqlite_store();
        import_aged(&store, 1, 40);
        import_aged(&store, 2, 10);

        let sweeper = RetentionSweeper::new(
            store.clone(),
            &RetentionConfig {
                max_age_days: Some(30),
                ..Default::default()
            },
        );
        assert_eq!(sweeper.sweep_once().unwrap(), 1);
        assert!(store.get(1).is_err());
        assert!(store.get(2).is_ok());
    }

    #[test]
    fn test_retention_disabled() {
        let store = sqlite_store();
        import_aged(&store, 1, 400);
        let sweeper = Arc::new(RetentionSweeper::new(store.clone(), &RetentionConfig::default()));
        assert_eq!(sweeper.sweep_once().unwrap(), 0);
        let (_tx, rx) = watch::channel(false);
        assert!(sweeper.spawn(rx).is_none());
    }

    #[test]
    fn test_retention_on_loading_store() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn MailStore> =
            Arc::new(FileMailStore::open(dir.path(), MailLimits::default()).unwrap());
        let sweeper = RetentionSweeper::new(
            store,
            &RetentionConfig {
                max_age_days: Some(1),
                ..Default::default()
            },
        );
        assert!(matches!(sweeper.sweep_once(), Err(MailError::NotReady)));
    }

    #[test]
    fn test_notification_sweep() {
        let store = sqlite_store();
        let presence = Arc::new(MemoryPresence::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let a = Actor::dummy("a");
        let b = Actor::dummy("b");
        presence.connect(&b);

        let send = |line: &str| {
            let mail = MailRecord::builder(a.clone()).to(b.clone()).line(line).build();
            store.deliver(mail, &DirectOnly, None).unwrap()
        };
        send("before start");

        let sweep = NotificationSweep::new(
            store.clone(),
            presence.clone(),
            notifier.clone(),
            &RetentionConfig::default(),
        );
        assert_eq!(sweep.sweep_once().unwrap(), 0);
        assert_eq!(sweep.cursor(), Some(1));

        let second = send("from elsewhere");
        assert_eq!(sweep.sweep_once().unwrap(), 1);
        assert_eq!(notifier.notifications(), vec![(b.clone(), second.id())]);

        // Nothing new
        assert_eq!(sweep.sweep_once().unwrap(), 0);

        // Already handled by the sender's process
        let third = send("local");
        sweep.advance(third.id());
        assert_eq!(sweep.sweep_once().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_background_task_stops_on_shutdown() {
        let store = sqlite_store();
        let sweep = Arc::new(NotificationSweep::new(
            store,
            Arc::new(MemoryPresence::new()),
            Arc::new(RecordingNotifier::new()),
            &RetentionConfig {
                notify_interval_secs: 1,
                ..Default::default()
            },
        ));
        let (tx, rx) = watch::channel(false);
        let handle = sweep.clone().spawn(rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweep did not stop")
            .unwrap();
        assert_eq!(sweep.cursor(), Some(0));
    }
}
