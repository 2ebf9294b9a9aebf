//! Best-effort customer notifications
//!
//! Services call [`notify`] only after their transaction committed. A failing
//! notifier is logged and otherwise ignored.

use chrono::Utc;
use tracing::{debug, warn};

use crate::db::notifications::{self, Notification};
use crate::db::LedgerDb;
use crate::error::LedgerError;

/// Sink for customer notifications
pub trait Notifier: Send + Sync {
    fn enqueue(&self, notification: &Notification) -> Result<(), LedgerError>;
}

/// Writes notifications to the `notification_queue` table
pub struct QueueNotifier {
    db: LedgerDb,
}

impl QueueNotifier {
    pub fn new(db: LedgerDb) -> Self {
        Self { db }
    }
}

impl Notifier for QueueNotifier {
    fn enqueue(&self, notification: &Notification) -> Result<(), LedgerError> {
        let queue_id = self
            .db
            .with_conn(|conn| notifications::enqueue(conn, notification, Utc::now()))?;
        debug!(queue_id, kind = %notification.notification_type, "Queued notification");
        Ok(())
    }
}

/// Discards everything
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn enqueue(&self, _notification: &Notification) -> Result<(), LedgerError> {
        Ok(())
    }
}

/// Enqueue, swallowing any failure
pub fn notify(notifier: &dyn Notifier, notification: Notification) {
    if let Err(e) = notifier.enqueue(&notification) {
        warn!(
            error = %e,
            kind = %notification.notification_type,
            requester_id = %notification.requester_id,
            "Failed to enqueue notification"
        );
    }
}
