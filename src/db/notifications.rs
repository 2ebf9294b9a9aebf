//! Customer notification queue
//!
//! Rows are written after the business transaction has committed and are
//! never part of it. Delivery to a channel is out of this crate's hands; the
//! queue only records what should be sent.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;

pub const SHIPMENT_CREATED: &str = "SHIPMENT_CREATED";
pub const SHIPMENT_STATUS_UPDATE: &str = "SHIPMENT_STATUS_UPDATE";
pub const PAYMENT_RECEIVED: &str = "PAYMENT_RECEIVED";

/// A notification to enqueue for a requester
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub requester_id: String,
    pub shipment_id: Option<String>,
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
}

impl Notification {
    /// `TYPE-shipmentId-uuid`, unique per enqueue
    fn dedup_key(&self) -> String {
        format!(
            "{}-{}-{}",
            self.notification_type,
            self.shipment_id.as_deref().unwrap_or("none"),
            Uuid::new_v4()
        )
    }
}

/// Queue row from database
#[derive(Debug, Clone, Serialize)]
pub struct QueuedNotification {
    pub queue_id: i64,
    pub requester_id: String,
    pub shipment_id: Option<String>,
    pub notification_type: String,
    pub dedup_key: String,
    pub title: String,
    pub message: String,
    pub metadata_json: Option<String>,
    pub send_via: String,
    pub status: String,
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
}

impl QueuedNotification {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            queue_id: row.get("queue_id")?,
            requester_id: row.get("requester_id")?,
            shipment_id: row.get("shipment_id")?,
            notification_type: row.get("notification_type")?,
            dedup_key: row.get("dedup_key")?,
            title: row.get("title")?,
            message: row.get("message")?,
            metadata_json: row.get("metadata_json")?,
            send_via: row.get("send_via")?,
            status: row.get("status")?,
            attempts: row.get("attempts")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Append a pending in-app notification
pub fn enqueue(
    conn: &Connection,
    notification: &Notification,
    now: DateTime<Utc>,
) -> Result<i64, LedgerError> {
    let metadata_json = notification
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        r#"
        INSERT INTO notification_queue (
            requester_id, shipment_id, notification_type, dedup_key, title, message,
            metadata_json, send_via, status, attempts, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'in_app', 'pending', 0, ?8)
        "#,
        params![
            notification.requester_id,
            notification.shipment_id,
            notification.notification_type,
            notification.dedup_key(),
            notification.title,
            notification.message,
            metadata_json,
            now,
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Pending notifications, oldest first
pub fn list_pending(conn: &Connection) -> Result<Vec<QueuedNotification>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM notification_queue WHERE status = 'pending' ORDER BY queue_id",
    )?;
    let rows = stmt
        .query_map([], QueuedNotification::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_db;

    #[test]
    fn test_enqueue_twice_gets_distinct_keys() {
        let (db, _dir) = temp_db();
        let notification = Notification {
            requester_id: "user-1".into(),
            shipment_id: Some("ship-1".into()),
            notification_type: SHIPMENT_CREATED.into(),
            title: "Shipment Created".into(),
            message: "Your shipment FLT0000000001 has been created.".into(),
            metadata: Some(serde_json::json!({ "tracking_number": "FLT0000000001" })),
        };

        db.with_conn(|c| enqueue(c, &notification, Utc::now())).unwrap();
        db.with_conn(|c| enqueue(c, &notification, Utc::now())).unwrap();

        let pending = db.with_conn(list_pending).unwrap();
        assert_eq!(pending.len(), 2);
        assert_ne!(pending[0].dedup_key, pending[1].dedup_key);
        assert!(pending[0].dedup_key.starts_with("SHIPMENT_CREATED-ship-1-"));
        assert_eq!(pending[0].send_via, "in_app");
    }
}
