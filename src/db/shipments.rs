//! Shipment records and tracking history
//!
//! Status changes go through the optimistic version guard. Balance fields
//! (`amount_paid`, `amount_due`, `payment_status`) are written only by
//! [`apply_payment`], which runs under the settlement ledger's exclusive lease.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::models::{PaymentStatus, ShipmentStatus};
use super::quotes::Quote;
use super::{ensure_version_applied, get_decimal, get_opt_decimal, SqlDecimal};
use crate::error::LedgerError;

/// Shipment row from database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shipment {
    pub shipment_id: String,
    pub tracking_number: String,
    pub quote_id: Option<String>,
    pub requester_id: String,
    pub service_id: i64,
    pub origin_country: String,
    pub destination_country: String,
    pub cargo_description: Option<String>,
    pub cargo_weight_kg: Option<Decimal>,
    pub cargo_volume_m3: Option<Decimal>,
    pub declared_value: Option<Decimal>,
    pub currency: String,
    pub shipment_status: ShipmentStatus,
    pub previous_status: Option<ShipmentStatus>,
    pub status_changed_at: Option<DateTime<Utc>>,
    pub estimated_pickup_date: Option<NaiveDate>,
    pub total_cost: Decimal,
    pub amount_paid: Decimal,
    pub amount_due: Decimal,
    pub payment_status: PaymentStatus,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Shipment {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            shipment_id: row.get("shipment_id")?,
            tracking_number: row.get("tracking_number")?,
            quote_id: row.get("quote_id")?,
            requester_id: row.get("requester_id")?,
            service_id: row.get("service_id")?,
            origin_country: row.get("origin_country")?,
            destination_country: row.get("destination_country")?,
            cargo_description: row.get("cargo_description")?,
            cargo_weight_kg: get_opt_decimal(row, "cargo_weight_kg")?,
            cargo_volume_m3: get_opt_decimal(row, "cargo_volume_m3")?,
            declared_value: get_opt_decimal(row, "declared_value")?,
            currency: row.get("currency")?,
            shipment_status: row.get("shipment_status")?,
            previous_status: row.get("previous_status")?,
            status_changed_at: row.get("status_changed_at")?,
            estimated_pickup_date: row.get("estimated_pickup_date")?,
            total_cost: get_decimal(row, "total_cost")?,
            amount_paid: get_decimal(row, "amount_paid")?,
            amount_due: get_decimal(row, "amount_due")?,
            payment_status: row.get("payment_status")?,
            version: row.get("version")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Input for inserting a shipment
#[derive(Debug, Clone)]
pub struct NewShipment {
    pub tracking_number: String,
    pub quote_id: Option<String>,
    pub requester_id: String,
    pub service_id: i64,
    pub origin_country: String,
    pub destination_country: String,
    pub cargo_description: Option<String>,
    pub cargo_weight_kg: Option<Decimal>,
    pub cargo_volume_m3: Option<Decimal>,
    pub declared_value: Option<Decimal>,
    pub currency: String,
    pub estimated_pickup_date: Option<NaiveDate>,
    pub total_cost: Decimal,
}

impl NewShipment {
    /// Snapshot an accepted quote; the shipment is billed the quoted price.
    pub fn from_quote(
        quote: &Quote,
        tracking_number: String,
        estimated_pickup_date: Option<NaiveDate>,
    ) -> Result<Self, LedgerError> {
        let total_cost = quote.quoted_price.ok_or_else(|| {
            LedgerError::InvalidState(format!("quote {} has no quoted price", quote.quote_id))
        })?;

        Ok(Self {
            tracking_number,
            quote_id: Some(quote.quote_id.clone()),
            requester_id: quote.requester_id.clone(),
            service_id: quote.service_id,
            origin_country: quote.origin_country.clone(),
            destination_country: quote.destination_country.clone(),
            cargo_description: quote.cargo_description.clone(),
            cargo_weight_kg: quote.cargo_weight_kg,
            cargo_volume_m3: quote.cargo_volume_m3,
            declared_value: quote.cargo_value,
            currency: quote.currency.clone(),
            estimated_pickup_date,
            total_cost,
        })
    }
}

/// Append-only tracking history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub event_id: i64,
    pub shipment_id: String,
    pub event_status: ShipmentStatus,
    pub event_description: Option<String>,
    pub event_source: String,
    pub event_timestamp: DateTime<Utc>,
}

impl TrackingEvent {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            event_id: row.get("event_id")?,
            shipment_id: row.get("shipment_id")?,
            event_status: row.get("event_status")?,
            event_description: row.get("event_description")?,
            event_source: row.get("event_source")?,
            event_timestamp: row.get("event_timestamp")?,
        })
    }
}

// ============================================================================
// Shipments
// ============================================================================

/// Insert a pending, unpaid shipment owing its full cost
pub fn insert_shipment(
    conn: &Connection,
    input: &NewShipment,
    now: DateTime<Utc>,
) -> Result<Shipment, LedgerError> {
    if input.total_cost.is_sign_negative() {
        return Err(LedgerError::InvalidInput("total_cost must not be negative".into()));
    }

    let shipment_id = Uuid::new_v4().to_string();
    let payment_status = if input.total_cost.is_zero() {
        PaymentStatus::Paid
    } else {
        PaymentStatus::Unpaid
    };

    conn.execute(
        r#"
        INSERT INTO shipments (
            shipment_id, tracking_number, quote_id, requester_id, service_id,
            origin_country, destination_country, cargo_description,
            cargo_weight_kg, cargo_volume_m3, declared_value, currency,
            shipment_status, status_changed_at, estimated_pickup_date,
            total_cost, amount_paid, amount_due, payment_status,
            version, created_at, updated_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
            ?13, ?14, ?15, ?16, '0', ?16, ?17, 0, ?14, ?14
        )
        "#,
        params![
            shipment_id,
            input.tracking_number,
            input.quote_id,
            input.requester_id,
            input.service_id,
            input.origin_country,
            input.destination_country,
            input.cargo_description,
            input.cargo_weight_kg.map(SqlDecimal),
            input.cargo_volume_m3.map(SqlDecimal),
            input.declared_value.map(SqlDecimal),
            input.currency,
            ShipmentStatus::Pending,
            now,
            input.estimated_pickup_date,
            SqlDecimal(input.total_cost),
            payment_status,
        ],
    )?;

    debug!(shipment_id = %shipment_id, tracking_number = %input.tracking_number, "Inserted shipment");

    get_shipment(conn, &shipment_id)?
        .ok_or_else(|| LedgerError::Internal("Shipment not found after insert".into()))
}

/// Get a shipment by ID
pub fn get_shipment(conn: &Connection, shipment_id: &str) -> Result<Option<Shipment>, LedgerError> {
    Ok(conn
        .query_row(
            "SELECT * FROM shipments WHERE shipment_id = ?1",
            params![shipment_id],
            Shipment::from_row,
        )
        .optional()?)
}

/// Get a shipment by tracking number
pub fn get_by_tracking_number(
    conn: &Connection,
    tracking_number: &str,
) -> Result<Option<Shipment>, LedgerError> {
    Ok(conn
        .query_row(
            "SELECT * FROM shipments WHERE tracking_number = ?1",
            params![tracking_number],
            Shipment::from_row,
        )
        .optional()?)
}

/// Get the shipment materialized from a quote
pub fn get_by_quote_id(conn: &Connection, quote_id: &str) -> Result<Option<Shipment>, LedgerError> {
    Ok(conn
        .query_row(
            "SELECT * FROM shipments WHERE quote_id = ?1",
            params![quote_id],
            Shipment::from_row,
        )
        .optional()?)
}

/// List a requester's shipments, newest first
pub fn list_for_requester(conn: &Connection, requester_id: &str) -> Result<Vec<Shipment>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM shipments WHERE requester_id = ?1 ORDER BY created_at DESC",
    )?;
    let shipments = stmt
        .query_map(params![requester_id], Shipment::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(shipments)
}

/// Move a loaded shipment to `next`, guarded by the version it was read at
pub fn update_status(
    conn: &Connection,
    shipment: &Shipment,
    next: ShipmentStatus,
    now: DateTime<Utc>,
) -> Result<Shipment, LedgerError> {
    if !shipment.shipment_status.can_transition_to(next) {
        return Err(LedgerError::InvalidState(format!(
            "shipment {} cannot move from {} to {} (allowed: {:?})",
            shipment.shipment_id,
            shipment.shipment_status,
            next,
            shipment.shipment_status.allowed_next()
        )));
    }

    let changed = conn.execute(
        r#"
        UPDATE shipments
        SET shipment_status = ?3, previous_status = ?4, status_changed_at = ?5,
            version = version + 1, updated_at = ?5
        WHERE shipment_id = ?1 AND version = ?2
        "#,
        params![
            shipment.shipment_id,
            shipment.version,
            next,
            shipment.shipment_status,
            now
        ],
    )?;
    ensure_version_applied(changed, "shipment", &shipment.shipment_id)?;

    get_shipment(conn, &shipment.shipment_id)?
        .ok_or_else(|| LedgerError::Internal("Shipment vanished during status update".into()))
}

/// Write new balances after a payment (caller holds the exclusive lease)
pub fn apply_payment(
    conn: &Connection,
    shipment_id: &str,
    amount_paid: Decimal,
    amount_due: Decimal,
    payment_status: PaymentStatus,
    now: DateTime<Utc>,
) -> Result<(), LedgerError> {
    let changed = conn.execute(
        r#"
        UPDATE shipments
        SET amount_paid = ?2, amount_due = ?3, payment_status = ?4,
            version = version + 1, updated_at = ?5
        WHERE shipment_id = ?1
        "#,
        params![
            shipment_id,
            SqlDecimal(amount_paid),
            SqlDecimal(amount_due),
            payment_status,
            now
        ],
    )?;

    if changed == 0 {
        return Err(LedgerError::NotFound(format!("shipment {}", shipment_id)));
    }
    Ok(())
}

// ============================================================================
// Tracking events
// ============================================================================

/// Append a tracking event
pub fn append_tracking_event(
    conn: &Connection,
    shipment_id: &str,
    status: ShipmentStatus,
    description: Option<&str>,
    source: &str,
    now: DateTime<Utc>,
) -> Result<TrackingEvent, LedgerError> {
    conn.execute(
        r#"
        INSERT INTO tracking_events (shipment_id, event_status, event_description, event_source, event_timestamp)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        params![shipment_id, status, description, source, now],
    )?;

    let event_id = conn.last_insert_rowid();
    Ok(conn.query_row(
        "SELECT * FROM tracking_events WHERE event_id = ?1",
        params![event_id],
        TrackingEvent::from_row,
    )?)
}

/// Tracking history of a shipment in insertion order
pub fn list_tracking_events(
    conn: &Connection,
    shipment_id: &str,
) -> Result<Vec<TrackingEvent>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM tracking_events WHERE shipment_id = ?1 ORDER BY event_id",
    )?;
    let events = stmt
        .query_map(params![shipment_id], TrackingEvent::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::freight_services::{upsert_service, UpsertServiceInput};
    use crate::db::test_support::temp_db;
    use crate::db::LedgerDb;
    use rust_decimal_macros::dec;

    fn land_service(db: &LedgerDb) -> i64 {
        db.with_exclusive(|tx| {
            upsert_service(
                tx,
                &UpsertServiceInput {
                    service_id: None,
                    service_name: "Road".into(),
                    service_type: "land".into(),
                    base_rate: None,
                    currency: "USD".into(),
                    max_daily_capacity_kg: None,
                    max_daily_capacity_m3: None,
                    is_active: true,
                },
            )
        })
        .unwrap()
        .service_id
    }

    fn new_shipment(service_id: i64, tracking: &str) -> NewShipment {
        NewShipment {
            tracking_number: tracking.into(),
            quote_id: None,
            requester_id: "user-1".into(),
            service_id,
            origin_country: "DE".into(),
            destination_country: "FR".into(),
            cargo_description: Some("pallets".into()),
            cargo_weight_kg: Some(dec!(120.5)),
            cargo_volume_m3: None,
            declared_value: None,
            currency: "EUR".into(),
            estimated_pickup_date: NaiveDate::from_ymd_opt(2026, 5, 1),
            total_cost: dec!(250.00),
        }
    }

    #[test]
    fn test_insert_owes_full_cost() {
        let (db, _dir) = temp_db();
        let service_id = land_service(&db);
        let shipment = db
            .with_exclusive(|tx| insert_shipment(tx, &new_shipment(service_id, "FLT1"), Utc::now()))
            .unwrap();

        assert_eq!(shipment.shipment_status, ShipmentStatus::Pending);
        assert_eq!(shipment.payment_status, PaymentStatus::Unpaid);
        assert_eq!(shipment.amount_due, dec!(250.00));
        assert_eq!(shipment.amount_paid, Decimal::ZERO);
        assert_eq!(shipment.cargo_weight_kg, Some(dec!(120.5)));

        let by_tracking = db.with_conn(|c| get_by_tracking_number(c, "FLT1")).unwrap();
        assert_eq!(by_tracking, Some(shipment));
    }

    #[test]
    fn test_tracking_number_is_unique() {
        let (db, _dir) = temp_db();
        let service_id = land_service(&db);
        db.with_exclusive(|tx| insert_shipment(tx, &new_shipment(service_id, "FLT1"), Utc::now()))
            .unwrap();

        let err = db
            .with_exclusive(|tx| insert_shipment(tx, &new_shipment(service_id, "FLT1"), Utc::now()))
            .unwrap_err();
        match err {
            LedgerError::Database(e) => assert!(crate::db::is_unique_violation(&e)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_status_update_is_version_guarded() {
        let (db, _dir) = temp_db();
        let service_id = land_service(&db);
        let stale = db
            .with_exclusive(|tx| insert_shipment(tx, &new_shipment(service_id, "FLT2"), Utc::now()))
            .unwrap();

        let confirmed = db
            .with_exclusive(|tx| update_status(tx, &stale, ShipmentStatus::Confirmed, Utc::now()))
            .unwrap();
        assert_eq!(confirmed.previous_status, Some(ShipmentStatus::Pending));
        assert_eq!(confirmed.version, stale.version + 1);

        let err = db
            .with_exclusive(|tx| update_status(tx, &stale, ShipmentStatus::Cancelled, Utc::now()))
            .unwrap_err();
        assert!(matches!(err, LedgerError::ConcurrentModification { entity: "shipment", .. }));
    }

    #[test]
    fn test_invalid_transition() {
        let (db, _dir) = temp_db();
        let service_id = land_service(&db);
        let shipment = db
            .with_exclusive(|tx| insert_shipment(tx, &new_shipment(service_id, "FLT3"), Utc::now()))
            .unwrap();

        let err = db
            .with_exclusive(|tx| update_status(tx, &shipment, ShipmentStatus::Delivered, Utc::now()))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState(_)));
    }

    #[test]
    fn test_negative_balance_rejected_by_store() {
        let (db, _dir) = temp_db();
        let service_id = land_service(&db);
        let shipment = db
            .with_exclusive(|tx| insert_shipment(tx, &new_shipment(service_id, "FLT4"), Utc::now()))
            .unwrap();

        let result = db.with_exclusive(|tx| {
            apply_payment(
                tx,
                &shipment.shipment_id,
                dec!(300),
                dec!(-50),
                PaymentStatus::Paid,
                Utc::now(),
            )
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_tracking_events_in_order() {
        let (db, _dir) = temp_db();
        let service_id = land_service(&db);
        let shipment = db
            .with_exclusive(|tx| insert_shipment(tx, &new_shipment(service_id, "FLT5"), Utc::now()))
            .unwrap();

        db.with_exclusive(|tx| {
            append_tracking_event(tx, &shipment.shipment_id, ShipmentStatus::Pending, Some("created"), "system", Utc::now())?;
            append_tracking_event(tx, &shipment.shipment_id, ShipmentStatus::Confirmed, None, "admin", Utc::now())
        })
        .unwrap();

        let events = db.with_conn(|c| list_tracking_events(c, &shipment.shipment_id)).unwrap();
        let statuses: Vec<_> = events.iter().map(|e| e.event_status).collect();
        assert_eq!(statuses, vec![ShipmentStatus::Pending, ShipmentStatus::Confirmed]);
        assert_eq!(events[1].event_source, "admin");
    }
}
