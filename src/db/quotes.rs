//! Quote records
//!
//! Every mutation is conditioned on the version the caller loaded; a stale
//! version fails with [`LedgerError::ConcurrentModification`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::models::QuoteStatus;
use super::{ensure_version_applied, get_opt_decimal, SqlDecimal};
use crate::error::LedgerError;

/// Quote row from database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub quote_id: String,
    pub requester_id: String,
    pub service_id: i64,
    pub origin_country: String,
    pub destination_country: String,
    pub cargo_description: Option<String>,
    pub cargo_weight_kg: Option<Decimal>,
    pub cargo_volume_m3: Option<Decimal>,
    pub cargo_value: Option<Decimal>,
    pub currency: String,
    pub status: QuoteStatus,
    pub quoted_price: Option<Decimal>,
    pub quoted_at: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub converted_to_shipment_id: Option<String>,
    pub converted_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Quote {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            quote_id: row.get("quote_id")?,
            requester_id: row.get("requester_id")?,
            service_id: row.get("service_id")?,
            origin_country: row.get("origin_country")?,
            destination_country: row.get("destination_country")?,
            cargo_description: row.get("cargo_description")?,
            cargo_weight_kg: get_opt_decimal(row, "cargo_weight_kg")?,
            cargo_volume_m3: get_opt_decimal(row, "cargo_volume_m3")?,
            cargo_value: get_opt_decimal(row, "cargo_value")?,
            currency: row.get("currency")?,
            status: row.get("status")?,
            quoted_price: get_opt_decimal(row, "quoted_price")?,
            quoted_at: row.get("quoted_at")?,
            valid_until: row.get("valid_until")?,
            converted_to_shipment_id: row.get("converted_to_shipment_id")?,
            converted_at: row.get("converted_at")?,
            version: row.get("version")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    /// A quote is stale once `now` reaches `valid_until`
    pub fn is_past_validity(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.is_some_and(|until| now >= until)
    }
}

/// Input for requesting a quote
#[derive(Debug, Clone, Deserialize)]
pub struct CreateQuoteInput {
    pub requester_id: String,
    pub service_id: i64,
    pub origin_country: String,
    pub destination_country: String,
    #[serde(default)]
    pub cargo_description: Option<String>,
    #[serde(default)]
    pub cargo_weight_kg: Option<Decimal>,
    #[serde(default)]
    pub cargo_volume_m3: Option<Decimal>,
    #[serde(default)]
    pub cargo_value: Option<Decimal>,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

/// Insert a quote in `calculating`, before it has a price
pub fn insert_quote(
    conn: &Connection,
    input: &CreateQuoteInput,
    now: DateTime<Utc>,
) -> Result<Quote, LedgerError> {
    for (name, value) in [
        ("cargo_weight_kg", input.cargo_weight_kg),
        ("cargo_volume_m3", input.cargo_volume_m3),
        ("cargo_value", input.cargo_value),
    ] {
        if value.is_some_and(|v| v.is_sign_negative()) {
            return Err(LedgerError::InvalidInput(format!("{} must not be negative", name)));
        }
    }

    let quote_id = Uuid::new_v4().to_string();
    conn.execute(
        r#"
        INSERT INTO quotes (
            quote_id, requester_id, service_id, origin_country, destination_country,
            cargo_description, cargo_weight_kg, cargo_volume_m3, cargo_value, currency,
            status, version, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12, ?12)
        "#,
        params![
            quote_id,
            input.requester_id,
            input.service_id,
            input.origin_country,
            input.destination_country,
            input.cargo_description,
            input.cargo_weight_kg.map(SqlDecimal),
            input.cargo_volume_m3.map(SqlDecimal),
            input.cargo_value.map(SqlDecimal),
            input.currency,
            QuoteStatus::Calculating,
            now,
        ],
    )?;

    debug!(quote_id = %quote_id, requester_id = %input.requester_id, "Inserted quote");

    get_quote(conn, &quote_id)?
        .ok_or_else(|| LedgerError::Internal("Quote not found after insert".into()))
}

/// Get a quote by ID
pub fn get_quote(conn: &Connection, quote_id: &str) -> Result<Option<Quote>, LedgerError> {
    Ok(conn
        .query_row(
            "SELECT * FROM quotes WHERE quote_id = ?1",
            params![quote_id],
            Quote::from_row,
        )
        .optional()?)
}

/// List a requester's quotes, newest first
pub fn list_for_requester(conn: &Connection, requester_id: &str) -> Result<Vec<Quote>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM quotes WHERE requester_id = ?1 ORDER BY created_at DESC",
    )?;
    let quotes = stmt
        .query_map(params![requester_id], Quote::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(quotes)
}

/// Quotes still open for acceptance
pub fn list_quoted(conn: &Connection) -> Result<Vec<Quote>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM quotes WHERE status = 'quoted' ORDER BY valid_until",
    )?;
    let quotes = stmt
        .query_map([], Quote::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(quotes)
}

fn check_transition(quote: &Quote, next: QuoteStatus) -> Result<(), LedgerError> {
    if !quote.status.can_transition_to(next) {
        return Err(LedgerError::InvalidState(format!(
            "quote {} cannot move from {} to {}",
            quote.quote_id, quote.status, next
        )));
    }
    Ok(())
}

fn reload(conn: &Connection, quote_id: &str) -> Result<Quote, LedgerError> {
    get_quote(conn, quote_id)?
        .ok_or_else(|| LedgerError::Internal(format!("quote {} vanished during update", quote_id)))
}

/// Record the computed price: `calculating -> quoted`
pub fn set_price(
    conn: &Connection,
    quote: &Quote,
    price: Decimal,
    now: DateTime<Utc>,
    valid_until: DateTime<Utc>,
) -> Result<Quote, LedgerError> {
    check_transition(quote, QuoteStatus::Quoted)?;

    let changed = conn.execute(
        r#"
        UPDATE quotes
        SET status = ?3, quoted_price = ?4, quoted_at = ?5, valid_until = ?6,
            version = version + 1, updated_at = ?5
        WHERE quote_id = ?1 AND version = ?2
        "#,
        params![
            quote.quote_id,
            quote.version,
            QuoteStatus::Quoted,
            SqlDecimal(price),
            now,
            valid_until
        ],
    )?;
    ensure_version_applied(changed, "quote", &quote.quote_id)?;

    reload(conn, &quote.quote_id)
}

/// Plain status change (accept, reject, expire)
pub fn transition(
    conn: &Connection,
    quote: &Quote,
    next: QuoteStatus,
    now: DateTime<Utc>,
) -> Result<Quote, LedgerError> {
    if next == QuoteStatus::Converted {
        return Err(LedgerError::InvalidState(
            "conversion must record the shipment id".into(),
        ));
    }
    check_transition(quote, next)?;

    let changed = conn.execute(
        r#"
        UPDATE quotes SET status = ?3, version = version + 1, updated_at = ?4
        WHERE quote_id = ?1 AND version = ?2
        "#,
        params![quote.quote_id, quote.version, next, now],
    )?;
    ensure_version_applied(changed, "quote", &quote.quote_id)?;

    reload(conn, &quote.quote_id)
}

/// `accepted -> converted`, linking the shipment
pub fn mark_converted(
    conn: &Connection,
    quote: &Quote,
    shipment_id: &str,
    now: DateTime<Utc>,
) -> Result<Quote, LedgerError> {
    if let Some(existing) = &quote.converted_to_shipment_id {
        return Err(LedgerError::AlreadyConverted {
            quote_id: quote.quote_id.clone(),
            shipment_id: existing.clone(),
        });
    }
    check_transition(quote, QuoteStatus::Converted)?;

    let changed = conn.execute(
        r#"
        UPDATE quotes
        SET status = ?3, converted_to_shipment_id = ?4, converted_at = ?5,
            version = version + 1, updated_at = ?5
        WHERE quote_id = ?1 AND version = ?2 AND converted_to_shipment_id IS NULL
        "#,
        params![quote.quote_id, quote.version, QuoteStatus::Converted, shipment_id, now],
    )?;
    ensure_version_applied(changed, "quote", &quote.quote_id)?;

    reload(conn, &quote.quote_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::freight_services::{upsert_service, UpsertServiceInput};
    use crate::db::test_support::temp_db;
    use crate::db::LedgerDb;
    use rust_decimal_macros::dec;

    fn quoted(db: &LedgerDb) -> Quote {
        db.with_exclusive(|tx| {
            let service = upsert_service(
                tx,
                &UpsertServiceInput {
                    service_id: None,
                    service_name: "Ocean".into(),
                    service_type: "sea".into(),
                    base_rate: None,
                    currency: "USD".into(),
                    max_daily_capacity_kg: None,
                    max_daily_capacity_m3: None,
                    is_active: true,
                },
            )?;
            let now = Utc::now();
            let quote = insert_quote(
                tx,
                &CreateQuoteInput {
                    requester_id: "user-9".into(),
                    service_id: service.service_id,
                    origin_country: "CN".into(),
                    destination_country: "US".into(),
                    cargo_description: None,
                    cargo_weight_kg: Some(dec!(5)),
                    cargo_volume_m3: None,
                    cargo_value: None,
                    currency: "USD".into(),
                },
                now,
            )?;
            set_price(tx, &quote, dec!(500), now, now + chrono::Duration::days(7))
        })
        .unwrap()
    }

    #[test]
    fn test_insert_then_price() {
        let (db, _dir) = temp_db();
        let quote = quoted(&db);
        assert_eq!(quote.status, QuoteStatus::Quoted);
        assert_eq!(quote.quoted_price, Some(dec!(500)));
        assert_eq!(quote.version, 1);
        assert!(!quote.is_past_validity(Utc::now()));

        let listed = db.with_conn(|c| list_for_requester(c, "user-9")).unwrap();
        assert_eq!(listed, vec![quote]);
    }

    #[test]
    fn test_stale_version_loses() {
        let (db, _dir) = temp_db();
        let quote = quoted(&db);

        db.with_exclusive(|tx| transition(tx, &quote, QuoteStatus::Accepted, Utc::now()))
            .unwrap();
        let err = db
            .with_exclusive(|tx| transition(tx, &quote, QuoteStatus::Rejected, Utc::now()))
            .unwrap_err();
        assert!(matches!(err, LedgerError::ConcurrentModification { entity: "quote", .. }));
    }

    #[test]
    fn test_convert_links_shipment_once() {
        let (db, _dir) = temp_db();
        let quote = quoted(&db);
        let accepted = db
            .with_exclusive(|tx| transition(tx, &quote, QuoteStatus::Accepted, Utc::now()))
            .unwrap();

        let converted = db
            .with_exclusive(|tx| mark_converted(tx, &accepted, "ship-1", Utc::now()))
            .unwrap();
        assert_eq!(converted.status, QuoteStatus::Converted);
        assert_eq!(converted.converted_to_shipment_id.as_deref(), Some("ship-1"));
        assert!(converted.converted_at.is_some());

        let err = db
            .with_exclusive(|tx| mark_converted(tx, &converted, "ship-2", Utc::now()))
            .unwrap_err();
        match err {
            LedgerError::AlreadyConverted { shipment_id, .. } => assert_eq!(shipment_id, "ship-1"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_converted_requires_shipment_id() {
        let (db, _dir) = temp_db();
        let quote = quoted(&db);
        let err = db
            .with_exclusive(|tx| transition(tx, &quote, QuoteStatus::Converted, Utc::now()))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState(_)));
    }

    #[test]
    fn test_already_converted_snapshot() {
        let (db, _dir) = temp_db();
        let mut quote = quoted(&db);
        quote.converted_to_shipment_id = Some("ship-0".into());
        let err = db
            .with_exclusive(|tx| mark_converted(tx, &quote, "ship-1", Utc::now()))
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyConverted { .. }));
    }
}
