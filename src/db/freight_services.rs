//! Freight service master data
//!
//! Read by quoting (base rate) and by the capacity ledger, which seeds a new
//! (service, date) entry with the service's daily maxima.

use rust_decimal::Decimal;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{get_opt_decimal, SqlDecimal};
use crate::error::LedgerError;

pub const SERVICE_TYPES: [&str; 3] = ["sea", "air", "land"];

/// Freight service row from database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreightService {
    pub service_id: i64,
    pub service_name: String,
    pub service_type: String,
    pub base_rate: Option<Decimal>,
    pub currency: String,
    pub max_daily_capacity_kg: Option<Decimal>,
    pub max_daily_capacity_m3: Option<Decimal>,
    pub is_active: bool,
}

impl FreightService {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            service_id: row.get("service_id")?,
            service_name: row.get("service_name")?,
            service_type: row.get("service_type")?,
            base_rate: get_opt_decimal(row, "base_rate")?,
            currency: row.get("currency")?,
            max_daily_capacity_kg: get_opt_decimal(row, "max_daily_capacity_kg")?,
            max_daily_capacity_m3: get_opt_decimal(row, "max_daily_capacity_m3")?,
            is_active: row.get("is_active")?,
        })
    }
}

/// Input for creating or replacing a freight service
#[derive(Debug, Clone, Deserialize)]
pub struct UpsertServiceInput {
    #[serde(default)]
    pub service_id: Option<i64>,
    pub service_name: String,
    pub service_type: String,
    #[serde(default)]
    pub base_rate: Option<Decimal>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub max_daily_capacity_kg: Option<Decimal>,
    #[serde(default)]
    pub max_daily_capacity_m3: Option<Decimal>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_currency() -> String { "USD".to_string() }
fn default_true() -> bool { true }

/// Get a freight service by ID
pub fn get_service(conn: &Connection, service_id: i64) -> Result<Option<FreightService>, LedgerError> {
    Ok(conn
        .query_row(
            "SELECT * FROM freight_services WHERE service_id = ?1",
            params![service_id],
            FreightService::from_row,
        )
        .optional()?)
}

/// List freight services
pub fn list_services(conn: &Connection, active_only: bool) -> Result<Vec<FreightService>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM freight_services WHERE (?1 = 0 OR is_active = 1) ORDER BY service_id",
    )?;

    let services = stmt
        .query_map(params![active_only], FreightService::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(services)
}

/// Create a service, or replace it when `service_id` is given and exists
pub fn upsert_service(conn: &Connection, input: &UpsertServiceInput) -> Result<FreightService, LedgerError> {
    if !SERVICE_TYPES.contains(&input.service_type.as_str()) {
        return Err(LedgerError::InvalidInput(format!(
            "Invalid service type: {}. Valid types: {:?}",
            input.service_type, SERVICE_TYPES
        )));
    }

    for (name, value) in [
        ("base_rate", input.base_rate),
        ("max_daily_capacity_kg", input.max_daily_capacity_kg),
        ("max_daily_capacity_m3", input.max_daily_capacity_m3),
    ] {
        if value.is_some_and(|v| v.is_sign_negative()) {
            return Err(LedgerError::InvalidInput(format!("{} must not be negative", name)));
        }
    }

    conn.execute(
        r#"
        INSERT INTO freight_services (
            service_id, service_name, service_type, base_rate, currency,
            max_daily_capacity_kg, max_daily_capacity_m3, is_active
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(service_id) DO UPDATE SET
            service_name = excluded.service_name,
            service_type = excluded.service_type,
            base_rate = excluded.base_rate,
            currency = excluded.currency,
            max_daily_capacity_kg = excluded.max_daily_capacity_kg,
            max_daily_capacity_m3 = excluded.max_daily_capacity_m3,
            is_active = excluded.is_active,
            updated_at = datetime('now')
        "#,
        params![
            input.service_id,
            input.service_name,
            input.service_type,
            input.base_rate.map(SqlDecimal),
            input.currency,
            input.max_daily_capacity_kg.map(SqlDecimal),
            input.max_daily_capacity_m3.map(SqlDecimal),
            input.is_active,
        ],
    )?;

    let service_id = input.service_id.unwrap_or_else(|| conn.last_insert_rowid());
    debug!(service_id, name = %input.service_name, "Upserted freight service");

    get_service(conn, service_id)?
        .ok_or_else(|| LedgerError::Internal("Freight service not found after upsert".to_string()))
}
