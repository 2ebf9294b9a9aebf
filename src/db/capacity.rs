//! Capacity ledger and reservation records
//!
//! One `capacity_ledger` row per (service, booking date) aggregates every
//! reservation made against that day. The row is the contention point for all
//! concurrent bookings, so every mutating function here takes a
//! [`Transaction`] and expects the caller to hold the exclusive write lease
//! (see [`crate::db::LedgerDb::with_exclusive`]) from the first read until
//! commit.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::freight_services;
use super::models::ReservationStatus;
use super::shipments::Shipment;
use super::{get_decimal, get_opt_decimal, is_unique_violation, SqlDecimal};
use crate::error::LedgerError;

/// Reserved vs. configured maxima for one (service, date)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub service_id: i64,
    pub booking_date: NaiveDate,
    pub reserved_weight_kg: Decimal,
    pub reserved_volume_m3: Decimal,
    /// `None` means unconstrained
    pub max_weight_kg: Option<Decimal>,
    pub max_volume_m3: Option<Decimal>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            entry_id: row.get("entry_id")?,
            service_id: row.get("service_id")?,
            booking_date: row.get("booking_date")?,
            reserved_weight_kg: get_decimal(row, "reserved_weight_kg")?,
            reserved_volume_m3: get_decimal(row, "reserved_volume_m3")?,
            max_weight_kg: get_opt_decimal(row, "max_weight_kg")?,
            max_volume_m3: get_opt_decimal(row, "max_volume_m3")?,
            version: row.get("version")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    /// Totals after adding an increment, or the dimension that would overflow
    pub fn candidate_totals(
        &self,
        weight_kg: Decimal,
        volume_m3: Decimal,
    ) -> Result<(Decimal, Decimal), &'static str> {
        let weight = self
            .reserved_weight_kg
            .checked_add(weight_kg)
            .filter(|total| self.max_weight_kg.map_or(true, |max| *total <= max))
            .ok_or("weight")?;
        let volume = self
            .reserved_volume_m3
            .checked_add(volume_m3)
            .filter(|total| self.max_volume_m3.map_or(true, |max| *total <= max))
            .ok_or("volume")?;

        Ok((weight, volume))
    }
}

/// A shipment's claim against a ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: String,
    pub shipment_id: String,
    pub entry_id: String,
    pub reserved_weight_kg: Decimal,
    pub reserved_volume_m3: Decimal,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl Reservation {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            reservation_id: row.get("reservation_id")?,
            shipment_id: row.get("shipment_id")?,
            entry_id: row.get("entry_id")?,
            reserved_weight_kg: get_decimal(row, "reserved_weight_kg")?,
            reserved_volume_m3: get_decimal(row, "reserved_volume_m3")?,
            status: row.get("status")?,
            created_at: row.get("created_at")?,
            released_at: row.get("released_at")?,
        })
    }
}

// ============================================================================
// Read Operations
// ============================================================================

/// Get the ledger entry for a (service, date), if one was ever created
pub fn find_entry(
    conn: &Connection,
    service_id: i64,
    booking_date: NaiveDate,
) -> Result<Option<LedgerEntry>, LedgerError> {
    Ok(conn
        .query_row(
            "SELECT * FROM capacity_ledger WHERE service_id = ?1 AND booking_date = ?2",
            params![service_id, booking_date],
            LedgerEntry::from_row,
        )
        .optional()?)
}

/// Get a ledger entry by ID
pub fn get_entry(conn: &Connection, entry_id: &str) -> Result<Option<LedgerEntry>, LedgerError> {
    Ok(conn
        .query_row(
            "SELECT * FROM capacity_ledger WHERE entry_id = ?1",
            params![entry_id],
            LedgerEntry::from_row,
        )
        .optional()?)
}

/// List the ledger entries of a service, earliest date first
pub fn list_entries_for_service(
    conn: &Connection,
    service_id: i64,
) -> Result<Vec<LedgerEntry>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM capacity_ledger WHERE service_id = ?1 ORDER BY booking_date",
    )?;
    let entries = stmt
        .query_map(params![service_id], LedgerEntry::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Advisory availability check.
///
/// Never writes, so the answer can be stale by the time a real reservation
/// runs. True when no entry exists yet for the key.
pub fn check_availability(
    conn: &Connection,
    booking_date: NaiveDate,
    service_id: i64,
    weight_kg: Option<Decimal>,
    volume_m3: Option<Decimal>,
) -> Result<bool, LedgerError> {
    let entry = match find_entry(conn, service_id, booking_date)? {
        Some(entry) => entry,
        None => return Ok(true),
    };

    Ok(entry
        .candidate_totals(
            weight_kg.unwrap_or(Decimal::ZERO),
            volume_m3.unwrap_or(Decimal::ZERO),
        )
        .is_ok())
}

/// Get a reservation by ID
pub fn get_reservation(
    conn: &Connection,
    reservation_id: &str,
) -> Result<Option<Reservation>, LedgerError> {
    Ok(conn
        .query_row(
            "SELECT * FROM reservations WHERE reservation_id = ?1",
            params![reservation_id],
            Reservation::from_row,
        )
        .optional()?)
}

/// All reservations backing a shipment, oldest first
pub fn reservations_for_shipment(
    conn: &Connection,
    shipment_id: &str,
) -> Result<Vec<Reservation>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM reservations WHERE shipment_id = ?1 ORDER BY created_at",
    )?;
    let reservations = stmt
        .query_map(params![shipment_id], Reservation::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(reservations)
}

/// Sum of increments still held against an entry (active + confirmed)
pub fn held_totals(conn: &Connection, entry_id: &str) -> Result<(Decimal, Decimal), LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM reservations WHERE entry_id = ?1 AND status <> 'released'",
    )?;
    let held = stmt
        .query_map(params![entry_id], Reservation::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(held.iter().fold((Decimal::ZERO, Decimal::ZERO), |(w, v), r| {
        (w + r.reserved_weight_kg, v + r.reserved_volume_m3)
    }))
}

// ============================================================================
// Write Operations (caller holds the exclusive lease)
// ============================================================================

/// Fetch the entry for the key, creating it from the service's maxima if absent.
///
/// A concurrent creator winning the insert shows up as a unique-key conflict;
/// the existing row is then re-read and trusted as-is, maxima included.
fn entry_for_update(
    tx: &Transaction<'_>,
    service_id: i64,
    booking_date: NaiveDate,
    now: DateTime<Utc>,
) -> Result<LedgerEntry, LedgerError> {
    if let Some(entry) = find_entry(tx, service_id, booking_date)? {
        return Ok(entry);
    }

    let service = freight_services::get_service(tx, service_id)?
        .ok_or_else(|| LedgerError::NotFound(format!("freight service {}", service_id)))?;

    let entry_id = Uuid::new_v4().to_string();
    let inserted = tx.execute(
        r#"
        INSERT INTO capacity_ledger (
            entry_id, service_id, booking_date, reserved_weight_kg, reserved_volume_m3,
            max_weight_kg, max_volume_m3, version, created_at, updated_at
        ) VALUES (?1, ?2, ?3, '0', '0', ?4, ?5, 0, ?6, ?6)
        "#,
        params![
            entry_id,
            service_id,
            booking_date,
            service.max_daily_capacity_kg.map(SqlDecimal),
            service.max_daily_capacity_m3.map(SqlDecimal),
            now,
        ],
    );

    match inserted {
        Ok(_) => {
            debug!(service_id, %booking_date, "Created capacity ledger entry");
            get_entry(tx, &entry_id)?
                .ok_or_else(|| LedgerError::Internal("Ledger entry not found after insert".into()))
        }
        Err(e) if is_unique_violation(&e) => {
            warn!(service_id, %booking_date, "Ledger entry created concurrently, re-reading");
            find_entry(tx, service_id, booking_date)?.ok_or_else(|| {
                LedgerError::Internal("Failed to retrieve ledger entry after creation race".into())
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Reserve capacity for a shipment on its (service, pickup date).
///
/// Fails with no side effects when the shipment has no pickup date or when
/// either configured maximum would be exceeded.
pub fn reserve(
    tx: &Transaction<'_>,
    shipment: &Shipment,
    now: DateTime<Utc>,
) -> Result<Reservation, LedgerError> {
    let booking_date = shipment
        .estimated_pickup_date
        .ok_or_else(|| LedgerError::MissingBookingDate(shipment.shipment_id.clone()))?;

    if shipment.shipment_status.is_terminal() {
        return Err(LedgerError::InvalidState(format!(
            "shipment {} is {} and cannot reserve capacity",
            shipment.shipment_id, shipment.shipment_status
        )));
    }

    let already_held = reservations_for_shipment(tx, &shipment.shipment_id)?
        .into_iter()
        .any(|r| r.status != ReservationStatus::Released);
    if already_held {
        return Err(LedgerError::InvalidState(format!(
            "shipment {} already holds a capacity reservation",
            shipment.shipment_id
        )));
    }

    let entry = entry_for_update(tx, shipment.service_id, booking_date, now)?;

    let weight = shipment.cargo_weight_kg.unwrap_or(Decimal::ZERO);
    let volume = shipment.cargo_volume_m3.unwrap_or(Decimal::ZERO);

    let (new_weight, new_volume) =
        entry
            .candidate_totals(weight, volume)
            .map_err(|dimension| LedgerError::CapacityExceeded {
                service_id: shipment.service_id,
                date: booking_date,
                dimension,
            })?;

    tx.execute(
        r#"
        UPDATE capacity_ledger
        SET reserved_weight_kg = ?2, reserved_volume_m3 = ?3,
            version = version + 1, updated_at = ?4
        WHERE entry_id = ?1
        "#,
        params![entry.entry_id, SqlDecimal(new_weight), SqlDecimal(new_volume), now],
    )?;

    let reservation_id = Uuid::new_v4().to_string();
    tx.execute(
        r#"
        INSERT INTO reservations (
            reservation_id, shipment_id, entry_id, reserved_weight_kg, reserved_volume_m3,
            status, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            reservation_id,
            shipment.shipment_id,
            entry.entry_id,
            SqlDecimal(weight),
            SqlDecimal(volume),
            ReservationStatus::Active,
            now,
        ],
    )?;

    info!(
        shipment_id = %shipment.shipment_id,
        service_id = shipment.service_id,
        %booking_date,
        reserved_weight_kg = %new_weight,
        reserved_volume_m3 = %new_volume,
        "Reserved capacity"
    );

    get_reservation(tx, &reservation_id)?
        .ok_or_else(|| LedgerError::Internal("Reservation not found after insert".into()))
}

fn transition(
    tx: &Transaction<'_>,
    reservation_id: &str,
    next: ReservationStatus,
) -> Result<Reservation, LedgerError> {
    let reservation = get_reservation(tx, reservation_id)?
        .ok_or_else(|| LedgerError::NotFound(format!("reservation {}", reservation_id)))?;

    if !reservation.status.can_transition_to(next) {
        return Err(LedgerError::InvalidState(format!(
            "reservation {} cannot move from {} to {}",
            reservation_id, reservation.status, next
        )));
    }

    Ok(reservation)
}

/// Mark a reservation as consumed by a delivered shipment
pub fn confirm_reservation(
    tx: &Transaction<'_>,
    reservation_id: &str,
) -> Result<Reservation, LedgerError> {
    transition(tx, reservation_id, ReservationStatus::Confirmed)?;

    tx.execute(
        "UPDATE reservations SET status = ?2 WHERE reservation_id = ?1",
        params![reservation_id, ReservationStatus::Confirmed],
    )?;

    get_reservation(tx, reservation_id)?
        .ok_or_else(|| LedgerError::Internal("Reservation vanished during confirm".into()))
}

/// Release a reservation and hand its increment back to the ledger entry
pub fn release_reservation(
    tx: &Transaction<'_>,
    reservation_id: &str,
    now: DateTime<Utc>,
) -> Result<Reservation, LedgerError> {
    let reservation = transition(tx, reservation_id, ReservationStatus::Released)?;

    let entry = get_entry(tx, &reservation.entry_id)?
        .ok_or_else(|| LedgerError::Internal(format!("ledger entry {} missing", reservation.entry_id)))?;

    let new_weight = (entry.reserved_weight_kg - reservation.reserved_weight_kg).max(Decimal::ZERO);
    let new_volume = (entry.reserved_volume_m3 - reservation.reserved_volume_m3).max(Decimal::ZERO);

    tx.execute(
        r#"
        UPDATE capacity_ledger
        SET reserved_weight_kg = ?2, reserved_volume_m3 = ?3,
            version = version + 1, updated_at = ?4
        WHERE entry_id = ?1
        "#,
        params![entry.entry_id, SqlDecimal(new_weight), SqlDecimal(new_volume), now],
    )?;

    tx.execute(
        "UPDATE reservations SET status = ?2, released_at = ?3 WHERE reservation_id = ?1",
        params![reservation_id, ReservationStatus::Released, now],
    )?;

    info!(
        reservation_id,
        entry_id = %entry.entry_id,
        reserved_weight_kg = %new_weight,
        "Released capacity"
    );

    get_reservation(tx, reservation_id)?
        .ok_or_else(|| LedgerError::Internal("Reservation vanished during release".into()))
}
