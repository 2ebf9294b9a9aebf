//! Capacity service - booking against the per-day capacity ledger
//!
//! Every mutation here is one exclusive unit of work, so concurrent callers on
//! the same (service, date) are strictly serialized by the store.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;

use crate::db::{capacity, shipments, LedgerDb, LedgerEntry, Reservation, Shipment};
use crate::error::LedgerError;

use super::events::{EventBus, LedgerEvent};

pub struct CapacityService {
    db: Arc<LedgerDb>,
    events: Arc<EventBus>,
}

impl CapacityService {
    pub fn new(db: Arc<LedgerDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Advisory only: a later `reserve_capacity` can still fail
    pub fn check_availability(
        &self,
        booking_date: NaiveDate,
        service_id: i64,
        weight_kg: Option<Decimal>,
        volume_m3: Option<Decimal>,
    ) -> Result<bool, LedgerError> {
        self.db.with_conn(|conn| {
            capacity::check_availability(conn, booking_date, service_id, weight_kg, volume_m3)
        })
    }

    pub fn get_entry(
        &self,
        service_id: i64,
        booking_date: NaiveDate,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        self.db
            .with_conn(|conn| capacity::find_entry(conn, service_id, booking_date))
    }

    pub fn reservations_for_shipment(&self, shipment_id: &str) -> Result<Vec<Reservation>, LedgerError> {
        self.db
            .with_conn(|conn| capacity::reservations_for_shipment(conn, shipment_id))
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Reserve capacity for an existing shipment.
    ///
    /// The shipment is re-read under the lease, so the booking uses its
    /// committed weight, volume and pickup date rather than the caller's copy.
    pub fn reserve_capacity(&self, shipment: &Shipment) -> Result<Reservation, LedgerError> {
        let reservation = self.db.with_exclusive(|tx| {
            let current = shipments::get_shipment(tx, &shipment.shipment_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("shipment {}", shipment.shipment_id)))?;
            capacity::reserve(tx, &current, Utc::now())
        })?;

        self.emit_reserved(&reservation);
        Ok(reservation)
    }

    /// Release a reservation, returning its increment to the ledger
    pub fn release(&self, reservation_id: &str) -> Result<Reservation, LedgerError> {
        let reservation = self
            .db
            .with_exclusive(|tx| capacity::release_reservation(tx, reservation_id, Utc::now()))?;

        self.events.emit(LedgerEvent::CapacityReleased {
            reservation_id: reservation.reservation_id.clone(),
        });
        Ok(reservation)
    }

    /// Mark a reservation as consumed
    pub fn confirm(&self, reservation_id: &str) -> Result<Reservation, LedgerError> {
        let reservation = self
            .db
            .with_exclusive(|tx| capacity::confirm_reservation(tx, reservation_id))?;

        self.events.emit(LedgerEvent::CapacityConfirmed {
            reservation_id: reservation.reservation_id.clone(),
        });
        Ok(reservation)
    }

    fn emit_reserved(&self, reservation: &Reservation) {
        self.events.emit(LedgerEvent::CapacityReserved {
            reservation_id: reservation.reservation_id.clone(),
            shipment_id: reservation.shipment_id.clone(),
            entry_id: reservation.entry_id.clone(),
        });
    }
}
