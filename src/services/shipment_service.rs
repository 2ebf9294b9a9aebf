//! Shipment service - quote conversion and the shipment status lifecycle

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::info;

use crate::db::notifications::{self, Notification};
use crate::db::shipments::NewShipment;
use crate::db::{
    capacity, quotes, sequences, shipments, LedgerDb, QuoteStatus, Reservation,
    ReservationStatus, Shipment, ShipmentStatus, TrackingEvent,
};
use crate::error::LedgerError;

use super::events::{EventBus, LedgerEvent};
use super::notifier::{notify, Notifier};

/// What a successful conversion produced
#[derive(Debug, Clone, serde::Serialize)]
pub struct Conversion {
    pub shipment: Shipment,
    pub reservation: Reservation,
}

pub struct ShipmentService {
    db: Arc<LedgerDb>,
    events: Arc<EventBus>,
    notifier: Arc<dyn Notifier>,
}

impl ShipmentService {
    pub fn new(db: Arc<LedgerDb>, events: Arc<EventBus>, notifier: Arc<dyn Notifier>) -> Self {
        Self { db, events, notifier }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub fn get(&self, shipment_id: &str) -> Result<Option<Shipment>, LedgerError> {
        self.db
            .with_conn(|conn| shipments::get_shipment(conn, shipment_id))
    }

    pub fn get_by_tracking_number(&self, tracking_number: &str) -> Result<Option<Shipment>, LedgerError> {
        self.db
            .with_conn(|conn| shipments::get_by_tracking_number(conn, tracking_number))
    }

    pub fn list_for_requester(&self, requester_id: &str) -> Result<Vec<Shipment>, LedgerError> {
        self.db
            .with_conn(|conn| shipments::list_for_requester(conn, requester_id))
    }

    pub fn list_tracking_events(&self, shipment_id: &str) -> Result<Vec<TrackingEvent>, LedgerError> {
        self.db
            .with_conn(|conn| shipments::list_tracking_events(conn, shipment_id))
    }

    // =========================================================================
    // Conversion
    // =========================================================================

    /// Turn an accepted quote into a booked shipment.
    ///
    /// The tracking number, shipment row, initial tracking event, capacity
    /// reservation and quote link are one unit of work: if any step fails,
    /// none of them is visible afterwards and the tracking number is not
    /// consumed. The customer notification follows the commit and may fail
    /// on its own.
    pub fn convert_quote_to_shipment(
        &self,
        quote_id: &str,
        pickup_date: Option<NaiveDate>,
    ) -> Result<Conversion, LedgerError> {
        let now = Utc::now();

        let conversion = self.db.with_exclusive(|tx| {
            let quote = quotes::get_quote(tx, quote_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("quote {}", quote_id)))?;

            if let Some(shipment_id) = &quote.converted_to_shipment_id {
                return Err(LedgerError::AlreadyConverted {
                    quote_id: quote.quote_id.clone(),
                    shipment_id: shipment_id.clone(),
                });
            }
            if quote.status != QuoteStatus::Accepted {
                return Err(LedgerError::InvalidState(format!(
                    "quote must be accepted before conversion (quote {} is {})",
                    quote.quote_id, quote.status
                )));
            }

            let tracking_number = sequences::allocate(tx, sequences::TRACKING)?;
            let new_shipment = NewShipment::from_quote(&quote, tracking_number, pickup_date)?;
            let shipment = shipments::insert_shipment(tx, &new_shipment, now)?;

            shipments::append_tracking_event(
                tx,
                &shipment.shipment_id,
                ShipmentStatus::Pending,
                Some("Shipment created from quote"),
                "system",
                now,
            )?;

            let reservation = capacity::reserve(tx, &shipment, now)?;
            quotes::mark_converted(tx, &quote, &shipment.shipment_id, now)?;

            Ok(Conversion { shipment, reservation })
        })?;

        let shipment = &conversion.shipment;
        info!(
            quote_id,
            shipment_id = %shipment.shipment_id,
            tracking_number = %shipment.tracking_number,
            "Converted quote to shipment"
        );

        self.events.emit(LedgerEvent::QuoteStatusChanged {
            quote_id: quote_id.to_string(),
            status: QuoteStatus::Converted,
        });
        self.events.emit(LedgerEvent::ShipmentCreated {
            shipment_id: shipment.shipment_id.clone(),
            tracking_number: shipment.tracking_number.clone(),
            quote_id: shipment.quote_id.clone(),
        });
        self.events.emit(LedgerEvent::CapacityReserved {
            reservation_id: conversion.reservation.reservation_id.clone(),
            shipment_id: shipment.shipment_id.clone(),
            entry_id: conversion.reservation.entry_id.clone(),
        });

        notify(
            self.notifier.as_ref(),
            Notification {
                requester_id: shipment.requester_id.clone(),
                shipment_id: Some(shipment.shipment_id.clone()),
                notification_type: notifications::SHIPMENT_CREATED.to_string(),
                title: "Shipment Created".to_string(),
                message: format!("Your shipment {} has been created.", shipment.tracking_number),
                metadata: Some(serde_json::json!({
                    "tracking_number": shipment.tracking_number,
                    "quote_id": quote_id,
                })),
            },
        );

        Ok(conversion)
    }

    // =========================================================================
    // Status lifecycle
    // =========================================================================

    /// Advance a shipment through its status table.
    ///
    /// `delivered` confirms the shipment's live reservation and `cancelled`
    /// releases it, in the same unit of work as the status change.
    pub fn update_status(
        &self,
        shipment_id: &str,
        next: ShipmentStatus,
        description: Option<&str>,
        source: &str,
    ) -> Result<Shipment, LedgerError> {
        let current = self
            .get(shipment_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("shipment {}", shipment_id)))?;
        let now = Utc::now();

        let (updated, settled) = self.db.with_exclusive(|tx| {
            let updated = shipments::update_status(tx, &current, next, now)?;
            shipments::append_tracking_event(tx, shipment_id, next, description, source, now)?;

            let live = capacity::reservations_for_shipment(tx, shipment_id)?
                .into_iter()
                .filter(|r| r.status == ReservationStatus::Active);
            let mut settled = Vec::new();
            for reservation in live {
                match next {
                    ShipmentStatus::Delivered => {
                        settled.push(capacity::confirm_reservation(tx, &reservation.reservation_id)?);
                    }
                    ShipmentStatus::Cancelled => {
                        settled.push(capacity::release_reservation(tx, &reservation.reservation_id, now)?);
                    }
                    _ => {}
                }
            }

            Ok((updated, settled))
        })?;

        info!(
            shipment_id,
            from = %current.shipment_status,
            to = %next,
            "Shipment status updated"
        );

        self.events.emit(LedgerEvent::ShipmentStatusChanged {
            shipment_id: shipment_id.to_string(),
            from: current.shipment_status,
            to: next,
        });
        for reservation in settled {
            let reservation_id = reservation.reservation_id;
            self.events.emit(match reservation.status {
                ReservationStatus::Confirmed => LedgerEvent::CapacityConfirmed { reservation_id },
                _ => LedgerEvent::CapacityReleased { reservation_id },
            });
        }

        notify(
            self.notifier.as_ref(),
            Notification {
                requester_id: updated.requester_id.clone(),
                shipment_id: Some(updated.shipment_id.clone()),
                notification_type: notifications::SHIPMENT_STATUS_UPDATE.to_string(),
                title: "Shipment Status Updated".to_string(),
                message: format!(
                    "Your shipment {} is now {}.",
                    updated.tracking_number, next
                ),
                metadata: Some(serde_json::json!({
                    "previous_status": current.shipment_status,
                    "new_status": next,
                })),
            },
        );

        Ok(updated)
    }
}
