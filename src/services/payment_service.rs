//! Payment service - idempotent settlement of shipment balances

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::db::notifications::{self, Notification};
use crate::db::payments::{self, PaymentOutcome, PaymentRequest};
use crate::db::{is_unique_violation, sequences, shipments, LedgerDb, PaymentTransaction};
use crate::error::LedgerError;

use super::events::{EventBus, LedgerEvent};
use super::notifier::{notify, Notifier};

pub struct PaymentService {
    db: Arc<LedgerDb>,
    events: Arc<EventBus>,
    notifier: Arc<dyn Notifier>,
}

impl PaymentService {
    pub fn new(db: Arc<LedgerDb>, events: Arc<EventBus>, notifier: Arc<dyn Notifier>) -> Self {
        Self { db, events, notifier }
    }

    pub fn list_for_shipment(&self, shipment_id: &str) -> Result<Vec<PaymentTransaction>, LedgerError> {
        self.db
            .with_conn(|conn| payments::list_for_shipment(conn, shipment_id))
    }

    pub fn find_by_idempotency_key(&self, key: &str) -> Result<Option<PaymentTransaction>, LedgerError> {
        self.db
            .with_conn(|conn| payments::find_by_idempotency_key(conn, key))
    }

    /// Apply a payment exactly once per idempotency key.
    ///
    /// Replaying a key returns the recorded transaction unchanged, whatever
    /// the replayed amount. Should two units race on a new key, the loser's
    /// insert hits the unique constraint, rolls back and returns the winner's
    /// row.
    pub fn process_payment(&self, request: PaymentRequest) -> Result<PaymentTransaction, LedgerError> {
        request.validate()?;

        let outcome = match self
            .db
            .with_exclusive(|tx| payments::process_payment(tx, &request, Utc::now()))
        {
            Ok(outcome) => outcome,
            Err(LedgerError::Database(e)) if is_unique_violation(&e) => {
                warn!(idempotency_key = %request.idempotency_key, "Lost idempotency race, re-reading");
                let winner = self.find_by_idempotency_key(&request.idempotency_key)?.ok_or_else(|| {
                    LedgerError::Internal("Failed to retrieve payment after idempotency race".into())
                })?;
                PaymentOutcome::Replayed(winner)
            }
            Err(e) => return Err(e),
        };

        match outcome {
            PaymentOutcome::Replayed(existing) => {
                debug!(transaction_id = %existing.transaction_id, "Returning recorded payment");
                Ok(existing)
            }
            PaymentOutcome::Recorded(transaction) => {
                self.events.emit(LedgerEvent::PaymentRecorded {
                    transaction_id: transaction.transaction_id.clone(),
                    shipment_id: transaction.shipment_id.clone(),
                    amount: transaction.amount,
                });
                self.notify_received(&transaction);
                Ok(transaction)
            }
        }
    }

    /// Draw the next invoice number
    pub fn allocate_invoice_number(&self) -> Result<String, LedgerError> {
        self.db
            .with_exclusive(|tx| sequences::allocate(tx, sequences::INVOICE))
    }

    fn notify_received(&self, transaction: &PaymentTransaction) {
        let shipment = match self
            .db
            .with_conn(|conn| shipments::get_shipment(conn, &transaction.shipment_id))
        {
            Ok(Some(shipment)) => shipment,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Skipping payment notification");
                return;
            }
        };

        notify(
            self.notifier.as_ref(),
            Notification {
                requester_id: shipment.requester_id,
                shipment_id: Some(shipment.shipment_id),
                notification_type: notifications::PAYMENT_RECEIVED.to_string(),
                title: "Payment Received".to_string(),
                message: format!(
                    "We received {} {} for shipment {}. Amount due: {}.",
                    transaction.amount, transaction.currency, shipment.tracking_number, shipment.amount_due
                ),
                metadata: Some(serde_json::json!({
                    "transaction_id": transaction.transaction_id,
                    "payment_status": shipment.payment_status,
                })),
            },
        );
    }
}
