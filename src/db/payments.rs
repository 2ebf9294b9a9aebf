//! Settlement ledger
//!
//! Payments are append-only rows keyed by a caller-supplied idempotency key.
//! The key is a storage-level uniqueness constraint, so at most one row per key
//! is ever committed no matter how many connections race on it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::models::{PaymentStatus, TransactionStatus};
use super::{get_decimal, shipments, SqlDecimal};
use crate::error::LedgerError;

/// Payment transaction row from database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub transaction_id: String,
    pub shipment_id: String,
    pub idempotency_key: String,
    pub amount: Decimal,
    pub currency: String,
    pub transaction_type: String,
    pub payment_method: Option<String>,
    pub status: TransactionStatus,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PaymentTransaction {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            transaction_id: row.get("transaction_id")?,
            shipment_id: row.get("shipment_id")?,
            idempotency_key: row.get("idempotency_key")?,
            amount: get_decimal(row, "amount")?,
            currency: row.get("currency")?,
            transaction_type: row.get("transaction_type")?,
            payment_method: row.get("payment_method")?,
            status: row.get("status")?,
            processed_at: row.get("processed_at")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// A request to settle part or all of a shipment's balance
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentRequest {
    pub shipment_id: String,
    pub amount: Decimal,
    pub currency: String,
    #[serde(default)]
    pub payment_method: Option<String>,
    pub idempotency_key: String,
}

impl PaymentRequest {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidInput(format!(
                "payment amount must be positive, got {}",
                self.amount
            )));
        }
        if self.idempotency_key.trim().is_empty() {
            return Err(LedgerError::InvalidInput("idempotency key must not be empty".into()));
        }
        Ok(())
    }
}

/// Result of applying a payment request
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentOutcome {
    /// A new transaction row was written
    Recorded(PaymentTransaction),
    /// The key was already recorded; this is that row, untouched
    Replayed(PaymentTransaction),
}

impl PaymentOutcome {
    pub fn transaction(&self) -> &PaymentTransaction {
        match self {
            PaymentOutcome::Recorded(t) | PaymentOutcome::Replayed(t) => t,
        }
    }

    pub fn into_transaction(self) -> PaymentTransaction {
        match self {
            PaymentOutcome::Recorded(t) | PaymentOutcome::Replayed(t) => t,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, PaymentOutcome::Replayed(_))
    }
}

/// Look up the transaction recorded under an idempotency key
pub fn find_by_idempotency_key(
    conn: &Connection,
    idempotency_key: &str,
) -> Result<Option<PaymentTransaction>, LedgerError> {
    Ok(conn
        .query_row(
            "SELECT * FROM payment_transactions WHERE idempotency_key = ?1",
            params![idempotency_key],
            PaymentTransaction::from_row,
        )
        .optional()?)
}

/// All transactions of a shipment, oldest first
pub fn list_for_shipment(
    conn: &Connection,
    shipment_id: &str,
) -> Result<Vec<PaymentTransaction>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM payment_transactions WHERE shipment_id = ?1 ORDER BY created_at, transaction_id",
    )?;
    let transactions = stmt
        .query_map(params![shipment_id], PaymentTransaction::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(transactions)
}

fn insert_transaction(
    conn: &Connection,
    request: &PaymentRequest,
    now: DateTime<Utc>,
) -> Result<PaymentTransaction, LedgerError> {
    let transaction_id = Uuid::new_v4().to_string();
    conn.execute(
        r#"
        INSERT INTO payment_transactions (
            transaction_id, shipment_id, idempotency_key, amount, currency,
            transaction_type, payment_method, status, processed_at, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, 'payment', ?6, ?7, ?8, ?8)
        "#,
        params![
            transaction_id,
            request.shipment_id,
            request.idempotency_key,
            SqlDecimal(request.amount),
            request.currency,
            request.payment_method,
            TransactionStatus::Completed,
            now,
        ],
    )?;

    find_by_idempotency_key(conn, &request.idempotency_key)?
        .ok_or_else(|| LedgerError::Internal("Payment not found after insert".into()))
}

/// Apply a payment to a shipment's balance (caller holds the exclusive lease).
///
/// A key that was already recorded returns its transaction unchanged. A
/// payment that would drive `amount_due` below zero fails with
/// [`LedgerError::Overpayment`] before anything is written.
pub fn process_payment(
    tx: &Transaction<'_>,
    request: &PaymentRequest,
    now: DateTime<Utc>,
) -> Result<PaymentOutcome, LedgerError> {
    request.validate()?;

    if let Some(existing) = find_by_idempotency_key(tx, &request.idempotency_key)? {
        debug!(idempotency_key = %request.idempotency_key, "Replayed payment");
        return Ok(PaymentOutcome::Replayed(existing));
    }

    let shipment = shipments::get_shipment(tx, &request.shipment_id)?
        .ok_or_else(|| LedgerError::NotFound(format!("shipment {}", request.shipment_id)))?;

    // a sum past Decimal::MAX is necessarily more than any total_cost
    let balances = shipment
        .amount_paid
        .checked_add(request.amount)
        .map(|paid| (paid, shipment.total_cost - paid))
        .filter(|(_, due)| !due.is_sign_negative());
    let Some((amount_paid, amount_due)) = balances else {
        return Err(LedgerError::Overpayment {
            shipment_id: shipment.shipment_id,
            amount_due: shipment.amount_due,
            attempted: request.amount,
        });
    };

    let transaction = insert_transaction(tx, request, now)?;

    let payment_status = if amount_due.is_zero() {
        PaymentStatus::Paid
    } else {
        PaymentStatus::Partial
    };
    shipments::apply_payment(tx, &shipment.shipment_id, amount_paid, amount_due, payment_status, now)?;

    info!(
        shipment_id = %shipment.shipment_id,
        transaction_id = %transaction.transaction_id,
        amount = %request.amount,
        amount_due = %amount_due,
        %payment_status,
        "Processed payment"
    );

    Ok(PaymentOutcome::Recorded(transaction))
}
