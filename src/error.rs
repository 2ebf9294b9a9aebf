//! Error types for freight-ledger

use rust_decimal::Decimal;
use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Quote {quote_id} already converted to shipment {shipment_id}")]
    AlreadyConverted { quote_id: String, shipment_id: String },

    #[error("Quote {0} expired before it was accepted")]
    QuoteExpired(String),

    #[error("Capacity exceeded: {dimension} limit reached for service {service_id} on {date}")]
    CapacityExceeded {
        service_id: i64,
        date: chrono::NaiveDate,
        dimension: &'static str,
    },

    #[error("Shipment {0} has no estimated pickup date for capacity reservation")]
    MissingBookingDate(String),

    #[error("Payment of {attempted} exceeds amount due {amount_due} on shipment {shipment_id}")]
    Overpayment {
        shipment_id: String,
        amount_due: Decimal,
        attempted: Decimal,
    },

    #[error("Concurrent modification of {entity} {id}; re-read and retry")]
    ConcurrentModification { entity: &'static str, id: String },

    #[error("Timed out waiting for write lock: {0}")]
    LockTimeout(String),

    #[error("Sequence error: {0}")]
    Sequence(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Safe to retry the same logical request unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::LockTimeout(_) | LedgerError::ConcurrentModification { .. }
        )
    }

    /// Rejected by a business rule rather than a system fault.
    pub fn is_business_rejection(&self) -> bool {
        matches!(
            self,
            LedgerError::CapacityExceeded { .. }
                | LedgerError::Overpayment { .. }
                | LedgerError::QuoteExpired(_)
                | LedgerError::AlreadyConverted { .. }
        )
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                LedgerError::LockTimeout(e.to_string())
            }
            _ => LedgerError::Database(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_maps_to_lock_timeout() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        let err = LedgerError::from(busy);
        assert!(matches!(err, LedgerError::LockTimeout(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_other_sqlite_errors_stay_database_errors() {
        let err = LedgerError::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(err, LedgerError::Database(_)));
        assert!(!err.is_transient());
        assert!(!err.is_business_rejection());
    }
}
