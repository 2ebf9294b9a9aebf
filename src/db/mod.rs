//! SQLite storage for the freight ledger
//!
//! ## Concurrency
//!
//! No connection is shared between units of work. Each call to
//! [`LedgerDb::with_conn`] or [`LedgerDb::with_exclusive`] opens its own
//! connection, so several threads or several processes can point at the same
//! database file and still observe one serial order of ledger mutations.
//!
//! Two write strategies coexist:
//!
//! - **Exclusive lease** (`with_exclusive`): `BEGIN IMMEDIATE` takes the write
//!   lease before the first read, and it is held until commit or rollback.
//!   Capacity reservations and payments use it for read-modify-write on the
//!   contended rows. A caller that cannot get the lease within the configured
//!   lock timeout receives [`LedgerError::LockTimeout`].
//! - **Optimistic version** ([`ensure_version_applied`]): quote and shipment
//!   updates carry `WHERE version = ?`, and a stale version surfaces as
//!   [`LedgerError::ConcurrentModification`].
//!
//! ## Tables
//!
//! - `sequences` - store-side counters for tracking/invoice numbers
//! - `freight_services` - master data sizing default capacity
//! - `capacity_ledger` - reserved vs. max per (service, date)
//! - `reservations` - per-shipment claims against a ledger entry
//! - `quotes`, `shipments`, `tracking_events`
//! - `payment_transactions` - one row per idempotency key
//! - `notification_queue` - best-effort customer notifications

pub mod schema;
pub mod models;
pub mod sequences;
pub mod freight_services;
pub mod capacity;
pub mod quotes;
pub mod shipments;
pub mod payments;
pub mod notifications;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::LedgerError;

/// Handle to the ledger database file
#[derive(Debug, Clone)]
pub struct LedgerDb {
    path: PathBuf,
    lock_timeout: Duration,
}

impl LedgerDb {
    /// Open or create the ledger database
    pub fn open(path: impl AsRef<Path>, lock_timeout: Duration) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        info!("Opening SQLite ledger at {:?}", path);

        let db = Self { path, lock_timeout };

        let conn = db.connect()?;
        schema::init_schema(&conn)?;

        Ok(db)
    }

    /// Open the database described by a config, applying its sequence prefixes
    pub fn open_with_config(config: &Config) -> Result<Self, LedgerError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let db = Self::open(config.database_path(), config.lock_timeout())?;

        db.with_exclusive(|tx| {
            sequences::set_prefix(tx, sequences::TRACKING, &config.tracking_prefix)?;
            sequences::set_prefix(tx, sequences::INVOICE, &config.invoice_prefix)
        })?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    fn connect(&self) -> Result<Connection, LedgerError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.lock_timeout)?;

        // WAL keeps readers off the writer's lease
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;

        Ok(conn)
    }

    /// Run read-only work on a fresh connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&Connection) -> Result<T, LedgerError>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    /// Run a unit of work under the exclusive write lease.
    ///
    /// Commits when `f` returns `Ok`; any `Err` drops the transaction, which
    /// rolls back every statement `f` executed.
    pub fn with_exclusive<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, LedgerError>,
    {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let value = f(&tx)?;

        tx.commit()?;
        debug!("Committed exclusive unit of work");
        Ok(value)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, LedgerError> {
        self.with_conn(|conn| {
            let count = |table: &str| -> Result<u64, LedgerError> {
                let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })?;
                Ok(n as u64)
            };

            Ok(DbStats {
                quote_count: count("quotes")?,
                shipment_count: count("shipments")?,
                ledger_entry_count: count("capacity_ledger")?,
                reservation_count: count("reservations")?,
                payment_count: count("payment_transactions")?,
                queued_notifications: count("notification_queue")?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub quote_count: u64,
    pub shipment_count: u64,
    pub ledger_entry_count: u64,
    pub reservation_count: u64,
    pub payment_count: u64,
    pub queued_notifications: u64,
}

/// Optimistic strategy: a version-guarded UPDATE that changed nothing lost a race.
pub fn ensure_version_applied(
    changed: usize,
    entity: &'static str,
    id: &str,
) -> Result<(), LedgerError> {
    if changed == 0 {
        return Err(LedgerError::ConcurrentModification {
            entity,
            id: id.to_string(),
        });
    }
    Ok(())
}

/// True when an INSERT failed on a UNIQUE or PRIMARY KEY constraint
pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    match e.sqlite_error() {
        Some(err) => {
            err.code == ErrorCode::ConstraintViolation
                && (err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        None => false,
    }
}

/// Decimal stored as TEXT so no precision is lost to REAL affinity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqlDecimal(pub Decimal);

impl ToSql for SqlDecimal {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.to_string()))
    }
}

impl FromSql for SqlDecimal {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Text(_) => Decimal::from_str(value.as_str()?)
                .map(SqlDecimal)
                .map_err(|e| FromSqlError::Other(Box::new(e))),
            ValueRef::Integer(i) => Ok(SqlDecimal(Decimal::from(i))),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

pub(crate) fn get_decimal(row: &rusqlite::Row<'_>, col: &str) -> rusqlite::Result<Decimal> {
    Ok(row.get::<_, SqlDecimal>(col)?.0)
}

pub(crate) fn get_opt_decimal(
    row: &rusqlite::Row<'_>,
    col: &str,
) -> rusqlite::Result<Option<Decimal>> {
    Ok(row.get::<_, Option<SqlDecimal>>(col)?.map(|d| d.0))
}

// Re-exports
pub use capacity::{LedgerEntry, Reservation};
pub use freight_services::{FreightService, UpsertServiceInput};
pub use models::{PaymentStatus, QuoteStatus, ReservationStatus, ShipmentStatus, TransactionStatus};
pub use payments::PaymentTransaction;
pub use quotes::{CreateQuoteInput, Quote};
pub use shipments::{Shipment, TrackingEvent};

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// Fresh database in a temp dir; keep the `TempDir` alive for the test.
    pub fn temp_db() -> (LedgerDb, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = LedgerDb::open(dir.path().join("ledger.db"), Duration::from_secs(5)).unwrap();
        (db, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_open_creates_schema() {
        let (db, _dir) = test_support::temp_db();
        let stats = db.stats().unwrap();
        assert_eq!(stats.quote_count, 0);
        assert_eq!(stats.ledger_entry_count, 0);
    }

    #[test]
    fn test_exclusive_rolls_back_on_error() {
        let (db, _dir) = test_support::temp_db();

        let result: Result<(), LedgerError> = db.with_exclusive(|tx| {
            tx.execute(
                "INSERT INTO freight_services (service_name, service_type) VALUES ('Gone', 'air')",
                [],
            )?;
            Err(LedgerError::InvalidState("abort".into()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM freight_services", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_decimal_keeps_scale() {
        let (db, _dir) = test_support::temp_db();
        let value: Decimal = db
            .with_conn(|conn| {
                let d: SqlDecimal =
                    conn.query_row("SELECT ?1", [SqlDecimal(dec!(12.50))], |r| r.get(0))?;
                Ok(d.0)
            })
            .unwrap();
        assert_eq!(value.to_string(), "12.50");
    }

    #[test]
    fn test_ensure_version_applied() {
        assert!(ensure_version_applied(1, "quote", "q1").is_ok());
        let err = ensure_version_applied(0, "quote", "q1").unwrap_err();
        assert!(matches!(err, LedgerError::ConcurrentModification { entity: "quote", .. }));
    }
}
