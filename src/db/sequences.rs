//! Sequence allocator
//!
//! Counters live in the `sequences` table and are advanced by a single
//! `UPDATE ... RETURNING` that also formats the identifier, so no caller ever
//! reads a counter value in application memory and writes it back. Run inside
//! a caller's transaction, a rollback also gives the number back.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::LedgerError;

/// Shipment tracking numbers
pub const TRACKING: &str = "tracking";
/// Invoice numbers
pub const INVOICE: &str = "invoice";

/// Draw the next identifier of `name`
pub fn allocate(conn: &Connection, name: &str) -> Result<String, LedgerError> {
    let value: Option<String> = conn
        .query_row(
            "UPDATE sequences SET next_value = next_value + 1 WHERE name = ?1 \
             RETURNING prefix || printf('%0' || width || 'd', next_value - 1)",
            params![name],
            |row| row.get(0),
        )
        .optional()?;

    let value = value.ok_or_else(|| LedgerError::Sequence(format!("unknown sequence '{}'", name)))?;
    debug!(sequence = name, value = %value, "Allocated sequence value");
    Ok(value)
}

/// Change the prefix used for future allocations
pub fn set_prefix(conn: &Connection, name: &str, prefix: &str) -> Result<(), LedgerError> {
    let changed = conn.execute(
        "UPDATE sequences SET prefix = ?2 WHERE name = ?1",
        params![name, prefix],
    )?;

    if changed == 0 {
        return Err(LedgerError::Sequence(format!("unknown sequence '{}'", name)));
    }
    Ok(())
}
