//! Database schema definitions

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::LedgerError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), LedgerError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new ledger schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(conn, current_version)?;
    } else {
        info!("Ledger schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, LedgerError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| LedgerError::Internal(format!("Failed to create schema_version table: {}", e)))?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), LedgerError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| LedgerError::Internal(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| LedgerError::Internal(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(MASTER_DATA_SCHEMA)
        .map_err(|e| LedgerError::Internal(format!("Failed to create master data tables: {}", e)))?;

    conn.execute_batch(BOOKING_SCHEMA)
        .map_err(|e| LedgerError::Internal(format!("Failed to create booking tables: {}", e)))?;

    conn.execute_batch(SETTLEMENT_SCHEMA)
        .map_err(|e| LedgerError::Internal(format!("Failed to create settlement tables: {}", e)))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| LedgerError::Internal(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), LedgerError> {
    match from_version {
        // 1 -> 2 steps go here once v2 exists
        _ => {}
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Counters and master data
const MASTER_DATA_SCHEMA: &str = r#"
-- Store-side counters; next_value is what the next allocation hands out
CREATE TABLE IF NOT EXISTS sequences (
    name TEXT PRIMARY KEY NOT NULL,
    prefix TEXT NOT NULL,
    width INTEGER NOT NULL CHECK (width BETWEEN 1 AND 18),
    next_value INTEGER NOT NULL DEFAULT 1
);

INSERT OR IGNORE INTO sequences (name, prefix, width) VALUES ('tracking', 'FLT', 10);
INSERT OR IGNORE INTO sequences (name, prefix, width) VALUES ('invoice', 'INV-', 8);

CREATE TABLE IF NOT EXISTS freight_services (
    service_id INTEGER PRIMARY KEY AUTOINCREMENT,
    service_name TEXT NOT NULL,
    service_type TEXT NOT NULL CHECK (service_type IN ('sea', 'air', 'land')),
    base_rate TEXT,
    currency TEXT NOT NULL DEFAULT 'USD',

    -- NULL means unconstrained
    max_daily_capacity_kg TEXT,
    max_daily_capacity_m3 TEXT,

    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Quotes, shipments and capacity
const BOOKING_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS quotes (
    quote_id TEXT PRIMARY KEY NOT NULL,
    requester_id TEXT NOT NULL,
    service_id INTEGER NOT NULL REFERENCES freight_services(service_id),
    origin_country TEXT NOT NULL,
    destination_country TEXT NOT NULL,

    cargo_description TEXT,
    cargo_weight_kg TEXT,
    cargo_volume_m3 TEXT,
    cargo_value TEXT,
    currency TEXT NOT NULL DEFAULT 'USD',

    status TEXT NOT NULL DEFAULT 'pending',
    quoted_price TEXT,
    quoted_at TEXT,
    valid_until TEXT,

    converted_to_shipment_id TEXT UNIQUE,
    converted_at TEXT,

    version INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    CHECK ((converted_to_shipment_id IS NOT NULL) = (status = 'converted'))
);

CREATE TABLE IF NOT EXISTS shipments (
    shipment_id TEXT PRIMARY KEY NOT NULL,
    tracking_number TEXT NOT NULL UNIQUE,
    -- one shipment per quote, ever
    quote_id TEXT UNIQUE REFERENCES quotes(quote_id),
    requester_id TEXT NOT NULL,
    service_id INTEGER NOT NULL REFERENCES freight_services(service_id),
    origin_country TEXT NOT NULL,
    destination_country TEXT NOT NULL,

    cargo_description TEXT,
    cargo_weight_kg TEXT,
    cargo_volume_m3 TEXT,
    declared_value TEXT,
    currency TEXT NOT NULL DEFAULT 'USD',

    shipment_status TEXT NOT NULL DEFAULT 'pending',
    previous_status TEXT,
    status_changed_at TEXT,
    estimated_pickup_date TEXT,

    total_cost TEXT NOT NULL,
    amount_paid TEXT NOT NULL DEFAULT '0',
    amount_due TEXT NOT NULL CHECK (CAST(amount_due AS REAL) >= 0),
    payment_status TEXT NOT NULL DEFAULT 'unpaid',

    version INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Append-only tracking history
CREATE TABLE IF NOT EXISTS tracking_events (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    shipment_id TEXT NOT NULL REFERENCES shipments(shipment_id),
    event_status TEXT NOT NULL,
    event_description TEXT,
    event_source TEXT NOT NULL DEFAULT 'system',
    event_timestamp TEXT NOT NULL
);

-- One row per (service, date); created lazily, never deleted
CREATE TABLE IF NOT EXISTS capacity_ledger (
    entry_id TEXT PRIMARY KEY NOT NULL,
    service_id INTEGER NOT NULL REFERENCES freight_services(service_id),
    booking_date TEXT NOT NULL,
    reserved_weight_kg TEXT NOT NULL DEFAULT '0',
    reserved_volume_m3 TEXT NOT NULL DEFAULT '0',
    max_weight_kg TEXT,
    max_volume_m3 TEXT,
    version INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    UNIQUE (service_id, booking_date)
);

CREATE TABLE IF NOT EXISTS reservations (
    reservation_id TEXT PRIMARY KEY NOT NULL,
    shipment_id TEXT NOT NULL REFERENCES shipments(shipment_id),
    entry_id TEXT NOT NULL REFERENCES capacity_ledger(entry_id),
    reserved_weight_kg TEXT NOT NULL,
    reserved_volume_m3 TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL,
    released_at TEXT
);
"#;

/// Payments and the notification queue
const SETTLEMENT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS payment_transactions (
    transaction_id TEXT PRIMARY KEY NOT NULL,
    shipment_id TEXT NOT NULL REFERENCES shipments(shipment_id),
    idempotency_key TEXT NOT NULL UNIQUE,
    amount TEXT NOT NULL,
    currency TEXT NOT NULL,
    transaction_type TEXT NOT NULL DEFAULT 'payment',
    payment_method TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    processed_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS notification_queue (
    queue_id INTEGER PRIMARY KEY AUTOINCREMENT,
    requester_id TEXT NOT NULL,
    shipment_id TEXT,
    notification_type TEXT NOT NULL,
    dedup_key TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    message TEXT NOT NULL,
    metadata_json TEXT,
    send_via TEXT NOT NULL DEFAULT 'in_app',
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
"#;

/// Index definitions for fast queries
const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_quotes_requester ON quotes(requester_id);
CREATE INDEX IF NOT EXISTS idx_quotes_status_valid ON quotes(status, valid_until);

CREATE INDEX IF NOT EXISTS idx_shipments_requester ON shipments(requester_id);
CREATE INDEX IF NOT EXISTS idx_shipments_status ON shipments(shipment_status);

CREATE INDEX IF NOT EXISTS idx_tracking_events_shipment ON tracking_events(shipment_id, event_id);

CREATE INDEX IF NOT EXISTS idx_reservations_shipment ON reservations(shipment_id);
CREATE INDEX IF NOT EXISTS idx_reservations_entry ON reservations(entry_id);
-- a shipment holds at most one live claim per entry; released rows don't count
CREATE UNIQUE INDEX IF NOT EXISTS idx_reservations_live
    ON reservations(shipment_id, entry_id) WHERE status <> 'released';

CREATE INDEX IF NOT EXISTS idx_payments_shipment ON payment_transactions(shipment_id);

CREATE INDEX IF NOT EXISTS idx_notifications_status ON notification_queue(status);
"#;
