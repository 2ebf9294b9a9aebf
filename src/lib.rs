//! Freight Ledger - booking and settlement core for a freight forwarder
//!
//! Turns accepted price quotes into booked shipments, keeps per-day carrier
//! capacity from being oversold, and settles shipment balances exactly once
//! per payment attempt.
//!
//! ## Architecture
//!
//! - **Sequence allocator**: store-side counters for tracking and invoice numbers
//! - **Capacity ledger**: reserved vs. max weight/volume per (service, date)
//! - **Quote lifecycle**: pricing, acceptance window, expiry
//! - **Conversion flow**: quote to shipment plus capacity booking, atomically
//! - **Settlement ledger**: idempotent payments against shipment balances
//!
//! All state lives in one SQLite file. Any number of threads or processes may
//! open it; correctness comes from the store's write lease and uniqueness
//! constraints, never from in-process locks.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/freight-ledger/
//! ├── ledger.db       # SQLite (WAL mode)
//! └── config.toml     # Configuration
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod services;

pub use config::Config;
pub use db::LedgerDb;
pub use error::LedgerError;
pub use services::Services;
