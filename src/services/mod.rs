//! Service layer for freight-ledger
//!
//! Services sit between callers (the CLI, or an embedding application) and
//! the repository functions in `db`. Each service:
//! - validates input
//! - draws the transaction boundary for its operation
//! - emits events and notifications only after commit
//!
//! ## Architecture
//!
//! ```text
//! CLI / embedding application
//!     ↓
//! Service Layer (business logic, unit-of-work boundaries)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod events;
pub mod notifier;
pub mod capacity_service;
pub mod quote_service;
pub mod shipment_service;
pub mod payment_service;

// Re-exports
pub use capacity_service::CapacityService;
pub use events::{spawn_logging_listener, EventBus, EventListener, LedgerEvent, LoggingEventListener};
pub use notifier::{NoopNotifier, Notifier, QueueNotifier};
pub use payment_service::PaymentService;
pub use quote_service::{QuotePolicy, QuoteService};
pub use shipment_service::{Conversion, ShipmentService};

use std::sync::Arc;

use crate::config::Config;
use crate::db::{freight_services, FreightService, LedgerDb, UpsertServiceInput};
use crate::error::LedgerError;

/// Service container for dependency injection
pub struct Services {
    pub db: Arc<LedgerDb>,
    pub capacity: Arc<CapacityService>,
    pub quotes: Arc<QuoteService>,
    pub shipments: Arc<ShipmentService>,
    pub payments: Arc<PaymentService>,
    pub events: Arc<EventBus>,
}

impl Services {
    /// Create all services, queueing notifications in the ledger database
    pub fn new(db: LedgerDb, config: &Config) -> Result<Self, LedgerError> {
        let notifier: Arc<dyn Notifier> = Arc::new(QueueNotifier::new(db.clone()));
        Ok(Self::with_notifier(db, QuotePolicy::from_config(config)?, notifier))
    }

    /// Create all services with an explicit pricing policy and notifier
    pub fn with_notifier(
        db: LedgerDb,
        policy: QuotePolicy,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let db = Arc::new(db);
        let events = Arc::new(EventBus::new());

        Self {
            capacity: Arc::new(CapacityService::new(db.clone(), events.clone())),
            quotes: Arc::new(QuoteService::new(db.clone(), events.clone(), policy)),
            shipments: Arc::new(ShipmentService::new(db.clone(), events.clone(), notifier.clone())),
            payments: Arc::new(PaymentService::new(db.clone(), events.clone(), notifier)),
            events,
            db,
        }
    }

    /// Create or replace freight service master data
    pub fn upsert_freight_service(&self, input: &UpsertServiceInput) -> Result<FreightService, LedgerError> {
        self.db
            .with_exclusive(|tx| freight_services::upsert_service(tx, input))
    }

    pub fn get_freight_service(&self, service_id: i64) -> Result<Option<FreightService>, LedgerError> {
        self.db
            .with_conn(|conn| freight_services::get_service(conn, service_id))
    }

    pub fn list_freight_services(&self, active_only: bool) -> Result<Vec<FreightService>, LedgerError> {
        self.db
            .with_conn(|conn| freight_services::list_services(conn, active_only))
    }
}
