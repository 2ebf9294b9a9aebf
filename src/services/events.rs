//! Event system for ledger operations
//!
//! Services emit a [`LedgerEvent`] after each committed unit of work. Nothing
//! in the ledger depends on a subscriber being present; the bus exists for
//! audit logging and for embedding applications that want to react.

use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::db::{QuoteStatus, ShipmentStatus};

/// Domain events emitted by services
#[derive(Debug, Clone)]
pub enum LedgerEvent {
    // Quote events
    QuoteCreated {
        quote_id: String,
        requester_id: String,
        quoted_price: Decimal,
    },
    QuoteStatusChanged {
        quote_id: String,
        status: QuoteStatus,
    },

    // Shipment events
    ShipmentCreated {
        shipment_id: String,
        tracking_number: String,
        quote_id: Option<String>,
    },
    ShipmentStatusChanged {
        shipment_id: String,
        from: ShipmentStatus,
        to: ShipmentStatus,
    },

    // Capacity events
    CapacityReserved {
        reservation_id: String,
        shipment_id: String,
        entry_id: String,
    },
    CapacityReleased {
        reservation_id: String,
    },
    CapacityConfirmed {
        reservation_id: String,
    },

    // Settlement events
    PaymentRecorded {
        transaction_id: String,
        shipment_id: String,
        amount: Decimal,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &LedgerEvent);
}

/// Event bus for broadcasting ledger events
pub struct EventBus {
    sender: broadcast::Sender<LedgerEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: LedgerEvent) {
        trace!(event = ?event, "Emitting ledger event");
        // no subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging event listener for audit trails
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &LedgerEvent) {
        match event {
            LedgerEvent::ShipmentCreated {
                shipment_id,
                tracking_number,
                ..
            } => {
                info!(shipment_id = %shipment_id, tracking_number = %tracking_number, "Shipment created");
            }
            LedgerEvent::ShipmentStatusChanged { shipment_id, from, to } => {
                info!(shipment_id = %shipment_id, from = %from, to = %to, "Shipment status changed");
            }
            LedgerEvent::PaymentRecorded {
                transaction_id,
                shipment_id,
                amount,
            } => {
                info!(
                    transaction_id = %transaction_id,
                    shipment_id = %shipment_id,
                    amount = %amount,
                    "Payment recorded"
                );
            }
            LedgerEvent::CapacityReserved {
                reservation_id,
                shipment_id,
                entry_id,
            } => {
                debug!(
                    reservation_id = %reservation_id,
                    shipment_id = %shipment_id,
                    entry_id = %entry_id,
                    "Capacity reserved"
                );
            }
            _ => {
                trace!(event = ?event, "Ledger event");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
