//! Quote service - pricing and the quote lifecycle
//!
//! Quote updates use the optimistic strategy: the quote is read on one
//! connection, the decision is made in memory, and the write is a short
//! exclusive unit conditioned on the version that was read.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::{freight_services, quotes, CreateQuoteInput, LedgerDb, Quote, QuoteStatus};
use crate::error::LedgerError;

use super::events::{EventBus, LedgerEvent};

/// Pricing inputs taken from configuration
#[derive(Debug, Clone, PartialEq)]
pub struct QuotePolicy {
    /// Per-kg rate for services without their own base rate
    pub default_base_rate: Decimal,
    pub validity: Duration,
}

impl QuotePolicy {
    pub fn from_config(config: &Config) -> Result<Self, LedgerError> {
        let default_base_rate = Decimal::from_str(&config.default_base_rate).map_err(|e| {
            LedgerError::Config(format!(
                "default_base_rate '{}' is not a decimal: {}",
                config.default_base_rate, e
            ))
        })?;

        if config.quote_validity_days <= 0 {
            return Err(LedgerError::Config("quote_validity_days must be positive".into()));
        }

        Ok(Self {
            default_base_rate,
            validity: config.quote_validity(),
        })
    }

    /// `base_rate x weight`, weight defaulting to 1
    pub fn price(&self, base_rate: Option<Decimal>, weight_kg: Option<Decimal>) -> Result<Decimal, LedgerError> {
        let rate = base_rate.unwrap_or(self.default_base_rate);
        let weight = weight_kg.unwrap_or(Decimal::ONE);
        rate.checked_mul(weight).ok_or_else(|| {
            LedgerError::InvalidInput(format!("price of {} kg at {} per kg is out of range", weight, rate))
        })
    }
}

impl Default for QuotePolicy {
    fn default() -> Self {
        Self {
            default_base_rate: Decimal::from(100),
            validity: Duration::days(7),
        }
    }
}

pub struct QuoteService {
    db: Arc<LedgerDb>,
    events: Arc<EventBus>,
    policy: QuotePolicy,
}

impl QuoteService {
    pub fn new(db: Arc<LedgerDb>, events: Arc<EventBus>, policy: QuotePolicy) -> Self {
        Self { db, events, policy }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub fn get(&self, quote_id: &str) -> Result<Option<Quote>, LedgerError> {
        self.db.with_conn(|conn| quotes::get_quote(conn, quote_id))
    }

    pub fn list_for_requester(&self, requester_id: &str) -> Result<Vec<Quote>, LedgerError> {
        self.db
            .with_conn(|conn| quotes::list_for_requester(conn, requester_id))
    }

    fn load(&self, quote_id: &str) -> Result<Quote, LedgerError> {
        self.get(quote_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("quote {}", quote_id)))
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Create and price a quote for an active service
    pub fn create_quote(&self, input: CreateQuoteInput) -> Result<Quote, LedgerError> {
        self.create_quote_at(input, Utc::now())
    }

    pub fn create_quote_at(&self, input: CreateQuoteInput, now: DateTime<Utc>) -> Result<Quote, LedgerError> {
        if input.requester_id.trim().is_empty() {
            return Err(LedgerError::InvalidInput("requester_id is required".into()));
        }

        let policy = &self.policy;
        let quote = self.db.with_exclusive(|tx| {
            let service = freight_services::get_service(tx, input.service_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("freight service {}", input.service_id)))?;
            if !service.is_active {
                return Err(LedgerError::InvalidState(format!(
                    "freight service {} is not active",
                    service.service_id
                )));
            }

            let calculating = quotes::insert_quote(tx, &input, now)?;
            let price = policy.price(service.base_rate, calculating.cargo_weight_kg)?;
            quotes::set_price(tx, &calculating, price, now, now + policy.validity)
        })?;

        info!(
            quote_id = %quote.quote_id,
            requester_id = %quote.requester_id,
            price = ?quote.quoted_price,
            "Quote created"
        );

        if let Some(quoted_price) = quote.quoted_price {
            self.events.emit(LedgerEvent::QuoteCreated {
                quote_id: quote.quote_id.clone(),
                requester_id: quote.requester_id.clone(),
                quoted_price,
            });
        }

        Ok(quote)
    }

    /// Accept a quoted price while it is still valid
    pub fn accept(&self, quote_id: &str) -> Result<Quote, LedgerError> {
        self.accept_at(quote_id, Utc::now())
    }

    /// Accept as of `now`.
    ///
    /// A quote past its validity is moved to `expired` and that change is
    /// committed before the acceptance is reported as failed.
    pub fn accept_at(&self, quote_id: &str, now: DateTime<Utc>) -> Result<Quote, LedgerError> {
        let quote = self.load(quote_id)?;

        if quote.status != QuoteStatus::Quoted {
            return Err(LedgerError::InvalidState(format!(
                "quote {} cannot be accepted in status {}",
                quote_id, quote.status
            )));
        }

        self.expire_if_stale(&quote, now)?;
        self.write_status(&quote, QuoteStatus::Accepted, now)
    }

    /// Decline a quoted price
    pub fn reject(&self, quote_id: &str) -> Result<Quote, LedgerError> {
        self.reject_at(quote_id, Utc::now())
    }

    /// Decline as of `now`; a quote already past validity ends up `expired`
    pub fn reject_at(&self, quote_id: &str, now: DateTime<Utc>) -> Result<Quote, LedgerError> {
        let quote = self.load(quote_id)?;
        if quote.status == QuoteStatus::Quoted {
            self.expire_if_stale(&quote, now)?;
        }
        self.write_status(&quote, QuoteStatus::Rejected, now)
    }

    /// Commit `expired` and fail with `QuoteExpired` once validity has passed
    fn expire_if_stale(&self, quote: &Quote, now: DateTime<Utc>) -> Result<(), LedgerError> {
        if !quote.is_past_validity(now) {
            return Ok(());
        }

        self.write_status(quote, QuoteStatus::Expired, now)?;
        warn!(quote_id = %quote.quote_id, valid_until = ?quote.valid_until, "Quote expired before a decision");
        Err(LedgerError::QuoteExpired(quote.quote_id.clone()))
    }

    /// Move every quoted quote past its validity to `expired`.
    ///
    /// Returns the IDs that were expired. A quote changed concurrently since
    /// it was listed is skipped and picked up by the next sweep if still due.
    pub fn expire_stale_quotes(&self, now: DateTime<Utc>) -> Result<Vec<String>, LedgerError> {
        let candidates = self.db.with_conn(quotes::list_quoted)?;

        let mut expired = Vec::new();
        for quote in candidates.iter().filter(|q| q.is_past_validity(now)) {
            match self.write_status(quote, QuoteStatus::Expired, now) {
                Ok(_) => expired.push(quote.quote_id.clone()),
                Err(e) if e.is_transient() => {
                    warn!(quote_id = %quote.quote_id, error = %e, "Skipping quote changed during sweep");
                }
                Err(e) => return Err(e),
            }
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Expired stale quotes");
        }
        Ok(expired)
    }

    fn write_status(&self, quote: &Quote, next: QuoteStatus, now: DateTime<Utc>) -> Result<Quote, LedgerError> {
        let updated = self
            .db
            .with_exclusive(|tx| quotes::transition(tx, quote, next, now))?;

        self.events.emit(LedgerEvent::QuoteStatusChanged {
            quote_id: updated.quote_id.clone(),
            status: updated.status,
        });
        Ok(updated)
    }
}
