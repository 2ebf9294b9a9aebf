//! Integration tests for the quote -> shipment -> payment flow
//!
//! Each test runs against its own SQLite file in a temp dir.

use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use freight_ledger::db::notifications::{self, Notification};
use freight_ledger::db::payments::PaymentRequest;
use freight_ledger::db::{
    CreateQuoteInput, PaymentStatus, Quote, QuoteStatus, ReservationStatus, ShipmentStatus,
    UpsertServiceInput,
};
use freight_ledger::services::{LedgerEvent, Notifier, QueueNotifier, QuotePolicy};
use freight_ledger::{LedgerDb, LedgerError, Services};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tempfile::TempDir;

/// Helper to create services over a fresh database
fn create_services() -> (Services, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = LedgerDb::open(temp_dir.path().join("ledger.db"), std::time::Duration::from_secs(10)).unwrap();
    let notifier: Arc<dyn Notifier> = Arc::new(QueueNotifier::new(db.clone()));
    (Services::with_notifier(db, QuotePolicy::default(), notifier), temp_dir)
}

fn add_service(services: &Services, base_rate: Decimal, max_kg: Option<Decimal>) -> i64 {
    services
        .upsert_freight_service(&UpsertServiceInput {
            service_id: None,
            service_name: "Express Air".into(),
            service_type: "air".into(),
            base_rate: Some(base_rate),
            currency: "USD".into(),
            max_daily_capacity_kg: max_kg,
            max_daily_capacity_m3: None,
            is_active: true,
        })
        .unwrap()
        .service_id
}

fn quote_for(services: &Services, service_id: i64, weight: Decimal) -> Quote {
    services
        .quotes
        .create_quote(CreateQuoteInput {
            requester_id: "customer-1".into(),
            service_id,
            origin_country: "SG".into(),
            destination_country: "AU".into(),
            cargo_description: Some("electronics".into()),
            cargo_weight_kg: Some(weight),
            cargo_volume_m3: Some(dec!(1.2)),
            cargo_value: Some(dec!(20000)),
            currency: "USD".into(),
        })
        .unwrap()
}

fn accepted_quote(services: &Services, service_id: i64, weight: Decimal) -> Quote {
    let quote = quote_for(services, service_id, weight);
    services.quotes.accept(&quote.quote_id).unwrap()
}

fn pickup() -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(2026, 11, 2)
}

fn pay(shipment_id: &str, amount: Decimal, key: &str) -> PaymentRequest {
    PaymentRequest {
        shipment_id: shipment_id.into(),
        amount,
        currency: "USD".into(),
        payment_method: Some("bank_transfer".into()),
        idempotency_key: key.into(),
    }
}

#[test]
fn test_quote_is_priced_from_service_rate() {
    let (services, _temp) = create_services();
    let service_id = add_service(&services, dec!(5), None);

    let quote = quote_for(&services, service_id, dec!(20));
    assert_eq!(quote.status, QuoteStatus::Quoted);
    assert_eq!(quote.quoted_price, Some(dec!(100)));

    let valid_until = quote.valid_until.unwrap();
    let quoted_at = quote.quoted_at.unwrap();
    assert_eq!(valid_until - quoted_at, Duration::days(7));
}

#[test]
fn test_inactive_service_cannot_be_quoted() {
    let (services, _temp) = create_services();
    let service_id = services
        .upsert_freight_service(&UpsertServiceInput {
            service_id: None,
            service_name: "Retired Sea Lane".into(),
            service_type: "sea".into(),
            base_rate: None,
            currency: "USD".into(),
            max_daily_capacity_kg: None,
            max_daily_capacity_m3: None,
            is_active: false,
        })
        .unwrap()
        .service_id;

    let result = services.quotes.create_quote(CreateQuoteInput {
        requester_id: "customer-1".into(),
        service_id,
        origin_country: "NL".into(),
        destination_country: "BR".into(),
        cargo_description: None,
        cargo_weight_kg: None,
        cargo_volume_m3: None,
        cargo_value: None,
        currency: "USD".into(),
    });
    assert!(matches!(result, Err(LedgerError::InvalidState(_))));
    assert_eq!(services.db.stats().unwrap().quote_count, 0);
}

#[test]
fn test_conversion_round_trip() {
    let (services, _temp) = create_services();
    let service_id = add_service(&services, dec!(12.5), Some(dec!(1000)));
    let quote = accepted_quote(&services, service_id, dec!(40));

    let conversion = services
        .shipments
        .convert_quote_to_shipment(&quote.quote_id, pickup())
        .unwrap();
    let shipment = &conversion.shipment;

    assert_eq!(shipment.tracking_number, "FLT0000000001");
    assert_eq!(Some(shipment.total_cost), quote.quoted_price);
    assert_eq!(shipment.amount_due, dec!(500));
    assert_eq!(shipment.payment_status, PaymentStatus::Unpaid);
    assert_eq!(shipment.shipment_status, ShipmentStatus::Pending);
    assert_eq!(shipment.quote_id.as_deref(), Some(quote.quote_id.as_str()));

    let converted = services.quotes.get(&quote.quote_id).unwrap().unwrap();
    assert_eq!(converted.status, QuoteStatus::Converted);
    assert_eq!(converted.converted_to_shipment_id.as_deref(), Some(shipment.shipment_id.as_str()));

    assert_eq!(conversion.reservation.status, ReservationStatus::Active);
    assert_eq!(conversion.reservation.reserved_weight_kg, dec!(40));
    let entry = services.capacity.get_entry(service_id, pickup().unwrap()).unwrap().unwrap();
    assert_eq!(entry.reserved_weight_kg, dec!(40));
    assert_eq!(entry.max_weight_kg, Some(dec!(1000)));

    let events = services.shipments.list_tracking_events(&shipment.shipment_id).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_status, ShipmentStatus::Pending);

    let queued = services.db.with_conn(notifications::list_pending).unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].notification_type, notifications::SHIPMENT_CREATED);
    assert_eq!(queued[0].message, "Your shipment FLT0000000001 has been created.");
}

/// The second 60kg booking does not fit in 100kg
#[test]
fn test_capacity_exceeded_rolls_back_conversion() {
    let (services, _temp) = create_services();
    let service_id = add_service(&services, dec!(1), Some(dec!(100)));
    let first = accepted_quote(&services, service_id, dec!(60));
    let second = accepted_quote(&services, service_id, dec!(60));

    services.shipments.convert_quote_to_shipment(&first.quote_id, pickup()).unwrap();
    let err = services
        .shipments
        .convert_quote_to_shipment(&second.quote_id, pickup())
        .unwrap_err();
    assert!(matches!(err, LedgerError::CapacityExceeded { dimension: "weight", .. }));
    assert!(err.is_business_rejection());

    let entry = services.capacity.get_entry(service_id, pickup().unwrap()).unwrap().unwrap();
    assert_eq!(entry.reserved_weight_kg, dec!(60));

    let still_accepted = services.quotes.get(&second.quote_id).unwrap().unwrap();
    assert_eq!(still_accepted.status, QuoteStatus::Accepted);
    assert!(still_accepted.converted_to_shipment_id.is_none());
    assert_eq!(services.db.stats().unwrap().shipment_count, 1);

    // the failed attempt gave its tracking number back
    let other_day = NaiveDate::from_ymd_opt(2026, 11, 3);
    let later = services
        .shipments
        .convert_quote_to_shipment(&second.quote_id, other_day)
        .unwrap();
    assert_eq!(later.shipment.tracking_number, "FLT0000000002");
}

#[test]
fn test_missing_pickup_date_leaves_quote_convertible() {
    let (services, _temp) = create_services();
    let service_id = add_service(&services, dec!(1), None);
    let quote = accepted_quote(&services, service_id, dec!(5));

    let err = services
        .shipments
        .convert_quote_to_shipment(&quote.quote_id, None)
        .unwrap_err();
    assert!(matches!(err, LedgerError::MissingBookingDate(_)));
    assert_eq!(services.db.stats().unwrap().shipment_count, 0);

    let conversion = services
        .shipments
        .convert_quote_to_shipment(&quote.quote_id, pickup())
        .unwrap();
    assert_eq!(conversion.shipment.tracking_number, "FLT0000000001");
}

/// Accepting after valid_until expires the quote
#[test]
fn test_expired_quote_cannot_be_accepted_or_converted() {
    let (services, _temp) = create_services();
    let service_id = add_service(&services, dec!(100), None);
    let quote = quote_for(&services, service_id, dec!(5));
    assert_eq!(quote.quoted_price, Some(dec!(500)));

    let later = quote.valid_until.unwrap() + Duration::seconds(1);
    let err = services.quotes.accept_at(&quote.quote_id, later).unwrap_err();
    assert!(matches!(err, LedgerError::QuoteExpired(_)));

    let expired = services.quotes.get(&quote.quote_id).unwrap().unwrap();
    assert_eq!(expired.status, QuoteStatus::Expired);

    let err = services
        .shipments
        .convert_quote_to_shipment(&quote.quote_id, pickup())
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidState(_)));
    assert_eq!(services.db.stats().unwrap().shipment_count, 0);
}

#[test]
fn test_sweep_expires_only_stale_quotes() {
    let (services, _temp) = create_services();
    let service_id = add_service(&services, dec!(1), None);
    let stale = quote_for(&services, service_id, dec!(1));
    let accepted = accepted_quote(&services, service_id, dec!(1));

    let now = stale.valid_until.unwrap() + Duration::hours(1);
    let expired = services.quotes.expire_stale_quotes(now).unwrap();
    assert_eq!(expired, vec![stale.quote_id.clone()]);

    assert_eq!(services.quotes.get(&accepted.quote_id).unwrap().unwrap().status, QuoteStatus::Accepted);
    assert!(services.quotes.expire_stale_quotes(now).unwrap().is_empty());
}

#[test]
fn test_rejected_quote_is_final() {
    let (services, _temp) = create_services();
    let service_id = add_service(&services, dec!(1), None);
    let quote = quote_for(&services, service_id, dec!(1));

    services.quotes.reject(&quote.quote_id).unwrap();
    assert!(matches!(services.quotes.accept(&quote.quote_id), Err(LedgerError::InvalidState(_))));
}

#[test]
fn test_rejecting_a_stale_quote_expires_it() {
    let (services, _temp) = create_services();
    let service_id = add_service(&services, dec!(1), None);
    let quote = quote_for(&services, service_id, dec!(1));

    let later = quote.valid_until.unwrap() + Duration::minutes(5);
    let err = services.quotes.reject_at(&quote.quote_id, later).unwrap_err();
    assert!(matches!(err, LedgerError::QuoteExpired(_)));
    assert_eq!(services.quotes.get(&quote.quote_id).unwrap().unwrap().status, QuoteStatus::Expired);
}

#[test]
fn test_unpriceable_weight_is_invalid_input() {
    let (services, _temp) = create_services();
    let service_id = add_service(&services, dec!(2), None);

    let result = services.quotes.create_quote(CreateQuoteInput {
        requester_id: "customer-1".into(),
        service_id,
        origin_country: "SG".into(),
        destination_country: "AU".into(),
        cargo_description: None,
        cargo_weight_kg: Some(Decimal::MAX),
        cargo_volume_m3: None,
        cargo_value: None,
        currency: "USD".into(),
    });
    assert!(matches!(result, Err(LedgerError::InvalidInput(_))));
    assert_eq!(services.db.stats().unwrap().quote_count, 0);
}

/// 50 then 60 against 100 rejects the second payment
#[test]
fn test_overpayment_is_rejected_without_trace() {
    let (services, _temp) = create_services();
    let service_id = add_service(&services, dec!(10), None);
    let quote = accepted_quote(&services, service_id, dec!(10));
    let shipment = services
        .shipments
        .convert_quote_to_shipment(&quote.quote_id, pickup())
        .unwrap()
        .shipment;
    assert_eq!(shipment.total_cost, dec!(100));

    services.payments.process_payment(pay(&shipment.shipment_id, dec!(50), "A")).unwrap();
    let err = services
        .payments
        .process_payment(pay(&shipment.shipment_id, dec!(60), "B"))
        .unwrap_err();
    assert!(matches!(err, LedgerError::Overpayment { .. }));

    let after = services.shipments.get(&shipment.shipment_id).unwrap().unwrap();
    assert_eq!(after.amount_due, dec!(50));
    assert_eq!(after.payment_status, PaymentStatus::Partial);
    assert_eq!(services.payments.list_for_shipment(&shipment.shipment_id).unwrap().len(), 1);
    assert!(services.payments.find_by_idempotency_key("B").unwrap().is_none());
}

#[test]
fn test_exact_payment_settles_in_full() {
    let (services, _temp) = create_services();
    let service_id = add_service(&services, dec!(33.33), None);
    let quote = accepted_quote(&services, service_id, dec!(3));
    let shipment = services
        .shipments
        .convert_quote_to_shipment(&quote.quote_id, pickup())
        .unwrap()
        .shipment;

    services
        .payments
        .process_payment(pay(&shipment.shipment_id, dec!(99.99), "full"))
        .unwrap();

    let paid = services.shipments.get(&shipment.shipment_id).unwrap().unwrap();
    assert_eq!(paid.payment_status, PaymentStatus::Paid);
    assert_eq!(paid.amount_due, Decimal::ZERO);
    assert_eq!(paid.amount_paid, dec!(99.99));
}

#[test]
fn test_replayed_payment_is_identical() {
    let (services, _temp) = create_services();
    let service_id = add_service(&services, dec!(10), None);
    let quote = accepted_quote(&services, service_id, dec!(10));
    let shipment = services
        .shipments
        .convert_quote_to_shipment(&quote.quote_id, pickup())
        .unwrap()
        .shipment;

    let first = services.payments.process_payment(pay(&shipment.shipment_id, dec!(30), "retry-me")).unwrap();
    let second = services.payments.process_payment(pay(&shipment.shipment_id, dec!(30), "retry-me")).unwrap();
    assert_eq!(first, second);

    let after = services.shipments.get(&shipment.shipment_id).unwrap().unwrap();
    assert_eq!(after.amount_paid, dec!(30));
}

/// A second conversion of the same quote is refused
#[test]
fn test_already_converted_quote() {
    let (services, _temp) = create_services();
    let service_id = add_service(&services, dec!(1), None);
    let quote = accepted_quote(&services, service_id, dec!(1));

    let first = services
        .shipments
        .convert_quote_to_shipment(&quote.quote_id, pickup())
        .unwrap();
    let err = services
        .shipments
        .convert_quote_to_shipment(&quote.quote_id, pickup())
        .unwrap_err();

    match err {
        LedgerError::AlreadyConverted { shipment_id, .. } => {
            assert_eq!(shipment_id, first.shipment.shipment_id)
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(services.db.stats().unwrap().shipment_count, 1);
}

#[test]
fn test_cancel_releases_and_delivery_confirms_capacity() {
    let (services, _temp) = create_services();
    let service_id = add_service(&services, dec!(1), Some(dec!(100)));
    let cancelled = services
        .shipments
        .convert_quote_to_shipment(&accepted_quote(&services, service_id, dec!(70)).quote_id, pickup())
        .unwrap();

    services
        .shipments
        .update_status(&cancelled.shipment.shipment_id, ShipmentStatus::Cancelled, Some("customer request"), "admin")
        .unwrap();

    let entry = services.capacity.get_entry(service_id, pickup().unwrap()).unwrap().unwrap();
    assert_eq!(entry.reserved_weight_kg, Decimal::ZERO);
    let reservations = services
        .capacity
        .reservations_for_shipment(&cancelled.shipment.shipment_id)
        .unwrap();
    assert_eq!(reservations[0].status, ReservationStatus::Released);

    // the freed capacity is bookable again
    let delivered = services
        .shipments
        .convert_quote_to_shipment(&accepted_quote(&services, service_id, dec!(90)).quote_id, pickup())
        .unwrap();
    let id = &delivered.shipment.shipment_id;
    for next in [
        ShipmentStatus::Confirmed,
        ShipmentStatus::PickedUp,
        ShipmentStatus::InTransit,
        ShipmentStatus::OutForDelivery,
        ShipmentStatus::Delivered,
    ] {
        services.shipments.update_status(id, next, None, "carrier").unwrap();
    }

    let reservations = services.capacity.reservations_for_shipment(id).unwrap();
    assert_eq!(reservations[0].status, ReservationStatus::Confirmed);
    let entry = services.capacity.get_entry(service_id, pickup().unwrap()).unwrap().unwrap();
    assert_eq!(entry.reserved_weight_kg, dec!(90));

    let history = services.shipments.list_tracking_events(id).unwrap();
    assert_eq!(history.len(), 6);
    assert_eq!(history.last().unwrap().event_status, ShipmentStatus::Delivered);

    let err = services
        .shipments
        .update_status(id, ShipmentStatus::Cancelled, None, "admin")
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidState(_)));
}

#[test]
fn test_cancelled_shipment_cannot_rebook_capacity() {
    let (services, _temp) = create_services();
    let service_id = add_service(&services, dec!(1), Some(dec!(100)));
    let conversion = services
        .shipments
        .convert_quote_to_shipment(&accepted_quote(&services, service_id, dec!(70)).quote_id, pickup())
        .unwrap();

    let cancelled = services
        .shipments
        .update_status(&conversion.shipment.shipment_id, ShipmentStatus::Cancelled, None, "admin")
        .unwrap();

    let err = services.capacity.reserve_capacity(&cancelled).unwrap_err();
    assert!(matches!(err, LedgerError::InvalidState(_)));

    let entry = services.capacity.get_entry(service_id, pickup().unwrap()).unwrap().unwrap();
    assert_eq!(entry.reserved_weight_kg, Decimal::ZERO);
    assert_eq!(services.capacity.reservations_for_shipment(&cancelled.shipment_id).unwrap().len(), 1);
}

#[test]
fn test_status_changes_report_capacity_events() {
    let (services, _temp) = create_services();
    let service_id = add_service(&services, dec!(1), None);
    let conversion = services
        .shipments
        .convert_quote_to_shipment(&accepted_quote(&services, service_id, dec!(3)).quote_id, pickup())
        .unwrap();

    let mut events = services.events.subscribe();
    services
        .shipments
        .update_status(&conversion.shipment.shipment_id, ShipmentStatus::Cancelled, None, "admin")
        .unwrap();

    let mut released = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let LedgerEvent::CapacityReleased { reservation_id } = event {
            released.push(reservation_id);
        }
    }
    assert_eq!(released, vec![conversion.reservation.reservation_id]);
}

struct FailingNotifier;

impl Notifier for FailingNotifier {
    fn enqueue(&self, _notification: &Notification) -> Result<(), LedgerError> {
        Err(LedgerError::Internal("smtp relay down".into()))
    }
}

#[test]
fn test_failing_notifier_does_not_break_conversion() {
    let temp_dir = TempDir::new().unwrap();
    let db = LedgerDb::open(temp_dir.path().join("ledger.db"), std::time::Duration::from_secs(10)).unwrap();
    let services = Services::with_notifier(db, QuotePolicy::default(), Arc::new(FailingNotifier));

    let service_id = add_service(&services, dec!(1), None);
    let quote = accepted_quote(&services, service_id, dec!(1));
    let conversion = services
        .shipments
        .convert_quote_to_shipment(&quote.quote_id, pickup())
        .unwrap();

    assert!(services.shipments.get(&conversion.shipment.shipment_id).unwrap().is_some());
    assert!(services.db.with_conn(notifications::list_pending).unwrap().is_empty());
}

#[test]
fn test_invoice_numbers_are_sequential() {
    let (services, _temp) = create_services();
    assert_eq!(services.payments.allocate_invoice_number().unwrap(), "INV-00000001");
    assert_eq!(services.payments.allocate_invoice_number().unwrap(), "INV-00000002");
}

#[test]
fn test_advisory_check_matches_ledger() {
    let (services, _temp) = create_services();
    let service_id = add_service(&services, dec!(1), Some(dec!(100)));
    let day = pickup().unwrap();

    assert!(services.capacity.check_availability(day, service_id, Some(dec!(100)), None).unwrap());
    services
        .shipments
        .convert_quote_to_shipment(&accepted_quote(&services, service_id, dec!(75)).quote_id, pickup())
        .unwrap();
    assert!(services.capacity.check_availability(day, service_id, Some(dec!(25)), None).unwrap());
    assert!(!services.capacity.check_availability(day, service_id, Some(dec!(26)), None).unwrap());
}
