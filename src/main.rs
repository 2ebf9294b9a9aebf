//! Freight Ledger CLI
//!
//! Operates on the ledger database directly; every subcommand is one unit of
//! work, so several invocations may run against the same data dir at once.
//!
//! ## Usage
//!
//! ```bash
//! # Create the data dir, default config and schema
//! freight-ledger init
//!
//! # Master data
//! freight-ledger service upsert --name "Express Air" --service-type air --base-rate 4.5 --max-kg 1000
//!
//! # Quote -> shipment -> payment
//! freight-ledger quote create --requester u1 --service-id 1 --origin CN --destination US --weight 120
//! freight-ledger quote accept <quote-id>
//! freight-ledger convert <quote-id> --pickup-date 2026-03-14
//! freight-ledger pay <shipment-id> 250.00 --key order-42-attempt-1
//!
//! # Expire stale quotes every `sweep_interval_secs`
//! freight-ledger sweep
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use freight_ledger::config::default_data_dir;
use freight_ledger::db::payments::PaymentRequest;
use freight_ledger::db::{CreateQuoteInput, ShipmentStatus, UpsertServiceInput};
use freight_ledger::services::spawn_logging_listener;
use freight_ledger::{Config, LedgerDb, LedgerError, Services};

#[derive(Parser, Debug)]
#[command(name = "freight-ledger")]
#[command(about = "Booking and settlement ledger for freight shipments")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "FREIGHT_LEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory holding ledger.db
    #[arg(long, env = "FREIGHT_LEDGER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Milliseconds to wait for the write lease
    #[arg(long, env = "FREIGHT_LEDGER_LOCK_TIMEOUT_MS")]
    lock_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create data dir, config file and schema
    Init,

    /// Freight service master data
    #[command(subcommand)]
    Service(ServiceCommand),

    /// Price quotes
    #[command(subcommand)]
    Quote(QuoteCommand),

    /// Convert an accepted quote into a shipment
    Convert {
        quote_id: String,
        /// Estimated pickup date (YYYY-MM-DD), the capacity booking day
        #[arg(long)]
        pickup_date: Option<NaiveDate>,
    },

    /// Record a payment against a shipment
    Pay {
        shipment_id: String,
        amount: Decimal,
        /// Idempotency key; replays with the same key are no-ops
        #[arg(long)]
        key: String,
        #[arg(long, default_value = "USD")]
        currency: String,
        #[arg(long)]
        method: Option<String>,
    },

    /// Capacity ledger
    #[command(subcommand)]
    Capacity(CapacityCommand),

    /// Shipments
    #[command(subcommand)]
    Shipment(ShipmentCommand),

    /// Allocate the next invoice number
    Invoice,

    /// Row counts
    Stats,

    /// Periodically expire quotes past their validity
    Sweep {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ServiceCommand {
    /// Create a service, or replace it when --id is given
    Upsert {
        #[arg(long)]
        id: Option<i64>,
        #[arg(long)]
        name: String,
        /// sea, air or land
        #[arg(long)]
        service_type: String,
        #[arg(long)]
        base_rate: Option<Decimal>,
        #[arg(long, default_value = "USD")]
        currency: String,
        #[arg(long)]
        max_kg: Option<Decimal>,
        #[arg(long)]
        max_m3: Option<Decimal>,
        #[arg(long)]
        inactive: bool,
    },
    /// List services
    List {
        #[arg(long)]
        active_only: bool,
    },
}

#[derive(Subcommand, Debug)]
enum QuoteCommand {
    /// Request and price a quote
    Create {
        #[arg(long)]
        requester: String,
        #[arg(long)]
        service_id: i64,
        #[arg(long)]
        origin: String,
        #[arg(long)]
        destination: String,
        #[arg(long)]
        weight: Option<Decimal>,
        #[arg(long)]
        volume: Option<Decimal>,
        #[arg(long)]
        value: Option<Decimal>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, default_value = "USD")]
        currency: String,
    },
    Accept { quote_id: String },
    Reject { quote_id: String },
    Show { quote_id: String },
}

#[derive(Subcommand, Debug)]
enum CapacityCommand {
    /// Advisory availability check
    Check {
        #[arg(long)]
        service_id: i64,
        #[arg(long)]
        date: NaiveDate,
        #[arg(long)]
        weight: Option<Decimal>,
        #[arg(long)]
        volume: Option<Decimal>,
    },
    /// Show the ledger entry for a day
    Show {
        #[arg(long)]
        service_id: i64,
        #[arg(long)]
        date: NaiveDate,
    },
}

#[derive(Subcommand, Debug)]
enum ShipmentCommand {
    /// Move a shipment to a new status
    Status {
        shipment_id: String,
        status: ShipmentStatus,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, default_value = "cli")]
        source: String,
    },
    /// Show a shipment by ID or tracking number
    Show { id_or_tracking: String },
    /// Tracking history
    Events { shipment_id: String },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Run store work off the async runtime
async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> Result<T, LedgerError> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            let default_path = args
                .data_dir
                .clone()
                .unwrap_or_else(default_data_dir)
                .join("config.toml");
            if default_path.exists() {
                Config::load(&default_path)?
            } else {
                Config::default()
            }
        }
    };

    // CLI overrides
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(ms) = args.lock_timeout_ms {
        config.lock_timeout_ms = ms;
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("freight_ledger=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    info!(data_dir = %config.data_dir.display(), "Opening freight ledger");

    let db = {
        let config = config.clone();
        blocking(move || LedgerDb::open_with_config(&config)).await?
    };
    let services = Arc::new(Services::new(db, &config)?);
    let _listener = spawn_logging_listener(services.events.clone());

    match args.command {
        Command::Init => {
            let config_path = config.config_path();
            if !config_path.exists() {
                config.save(&config_path)?;
                info!(path = %config_path.display(), "Created default config");
            }
            let db = services.db.clone();
            print_json(&blocking(move || db.stats()).await?)?;
        }

        Command::Service(ServiceCommand::Upsert {
            id,
            name,
            service_type,
            base_rate,
            currency,
            max_kg,
            max_m3,
            inactive,
        }) => {
            let input = UpsertServiceInput {
                service_id: id,
                service_name: name,
                service_type,
                base_rate,
                currency,
                max_daily_capacity_kg: max_kg,
                max_daily_capacity_m3: max_m3,
                is_active: !inactive,
            };
            let s = services.clone();
            print_json(&blocking(move || s.upsert_freight_service(&input)).await?)?;
        }
        Command::Service(ServiceCommand::List { active_only }) => {
            let s = services.clone();
            print_json(&blocking(move || s.list_freight_services(active_only)).await?)?;
        }

        Command::Quote(QuoteCommand::Create {
            requester,
            service_id,
            origin,
            destination,
            weight,
            volume,
            value,
            description,
            currency,
        }) => {
            let input = CreateQuoteInput {
                requester_id: requester,
                service_id,
                origin_country: origin,
                destination_country: destination,
                cargo_description: description,
                cargo_weight_kg: weight,
                cargo_volume_m3: volume,
                cargo_value: value,
                currency,
            };
            let quotes = services.quotes.clone();
            print_json(&blocking(move || quotes.create_quote(input)).await?)?;
        }
        Command::Quote(QuoteCommand::Accept { quote_id }) => {
            let quotes = services.quotes.clone();
            print_json(&blocking(move || quotes.accept(&quote_id)).await?)?;
        }
        Command::Quote(QuoteCommand::Reject { quote_id }) => {
            let quotes = services.quotes.clone();
            print_json(&blocking(move || quotes.reject(&quote_id)).await?)?;
        }
        Command::Quote(QuoteCommand::Show { quote_id }) => {
            let quotes = services.quotes.clone();
            print_json(&blocking(move || quotes.get(&quote_id)).await?)?;
        }

        Command::Convert { quote_id, pickup_date } => {
            let shipments = services.shipments.clone();
            let conversion =
                blocking(move || shipments.convert_quote_to_shipment(&quote_id, pickup_date)).await?;
            print_json(&conversion)?;
        }

        Command::Pay {
            shipment_id,
            amount,
            key,
            currency,
            method,
        } => {
            let request = PaymentRequest {
                shipment_id,
                amount,
                currency,
                payment_method: method,
                idempotency_key: key,
            };
            let payments = services.payments.clone();
            print_json(&blocking(move || payments.process_payment(request)).await?)?;
        }

        Command::Capacity(CapacityCommand::Check {
            service_id,
            date,
            weight,
            volume,
        }) => {
            let capacity = services.capacity.clone();
            let available =
                blocking(move || capacity.check_availability(date, service_id, weight, volume)).await?;
            print_json(&serde_json::json!({
                "service_id": service_id,
                "date": date,
                "available": available,
            }))?;
        }
        Command::Capacity(CapacityCommand::Show { service_id, date }) => {
            let capacity = services.capacity.clone();
            print_json(&blocking(move || capacity.get_entry(service_id, date)).await?)?;
        }

        Command::Shipment(ShipmentCommand::Status {
            shipment_id,
            status,
            description,
            source,
        }) => {
            let shipments = services.shipments.clone();
            let updated = blocking(move || {
                shipments.update_status(&shipment_id, status, description.as_deref(), &source)
            })
            .await?;
            print_json(&updated)?;
        }
        Command::Shipment(ShipmentCommand::Show { id_or_tracking }) => {
            let shipments = services.shipments.clone();
            let found = blocking(move || match shipments.get(&id_or_tracking)? {
                Some(shipment) => Ok(Some(shipment)),
                None => shipments.get_by_tracking_number(&id_or_tracking),
            })
            .await?;
            print_json(&found)?;
        }
        Command::Shipment(ShipmentCommand::Events { shipment_id }) => {
            let shipments = services.shipments.clone();
            print_json(&blocking(move || shipments.list_tracking_events(&shipment_id)).await?)?;
        }

        Command::Invoice => {
            let payments = services.payments.clone();
            let number = blocking(move || payments.allocate_invoice_number()).await?;
            print_json(&serde_json::json!({ "invoice_number": number }))?;
        }

        Command::Stats => {
            let db = services.db.clone();
            print_json(&blocking(move || db.stats()).await?)?;
        }

        Command::Sweep { once } => {
            run_sweep(services, Duration::from_secs(config.sweep_interval_secs), once).await?;
        }
    }

    Ok(())
}

async fn run_sweep(services: Arc<Services>, every: Duration, once: bool) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(every);
    info!(interval_secs = every.as_secs(), "Starting quote expiry sweep");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let quotes = services.quotes.clone();
                match blocking(move || quotes.expire_stale_quotes(Utc::now())).await {
                    Ok(expired) if !expired.is_empty() => print_json(&expired)?,
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Sweep pass failed"),
                }
                if once {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down sweep");
                break;
            }
        }
    }

    Ok(())
}
