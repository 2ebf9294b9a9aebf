//! Lifecycle enums shared by the ledger tables
//!
//! Every status column is stored as its snake_case text form so the database
//! stays readable from the sqlite shell.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = LedgerError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(LedgerError::InvalidInput(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: LedgerError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum! {
    /// Price quote lifecycle
    QuoteStatus {
        Pending => "pending",
        Calculating => "calculating",
        Quoted => "quoted",
        Accepted => "accepted",
        Rejected => "rejected",
        Expired => "expired",
        Converted => "converted",
    }
}

impl QuoteStatus {
    /// `Quoted -> Expired` is only taken by comparing against `valid_until`.
    pub fn can_transition_to(self, next: QuoteStatus) -> bool {
        use QuoteStatus::*;
        matches!(
            (self, next),
            (Pending, Calculating)
                | (Calculating, Quoted)
                | (Quoted, Accepted)
                | (Quoted, Rejected)
                | (Quoted, Expired)
                | (Accepted, Converted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, QuoteStatus::Rejected | QuoteStatus::Expired | QuoteStatus::Converted)
    }
}

text_enum! {
    /// Physical shipment lifecycle
    ShipmentStatus {
        Pending => "pending",
        Confirmed => "confirmed",
        PickedUp => "picked_up",
        InTransit => "in_transit",
        CustomsClearance => "customs_clearance",
        Delayed => "delayed",
        OutForDelivery => "out_for_delivery",
        FailedDelivery => "failed_delivery",
        Delivered => "delivered",
        Cancelled => "cancelled",
        Returned => "returned",
    }
}

impl ShipmentStatus {
    pub fn allowed_next(self) -> &'static [ShipmentStatus] {
        use ShipmentStatus::*;
        match self {
            Pending => &[Confirmed, Cancelled],
            Confirmed => &[PickedUp, Cancelled],
            PickedUp => &[InTransit, Returned],
            InTransit => &[CustomsClearance, OutForDelivery, Delayed],
            CustomsClearance => &[OutForDelivery],
            Delayed => &[InTransit],
            OutForDelivery => &[Delivered, FailedDelivery],
            FailedDelivery => &[OutForDelivery, Returned],
            Delivered | Cancelled | Returned => &[],
        }
    }

    pub fn can_transition_to(self, next: ShipmentStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    /// No further movement, so nothing would ever release new capacity
    pub fn is_terminal(self) -> bool {
        self.allowed_next().is_empty()
    }
}

text_enum! {
    /// Settlement state of a shipment's balance
    PaymentStatus {
        Unpaid => "unpaid",
        Partial => "partial",
        Paid => "paid",
        Refunded => "refunded",
        Failed => "failed",
    }
}

text_enum! {
    /// Capacity reservation state
    ReservationStatus {
        Active => "active",
        Released => "released",
        Confirmed => "confirmed",
    }
}

impl ReservationStatus {
    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        matches!(
            (self, next),
            (ReservationStatus::Active, ReservationStatus::Released)
                | (ReservationStatus::Active, ReservationStatus::Confirmed)
        )
    }
}

text_enum! {
    /// Payment transaction state
    TransactionStatus {
        Pending => "pending",
        Completed => "completed",
        Failed => "failed",
        Refunded => "refunded",
    }
}
