//! Unique 128-bit identifiers.
//!
//! Every entity id is a random v4 UUID wrapped in a newtype so ids of
//! different entities cannot be swapped at call sites.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn parse(s: &str) -> Option<Self> {
                let raw = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Uuid::parse_str(raw).ok().map(Self)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "_{}"), self.0.simple())
            }
        }
    };
}

define_id!(
    /// Stock reservation.
    ReservationId,
    "res"
);
define_id!(
    /// Wallet escrow hold.
    HoldId,
    "hold"
);
define_id!(SagaId, "saga");
define_id!(OrderId, "ord");
define_id!(
    /// Wallet transaction log entry.
    TxnId,
    "txn"
);
define_id!(SaleId, "sale");
define_id!(
    /// Payment gateway charge.
    ChargeId,
    "chg"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trips_through_parse() {
        let id = ReservationId::generate();
        let shown = id.to_string();
        assert!(shown.starts_with("res_"));
        assert_eq!(ReservationId::parse(&shown), Some(id));
        assert_eq!(ReservationId::parse(&id.0.to_string()), Some(id));
        assert_eq!(ReservationId::parse("res_nope"), None);
    }

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(SagaId::generate(), SagaId::generate());
    }
}
