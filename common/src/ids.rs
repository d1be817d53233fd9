//! Identifier newtypes.
//!
//! Every entity id in the system is a UUID, but the different kinds are not
//! interchangeable: handing a driver id to a function expecting a trip id
//! should not compile. Ids serialize as hyphenated UUID strings everywhere
//! (wire JSON, key-value keys, database columns).

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash,
            Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh (v4) id.
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                Display::fmt(&self.0.hyphenated(), f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::from_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// An account id: passenger, driver, partner, or admin.
    UserId
);
uuid_id!(
    /// A trip id. The same UUID identifies the ephemeral record, the durable
    /// row, the receipt, and every audit event of one trip, end-to-end.
    TripId
);
uuid_id!(
    /// A trip receipt id.
    ReceiptId
);
uuid_id!(
    /// A wallet ledger transaction id.
    TxnId
);
uuid_id!(
    /// An earning rule id.
    RuleId
);
uuid_id!(
    /// A bonus program (quest) id.
    ProgramId
);
uuid_id!(
    /// A bonus award id.
    AwardId
);
uuid_id!(
    /// A chat message id.
    MessageId
);
uuid_id!(
    /// A trip audit event id.
    EventId
);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_from_str_roundtrip() {
        let id = TripId::generate();
        let parsed = TripId::from_str(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = UserId::generate();
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(id.to_string()));
    }
}
