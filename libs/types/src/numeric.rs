//! Fixed-point decimal types for prices and amounts
//!
//! Uses rust_decimal so that a price read from the venue and echoed to a
//! subscriber is reproduced digit for digit (no floating-point drift).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::SnapshotError;

macro_rules! decimal_newtype {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "Decimal", into = "Decimal")]
        pub struct $name(Decimal);

        impl $name {
            pub const ZERO: Self = Self(Decimal::ZERO);

            /// Wrap a decimal, rejecting negative values.
            pub fn new(value: Decimal) -> Result<Self, SnapshotError> {
                if value.is_sign_negative() && !value.is_zero() {
                    return Err(SnapshotError::Negative {
                        field: $label,
                        value: value.to_string(),
                    });
                }
                Ok(Self(value))
            }

            pub fn from_u64(value: u64) -> Self {
                Self(Decimal::from(value))
            }

            pub fn as_decimal(&self) -> Decimal {
                self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0.is_zero()
            }
        }

        impl TryFrom<Decimal> for $name {
            type Error = SnapshotError;

            fn try_from(value: Decimal) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for Decimal {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = SnapshotError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let value = Decimal::from_str(s).map_err(|_| SnapshotError::NotRepresentable {
                    field: $label,
                    value: s.to_string(),
                })?;
                Self::new(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

decimal_newtype!(
    /// Price of a book level, in quote currency.
    Price,
    "price"
);

decimal_newtype!(
    /// Amount resting at a book level, in contract or base units.
    Amount,
    "amount"
);
