//! Instrument identifiers
//!
//! An instrument name is the venue's symbol for one tradable book, for
//! example `BTC-PERPETUAL`. Names are opaque and case-sensitive; the only
//! structural rule is that they are non-empty. Whitespace is part of the
//! name, so ` BTC` and `BTC` are different instruments.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

use crate::errors::SnapshotError;

/// Identifier of one order book.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstrumentName(String);

impl InstrumentName {
    /// Create an instrument name, rejecting empty input.
    pub fn new(name: impl Into<String>) -> Result<Self, SnapshotError> {
        let name = name.into();
        if name.is_empty() {
            return Err(SnapshotError::InvalidInstrument(name));
        }
        Ok(Self(name))
    }

    /// Get the name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for InstrumentName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for InstrumentName {
    type Error = SnapshotError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for InstrumentName {
    type Error = SnapshotError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<InstrumentName> for String {
    fn from(name: InstrumentName) -> Self {
        name.0
    }
}
