//! Types library for the order-book streaming service
//!
//! Value types shared between the feed side and the client-facing side of
//! the service. Everything here is immutable once constructed so it can be
//! handed across tasks behind an `Arc` without further synchronization.
//!
//! # Modules
//! - `instrument`: Instrument identifiers (InstrumentName)
//! - `numeric`: Fixed-point decimal types (Price, Amount)
//! - `book`: Top-of-book snapshots (BookLevel, OrderBookSnapshot)
//! - `errors`: Error taxonomy

pub mod instrument;
pub mod numeric;
pub mod book;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::instrument::*;
    pub use crate::numeric::*;
    pub use crate::book::*;
    pub use crate::errors::*;
}
