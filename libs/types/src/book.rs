//! Top-of-book snapshots
//!
//! An `OrderBookSnapshot` is the complete, point-in-time best bid / best ask
//! view of one instrument. Snapshots are never edited: a newer view of the
//! book is a new snapshot that replaces the old one wholesale, so a reader
//! can never observe a bid from one update paired with an ask from another.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::errors::SnapshotError;
use crate::instrument::InstrumentName;
use crate::numeric::{Amount, Price};

/// One side's best level: price and resting amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BookLevel {
    pub price: Price,
    pub amount: Amount,
}

impl BookLevel {
    pub fn new(price: Price, amount: Amount) -> Self {
        Self { price, amount }
    }
}

/// Immutable best bid / best ask view of a single instrument.
///
/// A side is `None` when the venue reports no resting liquidity on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookSnapshot {
    instrument: InstrumentName,
    best_bid: Option<BookLevel>,
    best_ask: Option<BookLevel>,
    /// Unix milliseconds at which the venue produced this view.
    timestamp: i64,
}

impl OrderBookSnapshot {
    /// Build a snapshot, rejecting crossed books.
    pub fn new(
        instrument: InstrumentName,
        best_bid: Option<BookLevel>,
        best_ask: Option<BookLevel>,
        timestamp: i64,
    ) -> Result<Self, SnapshotError> {
        if let (Some(bid), Some(ask)) = (&best_bid, &best_ask) {
            if bid.price > ask.price {
                return Err(SnapshotError::Crossed {
                    bid: bid.price.to_string(),
                    ask: ask.price.to_string(),
                });
            }
        }

        Ok(Self {
            instrument,
            best_bid,
            best_ask,
            timestamp,
        })
    }

    /// Build a snapshot stamped with the local wall clock.
    pub fn now(
        instrument: InstrumentName,
        best_bid: Option<BookLevel>,
        best_ask: Option<BookLevel>,
    ) -> Result<Self, SnapshotError> {
        Self::new(instrument, best_bid, best_ask, Utc::now().timestamp_millis())
    }

    pub fn instrument(&self) -> &InstrumentName {
        &self.instrument
    }

    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.best_bid.as_ref()
    }

    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.best_ask.as_ref()
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Best ask minus best bid, when both sides are present.
    pub fn spread(&self) -> Option<Decimal> {
        match (&self.best_bid, &self.best_ask) {
            (Some(bid), Some(ask)) => Some(ask.price.as_decimal() - bid.price.as_decimal()),
            _ => None,
        }
    }

    /// Whether neither side carries liquidity.
    pub fn is_empty(&self) -> bool {
        self.best_bid.is_none() && self.best_ask.is_none()
    }
}
