//! Upstream snapshot sources
//!
//! A `SnapshotSource` produces the current top of book for one instrument.
//! `JsonRpcBookSource` asks a venue's JSON-RPC 2.0 HTTP API for
//! `public/get_order_book`; `run_poller` drives any source on a fixed
//! interval and feeds the results through a `FeedIngestor`.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use types::book::{BookLevel, OrderBookSnapshot};
use types::errors::SnapshotError;
use types::instrument::InstrumentName;
use types::numeric::{Amount, Price};

use crate::ingestion::{FeedIngestor, IngestOutcome};
use crate::metrics::StreamMetrics;

/// Failures fetching a snapshot from an upstream source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("venue error {code}: {message}")]
    Venue { code: i64, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("invalid snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch the current top of book for `instrument`.
    async fn fetch(&self, instrument: &InstrumentName) -> Result<OrderBookSnapshot, SourceError>;
}

/// Polls `public/get_order_book` over HTTP.
pub struct JsonRpcBookSource {
    client: Client,
    base_url: String,
    next_id: AtomicU64,
}

impl JsonRpcBookSource {
    /// `base_url` is the API root, e.g. `https://test.deribit.com/api/v2`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/public/get_order_book", self.base_url)
    }
}

#[async_trait]
impl SnapshotSource for JsonRpcBookSource {
    async fn fetch(&self, instrument: &InstrumentName) -> Result<OrderBookSnapshot, SourceError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "public/get_order_book",
            "params": { "instrument_name": instrument.as_str() },
        });

        // Venue errors arrive with a non-2xx status and a JSON-RPC error body,
        // so the body is decoded before the status is considered.
        let response = self.client.post(self.endpoint()).json(&request).send().await?;
        let status = response.status();
        let body: Value = response.json().await?;
        debug!(%instrument, id, %status, "Order book response received");

        parse_order_book_response(instrument, &body)
    }
}

/// Turn a `public/get_order_book` response into a snapshot.
///
/// A missing, null or zero best price means that side of the book is empty.
/// Without a venue timestamp the local clock is used.
pub fn parse_order_book_response(
    instrument: &InstrumentName,
    response: &Value,
) -> Result<OrderBookSnapshot, SourceError> {
    if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
        return Err(SourceError::Venue {
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }

    let result = response
        .get("result")
        .filter(|r| r.is_object())
        .ok_or_else(|| SourceError::Decode("missing result object".to_string()))?;

    if let Some(name) = result.get("instrument_name").and_then(Value::as_str) {
        if name != instrument.as_str() {
            return Err(SourceError::Decode(format!(
                "requested {} but venue answered for {}",
                instrument, name
            )));
        }
    }

    let best_bid = level(result, "best_bid_price", "best_bid_amount")?;
    let best_ask = level(result, "best_ask_price", "best_ask_amount")?;

    let snapshot = match result.get("timestamp").and_then(Value::as_i64) {
        Some(timestamp) => OrderBookSnapshot::new(instrument.clone(), best_bid, best_ask, timestamp)?,
        None => OrderBookSnapshot::now(instrument.clone(), best_bid, best_ask)?,
    };
    Ok(snapshot)
}

fn level(
    result: &Value,
    price_field: &'static str,
    amount_field: &'static str,
) -> Result<Option<BookLevel>, SourceError> {
    let Some(price) = decimal_field::<Price>(result, price_field)? else {
        return Ok(None);
    };
    if price.is_zero() {
        return Ok(None);
    }
    let amount = decimal_field::<Amount>(result, amount_field)?.unwrap_or(Amount::ZERO);
    Ok(Some(BookLevel::new(price, amount)))
}

/// Read a numeric field as an exact decimal. JSON numbers are taken from
/// their textual form so no binary floating point is involved.
fn decimal_field<T>(result: &Value, field: &'static str) -> Result<Option<T>, SourceError>
where
    T: TryFrom<Decimal, Error = SnapshotError>,
{
    let text = match result.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
            return Err(SourceError::Decode(format!(
                "{} is not a number: {}",
                field, other
            )))
        }
    };

    let decimal = Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| SourceError::Decode(format!("{} is not a decimal ({}): {}", field, e, text)))?;
    Ok(Some(T::try_from(decimal.normalize())?))
}

/// Poll every instrument once per `interval`, forever.
///
/// A failed fetch is logged and skipped; the cache keeps serving the last
/// good snapshot for that instrument.
pub async fn run_poller<S>(
    source: Arc<S>,
    ingestor: Arc<FeedIngestor>,
    instruments: Vec<InstrumentName>,
    interval: Duration,
) where
    S: SnapshotSource + ?Sized,
{
    info!(
        instruments = instruments.len(),
        interval_ms = interval.as_millis() as u64,
        "Starting order book poller"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        for instrument in &instruments {
            poll_once(source.as_ref(), &ingestor, instrument).await;
        }
    }
}

async fn poll_once<S>(source: &S, ingestor: &FeedIngestor, instrument: &InstrumentName)
where
    S: SnapshotSource + ?Sized,
{
    let snapshot = match source.fetch(instrument).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            StreamMetrics::incr(&ingestor.service().metrics().feed_errors);
            warn!(%instrument, error = %e, "Order book fetch failed");
            return;
        }
    };

    match ingestor.ingest(snapshot) {
        Ok(IngestOutcome::Published { revision, subscribers }) => {
            debug!(%instrument, revision, subscribers, "Polled snapshot published");
        }
        Ok(IngestOutcome::Stale { last_timestamp }) => {
            debug!(%instrument, last_timestamp, "Polled snapshot was stale");
        }
        Err(e) => warn!(%instrument, error = %e, "Polled snapshot rejected"),
    }
}
