//! Wire protocol for the streaming endpoint
//!
//! Clients send one JSON object per text frame:
//! - `{"subscribe":"BTC-PERPETUAL"}`
//! - `{"unsubscribe":"BTC-PERPETUAL"}`
//!
//! The server answers with flat JSON objects whose shape identifies them:
//! - book: `{"instrument":..,"bestBid":{..},"bestAsk":{..},"timestamp":..,"revision":..}`
//! - no data yet: `{"instrument":..,"data":null}`
//! - unsubscribe acknowledgment: `{"unsubscribed":..}`
//! - error: `{"error":"<reason>"}`
//!
//! Pushed updates use the same book shape as subscribe replies.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use types::book::OrderBookSnapshot;
use types::instrument::InstrumentName;

use crate::cache::CachedBook;

/// Reasons a client frame cannot be turned into a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("unknown operation: expected \"subscribe\" or \"unsubscribe\"")]
    UnknownOperation,

    #[error("invalid instrument: {0}")]
    InvalidInstrument(String),

    #[error("binary frames are not supported")]
    BinaryFrame,

    #[error("rate limit exceeded: at most {limit} messages per window")]
    RateLimited { limit: u32 },
}

/// A parsed client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Subscribe(InstrumentName),
    Unsubscribe(InstrumentName),
}

/// Parse a raw text frame into a request.
///
/// Exactly one of `subscribe` / `unsubscribe` must be present and its value
/// must be a valid instrument name.
pub fn parse_client_request(text: &str) -> Result<ClientRequest, ProtocolError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ProtocolError::Malformed(format!("invalid JSON: {}", e)))?;

    let object = value
        .as_object()
        .ok_or_else(|| ProtocolError::Malformed("request must be a JSON object".to_string()))?;

    if object.len() != 1 {
        return Err(ProtocolError::Malformed(
            "request must carry exactly one operation".to_string(),
        ));
    }

    let (operation, argument) = object
        .iter()
        .next()
        .ok_or(ProtocolError::UnknownOperation)?;

    let name = argument
        .as_str()
        .ok_or_else(|| ProtocolError::InvalidInstrument("instrument must be a string".to_string()))?;
    let instrument = InstrumentName::new(name)
        .map_err(|e| ProtocolError::InvalidInstrument(e.to_string()))?;

    match operation.as_str() {
        "subscribe" => Ok(ClientRequest::Subscribe(instrument)),
        "unsubscribe" => Ok(ClientRequest::Unsubscribe(instrument)),
        _ => Err(ProtocolError::UnknownOperation),
    }
}

/// A book view sent to a subscriber: the snapshot plus the cache revision it
/// was committed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookMessage {
    #[serde(flatten)]
    pub snapshot: Arc<OrderBookSnapshot>,
    pub revision: u64,
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Book(BookMessage),
    NoData { instrument: InstrumentName, data: () },
    Unsubscribed { unsubscribed: InstrumentName },
    Error { error: String },
}

impl ServerMessage {
    pub fn book(cached: &CachedBook) -> Self {
        ServerMessage::Book(BookMessage {
            snapshot: Arc::clone(&cached.snapshot),
            revision: cached.revision,
        })
    }

    pub fn no_data(instrument: InstrumentName) -> Self {
        ServerMessage::NoData {
            instrument,
            data: (),
        }
    }

    pub fn error(reason: impl ToString) -> Self {
        ServerMessage::Error {
            error: reason.to_string(),
        }
    }

    /// The instrument this message describes, for book and no-data replies.
    pub fn instrument(&self) -> Option<&InstrumentName> {
        match self {
            ServerMessage::Book(book) => Some(book.snapshot.instrument()),
            ServerMessage::NoData { instrument, .. } => Some(instrument),
            _ => None,
        }
    }

    /// Cache revision carried by a book message.
    pub fn revision(&self) -> Option<u64> {
        match self {
            ServerMessage::Book(book) => Some(book.revision),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
