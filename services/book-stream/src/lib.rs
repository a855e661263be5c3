//! Order-book streaming service
//!
//! Keeps the latest top-of-book snapshot per instrument in a shared cache
//! and pushes it to WebSocket subscribers:
//! - Shared, sharded order-book cache with whole-snapshot replacement
//! - Connection registry with forward and reverse subscription indices
//! - Per-connection bounded outboxes with conflation and backpressure
//! - JSON subscribe/unsubscribe protocol over WebSocket
//! - Polling ingestion from a venue's JSON-RPC API
//!
//! # Architecture
//!
//! ```text
//!  Venue JSON-RPC / channel feed
//!        │
//!    ┌───▼────┐
//!    │Ingest  │  ← allow-list, stale timestamps
//!    └───┬────┘
//!        │ publish
//!    ┌───▼────┐      ┌──────────┐
//!    │ Cache  │      │ Registry │  ← subscribe / unsubscribe
//!    └───┬────┘      └────┬─────┘
//!        │  subscribers_of│
//!   ┌────▼────────────────▼───┐
//!   │  Per-connection outbox  │  ← conflation, drop policy
//!   └────────────┬────────────┘
//!           ┌────▼────┐
//!           │ Writer  │  → WebSocket client
//!           └─────────┘
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod ingestion;
pub mod metrics;
pub mod outbox;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod service;
pub mod source;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
