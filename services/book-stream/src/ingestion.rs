//! Snapshot ingestion front door
//!
//! Every snapshot entering the service passes through `FeedIngestor`, which
//! enforces the instrument allow-list and per-instrument timestamp order
//! before publishing into the `StreamService`. Push-style feeds can hand
//! snapshots over through a bounded channel (`spawn_channel_feed`).

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::book::OrderBookSnapshot;
use types::instrument::InstrumentName;

use crate::metrics::StreamMetrics;
use crate::service::StreamService;

/// Errors that can occur during snapshot ingestion.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestionError {
    #[error("instrument {0} is not configured for ingestion")]
    UnknownInstrument(String),

    #[error("feed channel closed")]
    ChannelClosed,
}

/// Result of ingesting a single snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Committed to the cache and offered to `subscribers` connections.
    Published { revision: u64, subscribers: usize },
    /// Older than the last accepted snapshot for the instrument; dropped.
    Stale { last_timestamp: i64 },
}

/// Validates snapshots and publishes the accepted ones.
pub struct FeedIngestor {
    service: Arc<StreamService>,
    /// `None` accepts every instrument.
    allowed: Option<HashSet<InstrumentName>>,
    /// Timestamp of the last accepted snapshot per instrument.
    last_timestamp: DashMap<InstrumentName, i64>,
}

impl FeedIngestor {
    pub fn new(service: Arc<StreamService>) -> Self {
        Self {
            service,
            allowed: None,
            last_timestamp: DashMap::new(),
        }
    }

    /// Only accept snapshots for the given instruments.
    pub fn with_allow_list(mut self, instruments: impl IntoIterator<Item = InstrumentName>) -> Self {
        let allowed: HashSet<InstrumentName> = instruments.into_iter().collect();
        info!(instruments = allowed.len(), "Ingestion allow-list configured");
        self.allowed = Some(allowed);
        self
    }

    pub fn service(&self) -> &Arc<StreamService> {
        &self.service
    }

    /// Ingest a single snapshot.
    ///
    /// Snapshots with equal timestamps are all accepted; only strictly older
    /// ones are dropped.
    pub fn ingest(&self, snapshot: OrderBookSnapshot) -> Result<IngestOutcome, IngestionError> {
        let metrics = self.service.metrics();
        let instrument = snapshot.instrument().clone();

        if let Some(allowed) = &self.allowed {
            if !allowed.contains(&instrument) {
                StreamMetrics::incr(&metrics.snapshots_rejected);
                warn!(%instrument, "Rejecting snapshot for unconfigured instrument");
                return Err(IngestionError::UnknownInstrument(instrument.into()));
            }
        }

        // The entry guard is held through publish so the staleness check and
        // the cache commit happen as one step per instrument.
        let mut last = self.last_timestamp.entry(instrument.clone()).or_insert(i64::MIN);
        if snapshot.timestamp() < *last {
            StreamMetrics::incr(&metrics.snapshots_stale);
            debug!(
                %instrument,
                timestamp = snapshot.timestamp(),
                last_timestamp = *last,
                "Dropping stale snapshot"
            );
            return Ok(IngestOutcome::Stale {
                last_timestamp: *last,
            });
        }
        *last = snapshot.timestamp();

        let report = self.service.publish(snapshot);
        drop(last);

        StreamMetrics::incr(&metrics.snapshots_ingested);
        Ok(IngestOutcome::Published {
            revision: report.revision,
            subscribers: report.subscribers,
        })
    }
}

/// Sending half of a channel feed.
#[derive(Clone)]
pub struct FeedHandle {
    tx: mpsc::Sender<OrderBookSnapshot>,
}

impl FeedHandle {
    /// Hand a snapshot to the ingestion task, waiting for channel capacity.
    pub async fn send(&self, snapshot: OrderBookSnapshot) -> Result<(), IngestionError> {
        self.tx
            .send(snapshot)
            .await
            .map_err(|_| IngestionError::ChannelClosed)
    }
}

/// Spawn a task that ingests every snapshot sent through the returned
/// handle. The task ends once all handles are dropped.
pub fn spawn_channel_feed(
    ingestor: Arc<FeedIngestor>,
    capacity: usize,
) -> (FeedHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(capacity.max(1));

    let task = tokio::spawn(async move {
        while let Some(snapshot) = rx.recv().await {
            if let Err(e) = ingestor.ingest(snapshot) {
                warn!(error = %e, "Channel feed snapshot rejected");
            }
        }
        debug!("Channel feed closed");
    });

    (FeedHandle { tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerMessage;
    use types::book::BookLevel;
    use types::numeric::{Amount, Price};

    fn name(s: &str) -> InstrumentName {
        InstrumentName::new(s).unwrap()
    }

    fn snapshot(instrument: &str, bid: u64, timestamp: i64) -> OrderBookSnapshot {
        OrderBookSnapshot::new(
            name(instrument),
            Some(BookLevel::new(Price::from_u64(bid), Amount::from_u64(1))),
            Some(BookLevel::new(Price::from_u64(bid + 1), Amount::from_u64(1))),
            timestamp,
        )
        .unwrap()
    }

    fn ingestor() -> FeedIngestor {
        FeedIngestor::new(Arc::new(StreamService::default()))
    }

    #[test]
    fn test_ingest_publishes_into_cache() {
        let ingestor = ingestor();
        let outcome = ingestor.ingest(snapshot("BTC-PERPETUAL", 100, 1_000)).unwrap();

        let IngestOutcome::Published { revision, subscribers } = outcome else {
            panic!("expected publish, got {:?}", outcome);
        };
        assert_eq!(subscribers, 0);
        let cached = ingestor.service().cache().get("BTC-PERPETUAL").unwrap();
        assert_eq!(cached.revision, revision);
    }

    #[test]
    fn test_stale_snapshot_dropped() {
        let ingestor = ingestor();
        ingestor.ingest(snapshot("BTC-PERPETUAL", 200, 2_000)).unwrap();

        let outcome = ingestor.ingest(snapshot("BTC-PERPETUAL", 100, 1_000)).unwrap();
        assert_eq!(outcome, IngestOutcome::Stale { last_timestamp: 2_000 });

        let cached = ingestor.service().cache().get("BTC-PERPETUAL").unwrap();
        assert_eq!(cached.snapshot.best_bid().unwrap().price, Price::from_u64(200));
        assert_eq!(ingestor.service().metrics().export()["snapshots_stale"], 1);
    }

    #[test]
    fn test_equal_timestamp_accepted_and_instruments_independent() {
        let ingestor = ingestor();
        ingestor.ingest(snapshot("BTC-PERPETUAL", 100, 2_000)).unwrap();

        let outcome = ingestor.ingest(snapshot("BTC-PERPETUAL", 101, 2_000)).unwrap();
        assert!(matches!(outcome, IngestOutcome::Published { .. }));

        let outcome = ingestor.ingest(snapshot("ETH-PERPETUAL", 10, 1)).unwrap();
        assert!(matches!(outcome, IngestOutcome::Published { .. }));
    }

    #[test]
    fn test_allow_list() {
        let ingestor = ingestor().with_allow_list([name("BTC-PERPETUAL")]);

        let err = ingestor.ingest(snapshot("ETH-PERPETUAL", 10, 1)).unwrap_err();
        assert_eq!(err, IngestionError::UnknownInstrument("ETH-PERPETUAL".to_string()));
        assert!(ingestor.service().cache().get("ETH-PERPETUAL").is_none());
        assert!(ingestor.ingest(snapshot("BTC-PERPETUAL", 10, 1)).is_ok());
    }

    #[test]
    fn test_ingest_reaches_subscribers() {
        let ingestor = ingestor();
        let service = Arc::clone(ingestor.service());
        let session = service.open_session();
        service.subscribe(&session, &name("BTC-PERPETUAL")).unwrap();
        session.outbox().try_recv();

        let outcome = ingestor.ingest(snapshot("BTC-PERPETUAL", 100, 1)).unwrap();
        assert!(matches!(outcome, IngestOutcome::Published { subscribers: 1, .. }));
        assert!(matches!(
            session.outbox().try_recv(),
            Some(ServerMessage::Book(_))
        ));
    }

    #[tokio::test]
    async fn test_channel_feed() {
        let ingestor = Arc::new(ingestor());
        let (handle, task) = spawn_channel_feed(Arc::clone(&ingestor), 8);

        handle.send(snapshot("BTC-PERPETUAL", 100, 1)).await.unwrap();
        handle.send(snapshot("BTC-PERPETUAL", 105, 2)).await.unwrap();
        drop(handle);
        task.await.unwrap();

        let cached = ingestor.service().cache().get("BTC-PERPETUAL").unwrap();
        assert_eq!(cached.snapshot.best_bid().unwrap().price, Price::from_u64(105));
        assert_eq!(ingestor.service().metrics().export()["snapshots_ingested"], 2);
    }
}
