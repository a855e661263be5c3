//! Transport-independent subscription service
//!
//! `StreamService` owns the cache, the connection registry and the metrics,
//! and implements the client operations (open, subscribe, unsubscribe,
//! close) plus fan-out of new snapshots. The WebSocket layer only moves
//! frames between sockets and this type, which keeps every behavior here
//! testable without a network.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::time::Instant as TokioInstant;
use tracing::{debug, info, warn};
use types::book::OrderBookSnapshot;
use types::instrument::InstrumentName;

use crate::cache::OrderBookCache;
use crate::config::WsConfig;
use crate::error::RequestError;
use crate::metrics::StreamMetrics;
use crate::outbox::{BackpressureAction, Outbox, PushOutcome};
use crate::protocol::{parse_client_request, ClientRequest, ProtocolError, ServerMessage};
use crate::registry::{ConnectionId, ConnectionRegistry};

/// Fixed-window inbound message counter for one connection.
#[derive(Debug)]
struct RateWindow {
    started: TokioInstant,
    count: u32,
}

impl RateWindow {
    fn new() -> Self {
        Self {
            started: TokioInstant::now(),
            count: 0,
        }
    }

    /// Count one message; `false` once the window's budget is spent.
    fn admit(&mut self, config: &WsConfig) -> bool {
        let now = TokioInstant::now();
        if now.duration_since(self.started) >= config.rate_limit_window {
            self.started = now;
            self.count = 0;
        }
        self.count += 1;
        self.count <= config.rate_limit_max_messages
    }
}

/// Per-connection handle held by the transport's reader task.
pub struct Session {
    id: ConnectionId,
    outbox: Arc<Outbox>,
    rate: RateWindow,
}

impl Session {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The queue the transport's writer task drains.
    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }
}

/// Result of one fan-out pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub instrument: InstrumentName,
    pub revision: u64,
    /// Subscribers the update was offered to.
    pub subscribers: usize,
    /// Subscribers disconnected because their outbox overflowed.
    pub disconnected: usize,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub connections: usize,
    pub subscriptions: usize,
    pub instruments: Vec<InstrumentName>,
    pub metrics: BTreeMap<String, u64>,
}

/// Shared order-book cache plus the subscription server built around it.
pub struct StreamService {
    cache: OrderBookCache,
    registry: ConnectionRegistry,
    metrics: StreamMetrics,
    config: WsConfig,
}

impl StreamService {
    pub fn new(config: WsConfig) -> Self {
        Self {
            cache: OrderBookCache::new(),
            registry: ConnectionRegistry::new(config.max_subscriptions_per_connection),
            metrics: StreamMetrics::new(),
            config,
        }
    }

    pub fn cache(&self) -> &OrderBookCache {
        &self.cache
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &StreamMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    /// Register a new connection with an empty subscription set.
    pub fn open_session(&self) -> Session {
        let outbox = Arc::new(Outbox::new(
            self.config.queue_capacity,
            self.config.drop_policy,
        ));
        let id = self.registry.register(Arc::clone(&outbox));
        StreamMetrics::incr(&self.metrics.connections_opened);
        info!(connection_id = id, "Client connected");

        Session {
            id,
            outbox,
            rate: RateWindow::new(),
        }
    }

    /// Handle one inbound text frame. Every request gets exactly one reply
    /// on the session's outbox; an `Err` means that reply was an error.
    pub fn handle_text(&self, session: &mut Session, text: &str) -> Result<(), RequestError> {
        if !session.rate.admit(&self.config) {
            return self.reject(
                session,
                ProtocolError::RateLimited {
                    limit: self.config.rate_limit_max_messages,
                }
                .into(),
            );
        }

        let request = match parse_client_request(text) {
            Ok(request) => request,
            Err(e) => return self.reject(session, e.into()),
        };

        let result = match &request {
            ClientRequest::Subscribe(instrument) => self.subscribe(session, instrument),
            ClientRequest::Unsubscribe(instrument) => self.unsubscribe(session, instrument),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => self.reject(session, e),
        }
    }

    /// Binary frames carry no requests; answer with an error.
    pub fn handle_binary(&self, session: &mut Session) -> Result<(), RequestError> {
        if !session.rate.admit(&self.config) {
            return self.reject(
                session,
                ProtocolError::RateLimited {
                    limit: self.config.rate_limit_max_messages,
                }
                .into(),
            );
        }
        self.reject(session, ProtocolError::BinaryFrame.into())
    }

    /// Subscribe the session to `instrument` and reply with the cached book
    /// or an explicit no-data message.
    pub fn subscribe(
        &self,
        session: &Session,
        instrument: &InstrumentName,
    ) -> Result<(), RequestError> {
        StreamMetrics::incr(&self.metrics.subscribe_requests);

        // Reset the outbox's ordering state before the registry makes the
        // session visible to fan-out.
        if !self.registry.is_subscribed(session.id, instrument.as_str()) {
            session.outbox.begin_subscription(instrument);
        }
        let added = self.registry.subscribe(session.id, instrument)?;

        let reply = match self.cache.get(instrument.as_str()) {
            Some(cached) => ServerMessage::book(&cached),
            None => ServerMessage::no_data(instrument.clone()),
        };
        debug!(
            connection_id = session.id,
            %instrument,
            added,
            revision = reply.revision(),
            "Subscribed"
        );
        self.record(session.id, session.outbox.push_reply(reply));
        Ok(())
    }

    /// Remove a subscription and acknowledge it. Unsubscribing from an
    /// instrument that was not subscribed is acknowledged as well.
    pub fn unsubscribe(
        &self,
        session: &Session,
        instrument: &InstrumentName,
    ) -> Result<(), RequestError> {
        StreamMetrics::incr(&self.metrics.unsubscribe_requests);

        let removed = self.registry.unsubscribe(session.id, instrument)?;
        session.outbox.end_subscription(instrument);
        debug!(connection_id = session.id, %instrument, removed, "Unsubscribed");

        self.deliver(
            session.id,
            &session.outbox,
            ServerMessage::Unsubscribed {
                unsubscribed: instrument.clone(),
            },
        );
        Ok(())
    }

    fn reject(&self, session: &Session, error: RequestError) -> Result<(), RequestError> {
        StreamMetrics::incr(&self.metrics.rejected_requests);
        debug!(connection_id = session.id, %error, "Rejected client request");
        self.deliver(session.id, &session.outbox, ServerMessage::error(&error));
        Err(error)
    }

    /// Deregister the connection and discard anything still queued for it.
    pub fn close_session(&self, session: Session) {
        let was_registered = self.registry.deregister(session.id);
        session.outbox.close();
        StreamMetrics::incr(&self.metrics.connections_closed);
        info!(
            connection_id = session.id,
            was_registered,
            dropped = session.outbox.messages_dropped(),
            "Client disconnected"
        );
    }

    /// Commit a snapshot to the cache and offer it to every subscriber.
    ///
    /// Never waits on a client: each push only touches that client's
    /// outbox, and a client whose outbox overflows under the disconnect
    /// policy is deregistered on the spot.
    pub fn publish(&self, snapshot: OrderBookSnapshot) -> PublishReport {
        let started = Instant::now();

        let cached = self.cache.put(snapshot);
        let instrument = cached.snapshot.instrument().clone();
        let subscribers = self.registry.subscribers_of(instrument.as_str());

        let message = ServerMessage::book(&cached);
        let mut disconnected = 0;
        for subscriber in &subscribers {
            if !self.deliver(subscriber.id, &subscriber.outbox, message.clone()) {
                disconnected += 1;
            }
        }

        self.metrics
            .record_publish(started.elapsed().as_nanos().min(u64::MAX as u128) as u64);
        debug!(
            %instrument,
            revision = cached.revision,
            subscribers = subscribers.len(),
            disconnected,
            "Published snapshot"
        );

        PublishReport {
            instrument,
            revision: cached.revision,
            subscribers: subscribers.len(),
            disconnected,
        }
    }

    /// Push one message to a connection's outbox. Returns `false` if the
    /// connection was disconnected for lagging.
    fn deliver(&self, id: ConnectionId, outbox: &Outbox, message: ServerMessage) -> bool {
        self.record(id, outbox.push(message))
    }

    fn record(&self, id: ConnectionId, pushed: Result<PushOutcome, BackpressureAction>) -> bool {
        match pushed {
            Ok(outcome) => {
                let counter = match outcome {
                    PushOutcome::Queued => Some(&self.metrics.messages_enqueued),
                    PushOutcome::Conflated => Some(&self.metrics.messages_conflated),
                    PushOutcome::Superseded => Some(&self.metrics.messages_superseded),
                    PushOutcome::DroppedOldest => {
                        StreamMetrics::incr(&self.metrics.messages_enqueued);
                        Some(&self.metrics.messages_dropped_backpressure)
                    }
                    PushOutcome::Closed => None,
                };
                if let Some(counter) = counter {
                    StreamMetrics::incr(counter);
                }
                true
            }
            Err(BackpressureAction::DisconnectClient) => {
                StreamMetrics::incr(&self.metrics.backpressure_disconnects);
                self.registry.deregister(id);
                warn!(connection_id = id, "Disconnected lagging client");
                false
            }
        }
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok",
            connections: self.registry.connection_count(),
            subscriptions: self.registry.subscription_count(),
            instruments: self.cache.instruments(),
            metrics: self.metrics.export(),
        }
    }
}

impl Default for StreamService {
    fn default() -> Self {
        Self::new(WsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use types::book::BookLevel;
    use types::numeric::{Amount, Price};

    use crate::outbox::DropPolicy;

    fn name(s: &str) -> InstrumentName {
        InstrumentName::new(s).unwrap()
    }

    fn snapshot(instrument: &str, bid: u64) -> OrderBookSnapshot {
        OrderBookSnapshot::new(
            name(instrument),
            Some(BookLevel::new(Price::from_u64(bid), Amount::from_u64(1))),
            Some(BookLevel::new(Price::from_u64(bid + 1), Amount::from_u64(2))),
            1_700_000_000_000,
        )
        .unwrap()
    }

    fn drain(session: &Session) -> Vec<ServerMessage> {
        std::iter::from_fn(|| session.outbox().try_recv()).collect()
    }

    fn service_with(capacity: usize, drop_policy: DropPolicy) -> StreamService {
        StreamService::new(WsConfig {
            queue_capacity: capacity,
            drop_policy,
            ..WsConfig::default()
        })
    }

    #[test]
    fn test_subscribe_without_data_replies_no_data() {
        let service = StreamService::default();
        let mut session = service.open_session();

        service
            .handle_text(&mut session, r#"{"subscribe":"BTC-PERPETUAL"}"#)
            .unwrap();

        assert_eq!(drain(&session), vec![ServerMessage::no_data(name("BTC-PERPETUAL"))]);
        assert_eq!(
            service.registry().subscriptions_of(session.id()),
            Some(vec![name("BTC-PERPETUAL")])
        );
    }

    #[test]
    fn test_subscribe_replies_with_cached_snapshot() {
        let service = StreamService::default();
        let report = service.publish(snapshot("BTC-PERPETUAL", 100));
        assert_eq!(report.subscribers, 0);

        let session = service.open_session();
        service.subscribe(&session, &name("BTC-PERPETUAL")).unwrap();

        let messages = drain(&session);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].revision(), Some(report.revision));
        let ServerMessage::Book(book) = &messages[0] else {
            panic!("expected a book reply, got {:?}", messages[0]);
        };
        assert_eq!(book.snapshot.best_bid().unwrap().price, Price::from_u64(100));
    }

    #[test]
    fn test_repeated_subscribe_is_answered_each_time() {
        let service = StreamService::default();
        let report = service.publish(snapshot("BTC-PERPETUAL", 100));
        let mut session = service.open_session();

        for _ in 0..2 {
            service
                .handle_text(&mut session, r#"{"subscribe":"BTC-PERPETUAL"}"#)
                .unwrap();
            let messages = drain(&session);
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].revision(), Some(report.revision));
        }

        // Both requests queued before the client reads anything.
        service.subscribe(&session, &name("BTC-PERPETUAL")).unwrap();
        service.subscribe(&session, &name("BTC-PERPETUAL")).unwrap();
        assert_eq!(drain(&session).len(), 2);
        assert_eq!(service.registry().subscription_count(), 1);
    }

    #[test]
    fn test_empty_book_is_data_not_no_data() {
        let service = StreamService::default();
        service.publish(OrderBookSnapshot::new(name("BTC-PERPETUAL"), None, None, 0).unwrap());

        let session = service.open_session();
        service.subscribe(&session, &name("BTC-PERPETUAL")).unwrap();

        let messages = drain(&session);
        assert!(matches!(messages[0], ServerMessage::Book(_)));
    }

    #[test]
    fn test_publish_fans_out_to_subscribers_only() {
        let service = StreamService::default();
        let btc = service.open_session();
        let eth = service.open_session();
        service.subscribe(&btc, &name("BTC-PERPETUAL")).unwrap();
        service.subscribe(&eth, &name("ETH-PERPETUAL")).unwrap();
        drain(&btc);
        drain(&eth);

        let report = service.publish(snapshot("BTC-PERPETUAL", 100));

        assert_eq!(report.subscribers, 1);
        assert_eq!(drain(&btc).len(), 1);
        assert!(drain(&eth).is_empty());
    }

    #[test]
    fn test_unsubscribe_acknowledges_and_stops_updates() {
        let service = StreamService::default();
        let mut session = service.open_session();
        service.subscribe(&session, &name("BTC-PERPETUAL")).unwrap();
        drain(&session);

        service
            .handle_text(&mut session, r#"{"unsubscribe":"BTC-PERPETUAL"}"#)
            .unwrap();
        service.publish(snapshot("BTC-PERPETUAL", 100));

        assert_eq!(
            drain(&session),
            vec![ServerMessage::Unsubscribed {
                unsubscribed: name("BTC-PERPETUAL")
            }]
        );

        // Not subscribed: still acknowledged.
        service.unsubscribe(&session, &name("ETH-PERPETUAL")).unwrap();
        assert_eq!(drain(&session).len(), 1);
    }

    #[test]
    fn test_malformed_request_answers_only_that_connection() {
        let service = StreamService::default();
        let mut bad = service.open_session();
        let good = service.open_session();

        let err = service.handle_text(&mut bad, "not json").unwrap_err();
        assert!(matches!(err, RequestError::Protocol(ProtocolError::Malformed(_))));

        let messages = drain(&bad);
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], ServerMessage::Error { .. }));
        assert!(drain(&good).is_empty());
        assert!(service.registry().is_registered(bad.id()));
    }

    #[test]
    fn test_binary_frame_rejected() {
        let service = StreamService::default();
        let mut session = service.open_session();

        let err = service.handle_binary(&mut session).unwrap_err();
        assert_eq!(err, RequestError::Protocol(ProtocolError::BinaryFrame));
        assert_eq!(
            drain(&session),
            vec![ServerMessage::error("binary frames are not supported")]
        );
    }

    #[test]
    fn test_subscription_limit_reported_to_client() {
        let service = StreamService::new(WsConfig {
            max_subscriptions_per_connection: 1,
            ..WsConfig::default()
        });
        let mut session = service.open_session();
        service.subscribe(&session, &name("BTC-PERPETUAL")).unwrap();
        drain(&session);

        let err = service
            .handle_text(&mut session, r#"{"subscribe":"ETH-PERPETUAL"}"#)
            .unwrap_err();
        assert!(matches!(err, RequestError::Registry(_)));
        assert!(matches!(drain(&session)[0], ServerMessage::Error { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit() {
        let service = StreamService::new(WsConfig {
            rate_limit_max_messages: 2,
            rate_limit_window: Duration::from_secs(1),
            ..WsConfig::default()
        });
        let mut session = service.open_session();
        let frame = r#"{"subscribe":"BTC-PERPETUAL"}"#;

        service.handle_text(&mut session, frame).unwrap();
        service.handle_text(&mut session, frame).unwrap();
        let err = service.handle_text(&mut session, frame).unwrap_err();
        assert_eq!(
            err,
            RequestError::Protocol(ProtocolError::RateLimited { limit: 2 })
        );

        tokio::time::advance(Duration::from_secs(1)).await;
        service.handle_text(&mut session, frame).unwrap();
    }

    #[test]
    fn test_close_isolates_other_connections() {
        let service = StreamService::default();
        let a = service.open_session();
        let b = service.open_session();
        service.subscribe(&a, &name("BTC-PERPETUAL")).unwrap();
        service.subscribe(&b, &name("BTC-PERPETUAL")).unwrap();
        drain(&b);

        let a_outbox = Arc::clone(a.outbox());
        service.close_session(a);
        assert!(a_outbox.is_closed());

        let report = service.publish(snapshot("BTC-PERPETUAL", 100));
        assert_eq!(report.subscribers, 1);
        assert_eq!(drain(&b).len(), 1);
        service.registry().assert_consistent();
    }

    #[test]
    fn test_close_after_backpressure_disconnect_is_harmless() {
        let service = service_with(1, DropPolicy::Disconnect);
        let session = service.open_session();
        service.subscribe(&session, &name("BTC-PERPETUAL")).unwrap();
        service.subscribe(&session, &name("ETH-PERPETUAL")).unwrap();

        assert!(!service.registry().is_registered(session.id()));
        service.close_session(session);
        assert_eq!(service.registry().connection_count(), 0);
        assert_eq!(service.metrics().active_connections(), 0);
    }

    #[test]
    fn test_stalled_subscriber_does_not_hold_back_others() {
        let service = service_with(2, DropPolicy::Disconnect);
        let stalled = service.open_session();
        let healthy = service.open_session();
        for session in [&stalled, &healthy] {
            service.subscribe(session, &name("BTC-PERPETUAL")).unwrap();
            service.subscribe(session, &name("ETH-PERPETUAL")).unwrap();
            drain(session);
        }

        // The stalled client never drains; the healthy one keeps up.
        let mut disconnected = 0;
        for i in 0..50 {
            let instrument = if i % 2 == 0 { "BTC-PERPETUAL" } else { "ETH-PERPETUAL" };
            let report = service.publish(snapshot(instrument, 100 + i));
            disconnected += report.disconnected;
            assert_eq!(drain(&healthy).len(), 1);
        }

        // Conflation keeps the stalled queue at one slot per instrument.
        assert_eq!(disconnected, 0);
        assert_eq!(stalled.outbox().len(), 2);
    }

    #[test]
    fn test_overflow_disconnects_only_the_lagging_client() {
        let service = service_with(2, DropPolicy::Disconnect);
        let stalled = service.open_session();
        let healthy = service.open_session();
        let instruments = ["A-PERP", "B-PERP", "C-PERP"];
        for instrument in instruments {
            service.subscribe(&healthy, &name(instrument)).unwrap();
            drain(&healthy);
        }
        for instrument in &instruments[..2] {
            service.subscribe(&stalled, &name(instrument)).unwrap();
        }
        // Two no-data replies fill the stalled queue; the third reply overflows.
        service.subscribe(&stalled, &name("C-PERP")).unwrap();

        assert!(stalled.outbox().is_closed());
        assert!(!service.registry().is_registered(stalled.id()));

        let report = service.publish(snapshot("A-PERP", 100));
        assert_eq!(report.subscribers, 1);
        assert_eq!(drain(&healthy).len(), 1);
        assert_eq!(
            service.metrics().export()["backpressure_disconnects"],
            1
        );
    }

    #[test]
    fn test_client_never_sees_book_go_backwards() {
        let service = StreamService::default();
        let session = service.open_session();
        service.subscribe(&session, &name("BTC-PERPETUAL")).unwrap();
        drain(&session);

        let publisher = {
            let service = Arc::new(service);
            let handles: Vec<_> = (0..4)
                .map(|worker| {
                    let service = Arc::clone(&service);
                    thread::spawn(move || {
                        for i in 0..200 {
                            service.publish(snapshot("BTC-PERPETUAL", worker * 1_000 + i));
                        }
                    })
                })
                .collect();

            let mut last = 0;
            loop {
                match session.outbox().try_recv() {
                    Some(message) => {
                        let revision = message.revision().unwrap();
                        assert!(revision > last, "revision {} after {}", revision, last);
                        last = revision;
                    }
                    None if handles.iter().all(|h| h.is_finished()) => break,
                    None => thread::yield_now(),
                }
            }
            for handle in handles {
                handle.join().unwrap();
            }
            service
        };

        let final_revision = publisher.cache().get("BTC-PERPETUAL").unwrap().revision;
        let tail: Vec<u64> = drain(&session).iter().filter_map(|m| m.revision()).collect();
        assert!(tail.len() <= 1);
        if let Some(&revision) = tail.last() {
            assert_eq!(revision, final_revision);
        }
    }

    #[test]
    fn test_health_report() {
        let service = StreamService::default();
        let session = service.open_session();
        service.subscribe(&session, &name("BTC-PERPETUAL")).unwrap();
        service.publish(snapshot("BTC-PERPETUAL", 100));

        let health = service.health();
        assert_eq!(health.status, "ok");
        assert_eq!(health.connections, 1);
        assert_eq!(health.subscriptions, 1);
        assert_eq!(health.instruments, vec![name("BTC-PERPETUAL")]);
        assert_eq!(health.metrics["updates_published"], 1);
    }
}
