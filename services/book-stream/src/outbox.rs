//! Per-connection outbound queues with backpressure
//!
//! Every connection owns one bounded `Outbox`. Producers (the subscribe
//! handler and the fan-out path) push into it without awaiting anything; a
//! dedicated writer task drains it into the socket. A slow or dead client
//! therefore only ever fills its own queue.
//!
//! Book messages are latest-value: a newer update for an instrument that is
//! still waiting in the queue replaces the queued one in place, and a book
//! message whose revision is not newer than the last one queued for that
//! instrument is discarded, so a client never sees a book go backwards.

use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};
use types::instrument::InstrumentName;

use crate::protocol::ServerMessage;

/// Drop policy when a client's outbound queue overflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Disconnect the lagging client immediately.
    Disconnect,
    /// Drop oldest messages to make room for newer ones.
    DropOldest,
}

impl FromStr for DropPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disconnect" => Ok(DropPolicy::Disconnect),
            "drop_oldest" => Ok(DropPolicy::DropOldest),
            other => Err(format!(
                "unknown drop policy {:?} (expected disconnect or drop_oldest)",
                other
            )),
        }
    }
}

/// Action to take when backpressure is triggered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackpressureAction {
    /// Client should be disconnected.
    DisconnectClient,
}

/// What happened to a pushed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Appended to the queue.
    Queued,
    /// Replaced a pending book message for the same instrument.
    Conflated,
    /// A newer book for the instrument was already queued; nothing to do.
    Superseded,
    /// The queue was full and the oldest message was dropped to make room.
    DroppedOldest,
    /// The outbox is closed; the message was discarded.
    Closed,
}

enum MessageKind {
    Book(InstrumentName, u64),
    NoData(InstrumentName),
    Other,
}

struct OutboxQueue {
    /// Messages waiting to be sent.
    messages: VecDeque<ServerMessage>,
    /// Highest book revision queued per instrument since it was subscribed.
    latest_revision: HashMap<InstrumentName, u64>,
    /// Instruments that have had a book queued since they were subscribed.
    answered: HashSet<InstrumentName>,
    capacity: usize,
    drop_policy: DropPolicy,
    messages_dropped: u64,
    messages_conflated: u64,
    is_lagging: bool,
    closed: bool,
}

impl OutboxQueue {
    fn has_room(&self) -> bool {
        self.messages.len() < self.capacity
    }

    /// Make room for one more message according to the drop policy.
    fn make_room(&mut self) -> Result<bool, BackpressureAction> {
        if self.has_room() {
            return Ok(false);
        }

        self.is_lagging = true;
        match self.drop_policy {
            DropPolicy::Disconnect => {
                self.closed = true;
                self.messages.clear();
                Err(BackpressureAction::DisconnectClient)
            }
            DropPolicy::DropOldest => {
                self.messages.pop_front();
                self.messages_dropped += 1;
                Ok(true)
            }
        }
    }

    fn append(&mut self, message: ServerMessage) -> Result<PushOutcome, BackpressureAction> {
        let dropped = self.make_room()?;
        self.messages.push_back(message);

        // Clear lagging flag if queue is below 50% capacity
        if self.messages.len() < self.capacity / 2 {
            self.is_lagging = false;
        }

        Ok(if dropped {
            PushOutcome::DroppedOldest
        } else {
            PushOutcome::Queued
        })
    }
}

/// Bounded, conflating outbound queue for one connection.
pub struct Outbox {
    queue: Mutex<OutboxQueue>,
    notify: Notify,
}

impl Outbox {
    pub fn new(capacity: usize, drop_policy: DropPolicy) -> Self {
        Self {
            queue: Mutex::new(OutboxQueue {
                messages: VecDeque::with_capacity(capacity),
                latest_revision: HashMap::new(),
                answered: HashSet::new(),
                capacity: capacity.max(1),
                drop_policy,
                messages_dropped: 0,
                messages_conflated: 0,
                is_lagging: false,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutboxQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a message without blocking.
    ///
    /// Returns `Err` if the client should be disconnected; the outbox is
    /// already closed when that happens.
    pub fn push(&self, message: ServerMessage) -> Result<PushOutcome, BackpressureAction> {
        self.push_with(message, false)
    }

    /// Queue the answer to a subscribe request.
    ///
    /// A book reply is only superseded by a strictly newer revision, and it
    /// is appended rather than folded into a pending book, so every request
    /// gets its own message.
    pub fn push_reply(&self, message: ServerMessage) -> Result<PushOutcome, BackpressureAction> {
        self.push_with(message, true)
    }

    fn push_with(
        &self,
        message: ServerMessage,
        reply: bool,
    ) -> Result<PushOutcome, BackpressureAction> {
        let kind = match &message {
            ServerMessage::Book(book) => {
                MessageKind::Book(book.snapshot.instrument().clone(), book.revision)
            }
            ServerMessage::NoData { instrument, .. } => MessageKind::NoData(instrument.clone()),
            _ => MessageKind::Other,
        };

        let outcome = {
            let mut queue = self.lock();
            if queue.closed {
                return Ok(PushOutcome::Closed);
            }

            match kind {
                MessageKind::Book(instrument, revision) => {
                    if let Some(&latest) = queue.latest_revision.get(&instrument) {
                        if revision < latest || (revision == latest && !reply) {
                            debug!(%instrument, revision, latest, "Book superseded by queued revision");
                            return Ok(PushOutcome::Superseded);
                        }
                    }
                    queue.latest_revision.insert(instrument.clone(), revision);
                    queue.answered.insert(instrument.clone());

                    // Replace the newest pending book so the queue stays in
                    // revision order.
                    let pending = if reply {
                        None
                    } else {
                        queue.messages.iter_mut().rev().find(|queued| {
                            matches!(queued, ServerMessage::Book(_))
                                && queued.instrument() == Some(&instrument)
                        })
                    };
                    if let Some(slot) = pending {
                        *slot = message;
                        queue.messages_conflated += 1;
                        PushOutcome::Conflated
                    } else {
                        self.append_or_close(&mut queue, message)?
                    }
                }
                MessageKind::NoData(instrument) => {
                    if queue.answered.contains(&instrument) {
                        return Ok(PushOutcome::Superseded);
                    }
                    self.append_or_close(&mut queue, message)?
                }
                MessageKind::Other => self.append_or_close(&mut queue, message)?,
            }
        };

        self.notify.notify_one();
        Ok(outcome)
    }

    fn append_or_close(
        &self,
        queue: &mut OutboxQueue,
        message: ServerMessage,
    ) -> Result<PushOutcome, BackpressureAction> {
        let result = queue.append(message);
        if result.is_err() {
            warn!(
                capacity = queue.capacity,
                "Backpressure: outbox full, disconnecting lagging client"
            );
            self.notify.notify_one();
        }
        result
    }

    /// Start tracking a fresh subscription to `instrument`.
    ///
    /// Forgets the revision high-water mark so the subscribe reply is
    /// delivered even if the same revision was sent under an earlier
    /// subscription.
    pub fn begin_subscription(&self, instrument: &InstrumentName) {
        let mut queue = self.lock();
        queue.latest_revision.remove(instrument);
        queue.answered.remove(instrument);
    }

    /// Stop tracking `instrument` and drop any of its book messages still queued.
    pub fn end_subscription(&self, instrument: &InstrumentName) {
        let mut queue = self.lock();
        queue.latest_revision.remove(instrument);
        queue.answered.remove(instrument);
        queue.messages.retain(|queued| {
            !(matches!(queued, ServerMessage::Book(_) | ServerMessage::NoData { .. })
                && queued.instrument() == Some(instrument))
        });
    }

    /// Wait for the next message. Returns `None` once the outbox is closed.
    pub async fn recv(&self) -> Option<ServerMessage> {
        loop {
            let notified = self.notify.notified();
            {
                let mut queue = self.lock();
                if queue.closed {
                    return None;
                }
                if let Some(message) = queue.messages.pop_front() {
                    return Some(message);
                }
            }
            notified.await;
        }
    }

    /// Take the next message if one is ready.
    pub fn try_recv(&self) -> Option<ServerMessage> {
        let mut queue = self.lock();
        if queue.closed {
            return None;
        }
        queue.messages.pop_front()
    }

    /// Close the outbox and discard anything still queued.
    pub fn close(&self) {
        {
            let mut queue = self.lock();
            queue.closed = true;
            queue.messages.clear();
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of messages currently queued.
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    /// Whether this client is currently lagging.
    pub fn is_lagging(&self) -> bool {
        self.lock().is_lagging
    }

    /// Total messages dropped for this client.
    pub fn messages_dropped(&self) -> u64 {
        self.lock().messages_dropped
    }

    /// Total book messages replaced in place by a newer revision.
    pub fn messages_conflated(&self) -> u64 {
        self.lock().messages_conflated
    }
}
