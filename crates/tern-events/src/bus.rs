// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! In-process pub/sub with per-subscriber bounded queues.
//!
//! Each subscriber gets its own mpsc channel.  `emit` awaits a subscriber
//! whose queue is full instead of dropping — slow consumers apply
//! backpressure to the producing turn rather than losing events.  Dropping
//! an [`EventStream`] closes its channel and the subscriber is pruned on the
//! next emit, so teardown needs no explicit unsubscribe call.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::event::EventEnvelope;

/// Which envelopes a subscriber wants.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Restrict to these wire names; `None` means all events.
    pub names: Option<Vec<&'static str>>,
    /// Restrict to one session; `None` means all sessions (including
    /// process-wide events).
    pub session_id: Option<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self { names: None, session_id: Some(session_id.into()) }
    }

    pub fn named(names: Vec<&'static str>) -> Self {
        Self { names: Some(names), session_id: None }
    }

    fn matches(&self, env: &EventEnvelope) -> bool {
        if let Some(session) = &self.session_id {
            if env.session_id.as_deref() != Some(session.as_str()) {
                return false;
            }
        }
        match &self.names {
            Some(names) => names.contains(&env.event.kind()),
            None => true,
        }
    }
}

struct Subscriber {
    id: u64,
    filter: EventFilter,
    tx: mpsc::Sender<EventEnvelope>,
}

struct BusInner {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    capacity: usize,
}

/// Cheap-to-clone handle to the shared bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// `capacity` bounds each subscriber's queue.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Register a subscriber and return its stream.
    pub fn subscribe(&self, filter: EventFilter) -> EventStream {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(Subscriber { id, filter, tx });
        EventStream { inner: ReceiverStream::new(rx) }
    }

    /// Stream of all events for one session.
    pub fn session_stream(&self, session_id: impl Into<String>) -> EventStream {
        self.subscribe(EventFilter::for_session(session_id))
    }

    /// Fan the envelope out to every matching subscriber.
    ///
    /// Delivery order equals emission order per emitting task.  A full
    /// subscriber queue makes this await; a dropped subscriber is pruned.
    pub async fn emit(&self, env: EventEnvelope) {
        // Snapshot matching senders under the lock, send outside it.
        let targets: Vec<(u64, mpsc::Sender<EventEnvelope>)> = {
            let subs = self.inner.subscribers.lock().expect("subscriber list poisoned");
            subs.iter()
                .filter(|s| s.filter.matches(&env))
                .map(|s| (s.id, s.tx.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, tx) in targets {
            if tx.send(env.clone()).await.is_err() {
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            let mut subs = self.inner.subscribers.lock().expect("subscriber list poisoned");
            subs.retain(|s| !dead.contains(&s.id));
            debug!(pruned = dead.len(), "removed closed event subscribers");
        }
    }

    /// Number of live subscribers (diagnostics and tests).
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().expect("subscriber list poisoned").len()
    }
}

/// A subscriber's view of the bus.  Ends when the bus side is gone; dropping
/// it unsubscribes.
#[derive(Debug)]
pub struct EventStream {
    inner: ReceiverStream<EventEnvelope>,
}

impl EventStream {
    /// Receive the next matching envelope, or `None` once closed.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        use futures::StreamExt;
        self.inner.next().await
    }
}

impl Stream for EventStream {
    type Item = EventEnvelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
