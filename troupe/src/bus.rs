//! In-process event fan-in.
//!
//! One [`EventBus`] exists per run. Producers (the leader and every active
//! member) hold a [`Producer`] handle; the single consumer drains a
//! [`RunEvents`] stream. The channel is bounded and producers block when it
//! is full — no event is ever dropped.
//!
//! Each producer stamps its own gap-free `seq`; the bus stamps a shared
//! `run_seq` so the consumer can reconstruct a global interleaving.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use chrono::Utc;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::trace;

use crate::event::{Event, EventBody};
use crate::model::fresh_id;

/// Default channel capacity when none is configured.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Sending half of a run's event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    run_id: String,
    tx: mpsc::Sender<Event>,
    run_seq: Arc<AtomicU64>,
}

impl EventBus {
    /// Creates the bus and its consumer stream.
    #[must_use]
    pub fn channel(run_id: impl Into<String>, capacity: usize) -> (Self, RunEvents) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                run_id: run_id.into(),
                tx,
                run_seq: Arc::new(AtomicU64::new(0)),
            },
            RunEvents { rx },
        )
    }

    /// Returns the run this bus serves.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Creates a producer handle.
    ///
    /// Handles may be cloned, but per the single-writer rule, only one task
    /// may emit through a given producer identity at a time; sequence
    /// numbers stay gap-free because emission is serialized per producer.
    #[must_use]
    pub fn producer(&self, producer_id: impl Into<String>) -> Producer {
        Producer {
            bus: self.clone(),
            producer_id: producer_id.into(),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// A per-producer emission handle.
#[derive(Debug, Clone)]
pub struct Producer {
    bus: EventBus,
    producer_id: String,
    seq: Arc<AtomicU64>,
}

impl Producer {
    /// Returns this producer's identity.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.producer_id
    }

    /// Derives a child producer for a delegated member.
    #[must_use]
    pub fn child(&self, member_id: &str) -> Producer {
        self.bus.producer(format!("{}/{member_id}", self.producer_id))
    }

    /// Emits one event, blocking if the channel is full.
    ///
    /// Emission after the consumer has gone away (cancelled run whose
    /// stream was dropped) is a no-op.
    pub async fn emit(&self, body: EventBody) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let run_seq = self.bus.run_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Event {
            event_id: fresh_id(),
            run_id: self.bus.run_id.clone(),
            producer_id: self.producer_id.clone(),
            seq,
            run_seq,
            body,
            ts: Utc::now(),
        };

        if self.bus.tx.send(event).await.is_err() {
            trace!(
                run_id = %self.bus.run_id,
                producer = %self.producer_id,
                "event dropped: consumer gone"
            );
        }
    }
}

/// Receiving half of a run's event channel.
///
/// Ends (returns `None`) once every [`EventBus`] clone and producer has
/// been dropped and the buffer is drained.
#[derive(Debug)]
pub struct RunEvents {
    rx: mpsc::Receiver<Event>,
}

impl RunEvents {
    /// Wraps a receiver produced elsewhere (the coordinator's public
    /// stream reuses this type).
    pub(crate) fn from_receiver(rx: mpsc::Receiver<Event>) -> Self {
        Self { rx }
    }

    /// Receives the next event, or `None` when the stream is closed.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Drains all remaining events into a vector (test/replay helper).
    pub async fn collect(mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }
}

impl Stream for RunEvents {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}
