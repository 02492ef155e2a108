// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use crate::event::Event;

/// Per-subscriber buffer size.  A subscriber that falls more than this many
/// events behind loses its oldest queued events and sees a `Dropped` marker.
pub const DEFAULT_CAPACITY: usize = 256;

/// In-process typed publish/subscribe hub.
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event.  Fire-and-forget: a send with no subscribers is
    /// not an error, and subscriber failures never reach the publisher.
    pub fn publish(&self, event: Event) {
        trace!(event = event.name(), "publish");
        let _ = self.tx.send(event);
    }

    /// Subscribe to every event.
    pub fn subscribe_all(&self) -> EventStream {
        EventStream {
            inner: BroadcastStream::new(self.tx.subscribe()),
            prefix: None,
        }
    }

    /// Subscribe to events whose name starts with `prefix`
    /// (e.g. `"session."` or the exact `"message.part.updated"`).
    pub fn subscribe(&self, prefix: impl Into<String>) -> EventStream {
        EventStream {
            inner: BroadcastStream::new(self.tx.subscribe()),
            prefix: Some(prefix.into()),
        }
    }

    /// Number of live subscribers; used by shutdown to decide how long to
    /// linger before dropping the bus.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream of events for one subscriber.  Lag in the underlying channel is
/// surfaced as a single [`Event::Dropped`] marker on this stream only.
pub struct EventStream {
    inner: BroadcastStream<Event>,
    prefix: Option<String>,
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if let Some(prefix) = &self.prefix {
                        if !event.name().starts_with(prefix.as_str()) {
                            continue;
                        }
                    }
                    return Poll::Ready(Some(event));
                }
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(count)))) => {
                    return Poll::Ready(Some(Event::Dropped { count }));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn idle(id: &str) -> Event {
        Event::SessionIdle {
            session_id: id.into(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_in_publish_order() {
        let bus = Bus::new();
        let mut stream = bus.subscribe_all();
        for i in 0..10 {
            bus.publish(idle(&format!("ses_{i}")));
        }
        for i in 0..10 {
            match stream.next().await.unwrap() {
                Event::SessionIdle { session_id } => {
                    assert_eq!(session_id, format!("ses_{i}"));
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = Bus::new();
        bus.publish(idle("ses_1"));
    }

    #[tokio::test]
    async fn prefix_filter_drops_other_kinds() {
        let bus = Bus::new();
        let mut stream = bus.subscribe("session.");
        bus.publish(Event::FileEdited { path: "a".into() });
        bus.publish(idle("ses_1"));
        match stream.next().await.unwrap() {
            Event::SessionIdle { session_id } => assert_eq!(session_id, "ses_1"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_subscriber_gets_dropped_marker_then_newer_events() {
        let bus = Bus::with_capacity(4);
        let mut stream = bus.subscribe_all();
        // Overflow the 4-slot buffer.
        for i in 0..10 {
            bus.publish(idle(&format!("ses_{i}")));
        }
        match stream.next().await.unwrap() {
            Event::Dropped { count } => assert!(count >= 1),
            other => panic!("expected Dropped, got {other:?}"),
        }
        // The stream resumes with the newest surviving events.
        match stream.next().await.unwrap() {
            Event::SessionIdle { session_id } => assert!(session_id.starts_with("ses_")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let bus = Bus::new();
        bus.publish(idle("before"));
        let mut stream = bus.subscribe_all();
        bus.publish(idle("after"));
        match stream.next().await.unwrap() {
            Event::SessionIdle { session_id } => assert_eq!(session_id, "after"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
