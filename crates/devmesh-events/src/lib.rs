//! In-process typed publish/subscribe.
//!
//! Two scopes exist:
//!
//! 1. A **process-wide** bus per component (pre-warm transitions, batch
//!    progress, quality events), created once at service construction
//!    and shared through the state container.
//! 2. A **per-request** bus tagged with the correlation id, created at
//!    request entry and dropped at request completion.
//!
//! Delivery is best-effort fan-out over `tokio::sync::broadcast`:
//! publishing never blocks, and subscribers that fall behind the
//! channel capacity observe a `Lagged` gap instead of stalling the
//! publisher.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default channel capacity for component buses.
pub const DEFAULT_CAPACITY: usize = 256;

/// A typed broadcast bus.
///
/// Cloning is cheap and shares the underlying channel.
#[derive(Debug, Clone)]
pub struct EventBus<T: Clone> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    /// Create a bus with the given buffered capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of subscribers the event was delivered to.
    /// Publishing to an empty bus is not an error.
    pub fn publish(&self, event: T) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Events observed during a single gateway request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestEvent {
    /// A subgraph call was dispatched.
    SubgraphCallStarted {
        /// Subgraph name.
        subgraph: String,
        /// Number of top-level fields in the call.
        field_count: usize,
    },
    /// A subgraph call finished.
    SubgraphCallFinished {
        /// Subgraph name.
        subgraph: String,
        /// Call duration.
        duration_ms: u64,
        /// Whether the subgraph returned errors.
        had_errors: bool,
    },
    /// The response cache answered the request.
    CacheHit {
        /// Fingerprint that matched.
        fingerprint: String,
    },
    /// Cache entries were invalidated by a mutation.
    CacheInvalidated {
        /// Subgraphs the mutation touched.
        subgraphs: Vec<String>,
        /// Number of entries removed.
        removed: usize,
    },
    /// A batch of entity references was resolved.
    EntityBatchResolved {
        /// Owning subgraph.
        subgraph: String,
        /// Representations sent (after dedup).
        representations: usize,
    },
}

/// Per-request bus, tagged with the request's correlation id.
///
/// Created at request entry; subscribers (request logging, tests)
/// observe the request's lifecycle. Dropping the scope drops the
/// channel, which ends all subscriptions.
#[derive(Debug, Clone)]
pub struct RequestScope {
    correlation_id: String,
    started_at:     DateTime<Utc>,
    bus:            EventBus<RequestEvent>,
}

impl RequestScope {
    /// Create a scope for the given correlation id.
    #[must_use]
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            started_at:     Utc::now(),
            bus:            EventBus::new(64),
        }
    }

    /// Create a scope with a freshly minted correlation id.
    #[must_use]
    pub fn minted() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    /// The correlation id this scope is tagged with.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// When the request entered the gateway.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Publish a request event.
    pub fn publish(&self, event: RequestEvent) {
        self.bus.publish(event);
    }

    /// Subscribe to this request's events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RequestEvent> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus: EventBus<RequestEvent> = EventBus::new(8);
        let mut rx = bus.subscribe();

        let delivered = bus.publish(RequestEvent::CacheHit {
            fingerprint: "abc".to_string(),
        });
        assert_eq!(delivered, 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            RequestEvent::CacheHit {
                fingerprint: "abc".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus: EventBus<u32> = EventBus::new(8);
        assert_eq!(bus.publish(7), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let bus: EventBus<u64> = EventBus::new(2);
        let mut rx = bus.subscribe();

        for i in 0..10 {
            bus.publish(i);
        }

        // The receiver lost the oldest events; the publisher never blocked.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => assert!(missed > 0),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_scope_tags_correlation_id() {
        let scope = RequestScope::new("corr-1");
        assert_eq!(scope.correlation_id(), "corr-1");

        let mut rx = scope.subscribe();
        scope.publish(RequestEvent::SubgraphCallStarted {
            subgraph:    "git".to_string(),
            field_count: 2,
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, RequestEvent::SubgraphCallStarted { .. }));
    }

    #[test]
    fn test_minted_scope_has_unique_ids() {
        let a = RequestScope::minted();
        let b = RequestScope::minted();
        assert_ne!(a.correlation_id(), b.correlation_id());
    }
}
