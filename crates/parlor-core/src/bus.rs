//! Event bus.
//!
//! Handlers subscribe per [`EventKind`]. Publishing a kind with no
//! subscriber is an error; a failing handler is logged and does not stop
//! the others.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::dedup::{DedupConfig, DedupWindow};
use crate::event::{Event, EventKind};
use crate::telemetry;

/// Error returned by an [`EventHandler`].
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler could not hand the event on.
    #[error("Dispatch rejected: {0}")]
    Dispatch(#[from] crate::dispatcher::DispatchError),

    /// Anything else.
    #[error("{0}")]
    Failed(String),
}

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// Nothing is subscribed to the published kind.
    #[error("No handler registered for {kind}; registered kinds: {registered:?}")]
    NoHandler {
        kind: EventKind,
        registered: Vec<EventKind>,
    },
}

/// Reacts to published events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Handle one event. A returned value is offered to the publisher.
    async fn handle(&self, event: &Event) -> Result<Option<Value>, HandlerError>;
}

/// Routes events to their subscribers.
pub struct EventBus {
    handlers: DashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
    dedup: DedupWindow,
}

fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a).cast::<()>(),
        Arc::as_ptr(b).cast::<()>(),
    )
}

impl EventBus {
    /// Create a bus with the default dedup window.
    #[must_use]
    pub fn new() -> Self {
        Self::with_dedup(DedupConfig::default())
    }

    /// Create a bus with a custom dedup window.
    #[must_use]
    pub fn with_dedup(config: DedupConfig) -> Self {
        Self {
            handlers: DashMap::new(),
            dedup: DedupWindow::new(config),
        }
    }

    /// Subscribe `handler` to `kind`.
    ///
    /// Subscribing the same handler twice has no effect.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        let mut entry = self.handlers.entry(kind).or_default();
        if entry.iter().any(|h| same_handler(h, &handler)) {
            return;
        }
        debug!(kind = %kind, handler = handler.name(), "Subscribed");
        entry.push(handler);
    }

    /// Remove `handler` from `kind`.
    ///
    /// Returns `true` if it was subscribed.
    pub fn unsubscribe(&self, kind: EventKind, handler: &Arc<dyn EventHandler>) -> bool {
        let Some(mut entry) = self.handlers.get_mut(&kind) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|h| !same_handler(h, handler));
        let removed = entry.len() != before;
        let now_empty = entry.is_empty();
        drop(entry);

        if now_empty {
            self.handlers.remove_if(&kind, |_, handlers| handlers.is_empty());
        }
        removed
    }

    /// Kinds with at least one subscriber, sorted.
    #[must_use]
    pub fn registered_kinds(&self) -> Vec<EventKind> {
        let mut kinds: Vec<_> = self
            .handlers
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| *e.key())
            .collect();
        kinds.sort_unstable();
        kinds
    }

    /// Number of handlers subscribed to `kind`.
    #[must_use]
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, |h| h.len())
    }

    /// Hand `event` to every subscriber of its kind, in subscription order.
    ///
    /// Message events that exhausted their attempt cap, or that were already
    /// published within the dedup window, are dropped and yield `Ok(None)`.
    /// Otherwise the first non-empty handler result is returned.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoHandler`] if nothing is subscribed to the kind.
    pub async fn publish(&self, event: Event) -> Result<Option<Value>, BusError> {
        let kind = event.kind();
        let handlers = self
            .handlers
            .get(&kind)
            .map(|h| h.value().clone())
            .unwrap_or_default();

        if handlers.is_empty() {
            return Err(BusError::NoHandler {
                kind,
                registered: self.registered_kinds(),
            });
        }

        if let Event::Message(message) = &event {
            if message.is_exhausted() {
                warn!(
                    kind = %kind,
                    message = message.message_id(),
                    attempts = message.attempts(),
                    "Dropping message event after repeated failures"
                );
                telemetry::record_event_poisoned(kind.as_str());
                return Ok(None);
            }
            if !self.dedup.first_sighting(&message.dedup_key()) {
                debug!(kind = %kind, message = message.message_id(), "Duplicate event ignored");
                telemetry::record_event_deduplicated(kind.as_str());
                return Ok(None);
            }
        }

        telemetry::record_event_published(kind.as_str());
        trace!(kind = %kind, handlers = handlers.len(), "Publishing");

        let mut reply = None;
        for handler in handlers {
            match handler.handle(&event).await {
                Ok(Some(value)) if reply.is_none() => reply = Some(value),
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        kind = %kind,
                        handler = handler.name(),
                        error = %e,
                        "Event handler failed"
                    );
                    telemetry::record_handler_error(kind.as_str(), handler.name());
                }
            }
        }
        Ok(reply)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
