//! Bus subscribers that hand events to the dispatcher.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::bus::{EventBus, EventHandler, HandlerError};
use crate::dispatcher::{plan, DispatchJob, EventDispatcher};
use crate::event::{Event, EventKind};

/// Queues a dispatcher job for every event it receives.
pub struct DispatchHandler {
    name: &'static str,
    dispatcher: Arc<EventDispatcher>,
}

impl DispatchHandler {
    #[must_use]
    pub fn new(name: &'static str, dispatcher: Arc<EventDispatcher>) -> Self {
        Self { name, dispatcher }
    }
}

#[async_trait]
impl EventHandler for DispatchHandler {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn handle(&self, event: &Event) -> Result<Option<Value>, HandlerError> {
        if let Some(job) = DispatchJob::for_event(event.clone()) {
            self.dispatcher.enqueue(job).await?;
        }
        Ok(None)
    }
}

/// Subscribe the presence and delivery handlers to every kind the
/// dispatcher acts on.
pub fn install(bus: &EventBus, dispatcher: &Arc<EventDispatcher>) {
    let presence: Arc<dyn EventHandler> =
        Arc::new(DispatchHandler::new("presence", Arc::clone(dispatcher)));
    let delivery: Arc<dyn EventHandler> =
        Arc::new(DispatchHandler::new("delivery", Arc::clone(dispatcher)));

    for kind in EventKind::ALL {
        match plan(kind) {
            Some(action) if action.is_presence() => bus.subscribe(kind, Arc::clone(&presence)),
            Some(_) => bus.subscribe(kind, Arc::clone(&delivery)),
            None => {}
        }
    }
}
