// ABOUTME: Subscriber registry mapping each event kind to its ordered list of async handlers.
// ABOUTME: Dispatch runs every handler in its own task; failures and panics are logged, never propagated.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use knowlog_core::{Event, EventType};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::error;

/// Error type handlers report back to the dispatcher.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Something that reacts to appended (or replayed) events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

/// Identifies one registration so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        (self.0)(event.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// What happened when an event was handed to its subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub invoked: usize,
    pub failed: usize,
}

type Registration = (HandlerId, Arc<dyn EventHandler>);

/// Per-kind handler lists.
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<EventType, Vec<Registration>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind. Handlers of a kind keep
    /// registration order.
    pub async fn register(&self, event_type: EventType, handler: Arc<dyn EventHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .await
            .entry(event_type)
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove a registration. Returns false if it was not registered for that kind.
    pub async fn unregister(&self, event_type: EventType, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().await;
        let Some(list) = handlers.get_mut(&event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|(registered, _)| *registered != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&event_type);
        }
        removed
    }

    /// Number of handlers registered for a kind.
    pub async fn count(&self, event_type: EventType) -> usize {
        self.handlers
            .read()
            .await
            .get(&event_type)
            .map_or(0, Vec::len)
    }

    /// Run every handler registered for the event's kind concurrently and
    /// wait for all of them. Each handler is isolated: an error or panic in
    /// one is logged and counted, and never reaches the others or the caller.
    pub async fn dispatch(&self, event: &Event) -> DispatchReport {
        let handlers: Vec<Registration> = self
            .handlers
            .read()
            .await
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();

        let mut report = DispatchReport::default();
        if handlers.is_empty() {
            return report;
        }

        let shared = Arc::new(event.clone());
        let mut tasks = JoinSet::new();
        for (id, handler) in handlers {
            let event = Arc::clone(&shared);
            tasks.spawn(async move { (id, handler.handle(&event).await) });
            report.invoked += 1;
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(e))) => {
                    report.failed += 1;
                    error!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        handler = ?id,
                        "event handler failed: {}",
                        e
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    error!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        "event handler panicked: {}",
                        e
                    );
                }
            }
        }
        report
    }
}
