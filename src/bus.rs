//! Publish/subscribe event bus.
//!
//! Every service in the closet talks to the others only through this bus.
//! Handlers are registered per [`EventKind`] during start-up and live for the
//! life of the process. [`EventBus::publish`] fans an event out to every
//! handler of its kind, runs them concurrently, and returns once all of them
//! have finished. Failures are collected and reported together so that one
//! failing handler never prevents its siblings from running.
//!
//! ```text
//!  producer ──publish()──▶ EventBus ──spawn──▶ handler A ─┐
//!                                   ──spawn──▶ handler B ─┼─▶ join ──▶ Ok / Dispatch error
//!                                   ──spawn──▶ handler C ─┘
//! ```

use crate::events::{Event, EventKind};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Error type returned by event handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// The single handler contract. Every subscriber is invoked the same way.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Arc<Event>) -> Result<(), HandlerError>;

    /// Name used in diagnostics and failure reports.
    fn name(&self) -> &str {
        "anonymous"
    }
}

struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, event: Arc<Event>) -> Result<(), HandlerError> {
        (self.f)(event).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub handler: String,
    pub reason: String,
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.handler, self.reason)
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("{failed} of {total} handler(s) failed for {kind}")]
    Dispatch {
        kind: EventKind,
        total: usize,
        failed: usize,
        failures: Vec<HandlerFailure>,
    },

    #[error("event bridge is closed")]
    BridgeClosed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub events_published: u64,
    pub events_without_subscribers: u64,
    pub handler_invocations: u64,
    pub handler_failures: u64,
}

#[derive(Default)]
struct BusCounters {
    events_published: AtomicU64,
    events_without_subscribers: AtomicU64,
    handler_invocations: AtomicU64,
    handler_failures: AtomicU64,
}

struct Subscription {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<Subscription>>>,
    next_subscription_id: AtomicU64,
    counters: BusCounters,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(1),
            counters: BusCounters::default(),
        }
    }

    /// Register `handler` for `kind`. Handlers are kept in registration order.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::SeqCst));
        trace!(kind = %kind, handler = handler.name(), "subscribing");

        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Subscription { id, handler });
        id
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Handler names for `kind`, in invocation-registration order.
    pub fn handler_names(&self, kind: EventKind) -> Vec<String> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map(|subs| subs.iter().map(|s| s.handler.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Deliver `event` to every handler registered for its kind.
    ///
    /// Handlers run concurrently on the tokio runtime; this call resolves
    /// after all of them have completed. A handler that returns an error or
    /// panics is reported in [`BusError::Dispatch`] once the rest are done.
    /// Handlers may publish further events from inside their own execution.
    pub async fn publish(&self, event: Event) -> Result<(), BusError> {
        let kind = event.kind();
        self.counters.events_published.fetch_add(1, Ordering::Relaxed);

        // Snapshot the handlers so no lock is held across an await; this is
        // what makes re-entrant publish safe.
        let handlers: Vec<(SubscriptionId, Arc<dyn EventHandler>)> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map(|subs| subs.iter().map(|s| (s.id, Arc::clone(&s.handler))).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            self.counters
                .events_without_subscribers
                .fetch_add(1, Ordering::Relaxed);
            debug!(kind = %kind, source = event.source(), "no subscribers, event is a no-op");
            return Ok(());
        }

        let total = handlers.len();
        debug!(kind = %kind, source = event.source(), handlers = total, "publishing event");
        self.counters
            .handler_invocations
            .fetch_add(total as u64, Ordering::Relaxed);

        let event = Arc::new(event);
        let mut names = Vec::with_capacity(total);
        let mut tasks = Vec::with_capacity(total);
        for (id, handler) in handlers {
            names.push(format!("{}#{}", handler.name(), id.0));
            let event = Arc::clone(&event);
            tasks.push(tokio::spawn(async move { handler.handle(event).await }));
        }

        let mut failures = Vec::new();
        for (name, result) in names.into_iter().zip(join_all(tasks).await) {
            let reason = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(join_error) if join_error.is_panic() => "handler panicked".to_string(),
                Err(join_error) => join_error.to_string(),
            };
            warn!(kind = %kind, handler = %name, %reason, "event handler failed");
            failures.push(HandlerFailure {
                handler: name,
                reason,
            });
        }

        if failures.is_empty() {
            return Ok(());
        }

        self.counters
            .handler_failures
            .fetch_add(failures.len() as u64, Ordering::Relaxed);
        Err(BusError::Dispatch {
            kind,
            total,
            failed: failures.len(),
            failures,
        })
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            events_published: self.counters.events_published.load(Ordering::Relaxed),
            events_without_subscribers: self
                .counters
                .events_without_subscribers
                .load(Ordering::Relaxed),
            handler_invocations: self.counters.handler_invocations.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// The bus is constructed once and handed to every component.
pub type SharedEventBus = Arc<EventBus>;
