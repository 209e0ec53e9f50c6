//! # sona-bus
//!
//! In-process publish/subscribe used by every relay component.
//!
//! Topics are plain strings (`server.response.created`, `client.*`, …) and
//! payloads are [`serde_json::Value`]. Subscriptions come in two flavors:
//! durable ([`EventBus::on`]) and one-shot ([`EventBus::on_next`]), plus a
//! future-based [`EventBus::wait_for`] built on the one-shot path.
//!
//! ## Dispatch semantics
//!
//! [`EventBus::dispatch`] invokes a *snapshot* of the durable handlers
//! registered at call time, in registration order — handlers registered
//! during a dispatch never run on that same dispatch. One-shot handlers for
//! the topic are then taken and run exactly once.
//!
//! Handler failures are not isolated: the first error propagates to the
//! dispatch caller and aborts the remaining handlers of that call. Callers
//! needing isolation wrap their own handlers.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

/// Error type surfaced by event handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result of invoking a handler or dispatching an event.
pub type HandlerResult = Result<(), BoxError>;

type Handler = Arc<dyn Fn(&Value) -> HandlerResult + Send + Sync>;

/// Opaque token identifying a registered handler, for targeted removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    durable: HashMap<String, Vec<(HandlerId, Handler)>>,
    one_shot: HashMap<String, Vec<(HandlerId, Handler)>>,
}

impl Registry {
    fn allocate(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }
}

/// Topic-keyed publish/subscribe with snapshot-on-dispatch semantics.
#[derive(Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a durable handler for `topic`.
    pub fn on<F>(&self, topic: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) -> HandlerResult + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        let id = registry.allocate();
        registry
            .durable
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Register a handler that runs on the next dispatch of `topic` only.
    pub fn on_next<F>(&self, topic: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) -> HandlerResult + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        let id = registry.allocate();
        registry
            .one_shot
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a durable handler. Returns `false` if it was not registered.
    pub fn off(&self, topic: &str, id: HandlerId) -> bool {
        Self::remove(&mut self.registry.lock().durable, topic, id)
    }

    /// Remove a one-shot handler. Returns `false` if it was not registered
    /// (including when it already fired).
    pub fn off_next(&self, topic: &str, id: HandlerId) -> bool {
        Self::remove(&mut self.registry.lock().one_shot, topic, id)
    }

    /// Drop every registered handler, durable and one-shot.
    pub fn clear(&self) {
        let mut registry = self.registry.lock();
        registry.durable.clear();
        registry.one_shot.clear();
    }

    /// Number of durable handlers currently registered for `topic`.
    #[must_use]
    pub fn handler_count(&self, topic: &str) -> usize {
        self.registry
            .lock()
            .durable
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Dispatch `event` on `topic`.
    ///
    /// Runs the snapshot of durable handlers in registration order, then
    /// takes and runs the one-shot handlers. The first handler error aborts
    /// the rest and propagates to the caller.
    pub fn dispatch(&self, topic: &str, event: &Value) -> HandlerResult {
        let durable: Vec<Handler> = {
            let registry = self.registry.lock();
            registry
                .durable
                .get(topic)
                .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        for handler in durable {
            handler(event)?;
        }

        let one_shot: Vec<Handler> = {
            let mut registry = self.registry.lock();
            registry
                .one_shot
                .remove(topic)
                .map(|entries| entries.into_iter().map(|(_, h)| h).collect())
                .unwrap_or_default()
        };
        for handler in one_shot {
            handler(event)?;
        }
        Ok(())
    }

    /// Suspend until the next dispatch on `topic`, or until `timeout`.
    ///
    /// The temporary subscription is always deregistered on the way out.
    /// Yields `None` on timeout rather than failing.
    pub async fn wait_for(&self, topic: &str, timeout: Option<Duration>) -> Option<Value> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let id = self.on_next(topic, move |event| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(event.clone());
            }
            Ok(())
        });

        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, rx).await.ok().and_then(Result::ok),
            None => rx.await.ok(),
        };
        let _ = self.off_next(topic, id);
        received
    }

    fn remove(
        map: &mut HashMap<String, Vec<(HandlerId, Handler)>>,
        topic: &str,
        id: HandlerId,
    ) -> bool {
        let Some(entries) = map.get_mut(topic) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }
}
