//! Event bridge between the bus delivery context and the async agent
//!
//! Bus notifications arrive through [`EventPusher::push`], which never blocks.
//! A single dispatch task drains the queue in arrival order and awaits the
//! registered handler of each event before taking the next one, so handlers
//! never run concurrently. A failing or panicking handler is logged and the
//! loop carries on.

use super::event::{BusEvent, BusValue};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Future returned by a bus handler
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Async handler receiving the signal arguments (or the single new value of a
/// property)
pub type Handler = Arc<dyn Fn(Vec<BusValue>) -> HandlerFuture + Send + Sync>;

/// Kind of notification a handler is registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Signal,
    Property,
}

/// Registry key: kind plus interface and member (signal or property name)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub kind: SubscriptionKind,
    pub interface: String,
    pub member: String,
}

impl SubscriptionKey {
    pub fn signal(interface: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            kind: SubscriptionKind::Signal,
            interface: interface.into(),
            member: member.into(),
        }
    }

    pub fn property(interface: impl Into<String>, property: impl Into<String>) -> Self {
        Self {
            kind: SubscriptionKind::Property,
            interface: interface.into(),
            member: property.into(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            SubscriptionKind::Signal => "signal",
            SubscriptionKind::Property => "property",
        };
        write!(f, "{} {}.{}", kind, self.interface, self.member)
    }
}

type Registry = Arc<RwLock<HashMap<SubscriptionKey, Handler>>>;

/// Cloneable, non-blocking entry point for the bus delivery context
#[derive(Clone)]
pub struct EventPusher {
    event_tx: mpsc::UnboundedSender<BusEvent>,
}

impl EventPusher {
    /// Enqueue an event. Returns false once the bridge has been torn down.
    pub fn push(&self, event: BusEvent) -> bool {
        match self.event_tx.send(event) {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                debug!("Dropping bus event {}: bridge is closed", event);
                false
            }
        }
    }
}

/// Ordered single-consumer dispatcher of bus notifications
pub struct EventBridge {
    registry: Registry,
    pusher: EventPusher,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    /// Tasks feeding the bridge, stopped on teardown
    sources: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl EventBridge {
    /// Create a new bridge and start its dispatch loop
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel::<BusEvent>();
        let registry: Registry = Arc::new(RwLock::new(HashMap::new()));

        let registry_clone = registry.clone();
        let dispatch_task = tokio::spawn(async move {
            dispatch_loop(registry_clone, event_rx).await;
        });

        Self {
            registry,
            pusher: EventPusher { event_tx },
            dispatch_task: Mutex::new(Some(dispatch_task)),
            sources: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Get a pusher for the bus delivery context
    pub fn pusher(&self) -> EventPusher {
        self.pusher.clone()
    }

    /// Enqueue an event without blocking
    pub fn push(&self, event: BusEvent) -> bool {
        self.pusher.push(event)
    }

    /// Register a signal handler, replacing any previous one for the same
    /// (interface, member)
    pub fn subscribe<F, Fut>(&self, interface: &str, member: &str, handler: F)
    where
        F: Fn(Vec<BusValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(SubscriptionKey::signal(interface, member), handler);
    }

    /// Register a handler for changes of `property` on `interface`
    pub fn subscribe_property<F, Fut>(&self, interface: &str, property: &str, handler: F)
    where
        F: Fn(Vec<BusValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(SubscriptionKey::property(interface, property), handler);
    }

    fn register<F, Fut>(&self, key: SubscriptionKey, handler: F)
    where
        F: Fn(Vec<BusValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            warn!("Ignoring subscription to {}: bridge is closed", key);
            return;
        }

        let handler: Handler = Arc::new(move |args| handler(args).boxed());
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        if registry.insert(key.clone(), handler).is_some() {
            debug!("Replaced handler for {}", key);
        } else {
            debug!("Subscribed to {}", key);
        }
    }

    /// Number of registered handlers
    pub fn subscription_count(&self) -> usize {
        self.registry.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Tie a task feeding this bridge to its lifetime
    pub fn attach_source(&self, task: JoinHandle<()>) {
        if self.closed.load(Ordering::SeqCst) {
            task.abort();
            return;
        }
        self.sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drop all subscriptions, stop event sources and the dispatch loop.
    /// Calling it again is a no-op.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        for task in self
            .sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }

        if let Some(task) = self
            .dispatch_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }

        debug!("Event bridge shut down");
    }
}

impl Default for EventBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lookup(registry: &Registry, key: &SubscriptionKey) -> Option<Handler> {
    registry
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(key)
        .cloned()
}

/// Drain events one at a time, in arrival order
async fn dispatch_loop(registry: Registry, mut event_rx: mpsc::UnboundedReceiver<BusEvent>) {
    while let Some(event) = event_rx.recv().await {
        if event.is_properties_changed() {
            dispatch_properties(&registry, event).await;
            continue;
        }

        let key = SubscriptionKey::signal(&event.interface, &event.member);
        match lookup(&registry, &key) {
            Some(handler) => run_handler(&key, handler, event.args).await,
            None => debug!("No handler for {}", event),
        }
    }

    debug!("Bus event queue closed");
}

/// Call the property handlers for each changed property that has one
async fn dispatch_properties(registry: &Registry, event: BusEvent) {
    let mut args = event.args.into_iter();
    let (Some(BusValue::Str(interface)), Some(BusValue::Dict(changed))) = (args.next(), args.next())
    else {
        warn!("Malformed {} notification", event.member);
        return;
    };

    for (property, value) in changed {
        let key = SubscriptionKey::property(interface.as_str(), property);
        if let Some(handler) = lookup(registry, &key) {
            run_handler(&key, handler, vec![value]).await;
        }
    }
}

/// Await one handler, containing its errors and panics
async fn run_handler(key: &SubscriptionKey, handler: Handler, args: Vec<BusValue>) {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(args))) {
        Ok(future) => future,
        Err(_) => {
            error!("Handler for {} panicked", key);
            return;
        }
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Handler for {} failed: {:#}", key, e),
        Err(_) => error!("Handler for {} panicked", key),
    }
}
