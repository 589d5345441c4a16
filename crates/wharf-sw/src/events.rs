//! Lifecycle and fetch events dispatched inside a worker scope.
//!
//! Dispatch is a per-object publish/subscribe registry: event name to an
//! ordered listener list, invoked synchronously in the scope's turn.
//! Listeners extend an event's lifetime by registering futures through
//! `wait_until`; the lifecycle driver awaits every registered future before
//! advancing, and logs rejections instead of rethrowing them.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{join_all, BoxFuture};
use hashbrown::HashMap;
use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tracing::warn;

use wharf_fetch::{Request, Response};

use crate::ServiceWorkerError;

/// A pending extension registered through `wait_until`.
pub type ExtensionFuture = BoxFuture<'static, Result<(), String>>;

// ==================== ExtendableEvent ====================

/// An event whose settlement can be deferred by registered futures.
pub struct ExtendableEvent {
    event_type: String,
    pending: Mutex<Vec<ExtensionFuture>>,
}

impl ExtendableEvent {
    pub fn new(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// The event name this was dispatched as.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Register a future the dispatching phase must wait for. Multiple
    /// calls accumulate.
    pub fn wait_until<F>(&self, extension: F)
    where
        F: Future<Output = Result<(), String>> + Send + 'static,
    {
        crate::lock(&self.pending).push(Box::pin(extension));
    }

    /// Drain the currently registered extensions.
    pub(crate) fn take_pending(&self) -> Vec<ExtensionFuture> {
        std::mem::take(&mut *crate::lock(&self.pending))
    }
}

/// Await every extension registered on the event, including extensions
/// registered while earlier ones were settling. Rejections count as
/// settled; they are logged, never rethrown.
pub(crate) async fn settle_extensions(event: &ExtendableEvent) {
    loop {
        let pending = event.take_pending();
        if pending.is_empty() {
            break;
        }
        for result in join_all(pending).await {
            if let Err(error) = result {
                warn!(
                    event = event.event_type(),
                    %error,
                    "extension promise rejected"
                );
            }
        }
    }
}

// ==================== FetchEvent ====================

/// The outcome of dispatching a fetch event.
#[derive(Debug, Clone)]
pub enum FetchDecision {
    /// The worker supplied a response.
    Respond(Response),
    /// The worker forced a network failure.
    NetworkError,
    /// No listener responded; the request proceeds to the network.
    Unhandled,
}

/// An intercepted request dispatched to the worker scope.
pub struct FetchEvent {
    /// The intercepted request.
    pub request: Request,

    /// Id of the client the request originated from.
    pub client_id: String,

    inner: ExtendableEvent,
    responded: AtomicBool,
    decision: Arc<Mutex<Option<FetchDecision>>>,
    handled_tx: Arc<watch::Sender<bool>>,
    handled_rx: watch::Receiver<bool>,
}

impl FetchEvent {
    pub fn new(request: Request, client_id: String) -> Self {
        let (handled_tx, handled_rx) = watch::channel(false);
        Self {
            request,
            client_id,
            inner: ExtendableEvent::new("fetch"),
            responded: AtomicBool::new(false),
            decision: Arc::new(Mutex::new(None)),
            handled_tx: Arc::new(handled_tx),
            handled_rx,
        }
    }

    /// Register a future the fetch dispatch must wait for.
    pub fn wait_until<F>(&self, extension: F)
    where
        F: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.inner.wait_until(extension);
    }

    /// Settle this event with a response. Callable at most once; a second
    /// call fails with a state error and leaves the first outcome intact.
    ///
    /// A future resolving a network-error response, or rejecting, forces a
    /// network failure for the requester instead of fulfilling it.
    pub fn respond_with<F>(&self, response: F) -> Result<(), ServiceWorkerError>
    where
        F: Future<Output = Result<Response, String>> + Send + 'static,
    {
        if self.responded.swap(true, Ordering::SeqCst) {
            return Err(ServiceWorkerError::StateError(
                "respondWith was already called".to_string(),
            ));
        }

        let decision = self.decision.clone();
        let handled = self.handled_tx.clone();
        self.inner.wait_until(async move {
            let (outcome, verdict) = match response.await {
                Ok(response) if !response.is_error() => {
                    (FetchDecision::Respond(response), Ok(()))
                }
                Ok(_) => (FetchDecision::NetworkError, Ok(())),
                Err(error) => (FetchDecision::NetworkError, Err(error)),
            };
            *crate::lock(&decision) = Some(outcome);
            let _ = handled.send(true);
            verdict
        });

        Ok(())
    }

    /// Resolves once a response decision (success or forced failure) has
    /// been made, or once dispatch finished without a response.
    pub async fn handled(&self) {
        let mut rx = self.handled_rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub(crate) fn extendable(&self) -> &ExtendableEvent {
        &self.inner
    }

    pub(crate) fn take_decision(&self) -> FetchDecision {
        crate::lock(&self.decision)
            .take()
            .unwrap_or(FetchDecision::Unhandled)
    }

    pub(crate) fn settle_handled(&self) {
        let _ = self.handled_tx.send(true);
    }
}

// ==================== MessageEvent ====================

/// A user message delivered to the worker scope.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    /// The posted payload.
    pub data: JsonValue,
}

impl MessageEvent {
    pub fn new(data: JsonValue) -> Self {
        Self { data }
    }
}

// ==================== Dispatch registry ====================

/// An event routed through a scope's listener registry.
#[derive(Clone)]
pub enum ScopeEvent {
    Install(Arc<ExtendableEvent>),
    Activate(Arc<ExtendableEvent>),
    Fetch(Arc<FetchEvent>),
    Message(Arc<MessageEvent>),
}

impl ScopeEvent {
    /// The registry key this event dispatches under.
    pub fn name(&self) -> &'static str {
        match self {
            ScopeEvent::Install(_) => "install",
            ScopeEvent::Activate(_) => "activate",
            ScopeEvent::Fetch(_) => "fetch",
            ScopeEvent::Message(_) => "message",
        }
    }
}

type Listener = Arc<dyn Fn(&ScopeEvent) + Send + Sync>;

/// Event name to ordered listener list.
#[derive(Default)]
pub struct EventTarget {
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
}

impl EventTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener for the named event.
    pub fn add_event_listener<F>(&self, event: &str, listener: F)
    where
        F: Fn(&ScopeEvent) + Send + Sync + 'static,
    {
        crate::lock(&self.listeners)
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(listener));
    }

    /// Invoke every listener registered for the event, in registration
    /// order, synchronously.
    pub fn dispatch(&self, event: &ScopeEvent) {
        let snapshot: Vec<Listener> = crate::lock(&self.listeners)
            .get(event.name())
            .cloned()
            .unwrap_or_default();
        for listener in snapshot {
            listener(event);
        }
    }

    /// How many listeners the named event has.
    pub fn listener_count(&self, event: &str) -> usize {
        crate::lock(&self.listeners)
            .get(event)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}
