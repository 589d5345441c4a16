//! # Wharf Service Workers
//!
//! Service worker lifecycle and messaging runtime for Wharf.
//!
//! ## Features
//!
//! - **Registration**: spawn a script as an isolated worker unit
//! - **Lifecycle**: parsed, install, activate driven worker-side and
//!   mirrored to the controller
//! - **Messaging**: user payloads both directions over the control channel
//! - **Fetch interception**: correlated request/response relay
//! - **Clients API**: scope-based claiming of execution contexts
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (controller)
//!     │
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing / waiting / active (ServiceWorker)
//!     │       └── scope
//!     │
//!     ├── control channel ───────► ServiceWorkerGlobalScope (unit)
//!     │      statechange, error,        ├── serviceWorker (mirror)
//!     │      message                    ├── clients
//!     │                                 └── caches
//!     └── interception channel ──► fetch events
//!            request / response
//! ```
//!
//! The handle exists once per side: the controller and the unit each own an
//! independent `ServiceWorker` state machine, kept in sync only by
//! notification messages. No memory crosses the unit boundary.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, trace, warn};
use url::Url;

use wharf_fetch::{Fetch, Request, Response};

pub mod clients;
pub mod events;
pub mod scope;
pub mod transport;

pub use clients::{Client, ClientMatchOptions, ClientType, Clients, FrameType};
pub use events::{
    EventTarget, ExtendableEvent, FetchDecision, FetchEvent, MessageEvent, ScopeEvent,
};
pub use scope::{ScopeGlobals, ScriptHost, ServiceWorkerGlobalScope};
pub use transport::{ControlMessage, InterceptMessage, Port, RequestPayload, ResponsePayload};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Script error: {0}")]
    ScriptError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Transport closed")]
    TransportClosed,
}

// ==================== Lock helpers ====================

// Poison is absorbed rather than propagated; a panicking listener must not
// take the whole runtime down with it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

// ==================== Worker state ====================

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Initial state, script parsed but lifecycle not started.
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed, waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active.
    Activated,
    /// Discarded by the controller.
    Redundant,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::Parsed
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Parsed => "parsed",
            WorkerState::Installing => "installing",
            WorkerState::Installed => "installed",
            WorkerState::Activating => "activating",
            WorkerState::Activated => "activated",
            WorkerState::Redundant => "redundant",
        };
        write!(f, "{}", name)
    }
}

// ==================== Service worker handle ====================

/// A notification emitted by a [`ServiceWorker`] handle.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// The state machine advanced.
    StateChange(WorkerState),
    /// The worker unit reported an uncaught failure.
    Error,
    /// The far side posted a user payload.
    Message(JsonValue),
}

#[derive(Debug, Default)]
struct WorkerInner {
    state: WorkerState,
    listeners: Vec<mpsc::UnboundedSender<WorkerEvent>>,
}

/// A handle to one service worker: script identity, state machine, and a
/// message endpoint.
///
/// The controller and the worker unit each own their own handle; the two
/// are synchronized only by notifications over the control channel.
#[derive(Debug)]
pub struct ServiceWorker {
    script_url: Url,
    scope_url: Url,
    endpoint: mpsc::UnboundedSender<ControlMessage>,
    inner: Mutex<WorkerInner>,
}

impl ServiceWorker {
    /// Create a handle in the initial state.
    pub fn new(
        script_url: Url,
        scope_url: Url,
        endpoint: mpsc::UnboundedSender<ControlMessage>,
    ) -> Self {
        Self {
            script_url,
            scope_url,
            endpoint,
            inner: Mutex::new(WorkerInner::default()),
        }
    }

    /// Script URL.
    pub fn script_url(&self) -> &Url {
        &self.script_url
    }

    /// Scope URL the worker may claim clients under.
    pub fn scope_url(&self) -> &Url {
        &self.scope_url
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        lock(&self.inner).state
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state() == WorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state() == WorkerState::Redundant
    }

    /// Assign a state. The seed write of the initial state is silent;
    /// every other assignment notifies subscribers in transition order.
    pub fn set_state(&self, state: WorkerState) {
        let mut inner = lock(&self.inner);
        inner.state = state;
        if state != WorkerState::Parsed {
            debug!(url = %self.script_url, %state, "service worker state changed");
            inner
                .listeners
                .retain(|listener| listener.send(WorkerEvent::StateChange(state)).is_ok());
        }
    }

    /// Subscribe to notifications. Each subscriber gets its own ordered,
    /// uncoalesced stream.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<WorkerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner).listeners.push(tx);
        rx
    }

    pub(crate) fn emit_error(&self) {
        lock(&self.inner)
            .listeners
            .retain(|listener| listener.send(WorkerEvent::Error).is_ok());
    }

    pub(crate) fn emit_message(&self, data: JsonValue) {
        lock(&self.inner)
            .listeners
            .retain(|listener| listener.send(WorkerEvent::Message(data.clone())).is_ok());
    }

    /// Post a user payload to the far side.
    pub fn post_message(&self, data: JsonValue) -> Result<(), ServiceWorkerError> {
        if self.is_redundant() {
            return Err(ServiceWorkerError::StateError(
                "cannot post message to a redundant worker".to_string(),
            ));
        }
        self.endpoint
            .send(ControlMessage::Message { data })
            .map_err(|_| ServiceWorkerError::TransportClosed)
    }
}

// ==================== Registration ====================

/// Options for service worker registration.
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Scope URL. Defaults to the script URL's directory.
    pub scope: Option<Url>,
}

/// A read-only projection of one worker handle into the installing,
/// waiting, and active slots.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    worker: Arc<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    pub fn new(worker: Arc<ServiceWorker>) -> Self {
        Self { worker }
    }

    /// The underlying handle, whatever its state.
    pub fn worker(&self) -> Arc<ServiceWorker> {
        self.worker.clone()
    }

    /// Scope URL.
    pub fn scope_url(&self) -> &Url {
        self.worker.scope_url()
    }

    /// The handle while it is installing.
    pub fn installing(&self) -> Option<Arc<ServiceWorker>> {
        (self.worker.state() == WorkerState::Installing).then(|| self.worker.clone())
    }

    /// The handle while it is installed but not yet activating.
    pub fn waiting(&self) -> Option<Arc<ServiceWorker>> {
        (self.worker.state() == WorkerState::Installed).then(|| self.worker.clone())
    }

    /// The handle while it is activating or activated.
    pub fn active(&self) -> Option<Arc<ServiceWorker>> {
        matches!(
            self.worker.state(),
            WorkerState::Activating | WorkerState::Activated
        )
        .then(|| self.worker.clone())
    }
}

// ==================== Container ====================

/// Controller-side orchestrator: spawns worker units, tracks the active
/// registration, exposes the one-shot readiness signal, and relays
/// intercepted requests.
pub struct ServiceWorkerContainer {
    script_host: Arc<dyn ScriptHost>,
    fetch: Arc<dyn Fetch>,
    client_url: Url,
    registration: RwLock<Option<Arc<ServiceWorkerRegistration>>>,
    intercept_tx: RwLock<Option<mpsc::UnboundedSender<InterceptMessage>>>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Option<ResponsePayload>>>>>,
    next_request_id: AtomicU64,
    ready_tx: watch::Sender<Option<Arc<ServiceWorkerRegistration>>>,
    ready_rx: watch::Receiver<Option<Arc<ServiceWorkerRegistration>>>,
}

impl ServiceWorkerContainer {
    /// Create a container for the context at `client_url`, backed by the
    /// given script host and network capabilities.
    pub fn new(script_host: Arc<dyn ScriptHost>, fetch: Arc<dyn Fetch>, client_url: Url) -> Self {
        let (ready_tx, ready_rx) = watch::channel(None);
        Self {
            script_host,
            fetch,
            client_url,
            registration: RwLock::new(None),
            intercept_tx: RwLock::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_request_id: AtomicU64::new(1),
            ready_tx,
            ready_rx,
        }
    }

    /// Register a script as a service worker and spawn its unit.
    pub async fn register(
        &self,
        script_url: Url,
        options: RegistrationOptions,
    ) -> Result<Arc<ServiceWorkerRegistration>, ServiceWorkerError> {
        if !matches!(script_url.scheme(), "http" | "https") {
            return Err(ServiceWorkerError::RegistrationFailed(format!(
                "unsupported script URL scheme {:?}",
                script_url.scheme()
            )));
        }

        let scope = match options.scope {
            Some(scope) => scope,
            None => {
                let mut scope = script_url.clone();
                let directory = script_url
                    .path()
                    .rsplit_once('/')
                    .map(|(directory, _)| directory)
                    .unwrap_or("/")
                    .to_string();
                scope.set_path(&directory);
                scope
            }
        };

        let client = Client::new(self.client_url.clone(), ClientType::Worker);

        let (control_local, control_remote) = Port::pair();
        let (intercept_local, intercept_remote) = Port::pair();

        let worker = Arc::new(ServiceWorker::new(
            script_url.clone(),
            scope.clone(),
            control_local.sender(),
        ));
        let registration = Arc::new(ServiceWorkerRegistration::new(worker.clone()));

        *write_lock(&self.registration) = Some(registration.clone());
        *write_lock(&self.intercept_tx) = Some(intercept_local.sender());

        // Resolve `ready` on the first transition into activating. The
        // slot fills at most once for the container's lifetime.
        let mut notifications = worker.subscribe();
        let ready_tx = self.ready_tx.clone();
        let ready_registration = registration.clone();
        tokio::spawn(async move {
            while let Some(event) = notifications.recv().await {
                if matches!(event, WorkerEvent::StateChange(WorkerState::Activating)) {
                    ready_tx.send_if_modified(|slot| {
                        if slot.is_none() {
                            *slot = Some(ready_registration.clone());
                            true
                        } else {
                            false
                        }
                    });
                    break;
                }
            }
        });

        // Mirror control-channel notifications onto the local handle.
        let mirror = worker.clone();
        tokio::spawn(async move {
            while let Some(message) = control_local.recv().await {
                match message {
                    ControlMessage::StateChange { state } => mirror.set_state(state),
                    ControlMessage::Error => {
                        warn!(url = %mirror.script_url(), "service worker reported an error");
                        mirror.emit_error();
                    }
                    ControlMessage::Message { data } => mirror.emit_message(data),
                }
            }
        });

        // Deliver correlated interception replies. Exactly one listener is
        // kept per correlation id and removed on its reply.
        let pending = self.pending.clone();
        tokio::spawn(async move {
            while let Some(message) = intercept_local.recv().await {
                match message {
                    InterceptMessage::Response {
                        request_id,
                        response,
                    } => {
                        let listener = lock(&pending).remove(&request_id);
                        match listener {
                            Some(listener) => {
                                let _ = listener.send(response);
                            }
                            None => trace!(request_id, "no pending listener for reply"),
                        }
                    }
                    message => trace!(?message, "ignoring interception message"),
                }
            }
        });

        // Spawn the unit itself, plus a watcher that surfaces panics as
        // error notifications.
        let unit_scope = ServiceWorkerGlobalScope::new(
            script_url.clone(),
            scope.clone(),
            client,
            control_remote,
            intercept_remote,
            self.script_host.clone(),
            self.fetch.clone(),
        );
        let unit = tokio::spawn(unit_scope.run());

        let crashed = worker.clone();
        tokio::spawn(async move {
            if unit.await.is_err() {
                error!(url = %crashed.script_url(), "worker unit panicked");
                crashed.emit_error();
            }
        });

        debug!(url = %script_url, scope = %scope, "registered service worker");
        Ok(registration)
    }

    /// The registration, once one exists.
    pub fn registration(&self) -> Option<Arc<ServiceWorkerRegistration>> {
        read_lock(&self.registration).clone()
    }

    /// The active worker handle, or `None` before activation.
    pub fn controller(&self) -> Option<Arc<ServiceWorker>> {
        read_lock(&self.registration)
            .as_ref()
            .and_then(|registration| registration.active())
    }

    /// Resolves with the registration once its worker first reaches
    /// activating. Settles exactly once and never rejects.
    pub async fn ready(&self) -> Arc<ServiceWorkerRegistration> {
        let mut rx = self.ready_rx.clone();
        loop {
            if let Some(registration) = rx.borrow_and_update().clone() {
                return registration;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    /// Perform a request, giving the worker a chance to intercept it.
    ///
    /// The request is serialized with a fresh correlation id onto the
    /// interception channel. A correlated response fulfills the request; a
    /// forced failure surfaces as a network error; anything else lets the
    /// request proceed to the network capability.
    pub async fn fetch(&self, request: Request) -> Result<Response, ServiceWorkerError> {
        let intercept = read_lock(&self.intercept_tx).clone();
        if let Some(tx) = intercept {
            let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            let (reply_tx, reply_rx) = oneshot::channel();
            lock(&self.pending).insert(request_id, reply_tx);

            let payload = RequestPayload::from_request(&request);
            let sent = tx
                .send(InterceptMessage::Request {
                    request_id,
                    request: payload,
                })
                .is_ok();

            if sent {
                match reply_rx.await {
                    Ok(Some(payload)) => {
                        if payload.status == 0 {
                            return Err(ServiceWorkerError::NetworkError(
                                "service worker forced a network error".to_string(),
                            ));
                        }
                        trace!(request_id, url = %request.url, "request fulfilled by worker");
                        return Ok(payload.into_response());
                    }
                    Ok(None) => {
                        trace!(request_id, url = %request.url, "request passed through")
                    }
                    Err(_) => {
                        lock(&self.pending).remove(&request_id);
                    }
                }
            } else {
                lock(&self.pending).remove(&request_id);
            }
        }

        self.fetch
            .fetch(request)
            .await
            .map_err(|e| ServiceWorkerError::NetworkError(e.to_string()))
    }
}
