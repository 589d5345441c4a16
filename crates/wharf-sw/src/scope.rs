//! The worker-side global scope and its lifecycle driver.
//!
//! Each spawned unit builds one `ServiceWorkerGlobalScope`: its own mirror
//! of the worker handle, a clients registry, an empty cache storage, and
//! the listener registry the executing script hangs handlers on. The scope
//! then drives the install/activate lifecycle exactly once and settles into
//! an event loop over the two transport channels.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, trace, warn};
use url::Url;

use wharf_cache::CacheStorage;
use wharf_common::{Console, Timers};
use wharf_fetch::{Fetch, Request};

use crate::clients::{Client, Clients};
use crate::events::{
    settle_extensions, EventTarget, ExtendableEvent, FetchDecision, FetchEvent, MessageEvent,
    ScopeEvent,
};
use crate::transport::{
    ControlMessage, InterceptMessage, Port, RequestPayload, ResponsePayload,
};
use crate::{ServiceWorker, ServiceWorkerError, WorkerState};

// ==================== Script host capability ====================

/// Globals handed to the executing script.
#[derive(Clone)]
pub struct ScopeGlobals {
    /// The worker scope (`self`). Clients, caches, and the self-handle
    /// hang off it.
    pub scope: Arc<ServiceWorkerGlobalScope>,

    /// Console passthrough.
    pub console: Console,

    /// Timer passthroughs.
    pub timers: Timers,
}

/// Executes script source in an isolated context with the given globals.
///
/// Implementations are swappable per target platform; the runtime only
/// requires that listeners the script registers through the scope fire
/// when events are dispatched.
#[async_trait]
pub trait ScriptHost: Send + Sync {
    async fn run(&self, source: &str, globals: ScopeGlobals) -> Result<(), ServiceWorkerError>;
}

// ==================== Global scope ====================

/// Per-unit aggregate owning the worker-side half of the runtime.
pub struct ServiceWorkerGlobalScope {
    script_url: Url,
    worker: Arc<ServiceWorker>,
    clients: Arc<Clients>,
    caches: Arc<CacheStorage>,
    target: EventTarget,
    control: Port<ControlMessage>,
    intercept: Port<InterceptMessage>,
    script_host: Arc<dyn ScriptHost>,
    fetch: Arc<dyn Fetch>,
    client_id: String,
}

impl ServiceWorkerGlobalScope {
    /// Build the scope for a freshly spawned unit.
    pub fn new(
        script_url: Url,
        scope_url: Url,
        client: Client,
        control: Port<ControlMessage>,
        intercept: Port<InterceptMessage>,
        script_host: Arc<dyn ScriptHost>,
        fetch: Arc<dyn Fetch>,
    ) -> Arc<Self> {
        let worker = Arc::new(ServiceWorker::new(
            script_url.clone(),
            scope_url,
            control.sender(),
        ));

        let clients = Arc::new(Clients::new(worker.clone()));
        let client_id = client.id.clone();
        clients.add(client);

        let caches = Arc::new(CacheStorage::new(fetch.clone()));

        Arc::new(Self {
            script_url,
            worker,
            clients,
            caches,
            target: EventTarget::new(),
            control,
            intercept,
            script_host,
            fetch,
            client_id,
        })
    }

    /// The worker-side handle mirror (`self.serviceWorker`).
    pub fn service_worker(&self) -> Arc<ServiceWorker> {
        self.worker.clone()
    }

    /// The clients registry (`self.clients`).
    pub fn clients(&self) -> Arc<Clients> {
        self.clients.clone()
    }

    /// The cache storage (`self.caches`).
    pub fn caches(&self) -> Arc<CacheStorage> {
        self.caches.clone()
    }

    /// Register a listener, as `self.addEventListener` would.
    pub fn add_event_listener<F>(&self, event: &str, listener: F)
    where
        F: Fn(&ScopeEvent) + Send + Sync + 'static,
    {
        self.target.add_event_listener(event, listener);
    }

    /// Run the unit: load and execute the script, drive the lifecycle, then
    /// serve the event loop until the controller goes away.
    pub async fn run(self: Arc<Self>) -> Result<(), ServiceWorkerError> {
        match self.drive().await {
            Ok(()) => Ok(()),
            Err(error) => {
                error!(url = %self.script_url, %error, "worker unit failed");
                self.report_error();
                Err(error)
            }
        }
    }

    async fn drive(self: &Arc<Self>) -> Result<(), ServiceWorkerError> {
        let script = self.load_script().await?;
        self.transition(WorkerState::Parsed)?;

        let globals = ScopeGlobals {
            scope: self.clone(),
            console: Console::new(self.script_url.as_str()),
            timers: Timers,
        };
        self.script_host.run(&script, globals).await?;

        self.transition(WorkerState::Installing)?;
        let install = Arc::new(ExtendableEvent::new("install"));
        self.target.dispatch(&ScopeEvent::Install(install.clone()));
        settle_extensions(&install).await;
        self.transition(WorkerState::Installed)?;

        self.transition(WorkerState::Activating)?;
        let activate = Arc::new(ExtendableEvent::new("activate"));
        self.target.dispatch(&ScopeEvent::Activate(activate.clone()));
        settle_extensions(&activate).await;
        self.transition(WorkerState::Activated)?;

        info!(url = %self.script_url, "service worker activated");
        self.event_loop().await
    }

    /// Resolve the script source through the network capability.
    async fn load_script(&self) -> Result<String, ServiceWorkerError> {
        let request = Request::get(self.script_url.clone());
        let mut response = self
            .fetch
            .fetch(request)
            .await
            .map_err(|e| ServiceWorkerError::NetworkError(e.to_string()))?;

        if !response.is_ok() {
            return Err(ServiceWorkerError::NetworkError(format!(
                "script fetch for {} returned status {}",
                self.script_url, response.status
            )));
        }

        response
            .text()
            .map_err(|e| ServiceWorkerError::ScriptError(e.to_string()))
    }

    /// Advance the local state machine and notify the controller.
    fn transition(&self, state: WorkerState) -> Result<(), ServiceWorkerError> {
        self.worker.set_state(state);
        self.control.send(ControlMessage::StateChange { state })
    }

    fn report_error(&self) {
        self.worker.emit_error();
        let _ = self.control.send(ControlMessage::Error);
    }

    async fn event_loop(&self) -> Result<(), ServiceWorkerError> {
        loop {
            tokio::select! {
                message = self.control.recv() => match message {
                    Some(ControlMessage::Message { data }) => {
                        trace!(url = %self.script_url, "message event");
                        let event = Arc::new(MessageEvent::new(data));
                        self.target.dispatch(&ScopeEvent::Message(event));
                    }
                    Some(message) => trace!(?message, "ignoring control message"),
                    None => break,
                },
                message = self.intercept.recv() => match message {
                    Some(InterceptMessage::Request { request_id, request }) => {
                        self.handle_intercepted(request_id, request).await?;
                    }
                    Some(message) => trace!(?message, "ignoring interception message"),
                    None => break,
                },
            }
        }
        Ok(())
    }

    /// Dispatch one intercepted request and reply with the decision. Every
    /// request gets exactly one correlated reply; an unhandled event
    /// replies `None` so the controller can fall through to the network.
    async fn handle_intercepted(
        &self,
        request_id: u64,
        payload: RequestPayload,
    ) -> Result<(), ServiceWorkerError> {
        let request = match payload.into_request() {
            Ok(request) => request,
            Err(error) => {
                warn!(request_id, %error, "dropping malformed intercepted request");
                return self.intercept.send(InterceptMessage::Response {
                    request_id,
                    response: None,
                });
            }
        };

        trace!(request_id, url = %request.url, "fetch event");
        let event = Arc::new(FetchEvent::new(request, self.client_id.clone()));
        self.target.dispatch(&ScopeEvent::Fetch(event.clone()));
        settle_extensions(event.extendable()).await;

        let response = match event.take_decision() {
            FetchDecision::Respond(response) => Some(ResponsePayload::from_response(&response)),
            FetchDecision::NetworkError => Some(ResponsePayload::network_error()),
            FetchDecision::Unhandled => None,
        };
        event.settle_handled();

        self.intercept.send(InterceptMessage::Response {
            request_id,
            response,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ClientType;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use wharf_fetch::{FetchError, Response};

    struct HookHost<F>(F);

    #[async_trait]
    impl<F> ScriptHost for HookHost<F>
    where
        F: Fn(&ScopeGlobals) + Send + Sync,
    {
        async fn run(
            &self,
            _source: &str,
            globals: ScopeGlobals,
        ) -> Result<(), ServiceWorkerError> {
            (self.0)(&globals);
            Ok(())
        }
    }

    struct FailingHost;

    #[async_trait]
    impl ScriptHost for FailingHost {
        async fn run(
            &self,
            _source: &str,
            _globals: ScopeGlobals,
        ) -> Result<(), ServiceWorkerError> {
            Err(ServiceWorkerError::ScriptError(
                "unexpected token".to_string(),
            ))
        }
    }

    /// Serves only the worker script itself.
    struct ScriptFetch;

    #[async_trait]
    impl Fetch for ScriptFetch {
        async fn fetch(&self, request: Request) -> Result<Response, FetchError> {
            if request.url.path().ends_with("sw.js") {
                Ok(Response::ok("addEventListener('fetch', () => {})"))
            } else {
                Err(FetchError::Network(format!("no route for {}", request.url)))
            }
        }
    }

    fn url(path: &str) -> Url {
        Url::parse(&format!("http://localhost{}", path)).unwrap()
    }

    fn build_scope(
        script: &str,
        host: Arc<dyn ScriptHost>,
    ) -> (
        Arc<ServiceWorkerGlobalScope>,
        Port<ControlMessage>,
        Port<InterceptMessage>,
    ) {
        let (control_local, control_remote) = Port::pair();
        let (intercept_local, intercept_remote) = Port::pair();
        let client = Client::new(url("/app/"), ClientType::Worker);

        let scope = ServiceWorkerGlobalScope::new(
            url(script),
            url("/app"),
            client,
            control_remote,
            intercept_remote,
            host,
            Arc::new(ScriptFetch),
        );
        (scope, control_local, intercept_local)
    }

    fn spawn_scope<F>(
        hook: F,
    ) -> (
        Arc<ServiceWorkerGlobalScope>,
        Port<ControlMessage>,
        Port<InterceptMessage>,
    )
    where
        F: Fn(&ScopeGlobals) + Send + Sync + 'static,
    {
        let (scope, control, intercept) = build_scope("/app/sw.js", Arc::new(HookHost(hook)));
        tokio::spawn(scope.clone().run());
        (scope, control, intercept)
    }

    async fn states_until(control: &Port<ControlMessage>, target: WorkerState) -> Vec<WorkerState> {
        let mut states = Vec::new();
        while let Some(message) = control.recv().await {
            if let ControlMessage::StateChange { state } = message {
                states.push(state);
                if state == target {
                    break;
                }
            }
        }
        states
    }

    #[tokio::test]
    async fn test_lifecycle_runs_in_order() {
        let (scope, control, _intercept) = spawn_scope(|_| {});

        let states = states_until(&control, WorkerState::Activated).await;
        assert_eq!(
            states,
            vec![
                WorkerState::Parsed,
                WorkerState::Installing,
                WorkerState::Installed,
                WorkerState::Activating,
                WorkerState::Activated,
            ]
        );
        assert_eq!(scope.service_worker().state(), WorkerState::Activated);
    }

    #[tokio::test]
    async fn test_activation_waits_for_extensions() {
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let gate = Arc::new(Mutex::new(Some(gate_rx)));

        let (_scope, control, _intercept) = spawn_scope(move |globals| {
            let gate = gate.clone();
            globals.scope.add_event_listener("activate", move |event| {
                if let ScopeEvent::Activate(event) = event {
                    if let Some(gate_rx) = gate.lock().unwrap().take() {
                        event.wait_until(async move {
                            gate_rx.await.map_err(|e| e.to_string())?;
                            Ok(())
                        });
                    }
                }
            });
        });

        states_until(&control, WorkerState::Activating).await;

        // Activated must not arrive while the extension is pending.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), control.recv()).await;
        assert!(blocked.is_err());

        gate_tx.send(()).unwrap();
        let states = states_until(&control, WorkerState::Activated).await;
        assert_eq!(states, vec![WorkerState::Activated]);
    }

    #[tokio::test]
    async fn test_script_failure_reports_error_without_redundant() {
        let (scope, control, _intercept) = build_scope("/app/sw.js", Arc::new(FailingHost));
        let unit = tokio::spawn(scope.clone().run());

        let mut states = Vec::new();
        let mut saw_error = false;
        while let Some(message) = control.recv().await {
            match message {
                ControlMessage::StateChange { state } => states.push(state),
                ControlMessage::Error => {
                    saw_error = true;
                    break;
                }
                _ => {}
            }
        }

        assert!(saw_error);
        assert_eq!(states, vec![WorkerState::Parsed]);
        assert!(unit.await.unwrap().is_err());
        // An uncaught failure is the controller's decision to act on; the
        // worker does not demote itself.
        assert_eq!(scope.service_worker().state(), WorkerState::Parsed);
    }

    #[tokio::test]
    async fn test_missing_script_reports_error() {
        let (scope, control, _intercept) =
            build_scope("/app/missing.js", Arc::new(HookHost(|_: &ScopeGlobals| {})));
        tokio::spawn(scope.run());

        // Script load happens before any state transition.
        let first = control.recv().await;
        assert!(matches!(first, Some(ControlMessage::Error)));
    }

    #[tokio::test]
    async fn test_message_events_reach_listeners() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let (_scope, control, _intercept) = spawn_scope(move |globals| {
            let sink = sink.clone();
            globals.scope.add_event_listener("message", move |event| {
                if let ScopeEvent::Message(event) = event {
                    sink.lock().unwrap().push(event.data.clone());
                }
            });
        });

        states_until(&control, WorkerState::Activated).await;
        control
            .send(ControlMessage::Message {
                data: json!({"ping": true}),
            })
            .unwrap();

        for _ in 0..100 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*seen.lock().unwrap(), vec![json!({"ping": true})]);
    }

    #[tokio::test]
    async fn test_intercepted_requests_get_correlated_replies() {
        let (_scope, control, intercept) = spawn_scope(|globals| {
            globals.scope.add_event_listener("fetch", |event| {
                if let ScopeEvent::Fetch(event) = event {
                    match event.request.url.path() {
                        "/cached" => {
                            let _ = event.respond_with(async { Ok(Response::ok("cached!")) });
                        }
                        "/boom" => {
                            let _ =
                                event.respond_with(async { Err("handler exploded".to_string()) });
                        }
                        _ => {}
                    }
                }
            });
        });

        states_until(&control, WorkerState::Activated).await;

        let send = |id: u64, path: &str| {
            intercept
                .send(InterceptMessage::Request {
                    request_id: id,
                    request: RequestPayload::from_request(&Request::get(url(path))),
                })
                .unwrap();
        };

        send(1, "/cached");
        match intercept.recv().await {
            Some(InterceptMessage::Response {
                request_id,
                response: Some(payload),
            }) => {
                assert_eq!(request_id, 1);
                assert_eq!(payload.status, 200);
                assert_eq!(payload.body, b"cached!".to_vec());
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        send(2, "/untouched");
        match intercept.recv().await {
            Some(InterceptMessage::Response {
                request_id,
                response,
            }) => {
                assert_eq!(request_id, 2);
                assert!(response.is_none());
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        send(3, "/boom");
        match intercept.recv().await {
            Some(InterceptMessage::Response {
                request_id,
                response: Some(payload),
            }) => {
                assert_eq!(request_id, 3);
                assert_eq!(payload.status, 0);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}
