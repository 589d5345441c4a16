//! Clients registry for a worker scope.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;
use url::Url;

use crate::ServiceWorker;

// ==================== Client ====================

/// Execution context kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientType {
    Main,
    Worker,
}

/// Frame kind of the originating context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Auxiliary,
    TopLevel,
    Nested,
    None,
}

/// A descriptor of an execution context a worker can message.
#[derive(Debug, Clone)]
pub struct Client {
    /// Unique client id.
    pub id: String,

    /// The context's URL.
    pub url: Url,

    /// Context kind.
    pub client_type: ClientType,

    /// Frame kind.
    pub frame_type: FrameType,
}

impl Client {
    /// Create a client descriptor with a fresh id.
    pub fn new(url: Url, client_type: ClientType) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self {
            id: format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed)),
            url,
            client_type,
            frame_type: FrameType::None,
        }
    }
}

// ==================== Clients ====================

/// Options for [`Clients::match_all`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientMatchOptions {
    /// Restrict results to one context kind.
    pub client_type: Option<ClientType>,
    /// Include clients not controlled by the owning worker.
    pub include_uncontrolled: bool,
}

#[derive(Debug)]
struct ClientRecord {
    client: Client,
    controlled: bool,
}

/// Registry of the clients known to one worker.
pub struct Clients {
    worker: Arc<ServiceWorker>,
    records: Mutex<Vec<ClientRecord>>,
}

impl Clients {
    /// Create an empty registry owned by the given worker handle.
    pub fn new(worker: Arc<ServiceWorker>) -> Self {
        Self {
            worker,
            records: Mutex::new(Vec::new()),
        }
    }

    /// Register a client. New clients start uncontrolled.
    pub fn add(&self, client: Client) {
        crate::lock(&self.records).push(ClientRecord {
            client,
            controlled: false,
        });
    }

    /// Look up a client by id.
    pub fn get(&self, id: &str) -> Option<Client> {
        crate::lock(&self.records)
            .iter()
            .find(|record| record.client.id == id)
            .map(|record| record.client.clone())
    }

    /// Return registered clients in registration order. Every client is
    /// run through the filters; a non-matching client is skipped, never
    /// terminates the scan.
    pub fn match_all(&self, options: ClientMatchOptions) -> Vec<Client> {
        crate::lock(&self.records)
            .iter()
            .filter(|record| {
                if let Some(wanted) = options.client_type {
                    if record.client.client_type != wanted {
                        return false;
                    }
                }
                if !options.include_uncontrolled && !record.controlled {
                    return false;
                }
                true
            })
            .map(|record| record.client.clone())
            .collect()
    }

    /// Mark every client whose URL lies within the owning worker's scope
    /// as controlled by it. Returns how many clients were claimed.
    pub fn claim(&self) -> usize {
        let scope = self.worker.scope_url();
        let mut claimed = 0;

        for record in crate::lock(&self.records).iter_mut() {
            if !record.controlled && scope_contains(scope, &record.client.url) {
                record.controlled = true;
                claimed += 1;
            }
        }

        if claimed > 0 {
            debug!(claimed, scope = %scope, "worker claimed clients");
        }
        claimed
    }
}

/// Scope containment is a URL-prefix relation.
pub(crate) fn scope_contains(scope: &Url, url: &Url) -> bool {
    url.as_str().starts_with(scope.as_str())
}
