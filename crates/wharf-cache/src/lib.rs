//! # Wharf Cache
//!
//! Request/response cache storage engine for the Wharf service-worker
//! runtime.
//!
//! ## Features
//!
//! - **Cache**: ordered store of request/response pairs
//! - **CacheStorage**: named collection of caches (the `caches` global)
//! - **Matching**: URL comparison with fragment stripping, `ignoreSearch`,
//!   `ignoreMethod`, `ignoreVary`, and `vary` header enforcement
//! - **Atomic batches**: put/delete apply all-or-nothing
//!
//! ## Architecture
//!
//! ```text
//! CacheStorage (caches)
//!     └── Cache (insertion-ordered)
//!             └── Request → Response
//! ```
//!
//! Mutation always funnels through one internal batch operation that holds
//! the store's write lock for the whole batch and restores a snapshot on
//! any error, so a failed batch leaves no partial effects behind.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

use wharf_fetch::{Fetch, Request, Response};

// ==================== Errors ====================

/// Errors raised by cache operations.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Request URL scheme must be \"http\" or \"https\"")]
    InvalidScheme,

    #[error("Request method must be \"GET\"")]
    MethodNotAllowed,

    #[error("Response status 206 cannot be cached")]
    PartialContent,

    #[error("Response vary header contains \"*\"")]
    WildcardVary,

    #[error("Response body is already consumed")]
    BodyConsumed,

    #[error("Failed to fetch: {0}")]
    FetchFailed(String),
}

// ==================== Query options ====================

/// Options for cache matching.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheQueryOptions {
    /// Strip query strings from both URLs before comparing.
    pub ignore_search: bool,
    /// Match non-GET requests.
    pub ignore_method: bool,
    /// Skip `vary` header enforcement.
    pub ignore_vary: bool,
}

/// Options for matching across a whole [`CacheStorage`].
#[derive(Debug, Clone, Default)]
pub struct MultiCacheQueryOptions {
    /// Restrict the search to one named cache.
    pub cache_name: Option<String>,
    /// Per-cache matching options.
    pub query: CacheQueryOptions,
}

// ==================== Entries and batches ====================

/// A stored request/response pair. Never mutated in place, only replaced
/// or removed.
#[derive(Debug, Clone)]
struct CacheEntry {
    request: Request,
    response: Response,
}

/// One step of the internal batch operation.
#[derive(Debug)]
enum BatchOperation {
    Put {
        request: Request,
        response: Response,
    },
    Delete {
        request: Request,
        options: CacheQueryOptions,
    },
}

// ==================== Cache ====================

/// An ordered store of request/response pairs.
pub struct Cache {
    fetch: Arc<dyn Fetch>,
    entries: RwLock<Vec<CacheEntry>>,
}

impl Cache {
    /// Create an empty cache backed by the given network capability.
    pub fn new(fetch: Arc<dyn Fetch>) -> Self {
        Self {
            fetch,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Fetch one request and store its response.
    pub async fn add(&self, request: Request) -> Result<(), CacheError> {
        self.add_all(vec![request]).await
    }

    /// Fetch every request concurrently and store all responses in one
    /// atomic batch. If any fetch fails validation, nothing is stored.
    pub async fn add_all(&self, requests: Vec<Request>) -> Result<(), CacheError> {
        for request in &requests {
            if !is_cacheable_scheme(&request.url) {
                return Err(CacheError::InvalidScheme);
            }
            if request.method != "GET" {
                return Err(CacheError::MethodNotAllowed);
            }
        }

        let fetches = requests
            .iter()
            .cloned()
            .map(|request| self.fetch.fetch(request));
        let results = join_all(fetches).await;

        let mut operations = Vec::with_capacity(requests.len());
        for (request, result) in requests.into_iter().zip(results) {
            let response = result.map_err(|e| CacheError::FetchFailed(e.to_string()))?;

            if response.is_error() || !response.is_ok() {
                return Err(CacheError::FetchFailed(format!(
                    "{} responded with status {}",
                    request.url, response.status
                )));
            }
            if response.status == 206 {
                return Err(CacheError::FetchFailed(format!(
                    "{} responded with a partial response",
                    request.url
                )));
            }
            if has_wildcard_vary(&response) {
                return Err(CacheError::FetchFailed(format!(
                    "{} responded with vary: *",
                    request.url
                )));
            }

            operations.push(BatchOperation::Put { request, response });
        }

        self.batch(operations).await?;
        Ok(())
    }

    /// Store a response for a request, replacing any entry whose request
    /// matches by URL and method.
    pub async fn put(&self, request: Request, response: Response) -> Result<(), CacheError> {
        if !is_cacheable_scheme(&request.url) {
            return Err(CacheError::InvalidScheme);
        }
        if response.status == 206 {
            return Err(CacheError::PartialContent);
        }
        if has_wildcard_vary(&response) {
            return Err(CacheError::WildcardVary);
        }
        if response.body_used() {
            return Err(CacheError::BodyConsumed);
        }

        self.batch(vec![BatchOperation::Put { request, response }])
            .await?;
        Ok(())
    }

    /// Remove every entry matching the request. Returns whether anything
    /// was removed.
    pub async fn delete(
        &self,
        request: Request,
        options: CacheQueryOptions,
    ) -> Result<bool, CacheError> {
        if request.method != "GET" && !options.ignore_method {
            return Ok(false);
        }

        let removed = self
            .batch(vec![BatchOperation::Delete { request, options }])
            .await?;
        Ok(removed > 0)
    }

    /// List stored requests, optionally restricted to those matching a
    /// query. Returned requests are clones in insertion order.
    pub async fn keys(
        &self,
        request: Option<&Request>,
        options: CacheQueryOptions,
    ) -> Vec<Request> {
        let entries = self.entries.read().await;
        match request {
            None => entries.iter().map(|e| e.request.clone()).collect(),
            Some(query) => {
                if query.method != "GET" && !options.ignore_method {
                    return Vec::new();
                }
                entries
                    .iter()
                    .filter(|e| request_matches(query, &e.request, Some(&e.response), options))
                    .map(|e| e.request.clone())
                    .collect()
            }
        }
    }

    /// Return the first matching response, if any.
    pub async fn match_request(
        &self,
        request: &Request,
        options: CacheQueryOptions,
    ) -> Option<Response> {
        self.match_all(Some(request), options).await.into_iter().next()
    }

    /// Return every matching response as clones in insertion order. With
    /// no query, returns every stored response.
    pub async fn match_all(
        &self,
        request: Option<&Request>,
        options: CacheQueryOptions,
    ) -> Vec<Response> {
        let entries = self.entries.read().await;
        match request {
            None => entries.iter().map(|e| e.response.clone()).collect(),
            Some(query) => {
                if query.method != "GET" && !options.ignore_method {
                    return Vec::new();
                }
                trace!(url = %query.url, "cache lookup");
                entries
                    .iter()
                    .filter(|e| request_matches(query, &e.request, Some(&e.response), options))
                    .map(|e| e.response.clone())
                    .collect()
            }
        }
    }

    /// Apply a batch of operations against the live store. On any error
    /// the pre-batch snapshot is restored and the error re-raised.
    /// Returns how many entries the delete operations removed.
    async fn batch(&self, operations: Vec<BatchOperation>) -> Result<usize, CacheError> {
        let mut entries = self.entries.write().await;
        let snapshot = entries.clone();

        match Self::apply_operations(&mut entries, operations) {
            Ok(removed) => Ok(removed),
            Err(error) => {
                debug!(%error, "cache batch rolled back");
                *entries = snapshot;
                Err(error)
            }
        }
    }

    fn apply_operations(
        entries: &mut Vec<CacheEntry>,
        operations: Vec<BatchOperation>,
    ) -> Result<usize, CacheError> {
        let mut removed = 0;

        for operation in operations {
            match operation {
                BatchOperation::Put { request, response } => {
                    if !is_cacheable_scheme(&request.url) {
                        return Err(CacheError::InvalidScheme);
                    }
                    if request.method != "GET" {
                        return Err(CacheError::MethodNotAllowed);
                    }

                    // Replacement matches on URL and method alone; the
                    // stored response's vary header does not shield an
                    // entry from being overwritten.
                    entries.retain(|e| {
                        !request_matches(&request, &e.request, None, CacheQueryOptions::default())
                    });
                    entries.push(CacheEntry { request, response });
                }
                BatchOperation::Delete { request, options } => {
                    let before = entries.len();
                    entries.retain(|e| {
                        !request_matches(&request, &e.request, Some(&e.response), options)
                    });
                    removed += before - entries.len();
                }
            }
        }

        Ok(removed)
    }
}

// ==================== Matching ====================

fn is_cacheable_scheme(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

fn has_wildcard_vary(response: &Response) -> bool {
    response
        .headers
        .get("vary")
        .map(|value| value.split(',').any(|field| field.trim() == "*"))
        .unwrap_or(false)
}

/// Decide whether a stored entry matches a query request.
///
/// Fragments are always stripped from both URLs; query strings only under
/// `ignore_search`. When a cached response is supplied and carries a
/// `vary` header, every named request header must agree between the query
/// and the stored request (absent on both counts as agreement). A
/// wildcard field never matches.
fn request_matches(
    query: &Request,
    cached_request: &Request,
    cached_response: Option<&Response>,
    options: CacheQueryOptions,
) -> bool {
    if !options.ignore_method && cached_request.method != "GET" {
        return false;
    }

    let mut query_url = query.url.clone();
    let mut cached_url = cached_request.url.clone();
    query_url.set_fragment(None);
    cached_url.set_fragment(None);
    if options.ignore_search {
        query_url.set_query(None);
        cached_url.set_query(None);
    }
    if query_url != cached_url {
        return false;
    }

    let vary = match cached_response {
        Some(response) if !options.ignore_vary => response.headers.get("vary"),
        _ => None,
    };
    let Some(vary) = vary else {
        return true;
    };

    for field in vary.split(',').map(str::trim) {
        if field == "*" {
            return false;
        }
        if query.headers.get(field) != cached_request.headers.get(field) {
            return false;
        }
    }

    true
}

// ==================== Cache storage ====================

/// A named collection of caches (the `caches` global).
///
/// Slots keep insertion order; a whole-storage match walks the caches in
/// the order they were first opened.
pub struct CacheStorage {
    fetch: Arc<dyn Fetch>,
    caches: RwLock<Vec<(String, Arc<Cache>)>>,
}

impl CacheStorage {
    /// Create empty storage backed by the given network capability.
    pub fn new(fetch: Arc<dyn Fetch>) -> Self {
        Self {
            fetch,
            caches: RwLock::new(Vec::new()),
        }
    }

    /// Return the named cache, creating and storing an empty one on first
    /// use. Always succeeds.
    pub async fn open(&self, name: &str) -> Arc<Cache> {
        let mut caches = self.caches.write().await;
        if let Some((_, cache)) = caches.iter().find(|(n, _)| n == name) {
            return cache.clone();
        }

        debug!(name, "created cache");
        let cache = Arc::new(Cache::new(self.fetch.clone()));
        caches.push((name.to_string(), cache.clone()));
        cache
    }

    /// Check whether a named cache exists.
    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.iter().any(|(n, _)| n == name)
    }

    /// Remove a named cache, returning whether it existed.
    pub async fn delete(&self, name: &str) -> bool {
        let mut caches = self.caches.write().await;
        let before = caches.len();
        caches.retain(|(n, _)| n != name);
        caches.len() != before
    }

    /// List cache names in insertion order.
    pub async fn keys(&self) -> Vec<String> {
        self.caches
            .read()
            .await
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Search for a response. With `cache_name` set, only that cache is
    /// searched; otherwise every cache in insertion order, first hit wins.
    pub async fn match_request(
        &self,
        request: &Request,
        options: MultiCacheQueryOptions,
    ) -> Option<Response> {
        let caches: Vec<Arc<Cache>> = {
            let caches = self.caches.read().await;
            match options.cache_name {
                Some(ref name) => caches
                    .iter()
                    .filter(|(n, _)| n == name)
                    .map(|(_, c)| c.clone())
                    .collect(),
                None => caches.iter().map(|(_, c)| c.clone()).collect(),
            }
        };

        for cache in caches {
            if let Some(response) = cache.match_request(request, options.query).await {
                return Some(response);
            }
        }
        None
    }
}
