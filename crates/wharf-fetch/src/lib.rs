//! # Wharf Fetch
//!
//! Request/response vocabulary for the Wharf service-worker runtime.
//!
//! ## Features
//!
//! - **Headers**: case-insensitive header map
//! - **Request**: method, URL, headers, optional body
//! - **Response**: status, headers, one-shot consumable body
//! - **Fetch**: the network capability consumed by the runtime
//!
//! The runtime never talks to the network itself. Everything that needs a
//! real transport goes through the [`Fetch`] trait, so hosts decide what
//! "the network" means (an HTTP client, a test fixture, a proxy).

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

// ==================== Errors ====================

/// Errors raised by fetch primitives.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Body already consumed")]
    BodyConsumed,

    #[error("Body is not valid UTF-8: {0}")]
    Decode(String),

    #[error("Network error: {0}")]
    Network(String),
}

// ==================== Headers ====================

/// A case-insensitive header map.
///
/// Names are normalized to lowercase on insert and lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers {
    entries: HashMap<String, String>,
}

impl Headers {
    /// Create an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a header value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    /// Check whether a header is present.
    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    /// Set a header, replacing any previous value.
    pub fn set(&mut self, name: &str, value: &str) {
        self.entries
            .insert(name.to_ascii_lowercase(), value.to_string());
    }

    /// Remove a header, returning whether it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(&name.to_ascii_lowercase()).is_some()
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over (name, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Headers {
    fn from(pairs: [(&str, &str); N]) -> Self {
        let mut headers = Headers::new();
        for (name, value) in pairs {
            headers.set(name, value);
        }
        headers
    }
}

// ==================== Request ====================

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request method, uppercase.
    pub method: String,

    /// Request URL.
    pub url: Url,

    /// Request headers.
    pub headers: Headers,

    /// Request body, if any.
    pub body: Option<Bytes>,
}

impl Request {
    /// Create a request with the given method.
    pub fn new(method: &str, url: Url) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url,
            headers: Headers::new(),
            body: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new("GET", url)
    }

    /// Attach a header.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Attach a body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Whether the request carries a body.
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }
}

// ==================== Response ====================

/// Response body with one-shot consumption.
#[derive(Debug, Clone, Default)]
struct Body {
    bytes: Bytes,
    consumed: bool,
}

/// An incoming response.
///
/// The body can be consumed once through [`Response::bytes`] or
/// [`Response::text`]; afterwards the response reports `body_used`.
/// Cloning yields an independent response with its own consumption state.
#[derive(Debug, Clone)]
pub struct Response {
    /// Response status code. Zero marks a network error.
    pub status: u16,

    /// Response headers.
    pub headers: Headers,

    body: Body,
}

impl Response {
    /// Create an empty response with the given status.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::default(),
        }
    }

    /// Create a 200 response with the given body.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(200).with_body(body)
    }

    /// Create a network-error response.
    pub fn error() -> Self {
        Self::new(0)
    }

    /// Attach a header.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Attach a body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body.bytes = body.into();
        self
    }

    /// Whether the status is in the 2xx range.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether this is a network-error response.
    pub fn is_error(&self) -> bool {
        self.status == 0
    }

    /// Whether the body has been consumed.
    pub fn body_used(&self) -> bool {
        self.body.consumed
    }

    /// Read the body bytes without consuming them.
    pub fn body(&self) -> &[u8] {
        &self.body.bytes
    }

    /// Consume the body.
    pub fn bytes(&mut self) -> Result<Bytes, FetchError> {
        if self.body.consumed {
            return Err(FetchError::BodyConsumed);
        }
        self.body.consumed = true;
        Ok(self.body.bytes.clone())
    }

    /// Consume the body as UTF-8 text.
    pub fn text(&mut self) -> Result<String, FetchError> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

// ==================== Fetch capability ====================

/// The network capability consumed by the runtime.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Perform a request and return its response.
    async fn fetch(&self, request: Request) -> Result<Response, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &str) -> Url {
        Url::parse(&format!("http://localhost{}", path)).unwrap()
    }

    #[test]
    fn test_headers_case_insensitive() {
        let mut headers = Headers::new();
        headers.set("Content-Type", "text/html");

        assert_eq!(headers.get("content-type"), Some("text/html"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/html"));
        assert!(headers.has("Content-type"));
    }

    #[test]
    fn test_headers_overwrite() {
        let mut headers = Headers::new();
        headers.set("x-id", "a");
        headers.set("X-Id", "b");

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-id"), Some("b"));
    }

    #[test]
    fn test_headers_remove() {
        let mut headers = Headers::from([("vary", "accept")]);
        assert!(headers.remove("Vary"));
        assert!(!headers.remove("vary"));
        assert!(headers.is_empty());
    }

    #[test]
    fn test_request_method_normalized() {
        let request = Request::new("get", url("/foo"));
        assert_eq!(request.method, "GET");
        assert!(!request.has_body());
    }

    #[test]
    fn test_response_status_ranges() {
        assert!(Response::ok("hi").is_ok());
        assert!(!Response::new(304).is_ok());
        assert!(!Response::new(500).is_ok());
        assert!(Response::error().is_error());
        assert!(!Response::ok("hi").is_error());
    }

    #[test]
    fn test_body_consumed_once() {
        let mut response = Response::ok("hello");
        assert!(!response.body_used());

        let bytes = response.bytes().unwrap();
        assert_eq!(&bytes[..], b"hello");
        assert!(response.body_used());

        assert!(matches!(response.bytes(), Err(FetchError::BodyConsumed)));
        assert!(matches!(response.text(), Err(FetchError::BodyConsumed)));
    }

    #[test]
    fn test_clone_keeps_caller_usable() {
        let mut original = Response::ok("payload");
        let mut stored = original.clone();

        assert_eq!(stored.text().unwrap(), "payload");
        assert_eq!(original.text().unwrap(), "payload");
    }

    #[test]
    fn test_body_peek_does_not_consume() {
        let response = Response::ok("x");
        assert_eq!(response.body(), b"x");
        assert!(!response.body_used());
    }
}
