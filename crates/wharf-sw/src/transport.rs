//! Typed transport between the controller and a spawned worker unit.
//!
//! Each worker gets two independent channels: a control channel for state
//! notifications and user messages, and an interception channel for the
//! request/response relay. Every channel delivers in send order; nothing is
//! guaranteed across channels.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use url::Url;

use wharf_fetch::{Headers, Request, Response};

use crate::{ServiceWorkerError, WorkerState};

// ==================== Ports ====================

/// One end of an ordered bidirectional channel.
#[derive(Debug)]
pub struct Port<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>,
}

impl<T> Port<T> {
    /// Create an entangled pair of ports.
    pub fn pair() -> (Port<T>, Port<T>) {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();

        let a = Port {
            tx: tx1,
            rx: tokio::sync::Mutex::new(rx2),
        };
        let b = Port {
            tx: tx2,
            rx: tokio::sync::Mutex::new(rx1),
        };

        (a, b)
    }

    /// Send a message to the far end.
    pub fn send(&self, message: T) -> Result<(), ServiceWorkerError> {
        self.tx
            .send(message)
            .map_err(|_| ServiceWorkerError::TransportClosed)
    }

    /// Receive the next message. Returns `None` once the far end is gone.
    pub async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    /// A standalone sender for this end.
    pub fn sender(&self) -> mpsc::UnboundedSender<T> {
        self.tx.clone()
    }
}

// ==================== Control channel ====================

/// Messages on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// The worker-side state machine advanced.
    #[serde(rename = "worker/statechange")]
    StateChange { state: WorkerState },

    /// An uncaught failure inside the worker unit.
    #[serde(rename = "worker/error")]
    Error,

    /// An opaque user payload, either direction.
    #[serde(rename = "message")]
    Message { data: JsonValue },
}

// ==================== Interception channel ====================

/// Messages on the interception channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InterceptMessage {
    /// Controller to worker: an outgoing request to consider.
    #[serde(rename = "request", rename_all = "camelCase")]
    Request {
        request_id: u64,
        request: RequestPayload,
    },

    /// Worker to controller: the decision for a correlated request.
    /// `None` lets the request proceed to the network.
    #[serde(rename = "response", rename_all = "camelCase")]
    Response {
        request_id: u64,
        response: Option<ResponsePayload>,
    },
}

/// A request serialized for the interception channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPayload {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

impl RequestPayload {
    /// Serialize a request. Bodies are omitted for GET and HEAD.
    pub fn from_request(request: &Request) -> Self {
        let body = match request.method.as_str() {
            "GET" | "HEAD" => None,
            _ => request.body.as_ref().map(|b| b.to_vec()),
        };
        Self {
            method: request.method.clone(),
            url: request.url.to_string(),
            headers: request.headers.clone(),
            body,
        }
    }

    /// Rebuild the request on the far side.
    pub fn into_request(self) -> Result<Request, ServiceWorkerError> {
        let url = Url::parse(&self.url).map_err(|e| {
            ServiceWorkerError::NetworkError(format!("invalid request url {:?}: {}", self.url, e))
        })?;
        let mut request = Request::new(&self.method, url);
        request.headers = self.headers;
        request.body = self.body.map(Bytes::from);
        Ok(request)
    }
}

/// A response serialized for the interception channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl ResponsePayload {
    pub fn from_response(response: &Response) -> Self {
        Self {
            status: response.status,
            headers: response.headers.clone(),
            body: response.body().to_vec(),
        }
    }

    /// A forced network failure.
    pub fn network_error() -> Self {
        Self {
            status: 0,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn into_response(self) -> Response {
        let mut response = Response::new(self.status).with_body(self.body);
        response.headers = self.headers;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_port_pair_relays_in_order() {
        let (a, b) = Port::pair();

        a.send(1u32).unwrap();
        a.send(2).unwrap();
        b.send(10).unwrap();

        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
        assert_eq!(a.recv().await, Some(10));
    }

    #[tokio::test]
    async fn test_port_recv_ends_when_far_end_dropped() {
        let (a, b) = Port::<u32>::pair();
        drop(a);
        assert_eq!(b.recv().await, None);
    }

    #[test]
    fn test_port_send_fails_when_far_end_dropped() {
        let (a, b) = Port::<u32>::pair();
        drop(b);
        assert!(a.send(1).is_err());
    }

    #[test]
    fn test_statechange_wire_shape() {
        let message = ControlMessage::StateChange {
            state: WorkerState::Installing,
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"type": "worker/statechange", "state": "installing"})
        );
    }

    #[test]
    fn test_error_wire_shape() {
        assert_eq!(
            serde_json::to_value(ControlMessage::Error).unwrap(),
            json!({"type": "worker/error"})
        );
    }

    #[test]
    fn test_intercept_wire_shape() {
        let request = RequestPayload {
            method: "GET".to_string(),
            url: "http://localhost/a".to_string(),
            headers: Headers::new(),
            body: None,
        };
        let value = serde_json::to_value(InterceptMessage::Request {
            request_id: 7,
            request,
        })
        .unwrap();

        assert_eq!(value["type"], "request");
        assert_eq!(value["requestId"], 7);
        assert_eq!(value["request"]["method"], "GET");
        assert_eq!(value["request"]["body"], json!(null));

        let reply = InterceptMessage::Response {
            request_id: 7,
            response: None,
        };
        let value = serde_json::to_value(reply).unwrap();
        assert_eq!(value["requestId"], 7);
        assert_eq!(value["response"], json!(null));
    }

    #[test]
    fn test_request_payload_omits_get_body() {
        let url = Url::parse("http://localhost/upload").unwrap();
        let get = Request::get(url.clone()).with_body("ignored");
        assert!(RequestPayload::from_request(&get).body.is_none());

        let post = Request::new("POST", url).with_body("kept");
        let payload = RequestPayload::from_request(&post);
        assert_eq!(payload.body.as_deref(), Some(b"kept".as_ref()));

        let rebuilt = payload.into_request().unwrap();
        assert_eq!(rebuilt.method, "POST");
        assert!(rebuilt.has_body());
    }

    #[test]
    fn test_response_payload_round_trip() {
        let response = Response::ok("hello").with_header("x-tag", "1");
        let payload = ResponsePayload::from_response(&response);

        let mut rebuilt = payload.into_response();
        assert_eq!(rebuilt.status, 200);
        assert_eq!(rebuilt.headers.get("x-tag"), Some("1"));
        assert_eq!(rebuilt.text().unwrap(), "hello");
    }
}
