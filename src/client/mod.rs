//! Client Module
//!
//! The transport seam between the router and upstream providers.

pub mod http;

pub use http::HttpDispatcher;

use crate::error::Result;
use crate::router::key_pool::PickedKey;
use crate::store::{ModelProviderLink, ProviderRecord};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use reqwest::header::HeaderMap;
use serde_json::Value;
use std::pin::Pin;

/// Response body as delivered by the transport
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// The caller's request body, forwarded with its `model` field rewritten
#[derive(Debug, Clone)]
pub struct RequestPayload {
    body: Value,
}

impl RequestPayload {
    pub fn new(body: Value) -> Self {
        Self { body }
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Whether the caller asked for a streamed response
    pub fn is_stream(&self) -> bool {
        self.body
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Body to send upstream with the association's model name set
    pub fn for_model(&self, model: &str) -> Value {
        let mut body = self.body.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".to_string(), Value::String(model.to_string()));
        }
        body
    }
}

/// Outcome of one upstream call that produced a status
pub struct Dispatched {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl Dispatched {
    /// A response whose body is already in memory
    pub fn buffered(status: u16, body: impl Into<Bytes>) -> Self {
        let chunk: Result<Bytes> = Ok(body.into());
        Self {
            status,
            headers: HeaderMap::new(),
            body: Box::pin(futures::stream::iter(vec![chunk])),
        }
    }
}

impl std::fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatched")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Performs the vendor call for a resolved candidate.
///
/// An `Err` means no status was received (connection refused, timeout, reset);
/// any HTTP status, success or not, comes back as `Ok`.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        provider: &ProviderRecord,
        link: &ModelProviderLink,
        key: &PickedKey,
        payload: &RequestPayload,
    ) -> Result<Dispatched>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[test]
    fn test_payload_model_rewrite() {
        let payload = RequestPayload::new(json!({
            "model": "chat",
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        }));

        assert!(payload.is_stream());
        let body = payload.for_model("gpt-4o-mini");
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["content"], "hi");
        assert_eq!(payload.body()["model"], "chat");
    }

    #[tokio::test]
    async fn test_buffered_response() {
        let mut response = Dispatched::buffered(200, "ok");
        let chunk = response.body.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"ok");
        assert!(response.body.next().await.is_none());
    }
}
