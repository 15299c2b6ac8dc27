//! HTTP Dispatcher
//!
//! reqwest transport for OpenAI- and Anthropic-style providers. Connection
//! failures are retried briefly with exponential backoff; HTTP statuses are
//! handed back untouched for the router to classify.

use crate::client::{Dispatched, Dispatcher, RequestPayload};
use crate::config::{ProviderConfig, ProviderStyle, RouterConfig};
use crate::error::{GatewayError, Result};
use crate::router::key_pool::PickedKey;
use crate::store::{ModelProviderLink, ProviderRecord};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Default `anthropic-version` header value
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// HTTP transport for upstream providers
pub struct HttpDispatcher {
    /// Inner reqwest client
    client: Client,

    /// Total time spent retrying connection failures
    retry_window: Duration,
}

impl HttpDispatcher {
    /// Create a new dispatcher with default timeouts
    pub fn new() -> Result<Self> {
        Self::from_config(&RouterConfig::default())
    }

    /// Create a dispatcher using the router's timeouts
    pub fn from_config(config: &RouterConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| GatewayError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            retry_window: Duration::from_secs(5),
        })
    }

    /// Override how long connection failures are retried
    pub fn with_retry_window(mut self, window: Duration) -> Self {
        self.retry_window = window;
        self
    }

    fn retry_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            max_elapsed_time: Some(self.retry_window),
            multiplier: 2.0,
            ..Default::default()
        }
    }
}

/// Full request URL for a provider
fn request_url(config: &ProviderConfig) -> String {
    format!(
        "{}{}",
        config.base_url().trim_end_matches('/'),
        config.request_path()
    )
}

fn insert_header(headers: &mut HeaderMap, key: &str, value: &str) -> Result<()> {
    let name = HeaderName::try_from(key)
        .map_err(|e| GatewayError::Config(format!("Invalid header name '{}': {}", key, e)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| GatewayError::Config(format!("Invalid value for header '{}': {}", key, e)))?;
    headers.insert(name, value);
    Ok(())
}

fn apply_headers(headers: &mut HeaderMap, extra: &BTreeMap<String, String>) -> Result<()> {
    for (key, value) in extra {
        insert_header(headers, key, value)?;
    }
    Ok(())
}

/// Auth by provider style, then provider headers, then association headers
fn build_headers(config: &ProviderConfig, link: &ModelProviderLink, key: &PickedKey) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    match config.style() {
        ProviderStyle::OpenAI => {
            let mut auth = HeaderValue::from_str(&format!("Bearer {}", key.secret))
                .map_err(|e| GatewayError::Config(format!("Invalid API key format: {}", e)))?;
            auth.set_sensitive(true);
            headers.insert(AUTHORIZATION, auth);
        }
        ProviderStyle::Anthropic => {
            let mut auth = HeaderValue::from_str(&key.secret)
                .map_err(|e| GatewayError::Config(format!("Invalid API key format: {}", e)))?;
            auth.set_sensitive(true);
            headers.insert(HeaderName::from_static("x-api-key"), auth);
            headers.insert(
                HeaderName::from_static("anthropic-version"),
                HeaderValue::from_static(ANTHROPIC_VERSION),
            );
        }
    }

    apply_headers(&mut headers, &config.endpoint().headers)?;
    apply_headers(&mut headers, &link.headers)?;
    Ok(headers)
}

fn classify_send_error(err: reqwest::Error) -> backoff::Error<reqwest::Error> {
    if err.is_connect() {
        backoff::Error::transient(err)
    } else {
        backoff::Error::permanent(err)
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(
        &self,
        provider: &ProviderRecord,
        link: &ModelProviderLink,
        key: &PickedKey,
        payload: &RequestPayload,
    ) -> Result<Dispatched> {
        use async_stream::stream;
        use futures::StreamExt;

        let url = request_url(&provider.config);
        let headers = build_headers(&provider.config, link, key)?;
        let body_json = serde_json::to_string(&payload.for_model(&link.provider_model))?;

        debug!(
            provider = %provider.name,
            model = %link.provider_model,
            key = %key.hint,
            %url,
            "dispatching request"
        );

        let client = &self.client;
        let url = url.as_str();
        let headers = &headers;
        let body_json = &body_json;
        let response = backoff::future::retry(self.retry_policy(), || async move {
            client
                .post(url)
                .headers(headers.clone())
                .body(body_json.clone())
                .send()
                .await
                .map_err(classify_send_error)
        })
        .await?;

        let status = response.status().as_u16();
        let response_headers = response.headers().clone();

        let mut byte_stream = response.bytes_stream();
        let body = stream! {
            while let Some(chunk) = byte_stream.next().await {
                yield chunk.map_err(GatewayError::from);
            }
        };

        Ok(Dispatched {
            status,
            headers: response_headers,
            body: Box::pin(body),
        })
    }
}
