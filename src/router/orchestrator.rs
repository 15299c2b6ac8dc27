//! Request Orchestrator
//!
//! Drives one routed request: filters the model's associations, builds a
//! fresh balancer over them, and walks candidates until one succeeds, the
//! request is rejected as a client error, or no candidate is left.

use crate::client::{ByteStream, Dispatched, Dispatcher, RequestPayload};
use crate::clock::Clock;
use crate::config::RouterConfig;
use crate::error::{GatewayError, Result};
use crate::router::classifier::Category;
use crate::router::cooldown::CooldownManager;
use crate::router::key_pool::KeyPool;
use crate::store::{KeyId, LinkId, ModelProviderLink, ProviderId, ProviderRecord, Store};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bookkeeping for the attempt that produced the response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptHandle {
    pub model: String,
    pub link_id: LinkId,
    pub provider_id: ProviderId,
    pub key_id: KeyId,

    /// Dispatches made for this request, the winning one included
    pub attempts: u32,
    pub status: u16,
    pub started_at: DateTime<Utc>,
}

/// A successful route
#[derive(Debug)]
pub struct Routed {
    pub response: Dispatched,
    pub handle: AttemptHandle,
}

/// Routes requests across a model's providers and keys
pub struct Orchestrator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    cooldown: CooldownManager,
    keys: KeyPool,
    dispatcher: Arc<dyn Dispatcher>,
    config: RouterConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<dyn Dispatcher>,
        config: RouterConfig,
    ) -> Self {
        Self {
            cooldown: CooldownManager::new(store.clone(), clock.clone()),
            keys: KeyPool::new(store.clone(), clock.clone()),
            store,
            clock,
            dispatcher,
            config,
        }
    }

    pub fn key_pool(&self) -> &KeyPool {
        &self.keys
    }

    pub fn cooldown(&self) -> &CooldownManager {
        &self.cooldown
    }

    /// Route a request for `model`
    pub async fn route(&self, model: &str, payload: &RequestPayload) -> Result<Routed> {
        let started_at = self.clock.now();
        let record = self
            .store
            .model(model)
            .await?
            .ok_or_else(|| GatewayError::ModelNotFound(model.to_string()))?;

        let mut links: BTreeMap<LinkId, ModelProviderLink> = self
            .store
            .links_for_model(record.id)
            .await?
            .into_iter()
            .filter(|link| !self.cooldown.in_cooldown(link))
            .map(|link| (link.id, link))
            .collect();

        if links.is_empty() {
            warn!(model, "no eligible association");
            return Err(GatewayError::Exhausted {
                model: model.to_string(),
                last_error: None,
            });
        }

        let mut balancer = record
            .strategy
            .build(links.values().map(|link| (link.id, link.weight)));
        let mut providers: HashMap<ProviderId, ProviderRecord> = HashMap::new();
        let mut last_error: Option<String> = None;
        let mut attempts: u32 = 0;

        debug!(model, strategy = %record.strategy, candidates = balancer.len(), "routing");

        loop {
            if let Some(max) = self.config.max_attempts {
                if attempts >= max {
                    debug!(model, attempts, "attempt limit reached");
                    break;
                }
            }

            let link_id = match balancer.pop() {
                Ok(id) => id,
                Err(e) => {
                    debug!(model, reason = %e, "balancer drained");
                    break;
                }
            };
            let Some(link) = links.get_mut(&link_id) else {
                balancer.delete(link_id);
                continue;
            };

            let cached = providers.get(&link.provider_id).cloned();
            let provider = match cached {
                Some(provider) => provider,
                None => match self.store.provider(link.provider_id).await? {
                    Some(provider) => {
                        providers.insert(provider.id, provider.clone());
                        provider
                    }
                    None => {
                        let err = GatewayError::ProviderNotFound(link.provider_id.to_string());
                        warn!(model, link = link_id, error = %err, "association points at missing provider");
                        last_error = Some(err.to_string());
                        balancer.delete(link_id);
                        continue;
                    }
                },
            };

            let key = match self.keys.pick(provider.id).await {
                Ok(key) => key,
                Err(err @ GatewayError::NoAvailableKey(_)) => {
                    debug!(model, provider = %provider.name, "no eligible key");
                    last_error = Some(err.to_string());
                    balancer.delete(link_id);
                    continue;
                }
                Err(e) => return Err(e),
            };

            attempts += 1;
            let response = match self.dispatcher.dispatch(&provider, link, &key, payload).await {
                Ok(response) => response,
                Err(err) if err.is_retryable() => {
                    warn!(
                        model,
                        provider = %provider.name,
                        key = %key.hint,
                        error = %err,
                        "transport failure"
                    );
                    last_error = Some(err.to_string());
                    self.cooldown.on_error(link, Category::Provider).await?;
                    balancer.delete(link_id);
                    continue;
                }
                Err(err) => {
                    warn!(model, provider = %provider.name, error = %err, "dispatch failed");
                    return Err(err);
                }
            };

            let status = response.status;
            match Category::from_status(status) {
                Category::None => {
                    self.cooldown.on_success(link).await?;
                    self.keys.on_success(key.id).await?;
                    info!(
                        model,
                        provider = %provider.name,
                        key = %key.hint,
                        status,
                        attempts,
                        "request routed"
                    );
                    return Ok(Routed {
                        response,
                        handle: AttemptHandle {
                            model: model.to_string(),
                            link_id,
                            provider_id: provider.id,
                            key_id: key.id,
                            attempts,
                            status,
                            started_at,
                        },
                    });
                }
                Category::Client => {
                    let body = read_error_body(response.body, self.config.error_body_limit).await;
                    warn!(model, provider = %provider.name, status, "client error");
                    return Err(GatewayError::ClientError { status, body });
                }
                Category::Key => {
                    let body = read_error_body(response.body, self.config.error_body_limit).await;
                    warn!(model, provider = %provider.name, key = %key.hint, status, "key rejected");
                    last_error = Some(format!("status {} from {}: {}", status, provider.name, body));

                    self.keys.on_error(key.id, Category::Key).await?;
                    if self.keys.has_available(provider.id).await? {
                        balancer.reduce(link_id);
                    } else {
                        self.cooldown.on_error(link, Category::Key).await?;
                        balancer.delete(link_id);
                    }
                }
                Category::Provider => {
                    let body = read_error_body(response.body, self.config.error_body_limit).await;
                    warn!(model, provider = %provider.name, status, "provider fault");
                    last_error = Some(format!("status {} from {}: {}", status, provider.name, body));

                    self.cooldown.on_error(link, Category::Provider).await?;
                    balancer.delete(link_id);
                }
            }
        }

        warn!(model, attempts, last_error = ?last_error, "all candidates exhausted");
        Err(GatewayError::Exhausted {
            model: model.to_string(),
            last_error,
        })
    }
}

/// Read at most `limit` bytes of an error body; read failures end it early
async fn read_error_body(mut body: ByteStream, limit: usize) -> String {
    let mut buf: Vec<u8> = Vec::new();
    while buf.len() < limit {
        match body.next().await {
            Some(Ok(chunk)) => {
                let take = chunk.len().min(limit - buf.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            Some(Err(e)) => {
                debug!(error = %e, "error body read failed");
                break;
            }
            None => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}
