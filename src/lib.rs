//! llmswitch - LLM Request Gateway Core
//!
//! Routes a logical model request to one of several upstream providers and
//! one of several API keys per provider, failing over across candidates with
//! weighted balancing, exponential-backoff cooldowns and key auto-disable.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

pub mod api;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod router;
pub mod store;
pub mod telemetry;

use api::relay::{self, RelayOutcome, RelayScopes};
use api::UsageRecorder;
use client::{Dispatcher, HttpDispatcher, RequestPayload};
use clock::{Clock, SystemClock};
use config::{ConfigLoader, GatewayConfig, ProviderStyle};
use error::{GatewayError, Result};
use router::{KeyPool, KeyPoolStats, Orchestrator, Routed};
use store::{MemoryStore, NewLink, ProviderId};
use tokio::io::AsyncWrite;
use tracing::info;

pub use error::GatewayError as Error;

/// The gateway facade
pub struct Gateway {
    /// Loaded configuration
    config: GatewayConfig,

    /// Provider ids by configured name
    provider_ids: HashMap<String, ProviderId>,

    store: Arc<MemoryStore>,
    clock: Arc<dyn Clock>,
    orchestrator: Orchestrator,
}

impl Gateway {
    /// Create a gateway from the default configuration locations
    pub async fn new() -> Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();
        let loader = ConfigLoader::new()?;
        Self::from_config(loader.into_config()).await
    }

    /// Create a gateway with a custom config path
    pub async fn with_config_path(path: impl AsRef<Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let loader = ConfigLoader::from_path(path)?;
        Self::from_config(loader.into_config()).await
    }

    /// Create a gateway from a config object, using the HTTP dispatcher
    pub async fn from_config(config: GatewayConfig) -> Result<Self> {
        let dispatcher = Arc::new(HttpDispatcher::from_config(&config.router)?);
        Self::with_parts(config, Arc::new(MemoryStore::new()), Arc::new(SystemClock), dispatcher).await
    }

    /// Create a gateway over explicit collaborators
    pub async fn with_parts(
        config: GatewayConfig,
        store: Arc<MemoryStore>,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Self> {
        let keys = KeyPool::new(store.clone(), clock.clone());
        let mut provider_ids = HashMap::new();

        let providers: BTreeMap<_, _> = config.providers.iter().collect();
        for (name, provider) in providers {
            let id = store.insert_provider(name, provider.clone());
            keys.sync_provider_keys(id, &provider.resolved_keys()).await?;
            provider_ids.insert(name.clone(), id);
        }

        let models: BTreeMap<_, _> = config.models.iter().collect();
        for (name, model) in models {
            let model_id = store.insert_model(name, model.strategy);
            for entry in &model.providers {
                let provider_id = *provider_ids.get(&entry.provider).ok_or_else(|| {
                    GatewayError::Config(format!(
                        "Model '{}' references unknown provider '{}'",
                        name, entry.provider
                    ))
                })?;
                store.insert_link(NewLink {
                    model_id,
                    provider_id,
                    provider_model: entry.model.clone(),
                    weight: entry.weight,
                    enabled: entry.enabled,
                    headers: entry.headers.clone(),
                });
            }
        }

        info!(
            providers = provider_ids.len(),
            models = config.models.len(),
            "gateway ready"
        );

        let orchestrator = Orchestrator::new(store.clone(), clock.clone(), dispatcher, config.router.clone());
        Ok(Self {
            config,
            provider_ids,
            store,
            clock,
            orchestrator,
        })
    }

    /// Route a request for a logical model
    pub async fn route(&self, model: &str, payload: &RequestPayload) -> Result<Routed> {
        self.orchestrator.route(model, payload).await
    }

    /// Stream a routed response to the caller while recording usage
    pub async fn relay<W>(&self, routed: Routed, caller: &mut W, scopes: RelayScopes) -> RelayOutcome
    where
        W: AsyncWrite + Unpin,
    {
        let recorder = Arc::new(UsageRecorder::new(
            self.store.clone(),
            self.clock.clone(),
            routed.handle,
        ));
        relay::stream(routed.response.body, caller, recorder, scopes).await
    }

    /// List configured models
    pub fn models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.config.models.keys().cloned().collect();
        models.sort();
        models
    }

    /// List configured providers
    pub fn providers(&self) -> Vec<String> {
        let mut providers: Vec<String> = self.provider_ids.keys().cloned().collect();
        providers.sort();
        providers
    }

    /// Get provider info
    pub async fn provider_info(&self, name: &str) -> Result<Option<ProviderInfo>> {
        let Some(id) = self.provider_ids.get(name) else {
            return Ok(None);
        };
        let Some(provider) = self.config.providers.get(name) else {
            return Ok(None);
        };

        Ok(Some(ProviderInfo {
            name: name.to_string(),
            base_url: provider.base_url(),
            style: provider.style(),
            keys: self.orchestrator.key_pool().stats(*id).await?,
        }))
    }

    /// Key administration for this gateway's providers
    pub fn key_pool(&self) -> &KeyPool {
        self.orchestrator.key_pool()
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

/// Provider information
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub name: String,
    pub base_url: String,
    pub style: ProviderStyle,
    pub keys: KeyPoolStats,
}
