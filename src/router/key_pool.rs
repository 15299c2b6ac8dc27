//! API Key Pool Management
//!
//! Selects provider credentials least-recently-used first and tracks their
//! cooldown and failure state in the store.

use crate::clock::Clock;
use crate::config::KeyConfig;
use crate::error::{GatewayError, Result};
use crate::router::classifier::Category;
use crate::router::cooldown::deadline;
use crate::store::{KeyId, NewProviderKey, ProviderId, ProviderKey, Store};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Consecutive key failures after which a key is switched off
pub const AUTO_DISABLE_THRESHOLD: u32 = 3;

/// A credential resolved for one attempt
#[derive(Clone)]
pub struct PickedKey {
    pub id: KeyId,
    pub secret: String,

    /// Loggable identifier
    pub hint: String,
}

impl std::fmt::Debug for PickedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PickedKey")
            .field("id", &self.id)
            .field("hint", &self.hint)
            .finish()
    }
}

impl From<ProviderKey> for PickedKey {
    fn from(key: ProviderKey) -> Self {
        let hint = key.hint();
        Self {
            id: key.id,
            secret: key.secret,
            hint,
        }
    }
}

/// Store-backed pool over every provider's keys
#[derive(Clone)]
pub struct KeyPool {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl KeyPool {
    /// Create a new key pool
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Get the least recently used eligible key of a provider
    pub async fn pick(&self, provider: ProviderId) -> Result<PickedKey> {
        let now = self.clock.now();
        let key = self
            .store
            .first_available_key(provider, now)
            .await?
            .ok_or_else(|| GatewayError::NoAvailableKey(provider.to_string()))?;

        if let Err(e) = self.store.touch_key(key.id, now).await {
            warn!(key = key.id, error = %e, "failed to record key usage");
        }

        debug!(provider, key = key.id, hint = %key.hint(), "picked key");
        Ok(key.into())
    }

    /// Check whether the provider still has an eligible key
    pub async fn has_available(&self, provider: ProviderId) -> Result<bool> {
        let now = self.clock.now();
        Ok(self.store.first_available_key(provider, now).await?.is_some())
    }

    /// Clear cooldown and fail count, count one success
    pub async fn on_success(&self, key: KeyId) -> Result<()> {
        self.store.record_key_success(key).await
    }

    /// Record a failed attempt; only credential failures touch the key
    pub async fn on_error(&self, key: KeyId, category: Category) -> Result<()> {
        if category != Category::Key {
            return Ok(());
        }

        let failure = self.store.record_key_failure(key).await?;
        let until = deadline(self.clock.now(), failure.step);
        self.store.set_key_cooldown(key, until).await?;

        if failure.fail_count >= AUTO_DISABLE_THRESHOLD {
            self.store.set_key_enabled(key, false).await?;
            warn!(
                key,
                fail_count = failure.fail_count,
                "key disabled after repeated failures"
            );
        } else {
            warn!(
                key,
                fail_count = failure.fail_count,
                step = failure.step,
                "key cooling down"
            );
        }
        Ok(())
    }

    /// Administrative switch; the only way back from auto-disable
    pub async fn set_enabled(&self, key: KeyId, enabled: bool) -> Result<()> {
        self.store.set_key_enabled(key, enabled).await?;
        info!(key, enabled, "key enabled flag changed");
        Ok(())
    }

    /// Reconcile configured keys with the stored ones, matching by secret
    pub async fn sync_provider_keys(&self, provider: ProviderId, configured: &[KeyConfig]) -> Result<()> {
        let existing = self.store.keys_for_provider(provider).await?;

        for key in configured {
            if key.key.is_empty() {
                continue;
            }

            let outcome = match existing.iter().find(|row| row.secret == key.key) {
                Some(row) => self
                    .store
                    .update_key_meta(row.id, &key.remark, key.enabled)
                    .await
                    .map(|_| row.id),
                None => {
                    self.store
                        .insert_key(NewProviderKey {
                            provider_id: provider,
                            secret: key.key.clone(),
                            remark: key.remark.clone(),
                            enabled: key.enabled,
                        })
                        .await
                }
            };

            match outcome {
                Ok(id) => debug!(provider, key = id, "synced key"),
                Err(e) => warn!(provider, remark = %key.remark, error = %e, "failed to sync key"),
            }
        }
        Ok(())
    }

    /// Get statistics about a provider's keys
    pub async fn stats(&self, provider: ProviderId) -> Result<KeyPoolStats> {
        let now = self.clock.now();
        let keys = self.store.keys_for_provider(provider).await?;

        Ok(KeyPoolStats {
            total_keys: keys.len(),
            available_keys: keys.iter().filter(|k| k.is_available(now)).count(),
            cooling_keys: keys
                .iter()
                .filter(|k| k.enabled && k.cooldown.is_active(now))
                .count(),
            disabled_keys: keys.iter().filter(|k| !k.enabled).count(),
            total_successes: keys.iter().map(|k| k.success_count).sum(),
        })
    }
}

/// Statistics about a key pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPoolStats {
    pub total_keys: usize,
    pub available_keys: usize,
    pub cooling_keys: usize,
    pub disabled_keys: usize,
    pub total_successes: u64,
}
