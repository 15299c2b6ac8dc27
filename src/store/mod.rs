//! Store Module
//!
//! Row types shared by the routing engine and the persistence contract it
//! reads and writes through. Cooldown windows, key counters and enabled flags
//! live here, not in process memory, so every request sees the same state.
//!
//! Concurrent writers are resolved last-write-wins per row. Counters that
//! several requests may bump at once (step, fail and success counts) are
//! incremented by the store itself and the new value handed back, which keeps
//! the read-modify-write window as small as the backend allows.

pub mod memory;

pub use memory::MemoryStore;

use crate::config::ProviderConfig;
use crate::error::Result;
use crate::router::balancer::BalancerKind;
use crate::router::cooldown::{CooldownLevel, CooldownWindow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub type ModelId = u64;
pub type ProviderId = u64;
pub type LinkId = u64;
pub type KeyId = u64;

/// A logical model callers ask for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRecord {
    pub id: ModelId,
    pub name: String,
    pub strategy: BalancerKind,
}

/// A concrete upstream provider
#[derive(Debug, Clone)]
pub struct ProviderRecord {
    pub id: ProviderId,
    pub name: String,
    pub config: ProviderConfig,
}

/// Association between a logical model and one provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelProviderLink {
    pub id: LinkId,
    pub model_id: ModelId,
    pub provider_id: ProviderId,

    /// Model name sent upstream
    pub provider_model: String,

    /// Selection weight; zero is never selectable
    pub weight: u32,
    pub enabled: bool,

    /// Window opened by credential-attributable failures
    pub key_cooldown: CooldownWindow,

    /// Window opened by upstream server faults
    pub provider_cooldown: CooldownWindow,

    /// Extra headers sent with every request through this association
    pub headers: BTreeMap<String, String>,
}

impl ModelProviderLink {
    pub fn window(&self, level: CooldownLevel) -> &CooldownWindow {
        match level {
            CooldownLevel::Key => &self.key_cooldown,
            CooldownLevel::Provider => &self.provider_cooldown,
        }
    }

    pub fn window_mut(&mut self, level: CooldownLevel) -> &mut CooldownWindow {
        match level {
            CooldownLevel::Key => &mut self.key_cooldown,
            CooldownLevel::Provider => &mut self.provider_cooldown,
        }
    }
}

/// Fields needed to create an association
#[derive(Debug, Clone)]
pub struct NewLink {
    pub model_id: ModelId,
    pub provider_id: ProviderId,
    pub provider_model: String,
    pub weight: u32,
    pub enabled: bool,
    pub headers: BTreeMap<String, String>,
}

/// One credential belonging to a provider
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderKey {
    pub id: KeyId,
    pub provider_id: ProviderId,
    pub secret: String,
    pub remark: String,
    pub enabled: bool,
    pub cooldown: CooldownWindow,
    pub success_count: u64,

    /// Consecutive failures since the last success
    pub fail_count: u32,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ProviderKey {
    /// Loggable identifier that never exposes the secret
    pub fn hint(&self) -> String {
        if !self.remark.is_empty() {
            return self.remark.clone();
        }
        let tail: String = self
            .secret
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("...{}", tail)
    }

    /// Enabled and outside its cooldown window
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.enabled && !self.cooldown.is_active(now)
    }
}

impl std::fmt::Debug for ProviderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderKey")
            .field("id", &self.id)
            .field("provider_id", &self.provider_id)
            .field("secret", &self.hint())
            .field("enabled", &self.enabled)
            .field("cooldown", &self.cooldown)
            .field("success_count", &self.success_count)
            .field("fail_count", &self.fail_count)
            .field("last_used_at", &self.last_used_at)
            .finish()
    }
}

/// Fields needed to create a key
#[derive(Debug, Clone)]
pub struct NewProviderKey {
    pub provider_id: ProviderId,
    pub secret: String,
    pub remark: String,
    pub enabled: bool,
}

/// Counters after a key-level failure was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyFailure {
    pub fail_count: u32,
    pub step: u32,
}

/// One accounted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub model: String,
    pub link_id: LinkId,
    pub provider_id: ProviderId,
    pub key_id: KeyId,
    pub attempts: u32,
    pub status: u16,
    pub bytes: u64,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Persistence contract of the routing engine
#[async_trait]
pub trait Store: Send + Sync {
    async fn model(&self, name: &str) -> Result<Option<ModelRecord>>;

    /// Enabled associations of a model, cooldown state included
    async fn links_for_model(&self, model_id: ModelId) -> Result<Vec<ModelProviderLink>>;

    async fn provider(&self, id: ProviderId) -> Result<Option<ProviderRecord>>;

    /// Bump a cooldown step (saturating at the backoff cap) and return the new value
    async fn increment_link_step(&self, link: LinkId, level: CooldownLevel) -> Result<u32>;

    async fn set_link_cooldown(
        &self,
        link: LinkId,
        level: CooldownLevel,
        until: DateTime<Utc>,
    ) -> Result<()>;

    /// Reset both windows and both steps
    async fn clear_link_cooldowns(&self, link: LinkId) -> Result<()>;

    /// The enabled, non-cooling key used least recently (never-used first)
    async fn first_available_key(
        &self,
        provider: ProviderId,
        now: DateTime<Utc>,
    ) -> Result<Option<ProviderKey>>;

    async fn touch_key(&self, key: KeyId, at: DateTime<Utc>) -> Result<()>;

    async fn key(&self, key: KeyId) -> Result<Option<ProviderKey>>;

    /// Clear cooldown and fail count, then add one to the success count
    async fn record_key_success(&self, key: KeyId) -> Result<()>;

    /// Add one to the fail count and the cooldown step, returning both
    async fn record_key_failure(&self, key: KeyId) -> Result<KeyFailure>;

    async fn set_key_cooldown(&self, key: KeyId, until: DateTime<Utc>) -> Result<()>;

    async fn set_key_enabled(&self, key: KeyId, enabled: bool) -> Result<()>;

    async fn keys_for_provider(&self, provider: ProviderId) -> Result<Vec<ProviderKey>>;

    async fn insert_key(&self, key: NewProviderKey) -> Result<KeyId>;

    async fn update_key_meta(&self, key: KeyId, remark: &str, enabled: bool) -> Result<()>;

    async fn insert_usage(&self, record: UsageRecord) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(secret: &str, remark: &str) -> ProviderKey {
        ProviderKey {
            id: 1,
            provider_id: 1,
            secret: secret.to_string(),
            remark: remark.to_string(),
            enabled: true,
            cooldown: CooldownWindow::default(),
            success_count: 0,
            fail_count: 0,
            last_used_at: None,
        }
    }

    #[test]
    fn test_key_hint_hides_secret() {
        assert_eq!(key("sk-abcdef123456", "").hint(), "...3456");
        assert_eq!(key("sk-abcdef123456", "team-a").hint(), "team-a");

        let debug = format!("{:?}", key("sk-abcdef123456", ""));
        assert!(!debug.contains("sk-abcdef"));
    }

    #[test]
    fn test_key_availability() {
        let now = Utc::now();
        let mut k = key("sk-1", "");
        assert!(k.is_available(now));

        k.cooldown.until = Some(now + chrono::Duration::seconds(5));
        assert!(!k.is_available(now));
        assert!(k.is_available(now + chrono::Duration::seconds(6)));

        k.cooldown.until = None;
        k.enabled = false;
        assert!(!k.is_available(now));
    }
}
