//! In-Memory Store
//!
//! `RwLock`-guarded tables implementing [`Store`]. Used by the [`crate::Gateway`]
//! facade when no external store is supplied, and by tests.

use super::{
    KeyFailure, KeyId, LinkId, ModelId, ModelProviderLink, ModelRecord, NewLink, NewProviderKey,
    ProviderId, ProviderKey, ProviderRecord, Store, UsageRecord,
};
use crate::config::ProviderConfig;
use crate::error::{GatewayError, Result};
use crate::router::balancer::BalancerKind;
use crate::router::cooldown::{CooldownLevel, CooldownWindow, MAX_STEP};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct Tables {
    next_id: u64,
    models: BTreeMap<ModelId, ModelRecord>,
    providers: BTreeMap<ProviderId, ProviderRecord>,
    links: BTreeMap<LinkId, ModelProviderLink>,
    keys: BTreeMap<KeyId, ProviderKey>,
    usage: Vec<UsageRecord>,
}

impl Tables {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn link_mut(&mut self, id: LinkId) -> Result<&mut ModelProviderLink> {
        self.links
            .get_mut(&id)
            .ok_or_else(|| GatewayError::NotFound(format!("association {}", id)))
    }

    fn key_mut(&mut self, id: KeyId) -> Result<&mut ProviderKey> {
        self.keys
            .get_mut(&id)
            .ok_or_else(|| GatewayError::NotFound(format!("provider key {}", id)))
    }
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,

    /// When set every call fails with `StoreUnavailable`
    unavailable: AtomicBool,

    /// When set only `touch_key` fails
    touch_unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable backend
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Simulate a backend that rejects `last_used_at` writes
    pub fn set_touch_unavailable(&self, unavailable: bool) {
        self.touch_unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Seeding and inspection
    // -------------------------------------------------------------------------

    /// Insert or replace a model by name
    pub fn insert_model(&self, name: &str, strategy: BalancerKind) -> ModelId {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.models.values_mut().find(|m| m.name == name) {
            existing.strategy = strategy;
            return existing.id;
        }
        let id = tables.next_id();
        tables.models.insert(
            id,
            ModelRecord {
                id,
                name: name.to_string(),
                strategy,
            },
        );
        id
    }

    /// Insert or replace a provider by name
    pub fn insert_provider(&self, name: &str, config: ProviderConfig) -> ProviderId {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.providers.values_mut().find(|p| p.name == name) {
            existing.config = config;
            return existing.id;
        }
        let id = tables.next_id();
        tables.providers.insert(
            id,
            ProviderRecord {
                id,
                name: name.to_string(),
                config,
            },
        );
        id
    }

    pub fn insert_link(&self, link: NewLink) -> LinkId {
        let mut tables = self.tables.write();
        let id = tables.next_id();
        tables.links.insert(
            id,
            ModelProviderLink {
                id,
                model_id: link.model_id,
                provider_id: link.provider_id,
                provider_model: link.provider_model,
                weight: link.weight,
                enabled: link.enabled,
                key_cooldown: CooldownWindow::default(),
                provider_cooldown: CooldownWindow::default(),
                headers: link.headers,
            },
        );
        id
    }

    /// Toggle an association (administrative)
    pub fn set_link_enabled(&self, id: LinkId, enabled: bool) -> Result<()> {
        let mut tables = self.tables.write();
        tables.link_mut(id)?.enabled = enabled;
        Ok(())
    }

    pub fn link(&self, id: LinkId) -> Option<ModelProviderLink> {
        self.tables.read().links.get(&id).cloned()
    }

    pub fn key_row(&self, id: KeyId) -> Option<ProviderKey> {
        self.tables.read().keys.get(&id).cloned()
    }

    pub fn model_names(&self) -> Vec<String> {
        self.tables
            .read()
            .models
            .values()
            .map(|m| m.name.clone())
            .collect()
    }

    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.tables.read().usage.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn model(&self, name: &str) -> Result<Option<ModelRecord>> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .models
            .values()
            .find(|m| m.name == name)
            .cloned())
    }

    async fn links_for_model(&self, model_id: ModelId) -> Result<Vec<ModelProviderLink>> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .links
            .values()
            .filter(|l| l.model_id == model_id && l.enabled)
            .cloned()
            .collect())
    }

    async fn provider(&self, id: ProviderId) -> Result<Option<ProviderRecord>> {
        self.check()?;
        Ok(self.tables.read().providers.get(&id).cloned())
    }

    async fn increment_link_step(&self, link: LinkId, level: CooldownLevel) -> Result<u32> {
        self.check()?;
        let mut tables = self.tables.write();
        let window = tables.link_mut(link)?.window_mut(level);
        window.step = (window.step + 1).min(MAX_STEP);
        Ok(window.step)
    }

    async fn set_link_cooldown(
        &self,
        link: LinkId,
        level: CooldownLevel,
        until: DateTime<Utc>,
    ) -> Result<()> {
        self.check()?;
        let mut tables = self.tables.write();
        tables.link_mut(link)?.window_mut(level).until = Some(until);
        Ok(())
    }

    async fn clear_link_cooldowns(&self, link: LinkId) -> Result<()> {
        self.check()?;
        let mut tables = self.tables.write();
        let row = tables.link_mut(link)?;
        row.key_cooldown.clear();
        row.provider_cooldown.clear();
        Ok(())
    }

    async fn first_available_key(
        &self,
        provider: ProviderId,
        now: DateTime<Utc>,
    ) -> Result<Option<ProviderKey>> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .keys
            .values()
            .filter(|k| k.provider_id == provider && k.is_available(now))
            .min_by_key(|k| (k.last_used_at.is_some(), k.last_used_at, k.id))
            .cloned())
    }

    async fn touch_key(&self, key: KeyId, at: DateTime<Utc>) -> Result<()> {
        self.check()?;
        if self.touch_unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::StoreUnavailable(
                "last_used_at writes rejected".to_string(),
            ));
        }
        let mut tables = self.tables.write();
        tables.key_mut(key)?.last_used_at = Some(at);
        Ok(())
    }

    async fn key(&self, key: KeyId) -> Result<Option<ProviderKey>> {
        self.check()?;
        Ok(self.tables.read().keys.get(&key).cloned())
    }

    async fn record_key_success(&self, key: KeyId) -> Result<()> {
        self.check()?;
        let mut tables = self.tables.write();
        let row = tables.key_mut(key)?;
        row.cooldown.clear();
        row.fail_count = 0;
        row.success_count += 1;
        Ok(())
    }

    async fn record_key_failure(&self, key: KeyId) -> Result<KeyFailure> {
        self.check()?;
        let mut tables = self.tables.write();
        let row = tables.key_mut(key)?;
        row.fail_count = row.fail_count.saturating_add(1);
        row.cooldown.step = (row.cooldown.step + 1).min(MAX_STEP);
        Ok(KeyFailure {
            fail_count: row.fail_count,
            step: row.cooldown.step,
        })
    }

    async fn set_key_cooldown(&self, key: KeyId, until: DateTime<Utc>) -> Result<()> {
        self.check()?;
        let mut tables = self.tables.write();
        tables.key_mut(key)?.cooldown.until = Some(until);
        Ok(())
    }

    async fn set_key_enabled(&self, key: KeyId, enabled: bool) -> Result<()> {
        self.check()?;
        let mut tables = self.tables.write();
        tables.key_mut(key)?.enabled = enabled;
        Ok(())
    }

    async fn keys_for_provider(&self, provider: ProviderId) -> Result<Vec<ProviderKey>> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .keys
            .values()
            .filter(|k| k.provider_id == provider)
            .cloned()
            .collect())
    }

    async fn insert_key(&self, key: NewProviderKey) -> Result<KeyId> {
        self.check()?;
        let mut tables = self.tables.write();
        if !tables.providers.contains_key(&key.provider_id) {
            return Err(GatewayError::ProviderNotFound(key.provider_id.to_string()));
        }
        let id = tables.next_id();
        tables.keys.insert(
            id,
            ProviderKey {
                id,
                provider_id: key.provider_id,
                secret: key.secret,
                remark: key.remark,
                enabled: key.enabled,
                cooldown: CooldownWindow::default(),
                success_count: 0,
                fail_count: 0,
                last_used_at: None,
            },
        );
        Ok(id)
    }

    async fn update_key_meta(&self, key: KeyId, remark: &str, enabled: bool) -> Result<()> {
        self.check()?;
        let mut tables = self.tables.write();
        let row = tables.key_mut(key)?;
        row.remark = remark.to_string();
        row.enabled = enabled;
        Ok(())
    }

    async fn insert_usage(&self, record: UsageRecord) -> Result<()> {
        self.check()?;
        self.tables.write().usage.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn seeded() -> (MemoryStore, ProviderId) {
        let store = MemoryStore::new();
        let provider = store.insert_provider("openai", ProviderConfig::openai("https://api.openai.com/v1"));
        (store, provider)
    }

    fn new_key(provider: ProviderId, secret: &str) -> NewProviderKey {
        NewProviderKey {
            provider_id: provider,
            secret: secret.to_string(),
            remark: String::new(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_first_available_prefers_never_used_then_oldest() {
        let (store, provider) = seeded();
        let k1 = store.insert_key(new_key(provider, "sk-1")).await.unwrap();
        let k2 = store.insert_key(new_key(provider, "sk-2")).await.unwrap();
        let k3 = store.insert_key(new_key(provider, "sk-3")).await.unwrap();

        let now = Utc::now();
        store.touch_key(k1, now - TimeDelta::seconds(10)).await.unwrap();
        store.touch_key(k2, now - TimeDelta::seconds(20)).await.unwrap();

        let picked = store.first_available_key(provider, now).await.unwrap().unwrap();
        assert_eq!(picked.id, k3);

        store.touch_key(k3, now).await.unwrap();
        let picked = store.first_available_key(provider, now).await.unwrap().unwrap();
        assert_eq!(picked.id, k2);
    }

    #[tokio::test]
    async fn test_first_available_skips_disabled_and_cooling() {
        let (store, provider) = seeded();
        let k1 = store.insert_key(new_key(provider, "sk-1")).await.unwrap();
        let k2 = store.insert_key(new_key(provider, "sk-2")).await.unwrap();
        let now = Utc::now();

        store.set_key_enabled(k1, false).await.unwrap();
        store.set_key_cooldown(k2, now + TimeDelta::seconds(5)).await.unwrap();
        assert!(store.first_available_key(provider, now).await.unwrap().is_none());

        let later = now + TimeDelta::seconds(6);
        let picked = store.first_available_key(provider, later).await.unwrap().unwrap();
        assert_eq!(picked.id, k2);
    }

    #[tokio::test]
    async fn test_counters() {
        let (store, provider) = seeded();
        let key = store.insert_key(new_key(provider, "sk-1")).await.unwrap();

        let first = store.record_key_failure(key).await.unwrap();
        assert_eq!(first, KeyFailure { fail_count: 1, step: 1 });
        let second = store.record_key_failure(key).await.unwrap();
        assert_eq!(second, KeyFailure { fail_count: 2, step: 2 });

        store.record_key_success(key).await.unwrap();
        let row = store.key_row(key).unwrap();
        assert_eq!(row.fail_count, 0);
        assert_eq!(row.cooldown, CooldownWindow::default());
        assert_eq!(row.success_count, 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let (store, provider) = seeded();
        store.set_unavailable(true);

        let err = store.model("gpt-4o").await.unwrap_err();
        assert!(matches!(err, GatewayError::StoreUnavailable(_)));
        assert!(store.first_available_key(provider, Utc::now()).await.is_err());

        store.set_unavailable(false);
        assert!(store.model("gpt-4o").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_rows() {
        let (store, _) = seeded();
        assert!(matches!(
            store.touch_key(99, Utc::now()).await,
            Err(GatewayError::NotFound(_))
        ));
        assert!(matches!(
            store.insert_key(new_key(42, "sk")).await,
            Err(GatewayError::ProviderNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_links_for_model_filters_disabled() {
        let (store, provider) = seeded();
        let model = store.insert_model("gpt-4o", BalancerKind::Rotor);
        let link = |enabled| NewLink {
            model_id: model,
            provider_id: provider,
            provider_model: "gpt-4o".to_string(),
            weight: 1,
            enabled,
            headers: BTreeMap::new(),
        };
        let on = store.insert_link(link(true));
        store.insert_link(link(false));

        let links = store.links_for_model(model).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].id, on);
    }
}
