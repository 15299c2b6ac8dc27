//! Cooldown Windows
//!
//! Exponential-backoff circuit breaking for model-provider associations.
//! The same window type and backoff schedule back the per-key cooldowns in
//! the key pool.

use crate::clock::Clock;
use crate::error::Result;
use crate::router::classifier::Category;
use crate::store::{ModelProviderLink, Store};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Highest step the backoff shift is computed for
pub const MAX_STEP: u32 = 20;

/// Ceiling of any single cooldown window
pub const MAX_BACKOFF: Duration = Duration::from_secs(30 * 60);

/// Cooldown length for a failure step: 1s at step 1, doubling, capped at 30 minutes
pub fn backoff(step: u32) -> Duration {
    if step == 0 {
        return Duration::from_secs(1);
    }
    let step = step.min(MAX_STEP);
    Duration::from_secs(1u64 << (step - 1)).min(MAX_BACKOFF)
}

/// Which of an association's two windows a failure lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CooldownLevel {
    Key,
    Provider,
}

/// A cooldown deadline plus the failure step that produced it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CooldownWindow {
    pub until: Option<DateTime<Utc>>,
    pub step: u32,
}

impl CooldownWindow {
    /// Time left before the window lapses, zero when not cooling
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        match self.until {
            Some(until) if until > now => (until - now).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.remaining(now).is_zero()
    }

    /// Record one more failure at `step`, opening a window from `now`
    pub fn open(&mut self, step: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let until = deadline(now, step);
        self.step = step;
        self.until = Some(until);
        until
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// `now + backoff(step)`
pub fn deadline(now: DateTime<Utc>, step: u32) -> DateTime<Utc> {
    let delay = TimeDelta::from_std(backoff(step))
        .unwrap_or_else(|_| TimeDelta::seconds(MAX_BACKOFF.as_secs() as i64));
    now + delay
}

/// Tracks key-level and provider-level windows of associations
pub struct CooldownManager {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl CooldownManager {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Whether either window currently blocks the association
    pub fn in_cooldown(&self, link: &ModelProviderLink) -> bool {
        !self.cooldown_left(link).is_zero()
    }

    /// The longer of the two windows' remaining time
    pub fn cooldown_left(&self, link: &ModelProviderLink) -> Duration {
        let now = self.clock.now();
        [CooldownLevel::Key, CooldownLevel::Provider]
            .into_iter()
            .map(|level| link.window(level).remaining(now))
            .max()
            .unwrap_or_default()
    }

    /// Clear both windows after a successful attempt
    pub async fn on_success(&self, link: &mut ModelProviderLink) -> Result<()> {
        link.key_cooldown.clear();
        link.provider_cooldown.clear();
        self.store.clear_link_cooldowns(link.id).await
    }

    /// Open the window matching the failure category; other categories are ignored
    pub async fn on_error(&self, link: &mut ModelProviderLink, category: Category) -> Result<()> {
        let Some(level) = category.cooldown_level() else {
            debug!(link = link.id, ?category, "no cooldown for category");
            return Ok(());
        };

        let step = self.store.increment_link_step(link.id, level).await?;
        let until = link.window_mut(level).open(step, self.clock.now());
        self.store.set_link_cooldown(link.id, level, until).await?;

        warn!(
            link = link.id,
            provider = link.provider_id,
            ?level,
            step,
            cooldown_secs = backoff(step).as_secs(),
            "association cooling down"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::router::balancer::BalancerKind;
    use crate::store::MemoryStore;

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(2), Duration::from_secs(2));
        assert_eq!(backoff(3), Duration::from_secs(4));
        assert_eq!(backoff(11), Duration::from_secs(1024));
        assert_eq!(backoff(12), MAX_BACKOFF);
        assert_eq!(backoff(MAX_STEP), MAX_BACKOFF);
        assert_eq!(backoff(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn test_backoff_non_decreasing() {
        let mut previous = Duration::ZERO;
        for step in 1..=64 {
            let current = backoff(step);
            assert!(current >= previous, "step {} went backwards", step);
            assert!(current <= MAX_BACKOFF);
            previous = current;
        }
    }

    #[test]
    fn test_window_remaining() {
        let now = Utc::now();
        let mut window = CooldownWindow::default();
        assert!(!window.is_active(now));

        window.open(3, now);
        assert_eq!(window.step, 3);
        assert_eq!(window.remaining(now), Duration::from_secs(4));
        assert!(!window.is_active(now + TimeDelta::seconds(4)));

        window.clear();
        assert_eq!(window, CooldownWindow::default());
    }

    async fn setup() -> (Arc<MemoryStore>, Arc<ManualClock>, ModelProviderLink) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let model = store.insert_model("gpt-4o", BalancerKind::Lottery);
        let provider = store.insert_provider("openai", crate::config::ProviderConfig::openai("https://api.openai.com/v1"));
        let link_id = store.insert_link(crate::store::NewLink {
            model_id: model,
            provider_id: provider,
            provider_model: "gpt-4o".to_string(),
            weight: 1,
            enabled: true,
            headers: Default::default(),
        });
        let link = store.link(link_id).expect("link was just inserted");
        (store, clock, link)
    }

    #[tokio::test]
    async fn test_provider_fault_cools_for_one_second() {
        let (store, clock, mut link) = setup().await;
        let manager = CooldownManager::new(store.clone(), clock.clone());

        assert!(!manager.in_cooldown(&link));
        manager.on_error(&mut link, Category::Provider).await.unwrap();

        assert_eq!(link.provider_cooldown.step, 1);
        assert!(manager.in_cooldown(&link));
        assert_eq!(manager.cooldown_left(&link), Duration::from_secs(1));

        let persisted = store.link(link.id).unwrap();
        assert_eq!(persisted.provider_cooldown, link.provider_cooldown);

        clock.advance(Duration::from_secs(1));
        assert!(!manager.in_cooldown(&link));
    }

    #[tokio::test]
    async fn test_cooldown_left_is_max_of_windows() {
        let (store, clock, mut link) = setup().await;
        let manager = CooldownManager::new(store, clock.clone());

        manager.on_error(&mut link, Category::Key).await.unwrap();
        manager.on_error(&mut link, Category::Key).await.unwrap();
        manager.on_error(&mut link, Category::Provider).await.unwrap();

        assert_eq!(link.key_cooldown.step, 2);
        assert_eq!(manager.cooldown_left(&link), Duration::from_secs(2));

        clock.advance(Duration::from_millis(1500));
        assert_eq!(manager.cooldown_left(&link), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_client_and_none_are_noops() {
        let (store, clock, mut link) = setup().await;
        let manager = CooldownManager::new(store.clone(), clock);

        manager.on_error(&mut link, Category::Client).await.unwrap();
        manager.on_error(&mut link, Category::None).await.unwrap();

        assert!(!manager.in_cooldown(&link));
        assert_eq!(store.link(link.id).unwrap().key_cooldown, CooldownWindow::default());
    }

    #[tokio::test]
    async fn test_success_clears_both_windows() {
        let (store, clock, mut link) = setup().await;
        let manager = CooldownManager::new(store.clone(), clock);

        manager.on_error(&mut link, Category::Key).await.unwrap();
        manager.on_error(&mut link, Category::Provider).await.unwrap();
        manager.on_success(&mut link).await.unwrap();

        assert!(!manager.in_cooldown(&link));
        let persisted = store.link(link.id).unwrap();
        assert_eq!(persisted.key_cooldown, CooldownWindow::default());
        assert_eq!(persisted.provider_cooldown, CooldownWindow::default());
    }

    #[tokio::test]
    async fn test_step_saturates() {
        let (store, clock, mut link) = setup().await;
        let manager = CooldownManager::new(store, clock);

        for _ in 0..30 {
            manager.on_error(&mut link, Category::Provider).await.unwrap();
        }
        assert_eq!(link.provider_cooldown.step, MAX_STEP);
        assert_eq!(manager.cooldown_left(&link), MAX_BACKOFF);
    }
}
