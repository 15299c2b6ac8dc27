//! Router Module
//!
//! Candidate balancing, failure classification, cooldowns, key pools and the
//! orchestrator that ties them together.

pub mod balancer;
pub mod classifier;
pub mod cooldown;
pub mod key_pool;
pub mod orchestrator;

pub use balancer::{Balancer, BalancerError, BalancerKind, Lottery, Rotor, SmoothWeightedRR};
pub use classifier::Category;
pub use cooldown::{backoff, CooldownLevel, CooldownManager, CooldownWindow};
pub use key_pool::{KeyPool, KeyPoolStats, PickedKey};
pub use orchestrator::{AttemptHandle, Orchestrator, Routed};
