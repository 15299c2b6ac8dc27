//! Candidate Balancers
//!
//! Strategies for choosing among the eligible associations of a model. A
//! balancer is built fresh for every routed request from the associations
//! that passed the enabled/cooldown filter, and is dropped with the request.
//!
//! - [`Lottery`]: weighted random draw, `reduce` shaves a third off the weight
//! - [`Rotor`]: fixed queue ordered by descending weight, `reduce` rotates to the tail
//! - [`SmoothWeightedRR`]: smooth weighted round-robin, `reduce` shaves weight and resyncs

use crate::store::LinkId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

/// Why a balancer could not produce a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BalancerError {
    #[error("no candidates left")]
    Empty,

    #[error("total candidate weight must be greater than 0")]
    NoWeight,
}

/// Request-scoped candidate selection
pub trait Balancer: Send {
    /// Select the next candidate without consuming it
    fn pop(&mut self) -> Result<LinkId, BalancerError>;

    /// Remove a candidate for the rest of this request
    fn delete(&mut self, id: LinkId);

    /// De-prioritize a candidate after a failed attempt
    fn reduce(&mut self, id: LinkId);

    /// Number of candidates still held
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Balancing strategy configured per model
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BalancerKind {
    /// Weighted random draw
    #[default]
    #[serde(rename = "lottery")]
    Lottery,

    /// Round-robin in descending weight order
    #[serde(rename = "rotor")]
    Rotor,

    /// Smooth weighted round-robin
    #[serde(rename = "smooth_weighted_rr")]
    SmoothWeightedRR,
}

impl BalancerKind {
    /// Build a fresh balancer over `(id, weight)` entries; zero weights are dropped
    pub fn build<I>(self, items: I) -> Box<dyn Balancer>
    where
        I: IntoIterator<Item = (LinkId, u32)>,
    {
        let items: Vec<(LinkId, u32)> = items.into_iter().filter(|(_, w)| *w > 0).collect();
        match self {
            BalancerKind::Lottery => Box::new(Lottery::new(items)),
            BalancerKind::Rotor => Box::new(Rotor::new(items)),
            BalancerKind::SmoothWeightedRR => Box::new(SmoothWeightedRR::new(items)),
        }
    }
}

impl std::fmt::Display for BalancerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BalancerKind::Lottery => "lottery",
            BalancerKind::Rotor => "rotor",
            BalancerKind::SmoothWeightedRR => "smooth_weighted_rr",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Lottery
// =============================================================================

/// Weighted random draw
pub struct Lottery {
    entries: Vec<(LinkId, u32)>,
    rng: StdRng,
}

impl Lottery {
    pub fn new(items: Vec<(LinkId, u32)>) -> Self {
        Self::with_rng(items, StdRng::from_entropy())
    }

    /// Use a caller-provided generator (seeded in tests)
    pub fn with_rng(items: Vec<(LinkId, u32)>, rng: StdRng) -> Self {
        Self {
            entries: items.into_iter().filter(|(_, w)| *w > 0).collect(),
            rng,
        }
    }
}

impl Balancer for Lottery {
    fn pop(&mut self) -> Result<LinkId, BalancerError> {
        if self.entries.is_empty() {
            return Err(BalancerError::Empty);
        }
        let total: u64 = self.entries.iter().map(|(_, w)| u64::from(*w)).sum();
        if total == 0 {
            return Err(BalancerError::NoWeight);
        }

        let mut draw = self.rng.gen_range(0..total);
        for (id, weight) in &self.entries {
            let weight = u64::from(*weight);
            if draw < weight {
                return Ok(*id);
            }
            draw -= weight;
        }
        Err(BalancerError::NoWeight)
    }

    fn delete(&mut self, id: LinkId) {
        self.entries.retain(|(entry, _)| *entry != id);
    }

    fn reduce(&mut self, id: LinkId) {
        if let Some((_, weight)) = self.entries.iter_mut().find(|(entry, _)| *entry == id) {
            *weight -= *weight / 3;
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// =============================================================================
// Rotor
// =============================================================================

/// Round-robin queue; weight only decides the starting order
pub struct Rotor {
    queue: VecDeque<LinkId>,
}

impl Rotor {
    pub fn new(mut items: Vec<(LinkId, u32)>) -> Self {
        items.retain(|(_, w)| *w > 0);
        // Stable: equal weights keep their input order
        items.sort_by(|a, b| b.1.cmp(&a.1));
        Self {
            queue: items.into_iter().map(|(id, _)| id).collect(),
        }
    }
}

impl Balancer for Rotor {
    fn pop(&mut self) -> Result<LinkId, BalancerError> {
        self.queue.front().copied().ok_or(BalancerError::Empty)
    }

    fn delete(&mut self, id: LinkId) {
        if let Some(pos) = self.queue.iter().position(|entry| *entry == id) {
            self.queue.remove(pos);
        }
    }

    fn reduce(&mut self, id: LinkId) {
        if let Some(pos) = self.queue.iter().position(|entry| *entry == id) {
            if let Some(entry) = self.queue.remove(pos) {
                self.queue.push_back(entry);
            }
        }
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

// =============================================================================
// Smooth weighted round-robin
// =============================================================================

#[derive(Debug, Clone)]
struct SmoothItem {
    id: LinkId,
    weight: i64,
    current: i64,
}

/// Smooth weighted round-robin: each entry is picked `weight` times per
/// `total` picks, interleaved rather than in bursts
pub struct SmoothWeightedRR {
    items: Vec<SmoothItem>,
    total: i64,
}

impl SmoothWeightedRR {
    pub fn new(items: Vec<(LinkId, u32)>) -> Self {
        let mut rr = Self {
            items: items
                .into_iter()
                .filter(|(_, w)| *w > 0)
                .map(|(id, weight)| SmoothItem {
                    id,
                    weight: i64::from(weight),
                    current: 0,
                })
                .collect(),
            total: 0,
        };
        rr.recompute(true);
        rr
    }

    fn recompute(&mut self, reset_current: bool) {
        self.total = 0;
        for item in &mut self.items {
            if reset_current {
                item.current = 0;
            }
            self.total += item.weight;
        }
    }
}

impl Balancer for SmoothWeightedRR {
    fn pop(&mut self) -> Result<LinkId, BalancerError> {
        if self.items.is_empty() {
            return Err(BalancerError::Empty);
        }
        if self.total <= 0 {
            return Err(BalancerError::NoWeight);
        }

        // Ties go to the first item seen
        let mut picked: Option<usize> = None;
        for idx in 0..self.items.len() {
            self.items[idx].current += self.items[idx].weight;
            match picked {
                Some(best) if self.items[idx].current <= self.items[best].current => {}
                _ => picked = Some(idx),
            }
        }

        let idx = picked.ok_or(BalancerError::Empty)?;
        self.items[idx].current -= self.total;
        Ok(self.items[idx].id)
    }

    fn delete(&mut self, id: LinkId) {
        self.items.retain(|item| item.id != id);
        self.recompute(false);
    }

    fn reduce(&mut self, id: LinkId) {
        if let Some(item) = self.items.iter_mut().find(|item| item.id == id) {
            item.weight = (item.weight - item.weight / 3).max(1);
        }
        self.recompute(true);
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const A: LinkId = 1;
    const B: LinkId = 2;
    const C: LinkId = 3;

    fn counts(balancer: &mut dyn Balancer, picks: usize) -> HashMap<LinkId, usize> {
        let mut seen = HashMap::new();
        for _ in 0..picks {
            *seen.entry(balancer.pop().unwrap()).or_default() += 1;
        }
        seen
    }

    #[test]
    fn test_swrr_frequencies() {
        let mut rr = SmoothWeightedRR::new(vec![(A, 5), (B, 3), (C, 2)]);
        let seen = counts(&mut rr, 10_000);

        for (id, expected) in [(A, 0.5), (B, 0.3), (C, 0.2)] {
            let observed = seen[&id] as f64 / 10_000.0;
            assert!(
                (observed - expected).abs() < 0.01,
                "id {} observed {} expected {}",
                id,
                observed,
                expected
            );
        }
    }

    #[test]
    fn test_swrr_interleaves() {
        let mut rr = SmoothWeightedRR::new(vec![(A, 5), (B, 1), (C, 1)]);
        let order: Vec<_> = (0..7).map(|_| rr.pop().unwrap()).collect();
        assert_eq!(order, vec![A, A, B, A, C, A, A]);
    }

    #[test]
    fn test_swrr_never_starves() {
        let mut rr = SmoothWeightedRR::new(vec![(A, 7), (B, 2), (C, 1)]);
        let picks: Vec<_> = (0..200).map(|_| rr.pop().unwrap()).collect();

        for window in picks.windows(10) {
            for id in [A, B, C] {
                assert!(window.contains(&id), "id {} missing from {:?}", id, window);
            }
        }
    }

    #[test]
    fn test_swrr_reduce_floors_at_one_and_resyncs() {
        let mut rr = SmoothWeightedRR::new(vec![(A, 1), (B, 1)]);
        rr.pop().unwrap();
        rr.reduce(A);

        assert!(rr.items.iter().all(|item| item.current == 0));
        assert_eq!(rr.items[0].weight, 1);
        assert_eq!(rr.total, 2);

        let mut rr = SmoothWeightedRR::new(vec![(A, 9), (B, 1)]);
        rr.reduce(A);
        assert_eq!(rr.items[0].weight, 6);
        assert_eq!(rr.total, 7);
    }

    #[test]
    fn test_swrr_delete_keeps_currents() {
        let mut rr = SmoothWeightedRR::new(vec![(A, 5), (B, 3), (C, 2)]);
        rr.pop().unwrap();
        let before: Vec<_> = rr.items.iter().filter(|i| i.id != B).map(|i| i.current).collect();

        rr.delete(B);
        let after: Vec<_> = rr.items.iter().map(|i| i.current).collect();
        assert_eq!(before, after);
        assert_eq!(rr.total, 7);

        rr.delete(A);
        rr.delete(C);
        assert_eq!(rr.pop(), Err(BalancerError::Empty));
    }

    #[test]
    fn test_rotor_pop_returns_head() {
        let mut rotor = Rotor::new(vec![(A, 1), (B, 5), (C, 3)]);
        assert_eq!(rotor.pop(), Ok(B));
        assert_eq!(rotor.pop(), Ok(B));
    }

    #[test]
    fn test_rotor_reduce_cycles() {
        let mut rotor = Rotor::new(vec![(A, 1), (B, 5), (C, 3)]);
        let mut order = Vec::new();
        for _ in 0..6 {
            let id = rotor.pop().unwrap();
            order.push(id);
            rotor.reduce(id);
        }
        assert_eq!(order, vec![B, C, A, B, C, A]);
    }

    #[test]
    fn test_rotor_delete() {
        let mut rotor = Rotor::new(vec![(A, 2), (B, 1)]);
        rotor.delete(A);
        assert_eq!(rotor.pop(), Ok(B));
        rotor.delete(B);
        assert_eq!(rotor.pop(), Err(BalancerError::Empty));
    }

    #[test]
    fn test_lottery_distribution() {
        let mut lottery = Lottery::with_rng(vec![(A, 5), (B, 3), (C, 2)], StdRng::seed_from_u64(42));
        let seen = counts(&mut lottery, 20_000);

        for (id, expected) in [(A, 0.5), (B, 0.3), (C, 0.2)] {
            let observed = seen[&id] as f64 / 20_000.0;
            assert!((observed - expected).abs() < 0.03);
        }
    }

    #[test]
    fn test_lottery_reduce_and_delete() {
        let mut lottery = Lottery::with_rng(vec![(A, 9), (B, 1)], StdRng::seed_from_u64(1));
        lottery.reduce(A);
        assert_eq!(lottery.entries[0], (A, 6));
        lottery.reduce(A);
        assert_eq!(lottery.entries[0], (A, 4));

        lottery.reduce(B);
        assert_eq!(lottery.entries[1], (B, 1));

        lottery.delete(A);
        for _ in 0..50 {
            assert_eq!(lottery.pop(), Ok(B));
        }

        lottery.delete(B);
        assert_eq!(lottery.pop(), Err(BalancerError::Empty));
    }

    #[test]
    fn test_zero_weight_never_selected() {
        for kind in [BalancerKind::Lottery, BalancerKind::Rotor, BalancerKind::SmoothWeightedRR] {
            let mut balancer = kind.build(vec![(A, 0), (B, 2)]);
            assert_eq!(balancer.len(), 1);
            for _ in 0..20 {
                assert_eq!(balancer.pop(), Ok(B));
            }

            let mut empty = kind.build(vec![(A, 0)]);
            assert!(empty.is_empty());
            assert_eq!(empty.pop(), Err(BalancerError::Empty));
        }
    }

    #[test]
    fn test_kind_serde() {
        let kind: BalancerKind = serde_json::from_str("\"smooth_weighted_rr\"").unwrap();
        assert_eq!(kind, BalancerKind::SmoothWeightedRR);
        assert_eq!(serde_json::to_string(&BalancerKind::Rotor).unwrap(), "\"rotor\"");
        assert_eq!(BalancerKind::default(), BalancerKind::Lottery);
        assert_eq!(BalancerKind::SmoothWeightedRR.to_string(), "smooth_weighted_rr");
    }
}
