// Channel selection policies.
//
// A selector only ranks candidates; it never touches the queue or the workers,
// so the queue engine and the selection layer can be swapped independently.
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::call::Method;
use crate::error::ConfigError;

/// Anything a selector can choose between.
pub trait LoadReport {
    /// Stable identifier, used for deterministic ordering.
    fn id(&self) -> u64;
    /// Current outstanding work.
    fn load(&self) -> usize;
}

pub trait Selector<R: LoadReport>: Send + Sync {
    fn select<'a>(&self, candidates: &'a [R], method: &Method) -> Option<&'a R>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectorPolicy {
    Watermark,
    RoundRobin,
    HashMethod,
}

impl SelectorPolicy {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "watermark" => Ok(Self::Watermark),
            "rr" => Ok(Self::RoundRobin),
            "hash_method" => Ok(Self::HashMethod),
            other => Err(ConfigError::UnknownSelector(other.to_string())),
        }
    }

    pub fn build<R: LoadReport + 'static>(self, low: usize, high: usize) -> Box<dyn Selector<R>> {
        match self {
            Self::Watermark => Box::new(WatermarkSelector::new(low, high)),
            Self::RoundRobin => Box::new(RoundRobinSelector::default()),
            Self::HashMethod => Box::new(HashMethodSelector),
        }
    }
}

/// Prefer lightly loaded candidates, lowest id first.
///
/// Candidates are ordered by id. The first with load below `low` wins; failing
/// that, the first below `high`; if every candidate is at or above `high`, one
/// is picked uniformly at random.
#[derive(Debug, Clone)]
pub struct WatermarkSelector {
    low: usize,
    high: usize,
}

impl WatermarkSelector {
    pub fn new(low: usize, high: usize) -> Self {
        Self { low, high }
    }
}

impl<R: LoadReport> Selector<R> for WatermarkSelector {
    fn select<'a>(&self, candidates: &'a [R], _method: &Method) -> Option<&'a R> {
        if candidates.is_empty() {
            return None;
        }
        let mut ordered: Vec<&R> = candidates.iter().collect();
        ordered.sort_by_key(|candidate| candidate.id());
        if let Some(candidate) = ordered.iter().find(|c| c.load() < self.low) {
            return Some(*candidate);
        }
        if let Some(candidate) = ordered.iter().find(|c| c.load() < self.high) {
            return Some(*candidate);
        }
        let index = rand::thread_rng().gen_range(0..ordered.len());
        Some(ordered[index])
    }
}

#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    next: AtomicUsize,
}

impl<R: LoadReport> Selector<R> for RoundRobinSelector {
    fn select<'a>(&self, candidates: &'a [R], _method: &Method) -> Option<&'a R> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates.get(index)
    }
}

/// Pin each method to one candidate so its batches stay on one channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashMethodSelector;

impl<R: LoadReport> Selector<R> for HashMethodSelector {
    fn select<'a>(&self, candidates: &'a [R], method: &Method) -> Option<&'a R> {
        if candidates.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        method.as_str().hash(&mut hasher);
        let index = (hasher.finish() as usize) % candidates.len();
        let mut ordered: Vec<&R> = candidates.iter().collect();
        ordered.sort_by_key(|candidate| candidate.id());
        Some(ordered[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Candidate {
        id: u64,
        load: usize,
    }

    impl LoadReport for Candidate {
        fn id(&self) -> u64 {
            self.id
        }

        fn load(&self) -> usize {
            self.load
        }
    }

    fn candidates(loads: &[(u64, usize)]) -> Vec<Candidate> {
        loads
            .iter()
            .map(|(id, load)| Candidate {
                id: *id,
                load: *load,
            })
            .collect()
    }

    #[test]
    fn watermark_prefers_lowest_id_below_low() {
        let selector = WatermarkSelector::new(4, 10);
        let pool = candidates(&[(3, 1), (1, 6), (2, 2)]);
        let picked = selector.select(&pool, &Method::GET).expect("candidate");
        assert_eq!(picked.id, 2);
    }

    #[test]
    fn watermark_falls_back_to_high() {
        let selector = WatermarkSelector::new(4, 10);
        let pool = candidates(&[(2, 9), (1, 12), (0, 15)]);
        let picked = selector.select(&pool, &Method::GET).expect("candidate");
        assert_eq!(picked.id, 2);
    }

    #[test]
    fn watermark_saturated_pool_picks_any() {
        let selector = WatermarkSelector::new(4, 10);
        let pool = candidates(&[(0, 10), (1, 11), (2, 40)]);
        for _ in 0..32 {
            let picked = selector.select(&pool, &Method::GET).expect("candidate");
            assert!(pool.contains(picked));
        }
        assert!(selector.select(&[] as &[Candidate], &Method::GET).is_none());
    }

    #[test]
    fn round_robin_cycles() {
        let selector = RoundRobinSelector::default();
        let pool = candidates(&[(0, 0), (1, 0), (2, 0)]);
        let ids: Vec<u64> = (0..6)
            .map(|_| selector.select(&pool, &Method::PUT).expect("candidate").id)
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn hash_method_is_stable() {
        let selector = HashMethodSelector;
        let pool = candidates(&[(0, 0), (1, 50), (2, 0), (3, 9)]);
        let first = selector.select(&pool, &Method::EXISTS).expect("candidate").id;
        for _ in 0..8 {
            assert_eq!(
                selector.select(&pool, &Method::EXISTS).expect("candidate").id,
                first
            );
        }
    }

    #[test]
    fn policy_names_parse() {
        assert_eq!(SelectorPolicy::parse("watermark"), Ok(SelectorPolicy::Watermark));
        assert_eq!(SelectorPolicy::parse("rr"), Ok(SelectorPolicy::RoundRobin));
        assert_eq!(SelectorPolicy::parse("hash_method"), Ok(SelectorPolicy::HashMethod));
        assert!(SelectorPolicy::parse("least_loaded").is_err());
        let selector = SelectorPolicy::Watermark.build::<Candidate>(1, 2);
        let pool = candidates(&[(5, 0)]);
        assert_eq!(selector.select(&pool, &Method::GET).map(|c| c.id), Some(5));
    }
}
