//! Successor selection and handoff policy for coordinator rotation.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::message::NodeId;

/// What happens to the lock and queue when the coordinator changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Handoff {
    /// Lock and queue are discarded. Every surviving node forgets its
    /// outstanding request or current use and competes again.
    #[default]
    Destructive,
    /// Lock and queue move to the successor. Only the retired coordinator's
    /// own entries are dropped.
    Preserve,
}

/// Picks the next coordinator among the live candidates.
///
/// Candidates never include the coordinator being replaced. Returning an id
/// outside `candidates` is treated as an error by the caller.
pub trait SuccessorStrategy: Send + Sync {
    fn choose(&mut self, candidates: &[NodeId]) -> Option<NodeId>;
}

impl<F> SuccessorStrategy for F
where
    F: FnMut(&[NodeId]) -> Option<NodeId> + Send + Sync,
{
    fn choose(&mut self, candidates: &[NodeId]) -> Option<NodeId> {
        self(candidates)
    }
}

/// Uniformly random choice.
#[derive(Debug)]
pub struct RandomSuccessor {
    rng: StdRng,
}

impl RandomSuccessor {
    /// Seeded from OS entropy.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Reproducible sequence of choices.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomSuccessor {
    fn default() -> Self {
        Self::new()
    }
}

impl SuccessorStrategy for RandomSuccessor {
    fn choose(&mut self, candidates: &[NodeId]) -> Option<NodeId> {
        candidates.choose(&mut self.rng).copied()
    }
}

/// Always the smallest id.
#[derive(Debug, Default, Clone, Copy)]
pub struct LowestIdSuccessor;

impl SuccessorStrategy for LowestIdSuccessor {
    fn choose(&mut self, candidates: &[NodeId]) -> Option<NodeId> {
        candidates.iter().min().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u64]) -> Vec<NodeId> {
        raw.iter().copied().map(NodeId::new).collect()
    }

    #[test]
    fn random_choice_stays_within_candidates() {
        let candidates = ids(&[3, 5, 8]);
        let mut strategy = RandomSuccessor::seeded(7);
        for _ in 0..50 {
            let chosen = strategy.choose(&candidates).expect("non-empty candidates");
            assert!(candidates.contains(&chosen));
        }
        assert_eq!(strategy.choose(&[]), None);
    }

    #[test]
    fn seeded_choices_are_reproducible() {
        let candidates = ids(&[1, 2, 3, 4, 5, 6]);
        let mut first = RandomSuccessor::seeded(42);
        let mut second = RandomSuccessor::seeded(42);
        for _ in 0..10 {
            assert_eq!(first.choose(&candidates), second.choose(&candidates));
        }
    }

    #[test]
    fn single_candidate_is_always_chosen() {
        let mut strategy = RandomSuccessor::new();
        assert_eq!(strategy.choose(&ids(&[9])), Some(NodeId::new(9)));
    }

    #[test]
    fn lowest_id_and_closures() {
        assert_eq!(
            LowestIdSuccessor.choose(&ids(&[7, 2, 4])),
            Some(NodeId::new(2))
        );

        let mut last = |candidates: &[NodeId]| candidates.last().copied();
        assert_eq!(last.choose(&ids(&[7, 2, 4])), Some(NodeId::new(4)));
    }
}
