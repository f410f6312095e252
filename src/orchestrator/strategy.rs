//! Distribution strategies.

use crate::config::DistributionStrategy;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Picks one candidate according to a [`DistributionStrategy`]
pub(super) struct Selector {
    strategy: DistributionStrategy,
    cursor: AtomicUsize,
}

impl Selector {
    pub(super) fn new(strategy: DistributionStrategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Index into `loads` of the chosen candidate, `None` if there are none
    ///
    /// `loads[i]` is candidate `i`'s combined pending units.
    pub(super) fn pick(&self, loads: &[usize]) -> Option<usize> {
        if loads.is_empty() {
            return None;
        }
        match self.strategy {
            DistributionStrategy::RoundRobin => {
                Some(self.cursor.fetch_add(1, Ordering::Relaxed) % loads.len())
            }
            // Ties go to the earliest candidate
            DistributionStrategy::LoadBalanced => loads
                .iter()
                .enumerate()
                .min_by_key(|(_, load)| **load)
                .map(|(index, _)| index),
            DistributionStrategy::FirstAvailable => Some(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_over_candidates() {
        let selector = Selector::new(DistributionStrategy::RoundRobin);
        let picks: Vec<_> = (0..5).filter_map(|_| selector.pick(&[0, 0, 0])).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn load_balanced_prefers_fewest_pending() {
        let selector = Selector::new(DistributionStrategy::LoadBalanced);
        assert_eq!(selector.pick(&[3, 1, 2]), Some(1));
        assert_eq!(selector.pick(&[2, 0, 0]), Some(1));
    }

    #[test]
    fn first_available_takes_registration_order() {
        let selector = Selector::new(DistributionStrategy::FirstAvailable);
        assert_eq!(selector.pick(&[9, 0]), Some(0));
    }

    #[test]
    fn no_candidates_no_pick() {
        for strategy in [
            DistributionStrategy::RoundRobin,
            DistributionStrategy::LoadBalanced,
            DistributionStrategy::FirstAvailable,
        ] {
            assert_eq!(Selector::new(strategy).pick(&[]), None);
        }
    }
}
