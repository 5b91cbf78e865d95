//! Batch size selection for the main pass
//!
//! Bigger batches amortise the fixed cost of each oracle call, but past some
//! size the call no longer fits in its deadline. The canonical policy doubles
//! from a seed until something fails, then bisects between the largest size
//! known to work and the smallest size known to fail. Once the bracket closes
//! the converged size is used for the rest of the pass.

use crate::config::SizingPolicy;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SizingState {
    pub last_successful: Option<usize>,
    pub first_failing: Option<usize>,
    pub converged: Option<usize>,
}

/// What to do at the current position after a failed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Retry { size: usize },
    /// Even a single record fails; leave it for reconciliation.
    SkipRecord,
}

#[derive(Debug, Clone)]
pub struct BatchSizeController {
    policy: SizingPolicy,
    state: SizingState,
    current: usize,
    /// Position-local size used after convergence when the converged size fails.
    fallback: Option<usize>,
    probes: usize,
}

impl BatchSizeController {
    pub fn new(policy: SizingPolicy, seed_size: usize) -> Self {
        Self {
            policy,
            state: SizingState::default(),
            current: seed_size.max(1),
            fallback: None,
            probes: 0,
        }
    }

    pub fn state(&self) -> &SizingState {
        &self.state
    }

    pub fn converged(&self) -> Option<usize> {
        self.state.converged
    }

    /// Outcomes recorded while still searching for the converged size.
    pub fn probes(&self) -> usize {
        self.probes
    }

    /// Size of the next batch, never more than what is left.
    pub fn next_size(&self, remaining: usize) -> usize {
        let target = match self.policy {
            SizingPolicy::DoublingBisection => self
                .fallback
                .or(self.state.converged)
                .unwrap_or(self.current),
            SizingPolicy::LinearDecrement => self.current,
        };
        target.min(remaining).max(1)
    }

    pub fn record_success(&mut self, size: usize) {
        match self.policy {
            SizingPolicy::DoublingBisection => self.bisection_success(size),
            SizingPolicy::LinearDecrement => self.linear_success(size),
        }
    }

    pub fn record_timeout(&mut self, size: usize) -> Adjustment {
        match self.policy {
            SizingPolicy::DoublingBisection => {
                if self.state.converged.is_some() {
                    return self.shrink_fallback(size, size / 2);
                }
                self.bisection_timeout(size)
            }
            SizingPolicy::LinearDecrement => {
                self.state.first_failing = Some(self.state.first_failing.map_or(size, |f| f.min(size)));
                self.linear_failure(size)
            }
        }
    }

    /// Structural failures may be caused by the content rather than the
    /// size, so they step down by one and leave the bisection bracket alone.
    pub fn record_structural_failure(&mut self, size: usize) -> Adjustment {
        match self.policy {
            SizingPolicy::DoublingBisection => {
                if self.state.converged.is_some() {
                    return self.shrink_fallback(size, size.saturating_sub(1));
                }
                self.probes += 1;
                if size <= 1 {
                    self.current = 1;
                    return Adjustment::SkipRecord;
                }
                self.current = size - 1;
                debug!(size = self.current, "structural failure, stepping down by one");
                Adjustment::Retry { size: self.current }
            }
            SizingPolicy::LinearDecrement => self.linear_failure(size),
        }
    }

    fn bisection_success(&mut self, size: usize) {
        if self.state.converged.is_some() {
            self.fallback = None;
            return;
        }
        self.probes += 1;

        let last = self.state.last_successful.map_or(size, |l| l.max(size));
        self.state.last_successful = Some(last);

        if let Some(failing) = self.state.first_failing {
            if failing <= last {
                debug!(failing, last, "failure bound disproved, exploring again");
                self.state.first_failing = None;
            }
        }

        match self.state.first_failing {
            None => {
                self.current = last.saturating_mul(2);
                debug!(next = self.current, "doubling batch size");
            }
            Some(failing) if failing - last <= 1 => {
                self.state.converged = Some(last);
                info!(size = last, probes = self.probes, "batch size converged");
            }
            Some(failing) => {
                self.current = last + (failing - last) / 2;
                debug!(low = last, high = failing, next = self.current, "bisecting batch size");
            }
        }
    }

    fn bisection_timeout(&mut self, size: usize) -> Adjustment {
        self.probes += 1;
        if size <= 1 {
            self.current = 1;
            return Adjustment::SkipRecord;
        }

        let failing = self.state.first_failing.map_or(size, |f| f.min(size));
        self.state.first_failing = Some(failing);
        let low = self.state.last_successful.unwrap_or(0);

        if failing <= low + 1 {
            if let Some(last) = self.state.last_successful {
                self.state.converged = Some(last);
                info!(size = last, probes = self.probes, "batch size converged");
                return Adjustment::Retry { size: last };
            }
        }

        self.current = (low + (failing - low) / 2).max(1);
        debug!(low, high = failing, next = self.current, "timeout, bisecting batch size");
        Adjustment::Retry { size: self.current }
    }

    fn shrink_fallback(&mut self, size: usize, smaller: usize) -> Adjustment {
        if size <= 1 {
            self.fallback = None;
            return Adjustment::SkipRecord;
        }
        let next = smaller.max(1);
        self.fallback = Some(next);
        debug!(size = next, "converged size failed here, using a local fallback");
        Adjustment::Retry { size: next }
    }

    fn linear_success(&mut self, size: usize) {
        self.state.last_successful = Some(size);
        let working = self.state.converged.map_or(self.current, |c| c.min(self.current));
        if self.state.converged != Some(working) {
            self.probes += 1;
            info!(size = working, "working batch size confirmed");
        }
        self.state.converged = Some(working);
    }

    fn linear_failure(&mut self, size: usize) -> Adjustment {
        if size <= 1 {
            return Adjustment::SkipRecord;
        }
        self.current = size - 1;
        if let Some(working) = self.state.converged {
            if working > self.current {
                self.state.converged = Some(self.current);
            }
        }
        debug!(size = self.current, "stepping batch size down by one");
        Adjustment::Retry { size: self.current }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive the controller against a capacity limit until it converges.
    fn converge(seed: usize, capacity: usize) -> BatchSizeController {
        let mut controller = BatchSizeController::new(SizingPolicy::DoublingBisection, seed);
        for _ in 0..200 {
            if controller.converged().is_some() {
                break;
            }
            let size = controller.next_size(usize::MAX);
            if size <= capacity {
                controller.record_success(size);
            } else {
                controller.record_timeout(size);
            }
        }
        controller
    }

    #[test]
    fn test_converges_on_capacity_37_within_log_bound() {
        let controller = converge(18, 37);
        let converged = controller.converged().unwrap();
        assert!((36..=37).contains(&converged));
        // ceil(log2(37)) + 2
        assert!(controller.probes() <= 8, "took {} probes", controller.probes());
    }

    #[test]
    fn test_converges_to_capacity_for_many_limits() {
        for capacity in 1..=150 {
            for seed in [1, 5, 18, 64] {
                let controller = converge(seed, capacity);
                let converged = controller.converged().unwrap();
                assert!(
                    converged + 1 >= capacity && converged <= capacity,
                    "capacity {} seed {} converged to {}",
                    capacity,
                    seed,
                    converged
                );
            }
        }
    }

    #[test]
    fn test_doubles_while_exploring() {
        let mut controller = BatchSizeController::new(SizingPolicy::DoublingBisection, 3);
        assert_eq!(controller.next_size(100), 3);
        controller.record_success(3);
        assert_eq!(controller.next_size(100), 6);
        controller.record_success(6);
        assert_eq!(controller.next_size(100), 12);
    }

    #[test]
    fn test_next_size_capped_by_remaining() {
        let controller = BatchSizeController::new(SizingPolicy::DoublingBisection, 18);
        assert_eq!(controller.next_size(4), 4);
        assert_eq!(controller.next_size(0), 1);
    }

    #[test]
    fn test_structural_failure_steps_down_without_moving_bracket() {
        let mut controller = BatchSizeController::new(SizingPolicy::DoublingBisection, 10);
        controller.record_success(10);
        assert_eq!(controller.record_timeout(20), Adjustment::Retry { size: 15 });
        assert_eq!(
            controller.record_structural_failure(15),
            Adjustment::Retry { size: 14 }
        );
        assert_eq!(controller.state().first_failing, Some(20));
        assert_eq!(controller.next_size(100), 14);
    }

    #[test]
    fn test_single_record_failure_is_skipped() {
        let mut controller = BatchSizeController::new(SizingPolicy::DoublingBisection, 1);
        assert_eq!(controller.record_timeout(1), Adjustment::SkipRecord);
        assert_eq!(controller.record_structural_failure(1), Adjustment::SkipRecord);
        assert_eq!(controller.next_size(10), 1);
    }

    #[test]
    fn test_converged_size_is_fixed_after_failures() {
        let mut controller = converge(4, 9);
        assert_eq!(controller.converged(), Some(9));

        assert_eq!(controller.record_timeout(9), Adjustment::Retry { size: 4 });
        assert_eq!(controller.next_size(100), 4);
        assert_eq!(controller.record_structural_failure(4), Adjustment::Retry { size: 3 });
        controller.record_success(3);

        assert_eq!(controller.converged(), Some(9));
        assert_eq!(controller.next_size(100), 9);
    }

    #[test]
    fn test_converged_fallback_skips_single_record() {
        let mut controller = converge(2, 2);
        assert_eq!(controller.converged(), Some(2));
        assert_eq!(controller.record_timeout(2), Adjustment::Retry { size: 1 });
        assert_eq!(controller.record_timeout(1), Adjustment::SkipRecord);
        assert_eq!(controller.next_size(100), 2);
    }

    #[test]
    fn test_success_above_failure_bound_resumes_exploration() {
        let mut controller = BatchSizeController::new(SizingPolicy::DoublingBisection, 8);
        assert_eq!(controller.record_timeout(8), Adjustment::Retry { size: 4 });
        controller.record_success(4);
        assert_eq!(controller.next_size(100), 6);
        controller.record_success(8);
        assert_eq!(controller.state().first_failing, None);
        assert_eq!(controller.next_size(100), 16);
    }

    #[test]
    fn test_linear_policy_steps_down_and_keeps_smallest_success() {
        let mut controller = BatchSizeController::new(SizingPolicy::LinearDecrement, 18);
        assert_eq!(controller.record_timeout(18), Adjustment::Retry { size: 17 });
        assert_eq!(controller.record_timeout(17), Adjustment::Retry { size: 16 });
        controller.record_success(16);
        assert_eq!(controller.converged(), Some(16));
        assert_eq!(controller.next_size(100), 16);

        assert_eq!(
            controller.record_structural_failure(16),
            Adjustment::Retry { size: 15 }
        );
        controller.record_success(15);
        assert_eq!(controller.converged(), Some(15));
        assert_eq!(controller.next_size(100), 15);
    }
}
