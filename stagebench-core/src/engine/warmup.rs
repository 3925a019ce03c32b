//! Warmup stage stopping criteria

/// Decides when warmup has reached steady state
pub trait WarmupStoppingCriterion {
    /// `per_invocation` holds the per-invocation time of every warmup unit so far.
    fn should_stop(&self, per_invocation: &[f64]) -> bool;
}

/// Exactly `count` warmup units
#[derive(Debug, Clone, Copy)]
pub struct FixedWarmupCount {
    count: u32,
}

impl FixedWarmupCount {
    /// Stop after `count` units.
    pub fn new(count: u32) -> Self {
        Self { count }
    }
}

impl WarmupStoppingCriterion for FixedWarmupCount {
    fn should_stop(&self, per_invocation: &[f64]) -> bool {
        per_invocation.len() >= self.count as usize
    }
}

/// Stops once timings oscillate instead of trending
///
/// While the workload is still warming up, consecutive units keep getting
/// faster. Once it is steady, timings jitter around a level and the direction
/// of change flips often. After `min` units, warmup ends when the sequence has
/// changed direction `fluctuations` times, or unconditionally at `max`.
#[derive(Debug, Clone, Copy)]
pub struct FluctuationWarmup {
    min: u32,
    max: u32,
    fluctuations: u32,
}

impl FluctuationWarmup {
    /// Between `min` and `max` units, stop after `fluctuations` direction changes.
    pub fn new(min: u32, max: u32, fluctuations: u32) -> Self {
        Self {
            min,
            max: max.max(min),
            fluctuations,
        }
    }
}

impl WarmupStoppingCriterion for FluctuationWarmup {
    fn should_stop(&self, per_invocation: &[f64]) -> bool {
        let n = per_invocation.len();
        if n < self.min as usize {
            return false;
        }
        if n >= self.max as usize {
            return true;
        }
        direction_changes(per_invocation) >= self.fluctuations
    }
}

/// Sign flips between consecutive non-zero differences.
fn direction_changes(values: &[f64]) -> u32 {
    let mut changes = 0;
    let mut last_sign = 0.0f64;
    for pair in values.windows(2) {
        let diff = pair[1] - pair[0];
        if diff == 0.0 {
            continue;
        }
        let sign = diff.signum();
        if last_sign != 0.0 && sign != last_sign {
            changes += 1;
        }
        last_sign = sign;
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_count() {
        let fixed = FixedWarmupCount::new(2);
        assert!(!fixed.should_stop(&[]));
        assert!(!fixed.should_stop(&[1.0]));
        assert!(fixed.should_stop(&[1.0, 1.0]));
        assert!(FixedWarmupCount::new(0).should_stop(&[]));
    }

    #[test]
    fn test_trending_sequence_keeps_warming() {
        let criterion = FluctuationWarmup::new(3, 50, 2);
        let falling: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        assert!(!criterion.should_stop(&falling));
    }

    #[test]
    fn test_oscillating_sequence_stops() {
        let criterion = FluctuationWarmup::new(3, 50, 4);
        let steady = [90.0, 91.0, 89.0, 91.0, 90.0, 92.0];
        assert_eq!(direction_changes(&steady), 4);
        assert!(criterion.should_stop(&steady));
    }

    #[test]
    fn test_min_and_max_bounds() {
        let criterion = FluctuationWarmup::new(6, 8, 1);
        let jitter = [1.0, 2.0, 1.0, 2.0];
        assert!(!criterion.should_stop(&jitter));
        let falling: Vec<f64> = (0..8).map(|i| 100.0 - i as f64).collect();
        assert!(criterion.should_stop(&falling));
    }

    #[test]
    fn test_flat_steps_ignored() {
        assert_eq!(direction_changes(&[5.0, 5.0, 5.0]), 0);
        assert_eq!(direction_changes(&[5.0, 6.0, 6.0, 5.0]), 1);
    }
}
