//! Actual stage stopping criteria

/// Decides when enough measured units have been recorded
pub trait ActualStoppingCriterion {
    /// `per_invocation` holds the per-invocation time of every measured unit so far.
    fn should_stop(&self, per_invocation: &[f64]) -> bool;
}

/// Exactly `count` measured units
#[derive(Debug, Clone, Copy)]
pub struct FixedIterationCount {
    count: u32,
}

impl FixedIterationCount {
    /// Stop after `count` units.
    pub fn new(count: u32) -> Self {
        Self { count }
    }
}

impl ActualStoppingCriterion for FixedIterationCount {
    fn should_stop(&self, per_invocation: &[f64]) -> bool {
        per_invocation.len() >= self.count as usize
    }
}

/// Stops once the standard error of the mean is small relative to the mean
#[derive(Debug, Clone, Copy)]
pub struct RelativeErrorCriterion {
    min: u32,
    max: u32,
    max_relative_error: f64,
}

impl RelativeErrorCriterion {
    /// Between `min` and `max` units, stop once the relative error drops below `max_relative_error`.
    pub fn new(min: u32, max: u32, max_relative_error: f64) -> Self {
        Self {
            min: min.max(2),
            max: max.max(min.max(2)),
            max_relative_error,
        }
    }

    /// Standard error over mean; `None` for fewer than two samples.
    pub fn relative_error(per_invocation: &[f64]) -> Option<f64> {
        let n = per_invocation.len();
        if n < 2 {
            return None;
        }
        let mean = per_invocation.iter().sum::<f64>() / n as f64;
        if mean <= 0.0 {
            return Some(0.0);
        }
        let variance = per_invocation
            .iter()
            .map(|x| (x - mean) * (x - mean))
            .sum::<f64>()
            / (n - 1) as f64;
        let std_error = (variance / n as f64).sqrt();
        Some(std_error / mean)
    }
}

impl ActualStoppingCriterion for RelativeErrorCriterion {
    fn should_stop(&self, per_invocation: &[f64]) -> bool {
        let n = per_invocation.len();
        if n < self.min as usize {
            return false;
        }
        if n >= self.max as usize {
            return true;
        }
        Self::relative_error(per_invocation).is_some_and(|e| e < self.max_relative_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_count() {
        let fixed = FixedIterationCount::new(3);
        assert!(!fixed.should_stop(&[1.0, 1.0]));
        assert!(fixed.should_stop(&[1.0, 1.0, 1.0]));
    }

    #[test]
    fn test_stable_samples_stop_at_min() {
        let criterion = RelativeErrorCriterion::new(15, 100, 0.02);
        let stable = vec![100.0; 15];
        assert!(!criterion.should_stop(&stable[..14]));
        assert!(criterion.should_stop(&stable));
    }

    #[test]
    fn test_noisy_samples_run_to_max() {
        let criterion = RelativeErrorCriterion::new(4, 10, 0.02);
        let noisy: Vec<f64> = (0..9).map(|i| if i % 2 == 0 { 10.0 } else { 200.0 }).collect();
        assert!(!criterion.should_stop(&noisy));
        let mut at_max = noisy.clone();
        at_max.push(10.0);
        assert!(criterion.should_stop(&at_max));
    }

    #[test]
    fn test_relative_error_value() {
        // mean 2, sample sd 1, stderr 1/sqrt(3)
        let e = RelativeErrorCriterion::relative_error(&[1.0, 2.0, 3.0]).unwrap();
        assert!((e - (1.0 / 3f64.sqrt()) / 2.0).abs() < 1e-12);
        assert_eq!(RelativeErrorCriterion::relative_error(&[1.0]), None);
    }
}
