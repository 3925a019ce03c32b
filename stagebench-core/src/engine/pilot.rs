//! Pilot stage: invocation-count discovery

use super::EngineConfig;

/// Hard bound on pilot rounds, independent of the growth factor
pub const MAX_PILOT_ROUNDS: u32 = 256;

/// Units shorter than this many clock ticks are considered under-resolved
const RESOLUTION_MULTIPLIER: u64 = 10;

/// Round `n` up to a multiple of `unroll` (at least one `unroll`).
pub fn align_up(n: u64, unroll: u64) -> u64 {
    let unroll = unroll.max(1);
    n.max(1).div_ceil(unroll).saturating_mul(unroll)
}

/// What the pilot decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PilotOutcome {
    /// Invocations per unit for every later stage
    pub invocations: u64,
    /// Pilot units that were run
    pub rounds: u32,
    /// The ceiling was hit before a unit reached the target duration
    pub uncertain: bool,
}

/// Decision after one pilot unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PilotStep {
    /// The unit reached the target; keep its invocation count
    Done,
    /// Run another unit with this many invocations
    Continue(u64),
    /// No further growth is possible; keep the current count
    Exhausted,
}

/// Growth policy of the pilot stage
///
/// The next count is the larger of the linear projection toward the target
/// and the current count times the growth factor, aligned to the unroll
/// factor and capped at the ceiling. Counts therefore never decrease, and grow
/// by at least the growth factor until the cap.
#[derive(Debug, Clone, Copy)]
pub struct PilotPlanner {
    target_ns: u64,
    ceiling: u64,
    growth: f64,
    unroll: u64,
}

impl PilotPlanner {
    /// Planner for `config` on a clock with the given resolution.
    pub fn new(config: &EngineConfig, resolution_ns: u64) -> Self {
        let unroll = config.unroll_factor.max(1);
        Self {
            target_ns: config
                .min_iteration_time_ns
                .max(resolution_ns.saturating_mul(RESOLUTION_MULTIPLIER)),
            ceiling: (config.max_invocation_count / unroll).max(1) * unroll,
            growth: config.pilot_growth_factor,
            unroll,
        }
    }

    /// Unit duration the pilot aims for.
    pub fn target_ns(&self) -> u64 {
        self.target_ns
    }

    /// Largest invocation count the pilot may choose.
    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Invocations of the first pilot unit.
    pub fn first(&self) -> u64 {
        self.unroll.min(self.ceiling)
    }

    /// Decide after round `round` ran `invocations` in `elapsed_ns`.
    pub fn next(&self, invocations: u64, elapsed_ns: u64, round: u32) -> PilotStep {
        if elapsed_ns >= self.target_ns {
            return PilotStep::Done;
        }
        if invocations >= self.ceiling || round >= MAX_PILOT_ROUNDS {
            return PilotStep::Exhausted;
        }

        let grown = ((invocations as f64) * self.growth).ceil() as u64;
        let projected = if elapsed_ns == 0 {
            0
        } else {
            let scaled = (self.target_ns as u128 * invocations as u128).div_ceil(elapsed_ns as u128);
            u64::try_from(scaled).unwrap_or(u64::MAX)
        };

        let next = align_up(grown.max(projected).max(invocations + 1), self.unroll).min(self.ceiling);
        PilotStep::Continue(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn planner(target_ns: u64, ceiling: u64, growth: f64, unroll: u64) -> PilotPlanner {
        let config = EngineConfig {
            min_iteration_time_ns: target_ns,
            max_invocation_count: ceiling,
            pilot_growth_factor: growth,
            unroll_factor: unroll,
            ..EngineConfig::default()
        };
        PilotPlanner::new(&config, 1)
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 16);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_up(5, 1), 5);
    }

    #[test]
    fn test_projection_jumps_close_to_target() {
        let p = planner(1_000_000, 1 << 30, 2.0, 16);
        // 16 calls took 1600 ns; 1 ms needs 10_000 calls
        assert_eq!(p.next(16, 1_600, 1), PilotStep::Continue(10_000));
    }

    #[test]
    fn test_growth_applies_when_projection_is_small() {
        let p = planner(1_000_000, 1 << 30, 2.0, 16);
        // A clock that did not move gives no projection
        assert_eq!(p.next(16, 0, 1), PilotStep::Continue(32));
    }

    #[test]
    fn test_resolution_raises_target() {
        let config = EngineConfig {
            min_iteration_time_ns: 100,
            ..EngineConfig::default()
        };
        let p = PilotPlanner::new(&config, 1_000);
        assert_eq!(p.target_ns(), 10_000);
    }

    #[test]
    fn test_ceiling_is_aligned_down() {
        let p = planner(1_000, 100, 2.0, 16);
        assert_eq!(p.ceiling(), 96);
        assert_eq!(p.next(64, 10, 3), PilotStep::Continue(96));
        assert_eq!(p.next(96, 10, 4), PilotStep::Exhausted);
    }

    proptest! {
        #[test]
        fn prop_pilot_monotone_and_bounded(
            ns_per_call in 0u64..50_000,
            target in 1u64..100_000_000,
            ceiling_log in 4u32..40,
            growth in 1.5f64..4.0,
            unroll in 1u64..32,
        ) {
            let ceiling = (1u64 << ceiling_log).max(unroll);
            let p = planner(target, ceiling, growth, unroll);

            let mut invocations = p.first();
            let mut round = 0u32;
            let bound = (ceiling as f64).log(growth).ceil() as u32 + 2;
            loop {
                round += 1;
                prop_assert!(round <= bound, "pilot ran {} rounds (bound {})", round, bound);
                let elapsed = invocations.saturating_mul(ns_per_call);
                match p.next(invocations, elapsed, round) {
                    PilotStep::Continue(next) => {
                        prop_assert!(next > invocations);
                        prop_assert!(next <= p.ceiling());
                        prop_assert_eq!(next % unroll, 0);
                        invocations = next;
                    }
                    PilotStep::Done | PilotStep::Exhausted => break,
                }
            }
        }
    }
}
