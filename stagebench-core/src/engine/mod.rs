//! Iteration Engine
//!
//! The staged loop that runs inside the measured child:
//!
//! ```text
//! Jitting -> Pilot -> Warmup -> Actual -> (Overhead warmup + actual) -> Done
//! ```
//!
//! Jitting runs the workload once unmeasured. Pilot discovers how many raw
//! invocations to batch into one unit so the unit lasts at least the target
//! duration. Warmup runs discarded units until a [`WarmupStoppingCriterion`]
//! reports steady state. Actual runs recorded units until an
//! [`ActualStoppingCriterion`] is satisfied. With overhead evaluation enabled
//! the same warmup/actual sequence is repeated on an empty body, and its
//! median per-invocation cost is later subtracted from the workload units.
//!
//! Units never overlap: the engine is single-threaded and every unit is
//! reported to the [`MeasurementObserver`] before the next one starts.

mod actual;
mod pilot;
mod results;
mod warmup;

pub use actual::{ActualStoppingCriterion, FixedIterationCount, RelativeErrorCriterion};
pub use pilot::{MAX_PILOT_ROUNDS, PilotOutcome, PilotPlanner, PilotStep, align_up};
pub use results::{IterationMeasurement, RunResults, median};
pub use warmup::{FixedWarmupCount, FluctuationWarmup, WarmupStoppingCriterion};

use crate::allocator::AllocationSnapshot;
use crate::cache::{CacheClearingStrategy, select_cache_clearing_strategy};
use crate::measure::{Clock, SystemClock, Timer, pin_to_mask};
use serde::{Deserialize, Serialize};
use stagebench_ipc::{IterationMode, IterationStage, StageTag};
use thiserror::Error;

/// Engine failures; measurement instability is never one of them
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to report measurement: {0}")]
    Report(#[from] std::io::Error),

    #[error("run interrupted during {0}")]
    Interrupted(StageTag),
}

/// Engine tuning; travels to the child as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum duration of one measured unit, in nanoseconds
    pub min_iteration_time_ns: u64,
    /// Pilot ceiling on invocations per unit
    pub max_invocation_count: u64,
    /// Minimum growth of the invocation count between pilot rounds
    pub pilot_growth_factor: f64,
    /// Invocation counts are multiples of this
    pub unroll_factor: u64,
    /// Fixed invocations per unit; skips the pilot stage
    pub invocation_count: Option<u64>,
    /// Fixed number of warmup units
    pub warmup_count: Option<u32>,
    /// Minimum warmup units for automatic warmup
    pub min_warmup_count: u32,
    /// Maximum warmup units for automatic warmup
    pub max_warmup_count: u32,
    /// Direction changes that mark steady state
    pub warmup_fluctuations: u32,
    /// Fixed number of measured units
    pub iteration_count: Option<u32>,
    /// Minimum measured units for automatic stopping
    pub min_iteration_count: u32,
    /// Maximum measured units for automatic stopping
    pub max_iteration_count: u32,
    /// Standard error over mean that ends the actual stage
    pub max_relative_error: f64,
    /// Measure and subtract the empty-body overhead
    pub evaluate_overhead: bool,
    /// Flush the instruction cache before every measured unit
    pub clear_cache: bool,
    /// CPU mask to pin the engine thread to (bit `n` = CPU `n`)
    pub affinity: Option<u64>,
    /// Record allocation deltas per unit (needs `TrackingAllocator`)
    pub track_allocations: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_iteration_time_ns: 250_000_000,
            max_invocation_count: 1 << 32,
            pilot_growth_factor: 2.0,
            unroll_factor: 16,
            invocation_count: None,
            warmup_count: None,
            min_warmup_count: 6,
            max_warmup_count: 50,
            warmup_fluctuations: 4,
            iteration_count: None,
            min_iteration_count: 15,
            max_iteration_count: 100,
            max_relative_error: 0.02,
            evaluate_overhead: true,
            clear_cache: false,
            affinity: None,
            track_allocations: false,
        }
    }
}

impl EngineConfig {
    /// Reject settings the staged loop cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: String| Err(EngineError::InvalidConfig(msg));

        if self.unroll_factor == 0 {
            return invalid("unroll_factor must be at least 1".into());
        }
        if !(self.pilot_growth_factor > 1.0) || !self.pilot_growth_factor.is_finite() {
            return invalid(format!(
                "pilot_growth_factor must be a finite number above 1 (got {})",
                self.pilot_growth_factor
            ));
        }
        if self.max_invocation_count < self.unroll_factor {
            return invalid(format!(
                "max_invocation_count {} is below unroll_factor {}",
                self.max_invocation_count, self.unroll_factor
            ));
        }
        if self.invocation_count == Some(0) {
            return invalid("invocation_count must be at least 1".into());
        }
        if self.iteration_count == Some(0) {
            return invalid("iteration_count must be at least 1".into());
        }
        if self.min_warmup_count > self.max_warmup_count {
            return invalid(format!(
                "min_warmup_count {} exceeds max_warmup_count {}",
                self.min_warmup_count, self.max_warmup_count
            ));
        }
        if self.min_iteration_count == 0 || self.min_iteration_count > self.max_iteration_count {
            return invalid(format!(
                "iteration bounds {}..={} are empty",
                self.min_iteration_count, self.max_iteration_count
            ));
        }
        if !(self.max_relative_error > 0.0) {
            return invalid("max_relative_error must be positive".into());
        }
        if self.affinity == Some(0) {
            return invalid("affinity mask selects no CPU".into());
        }
        Ok(())
    }

    fn warmup_criterion(&self) -> Box<dyn WarmupStoppingCriterion> {
        match self.warmup_count {
            Some(count) => Box::new(FixedWarmupCount::new(count)),
            None => Box::new(FluctuationWarmup::new(
                self.min_warmup_count,
                self.max_warmup_count,
                self.warmup_fluctuations,
            )),
        }
    }

    fn actual_criterion(&self) -> Box<dyn ActualStoppingCriterion> {
        match self.iteration_count {
            Some(count) => Box::new(FixedIterationCount::new(count)),
            None => Box::new(RelativeErrorCriterion::new(
                self.min_iteration_count,
                self.max_iteration_count,
                self.max_relative_error,
            )),
        }
    }
}

/// Code under measurement
pub trait Workload {
    /// Run the body `invocations` times back to back.
    fn run(&mut self, invocations: u64);
}

/// Adapts a closure into a [`Workload`]
pub struct FnWorkload<F>(pub F);

impl<F: FnMut()> Workload for FnWorkload<F> {
    #[inline(never)]
    fn run(&mut self, invocations: u64) {
        for _ in 0..invocations {
            (self.0)();
            std::hint::black_box(());
        }
    }
}

/// Empty body measured in the overhead stage
#[derive(Debug, Default)]
pub struct EmptyWorkload;

impl Workload for EmptyWorkload {
    #[inline(never)]
    fn run(&mut self, invocations: u64) {
        for _ in 0..invocations {
            std::hint::black_box(());
        }
    }
}

/// Receives every measured unit as soon as it completes
pub trait MeasurementObserver {
    /// Called once per unit, in order.
    fn on_measurement(&mut self, measurement: &IterationMeasurement) -> std::io::Result<()>;
}

impl MeasurementObserver for () {
    fn on_measurement(&mut self, _measurement: &IterationMeasurement) -> std::io::Result<()> {
        Ok(())
    }
}

impl MeasurementObserver for Vec<IterationMeasurement> {
    fn on_measurement(&mut self, measurement: &IterationMeasurement) -> std::io::Result<()> {
        self.push(*measurement);
        Ok(())
    }
}

/// Staged measurement loop
pub struct IterationEngine<C: Clock = SystemClock> {
    config: EngineConfig,
    clock: C,
    cache: Option<&'static dyn CacheClearingStrategy>,
    overhead: Box<dyn Workload>,
    interrupted: fn() -> bool,
}

impl IterationEngine<SystemClock> {
    /// Engine reading the system clock.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> IterationEngine<C> {
    /// Engine reading `clock`; tests drive it with [`crate::FakeClock`].
    pub fn with_clock(config: EngineConfig, clock: C) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            cache: None,
            overhead: Box::new(EmptyWorkload),
            interrupted: crate::host::shutdown_requested,
        })
    }

    /// Use a specific cache clearing strategy instead of the probed one.
    pub fn with_cache_strategy(mut self, strategy: &'static dyn CacheClearingStrategy) -> Self {
        self.cache = Some(strategy);
        self
    }

    /// Replace the empty overhead body.
    pub fn with_overhead_workload(mut self, overhead: Box<dyn Workload>) -> Self {
        self.overhead = overhead;
        self
    }

    /// Configuration in effect.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run every stage for `workload`, reporting each unit to `observer`.
    pub fn run(
        &mut self,
        workload: &mut dyn Workload,
        observer: &mut dyn MeasurementObserver,
    ) -> Result<RunResults, EngineError> {
        let _pinned = match self.config.affinity {
            Some(mask) => match pin_to_mask(mask) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    tracing::warn!("could not apply affinity mask {:#x}: {}", mask, e);
                    None
                }
            },
            None => None,
        };
        let cache = if self.config.clear_cache {
            Some(self.cache.unwrap_or_else(select_cache_clearing_strategy))
        } else {
            None
        };

        let mut run = StageRunner {
            config: &self.config,
            clock: &self.clock,
            cache,
            interrupted: self.interrupted,
            observer,
            measurements: Vec::new(),
        };

        // Jitting: fault in the code paths once, unmeasured
        crate::runtime::set_stage(Some(StageTag::new(
            IterationMode::Workload,
            IterationStage::Jitting,
        )));
        workload.run(1);
        if self.config.evaluate_overhead {
            crate::runtime::set_stage(Some(StageTag::new(
                IterationMode::Overhead,
                IterationStage::Jitting,
            )));
            self.overhead.run(1);
        }
        crate::runtime::set_stage(None);

        let pilot = match self.config.invocation_count {
            Some(fixed) => PilotOutcome {
                invocations: align_up(fixed, self.config.unroll_factor),
                rounds: 0,
                uncertain: false,
            },
            None => run.pilot(workload)?,
        };
        tracing::debug!(
            "pilot chose {} invocations per unit after {} rounds (uncertain: {})",
            pilot.invocations,
            pilot.rounds,
            pilot.uncertain
        );

        let warmup = run.warmup(workload, IterationMode::Workload, pilot.invocations)?;
        tracing::debug!("workload warmup settled after {} units", warmup);

        let actual = run.actual(workload, IterationMode::Workload, pilot.invocations)?;
        tracing::debug!("workload actual stage recorded {} units", actual);

        if self.config.evaluate_overhead {
            let overhead = self.overhead.as_mut();
            run.warmup(overhead, IterationMode::Overhead, pilot.invocations)?;
            run.actual(overhead, IterationMode::Overhead, pilot.invocations)?;
        }

        Ok(RunResults {
            invocations: pilot.invocations,
            unroll: self.config.unroll_factor,
            uncertain: pilot.uncertain,
            pilot_rounds: pilot.rounds,
            overhead_evaluated: self.config.evaluate_overhead,
            measurements: run.measurements,
        })
    }
}

/// Per-run state shared by the stage loops
struct StageRunner<'r, C: Clock> {
    config: &'r EngineConfig,
    clock: &'r C,
    cache: Option<&'static dyn CacheClearingStrategy>,
    interrupted: fn() -> bool,
    observer: &'r mut dyn MeasurementObserver,
    measurements: Vec<IterationMeasurement>,
}

impl<C: Clock> StageRunner<'_, C> {
    fn measure(
        &mut self,
        workload: &mut dyn Workload,
        tag: StageTag,
        index: u32,
        invocations: u64,
    ) -> Result<IterationMeasurement, EngineError> {
        if (self.interrupted)() {
            return Err(EngineError::Interrupted(tag));
        }
        if let Some(cache) = self.cache {
            cache.clear_cache(self.config.affinity);
        }

        crate::runtime::set_stage(Some(tag));
        let before = self.config.track_allocations.then(AllocationSnapshot::now);
        let timer = Timer::start(self.clock);
        workload.run(invocations);
        let elapsed_ns = timer.stop();
        let allocations = before.map(|b| AllocationSnapshot::now().since(&b));
        crate::runtime::set_stage(None);

        let measurement = IterationMeasurement {
            tag,
            index,
            invocations,
            elapsed_ns,
            allocations,
        };
        self.observer.on_measurement(&measurement)?;
        self.measurements.push(measurement);
        Ok(measurement)
    }

    fn pilot(&mut self, workload: &mut dyn Workload) -> Result<PilotOutcome, EngineError> {
        let tag = StageTag::new(IterationMode::Workload, IterationStage::Pilot);
        let planner = PilotPlanner::new(self.config, self.clock.resolution_ns());

        let mut invocations = planner.first();
        let mut rounds = 0;
        loop {
            rounds += 1;
            let unit = self.measure(workload, tag, rounds, invocations)?;
            match planner.next(invocations, unit.elapsed_ns, rounds) {
                PilotStep::Continue(next) => invocations = next,
                PilotStep::Done => {
                    return Ok(PilotOutcome {
                        invocations,
                        rounds,
                        uncertain: false,
                    });
                }
                PilotStep::Exhausted => {
                    tracing::warn!(
                        "pilot stopped at {} invocations without reaching {} ns per unit; \
                         results carry elevated uncertainty",
                        invocations,
                        planner.target_ns()
                    );
                    return Ok(PilotOutcome {
                        invocations,
                        rounds,
                        uncertain: true,
                    });
                }
            }
        }
    }

    fn warmup(
        &mut self,
        workload: &mut dyn Workload,
        mode: IterationMode,
        invocations: u64,
    ) -> Result<usize, EngineError> {
        let tag = StageTag::new(mode, IterationStage::Warmup);
        let criterion = self.config.warmup_criterion();
        let mut per_invocation = Vec::new();
        while !criterion.should_stop(&per_invocation) {
            let index = per_invocation.len() as u32 + 1;
            let unit = self.measure(workload, tag, index, invocations)?;
            per_invocation.push(unit.per_invocation_ns());
        }
        Ok(per_invocation.len())
    }

    fn actual(
        &mut self,
        workload: &mut dyn Workload,
        mode: IterationMode,
        invocations: u64,
    ) -> Result<usize, EngineError> {
        let tag = StageTag::new(mode, IterationStage::Actual);
        let criterion = self.config.actual_criterion();
        let mut per_invocation = Vec::new();
        while !criterion.should_stop(&per_invocation) {
            let index = per_invocation.len() as u32 + 1;
            let unit = self.measure(workload, tag, index, invocations)?;
            per_invocation.push(unit.per_invocation_ns());
        }
        Ok(per_invocation.len())
    }
}
