//! Engine output

use serde::{Deserialize, Serialize};
use stagebench_ipc::{CompletionLine, IterationMode, IterationStage, MeasurementLine, StageTag};

/// One timed unit; never changed after it is recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationMeasurement {
    /// Mode and stage of the unit
    pub tag: StageTag,
    /// 1-based index within its stage
    pub index: u32,
    /// Raw invocations batched into the unit
    pub invocations: u64,
    /// Wall-clock duration
    pub elapsed_ns: u64,
    /// Allocated bytes and allocation count, when tracked
    pub allocations: Option<(u64, u64)>,
}

impl IterationMeasurement {
    /// Elapsed time divided by the invocation count.
    pub fn per_invocation_ns(&self) -> f64 {
        self.elapsed_ns as f64 / self.invocations.max(1) as f64
    }

    /// Stdout protocol form of this unit.
    pub fn to_line(&self) -> MeasurementLine {
        MeasurementLine {
            tag: self.tag,
            index: self.index,
            invocations: self.invocations,
            elapsed_ns: self.elapsed_ns,
            allocations: self.allocations,
        }
    }
}

impl From<MeasurementLine> for IterationMeasurement {
    fn from(line: MeasurementLine) -> Self {
        Self {
            tag: line.tag,
            index: line.index,
            invocations: line.invocations,
            elapsed_ns: line.elapsed_ns,
            allocations: line.allocations,
        }
    }
}

/// Everything the Done state hands downstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResults {
    /// Invocations per unit after the pilot stage
    pub invocations: u64,
    /// Unroll factor the count is aligned to
    pub unroll: u64,
    /// Pilot hit its ceiling below the target duration
    pub uncertain: bool,
    /// Pilot units that were run
    pub pilot_rounds: u32,
    /// Overhead stage ran
    pub overhead_evaluated: bool,
    /// Every unit in the order it ran
    pub measurements: Vec<IterationMeasurement>,
}

impl RunResults {
    /// Rebuild results on the parent side from protocol lines.
    pub fn from_lines(lines: &[MeasurementLine], completion: &CompletionLine) -> Self {
        let measurements: Vec<IterationMeasurement> = lines.iter().copied().map(Into::into).collect();
        let overhead_tag = StageTag::new(IterationMode::Overhead, IterationStage::Actual);
        let pilot_rounds = measurements
            .iter()
            .filter(|m| m.tag.stage == IterationStage::Pilot)
            .count() as u32;
        Self {
            invocations: completion.invocations,
            unroll: completion.unroll,
            uncertain: completion.uncertain,
            pilot_rounds,
            overhead_evaluated: measurements.iter().any(|m| m.tag == overhead_tag),
            measurements,
        }
    }

    /// Units recorded under `tag`.
    pub fn stage(&self, tag: StageTag) -> impl Iterator<Item = &IterationMeasurement> {
        self.measurements.iter().filter(move |m| m.tag == tag)
    }

    /// Number of units recorded under `tag`.
    pub fn stage_count(&self, tag: StageTag) -> usize {
        self.stage(tag).count()
    }

    /// Workload warmup units whose timings were discarded.
    pub fn discarded_warmup(&self) -> usize {
        self.stage_count(StageTag::new(IterationMode::Workload, IterationStage::Warmup))
    }

    /// Total raw invocations across the workload actual units.
    pub fn actual_operations(&self) -> u64 {
        self.stage(StageTag::WORKLOAD_ACTUAL).map(|m| m.invocations).sum()
    }

    /// Median per-invocation cost of the empty body, if it was measured.
    pub fn overhead_per_invocation(&self) -> Option<f64> {
        let tag = StageTag::new(IterationMode::Overhead, IterationStage::Actual);
        let samples: Vec<f64> = self.stage(tag).map(IterationMeasurement::per_invocation_ns).collect();
        median(&samples)
    }

    /// Per-invocation workload cost of each actual unit, overhead removed.
    ///
    /// Estimates never go below zero.
    pub fn per_invocation_estimates(&self) -> Vec<f64> {
        let overhead = self.overhead_per_invocation().unwrap_or(0.0);
        self.stage(StageTag::WORKLOAD_ACTUAL)
            .map(|m| (m.per_invocation_ns() - overhead).max(0.0))
            .collect()
    }

    /// Sentinel line summarizing this run.
    pub fn completion_line(&self) -> CompletionLine {
        CompletionLine {
            invocations: self.invocations,
            unroll: self.unroll,
            uncertain: self.uncertain,
        }
    }
}

/// Median of `values`; `None` when empty.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}
