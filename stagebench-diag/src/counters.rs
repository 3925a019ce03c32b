//! Counter Finalization
//!
//! Turns the buffered event stream of a session into typed counters. A counter
//! is `None` when no enabled provider could have produced its events, so
//! "zero observed" and "not collected" stay distinguishable.

use serde::{Deserialize, Serialize};
use stagebench_ipc::{EventKind, ProviderSpec, StageTag, TraceEvent};

/// An event count over the process lifetime and over the workload actual stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageCount {
    /// Every occurrence while the session was collecting
    pub total: u64,
    /// Occurrences attributed to workload actual units
    pub actual: u64,
}

impl StageCount {
    /// Actual-stage occurrences per operation.
    pub fn per_operation(&self, operations: u64) -> f64 {
        if operations == 0 {
            return 0.0;
        }
        self.actual as f64 / operations as f64
    }
}

/// Completed collections per generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GcCounts {
    /// Generation 0
    pub gen0: u64,
    /// Generation 1
    pub gen1: u64,
    /// Generation 2 and above
    pub gen2: u64,
}

/// Counters of one finalized session
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuntimeCounters {
    /// Background work items that finished
    pub completed_work_items: Option<StageCount>,
    /// Lock attempts that found the lock held
    pub lock_contentions: Option<StageCount>,
    /// Heap collections
    pub gc_collections: Option<GcCounts>,
    /// Heap handles created
    pub gc_handles: Option<u64>,
    /// Panics and other unwinding failures
    pub exceptions: Option<u64>,
    /// Sampler ticks
    pub samples: Option<u64>,
    /// Events lost to the child-side buffer bound
    pub dropped_events: u64,
    /// Collection ended before the child said it was finished
    pub partial: bool,
}

/// Threading counters normalized per operation, as reported next to timings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThreadingStats {
    /// Completed work items per operation
    pub completed_work_items: Option<f64>,
    /// Lock contentions per operation
    pub lock_contentions: Option<f64>,
    /// Operations the counts were divided by
    pub operations: u64,
}

fn collected(providers: &[ProviderSpec], kind: EventKind) -> bool {
    let descriptor = kind.descriptor();
    providers.iter().any(|p| p.enables(&descriptor))
}

impl RuntimeCounters {
    /// Count `events` collected under `providers`.
    pub fn from_events(
        providers: &[ProviderSpec],
        events: &[TraceEvent],
        dropped_events: u64,
        partial: bool,
    ) -> Self {
        let enabled = |kind| collected(providers, kind);
        let mut counters = RuntimeCounters {
            completed_work_items: enabled(EventKind::WorkItemCompleted).then(StageCount::default),
            lock_contentions: enabled(EventKind::LockContention).then(StageCount::default),
            gc_collections: enabled(EventKind::GcEnd { generation: 0 }).then(GcCounts::default),
            gc_handles: enabled(EventKind::GcHandleCreated).then_some(0),
            exceptions: enabled(EventKind::Exception).then_some(0),
            samples: enabled(EventKind::SampleTick).then_some(0),
            dropped_events,
            partial,
        };

        for event in events {
            let in_actual = event.stage == Some(StageTag::WORKLOAD_ACTUAL);
            let bump = |count: &mut StageCount| {
                count.total += 1;
                if in_actual {
                    count.actual += 1;
                }
            };
            match event.kind {
                EventKind::WorkItemCompleted => {
                    if let Some(count) = counters.completed_work_items.as_mut() {
                        bump(count);
                    }
                }
                EventKind::LockContention => {
                    if let Some(count) = counters.lock_contentions.as_mut() {
                        bump(count);
                    }
                }
                EventKind::GcEnd { generation } => {
                    if let Some(gc) = counters.gc_collections.as_mut() {
                        match generation {
                            0 => gc.gen0 += 1,
                            1 => gc.gen1 += 1,
                            _ => gc.gen2 += 1,
                        }
                    }
                }
                EventKind::GcHandleCreated => {
                    if let Some(n) = counters.gc_handles.as_mut() {
                        *n += 1;
                    }
                }
                EventKind::Exception => {
                    if let Some(n) = counters.exceptions.as_mut() {
                        *n += 1;
                    }
                }
                EventKind::SampleTick => {
                    if let Some(n) = counters.samples.as_mut() {
                        *n += 1;
                    }
                }
            }
        }
        counters
    }

    /// Threading counters per operation; `None` when neither was collected.
    pub fn threading(&self, operations: u64) -> Option<ThreadingStats> {
        if self.completed_work_items.is_none() && self.lock_contentions.is_none() {
            return None;
        }
        Some(ThreadingStats {
            completed_work_items: self.completed_work_items.map(|c| c.per_operation(operations)),
            lock_contentions: self.lock_contentions.map(|c| c.per_operation(operations)),
            operations,
        })
    }
}

/// What the diagnostic layer contributes to a measurement record
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DiagnosticsOutcome {
    /// No profile was requested
    #[default]
    NotRequested,
    /// A profile was requested but no data could be collected
    Unavailable {
        /// Why attachment or collection failed
        reason: String,
    },
    /// Counters were collected (possibly partially)
    Available(RuntimeCounters),
}

impl DiagnosticsOutcome {
    /// Counters, when collected.
    pub fn counters(&self) -> Option<&RuntimeCounters> {
        match self {
            DiagnosticsOutcome::Available(counters) => Some(counters),
            _ => None,
        }
    }

    /// Whether a requested profile produced no data.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, DiagnosticsOutcome::Unavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagebench_ipc::{EventLevel, IterationMode, IterationStage, RUNTIME_PROVIDER, keywords};

    fn event(kind: EventKind, stage: Option<StageTag>) -> TraceEvent {
        TraceEvent {
            kind,
            stage,
            timestamp_ns: 0,
            thread: 1,
        }
    }

    fn threading() -> Vec<ProviderSpec> {
        vec![ProviderSpec::new(
            RUNTIME_PROVIDER,
            EventLevel::Informational,
            keywords::THREADING | keywords::CONTENTION,
        )]
    }

    #[test]
    fn test_only_actual_stage_counts_per_operation() {
        let warmup = StageTag::new(IterationMode::Workload, IterationStage::Warmup);
        let events = vec![
            event(EventKind::WorkItemCompleted, Some(warmup)),
            event(EventKind::WorkItemCompleted, Some(StageTag::WORKLOAD_ACTUAL)),
            event(EventKind::WorkItemCompleted, Some(StageTag::WORKLOAD_ACTUAL)),
            event(EventKind::WorkItemCompleted, None),
        ];
        let counters = RuntimeCounters::from_events(&threading(), &events, 0, false);
        let items = counters.completed_work_items.unwrap();
        assert_eq!(items, StageCount { total: 4, actual: 2 });

        let stats = counters.threading(2).unwrap();
        assert_eq!(stats.completed_work_items, Some(1.0));
        assert_eq!(stats.lock_contentions, Some(0.0));
    }

    #[test]
    fn test_absent_counters_are_none_not_zero() {
        let gc_only = vec![ProviderSpec::new(RUNTIME_PROVIDER, EventLevel::Informational, keywords::GC)];
        let counters = RuntimeCounters::from_events(&gc_only, &[], 0, false);
        assert_eq!(counters.gc_collections, Some(GcCounts::default()));
        assert_eq!(counters.completed_work_items, None);
        assert_eq!(counters.lock_contentions, None);
        assert_eq!(counters.gc_handles, None);
        assert!(counters.threading(10).is_none());
    }

    #[test]
    fn test_generations_are_split() {
        let gc = vec![ProviderSpec::new(RUNTIME_PROVIDER, EventLevel::Verbose, keywords::GC)];
        let events = vec![
            event(EventKind::GcEnd { generation: 0 }, None),
            event(EventKind::GcEnd { generation: 0 }, None),
            event(EventKind::GcEnd { generation: 1 }, None),
            event(EventKind::GcEnd { generation: 2 }, None),
        ];
        let counters = RuntimeCounters::from_events(&gc, &events, 3, true);
        assert_eq!(counters.gc_collections, Some(GcCounts { gen0: 2, gen1: 1, gen2: 1 }));
        assert_eq!(counters.dropped_events, 3);
        assert!(counters.partial);
    }

    #[test]
    fn test_zero_operations() {
        assert_eq!(StageCount { total: 3, actual: 3 }.per_operation(0), 0.0);
    }

    #[test]
    fn test_outcome_serializes_with_status() {
        let json = serde_json::to_string(&DiagnosticsOutcome::Unavailable {
            reason: "child exited".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"status":"unavailable","reason":"child exited"}"#);
        assert!(DiagnosticsOutcome::NotRequested.counters().is_none());
    }
}
