#![warn(missing_docs)]
//! Stagebench Core - Child Runtime
//!
//! Everything that runs inside the measured executable:
//! - `IterationEngine`: the Jitting/Pilot/Warmup/Actual/Overhead staged loop
//! - `Clock`/`Timer` with a fake clock for deterministic engine tests
//! - `TrackingAllocator` for per-unit allocation deltas
//! - `CacheClearingStrategy` for instruction-cache normalization
//! - `runtime`: the event sink and instrumented primitives observed by
//!   diagnostic sessions
//! - `ChildHost`: environment contract, handshake and stdout reporting

mod allocator;
mod cache;
pub mod engine;
mod host;
mod measure;
pub mod runtime;

pub use allocator::{AllocationSnapshot, TrackingAllocator};
pub use cache::{
    CacheClearingStrategy, NativeCacheClearingStrategy, NoOpCacheClearingStrategy,
    select_cache_clearing_strategy,
};
pub use engine::{
    EngineConfig, EngineError, FnWorkload, IterationEngine, IterationMeasurement,
    MeasurementObserver, RunResults, Workload,
};
pub use host::{ChildHost, DiagnosticLink, HostError, LineReporter, shutdown_requested};
pub use measure::{AffinityGuard, Clock, FakeClock, SystemClock, Timer, pin_to_cpu, pin_to_mask};

/// Workload registered with `stagebench::workload!`
#[derive(Debug, Clone)]
pub struct WorkloadDef {
    /// Id the orchestrator selects it by
    pub id: &'static str,
    /// Body run once per invocation
    pub body: fn(),
    /// Source file path
    pub file: &'static str,
    /// Source line number
    pub line: u32,
    /// Module path
    pub module_path: &'static str,
}

inventory::collect!(WorkloadDef);

/// Anchor to prevent LTO from stripping inventory entries
#[used]
#[doc(hidden)]
pub static REGISTRY_ANCHOR: fn() = || {
    for _ in inventory::iter::<WorkloadDef> {}
};

/// Every registered workload.
pub fn workloads() -> impl Iterator<Item = &'static WorkloadDef> {
    inventory::iter::<WorkloadDef>.into_iter()
}

/// Registered workload with this id.
pub fn find_workload(id: &str) -> Option<&'static WorkloadDef> {
    workloads().find(|w| w.id == id)
}
