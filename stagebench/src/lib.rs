#![warn(missing_docs)]
//! # Stagebench
//!
//! Out-of-process benchmarking with a staged iteration engine and runtime
//! diagnostics.
//!
//! - **Staged Engine**: Jitting, Pilot, Warmup, Actual and Overhead stages
//!   converge on a per-invocation estimate with timer-resolution-aware batching
//! - **Build Pipeline**: each partition of cases is restored, built and published
//!   once, then every case runs in its own child process
//! - **Runtime Diagnostics**: named profiles enable work-item, contention,
//!   collection, exception and sampling events, attached through a two-phase
//!   handshake before the first measured unit
//! - **Cache Normalization**: optional instruction-cache flush before every unit,
//!   degrading to a no-op where the platform has no flush primitive
//!
//! ## Measured executable
//!
//! ```ignore
//! fn sum() {
//!     std::hint::black_box((0..1000u64).sum::<u64>());
//! }
//!
//! stagebench::workload!("sum", sum);
//!
//! fn main() -> std::process::ExitCode {
//!     stagebench::run_child()
//! }
//! ```
//!
//! ## Orchestrator
//!
//! ```ignore
//! fn main() -> anyhow::Result<()> {
//!     stagebench::run()
//! }
//! ```

use std::process::ExitCode;

// Re-export the child runtime
pub use stagebench_core::{
    CacheClearingStrategy, ChildHost, Clock, EngineConfig, EngineError, FakeClock, FnWorkload,
    HostError, IterationEngine, IterationMeasurement, MeasurementObserver,
    NativeCacheClearingStrategy, NoOpCacheClearingStrategy, RunResults, SystemClock, Timer,
    TrackingAllocator, Workload, WorkloadDef, engine, find_workload, runtime,
    select_cache_clearing_strategy, workloads,
};

// Re-export diagnostics
pub use stagebench_diag::{
    DiagnosticProfile, DiagnosticSession, DiagnosticsOutcome, ProfileDescriptor,
    ProfileProviderCatalog, RuntimeCounters, ThreadingStats,
};

// Re-export protocol types
pub use stagebench_ipc::{IterationMode, IterationStage, ProviderSpec, StageTag, TraceEvent};

// Re-export the toolchain
pub use stagebench_toolchain::{
    BenchmarkCase, BuildCommand, BuildFailure, BuildStage, CommandExecutor, CommandResult,
    CommandSpec, EnvironmentVariable, Partition, ProcessExecutor, build_command, publish_command,
    restore_command,
};

// Re-export the orchestrator
pub use stagebench_cli::{
    ChildLauncher, MeasurementRecord, Orchestrator, PartitionRun, Pipeline, PipelineError,
    StagebenchConfig,
};

/// Internal re-exports for macro use
#[doc(hidden)]
pub mod internal {
    pub use inventory;
}

/// Register a workload under an id the orchestrator selects it by.
///
/// The body is a `fn()` run once per invocation.
#[macro_export]
macro_rules! workload {
    ($id:expr, $body:expr $(,)?) => {
        $crate::internal::inventory::submit! {
            $crate::WorkloadDef {
                id: $id,
                body: $body,
                file: file!(),
                line: line!(),
                module_path: module_path!(),
            }
        }
    };
}

/// Run the Stagebench orchestrator CLI.
///
/// Call this from the orchestrator binary's `main()`:
/// ```ignore
/// fn main() -> anyhow::Result<()> {
///     stagebench::run()
/// }
/// ```
pub use stagebench_cli::run;

/// Exit code when the child could not resolve what to run
const EXIT_USAGE: u8 = 2;

/// Entry point of a measured executable.
///
/// Reads the run description from the environment, runs the selected
/// workload and reports on stdout. Logs go to stderr.
pub fn run_child() -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("stagebench=warn")
        .with_writer(std::io::stderr)
        .try_init();

    let host = match ChildHost::from_env() {
        Ok(host) => host,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::from(EXIT_USAGE);
        }
    };

    match host.run() {
        Ok(_) => ExitCode::SUCCESS,
        Err(e @ HostError::UnknownCase(_)) => {
            tracing::error!("{}", e);
            ExitCode::from(EXIT_USAGE)
        }
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
