//! End-to-end checks across the engine, the runtime event sink, counter
//! finalization and the build command layer.

use serial_test::serial;
use stagebench::runtime::{self, ContendedMutex};
use stagebench::{
    BenchmarkCase, BuildCommand, BuildStage, CacheClearingStrategy, CommandExecutor,
    CommandResult, CommandSpec, DiagnosticProfile, EngineConfig, FnWorkload, IterationEngine,
    IterationMeasurement, NoOpCacheClearingStrategy, Partition, RunResults, RuntimeCounters,
    StageTag, ThreadingStats, Workload, build_command,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn fixed_config() -> EngineConfig {
    EngineConfig {
        invocation_count: Some(4),
        unroll_factor: 1,
        warmup_count: Some(1),
        iteration_count: Some(3),
        evaluate_overhead: false,
        ..Default::default()
    }
}

/// Run `workload` under the Threading profile and return its per-op counters.
fn run_with_threading(workload: &mut dyn Workload) -> (RunResults, ThreadingStats) {
    let providers = DiagnosticProfile::Threading.providers().to_vec();
    runtime::install(providers.clone());

    let mut engine = IterationEngine::new(fixed_config()).unwrap();
    let mut observed: Vec<IterationMeasurement> = Vec::new();
    let results = engine.run(workload, &mut observed).unwrap();

    assert!(runtime::quiesce(Duration::from_secs(5)));
    let (events, dropped) = runtime::uninstall();
    let counters = RuntimeCounters::from_events(&providers, &events, dropped, false);
    let stats = counters.threading(results.actual_operations()).unwrap();
    (results, stats)
}

#[test]
#[serial]
fn test_one_work_item_per_operation() {
    let mut workload = FnWorkload(|| runtime::spawn_work_item(|| {}));
    let (results, stats) = run_with_threading(&mut workload);

    assert_eq!(results.actual_operations(), 12);
    assert_eq!(results.stage_count(StageTag::WORKLOAD_ACTUAL), 3);
    assert_eq!(stats.operations, 12);
    assert_eq!(stats.completed_work_items, Some(1.0));
    assert_eq!(stats.lock_contentions, Some(0.0));
}

#[test]
#[serial]
fn test_no_work_items_for_empty_body() {
    let mut workload = FnWorkload(|| {});
    let (_, stats) = run_with_threading(&mut workload);

    assert_eq!(stats.completed_work_items, Some(0.0));
    assert_eq!(stats.lock_contentions, Some(0.0));
}

static GATE: ContendedMutex<()> = ContendedMutex::new(());

#[test]
#[serial]
fn test_one_contention_per_operation() {
    let mut workload = FnWorkload(|| {
        let _held = GATE.lock();
        std::thread::scope(|s| {
            s.spawn(|| {
                let attempt = GATE.try_lock_for(Duration::ZERO);
                assert!(attempt.is_none());
            });
        });
    });
    let (_, stats) = run_with_threading(&mut workload);

    assert_eq!(stats.lock_contentions, Some(1.0));
    assert_eq!(stats.completed_work_items, Some(0.0));
}

#[test]
#[serial]
fn test_uncontended_lock_reports_nothing() {
    let mut workload = FnWorkload(|| {
        let _held = GATE.lock();
    });
    let (_, stats) = run_with_threading(&mut workload);

    assert_eq!(stats.lock_contentions, Some(0.0));
}

#[test]
#[serial]
fn test_no_counters_without_profile() {
    let mut engine = IterationEngine::new(fixed_config()).unwrap();
    let mut workload = FnWorkload(|| runtime::spawn_work_item(|| {}));
    engine.run(&mut workload, &mut ()).unwrap();
    assert!(runtime::quiesce(Duration::from_secs(5)));

    let (events, dropped) = runtime::uninstall();
    assert!(events.is_empty());
    assert_eq!(dropped, 0);
}

#[test]
#[serial]
fn test_noop_cache_clearing_leaves_runtime_alone() {
    static NOOP: NoOpCacheClearingStrategy = NoOpCacheClearingStrategy;

    let installed = runtime::is_installed();
    let stage = runtime::current_stage();
    NOOP.clear_cache(None);
    NOOP.clear_cache(Some(1));
    assert!(!NOOP.is_native());
    assert_eq!(runtime::is_installed(), installed);
    assert_eq!(runtime::current_stage(), stage);

    let config = EngineConfig {
        clear_cache: true,
        ..fixed_config()
    };
    let mut engine = IterationEngine::new(config).unwrap().with_cache_strategy(&NOOP);
    let mut workload = FnWorkload(|| {});
    let results = engine.run(&mut workload, &mut ()).unwrap();
    assert_eq!(results.actual_operations(), 12);
    assert_eq!(runtime::current_stage(), None);
}

fn sum_body() {
    std::hint::black_box((0..64u64).sum::<u64>());
}

stagebench::workload!("integration_sum", sum_body);

#[test]
fn test_registered_workload_is_found() {
    let def = stagebench::find_workload("integration_sum").unwrap();
    assert_eq!(def.id, "integration_sum");
    assert!(def.file.ends_with("integration.rs"));
    assert!(stagebench::find_workload("not_registered").is_none());
}

#[derive(Default)]
struct FailingTool {
    calls: Mutex<Vec<String>>,
}

impl CommandExecutor for FailingTool {
    fn execute(&self, spec: &CommandSpec) -> CommandResult {
        self.calls.lock().unwrap().push(spec.arguments.clone());
        CommandResult::failed(spec.arguments.clone(), Some(1), "feed unreachable")
    }
}

fn partition() -> Partition {
    Partition::new("net8", "Release", vec![BenchmarkCase::new("integration_sum")]).unwrap()
}

#[test]
fn test_failed_restore_skips_build() {
    let tool = FailingTool::default();
    let command = BuildCommand::new("dotnet", "/tmp/stagebench-unused", Arc::new(partition()));

    let failure = command.restore_then_build(&tool).unwrap_err();
    assert_eq!(failure.stage, BuildStage::Restore);
    assert_eq!(failure.description, "feed unreachable");

    let calls = tool.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].starts_with("restore"));
}

#[test]
fn test_build_command_without_arguments() {
    assert_eq!(
        build_command(&partition(), &[]),
        "build -c Release  /p:UseSharedCompilation=false"
    );
}
