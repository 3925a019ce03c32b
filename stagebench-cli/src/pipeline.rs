//! Partition Pipeline
//!
//! generate -> restore/build/publish -> launch each case -> collect -> cleanup.
//!
//! A partition's artifact is built at most once. If any build stage fails no
//! child is launched for it, and a failing partition never stops the others.

use crate::supervisor::{ChildLauncher, ChildRun, SupervisorError};
use chrono::{DateTime, Utc};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use stagebench_core::{EngineConfig, RunResults};
use stagebench_diag::{DiagnosticsOutcome, ProfileDescriptor, ThreadingStats};
use stagebench_toolchain::{
    ArtifactGenerator, BuildCommand, BuildFailure, BuildStage, CommandExecutor, GeneratedArtifact, Partition,
    ToolchainError,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Partition-level failures
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to prepare artifact: {0}")]
    Generate(#[from] ToolchainError),

    #[error(transparent)]
    Build(#[from] BuildFailure),

    #[error("publish reported success but {0} does not exist")]
    MissingBinary(PathBuf),

    #[error("case {case}: {source}")]
    Launch {
        case: String,
        #[source]
        source: SupervisorError,
    },
}

impl PipelineError {
    /// Pipeline stage the failure belongs to.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Generate(_) => "generate",
            PipelineError::Build(failure) => match failure.stage {
                BuildStage::Restore => "restore",
                BuildStage::Build => "build",
                BuildStage::Publish => "publish",
            },
            PipelineError::MissingBinary(_) => "publish",
            PipelineError::Launch { .. } => "launch",
        }
    }
}

/// Final record for one benchmark case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// Partition the case was built in
    pub partition: String,
    /// Case id
    pub case: String,
    /// When the child finished
    pub timestamp: DateTime<Utc>,
    /// Per-invocation workload cost of each actual unit, overhead removed
    pub estimates_ns: Vec<f64>,
    /// Median per-invocation overhead, when evaluated
    pub overhead_ns: Option<f64>,
    /// Workload warmup units that were discarded
    pub discarded_warmup: usize,
    /// Invocations per measured unit did not reach the target duration, or the
    /// run was interrupted
    pub uncertain: bool,
    /// The run-level timeout killed the child
    pub timed_out: bool,
    /// Runtime counters, or why there are none
    pub diagnostics: DiagnosticsOutcome,
    /// Threading counters per operation, when collected
    pub threading: Option<ThreadingStats>,
    /// Every unit the child reported
    pub results: RunResults,
}

impl MeasurementRecord {
    /// Merge engine output and diagnostics of one child.
    pub fn from_run(partition: &str, run: ChildRun) -> Self {
        let threading = run
            .diagnostics
            .counters()
            .and_then(|c| c.threading(run.results.actual_operations()));
        Self {
            partition: partition.to_string(),
            case: run.case_id,
            timestamp: Utc::now(),
            estimates_ns: run.results.per_invocation_estimates(),
            overhead_ns: run.results.overhead_per_invocation(),
            discarded_warmup: run.results.discarded_warmup(),
            uncertain: run.results.uncertain,
            timed_out: run.timed_out,
            diagnostics: run.diagnostics,
            threading,
            results: run.results,
        }
    }
}

/// Measurements of one built partition
///
/// A case whose child could not be run is listed in `failures`; the other
/// cases are still measured.
#[derive(Debug, Default)]
pub struct PartitionRun {
    /// One record per case that produced results
    pub records: Vec<MeasurementRecord>,
    /// `PipelineError::Launch` for every case that did not
    pub failures: Vec<PipelineError>,
}

impl PartitionRun {
    /// Whether every case produced a record.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Pipeline settings shared by every partition
#[derive(Clone)]
pub struct Pipeline {
    tool: PathBuf,
    generator: ArtifactGenerator,
    executor: Arc<dyn CommandExecutor>,
    extra_arguments: Vec<String>,
    build_timeout: Option<Duration>,
    engine: EngineConfig,
    profile: Option<ProfileDescriptor>,
    attach_timeout: Duration,
    run_timeout: Duration,
}

impl Pipeline {
    /// Pipeline building with `tool` through `executor`.
    pub fn new(
        tool: impl Into<PathBuf>,
        generator: ArtifactGenerator,
        executor: Arc<dyn CommandExecutor>,
        engine: EngineConfig,
    ) -> Self {
        Self {
            tool: tool.into(),
            generator,
            executor,
            extra_arguments: Vec::new(),
            build_timeout: None,
            engine,
            profile: None,
            attach_timeout: Duration::from_secs(5),
            run_timeout: Duration::from_secs(120),
        }
    }

    /// Arguments appended to every build command.
    pub fn with_extra_arguments(mut self, arguments: Vec<String>) -> Self {
        self.extra_arguments = arguments;
        self
    }

    /// Per-stage build timeout.
    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = Some(timeout);
        self
    }

    /// Diagnostic profile attached to every child.
    pub fn with_profile(mut self, profile: Option<ProfileDescriptor>) -> Self {
        self.profile = profile;
        self
    }

    /// Handshake and run-level timeouts.
    pub fn with_timeouts(mut self, attach: Duration, run: Duration) -> Self {
        self.attach_timeout = attach;
        self.run_timeout = run;
        self
    }

    fn build_command(&self, partition: &Arc<Partition>, artifact: &GeneratedArtifact) -> BuildCommand {
        let mut command = BuildCommand::new(&self.tool, artifact.project_dir(), Arc::clone(partition))
            .extend_arguments(self.extra_arguments.iter().cloned());
        if let Some(dir) = artifact.packages_dir() {
            command = command.with_packages_dir(dir);
        }
        if let Some(timeout) = self.build_timeout {
            command = command.with_timeout(timeout);
        }
        command
    }

    /// Build `partition` once and measure each of its cases.
    ///
    /// Fails as a whole only when the artifact cannot be produced.
    pub fn run_partition(&self, partition: &Partition) -> Result<PartitionRun, PipelineError> {
        let partition = Arc::new(partition.clone());
        let artifact = self.generator.generate(&partition)?;
        tracing::info!("partition {}: building {} case(s)", partition.id(), partition.cases().len());

        let outcome = self.build_and_measure(&partition, &artifact);

        if let Err(e) = artifact.cleanup() {
            tracing::warn!("partition {}: cleanup failed: {}", partition.id(), e);
        }
        outcome
    }

    fn build_and_measure(
        &self,
        partition: &Arc<Partition>,
        artifact: &GeneratedArtifact,
    ) -> Result<PartitionRun, PipelineError> {
        self.build_command(partition, artifact)
            .restore_then_build_then_publish(self.executor.as_ref())?;

        let binary = artifact.binary_path();
        if !binary.exists() {
            return Err(PipelineError::MissingBinary(binary.to_path_buf()));
        }

        let launcher = ChildLauncher::new(binary, self.engine.clone())
            .with_profile(self.profile.clone())
            .with_environment(partition.environment().to_vec())
            .with_attach_timeout(self.attach_timeout)
            .with_run_timeout(self.run_timeout);

        let mut outcome = PartitionRun::default();
        for case in partition.cases() {
            let run = match launcher.launch(case) {
                Ok(run) => run,
                Err(source) => {
                    tracing::error!("{}: {}", case.id, source);
                    outcome.failures.push(PipelineError::Launch {
                        case: case.id.clone(),
                        source,
                    });
                    continue;
                }
            };
            if run.diagnostics.is_unavailable() {
                tracing::warn!("{}: diagnostics unavailable", case.id);
            }
            tracing::info!(
                "{}: {} actual units, {} invocations per unit{}",
                case.id,
                run.results.stage_count(stagebench_ipc::StageTag::WORKLOAD_ACTUAL),
                run.results.invocations,
                if run.results.uncertain { " (uncertain)" } else { "" }
            );
            outcome.records.push(MeasurementRecord::from_run(partition.id(), run));
        }
        Ok(outcome)
    }
}

/// Outcome of one partition in a multi-partition run
#[derive(Debug)]
pub struct PartitionReport {
    /// Partition id
    pub partition: String,
    /// Measurements, or the failure that stopped the partition
    pub outcome: Result<PartitionRun, PipelineError>,
}

/// Runs independent partitions, optionally in parallel
pub struct Orchestrator {
    pipeline: Pipeline,
    jobs: usize,
}

impl Orchestrator {
    /// Orchestrator processing up to `jobs` partitions at once.
    pub fn new(pipeline: Pipeline, jobs: usize) -> Self {
        Self {
            pipeline,
            jobs: jobs.max(1),
        }
    }

    /// Run every partition; one report per partition, in input order.
    pub fn run_all(&self, partitions: &[Partition]) -> Vec<PartitionReport> {
        let run = |partition: &Partition| {
            let outcome = self.pipeline.run_partition(partition);
            match &outcome {
                Ok(run) if !run.is_complete() => tracing::warn!(
                    "partition {}: {} of {} case(s) failed to run",
                    partition.id(),
                    run.failures.len(),
                    partition.cases().len()
                ),
                Ok(_) => {}
                Err(e) => tracing::warn!("partition {} failed during {}: {}", partition.id(), e.stage(), e),
            }
            PartitionReport {
                partition: partition.id().to_string(),
                outcome,
            }
        };

        if self.jobs == 1 || partitions.len() <= 1 {
            return partitions.iter().map(run).collect();
        }

        let pool = match ThreadPoolBuilder::new()
            .num_threads(self.jobs.min(partitions.len()))
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                tracing::warn!("failed to build partition pool ({}), running sequentially", e);
                return partitions.iter().map(run).collect();
            }
        };
        pool.install(|| partitions.par_iter().map(run).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagebench_toolchain::{BenchmarkCase, CommandResult, CommandSpec};
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex;

    const HOST: &str = r#"#!/bin/sh
echo "WorkloadWarmup 1: 16 op, 2000 ns"
echo "WorkloadActual 1: 16 op, 1600 ns"
echo "WorkloadActual 2: 16 op, 1760 ns"
echo "OverheadActual 1: 16 op, 160 ns"
echo "// Run complete: invocations=16 unroll=16 uncertain=false"
"#;

    /// Pretends to be the build tool; publish drops a scripted host binary
    struct FakeTool {
        calls: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    impl FakeTool {
        fn new(fail_on: Option<&'static str>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_on,
            }
        }

        fn verbs(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandExecutor for FakeTool {
        fn execute(&self, spec: &CommandSpec) -> CommandResult {
            let verb = spec.argv()[0].clone();
            self.calls.lock().unwrap().push(verb.clone());
            if Some(verb.as_str()) == self.fail_on {
                return CommandResult::failed(spec.arguments.clone(), Some(1), "error: broken project");
            }
            if verb == "publish" {
                let project = spec.working_dir.clone().unwrap();
                let binary = project.parent().unwrap().join("bin").join("host");
                std::fs::write(&binary, HOST).unwrap();
                std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
            }
            CommandResult::succeeded(spec.arguments.clone(), "")
        }
    }

    fn pipeline(root: &std::path::Path, tool: Arc<FakeTool>) -> Pipeline {
        Pipeline::new("fake-tool", ArtifactGenerator::new(root, "host"), tool, EngineConfig::default())
    }

    fn partition(id: &str) -> Partition {
        Partition::new(id, "Release", vec![BenchmarkCase::new("a"), BenchmarkCase::new("b")]).unwrap()
    }

    #[test]
    fn test_partition_measured_and_cleaned_up() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = Arc::new(FakeTool::new(None));
        let run = pipeline(tmp.path(), Arc::clone(&tool))
            .run_partition(&partition("p"))
            .unwrap();
        assert!(run.is_complete());
        let records = run.records;

        assert_eq!(tool.verbs(), ["restore", "build", "publish"]);
        assert_eq!(records.len(), 2);
        let record = &records[0];
        assert_eq!(record.partition, "p");
        assert_eq!(record.case, "a");
        assert_eq!(record.overhead_ns, Some(10.0));
        assert_eq!(record.estimates_ns, vec![90.0, 100.0]);
        assert_eq!(record.discarded_warmup, 1);
        assert!(!record.uncertain);
        assert_eq!(record.diagnostics, DiagnosticsOutcome::NotRequested);
        assert!(record.threading.is_none());
        assert!(!tmp.path().join("p").exists());
    }

    #[test]
    fn test_build_failure_launches_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = Arc::new(FakeTool::new(Some("build")));
        let err = pipeline(tmp.path(), Arc::clone(&tool))
            .run_partition(&partition("p"))
            .unwrap_err();

        assert_eq!(err.stage(), "build");
        match err {
            PipelineError::Build(failure) => assert_eq!(failure.description, "error: broken project"),
            other => panic!("expected build failure, got {other}"),
        }
        assert_eq!(tool.verbs(), ["restore", "build"]);
        assert!(!tmp.path().join("p").join("bin").join("host").exists());
    }

    #[test]
    fn test_one_failing_partition_does_not_stop_others() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = Arc::new(FakeTool::new(Some("restore")));
        let failing = pipeline(tmp.path(), tool);
        let reports = Orchestrator::new(failing, 2).run_all(&[partition("x"), partition("y")]);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].partition, "x");
        assert_eq!(reports[1].partition, "y");
        assert!(reports.iter().all(|r| r.outcome.is_err()));

        let tool = Arc::new(FakeTool::new(None));
        let reports = Orchestrator::new(pipeline(tmp.path(), tool), 2).run_all(&[partition("x"), partition("y")]);
        assert!(reports.iter().all(|r| r.outcome.as_ref().is_ok_and(|r| r.records.len() == 2)));
    }

    /// Publishes a host that fails for case `b` only
    struct SelectiveTool;

    impl CommandExecutor for SelectiveTool {
        fn execute(&self, spec: &CommandSpec) -> CommandResult {
            if spec.argv()[0] == "publish" {
                let project = spec.working_dir.clone().unwrap();
                let binary = project.parent().unwrap().join("bin").join("host");
                let host = HOST.replacen("#!/bin/sh\n", "#!/bin/sh\n[ \"$STAGEBENCH_CASE\" = b ] && exit 4\n", 1);
                std::fs::write(&binary, host).unwrap();
                std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
            }
            CommandResult::succeeded(spec.arguments.clone(), "")
        }
    }

    #[test]
    fn test_failed_case_keeps_other_records() {
        let tmp = tempfile::tempdir().unwrap();
        let partition = Partition::new(
            "mixed",
            "Release",
            vec![BenchmarkCase::new("a"), BenchmarkCase::new("b"), BenchmarkCase::new("c")],
        )
        .unwrap();
        let pipeline = Pipeline::new(
            "fake-tool",
            ArtifactGenerator::new(tmp.path(), "host"),
            Arc::new(SelectiveTool),
            EngineConfig::default(),
        );

        let run = pipeline.run_partition(&partition).unwrap();
        assert!(!run.is_complete());
        let cases: Vec<&str> = run.records.iter().map(|r| r.case.as_str()).collect();
        assert_eq!(cases, ["a", "c"]);
        assert_eq!(run.failures.len(), 1);
        assert_eq!(run.failures[0].stage(), "launch");
        assert!(matches!(&run.failures[0], PipelineError::Launch { case, .. } if case == "b"));
    }

    #[test]
    fn test_record_serializes() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = Arc::new(FakeTool::new(None));
        let run = pipeline(tmp.path(), tool).run_partition(&partition("json")).unwrap();
        let json = serde_json::to_value(&run.records[0]).unwrap();
        assert_eq!(json["case"], "a");
        assert_eq!(json["diagnostics"]["status"], "not_requested");
        assert!(json["timestamp"].is_string());
    }
}
