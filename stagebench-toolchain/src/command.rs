//! Build Commands
//!
//! Renders restore/build/publish command lines for a partition and runs them
//! in order, stopping at the first stage that fails.
//!
//! Every line ends with [`USE_SHARED_COMPILATION_FALSE`] so no build is served
//! from a compiler server shared with another partition.

use crate::executor::{CommandExecutor, CommandResult, CommandSpec};
use crate::partition::{EnvironmentVariable, Partition};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Trailing flag disabling the shared compilation server
pub const USE_SHARED_COMPILATION_FALSE: &str = "/p:UseSharedCompilation=false";

/// Custom arguments followed by caller-supplied extras, space-joined.
///
/// Blank pieces are skipped and a user-supplied shared-compilation flag is
/// dropped, since the renderers always append it themselves.
fn argument_tail(partition: &Partition, extra: &[String]) -> String {
    partition
        .custom_arguments()
        .into_iter()
        .chain(extra.iter().map(String::as_str))
        .map(without_shared_compilation_flag)
        .filter(|piece| !piece.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn without_shared_compilation_flag(piece: &str) -> String {
    if !piece.split(' ').any(|token| token == USE_SHARED_COMPILATION_FALSE) {
        return piece.trim().to_string();
    }
    tracing::debug!("dropping explicit {} from build arguments", USE_SHARED_COMPILATION_FALSE);
    piece
        .split(' ')
        .filter(|token| *token != USE_SHARED_COMPILATION_FALSE)
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

/// `restore [--packages "<dir>"] <custom> <extra> /p:UseSharedCompilation=false`
pub fn restore_command(partition: &Partition, packages_dir: Option<&Path>, extra: &[String]) -> String {
    let packages = packages_dir
        .map(|dir| format!("--packages \"{}\" ", dir.display()))
        .unwrap_or_default();
    format!(
        "restore {}{} {}",
        packages,
        argument_tail(partition, extra),
        USE_SHARED_COMPILATION_FALSE
    )
}

/// `build -c <configuration> <custom> <extra> /p:UseSharedCompilation=false`
pub fn build_command(partition: &Partition, extra: &[String]) -> String {
    format!(
        "build -c {} {} {}",
        partition.build_configuration(),
        argument_tail(partition, extra),
        USE_SHARED_COMPILATION_FALSE
    )
}

/// `publish -c <configuration> <custom> <extra> /p:UseSharedCompilation=false`
pub fn publish_command(partition: &Partition, extra: &[String]) -> String {
    format!(
        "publish -c {} {} {}",
        partition.build_configuration(),
        argument_tail(partition, extra),
        USE_SHARED_COMPILATION_FALSE
    )
}

/// Build-tool stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStage {
    /// Package restore
    Restore,
    /// Compilation
    Build,
    /// Producing the runnable artifact
    Publish,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BuildStage::Restore => "restore",
            BuildStage::Build => "build",
            BuildStage::Publish => "publish",
        })
    }
}

/// The first build stage that failed, with the tool's own description
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{stage} failed: {description}")]
pub struct BuildFailure {
    /// Failing stage
    pub stage: BuildStage,
    /// `CommandResult::problem_description` of that stage, verbatim
    pub description: String,
    /// The failing stage's full result
    pub result: CommandResult,
}

impl BuildFailure {
    fn from_result(stage: BuildStage, result: CommandResult) -> Self {
        Self {
            stage,
            description: result.problem_description().to_string(),
            result,
        }
    }
}

/// Immutable build-tool invocation plan for one partition
#[derive(Debug, Clone)]
pub struct BuildCommand {
    tool: PathBuf,
    working_dir: PathBuf,
    packages_dir: Option<PathBuf>,
    partition: Arc<Partition>,
    extra_arguments: Vec<String>,
    environment: Vec<EnvironmentVariable>,
    timeout: Option<Duration>,
}

impl BuildCommand {
    /// Plan for `partition`, run with `tool` inside `working_dir`.
    ///
    /// The partition's shared environment is passed to every stage.
    pub fn new(tool: impl Into<PathBuf>, working_dir: impl Into<PathBuf>, partition: Arc<Partition>) -> Self {
        let environment = partition.environment().to_vec();
        Self {
            tool: tool.into(),
            working_dir: working_dir.into(),
            packages_dir: None,
            partition,
            extra_arguments: Vec::new(),
            environment,
            timeout: None,
        }
    }

    /// Same plan restoring into an explicit package directory.
    pub fn with_packages_dir(&self, dir: impl Into<PathBuf>) -> Self {
        Self {
            packages_dir: Some(dir.into()),
            ..self.clone()
        }
    }

    /// Same plan with a per-stage timeout.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self.clone()
        }
    }

    /// New plan with `arguments` appended after the existing extras.
    pub fn extend_arguments<I, S>(&self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut extra_arguments = self.extra_arguments.clone();
        extra_arguments.extend(arguments.into_iter().map(Into::into));
        Self {
            extra_arguments,
            ..self.clone()
        }
    }

    /// Partition being built.
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Caller-supplied extra arguments.
    pub fn extra_arguments(&self) -> &[String] {
        &self.extra_arguments
    }

    /// Rendered restore line.
    pub fn restore_arguments(&self) -> String {
        restore_command(&self.partition, self.packages_dir.as_deref(), &self.extra_arguments)
    }

    /// Rendered build line.
    pub fn build_arguments(&self) -> String {
        build_command(&self.partition, &self.extra_arguments)
    }

    /// Rendered publish line.
    pub fn publish_arguments(&self) -> String {
        publish_command(&self.partition, &self.extra_arguments)
    }

    fn spec(&self, arguments: String) -> CommandSpec {
        CommandSpec {
            program: self.tool.clone(),
            arguments,
            working_dir: Some(self.working_dir.clone()),
            environment: self.environment.clone(),
            timeout: self.timeout,
        }
    }

    fn run_stage(&self, executor: &dyn CommandExecutor, stage: BuildStage) -> CommandResult {
        let arguments = match stage {
            BuildStage::Restore => self.restore_arguments(),
            BuildStage::Build => self.build_arguments(),
            BuildStage::Publish => self.publish_arguments(),
        };
        tracing::debug!("partition {}: {} `{}`", self.partition.id(), stage, arguments);
        let result = executor.execute(&self.spec(arguments));
        if !result.success {
            tracing::debug!(
                "partition {}: {} exited with {:?}",
                self.partition.id(),
                stage,
                result.exit_code
            );
        }
        result
    }

    /// Run restore.
    pub fn restore(&self, executor: &dyn CommandExecutor) -> CommandResult {
        self.run_stage(executor, BuildStage::Restore)
    }

    /// Run build.
    pub fn build(&self, executor: &dyn CommandExecutor) -> CommandResult {
        self.run_stage(executor, BuildStage::Build)
    }

    /// Run publish.
    pub fn publish(&self, executor: &dyn CommandExecutor) -> CommandResult {
        self.run_stage(executor, BuildStage::Publish)
    }

    fn run_stages(&self, executor: &dyn CommandExecutor, stages: &[BuildStage]) -> Result<CommandResult, BuildFailure> {
        let mut last = None;
        for &stage in stages {
            let result = self.run_stage(executor, stage);
            if !result.success {
                return Err(BuildFailure::from_result(stage, result));
            }
            last = Some(result);
        }
        Ok(last.unwrap_or_else(|| CommandResult::succeeded(String::new(), String::new())))
    }

    /// Restore, then build. Build never runs when restore fails.
    pub fn restore_then_build(&self, executor: &dyn CommandExecutor) -> Result<CommandResult, BuildFailure> {
        self.run_stages(executor, &[BuildStage::Restore, BuildStage::Build])
    }

    /// Restore, build, then publish, stopping at the first failure.
    pub fn restore_then_build_then_publish(
        &self,
        executor: &dyn CommandExecutor,
    ) -> Result<CommandResult, BuildFailure> {
        self.run_stages(
            executor,
            &[BuildStage::Restore, BuildStage::Build, BuildStage::Publish],
        )
    }
}
