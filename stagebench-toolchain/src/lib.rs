#![warn(missing_docs)]
//! Stagebench Toolchain
//!
//! Everything between a set of benchmark cases and a runnable artifact:
//! - `Partition`: cases compiled into one shared artifact
//! - `BuildCommand`: restore/build/publish command lines and their
//!   short-circuiting execution
//! - `ProcessExecutor`: blocking external command runner
//! - `ArtifactGenerator`: per-partition directory layout and manifest

mod command;
mod executor;
mod generator;
mod partition;

pub use command::{
    BuildCommand, BuildFailure, BuildStage, USE_SHARED_COMPILATION_FALSE, build_command,
    publish_command, restore_command,
};
pub use executor::{CommandExecutor, CommandResult, CommandSpec, ProcessExecutor, split_arguments};
pub use generator::{ArtifactGenerator, GeneratedArtifact, MANIFEST_FILE, PartitionManifest};
pub use partition::{
    BenchmarkCase, BuildArgument, EnvironmentVariable, JobConfig, Partition, custom_build_arguments,
    validate_partition_id,
};

use thiserror::Error;

/// Errors from preparing or building an artifact
#[derive(Debug, Error)]
pub enum ToolchainError {
    /// Filesystem failure in the artifact directory
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest could not be written or read
    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    /// A partition was declared without cases
    #[error("partition '{0}' has no cases")]
    EmptyPartition(String),

    /// A partition id that is not a single plain directory name
    #[error("invalid partition id {0:?}: must be a non-empty directory name without path separators")]
    InvalidPartitionId(String),

    /// Two partitions would share one artifact directory
    #[error("partition id '{0}' is declared more than once")]
    DuplicatePartition(String),

    /// A build stage failed
    #[error(transparent)]
    Build(#[from] BuildFailure),
}
