//! Partitions
//!
//! A partition groups benchmark cases that compile into one shared artifact.
//! It is created once per run, before any build step, and never changes
//! afterwards: every field is private and only readable through getters.

use crate::ToolchainError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One argument passed through to the build tool, kept verbatim
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildArgument(String);

impl BuildArgument {
    /// Wrap an argument's text representation.
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Text passed to the build tool.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name/value pair injected into a child or build process
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    /// Variable name
    pub name: String,
    /// Variable value
    pub value: String,
}

impl EnvironmentVariable {
    /// New variable.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Per-case job settings that influence the build
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobConfig {
    /// Custom build-tool arguments; `None` when the job never set any
    #[serde(default)]
    pub build_arguments: Option<Vec<BuildArgument>>,
    /// Variables for the build tool and the measured child
    #[serde(default)]
    pub environment: Vec<EnvironmentVariable>,
}

/// One benchmark case: a registered workload id plus its job settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkCase {
    /// Workload id the child resolves
    pub id: String,
    /// Job settings
    #[serde(default)]
    pub job: JobConfig,
}

impl BenchmarkCase {
    /// Case with default job settings.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            job: JobConfig::default(),
        }
    }

    /// Same case with custom build arguments.
    pub fn with_build_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.job.build_arguments = Some(arguments.into_iter().map(BuildArgument::new).collect());
        self
    }

    /// Same case with an extra environment variable.
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.job.environment.push(EnvironmentVariable::new(name, value));
        self
    }
}

/// Custom build arguments of `case`, space-joined in order.
///
/// `None` when the job carries no arguments; that is an absence, not an error.
/// Blank arguments are skipped; a list with nothing else in it is `None` too.
pub fn custom_build_arguments(case: &BenchmarkCase) -> Option<String> {
    let arguments = case.job.build_arguments.as_ref()?;
    let joined = arguments
        .iter()
        .map(|a| a.as_str().trim())
        .filter(|a| !a.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!joined.is_empty()).then_some(joined)
}

/// Check that `id` names exactly one directory below the artifacts root.
///
/// Rejects empty ids, `.`, `..`, absolute paths and anything containing a
/// path separator.
pub fn validate_partition_id(id: &str) -> Result<(), ToolchainError> {
    let invalid = id.trim().is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\', '\0'])
        || std::path::Path::new(id).is_absolute();
    if invalid {
        return Err(ToolchainError::InvalidPartitionId(id.to_string()));
    }
    Ok(())
}

/// Cases sharing one build artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    id: String,
    build_configuration: String,
    cases: Vec<BenchmarkCase>,
    custom_arguments: Option<String>,
}

impl Partition {
    /// Build a partition; the first case is the representative one.
    ///
    /// Returns `None` for an empty case list.
    pub fn new(
        id: impl Into<String>,
        build_configuration: impl Into<String>,
        cases: Vec<BenchmarkCase>,
    ) -> Option<Self> {
        let representative = cases.first()?;
        let custom_arguments = custom_build_arguments(representative);
        Some(Self {
            id: id.into(),
            build_configuration: build_configuration.into(),
            cases,
            custom_arguments,
        })
    }

    /// Identifier, also the artifact directory name.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Build configuration, e.g. `Release`.
    pub fn build_configuration(&self) -> &str {
        &self.build_configuration
    }

    /// Every case in the partition.
    pub fn cases(&self) -> &[BenchmarkCase] {
        &self.cases
    }

    /// Case whose job settings resolve the shared build arguments.
    pub fn representative_case(&self) -> &BenchmarkCase {
        // `new` rejects empty case lists
        &self.cases[0]
    }

    /// Resolved custom build arguments of the representative case.
    pub fn custom_arguments(&self) -> Option<&str> {
        self.custom_arguments.as_deref()
    }

    /// Environment shared by every build command of the partition.
    pub fn environment(&self) -> &[EnvironmentVariable] {
        &self.representative_case().job.environment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_arguments_are_none() {
        assert_eq!(custom_build_arguments(&BenchmarkCase::new("a")), None);
    }

    #[test]
    fn test_arguments_keep_order() {
        let case = BenchmarkCase::new("a").with_build_arguments(["/p:A=1", "/p:B=2", "--no-restore"]);
        assert_eq!(
            custom_build_arguments(&case).as_deref(),
            Some("/p:A=1 /p:B=2 --no-restore")
        );
    }

    #[test]
    fn test_representative_is_first_case() {
        let partition = Partition::new(
            "p1",
            "Release",
            vec![
                BenchmarkCase::new("first").with_build_arguments(["/p:X=1"]).with_env("K", "V"),
                BenchmarkCase::new("second").with_build_arguments(["/p:Y=2"]),
            ],
        )
        .unwrap();
        assert_eq!(partition.representative_case().id, "first");
        assert_eq!(partition.custom_arguments(), Some("/p:X=1"));
        assert_eq!(partition.environment(), &[EnvironmentVariable::new("K", "V")]);
        assert_eq!(partition.cases().len(), 2);
    }

    #[test]
    fn test_blank_arguments_resolve_to_none() {
        let case = BenchmarkCase::new("a").with_build_arguments(Vec::<String>::new());
        assert_eq!(custom_build_arguments(&case), None);
        let case = BenchmarkCase::new("a").with_build_arguments(["", " /p:A=1 ", "  "]);
        assert_eq!(custom_build_arguments(&case).as_deref(), Some("/p:A=1"));
    }

    #[test]
    fn test_partition_id_must_be_plain_name() {
        for bad in ["", "  ", ".", "..", "../up", "a/b", "a\\b", "/abs"] {
            assert!(
                matches!(validate_partition_id(bad), Err(ToolchainError::InvalidPartitionId(_))),
                "{bad:?} accepted"
            );
        }
        for good in ["net8", "alloc-heavy", "x.y", "..hidden"] {
            assert!(validate_partition_id(good).is_ok(), "{good:?} rejected");
        }
    }

    #[test]
    fn test_empty_partition_rejected() {
        assert!(Partition::new("p", "Release", Vec::new()).is_none());
    }

    #[test]
    fn test_job_config_from_json() {
        let case: BenchmarkCase =
            serde_json::from_str(r#"{"id": "x", "job": {"build_arguments": ["/p:Z=3"]}}"#).unwrap();
        assert_eq!(case.job.build_arguments, Some(vec![BuildArgument::new("/p:Z=3")]));
        assert!(case.job.environment.is_empty());
    }
}
