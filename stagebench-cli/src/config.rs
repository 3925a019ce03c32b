//! Configuration loading from stagebench.toml
//!
//! The configuration is discovered by walking up from the current directory.
//! Every field has a default, so an empty file (or none at all) is valid.

use serde::{Deserialize, Serialize};
use stagebench_core::EngineConfig;
use stagebench_toolchain::{BenchmarkCase, Partition, ToolchainError, validate_partition_id};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Name of the configuration file
pub const CONFIG_FILE: &str = "stagebench.toml";

/// Stagebench configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StagebenchConfig {
    /// Staged iteration loop tuning
    #[serde(default)]
    pub engine: EngineSection,
    /// Build tool and artifact layout
    #[serde(default)]
    pub toolchain: ToolchainSection,
    /// Diagnostic attachment
    #[serde(default)]
    pub diagnostics: DiagnosticsSection,
    /// Child process supervision
    #[serde(default)]
    pub runner: RunnerSection,
    /// Partitions to build and measure
    #[serde(default, rename = "partition")]
    pub partitions: Vec<PartitionSection>,
}

/// `[engine]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Minimum duration of one measured unit (e.g. "250ms")
    #[serde(default = "default_min_iteration_time")]
    pub min_iteration_time: String,
    /// Pilot ceiling on invocations per unit
    #[serde(default = "default_max_invocation_count")]
    pub max_invocation_count: u64,
    /// Minimum growth of the invocation count between pilot rounds
    #[serde(default = "default_pilot_growth_factor")]
    pub pilot_growth_factor: f64,
    /// Invocation counts are rounded up to a multiple of this
    #[serde(default = "default_unroll_factor")]
    pub unroll_factor: u64,
    /// Fixed invocations per unit (skips the pilot stage)
    #[serde(default)]
    pub invocation_count: Option<u64>,
    /// Fixed number of warmup units
    #[serde(default)]
    pub warmup_count: Option<u32>,
    /// Minimum warmup units for automatic warmup
    #[serde(default = "default_min_warmup_count")]
    pub min_warmup_count: u32,
    /// Maximum warmup units for automatic warmup
    #[serde(default = "default_max_warmup_count")]
    pub max_warmup_count: u32,
    /// Direction changes that mark steady state
    #[serde(default = "default_warmup_fluctuations")]
    pub warmup_fluctuations: u32,
    /// Fixed number of measured units
    #[serde(default)]
    pub iteration_count: Option<u32>,
    /// Minimum measured units for automatic stopping
    #[serde(default = "default_min_iteration_count")]
    pub min_iteration_count: u32,
    /// Maximum measured units for automatic stopping
    #[serde(default = "default_max_iteration_count")]
    pub max_iteration_count: u32,
    /// Standard error over mean that ends the actual stage
    #[serde(default = "default_max_relative_error")]
    pub max_relative_error: f64,
    /// Measure and subtract the empty-body overhead
    #[serde(default = "default_true")]
    pub evaluate_overhead: bool,
    /// Flush the instruction cache before every measured unit
    #[serde(default)]
    pub clear_cache: bool,
    /// CPU mask to pin the engine thread to
    #[serde(default)]
    pub affinity: Option<u64>,
    /// Record allocation deltas per unit
    #[serde(default)]
    pub track_allocations: bool,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            min_iteration_time: default_min_iteration_time(),
            max_invocation_count: default_max_invocation_count(),
            pilot_growth_factor: default_pilot_growth_factor(),
            unroll_factor: default_unroll_factor(),
            invocation_count: None,
            warmup_count: None,
            min_warmup_count: default_min_warmup_count(),
            max_warmup_count: default_max_warmup_count(),
            warmup_fluctuations: default_warmup_fluctuations(),
            iteration_count: None,
            min_iteration_count: default_min_iteration_count(),
            max_iteration_count: default_max_iteration_count(),
            max_relative_error: default_max_relative_error(),
            evaluate_overhead: true,
            clear_cache: false,
            affinity: None,
            track_allocations: false,
        }
    }
}

fn default_min_iteration_time() -> String {
    "250ms".to_string()
}
fn default_max_invocation_count() -> u64 {
    1 << 32
}
fn default_pilot_growth_factor() -> f64 {
    2.0
}
fn default_unroll_factor() -> u64 {
    16
}
fn default_min_warmup_count() -> u32 {
    6
}
fn default_max_warmup_count() -> u32 {
    50
}
fn default_warmup_fluctuations() -> u32 {
    4
}
fn default_min_iteration_count() -> u32 {
    15
}
fn default_max_iteration_count() -> u32 {
    100
}
fn default_max_relative_error() -> f64 {
    0.02
}
fn default_true() -> bool {
    true
}

impl EngineSection {
    /// Engine configuration sent to every child, validated.
    pub fn to_engine_config(&self) -> anyhow::Result<EngineConfig> {
        let config = EngineConfig {
            min_iteration_time_ns: StagebenchConfig::parse_duration(&self.min_iteration_time)?.as_nanos() as u64,
            max_invocation_count: self.max_invocation_count,
            pilot_growth_factor: self.pilot_growth_factor,
            unroll_factor: self.unroll_factor,
            invocation_count: self.invocation_count,
            warmup_count: self.warmup_count,
            min_warmup_count: self.min_warmup_count,
            max_warmup_count: self.max_warmup_count,
            warmup_fluctuations: self.warmup_fluctuations,
            iteration_count: self.iteration_count,
            min_iteration_count: self.min_iteration_count,
            max_iteration_count: self.max_iteration_count,
            max_relative_error: self.max_relative_error,
            evaluate_overhead: self.evaluate_overhead,
            clear_cache: self.clear_cache,
            affinity: self.affinity,
            track_allocations: self.track_allocations,
        };
        config.validate()?;
        Ok(config)
    }
}

/// `[toolchain]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainSection {
    /// Build tool executable
    #[serde(default = "default_tool")]
    pub tool: String,
    /// Build configuration used when a partition sets none
    #[serde(default = "default_build_configuration")]
    pub build_configuration: String,
    /// Root of the generated artifact directories
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: String,
    /// File name of the published binary inside `<artifact>/bin`
    #[serde(default = "default_binary_name")]
    pub binary_name: String,
    /// Extra arguments appended to every build command
    #[serde(default)]
    pub extra_arguments: Vec<String>,
    /// Restore packages into each artifact instead of the global cache
    #[serde(default = "default_true")]
    pub isolated_packages: bool,
    /// Keep generated artifacts after measuring
    #[serde(default)]
    pub keep_files: bool,
    /// Timeout of a single build stage (e.g. "10m")
    #[serde(default = "default_build_timeout")]
    pub build_timeout: String,
}

impl Default for ToolchainSection {
    fn default() -> Self {
        Self {
            tool: default_tool(),
            build_configuration: default_build_configuration(),
            artifacts_dir: default_artifacts_dir(),
            binary_name: default_binary_name(),
            extra_arguments: Vec::new(),
            isolated_packages: true,
            keep_files: false,
            build_timeout: default_build_timeout(),
        }
    }
}

fn default_tool() -> String {
    "dotnet".to_string()
}
fn default_build_configuration() -> String {
    "Release".to_string()
}
fn default_artifacts_dir() -> String {
    "target/stagebench".to_string()
}
fn default_binary_name() -> String {
    "stagebench-host".to_string()
}
fn default_build_timeout() -> String {
    "10m".to_string()
}

/// `[diagnostics]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsSection {
    /// Profile name: CpuSampling, GcVerbose, GcCollect or Threading
    #[serde(default)]
    pub profile: Option<String>,
    /// How long to wait for the child's readiness announcement
    #[serde(default = "default_attach_timeout")]
    pub attach_timeout: String,
}

impl Default for DiagnosticsSection {
    fn default() -> Self {
        Self {
            profile: None,
            attach_timeout: default_attach_timeout(),
        }
    }
}

fn default_attach_timeout() -> String {
    "5s".to_string()
}

/// `[runner]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSection {
    /// Run-level timeout of one measured child (e.g. "120s")
    #[serde(default = "default_run_timeout")]
    pub timeout: String,
    /// Partitions processed concurrently
    #[serde(default)]
    pub jobs: Option<usize>,
    /// JSON output file (stdout if not set)
    #[serde(default)]
    pub output: Option<String>,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            timeout: default_run_timeout(),
            jobs: None,
            output: None,
        }
    }
}

fn default_run_timeout() -> String {
    "120s".to_string()
}

/// `[[partition]]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionSection {
    /// Partition id, also the artifact directory name
    pub id: String,
    /// Overrides `[toolchain] build_configuration`
    #[serde(default)]
    pub build_configuration: Option<String>,
    /// Cases in declaration order; the first one is representative
    #[serde(default)]
    pub cases: Vec<BenchmarkCase>,
}

impl PartitionSection {
    /// Immutable partition for this table.
    pub fn to_partition(&self, default_configuration: &str) -> Result<Partition, ToolchainError> {
        let configuration = self
            .build_configuration
            .as_deref()
            .unwrap_or(default_configuration);
        validate_partition_id(&self.id)?;
        Partition::new(self.id.clone(), configuration, self.cases.clone())
            .ok_or_else(|| ToolchainError::EmptyPartition(self.id.clone()))
    }
}

impl StagebenchConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Try to discover and load configuration by walking up from current directory
    pub fn discover() -> Option<Self> {
        let mut dir = std::env::current_dir().ok()?;
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                return match Self::load(&config_path) {
                    Ok(config) => Some(config),
                    Err(e) => {
                        tracing::warn!("ignoring {}: {}", config_path.display(), e);
                        None
                    }
                };
            }
            if !dir.pop() {
                break;
            }
        }
        None
    }

    /// Every `[[partition]]` table as a partition.
    ///
    /// Each partition owns its artifact directory, so ids must be unique.
    pub fn partitions(&self) -> Result<Vec<Partition>, ToolchainError> {
        let mut seen = HashSet::new();
        self.partitions
            .iter()
            .map(|p| {
                if !seen.insert(p.id.as_str()) {
                    return Err(ToolchainError::DuplicatePartition(p.id.clone()));
                }
                p.to_partition(&self.toolchain.build_configuration)
            })
            .collect()
    }

    /// Generate a default configuration as TOML string
    pub fn default_toml() -> String {
        r#"# Stagebench Configuration

[engine]
# Minimum duration of one measured unit
min_iteration_time = "250ms"
# Pilot ceiling on invocations per unit
max_invocation_count = 4294967296
# Minimum growth of the invocation count between pilot rounds
pilot_growth_factor = 2.0
# Invocation counts are multiples of this
unroll_factor = 16
# Fixed invocations per unit, skipping the pilot (uncomment to enable)
# invocation_count = 1024
# Fixed warmup units (uncomment to enable)
# warmup_count = 6
min_warmup_count = 6
max_warmup_count = 50
warmup_fluctuations = 4
# Fixed measured units (uncomment to enable)
# iteration_count = 20
min_iteration_count = 15
max_iteration_count = 100
max_relative_error = 0.02
# Measure the empty body and subtract it
evaluate_overhead = true
# Flush the instruction cache before every measured unit
clear_cache = false
# CPU mask to pin the measured thread to (uncomment to enable)
# affinity = 0x1
# Per-unit allocation deltas
track_allocations = false

[toolchain]
tool = "dotnet"
build_configuration = "Release"
artifacts_dir = "target/stagebench"
binary_name = "stagebench-host"
extra_arguments = []
isolated_packages = true
keep_files = false
build_timeout = "10m"

[diagnostics]
# CpuSampling, GcVerbose, GcCollect or Threading (uncomment to enable)
# profile = "Threading"
attach_timeout = "5s"

[runner]
# Timeout of one measured child
timeout = "120s"
# Partitions processed concurrently (uncomment to enable)
# jobs = 2
# JSON output file (uncomment to enable)
# output = "target/stagebench/results.json"

# [[partition]]
# id = "collections"
#
# [[partition.cases]]
# id = "vec_push"
#
# [partition.cases.job]
# build_arguments = ["/p:Optimize=true"]
"#
        .to_string()
    }

    /// Parse duration string (e.g., "3s", "500ms", "2m")
    pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
        let s = s.trim();
        if s.is_empty() {
            return Err(anyhow::anyhow!("Empty duration string"));
        }

        // Find where the number ends and unit begins
        let (num_part, unit_part) = s
            .char_indices()
            .find(|(_, c)| c.is_alphabetic() || *c == 'µ')
            .map(|(i, _)| s.split_at(i))
            .unwrap_or((s, "s"));

        let value: f64 = num_part
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid duration number: {}", num_part))?;
        if !value.is_finite() || value < 0.0 {
            return Err(anyhow::anyhow!("Duration must be a non-negative number: {}", s));
        }

        let multiplier: f64 = match unit_part.trim().to_lowercase().as_str() {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" | "min" => 60e9,
            "h" => 3_600e9,
            _ => return Err(anyhow::anyhow!("Unknown duration unit: {}", unit_part)),
        };

        Ok(Duration::from_nanos((value * multiplier) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StagebenchConfig::default();
        assert_eq!(config.engine.min_iteration_time, "250ms");
        assert_eq!(config.toolchain.build_configuration, "Release");
        assert!(config.diagnostics.profile.is_none());
        assert!(config.partitions.is_empty());
    }

    #[test]
    fn test_defaults_match_engine() {
        let engine = StagebenchConfig::default().engine.to_engine_config().unwrap();
        assert_eq!(engine, EngineConfig::default());
    }

    #[test]
    fn test_parse_duration() {
        let ns = |s| StagebenchConfig::parse_duration(s).unwrap().as_nanos();
        assert_eq!(ns("3s"), 3_000_000_000);
        assert_eq!(ns("500ms"), 500_000_000);
        assert_eq!(ns("100us"), 100_000);
        assert_eq!(ns("100µs"), 100_000);
        assert_eq!(ns("1000ns"), 1000);
        assert_eq!(ns("2m"), 120_000_000_000);
        assert_eq!(ns("1.5s"), 1_500_000_000);
        assert_eq!(ns("7"), 7_000_000_000);
        assert!(StagebenchConfig::parse_duration("").is_err());
        assert!(StagebenchConfig::parse_duration("3 fortnights").is_err());
        assert!(StagebenchConfig::parse_duration("-1s").is_err());
    }

    #[test]
    fn test_parse_toml_with_partitions() {
        let toml_str = r#"
            [engine]
            min_iteration_time = "10ms"
            iteration_count = 5

            [diagnostics]
            profile = "GcCollect"

            [[partition]]
            id = "maps"
            build_configuration = "Debug"

            [[partition.cases]]
            id = "btree_insert"
            [partition.cases.job]
            build_arguments = ["/p:A=1", "/p:B=2"]

            [[partition.cases]]
            id = "hash_insert"
        "#;

        let config: StagebenchConfig = toml::from_str(toml_str).unwrap();
        let engine = config.engine.to_engine_config().unwrap();
        assert_eq!(engine.min_iteration_time_ns, 10_000_000);
        assert_eq!(engine.iteration_count, Some(5));
        // Defaults should still apply
        assert_eq!(engine.unroll_factor, 16);
        assert_eq!(config.diagnostics.profile.as_deref(), Some("GcCollect"));

        let partitions = config.partitions().unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].build_configuration(), "Debug");
        assert_eq!(partitions[0].custom_arguments(), Some("/p:A=1 /p:B=2"));
        assert_eq!(partitions[0].cases().len(), 2);
    }

    #[test]
    fn test_empty_partition_is_error() {
        let config: StagebenchConfig = toml::from_str("[[partition]]\nid = \"empty\"\n").unwrap();
        assert!(matches!(
            config.partitions(),
            Err(ToolchainError::EmptyPartition(id)) if id == "empty"
        ));
    }

    #[test]
    fn test_partition_ids_are_checked() {
        let case = "[[partition.cases]]\nid = \"a\"\n";
        let config: StagebenchConfig =
            toml::from_str(&format!("[[partition]]\nid = \"..\"\n{case}")).unwrap();
        assert!(matches!(
            config.partitions(),
            Err(ToolchainError::InvalidPartitionId(id)) if id == ".."
        ));

        let config: StagebenchConfig = toml::from_str(&format!(
            "[[partition]]\nid = \"net8\"\n{case}[[partition]]\nid = \"other\"\n{case}[[partition]]\nid = \"net8\"\n{case}"
        ))
        .unwrap();
        assert!(matches!(
            config.partitions(),
            Err(ToolchainError::DuplicatePartition(id)) if id == "net8"
        ));
    }

    #[test]
    fn test_invalid_engine_rejected() {
        let mut section = EngineSection::default();
        section.unroll_factor = 0;
        assert!(section.to_engine_config().is_err());
    }

    #[test]
    fn test_default_toml_parses() {
        let config: StagebenchConfig = toml::from_str(&StagebenchConfig::default_toml()).unwrap();
        assert_eq!(config.engine.min_iteration_time, "250ms");
        assert_eq!(config.runner.timeout, "120s");
        assert_eq!(
            config.engine.to_engine_config().unwrap(),
            EngineConfig::default()
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[runner]\njobs = 3\n").unwrap();
        let config = StagebenchConfig::load(&path).unwrap();
        assert_eq!(config.runner.jobs, Some(3));
        assert_eq!(config.toolchain.tool, "dotnet");
    }
}
