//! Artifact Generation
//!
//! Lays out the per-partition directory the build tool works in and records
//! what the partition contains in a `partition.json` manifest.

use crate::ToolchainError;
use crate::partition::{BenchmarkCase, Partition, validate_partition_id};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Manifest file name inside the project directory
pub const MANIFEST_FILE: &str = "partition.json";

/// Contents of `partition.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionManifest {
    /// Partition id
    pub id: String,
    /// Build configuration
    pub build_configuration: String,
    /// Resolved custom build arguments
    pub custom_arguments: Option<String>,
    /// Cases compiled into the artifact
    pub cases: Vec<BenchmarkCase>,
}

impl From<&Partition> for PartitionManifest {
    fn from(partition: &Partition) -> Self {
        Self {
            id: partition.id().to_string(),
            build_configuration: partition.build_configuration().to_string(),
            custom_arguments: partition.custom_arguments().map(str::to_string),
            cases: partition.cases().to_vec(),
        }
    }
}

/// Creates artifact directories under a common root
#[derive(Debug, Clone)]
pub struct ArtifactGenerator {
    artifacts_root: PathBuf,
    binary_name: String,
    keep_files: bool,
    isolated_packages: bool,
}

impl ArtifactGenerator {
    /// Generator writing below `artifacts_root`; the published binary is
    /// expected at `<partition>/bin/<binary_name>`.
    pub fn new(artifacts_root: impl Into<PathBuf>, binary_name: impl Into<String>) -> Self {
        Self {
            artifacts_root: artifacts_root.into(),
            binary_name: binary_name.into(),
            keep_files: false,
            isolated_packages: true,
        }
    }

    /// Keep generated files after results are collected.
    pub fn keep_files(mut self, keep: bool) -> Self {
        self.keep_files = keep;
        self
    }

    /// Restore packages into the artifact directory instead of the tool's
    /// global cache.
    pub fn isolated_packages(mut self, isolated: bool) -> Self {
        self.isolated_packages = isolated;
        self
    }

    /// Create the directory layout and manifest for `partition`.
    ///
    /// A leftover directory from an earlier run with the same id is replaced.
    /// Ids that do not name a single directory below the root are rejected
    /// before anything is touched.
    pub fn generate(&self, partition: &Partition) -> Result<GeneratedArtifact, ToolchainError> {
        validate_partition_id(partition.id())?;
        let root = self.artifacts_root.join(partition.id());
        if root.exists() {
            tracing::debug!("removing stale artifact {}", root.display());
            std::fs::remove_dir_all(&root)?;
        }

        let project_dir = root.join("src");
        let bin_dir = root.join("bin");
        std::fs::create_dir_all(&project_dir)?;
        std::fs::create_dir_all(&bin_dir)?;

        let packages_dir = if self.isolated_packages {
            let dir = root.join("packages");
            std::fs::create_dir_all(&dir)?;
            Some(dir)
        } else {
            None
        };

        let manifest = serde_json::to_string_pretty(&PartitionManifest::from(partition))?;
        std::fs::write(project_dir.join(MANIFEST_FILE), manifest)?;

        tracing::debug!("generated {} for {} case(s)", root.display(), partition.cases().len());
        Ok(GeneratedArtifact {
            binary_path: bin_dir.join(&self.binary_name),
            root,
            project_dir,
            packages_dir,
            keep_files: self.keep_files,
        })
    }
}

/// Filesystem footprint of one generated partition
#[derive(Debug)]
pub struct GeneratedArtifact {
    root: PathBuf,
    project_dir: PathBuf,
    packages_dir: Option<PathBuf>,
    binary_path: PathBuf,
    keep_files: bool,
}

impl GeneratedArtifact {
    /// Directory owning everything the partition produced.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Working directory of the build tool.
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Package directory override, when restoring in isolation.
    pub fn packages_dir(&self) -> Option<&Path> {
        self.packages_dir.as_deref()
    }

    /// Where publish leaves the runnable binary.
    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    /// Read the manifest back.
    pub fn manifest(&self) -> Result<PartitionManifest, ToolchainError> {
        let text = std::fs::read_to_string(self.project_dir.join(MANIFEST_FILE))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Remove the artifact directory unless it was generated with `keep_files`.
    ///
    /// Returns whether anything was removed.
    pub fn cleanup(self) -> Result<bool, ToolchainError> {
        if self.keep_files {
            tracing::info!("keeping artifact {}", self.root.display());
            return Ok(false);
        }
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition() -> Partition {
        Partition::new(
            "alloc-heavy",
            "Release",
            vec![
                BenchmarkCase::new("vec_push").with_build_arguments(["/p:Opt=3"]),
                BenchmarkCase::new("vec_extend"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_generate_layout_and_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let artifact = ArtifactGenerator::new(tmp.path(), "bench-host")
            .generate(&partition())
            .unwrap();

        assert_eq!(artifact.root(), tmp.path().join("alloc-heavy"));
        assert!(artifact.project_dir().is_dir());
        assert_eq!(artifact.packages_dir(), Some(tmp.path().join("alloc-heavy/packages").as_path()));
        assert_eq!(artifact.binary_path(), tmp.path().join("alloc-heavy/bin/bench-host"));

        let manifest = artifact.manifest().unwrap();
        assert_eq!(manifest.custom_arguments.as_deref(), Some("/p:Opt=3"));
        assert_eq!(manifest.cases.len(), 2);
        assert_eq!(manifest.cases[1].id, "vec_extend");
    }

    #[test]
    fn test_cleanup_removes_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let artifact = ArtifactGenerator::new(tmp.path(), "host").generate(&partition()).unwrap();
        let root = artifact.root().to_path_buf();
        assert!(artifact.cleanup().unwrap());
        assert!(!root.exists());
    }

    #[test]
    fn test_keep_files_survives_cleanup() {
        let tmp = tempfile::tempdir().unwrap();
        let artifact = ArtifactGenerator::new(tmp.path(), "host")
            .keep_files(true)
            .isolated_packages(false)
            .generate(&partition())
            .unwrap();
        assert!(artifact.packages_dir().is_none());
        let root = artifact.root().to_path_buf();
        assert!(!artifact.cleanup().unwrap());
        assert!(root.join("src").join(MANIFEST_FILE).is_file());
    }

    #[test]
    fn test_escaping_ids_touch_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let artifacts = tmp.path().join("artifacts");
        std::fs::create_dir_all(&artifacts).unwrap();
        std::fs::write(tmp.path().join("keep.txt"), "sibling").unwrap();
        std::fs::write(artifacts.join("keep.txt"), "inside").unwrap();

        let generator = ArtifactGenerator::new(&artifacts, "host");
        let outside = tmp.path().join("outside");
        for id in ["..", ".", "", "../artifacts", outside.to_str().unwrap()] {
            let p = Partition::new(id, "Release", vec![BenchmarkCase::new("a")]).unwrap();
            assert!(
                matches!(generator.generate(&p), Err(ToolchainError::InvalidPartitionId(_))),
                "{id:?} accepted"
            );
        }

        assert!(tmp.path().join("keep.txt").is_file());
        assert!(artifacts.join("keep.txt").is_file());
        assert!(!outside.exists());
    }

    #[test]
    fn test_regenerate_replaces_stale_files() {
        let tmp = tempfile::tempdir().unwrap();
        let generator = ArtifactGenerator::new(tmp.path(), "host");
        let first = generator.generate(&partition()).unwrap();
        std::fs::write(first.root().join("stale.txt"), "old").unwrap();

        let second = generator.generate(&partition()).unwrap();
        assert!(!second.root().join("stale.txt").exists());
    }
}
