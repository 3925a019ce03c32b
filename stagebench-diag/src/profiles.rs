//! Profile Provider Catalog
//!
//! Named diagnostic profiles and the providers each one enables. The catalog
//! is built once on first use and is read-only afterwards.

use serde::{Deserialize, Serialize};
use stagebench_ipc::{EventLevel, ProviderSpec, RUNTIME_PROVIDER, SAMPLE_PROFILER_PROVIDER, keywords};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use thiserror::Error;

/// Profile lookup failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProfileError {
    #[error("unknown diagnostic profile {name:?} (known: {known})")]
    Unknown { name: String, known: String },
}

/// Diagnostic profiles understood by the catalog
///
/// External spelling (configuration files, CLI, environment) is the variant
/// name: `CpuSampling`, `GcVerbose`, `GcCollect`, `Threading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticProfile {
    /// Sampling profiler plus default runtime events
    CpuSampling,
    /// Collections, handle creation and exceptions at verbose level
    GcVerbose,
    /// Collections and exceptions only
    GcCollect,
    /// Work-item completion and lock contention
    Threading,
}

impl DiagnosticProfile {
    /// Every profile, in catalog order.
    pub const ALL: [DiagnosticProfile; 4] = [
        DiagnosticProfile::CpuSampling,
        DiagnosticProfile::GcVerbose,
        DiagnosticProfile::GcCollect,
        DiagnosticProfile::Threading,
    ];

    /// External name.
    pub fn as_str(self) -> &'static str {
        match self {
            DiagnosticProfile::CpuSampling => "CpuSampling",
            DiagnosticProfile::GcVerbose => "GcVerbose",
            DiagnosticProfile::GcCollect => "GcCollect",
            DiagnosticProfile::Threading => "Threading",
        }
    }

    /// Providers this profile enables.
    pub fn providers(self) -> &'static [ProviderSpec] {
        &ProfileProviderCatalog::global().get(self).providers
    }
}

impl fmt::Display for DiagnosticProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiagnosticProfile {
    type Err = ProfileError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        DiagnosticProfile::ALL
            .into_iter()
            .find(|p| p.as_str() == name)
            .ok_or_else(|| ProfileError::Unknown {
                name: name.to_string(),
                known: DiagnosticProfile::ALL.map(DiagnosticProfile::as_str).join(", "),
            })
    }
}

/// A profile and its ordered provider list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileDescriptor {
    /// Profile
    pub profile: DiagnosticProfile,
    /// Providers, in the order they are enabled
    pub providers: Vec<ProviderSpec>,
}

impl ProfileDescriptor {
    /// `(provider, level, keywords)` triples.
    pub fn triples(&self) -> Vec<(&str, EventLevel, u64)> {
        self.providers
            .iter()
            .map(|p| (p.name.as_str(), p.level, p.keywords))
            .collect()
    }
}

/// Read-only mapping from profile to providers
#[derive(Debug)]
pub struct ProfileProviderCatalog {
    entries: Vec<ProfileDescriptor>,
}

static CATALOG: LazyLock<ProfileProviderCatalog> = LazyLock::new(ProfileProviderCatalog::build);

impl ProfileProviderCatalog {
    fn build() -> Self {
        let runtime = |level, keywords| ProviderSpec::new(RUNTIME_PROVIDER, level, keywords);
        let entries = DiagnosticProfile::ALL
            .into_iter()
            .map(|profile| {
                let providers = match profile {
                    DiagnosticProfile::CpuSampling => vec![
                        ProviderSpec::new(SAMPLE_PROFILER_PROVIDER, EventLevel::Informational, 0),
                        runtime(EventLevel::Informational, keywords::DEFAULT),
                    ],
                    DiagnosticProfile::GcVerbose => vec![runtime(
                        EventLevel::Verbose,
                        keywords::GC | keywords::GC_HANDLE | keywords::EXCEPTION,
                    )],
                    DiagnosticProfile::GcCollect => vec![runtime(
                        EventLevel::Informational,
                        keywords::GC | keywords::EXCEPTION,
                    )],
                    DiagnosticProfile::Threading => vec![runtime(
                        EventLevel::Informational,
                        keywords::THREADING | keywords::CONTENTION,
                    )],
                };
                ProfileDescriptor { profile, providers }
            })
            .collect();
        Self { entries }
    }

    /// The process-wide catalog.
    pub fn global() -> &'static ProfileProviderCatalog {
        &CATALOG
    }

    /// Descriptor for a profile name; unknown names are an error.
    pub fn lookup(&self, name: &str) -> Result<&ProfileDescriptor, ProfileError> {
        let profile: DiagnosticProfile = name.parse()?;
        Ok(self.get(profile))
    }

    /// Descriptor for a profile.
    pub fn get(&self, profile: DiagnosticProfile) -> &ProfileDescriptor {
        // `build` creates one entry per profile in `ALL` order
        &self.entries[profile as usize]
    }

    /// Every descriptor, in catalog order.
    pub fn profiles(&self) -> impl Iterator<Item = &ProfileDescriptor> {
        self.entries.iter()
    }
}
