//! Diagnostic Channel Messages
//!
//! Types exchanged over the framed pipe pair while a diagnostic session is
//! attached to a measured child. The child speaks [`ChildMessage`], the
//! orchestrator answers with [`ParentCommand`].

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a measured unit runs the real workload or the empty overhead body
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
    Serialize,
    Deserialize,
)]
#[archive(check_bytes)]
pub enum IterationMode {
    /// Empty body used to estimate dispatch cost
    Overhead,
    /// The code under test
    Workload,
}

/// Engine stage a measured unit belongs to
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
    Serialize,
    Deserialize,
)]
#[archive(check_bytes)]
pub enum IterationStage {
    /// Single unmeasured call that forces code paths to be faulted in
    Jitting,
    /// Invocation-count discovery
    Pilot,
    /// Discarded steady-state runs
    Warmup,
    /// Measured runs
    Actual,
}

impl IterationMode {
    /// Tag used on the stdout line protocol.
    pub fn as_str(self) -> &'static str {
        match self {
            IterationMode::Overhead => "Overhead",
            IterationMode::Workload => "Workload",
        }
    }
}

impl IterationStage {
    /// Tag used on the stdout line protocol.
    pub fn as_str(self) -> &'static str {
        match self {
            IterationStage::Jitting => "Jitting",
            IterationStage::Pilot => "Pilot",
            IterationStage::Warmup => "Warmup",
            IterationStage::Actual => "Actual",
        }
    }
}

/// Mode and stage of the unit that was running when an event fired
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
    Serialize,
    Deserialize,
)]
#[archive(check_bytes)]
pub struct StageTag {
    /// Overhead or workload
    pub mode: IterationMode,
    /// Engine stage
    pub stage: IterationStage,
}

impl StageTag {
    /// Construct a tag.
    pub const fn new(mode: IterationMode, stage: IterationStage) -> Self {
        Self { mode, stage }
    }

    /// The tag under which per-operation counters are computed.
    pub const WORKLOAD_ACTUAL: StageTag =
        StageTag::new(IterationMode::Workload, IterationStage::Actual);
}

impl fmt::Display for StageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.mode.as_str(), self.stage.as_str())
    }
}

/// Verbosity of a provider or event, ordered from least to most verbose
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
    Serialize,
    Deserialize,
)]
#[archive(check_bytes)]
pub enum EventLevel {
    /// Always emitted regardless of the enabled level
    LogAlways,
    /// Unrecoverable conditions
    Critical,
    /// Errors (panics surface here)
    Error,
    /// Suspicious conditions
    Warning,
    /// Routine runtime events
    Informational,
    /// Everything
    Verbose,
}

/// Keyword bits selecting event groups within the runtime provider
pub mod keywords {
    /// Heap collections
    pub const GC: u64 = 0x1;
    /// Handle creation for collected heaps
    pub const GC_HANDLE: u64 = 0x2;
    /// Lock contention
    pub const CONTENTION: u64 = 0x4000;
    /// Panics and other unwinding failures
    pub const EXCEPTION: u64 = 0x8000;
    /// Background work-item completion
    pub const THREADING: u64 = 0x1_0000;
    /// Keywords enabled when a profile asks for "default" runtime events
    pub const DEFAULT: u64 = GC | CONTENTION | EXCEPTION | THREADING;
}

/// Provider emitting runtime events (work items, contention, collections, panics)
pub const RUNTIME_PROVIDER: &str = "Stagebench-Runtime";

/// Provider emitting periodic sampling ticks
pub const SAMPLE_PROFILER_PROVIDER: &str = "Stagebench-SampleProfiler";

/// One provider enabled by a diagnostic session
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct ProviderSpec {
    /// Provider name
    pub name: String,
    /// Most verbose level that is still delivered
    pub level: EventLevel,
    /// Keyword mask; zero enables every keyword of the provider
    pub keywords: u64,
}

impl ProviderSpec {
    /// Build a provider spec.
    pub fn new(name: impl Into<String>, level: EventLevel, keywords: u64) -> Self {
        Self {
            name: name.into(),
            level,
            keywords,
        }
    }

    /// Whether an event with this descriptor is delivered under this spec.
    pub fn enables(&self, descriptor: &EventDescriptor) -> bool {
        if self.name != descriptor.provider {
            return false;
        }
        if descriptor.level > self.level && descriptor.level != EventLevel::LogAlways {
            return false;
        }
        self.keywords == 0 || descriptor.keywords == 0 || self.keywords & descriptor.keywords != 0
    }
}

/// Static metadata of an event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDescriptor {
    /// Provider that owns the event
    pub provider: &'static str,
    /// Level the event is emitted at
    pub level: EventLevel,
    /// Keyword bits of the event
    pub keywords: u64,
}

/// What happened inside the child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum EventKind {
    /// A queued background work item finished
    WorkItemCompleted,
    /// A thread found a lock held by someone else
    LockContention,
    /// A heap collection finished
    GcEnd {
        /// Generation that was collected
        generation: u8,
    },
    /// A handle into a collected heap was created
    GcHandleCreated,
    /// A panic unwound through the runtime
    Exception,
    /// Periodic sampler tick
    SampleTick,
}

impl EventKind {
    /// Provider, level and keywords of this kind.
    pub fn descriptor(&self) -> EventDescriptor {
        let (provider, level, keywords) = match self {
            EventKind::WorkItemCompleted => {
                (RUNTIME_PROVIDER, EventLevel::Informational, keywords::THREADING)
            }
            EventKind::LockContention => {
                (RUNTIME_PROVIDER, EventLevel::Informational, keywords::CONTENTION)
            }
            EventKind::GcEnd { .. } => (RUNTIME_PROVIDER, EventLevel::Informational, keywords::GC),
            EventKind::GcHandleCreated => {
                (RUNTIME_PROVIDER, EventLevel::Verbose, keywords::GC_HANDLE)
            }
            EventKind::Exception => (RUNTIME_PROVIDER, EventLevel::Error, keywords::EXCEPTION),
            EventKind::SampleTick => (SAMPLE_PROFILER_PROVIDER, EventLevel::Informational, 0),
        };
        EventDescriptor {
            provider,
            level,
            keywords,
        }
    }
}

/// A single buffered event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct TraceEvent {
    /// What happened
    pub kind: EventKind,
    /// Stage that was active (or that queued the work), if any
    pub stage: Option<StageTag>,
    /// Nanoseconds since the child's event sink was installed
    pub timestamp_ns: u64,
    /// Emitting thread, as an opaque small integer
    pub thread: u64,
}

/// Readiness announcement sent by the child before its first measured unit
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct ChildHello {
    /// Protocol version for compatibility checking
    pub protocol_version: u32,
    /// Child process id, matched against the launched pid
    pub pid: u32,
    /// Workload the child resolved from its environment
    pub case_id: String,
}

/// Messages sent from the measured child to the orchestrator
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum ChildMessage {
    /// "Ready to be observed"
    Ready(ChildHello),
    /// A batch of buffered events
    Events(Vec<TraceEvent>),
    /// The engine finished; no further events follow
    Finished {
        /// Events lost because the child-side buffer overflowed
        dropped: u64,
    },
}

/// Commands sent from the orchestrator to the measured child
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum ParentCommand {
    /// "Observation attached, proceed", with the providers to enable
    Attach {
        /// Enabled providers
        providers: Vec<ProviderSpec>,
    },
    /// Proceed without observation (attachment was abandoned)
    Proceed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_tag_display() {
        assert_eq!(StageTag::WORKLOAD_ACTUAL.to_string(), "WorkloadActual");
        let tag = StageTag::new(IterationMode::Overhead, IterationStage::Warmup);
        assert_eq!(tag.to_string(), "OverheadWarmup");
    }

    #[test]
    fn test_level_filter() {
        let informational = ProviderSpec::new(RUNTIME_PROVIDER, EventLevel::Informational, keywords::GC_HANDLE);
        assert!(!informational.enables(&EventKind::GcHandleCreated.descriptor()));

        let verbose = ProviderSpec::new(RUNTIME_PROVIDER, EventLevel::Verbose, keywords::GC_HANDLE);
        assert!(verbose.enables(&EventKind::GcHandleCreated.descriptor()));
    }

    #[test]
    fn test_keyword_filter() {
        let gc_only = ProviderSpec::new(RUNTIME_PROVIDER, EventLevel::Verbose, keywords::GC);
        assert!(gc_only.enables(&EventKind::GcEnd { generation: 1 }.descriptor()));
        assert!(!gc_only.enables(&EventKind::LockContention.descriptor()));
    }

    #[test]
    fn test_provider_name_must_match() {
        let sampler = ProviderSpec::new(SAMPLE_PROFILER_PROVIDER, EventLevel::Informational, 0);
        assert!(sampler.enables(&EventKind::SampleTick.descriptor()));
        assert!(!sampler.enables(&EventKind::WorkItemCompleted.descriptor()));
    }

    #[test]
    fn test_default_keywords_exclude_handles() {
        assert_eq!(keywords::DEFAULT & keywords::GC_HANDLE, 0);
        assert_ne!(keywords::DEFAULT & keywords::THREADING, 0);
    }
}
