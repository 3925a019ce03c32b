#![warn(missing_docs)]
//! Stagebench IPC
//!
//! Wire formats shared by the orchestrator and the measured child process:
//! - the textual stdout line protocol carrying one line per measured unit
//! - length-prefixed rkyv frames for the diagnostic side channel
//! - tracing-event, provider and keyword types consumed by diagnostic sessions

mod framing;
mod lines;
mod messages;

pub use framing::{FrameError, FrameReader, FrameWriter, MAX_FRAME_SIZE, read_frame, write_frame};
pub use lines::{COMPLETION_PREFIX, CompletionLine, LineError, MeasurementLine, ProtocolLine};
pub use messages::{
    ChildHello, ChildMessage, EventDescriptor, EventKind, EventLevel, IterationMode,
    IterationStage, ParentCommand, ProviderSpec, RUNTIME_PROVIDER, SAMPLE_PROFILER_PROVIDER,
    StageTag, TraceEvent, keywords,
};

/// Diagnostic channel protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Benchmark case the child must run
pub const ENV_CASE: &str = "STAGEBENCH_CASE";

/// Diagnostic profile name; absent means no diagnostics were requested
pub const ENV_DIAG_PROFILE: &str = "STAGEBENCH_DIAG_PROFILE";

/// `<read_fd>,<write_fd>` of the diagnostic channel as seen by the child
pub const ENV_DIAG_FD: &str = "STAGEBENCH_DIAG_FD";

/// JSON-encoded engine configuration
pub const ENV_ENGINE_CONFIG: &str = "STAGEBENCH_ENGINE_CONFIG";

/// Maximum events per batch sent over the diagnostic channel
pub const MAX_EVENT_BATCH: usize = 4_096;

/// Interval at which the child flushes buffered events, in milliseconds
pub const EVENT_FLUSH_INTERVAL_MS: u64 = 50;
