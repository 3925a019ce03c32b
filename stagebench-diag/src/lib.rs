#![warn(missing_docs)]
//! Stagebench Diagnostics
//!
//! The orchestrator-side diagnostic attachment layer:
//! - `ProfileProviderCatalog`: named profiles and the providers they enable
//! - `DiagnosticSession`: Idle/Attaching/Collecting/Detached/Finalized
//!   session over a `SessionChannel`
//! - `RuntimeCounters`/`ThreadingStats`: counters computed once from the
//!   buffered event stream

mod counters;
mod profiles;
mod session;

pub use counters::{DiagnosticsOutcome, GcCounts, RuntimeCounters, StageCount, ThreadingStats};
pub use profiles::{DiagnosticProfile, ProfileDescriptor, ProfileError, ProfileProviderCatalog};
pub use session::{DiagnosticSession, SessionChannel, SessionError, SessionState};
