//! Stdout Line Protocol
//!
//! The measured child prints one line per measured unit and a final sentinel:
//!
//! ```text
//! WorkloadPilot 1: 16 op, 912 ns
//! WorkloadActual 1: 4096 op, 251003 ns, 0 B, 0 allocs
//! // Run complete: invocations=4096 unroll=16 uncertain=false
//! ```
//!
//! Anything else on stdout (output of the workload itself) is passed through
//! as [`ProtocolLine::Other`].

use crate::messages::{IterationMode, IterationStage, StageTag};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Prefix of the completion sentinel
pub const COMPLETION_PREFIX: &str = "// Run complete:";

/// A line that looked like protocol output but could not be decoded
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LineError {
    /// Stage tag recognized, fields not
    #[error("malformed measurement line: {0}")]
    Malformed(String),

    /// Sentinel prefix recognized, fields not
    #[error("malformed completion line: {0}")]
    MalformedCompletion(String),
}

/// One measured unit as reported by the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementLine {
    /// Mode and stage of the unit
    pub tag: StageTag,
    /// 1-based index within its stage
    pub index: u32,
    /// Raw invocations batched into the unit
    pub invocations: u64,
    /// Wall-clock duration of the unit
    pub elapsed_ns: u64,
    /// Allocated bytes and allocation count during the unit, when tracked
    pub allocations: Option<(u64, u64)>,
}

impl fmt::Display for MeasurementLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {} op, {} ns",
            self.tag, self.index, self.invocations, self.elapsed_ns
        )?;
        if let Some((bytes, count)) = self.allocations {
            write!(f, ", {} B, {} allocs", bytes, count)?;
        }
        Ok(())
    }
}

/// Sentinel printed once the engine reached its Done state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionLine {
    /// Invocations per measured unit chosen by the pilot stage
    pub invocations: u64,
    /// Unroll factor the invocation count is aligned to
    pub unroll: u64,
    /// Pilot hit the invocation ceiling without reaching the target duration
    pub uncertain: bool,
}

impl fmt::Display for CompletionLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} invocations={} unroll={} uncertain={}",
            COMPLETION_PREFIX, self.invocations, self.unroll, self.uncertain
        )
    }
}

/// Classified stdout line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolLine {
    /// A measured unit
    Measurement(MeasurementLine),
    /// The sentinel
    Complete(CompletionLine),
    /// Workload output or diagnostics; not part of the protocol
    Other(String),
}

impl ProtocolLine {
    /// Classify and decode a line (without its trailing newline).
    pub fn parse(line: &str) -> Result<Self, LineError> {
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some(rest) = line.strip_prefix(COMPLETION_PREFIX) {
            return CompletionLine::parse_fields(rest).map(ProtocolLine::Complete);
        }

        match parse_tag(line) {
            Some((tag, rest)) => MeasurementLine::parse_fields(tag, rest).map(ProtocolLine::Measurement),
            None => Ok(ProtocolLine::Other(line.to_string())),
        }
    }
}

fn parse_stage_tag(word: &str) -> Option<StageTag> {
    let (mode, stage) = if let Some(stage) = word.strip_prefix("Workload") {
        (IterationMode::Workload, stage)
    } else if let Some(stage) = word.strip_prefix("Overhead") {
        (IterationMode::Overhead, stage)
    } else {
        return None;
    };
    let stage = match stage {
        "Jitting" => IterationStage::Jitting,
        "Pilot" => IterationStage::Pilot,
        "Warmup" => IterationStage::Warmup,
        "Actual" => IterationStage::Actual,
        _ => return None,
    };
    Some(StageTag::new(mode, stage))
}

/// Split off a leading stage tag, if the first word is one.
fn parse_tag(line: &str) -> Option<(StageTag, &str)> {
    let (word, rest) = line.split_once(' ')?;
    parse_stage_tag(word).map(|tag| (tag, rest))
}

impl MeasurementLine {
    fn parse_fields(tag: StageTag, rest: &str) -> Result<Self, LineError> {
        let malformed = || LineError::Malformed(format!("{} {}", tag, rest));

        let (index, body) = rest.split_once(':').ok_or_else(malformed)?;
        let index: u32 = index.trim().parse().map_err(|_| malformed())?;

        let fields: Vec<&str> = body.split(',').map(str::trim).collect();
        if fields.len() != 2 && fields.len() != 4 {
            return Err(malformed());
        }

        let number = |field: &str, unit: &str| -> Result<u64, LineError> {
            field
                .strip_suffix(unit)
                .map(str::trim)
                .and_then(|n| n.parse().ok())
                .ok_or_else(malformed)
        };

        let invocations = number(fields[0], "op")?;
        let elapsed_ns = number(fields[1], "ns")?;
        let allocations = if fields.len() == 4 {
            Some((number(fields[2], "B")?, number(fields[3], "allocs")?))
        } else {
            None
        };

        Ok(Self {
            tag,
            index,
            invocations,
            elapsed_ns,
            allocations,
        })
    }

    /// Elapsed time divided by the invocation count.
    pub fn per_invocation_ns(&self) -> f64 {
        self.elapsed_ns as f64 / self.invocations.max(1) as f64
    }
}

impl CompletionLine {
    fn parse_fields(rest: &str) -> Result<Self, LineError> {
        let malformed = || LineError::MalformedCompletion(rest.trim().to_string());

        let mut invocations = None;
        let mut unroll = None;
        let mut uncertain = None;
        for pair in rest.split_whitespace() {
            let (key, value) = pair.split_once('=').ok_or_else(malformed)?;
            match key {
                "invocations" => invocations = value.parse().ok(),
                "unroll" => unroll = value.parse().ok(),
                "uncertain" => uncertain = value.parse().ok(),
                _ => {}
            }
        }

        Ok(Self {
            invocations: invocations.ok_or_else(malformed)?,
            unroll: unroll.ok_or_else(malformed)?,
            uncertain: uncertain.ok_or_else(malformed)?,
        })
    }
}

impl FromStr for MeasurementLine {
    type Err = LineError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        match ProtocolLine::parse(line)? {
            ProtocolLine::Measurement(m) => Ok(m),
            _ => Err(LineError::Malformed(line.trim_end().to_string())),
        }
    }
}

impl FromStr for CompletionLine {
    type Err = LineError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        match ProtocolLine::parse(line)? {
            ProtocolLine::Complete(c) => Ok(c),
            _ => Err(LineError::MalformedCompletion(line.trim_end().to_string())),
        }
    }
}
