//! Diagnostic Session
//!
//! Attaches a provider set to one measured child and buffers its events:
//!
//! ```text
//! Idle --attach--> Attaching --ack--> Collecting --exit/timeout--> Detached --finalize--> Finalized
//! ```
//!
//! Attachment is a two-phase handshake on the diagnostic channel. The child
//! announces `Ready` and blocks; the session answers `Attach` with the
//! providers, after which the child starts its first measured unit. When
//! attachment fails the session still answers `Proceed` if it can, so the
//! child never waits for a parent that gave up.
//!
//! Deadlines are measured on a [`Clock`], so tests drive the state machine
//! with a fake clock and a scripted channel.

use crate::counters::{DiagnosticsOutcome, RuntimeCounters};
use crate::profiles::ProfileDescriptor;
use stagebench_core::Clock;
use stagebench_ipc::{ChildMessage, FrameError, PROTOCOL_VERSION, ParentCommand, ProviderSpec, TraceEvent};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Longest single wait on the channel, so deadlines are re-checked regularly
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Session failures
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("child did not announce readiness within {0:?}")]
    AttachTimeout(Duration),

    #[error("diagnostic channel closed")]
    ChannelClosed,

    #[error("protocol version mismatch: parent {expected}, child {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("readiness came from pid {actual}, expected {expected}")]
    PidMismatch { expected: u32, actual: u32 },

    #[error("unexpected message while {0}")]
    UnexpectedMessage(SessionState),

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("diagnostic channel error: {0}")]
    Frame(#[from] FrameError),

    #[error("diagnostic channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nothing sent
    Idle,
    /// Waiting for the child's readiness announcement
    Attaching,
    /// Providers enabled; buffering events
    Collecting,
    /// No more events will be accepted
    Detached,
    /// Counters computed
    Finalized,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Attaching => "attaching",
            SessionState::Collecting => "collecting",
            SessionState::Detached => "detached",
            SessionState::Finalized => "finalized",
        };
        f.write_str(name)
    }
}

/// Parent end of the diagnostic channel
pub trait SessionChannel {
    /// Wait up to `timeout` for the next message; `Ok(None)` on timeout.
    ///
    /// A closed channel is [`SessionError::ChannelClosed`].
    fn recv(&mut self, timeout: Duration) -> Result<Option<ChildMessage>, SessionError>;

    /// Send a command to the child.
    fn send(&mut self, command: &ParentCommand) -> Result<(), SessionError>;
}

/// Tracing session against one child process
pub struct DiagnosticSession<Ch: SessionChannel, C: Clock> {
    providers: Vec<ProviderSpec>,
    expected_pid: Option<u32>,
    channel: Ch,
    clock: C,
    state: SessionState,
    events: Vec<TraceEvent>,
    dropped: u64,
    finished: bool,
    failure: Option<String>,
}

impl<Ch: SessionChannel, C: Clock> DiagnosticSession<Ch, C> {
    /// Idle session enabling `profile`'s providers over `channel`.
    pub fn new(profile: &ProfileDescriptor, channel: Ch, clock: C) -> Self {
        Self {
            providers: profile.providers.clone(),
            expected_pid: None,
            channel,
            clock,
            state: SessionState::Idle,
            events: Vec::new(),
            dropped: 0,
            finished: false,
            failure: None,
        }
    }

    /// Only accept readiness from this pid.
    pub fn expect_pid(mut self, pid: u32) -> Self {
        self.expected_pid = Some(pid);
        self
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Events buffered so far.
    pub fn buffered_events(&self) -> usize {
        self.events.len()
    }

    fn deadline(&self, timeout: Duration) -> u64 {
        self.clock.now_ns().saturating_add(timeout.as_nanos() as u64)
    }

    /// Wait for a message until `deadline_ns`; `Ok(None)` once it passes.
    fn recv_until(&mut self, deadline_ns: u64) -> Result<Option<ChildMessage>, SessionError> {
        loop {
            let now = self.clock.now_ns();
            if now >= deadline_ns {
                return Ok(None);
            }
            let slice = Duration::from_nanos(deadline_ns - now).min(POLL_SLICE);
            if let Some(message) = self.channel.recv(slice)? {
                return Ok(Some(message));
            }
        }
    }

    /// Wait for the child's readiness and enable the providers.
    ///
    /// On success the session is Collecting and the child has been released.
    /// On failure the session is Detached and the child was told to proceed
    /// unobserved where the channel still allowed it.
    pub fn attach(&mut self, timeout: Duration) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::InvalidState {
                operation: "attach",
                state: self.state,
            });
        }
        self.state = SessionState::Attaching;

        match self.handshake(timeout) {
            Ok(()) => {
                self.state = SessionState::Collecting;
                tracing::debug!("diagnostic session attached with {} providers", self.providers.len());
                Ok(())
            }
            Err(e) => {
                if !matches!(e, SessionError::ChannelClosed | SessionError::Frame(_) | SessionError::Io(_)) {
                    let _ = self.channel.send(&ParentCommand::Proceed);
                }
                self.failure = Some(e.to_string());
                self.state = SessionState::Detached;
                Err(e)
            }
        }
    }

    fn handshake(&mut self, timeout: Duration) -> Result<(), SessionError> {
        let deadline = self.deadline(timeout);
        let hello = match self.recv_until(deadline)? {
            Some(ChildMessage::Ready(hello)) => hello,
            Some(_) => return Err(SessionError::UnexpectedMessage(SessionState::Attaching)),
            None => return Err(SessionError::AttachTimeout(timeout)),
        };

        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(SessionError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: hello.protocol_version,
            });
        }
        if let Some(expected) = self.expected_pid {
            if hello.pid != expected {
                return Err(SessionError::PidMismatch {
                    expected,
                    actual: hello.pid,
                });
            }
        }

        self.channel.send(&ParentCommand::Attach {
            providers: self.providers.clone(),
        })
    }

    /// Buffer events until the child finishes, the channel closes or `timeout` passes.
    ///
    /// Always ends Detached. A timeout or a close before `Finished` marks the
    /// snapshot partial rather than failing it.
    pub fn collect(&mut self, timeout: Duration) -> Result<(), SessionError> {
        if self.state != SessionState::Collecting {
            return Err(SessionError::InvalidState {
                operation: "collect",
                state: self.state,
            });
        }

        let deadline = self.deadline(timeout);
        let result = loop {
            match self.recv_until(deadline) {
                Ok(Some(ChildMessage::Events(batch))) => self.events.extend(batch),
                Ok(Some(ChildMessage::Finished { dropped })) => {
                    self.dropped = dropped;
                    self.finished = true;
                    break Ok(());
                }
                Ok(Some(ChildMessage::Ready(_))) => {
                    break Err(SessionError::UnexpectedMessage(SessionState::Collecting));
                }
                Ok(None) => {
                    tracing::warn!("diagnostic collection timed out after {:?}", timeout);
                    break Ok(());
                }
                Err(SessionError::ChannelClosed) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.state = SessionState::Detached;
        result
    }

    /// Stop accepting events (cancellation); buffered events are kept.
    pub fn detach(&mut self) {
        if matches!(
            self.state,
            SessionState::Idle | SessionState::Attaching | SessionState::Collecting
        ) {
            if self.state != SessionState::Collecting && self.failure.is_none() {
                self.failure = Some("session detached before attaching".to_string());
            }
            self.state = SessionState::Detached;
        }
    }

    /// Compute the counters; the session is Finalized afterwards.
    pub fn finalize(&mut self) -> Result<DiagnosticsOutcome, SessionError> {
        match self.state {
            SessionState::Detached => {}
            SessionState::Collecting => self.detach(),
            state => {
                return Err(SessionError::InvalidState {
                    operation: "finalize",
                    state,
                });
            }
        }
        self.state = SessionState::Finalized;

        if let Some(reason) = self.failure.take() {
            return Ok(DiagnosticsOutcome::Unavailable { reason });
        }
        let events = std::mem::take(&mut self.events);
        let partial = !self.finished;
        if partial {
            tracing::warn!("diagnostic snapshot is partial ({} events)", events.len());
        }
        Ok(DiagnosticsOutcome::Available(RuntimeCounters::from_events(
            &self.providers,
            &events,
            self.dropped,
            partial,
        )))
    }
}
