//! Child Launcher
//!
//! Starts one measured child per benchmark case, reads its stdout line
//! protocol and, when a profile is selected, runs a diagnostic session over a
//! dedicated pipe pair mapped to fds 3 (commands) and 4 (events) in the child.
//!
//! The run-level timeout is enforced here: SIGTERM, a short drain window for
//! the units the child still reports, then SIGKILL.

use stagebench_core::{EngineConfig, RunResults, SystemClock};
use stagebench_diag::{DiagnosticSession, DiagnosticsOutcome, ProfileDescriptor, SessionChannel, SessionError};
use stagebench_ipc::{
    ChildMessage, CompletionLine, ENV_CASE, ENV_DIAG_FD, ENV_DIAG_PROFILE, ENV_ENGINE_CONFIG, FrameError,
    FrameReader, FrameWriter, MeasurementLine, ParentCommand, ProtocolLine,
};
use stagebench_toolchain::{BenchmarkCase, EnvironmentVariable};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Window for units flushed after SIGTERM
const DRAIN_WINDOW: Duration = Duration::from_millis(500);

/// Extra time the diagnostic session waits past the run timeout
const COLLECT_GRACE: Duration = Duration::from_secs(2);

/// Launch and supervision failures
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to launch {binary}: {source}")]
    LaunchFailed {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode engine configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("child for {case} exited ({status}) before reporting completion")]
    ChildFailed { case: String, status: String },

    #[error("I/O error while supervising child: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of polling for data
#[derive(Debug)]
enum PollResult {
    DataAvailable,
    Timeout,
    PipeClosed,
    Error(std::io::Error),
}

/// Wait for data to be available on a file descriptor with timeout
fn wait_for_data(fd: RawFd, timeout_ms: i32) -> PollResult {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };

    if result < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return PollResult::Timeout;
        }
        PollResult::Error(err)
    } else if result == 0 {
        PollResult::Timeout
    } else if pollfd.revents & libc::POLLIN != 0 {
        // Even with the peer gone there may still be data to read
        PollResult::DataAvailable
    } else if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        PollResult::PipeClosed
    } else {
        PollResult::Timeout
    }
}

/// Create a close-on-exec pipe pair, returning (read_fd, write_fd).
fn create_pipe() -> Result<(RawFd, RawFd), std::io::Error> {
    let mut fds = [0 as RawFd; 2];
    #[cfg(target_os = "linux")]
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    #[cfg(not(target_os = "linux"))]
    let ret = unsafe {
        let ret = libc::pipe(fds.as_mut_ptr());
        if ret == 0 {
            for &fd in &fds {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
            }
        }
        ret
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

/// Close a raw file descriptor.
fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Send `signal` to the process group led by `pid`.
///
/// Children are spawned as group leaders, so this also reaches anything they
/// forked. Returns `Err` if the signal could not be delivered.
fn signal_group(pid: u32, signal: libc::c_int) -> Result<(), std::io::Error> {
    let ret = unsafe { libc::killpg(pid as libc::pid_t, signal) };
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// SIGTERM to the child's process group.
fn send_sigterm(pid: u32) -> Result<(), std::io::Error> {
    signal_group(pid, libc::SIGTERM)
}

/// SIGKILL the child's process group, falling back to the child alone.
fn kill_group(child: &mut Child) {
    if signal_group(child.id(), libc::SIGKILL).is_err() {
        let _ = child.kill();
    }
}

/// Parent end of the diagnostic pipe pair
pub struct PipeChannel {
    reader: FrameReader<File>,
    writer: FrameWriter<File>,
    read_fd: RawFd,
}

impl PipeChannel {
    /// Take ownership of the parent-side descriptors.
    ///
    /// # Safety
    ///
    /// Both descriptors must be open and owned by nobody else.
    pub unsafe fn from_raw_fds(read_fd: RawFd, write_fd: RawFd) -> Self {
        let (read_file, write_file) = unsafe { (File::from_raw_fd(read_fd), File::from_raw_fd(write_fd)) };
        Self {
            reader: FrameReader::new(read_file),
            writer: FrameWriter::new(write_file),
            read_fd,
        }
    }
}

fn channel_error(e: FrameError) -> SessionError {
    if e.is_closed() {
        SessionError::ChannelClosed
    } else {
        SessionError::Frame(e)
    }
}

impl SessionChannel for PipeChannel {
    fn recv(&mut self, timeout: Duration) -> Result<Option<ChildMessage>, SessionError> {
        if !self.reader.has_buffered_data() {
            match wait_for_data(self.read_fd, timeout.as_millis().min(i32::MAX as u128) as i32) {
                PollResult::DataAvailable => {}
                PollResult::Timeout => return Ok(None),
                PollResult::PipeClosed => return Err(SessionError::ChannelClosed),
                PollResult::Error(e) => return Err(SessionError::Io(e)),
            }
        }
        self.reader.recv::<ChildMessage>().map(Some).map_err(channel_error)
    }

    fn send(&mut self, command: &ParentCommand) -> Result<(), SessionError> {
        self.writer.send(command).map_err(channel_error)
    }
}

/// Everything one child reported
#[derive(Debug)]
pub struct ChildRun {
    /// Case the child ran
    pub case_id: String,
    /// Units and stage metadata; partial when `timed_out`
    pub results: RunResults,
    /// Diagnostic contribution
    pub diagnostics: DiagnosticsOutcome,
    /// Killed by the run-level timeout before completing
    pub timed_out: bool,
    /// Exit status, when the child exited normally
    pub exit_code: Option<i32>,
}

/// Launches measured children for one built artifact
#[derive(Debug, Clone)]
pub struct ChildLauncher {
    binary: PathBuf,
    engine: EngineConfig,
    profile: Option<ProfileDescriptor>,
    environment: Vec<EnvironmentVariable>,
    attach_timeout: Duration,
    run_timeout: Duration,
}

impl ChildLauncher {
    /// Launcher for `binary` running every case with `engine`.
    pub fn new(binary: impl Into<PathBuf>, engine: EngineConfig) -> Self {
        Self {
            binary: binary.into(),
            engine,
            profile: None,
            environment: Vec::new(),
            attach_timeout: Duration::from_secs(5),
            run_timeout: Duration::from_secs(120),
        }
    }

    /// Attach a diagnostic session with this profile to every child.
    pub fn with_profile(mut self, profile: Option<ProfileDescriptor>) -> Self {
        self.profile = profile;
        self
    }

    /// Variables added to every child.
    pub fn with_environment(mut self, environment: Vec<EnvironmentVariable>) -> Self {
        self.environment = environment;
        self
    }

    /// Bound on the readiness handshake.
    pub fn with_attach_timeout(mut self, timeout: Duration) -> Self {
        self.attach_timeout = timeout;
        self
    }

    /// Kill children that run longer than this.
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    /// Executable being launched.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn command(&self, case: &BenchmarkCase, engine_json: &str) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .env(ENV_CASE, &case.id)
            .env(ENV_ENGINE_CONFIG, engine_json)
            .env_remove(ENV_DIAG_PROFILE)
            .env_remove(ENV_DIAG_FD)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0);
        for var in self.environment.iter().chain(&case.job.environment) {
            command.env(&var.name, &var.value);
        }
        command
    }

    /// Run `case` in a fresh child and collect its report.
    pub fn launch(&self, case: &BenchmarkCase) -> Result<ChildRun, SupervisorError> {
        let engine_json = serde_json::to_string(&self.engine)?;
        let launch_failed = |source| SupervisorError::LaunchFailed {
            binary: self.binary.clone(),
            source,
        };

        let (child, channel) = match &self.profile {
            Some(profile) => {
                let (mut child, cmd_write, msg_read) =
                    spawn_retrying(|| spawn_with_channel(&mut self.command(case, &engine_json), profile))
                        .map_err(launch_failed)?;
                // SAFETY: both ends were just created and are owned by this launch only.
                let channel = unsafe { PipeChannel::from_raw_fds(msg_read, cmd_write) };
                let session = spawn_session(
                    profile,
                    channel,
                    child.id(),
                    self.attach_timeout,
                    self.run_timeout + COLLECT_GRACE,
                );
                match session {
                    Ok(handle) => (child, Some(handle)),
                    Err(e) => {
                        kill_group(&mut child);
                        let _ = child.wait();
                        return Err(e.into());
                    }
                }
            }
            None => {
                let child = spawn_retrying(|| self.command(case, &engine_json).spawn()).map_err(launch_failed)?;
                (child, None)
            }
        };

        tracing::debug!("launched {} for {} (pid {})", self.binary.display(), case.id, child.id());
        self.supervise(case, child, channel)
    }

    fn supervise(
        &self,
        case: &BenchmarkCase,
        mut child: Child,
        session: Option<JoinHandle<DiagnosticsOutcome>>,
    ) -> Result<ChildRun, SupervisorError> {
        let (tx, rx) = mpsc::channel::<String>();
        let stdout_thread = match child.stdout.take() {
            Some(stdout) => Some(
                std::thread::Builder::new()
                    .name("stagebench-stdout".into())
                    .spawn(move || {
                        for line in BufReader::new(stdout).lines() {
                            match line {
                                Ok(line) => {
                                    if tx.send(line).is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                    })?,
            ),
            None => None,
        };

        let mut collector = LineCollector::new(&case.id);
        let deadline = Instant::now() + self.run_timeout;
        let mut timed_out = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                timed_out = true;
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(line) => {
                    if collector.push(&line) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    timed_out = true;
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let status = if timed_out {
            tracing::warn!("{} exceeded {:?}, terminating", case.id, self.run_timeout);
            // Ignore errors: the child may already be gone
            let _ = send_sigterm(child.id());
            let drain_deadline = Instant::now() + DRAIN_WINDOW;
            loop {
                let remaining = drain_deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match rx.recv_timeout(remaining) {
                    Ok(line) => {
                        if collector.push(&line) {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            // Group members may outlive the leader and keep stdout open
            kill_group(&mut child);
            child.wait()?
        } else {
            wait_with_deadline(&mut child, deadline)?
        };

        // Not joined: a forked grandchild can hold stdout open indefinitely.
        // The reader ends at EOF or at its next send once `rx` is dropped.
        drop(stdout_thread);
        drop(rx);
        let diagnostics = match session {
            Some(handle) => handle.join().unwrap_or_else(|_| DiagnosticsOutcome::Unavailable {
                reason: "diagnostic session panicked".to_string(),
            }),
            None => DiagnosticsOutcome::NotRequested,
        };

        let exit_code = status.code();
        let results = match collector.finish() {
            Some(results) => results,
            None if timed_out => collector.partial(self.engine.unroll_factor),
            None => {
                return Err(SupervisorError::ChildFailed {
                    case: case.id.clone(),
                    status: status.to_string(),
                });
            }
        };
        if timed_out && !results.measurements.is_empty() {
            tracing::warn!("{}: keeping {} units from the interrupted run", case.id, results.measurements.len());
        }

        Ok(ChildRun {
            case_id: case.id.clone(),
            results,
            diagnostics,
            timed_out,
            exit_code,
        })
    }
}

/// Retry a spawn while the freshly written binary is still open for writing
/// in some other forked process.
fn spawn_retrying<T>(mut spawn: impl FnMut() -> std::io::Result<T>) -> std::io::Result<T> {
    const ATTEMPTS: u32 = 5;
    let mut attempt = 1;
    loop {
        match spawn() {
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempt < ATTEMPTS => {
                attempt += 1;
                std::thread::sleep(Duration::from_millis(20));
            }
            other => return other,
        }
    }
}

/// Wait for exit; SIGKILL once `deadline` passes.
fn wait_with_deadline(child: &mut Child, deadline: Instant) -> Result<std::process::ExitStatus, SupervisorError> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            let _ = send_sigterm(child.id());
            std::thread::sleep(Duration::from_millis(50));
            kill_group(child);
            return Ok(child.wait()?);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Spawn with the diagnostic pipes mapped to fds 3/4.
///
/// Returns the child plus the parent ends (command write, message read).
fn spawn_with_channel(
    command: &mut Command,
    profile: &ProfileDescriptor,
) -> Result<(Child, RawFd, RawFd), std::io::Error> {
    // cmd pipe: parent writes commands -> child reads from fd 3
    let (cmd_read, cmd_write) = create_pipe()?;
    // msg pipe: child writes messages to fd 4 -> parent reads
    let (msg_read, msg_write) = match create_pipe() {
        Ok(fds) => fds,
        Err(e) => {
            close_fd(cmd_read);
            close_fd(cmd_write);
            return Err(e);
        }
    };

    command
        .env(ENV_DIAG_PROFILE, profile.profile.as_str())
        .env(ENV_DIAG_FD, "3,4");

    // In the child: move both ends above fd 4 first so dup2 cannot clobber
    // one with the other, then place them on 3 and 4 without close-on-exec.
    unsafe {
        command.pre_exec(move || {
            let r = libc::fcntl(cmd_read, libc::F_DUPFD_CLOEXEC, 10);
            let w = libc::fcntl(msg_write, libc::F_DUPFD_CLOEXEC, 10);
            if r < 0 || w < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::dup2(r, 3) < 0 || libc::dup2(w, 4) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            libc::close(r);
            libc::close(w);
            Ok(())
        });
    }

    let spawned = command.spawn();

    // The child-side ends belong to the child now (or to nobody on failure)
    close_fd(cmd_read);
    close_fd(msg_write);

    match spawned {
        Ok(child) => Ok((child, cmd_write, msg_read)),
        Err(e) => {
            close_fd(cmd_write);
            close_fd(msg_read);
            Err(e)
        }
    }
}

/// Run the session on its own thread: attach, collect, finalize.
fn spawn_session(
    profile: &ProfileDescriptor,
    channel: PipeChannel,
    pid: u32,
    attach_timeout: Duration,
    collect_timeout: Duration,
) -> Result<JoinHandle<DiagnosticsOutcome>, std::io::Error> {
    let mut session = DiagnosticSession::new(profile, channel, SystemClock).expect_pid(pid);
    let name = profile.profile;
    std::thread::Builder::new()
        .name("stagebench-diag".into())
        .spawn(move || {
            match session.attach(attach_timeout) {
                Ok(()) => {
                    if let Err(e) = session.collect(collect_timeout) {
                        tracing::warn!("{} collection ended early: {}", name, e);
                    }
                }
                Err(e) => tracing::warn!("diagnostics unavailable ({}): {}", name, e),
            }
            session.finalize().unwrap_or_else(|e| DiagnosticsOutcome::Unavailable { reason: e.to_string() })
        })
}

/// Accumulates protocol lines from one child
struct LineCollector<'a> {
    case_id: &'a str,
    lines: Vec<MeasurementLine>,
    completion: Option<CompletionLine>,
}

impl<'a> LineCollector<'a> {
    fn new(case_id: &'a str) -> Self {
        Self {
            case_id,
            lines: Vec::new(),
            completion: None,
        }
    }

    /// Record one line; true once the sentinel arrived.
    fn push(&mut self, line: &str) -> bool {
        match ProtocolLine::parse(line) {
            Ok(ProtocolLine::Measurement(m)) => self.lines.push(m),
            Ok(ProtocolLine::Complete(c)) => {
                self.completion = Some(c);
                return true;
            }
            Ok(ProtocolLine::Other(text)) => {
                if !text.is_empty() {
                    tracing::debug!("[{}] {}", self.case_id, text);
                }
            }
            Err(e) => tracing::warn!("[{}] {}", self.case_id, e),
        }
        false
    }

    fn finish(&self) -> Option<RunResults> {
        let completion = self.completion?;
        Some(RunResults::from_lines(&self.lines, &completion))
    }

    /// Results of an interrupted run; always flagged uncertain.
    fn partial(&self, unroll: u64) -> RunResults {
        let invocations = self.lines.last().map(|m| m.invocations).unwrap_or(0);
        let completion = CompletionLine {
            invocations,
            unroll,
            uncertain: true,
        };
        RunResults::from_lines(&self.lines, &completion)
    }
}
