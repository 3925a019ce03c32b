//! Process Execution
//!
//! Runs one external command with a controlled environment and returns a
//! [`CommandResult`]. Each call blocks until the process exits or its
//! timeout kills it.

use crate::partition::EnvironmentVariable;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::process::CommandExt;

/// How long output is still read after a timeout kill
const DRAIN_AFTER_KILL: Duration = Duration::from_millis(500);

/// How long output is still read after a normal exit
const DRAIN_AFTER_EXIT: Duration = Duration::from_secs(5);

/// A command ready to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable
    pub program: PathBuf,
    /// Rendered argument string, split with [`split_arguments`] before spawning
    pub arguments: String,
    /// Working directory; inherits the current one when `None`
    pub working_dir: Option<PathBuf>,
    /// Variables added to the inherited environment
    pub environment: Vec<EnvironmentVariable>,
    /// Kill the process after this long
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// Command with no extra environment, working directory or timeout.
    pub fn new(program: impl Into<PathBuf>, arguments: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            arguments: arguments.into(),
            working_dir: None,
            environment: Vec::new(),
            timeout: None,
        }
    }

    /// Argument vector as passed to the process.
    pub fn argv(&self) -> Vec<String> {
        split_arguments(&self.arguments)
    }
}

/// Outcome of one external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Exited with status zero
    pub success: bool,
    /// Exit status; `None` when killed by a signal or never started
    pub exit_code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// The argument string that ran
    pub arguments: String,
}

impl CommandResult {
    /// Successful result with the given output.
    pub fn succeeded(arguments: impl Into<String>, stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
            arguments: arguments.into(),
        }
    }

    /// Failed result with the given exit code and error output.
    pub fn failed(arguments: impl Into<String>, exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            arguments: arguments.into(),
        }
    }

    /// Human-readable failure description: error output, or standard output
    /// when the tool wrote its diagnostics there.
    pub fn problem_description(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

/// Runs external commands
pub trait CommandExecutor: Send + Sync {
    /// Run `spec` to completion.
    fn execute(&self, spec: &CommandSpec) -> CommandResult;
}

/// Executes commands as child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutor;

/// Output of one stream, read on its own thread
struct Capture {
    bytes: Arc<Mutex<Vec<u8>>>,
    done: mpsc::Receiver<()>,
}

impl Capture {
    fn start<R: Read + Send + 'static>(stream: Option<R>, label: &'static str) -> Option<Self> {
        let mut stream = stream?;
        let bytes = Arc::new(Mutex::new(Vec::new()));
        let (tx, done) = mpsc::channel();
        let sink = Arc::clone(&bytes);
        std::thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        tracing::warn!("reading {} failed, output may be truncated: {}", label, e);
                        break;
                    }
                }
            }
            let _ = tx.send(());
        });
        Some(Self { bytes, done })
    }

    /// Wait up to `grace` for end of stream, then return what was read.
    fn finish(self, grace: Duration) -> String {
        if let Err(RecvTimeoutError::Timeout) = self.done.recv_timeout(grace) {
            tracing::debug!("stream still open after {:?}, keeping what was read", grace);
        }
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Kill the child and everything in its process group.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        // The child leads its own group; see `execute`
        let ret = unsafe { libc::killpg(child.id() as libc::pid_t, libc::SIGKILL) };
        if ret == 0 {
            return;
        }
    }
    let _ = child.kill();
}

impl CommandExecutor for ProcessExecutor {
    fn execute(&self, spec: &CommandSpec) -> CommandResult {
        let argv = spec.argv();
        tracing::debug!("running {} {}", spec.program.display(), spec.arguments);

        let mut command = Command::new(&spec.program);
        command
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        for var in &spec.environment {
            command.env(&var.name, &var.value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return CommandResult::failed(
                    spec.arguments.clone(),
                    None,
                    format!("failed to start {}: {}", spec.program.display(), e),
                );
            }
        };

        let stdout = Capture::start(child.stdout.take(), "stdout");
        let stderr = Capture::start(child.stderr.take(), "stderr");

        let started = Instant::now();
        let mut timed_out = false;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("lost track of {}: {}", spec.program.display(), e);
                    break None;
                }
            }
            if spec.timeout.is_some_and(|t| started.elapsed() >= t) {
                timed_out = true;
                kill_tree(&mut child);
                break child.wait().ok();
            }
            std::thread::sleep(Duration::from_millis(5));
        };

        // Forked helpers (build servers, background jobs) may keep the pipes
        // open after the child itself is gone
        let grace = if timed_out { DRAIN_AFTER_KILL } else { DRAIN_AFTER_EXIT };
        let stdout = stdout.map(|c| c.finish(grace)).unwrap_or_default();
        let mut stderr = stderr.map(|c| c.finish(grace)).unwrap_or_default();
        if timed_out {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!(
                "{} timed out after {:?}",
                spec.program.display(),
                spec.timeout.unwrap_or_default()
            ));
        }

        let exit_code = status.and_then(|s| s.code());
        CommandResult {
            success: !timed_out && status.is_some_and(|s| s.success()),
            exit_code,
            stdout,
            stderr,
            arguments: spec.arguments.clone(),
        }
    }
}

/// Split a command string into arguments.
///
/// Whitespace separates arguments except inside double quotes; the quotes
/// themselves are removed, so `--packages "my dir"` yields two arguments.
pub fn split_arguments(arguments: &str) -> Vec<String> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in arguments.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    argv.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        argv.push(current);
    }
    argv
}
