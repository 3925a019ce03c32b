//! Child Process Host
//!
//! Entry point of the measured executable. The orchestrator describes the run
//! through environment variables:
//!
//! - `STAGEBENCH_CASE`: workload id to run (required)
//! - `STAGEBENCH_ENGINE_CONFIG`: JSON [`EngineConfig`] (defaults when absent)
//! - `STAGEBENCH_DIAG_PROFILE`: diagnostic profile name; absent means none
//! - `STAGEBENCH_DIAG_FD`: `<read_fd>,<write_fd>` of the diagnostic channel
//!
//! With diagnostics requested, the host announces itself on the channel and
//! blocks until the orchestrator answers with `Attach` (install the providers)
//! or `Proceed` (run unobserved). Only then does the first unit start.
//! Measured units are written to stdout as protocol lines, followed by the
//! completion sentinel.

use crate::engine::{
    EngineConfig, EngineError, FnWorkload, IterationEngine, IterationMeasurement,
    MeasurementObserver, RunResults, Workload,
};
use crate::runtime;
use stagebench_ipc::{
    ChildHello, ChildMessage, ENV_CASE, ENV_DIAG_FD, ENV_DIAG_PROFILE, ENV_ENGINE_CONFIG,
    EVENT_FLUSH_INTERVAL_MS, FrameReader, FrameWriter, MAX_EVENT_BATCH, PROTOCOL_VERSION,
    ParentCommand, SAMPLE_PROFILER_PROVIDER, TraceEvent,
};
use std::fs::File;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

#[cfg(unix)]
use std::os::unix::io::FromRawFd;

/// How long the host waits for queued work items before reporting
const QUIESCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Child-side failures
#[derive(Debug, Error)]
pub enum HostError {
    #[error("STAGEBENCH_CASE is not set")]
    MissingCase,

    #[error("no workload registered as {0:?}")]
    UnknownCase(String),

    #[error("invalid STAGEBENCH_ENGINE_CONFIG: {0}")]
    Config(#[from] serde_json::Error),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("failed to write results: {0}")]
    Io(#[from] io::Error),

    #[error("workload panicked: {0}")]
    Panicked(String),
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Whether SIGTERM asked the engine to stop after the current unit.
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Relaxed)
}

#[cfg(unix)]
fn install_sigterm_handler() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = sigterm_handler as *const () as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
    }
}

#[cfg(unix)]
extern "C" fn sigterm_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

#[cfg(not(unix))]
fn install_sigterm_handler() {}

fn parse_fd_pair(value: &str) -> Option<(i32, i32)> {
    let (r, w) = value.split_once(',')?;
    Some((r.trim().parse().ok()?, w.trim().parse().ok()?))
}

/// Writes every unit to stdout as a protocol line
pub struct LineReporter<W: Write> {
    out: W,
}

impl<W: Write> LineReporter<W> {
    /// Report into `out`.
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Write the completion sentinel.
    pub fn complete(&mut self, results: &RunResults) -> io::Result<()> {
        writeln!(self.out, "{}", results.completion_line())?;
        self.out.flush()
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> MeasurementObserver for LineReporter<W> {
    fn on_measurement(&mut self, measurement: &IterationMeasurement) -> io::Result<()> {
        writeln!(self.out, "{}", measurement.to_line())?;
        // Flushed per unit so the orchestrator sees progress before a timeout
        self.out.flush()
    }
}

/// Child end of an attached diagnostic channel
pub struct DiagnosticLink {
    writer: Arc<Mutex<FrameWriter<File>>>,
    stop: Arc<AtomicBool>,
    flusher: Option<JoinHandle<()>>,
    sampler: Option<runtime::Sampler>,
}

fn send_events(writer: &Mutex<FrameWriter<File>>, events: Vec<TraceEvent>) -> bool {
    let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
    for batch in events.chunks(MAX_EVENT_BATCH) {
        if let Err(e) = writer.send(&ChildMessage::Events(batch.to_vec())) {
            tracing::debug!("diagnostic channel closed: {}", e);
            return false;
        }
    }
    true
}

impl DiagnosticLink {
    /// Announce readiness on the channel and wait for the orchestrator.
    ///
    /// Takes ownership of both descriptors. Returns `None` when the
    /// orchestrator chose to proceed unobserved or the handshake failed; the
    /// run then continues without diagnostics.
    #[cfg(unix)]
    pub fn connect(read_fd: i32, write_fd: i32, case_id: &str) -> Option<Self> {
        // SAFETY: the orchestrator passed these descriptors for our exclusive use.
        let (read_file, write_file) = unsafe { (File::from_raw_fd(read_fd), File::from_raw_fd(write_fd)) };
        let mut reader = FrameReader::new(read_file);
        let mut writer = FrameWriter::new(write_file);

        let hello = ChildHello {
            protocol_version: PROTOCOL_VERSION,
            pid: std::process::id(),
            case_id: case_id.to_string(),
        };
        if let Err(e) = writer.send(&ChildMessage::Ready(hello)) {
            tracing::warn!("could not announce readiness: {}", e);
            return None;
        }

        let providers = match reader.recv::<ParentCommand>() {
            Ok(ParentCommand::Attach { providers }) => providers,
            Ok(ParentCommand::Proceed) => return None,
            Err(e) => {
                tracing::warn!("diagnostic handshake failed: {}", e);
                return None;
            }
        };

        let sampling = providers.iter().any(|p| p.name == SAMPLE_PROFILER_PROVIDER);
        runtime::install(providers);
        runtime::install_panic_hook();

        let sampler = if sampling {
            runtime::start_sampler(runtime::DEFAULT_SAMPLE_INTERVAL)
                .map_err(|e| tracing::warn!("could not start sampler: {}", e))
                .ok()
        } else {
            None
        };

        let writer = Arc::new(Mutex::new(writer));
        let stop = Arc::new(AtomicBool::new(false));
        let flusher = {
            let writer = Arc::clone(&writer);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("stagebench-flush".into())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        std::thread::sleep(Duration::from_millis(EVENT_FLUSH_INTERVAL_MS));
                        if !send_events(&writer, runtime::drain()) {
                            break;
                        }
                    }
                })
                .map_err(|e| tracing::warn!("could not start event flusher: {}", e))
                .ok()
        };

        Some(Self {
            writer,
            stop,
            flusher,
            sampler,
        })
    }

    /// Wait for queued work, flush the remaining events and say goodbye.
    pub fn finish(mut self) {
        if let Some(sampler) = self.sampler.take() {
            sampler.stop();
        }
        if !runtime::quiesce(QUIESCE_TIMEOUT) {
            tracing::warn!(
                "{} work items still running after {:?}",
                runtime::pending_work_items(),
                QUIESCE_TIMEOUT
            );
        }
        self.stop.store(true, Ordering::Relaxed);
        if let Some(flusher) = self.flusher.take() {
            let _ = flusher.join();
        }

        let (events, dropped) = runtime::uninstall();
        if send_events(&self.writer, events) {
            let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = writer.send(&ChildMessage::Finished { dropped }) {
                tracing::debug!("could not send completion: {}", e);
            }
        }
    }
}

/// Runs one workload inside the measured child
#[derive(Debug, Clone)]
pub struct ChildHost {
    case_id: String,
    profile: Option<String>,
    diag_fds: Option<(i32, i32)>,
    config: EngineConfig,
}

impl ChildHost {
    /// Host for `case_id` without diagnostics.
    pub fn new(case_id: impl Into<String>, config: EngineConfig) -> Self {
        Self {
            case_id: case_id.into(),
            profile: None,
            diag_fds: None,
            config,
        }
    }

    /// Read the run description from the environment.
    pub fn from_env() -> Result<Self, HostError> {
        let case_id = std::env::var(ENV_CASE).map_err(|_| HostError::MissingCase)?;
        let config = match std::env::var(ENV_ENGINE_CONFIG) {
            Ok(json) => serde_json::from_str(&json)?,
            Err(_) => EngineConfig::default(),
        };
        let profile = std::env::var(ENV_DIAG_PROFILE).ok().filter(|p| !p.is_empty());
        let diag_fds = match std::env::var(ENV_DIAG_FD) {
            Ok(value) => {
                let fds = parse_fd_pair(&value);
                if fds.is_none() {
                    tracing::warn!(
                        "invalid {}={:?} (expected <read_fd>,<write_fd>), running without diagnostics",
                        ENV_DIAG_FD,
                        value
                    );
                }
                fds
            }
            Err(_) => None,
        };

        Ok(Self {
            case_id,
            profile,
            diag_fds,
            config,
        })
    }

    /// Workload id this host runs.
    pub fn case_id(&self) -> &str {
        &self.case_id
    }

    /// Diagnostic profile requested by the orchestrator.
    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    /// Engine configuration in effect.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Resolve the workload from the registry and run it.
    pub fn run(self) -> Result<RunResults, HostError> {
        let def = crate::find_workload(&self.case_id)
            .ok_or_else(|| HostError::UnknownCase(self.case_id.clone()))?;
        let mut workload = FnWorkload(def.body);
        self.run_workload(&mut workload)
    }

    /// Run `workload`, reporting protocol lines on stdout.
    pub fn run_workload(self, workload: &mut dyn Workload) -> Result<RunResults, HostError> {
        let mut reporter = LineReporter::new(io::stdout());
        self.run_reporting(workload, &mut reporter)
    }

    fn run_reporting<W: Write>(
        self,
        workload: &mut dyn Workload,
        reporter: &mut LineReporter<W>,
    ) -> Result<RunResults, HostError> {
        install_sigterm_handler();
        let mut engine = IterationEngine::new(self.config.clone())?;

        let link = match (&self.profile, self.diag_fds) {
            #[cfg(unix)]
            (Some(_), Some((read_fd, write_fd))) => DiagnosticLink::connect(read_fd, write_fd, &self.case_id),
            (Some(profile), _) => {
                tracing::warn!("profile {} requested without a diagnostic channel", profile);
                None
            }
            _ => None,
        };

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            engine.run(workload, &mut *reporter)
        }));

        runtime::set_stage(None);
        if let Some(link) = link {
            link.finish();
        }

        match outcome {
            Ok(Ok(results)) => {
                reporter.complete(&results)?;
                Ok(results)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(panic) => {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                Err(HostError::Panicked(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use stagebench_ipc::{EventKind, EventLevel, ProtocolLine, ProviderSpec, RUNTIME_PROVIDER, StageTag, keywords};

    fn quick() -> EngineConfig {
        EngineConfig {
            invocation_count: Some(2),
            unroll_factor: 1,
            warmup_count: Some(1),
            iteration_count: Some(3),
            evaluate_overhead: false,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_parse_fd_pair() {
        assert_eq!(parse_fd_pair("3,4"), Some((3, 4)));
        assert_eq!(parse_fd_pair(" 5 , 6 "), Some((5, 6)));
        assert_eq!(parse_fd_pair("3"), None);
        assert_eq!(parse_fd_pair("a,b"), None);
    }

    #[test]
    #[serial]
    fn test_lines_and_sentinel() {
        let mut reporter = LineReporter::new(Vec::new());
        let mut workload = FnWorkload(|| {
            std::hint::black_box(1 + 1);
        });
        let results = ChildHost::new("noop", quick())
            .run_reporting(&mut workload, &mut reporter)
            .unwrap();

        let text = String::from_utf8(reporter.into_inner()).unwrap();
        let lines: Vec<ProtocolLine> = text.lines().map(|l| ProtocolLine::parse(l).unwrap()).collect();
        assert_eq!(lines.len(), 5);
        assert!(matches!(lines.last(), Some(ProtocolLine::Complete(c)) if c.invocations == 2));
        let actual = lines
            .iter()
            .filter(|l| matches!(l, ProtocolLine::Measurement(m) if m.tag == StageTag::WORKLOAD_ACTUAL))
            .count();
        assert_eq!(actual, 3);
        assert_eq!(results.invocations, 2);
    }

    #[test]
    #[serial]
    fn test_panicking_workload_is_reported() {
        let mut reporter = LineReporter::new(Vec::new());
        let mut workload = FnWorkload(|| panic!("workload exploded"));
        let err = ChildHost::new("boom", quick())
            .run_reporting(&mut workload, &mut reporter)
            .unwrap_err();
        assert!(matches!(err, HostError::Panicked(msg) if msg.contains("exploded")));
    }

    #[test]
    fn test_unknown_case() {
        let err = ChildHost::new("definitely-not-registered", quick()).run().unwrap_err();
        assert!(matches!(err, HostError::UnknownCase(_)));
    }

    #[cfg(unix)]
    fn pipe() -> (File, File) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) }
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn test_handshake_then_events() {
        use std::os::unix::io::IntoRawFd;

        let (child_read, parent_write) = pipe();
        let (parent_read, child_write) = pipe();

        let parent = std::thread::spawn(move || {
            let mut reader = FrameReader::new(parent_read);
            let mut writer = FrameWriter::new(parent_write);
            let hello = match reader.recv::<ChildMessage>().unwrap() {
                ChildMessage::Ready(hello) => hello,
                other => panic!("expected Ready, got {:?}", other),
            };
            writer
                .send(&ParentCommand::Attach {
                    providers: vec![ProviderSpec::new(
                        RUNTIME_PROVIDER,
                        EventLevel::Informational,
                        keywords::THREADING,
                    )],
                })
                .unwrap();

            let mut events = Vec::new();
            loop {
                match reader.recv::<ChildMessage>() {
                    Ok(ChildMessage::Events(batch)) => events.extend(batch),
                    Ok(ChildMessage::Finished { dropped }) => {
                        assert_eq!(dropped, 0);
                        break;
                    }
                    Ok(ChildMessage::Ready(_)) => panic!("second Ready"),
                    Err(e) => panic!("channel error: {}", e),
                }
            }
            (hello, events)
        });

        let link = DiagnosticLink::connect(child_read.into_raw_fd(), child_write.into_raw_fd(), "work-item")
            .expect("orchestrator attached");
        runtime::set_stage(Some(StageTag::WORKLOAD_ACTUAL));
        runtime::spawn_work_item(|| {});
        runtime::set_stage(None);
        link.finish();

        let (hello, events) = parent.join().unwrap();
        assert_eq!(hello.protocol_version, PROTOCOL_VERSION);
        assert_eq!(hello.pid, std::process::id());
        assert_eq!(hello.case_id, "work-item");
        let completed: Vec<_> = events
            .iter()
            .filter(|e| e.kind == EventKind::WorkItemCompleted)
            .collect();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].stage, Some(StageTag::WORKLOAD_ACTUAL));
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn test_proceed_runs_unobserved() {
        use std::os::unix::io::IntoRawFd;

        let (child_read, parent_write) = pipe();
        let (parent_read, child_write) = pipe();
        let parent = std::thread::spawn(move || {
            let mut reader = FrameReader::new(parent_read);
            let mut writer = FrameWriter::new(parent_write);
            assert!(matches!(reader.recv::<ChildMessage>(), Ok(ChildMessage::Ready(_))));
            writer.send(&ParentCommand::Proceed).unwrap();
        });

        let link = DiagnosticLink::connect(child_read.into_raw_fd(), child_write.into_raw_fd(), "case");
        parent.join().unwrap();
        assert!(link.is_none());
        assert!(!runtime::is_installed());
    }
}
