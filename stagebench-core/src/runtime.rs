//! Runtime Event Sink
//!
//! Process-wide buffer of [`TraceEvent`]s emitted by instrumented primitives
//! while a diagnostic session is attached:
//!
//! - [`spawn_work_item`] queues background work on the rayon pool and emits
//!   `WorkItemCompleted` when it finishes
//! - [`ContendedMutex`] emits `LockContention` whenever a lock attempt finds
//!   the lock held
//! - [`record_collection`], [`record_gc_handle`] and [`record_exception`] let
//!   workloads that manage their own heaps report collections
//! - [`install_panic_hook`] turns panics into `Exception` events
//! - [`start_sampler`] emits periodic `SampleTick` events
//!
//! Nothing is recorded until [`install`] enables a provider set; afterwards
//! each event is kept only if one of the enabled providers accepts its
//! provider, level and keywords. Every event carries the engine stage that was
//! active when it fired (for work items: when the item was queued), so
//! counters can be attributed to the measured units.

use stagebench_ipc::{EventKind, IterationMode, IterationStage, ProviderSpec, StageTag, TraceEvent};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Once, PoisonError, RwLock, TryLockError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Events beyond this are counted as dropped instead of buffered
pub const MAX_BUFFERED_EVENTS: usize = 1 << 20;

/// Default interval of the sampling thread
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(1);

struct Sink {
    providers: Vec<ProviderSpec>,
    origin: Instant,
    events: Mutex<Vec<TraceEvent>>,
    dropped: AtomicU64,
}

impl Sink {
    fn accepts(&self, kind: &EventKind) -> bool {
        let descriptor = kind.descriptor();
        self.providers.iter().any(|p| p.enables(&descriptor))
    }
}

static ENABLED: AtomicBool = AtomicBool::new(false);
static SINK: RwLock<Option<Arc<Sink>>> = RwLock::new(None);
static STAGE: AtomicU8 = AtomicU8::new(0);
static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_INDEX: u64 = NEXT_THREAD.fetch_add(1, Ordering::Relaxed);
}

fn current_sink() -> Option<Arc<Sink>> {
    SINK.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Start buffering events accepted by `providers`, replacing any previous sink.
pub fn install(providers: Vec<ProviderSpec>) {
    let sink = Arc::new(Sink {
        providers,
        origin: Instant::now(),
        events: Mutex::new(Vec::new()),
        dropped: AtomicU64::new(0),
    });
    *SINK.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    ENABLED.store(true, Ordering::Release);
}

/// Stop buffering; returns the events still buffered and the dropped count.
pub fn uninstall() -> (Vec<TraceEvent>, u64) {
    ENABLED.store(false, Ordering::Release);
    let sink = SINK.write().unwrap_or_else(PoisonError::into_inner).take();
    match sink {
        Some(sink) => {
            let events = std::mem::take(&mut *sink.events.lock().unwrap_or_else(PoisonError::into_inner));
            (events, sink.dropped.load(Ordering::Relaxed))
        }
        None => (Vec::new(), 0),
    }
}

/// Whether a sink is installed.
pub fn is_installed() -> bool {
    ENABLED.load(Ordering::Acquire)
}

/// Whether an event of `kind` would be recorded right now.
pub fn is_enabled(kind: EventKind) -> bool {
    is_installed() && current_sink().is_some_and(|sink| sink.accepts(&kind))
}

/// Take every buffered event, oldest first.
pub fn drain() -> Vec<TraceEvent> {
    match current_sink() {
        Some(sink) => std::mem::take(&mut *sink.events.lock().unwrap_or_else(PoisonError::into_inner)),
        None => Vec::new(),
    }
}

/// Events lost to the buffer bound since [`install`].
pub fn dropped() -> u64 {
    current_sink().map_or(0, |sink| sink.dropped.load(Ordering::Relaxed))
}

fn encode_stage(stage: Option<StageTag>) -> u8 {
    let Some(tag) = stage else { return 0 };
    let mode = match tag.mode {
        IterationMode::Overhead => 0,
        IterationMode::Workload => 4,
    };
    let stage = match tag.stage {
        IterationStage::Jitting => 0,
        IterationStage::Pilot => 1,
        IterationStage::Warmup => 2,
        IterationStage::Actual => 3,
    };
    1 + mode + stage
}

fn decode_stage(code: u8) -> Option<StageTag> {
    let code = code.checked_sub(1)?;
    let mode = if code & 4 == 0 {
        IterationMode::Overhead
    } else {
        IterationMode::Workload
    };
    let stage = match code & 3 {
        0 => IterationStage::Jitting,
        1 => IterationStage::Pilot,
        2 => IterationStage::Warmup,
        _ => IterationStage::Actual,
    };
    Some(StageTag::new(mode, stage))
}

/// Mark the engine stage events are attributed to; `None` between units.
#[inline]
pub fn set_stage(stage: Option<StageTag>) {
    STAGE.store(encode_stage(stage), Ordering::Release);
}

/// Stage currently running, if any.
#[inline]
pub fn current_stage() -> Option<StageTag> {
    decode_stage(STAGE.load(Ordering::Acquire))
}

/// Record `kind` under the current stage.
#[inline]
pub fn emit(kind: EventKind) {
    if is_installed() {
        emit_with_stage(kind, current_stage());
    }
}

/// Record `kind` under an explicit stage.
pub fn emit_with_stage(kind: EventKind, stage: Option<StageTag>) {
    if !is_installed() {
        return;
    }
    let Some(sink) = current_sink() else { return };
    if !sink.accepts(&kind) {
        return;
    }

    let event = TraceEvent {
        kind,
        stage,
        timestamp_ns: sink.origin.elapsed().as_nanos() as u64,
        thread: THREAD_INDEX.with(|index| *index),
    };
    let mut events = sink.events.lock().unwrap_or_else(PoisonError::into_inner);
    if events.len() >= MAX_BUFFERED_EVENTS {
        sink.dropped.fetch_add(1, Ordering::Relaxed);
    } else {
        events.push(event);
    }
}

/// A heap collection of `generation` finished.
pub fn record_collection(generation: u8) {
    emit(EventKind::GcEnd { generation });
}

/// A handle into a collected heap was created.
pub fn record_gc_handle() {
    emit(EventKind::GcHandleCreated);
}

/// A failure unwound through the workload.
pub fn record_exception() {
    emit(EventKind::Exception);
}

/// Chain a panic hook that records every panic as an `Exception` event.
pub fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            record_exception();
            previous(info);
        }));
    });
}

static PENDING: Mutex<u64> = Mutex::new(0);
static IDLE: Condvar = Condvar::new();

struct PendingWork;

impl PendingWork {
    fn begin() -> Self {
        *PENDING.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        PendingWork
    }
}

impl Drop for PendingWork {
    fn drop(&mut self) {
        let mut pending = PENDING.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            IDLE.notify_all();
        }
    }
}

/// Queue `work` on the rayon pool.
///
/// Emits `WorkItemCompleted` attributed to the stage that queued the item,
/// even when it finishes after that stage has ended. A panicking item is not
/// counted as completed.
pub fn spawn_work_item<F>(work: F)
where
    F: FnOnce() + Send + 'static,
{
    let stage = current_stage();
    let pending = PendingWork::begin();
    rayon::spawn(move || {
        let _pending = pending;
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(work)).is_ok() {
            emit_with_stage(EventKind::WorkItemCompleted, stage);
        }
    });
}

/// Work items queued but not yet finished.
pub fn pending_work_items() -> u64 {
    *PENDING.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait until every queued work item finished; `false` on timeout.
pub fn quiesce(timeout: Duration) -> bool {
    let pending = PENDING.lock().unwrap_or_else(PoisonError::into_inner);
    let (pending, _) = IDLE
        .wait_timeout_while(pending, timeout, |pending| *pending > 0)
        .unwrap_or_else(PoisonError::into_inner);
    *pending == 0
}

/// Mutex that reports contention to the event sink
///
/// Every attempt that finds the lock held emits one `LockContention` event
/// before it starts waiting.
#[derive(Debug, Default)]
pub struct ContendedMutex<T> {
    inner: Mutex<T>,
}

impl<T> ContendedMutex<T> {
    /// Wrap `value`.
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Block until the lock is acquired.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                emit(EventKind::LockContention);
                self.inner.lock().unwrap_or_else(PoisonError::into_inner)
            }
        }
    }

    /// Try to acquire the lock, giving up after `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, T>> {
        match self.inner.try_lock() {
            Ok(guard) => return Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => emit(EventKind::LockContention),
        }

        let deadline = Instant::now() + timeout;
        let mut backoff = Duration::from_micros(10);
        loop {
            match self.inner.try_lock() {
                Ok(guard) => return Some(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            std::thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(Duration::from_millis(1));
        }
    }

    /// Consume the mutex and return its value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Background thread emitting `SampleTick` events; stops when dropped
pub struct Sampler {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// Start a sampling thread ticking every `interval`.
pub fn start_sampler(interval: Duration) -> std::io::Result<Sampler> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let handle = std::thread::Builder::new()
        .name("stagebench-sampler".into())
        .spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                std::thread::sleep(interval);
                emit(EventKind::SampleTick);
            }
        })?;
    Ok(Sampler {
        stop,
        handle: Some(handle),
    })
}

impl Sampler {
    /// Stop the thread and wait for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use stagebench_ipc::{EventLevel, RUNTIME_PROVIDER, SAMPLE_PROFILER_PROVIDER, keywords};

    fn runtime_provider(level: EventLevel, keywords: u64) -> Vec<ProviderSpec> {
        vec![ProviderSpec::new(RUNTIME_PROVIDER, level, keywords)]
    }

    fn count(events: &[TraceEvent], kind: EventKind) -> usize {
        events.iter().filter(|e| e.kind == kind).count()
    }

    #[test]
    fn test_stage_encoding_round_trips() {
        assert_eq!(decode_stage(encode_stage(None)), None);
        for mode in [IterationMode::Overhead, IterationMode::Workload] {
            for stage in [
                IterationStage::Jitting,
                IterationStage::Pilot,
                IterationStage::Warmup,
                IterationStage::Actual,
            ] {
                let tag = StageTag::new(mode, stage);
                assert_eq!(decode_stage(encode_stage(Some(tag))), Some(tag));
            }
        }
    }

    #[test]
    #[serial]
    fn test_nothing_recorded_without_sink() {
        uninstall();
        emit(EventKind::LockContention);
        assert!(!is_enabled(EventKind::LockContention));
        assert!(drain().is_empty());
    }

    #[test]
    #[serial]
    fn test_provider_filtering() {
        install(runtime_provider(EventLevel::Informational, keywords::GC));
        record_collection(0);
        record_gc_handle();
        emit(EventKind::LockContention);
        let (events, dropped) = uninstall();
        assert_eq!(dropped, 0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::GcEnd { generation: 0 });
    }

    #[test]
    #[serial]
    fn test_one_work_item_completes_once() {
        install(runtime_provider(EventLevel::Informational, keywords::THREADING));
        set_stage(Some(StageTag::WORKLOAD_ACTUAL));
        spawn_work_item(|| {
            std::hint::black_box(40 + 2);
        });
        set_stage(None);
        assert!(quiesce(Duration::from_secs(5)));
        let (events, _) = uninstall();

        assert_eq!(count(&events, EventKind::WorkItemCompleted), 1);
        assert_eq!(events[0].stage, Some(StageTag::WORKLOAD_ACTUAL));
    }

    #[test]
    #[serial]
    fn test_panicking_work_item_is_not_completed() {
        install(runtime_provider(EventLevel::Informational, keywords::THREADING));
        spawn_work_item(|| panic!("work item failure"));
        assert!(quiesce(Duration::from_secs(5)));
        let (events, _) = uninstall();
        assert_eq!(count(&events, EventKind::WorkItemCompleted), 0);
        assert_eq!(pending_work_items(), 0);
    }

    #[test]
    #[serial]
    fn test_timed_out_lock_attempt_is_one_contention() {
        install(runtime_provider(EventLevel::Informational, keywords::CONTENTION));
        let mutex = ContendedMutex::new(0u32);
        let held = mutex.lock();
        std::thread::scope(|s| {
            s.spawn(|| {
                assert!(mutex.try_lock_for(Duration::from_millis(10)).is_none());
            });
        });
        drop(held);
        let (events, _) = uninstall();
        assert_eq!(count(&events, EventKind::LockContention), 1);
    }

    #[test]
    #[serial]
    fn test_uncontended_locking_emits_nothing() {
        install(runtime_provider(EventLevel::Informational, keywords::CONTENTION));
        let mutex = ContendedMutex::new(Vec::new());
        for i in 0..100 {
            mutex.lock().push(i);
        }
        assert!(mutex.try_lock_for(Duration::from_millis(1)).is_some());
        let (events, _) = uninstall();
        assert!(events.is_empty());
        assert_eq!(mutex.into_inner().len(), 100);
    }

    #[test]
    #[serial]
    fn test_panic_hook_records_exception() {
        install(runtime_provider(EventLevel::Error, keywords::EXCEPTION));
        install_panic_hook();
        let result = std::panic::catch_unwind(|| panic!("boom"));
        assert!(result.is_err());
        let (events, _) = uninstall();
        assert_eq!(count(&events, EventKind::Exception), 1);
    }

    #[test]
    #[serial]
    fn test_sampler_ticks() {
        install(vec![ProviderSpec::new(
            SAMPLE_PROFILER_PROVIDER,
            EventLevel::Informational,
            0,
        )]);
        let sampler = start_sampler(Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        sampler.stop();
        let (events, _) = uninstall();
        assert!(count(&events, EventKind::SampleTick) > 0);
        assert!(events.iter().all(|e| e.kind == EventKind::SampleTick));
    }
}
