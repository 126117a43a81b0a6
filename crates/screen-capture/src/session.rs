// Capture session lifecycle
//
// Idle -> Preparing -> Running -> Stopping -> Closed, or Preparing -> Failed.
// One slot per CaptureSession, guarded by a single mutex. Backend calls for
// open and fault checks run on the worker thread; stop runs on the caller's.
// Lock order is always slot, then backend.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use flume::{Receiver, Sender};
use log::{debug, error, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::backend::{CaptureBackend, CaptureToken, EncoderRequest};
use crate::resolution::{self, DisplayMetrics, Resolution};
use crate::worker::Worker;
use crate::{BackendError, CaptureError, RecordingConfig, RecordingState, VideoFile};

/// Undelivered events kept before the oldest is dropped.
pub const EVENT_BACKLOG: usize = 32;

/// Opaque identifier of one capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Handle to a running session, returned by a successful open.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    display: DisplayMetrics,
    resolution: Resolution,
    output: VideoFile,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn display(&self) -> DisplayMetrics {
        self.display
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn output_path(&self) -> &Path {
        &self.output.path
    }

    pub fn started_at_millis(&self) -> i64 {
        self.output.created_at_millis
    }
}

/// Notifications about sessions, delivered asynchronously on [`CaptureSession::events`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Started {
        id: SessionId,
        resolution: Resolution,
        output_path: std::path::PathBuf,
    },
    /// The running encoder failed; the session is being force-stopped.
    Faulted { id: SessionId, reason: String },
    Closed {
        id: SessionId,
        output_path: std::path::PathBuf,
    },
}

/// Completion of an open request submitted to the worker.
pub struct PendingOpen {
    id: Option<SessionId>,
    rx: Receiver<Result<SessionHandle, CaptureError>>,
}

impl PendingOpen {
    fn rejected(err: CaptureError) -> Self {
        let (tx, rx) = flume::bounded(1);
        let _ = tx.send(Err(err));
        Self { id: None, rx }
    }

    /// Id the session will carry, if the request was accepted.
    pub fn id(&self) -> Option<SessionId> {
        self.id
    }

    /// Block until the worker finishes preparing.
    pub fn wait(self) -> Result<SessionHandle, CaptureError> {
        self.rx
            .recv()
            .unwrap_or(Err(CaptureError::WorkerUnavailable))
    }

    pub async fn wait_async(self) -> Result<SessionHandle, CaptureError> {
        self.rx
            .recv_async()
            .await
            .unwrap_or(Err(CaptureError::WorkerUnavailable))
    }
}

struct Active<B: CaptureBackend> {
    handle: SessionHandle,
    encoder: B::Encoder,
    binding: Option<B::Binding>,
}

struct Slot<B: CaptureBackend> {
    state: RecordingState,
    current: Option<SessionId>,
    cancel_requested: bool,
    shutting_down: bool,
    active: Option<Active<B>>,
}

struct Shared<B: CaptureBackend> {
    slot: Mutex<Slot<B>>,
    /// Signalled whenever a session leaves Stopping
    closed: Condvar,
    backend: Mutex<B>,
    config: RecordingConfig,
    events: Sender<SessionEvent>,
    backlog: Receiver<SessionEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the single recording slot and the worker that prepares sessions.
///
/// Dropping it stops a live session and joins the worker.
pub struct CaptureSession<B: CaptureBackend> {
    shared: Arc<Shared<B>>,
    worker: Worker,
    events: Receiver<SessionEvent>,
}

impl<B: CaptureBackend> CaptureSession<B> {
    pub fn new(backend: B, config: RecordingConfig) -> Result<Self, CaptureError> {
        let (events_tx, events_rx) = flume::bounded(EVENT_BACKLOG);
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot {
                state: RecordingState::Idle,
                current: None,
                cancel_requested: false,
                shutting_down: false,
                active: None,
            }),
            closed: Condvar::new(),
            backend: Mutex::new(backend),
            config,
            events: events_tx,
            backlog: events_rx.clone(),
        });

        let watched = Arc::clone(&shared);
        let worker = Worker::spawn("capture-session", shared.config.health_interval, move || {
            watched.check_running()
        })
        .map_err(|e| {
            error!("❌ Failed to spawn capture worker: {}", e);
            CaptureError::WorkerUnavailable
        })?;

        Ok(Self {
            shared,
            worker,
            events: events_rx,
        })
    }

    /// Start a session on the worker. The caller is not blocked.
    ///
    /// Fails immediately with [`CaptureError::SessionActive`] while another
    /// session is preparing, running or stopping.
    pub fn open(&self, display: DisplayMetrics, token: CaptureToken) -> PendingOpen {
        let id = match self.shared.begin_open() {
            Ok(id) => id,
            Err(e) => return PendingOpen::rejected(e),
        };

        let (tx, rx) = flume::bounded(1);
        let shared = Arc::clone(&self.shared);
        let submitted = self.worker.submit(move || {
            let result = shared.prepare(id, display, &token);
            let _ = tx.send(result);
        });

        if let Err(e) = submitted {
            self.shared.finish_failed(id, &e);
            return PendingOpen::rejected(e);
        }

        PendingOpen { id: Some(id), rx }
    }

    /// Stop the session and wait for its teardown, including one already
    /// under way on another thread. Calling it again, or on a closed session,
    /// does nothing.
    pub fn stop(&self, handle: &SessionHandle) {
        self.shared.stop(handle.id);
    }

    /// Stop by id; also cancels a session that is still preparing.
    pub fn stop_id(&self, id: SessionId) {
        self.shared.stop(id);
    }

    pub fn state(&self) -> RecordingState {
        lock(&self.shared.slot).state
    }

    /// State of `handle`'s session, or [`CaptureError::AlreadyClosed`] once it has ended.
    pub fn status(&self, handle: &SessionHandle) -> Result<RecordingState, CaptureError> {
        let slot = lock(&self.shared.slot);
        if slot.current == Some(handle.id) {
            Ok(slot.state)
        } else {
            Err(CaptureError::AlreadyClosed)
        }
    }

    /// Session notifications. Receivers share one queue; when nobody drains
    /// it, only the newest [`EVENT_BACKLOG`] events are kept.
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.events.clone()
    }

    pub fn config(&self) -> &RecordingConfig {
        &self.shared.config
    }
}

impl<B: CaptureBackend> Drop for CaptureSession<B> {
    fn drop(&mut self) {
        let current = {
            let mut slot = lock(&self.shared.slot);
            slot.shutting_down = true;
            slot.current
        };
        if let Some(id) = current {
            info!("🛑 Capture session dropped with session {} live", id);
            self.shared.stop(id);
        }
        self.worker.shutdown();
    }
}

impl<B: CaptureBackend> Shared<B> {
    fn begin_open(&self) -> Result<SessionId, CaptureError> {
        let mut slot = lock(&self.slot);
        if slot.shutting_down {
            return Err(CaptureError::WorkerUnavailable);
        }
        if slot.state.is_live() {
            return Err(CaptureError::SessionActive);
        }

        let id = SessionId::new();
        slot.state = RecordingState::Preparing;
        slot.current = Some(id);
        slot.cancel_requested = false;
        Ok(id)
    }

    fn cancelled(&self, id: SessionId) -> bool {
        let slot = lock(&self.slot);
        slot.cancel_requested || slot.shutting_down || slot.current != Some(id)
    }

    fn prepare(&self, id: SessionId, display: DisplayMetrics, token: &CaptureToken) -> Result<SessionHandle, CaptureError> {
        let result = self.try_prepare(id, display.evened(), token);
        if let Err(e) = &result {
            self.finish_failed(id, e);
        }
        result
    }

    fn try_prepare(&self, id: SessionId, display: DisplayMetrics, token: &CaptureToken) -> Result<SessionHandle, CaptureError> {
        if display.is_empty() {
            return Err(CaptureError::InvalidDisplay { display });
        }
        if self.cancelled(id) {
            return Err(CaptureError::Cancelled);
        }

        let candidates: Vec<Resolution> = resolution::qualifying(display, &self.config.candidates).collect();
        if candidates.is_empty() {
            return Err(CaptureError::NoCandidateFits { display });
        }

        let output = VideoFile::create_in(&self.config.output_dir, self.config.container)?;
        info!("🎬 Preparing session {} for display {} -> {:?}", id, display, output.path);

        let result = self.run_attempts(id, display, token, &candidates, &output);
        if result.is_err() {
            output.discard();
        }
        result
    }

    /// Try candidates in order. A stop request is honoured between attempts
    /// and between binding the capture source and starting the encoder.
    fn run_attempts(
        &self,
        id: SessionId,
        display: DisplayMetrics,
        token: &CaptureToken,
        candidates: &[Resolution],
        output: &VideoFile,
    ) -> Result<SessionHandle, CaptureError> {
        let mut attempts = 0;
        let mut last = None;
        for &resolution in candidates {
            if self.cancelled(id) {
                return Err(CaptureError::Cancelled);
            }
            attempts += 1;

            let request = EncoderRequest::new(resolution, output.path.clone(), &self.config);
            let prepared = {
                let mut backend = lock(&self.backend);
                prepare_source(&mut *backend, &request, token, display)
            };
            let (encoder, binding) = match prepared {
                Ok(prepared) => prepared,
                Err(e) => {
                    warn!("⚠️  Encoder attempt {} at {} failed: {}", attempts, resolution, e);
                    last = Some(e);
                    continue;
                }
            };

            if self.cancelled(id) {
                let mut backend = lock(&self.backend);
                release(&mut *backend, encoder, Some(binding));
                return Err(CaptureError::Cancelled);
            }

            let started = {
                let mut backend = lock(&self.backend);
                start(&mut *backend, encoder, binding)
            };
            match started {
                Ok((encoder, binding)) => {
                    let handle = SessionHandle {
                        id,
                        display,
                        resolution,
                        output: output.clone(),
                    };
                    return self.enter_running(handle, encoder, binding);
                }
                Err(e) => {
                    warn!("⚠️  Encoder attempt {} at {} failed: {}", attempts, resolution, e);
                    last = Some(e);
                }
            }
        }

        Err(match last {
            Some(last) => CaptureError::ResourceAcquisitionFailed { attempts, last },
            None => CaptureError::NoCandidateFits { display },
        })
    }

    fn enter_running(&self, handle: SessionHandle, encoder: B::Encoder, binding: B::Binding) -> Result<SessionHandle, CaptureError> {
        let mut slot = lock(&self.slot);
        if slot.cancel_requested || slot.shutting_down || slot.current != Some(handle.id) {
            drop(slot);
            info!("Session {} was stopped while preparing, releasing encoder", handle.id);
            let mut backend = lock(&self.backend);
            release(&mut *backend, encoder, Some(binding));
            return Err(CaptureError::Cancelled);
        }

        slot.state = RecordingState::Running;
        slot.active = Some(Active {
            handle: handle.clone(),
            encoder,
            binding: Some(binding),
        });
        drop(slot);

        info!("▶️  Session {} recording at {}", handle.id, handle.resolution);
        self.publish(SessionEvent::Started {
            id: handle.id,
            resolution: handle.resolution,
            output_path: handle.output.path.clone(),
        });
        Ok(handle)
    }

    fn finish_failed(&self, id: SessionId, err: &CaptureError) {
        let mut slot = lock(&self.slot);
        if slot.current != Some(id) {
            return;
        }
        slot.current = None;
        slot.cancel_requested = false;
        if matches!(err, CaptureError::Cancelled) {
            info!("Session {} cancelled before running", id);
            slot.state = RecordingState::Closed;
        } else {
            error!("❌ Session {} failed to open: {}", id, err);
            slot.state = RecordingState::Failed;
        }
    }

    fn stop(&self, id: SessionId) {
        let active = {
            let mut slot = lock(&self.slot);
            if slot.current != Some(id) {
                debug!("Stop for session {} ignored: {}", id, CaptureError::AlreadyClosed);
                return;
            }
            let state = slot.state;
            match state {
                RecordingState::Preparing => {
                    info!("Stop requested while session {} is preparing", id);
                    slot.cancel_requested = true;
                    return;
                }
                RecordingState::Running => match slot.active.take() {
                    Some(active) => {
                        slot.state = RecordingState::Stopping;
                        active
                    }
                    None => {
                        slot.state = RecordingState::Closed;
                        slot.current = None;
                        return;
                    }
                },
                RecordingState::Stopping => {
                    debug!("Session {} is already stopping, waiting for it to close", id);
                    let _slot = self
                        .closed
                        .wait_while(slot, |slot| {
                            slot.current == Some(id) && slot.state == RecordingState::Stopping
                        })
                        .unwrap_or_else(PoisonError::into_inner);
                    return;
                }
                state => {
                    debug!("Stop for session {} ignored in state {:?}", id, state);
                    return;
                }
            }
        };

        info!("⏹️  Stopping session {}", id);
        {
            let mut backend = lock(&self.backend);
            release(&mut *backend, active.encoder, active.binding);
        }

        {
            let mut slot = lock(&self.slot);
            slot.state = RecordingState::Closed;
            slot.current = None;
        }
        self.closed.notify_all();

        info!("✅ Session {} closed: {:?}", id, active.handle.output.path);
        self.publish(SessionEvent::Closed {
            id,
            output_path: active.handle.output.path,
        });
    }

    /// Worker tick: a running encoder that reports a fault is force-stopped.
    fn check_running(&self) {
        let (id, fault) = {
            let mut slot = lock(&self.slot);
            if slot.state != RecordingState::Running {
                return;
            }
            let Some(active) = slot.active.as_mut() else {
                return;
            };
            let mut backend = lock(&self.backend);
            match backend.check(&mut active.encoder) {
                Ok(()) => return,
                Err(e) => (active.handle.id, e),
            }
        };

        error!("💥 Session {} faulted: {}", id, fault);
        self.publish(SessionEvent::Faulted {
            id,
            reason: fault.to_string(),
        });
        self.stop(id);
    }

    /// Queue an event, dropping the oldest undelivered one when the backlog is full.
    fn publish(&self, mut event: SessionEvent) {
        loop {
            match self.events.try_send(event) {
                Ok(()) => return,
                Err(flume::TrySendError::Full(rejected)) => {
                    if let Ok(stale) = self.backlog.try_recv() {
                        debug!("Event backlog full, dropping {:?}", stale);
                    }
                    event = rejected;
                }
                Err(flume::TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

/// Acquire an encoder and bind the capture source to it. The encoder is
/// released again if binding fails.
fn prepare_source<B: CaptureBackend>(
    backend: &mut B,
    request: &EncoderRequest,
    token: &CaptureToken,
    display: DisplayMetrics,
) -> Result<(B::Encoder, B::Binding), BackendError> {
    let mut encoder = backend.acquire_encoder(request)?;

    match backend.bind_capture_source(&mut encoder, token, display) {
        Ok(binding) => Ok((encoder, binding)),
        Err(e) => {
            release(backend, encoder, None);
            Err(e)
        }
    }
}

/// Start a prepared encoder; both halves are released if it refuses.
fn start<B: CaptureBackend>(
    backend: &mut B,
    mut encoder: B::Encoder,
    binding: B::Binding,
) -> Result<(B::Encoder, B::Binding), BackendError> {
    match backend.start(&mut encoder) {
        Ok(()) => Ok((encoder, binding)),
        Err(e) => {
            release(backend, encoder, Some(binding));
            Err(e)
        }
    }
}

/// Binding first, then encoder. Errors are logged, never returned.
fn release<B: CaptureBackend>(backend: &mut B, mut encoder: B::Encoder, binding: Option<B::Binding>) {
    if let Some(binding) = binding {
        if let Err(e) = backend.release_binding(&mut encoder, binding) {
            warn!("⚠️  {}", CaptureError::TeardownFault(e));
        }
    }
    if let Err(e) = backend.release_encoder(encoder) {
        warn!("⚠️  {}", CaptureError::TeardownFault(e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CandidateList;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug, Default, Clone)]
    struct Calls {
        acquired: Vec<Resolution>,
        bound: usize,
        started: usize,
        released_bindings: usize,
        released_encoders: usize,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Stage {
        Acquire,
        Bind,
        Start,
        ReleaseEncoder,
    }

    /// Parks the backend at `stage`: reports entry, then waits to be let through.
    struct Gate {
        stage: Stage,
        entered: Sender<()>,
        release: Receiver<()>,
    }

    #[derive(Default)]
    struct Script {
        fail_acquire: usize,
        fail_start: usize,
        fail_release: bool,
        /// start writes a few bytes to the output path
        write_output: bool,
        gate: Option<Gate>,
    }

    struct MockBackend {
        calls: Arc<Mutex<Calls>>,
        fault: Arc<AtomicBool>,
        script: Script,
    }

    impl MockBackend {
        fn pass(&self, stage: Stage) {
            if let Some(gate) = self.script.gate.as_ref().filter(|g| g.stage == stage) {
                gate.entered.send(()).unwrap();
                gate.release.recv_timeout(WAIT).unwrap();
            }
        }
    }

    struct MockEncoder {
        output_path: std::path::PathBuf,
    }
    struct MockBinding;

    impl CaptureBackend for MockBackend {
        type Encoder = MockEncoder;
        type Binding = MockBinding;

        fn acquire_encoder(&mut self, request: &EncoderRequest) -> Result<MockEncoder, BackendError> {
            self.pass(Stage::Acquire);
            if self.script.fail_acquire > 0 {
                self.script.fail_acquire -= 1;
                return Err(BackendError::EncoderUnavailable {
                    reason: "busy".into(),
                });
            }
            self.calls.lock().unwrap().acquired.push(request.resolution);
            Ok(MockEncoder {
                output_path: request.output_path.clone(),
            })
        }

        fn bind_capture_source(
            &mut self,
            _encoder: &mut MockEncoder,
            _token: &CaptureToken,
            _display: DisplayMetrics,
        ) -> Result<MockBinding, BackendError> {
            self.pass(Stage::Bind);
            self.calls.lock().unwrap().bound += 1;
            Ok(MockBinding)
        }

        fn start(&mut self, encoder: &mut MockEncoder) -> Result<(), BackendError> {
            self.pass(Stage::Start);
            if self.script.fail_start > 0 {
                self.script.fail_start -= 1;
                return Err(BackendError::EncoderRejected {
                    resolution: "any".into(),
                    reason: "prepare failed".into(),
                });
            }
            if self.script.write_output {
                std::fs::write(&encoder.output_path, b"ftyp").unwrap();
            }
            self.calls.lock().unwrap().started += 1;
            Ok(())
        }

        fn check(&mut self, _encoder: &mut MockEncoder) -> Result<(), BackendError> {
            if self.fault.load(Ordering::SeqCst) {
                Err(BackendError::EncoderExited {
                    reason: "exit status 1".into(),
                })
            } else {
                Ok(())
            }
        }

        fn release_binding(&mut self, _encoder: &mut MockEncoder, _binding: MockBinding) -> Result<(), BackendError> {
            self.calls.lock().unwrap().released_bindings += 1;
            if self.script.fail_release {
                return Err(BackendError::CaptureSource {
                    reason: "already gone".into(),
                });
            }
            Ok(())
        }

        fn release_encoder(&mut self, _encoder: MockEncoder) -> Result<(), BackendError> {
            self.pass(Stage::ReleaseEncoder);
            self.calls.lock().unwrap().released_encoders += 1;
            if self.script.fail_release {
                return Err(BackendError::EncoderExited {
                    reason: "already gone".into(),
                });
            }
            Ok(())
        }
    }

    /// A gate at `stage` plus the test's ends of it.
    fn gate(stage: Stage) -> (Gate, Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = flume::unbounded();
        let (release_tx, release_rx) = flume::unbounded();
        let gate = Gate {
            stage,
            entered: entered_tx,
            release: release_rx,
        };
        (gate, entered_rx, release_tx)
    }

    fn files_in(dir: &Path) -> Vec<std::path::PathBuf> {
        match std::fs::read_dir(dir) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    struct Fixture {
        session: CaptureSession<MockBackend>,
        calls: Arc<Mutex<Calls>>,
        fault: Arc<AtomicBool>,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(script: Script) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let calls = Arc::new(Mutex::new(Calls::default()));
            let fault = Arc::new(AtomicBool::new(false));
            let backend = MockBackend {
                calls: Arc::clone(&calls),
                fault: Arc::clone(&fault),
                script,
            };
            let config = RecordingConfig {
                output_dir: dir.path().join("videos"),
                health_interval: Duration::from_millis(10),
                ..Default::default()
            };
            let session = CaptureSession::new(backend, config).unwrap();
            Self {
                session,
                calls,
                fault,
                _dir: dir,
            }
        }

        fn calls(&self) -> Calls {
            self.calls.lock().unwrap().clone()
        }

        fn open(&self, width: u32, height: u32) -> Result<SessionHandle, CaptureError> {
            self.session
                .open(DisplayMetrics::new(width, height), CaptureToken::new(":0.0"))
                .wait()
        }
    }

    #[test]
    fn open_runs_at_first_fitting_candidate() {
        let fx = Fixture::new(Script::default());
        let handle = fx.open(1920, 1080).unwrap();

        assert_eq!(handle.resolution(), Resolution { width: 1440, height: 810 });
        assert_eq!(fx.session.state(), RecordingState::Running);
        assert_eq!(fx.session.status(&handle).unwrap(), RecordingState::Running);

        let name = handle.output_path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("video_") && name.ends_with(".mp4"), "{name}");
        assert_eq!(handle.output_path().parent(), Some(fx.session.config().output_dir.as_path()));

        match fx.session.events().recv_timeout(WAIT).unwrap() {
            SessionEvent::Started { id, resolution, .. } => {
                assert_eq!(id, handle.id());
                assert_eq!(resolution, handle.resolution());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn odd_display_matches_evened_display() {
        let fx = Fixture::new(Script::default());
        let handle = fx.open(1921, 1081).unwrap();
        assert_eq!(handle.display(), DisplayMetrics::new(1920, 1080));
        assert_eq!(handle.resolution(), Resolution { width: 1440, height: 810 });
    }

    #[test]
    fn failed_attempts_are_released_before_retry() {
        let fx = Fixture::new(Script {
            fail_start: 2,
            ..Default::default()
        });
        let handle = fx.open(1920, 1080).unwrap();
        assert_eq!(handle.resolution(), Resolution { width: 720, height: 404 });

        let calls = fx.calls();
        assert_eq!(calls.acquired.len(), 3);
        assert_eq!(calls.released_encoders, 2);
        assert_eq!(calls.released_bindings, 2);

        fx.session.stop(&handle);
        let calls = fx.calls();
        assert_eq!(calls.released_encoders, calls.acquired.len());
        assert_eq!(calls.released_bindings, calls.bound);
    }

    #[test]
    fn failed_acquire_has_nothing_to_release() {
        let fx = Fixture::new(Script {
            fail_acquire: 1,
            ..Default::default()
        });
        let handle = fx.open(1920, 1080).unwrap();
        assert_eq!(handle.resolution(), Resolution { width: 1280, height: 720 });
        assert_eq!(fx.calls().released_encoders, 0);
    }

    #[test]
    fn stop_is_idempotent() {
        let fx = Fixture::new(Script::default());
        let handle = fx.open(1920, 1080).unwrap();

        fx.session.stop(&handle);
        let after_first = fx.calls();
        assert_eq!(fx.session.state(), RecordingState::Closed);

        fx.session.stop(&handle);
        let after_second = fx.calls();
        assert_eq!(fx.session.state(), RecordingState::Closed);
        assert_eq!(after_first.released_encoders, 1);
        assert_eq!(after_second.released_encoders, 1);
        assert_eq!(after_second.released_bindings, 1);
        assert!(matches!(fx.session.status(&handle), Err(CaptureError::AlreadyClosed)));
    }

    #[test]
    fn no_candidate_fits_small_display() {
        let fx = Fixture::new(Script::default());
        let err = fx.open(300, 200).unwrap_err();
        assert!(matches!(err, CaptureError::NoCandidateFits { .. }));
        assert_eq!(fx.session.state(), RecordingState::Failed);
        assert!(fx.calls().acquired.is_empty());
    }

    #[test]
    fn exhausted_candidates_fail_once() {
        let fx = Fixture::new(Script {
            fail_start: usize::MAX,
            ..Default::default()
        });
        let err = fx.open(1920, 1080).unwrap_err();
        match err {
            CaptureError::ResourceAcquisitionFailed { attempts, .. } => assert_eq!(attempts, 5),
            other => panic!("unexpected error {other:?}"),
        }
        let calls = fx.calls();
        assert_eq!(calls.acquired.len(), 5);
        assert_eq!(calls.released_encoders, 5);
        assert_eq!(fx.session.state(), RecordingState::Failed);

        // A failed session leaves the slot free.
        assert!(matches!(fx.open(300, 200), Err(CaptureError::NoCandidateFits { .. })));
    }

    #[test]
    fn zero_display_is_invalid() {
        let fx = Fixture::new(Script::default());
        assert!(matches!(fx.open(0, 1080), Err(CaptureError::InvalidDisplay { .. })));
        // 1x1 evens down to 0x0
        assert!(matches!(fx.open(1, 1), Err(CaptureError::InvalidDisplay { .. })));
    }

    #[test]
    fn single_active_session() {
        let fx = Fixture::new(Script::default());
        let handle = fx.open(1920, 1080).unwrap();
        assert!(matches!(fx.open(1920, 1080), Err(CaptureError::SessionActive)));

        fx.session.stop(&handle);
        let next = fx.open(1920, 1080).unwrap();
        assert_ne!(next.id(), handle.id());
        assert_eq!(fx.calls().acquired.len(), 2);
    }

    #[test]
    fn running_fault_force_stops() {
        let fx = Fixture::new(Script::default());
        let events = fx.session.events();
        let handle = fx.open(1920, 1080).unwrap();
        assert!(matches!(events.recv_timeout(WAIT).unwrap(), SessionEvent::Started { .. }));

        fx.fault.store(true, Ordering::SeqCst);

        match events.recv_timeout(WAIT).unwrap() {
            SessionEvent::Faulted { id, reason } => {
                assert_eq!(id, handle.id());
                assert!(reason.contains("exit status 1"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(events.recv_timeout(WAIT).unwrap(), SessionEvent::Closed { .. }));
        assert_eq!(fx.session.state(), RecordingState::Closed);
        assert_eq!(fx.calls().released_encoders, 1);

        // The owner's own stop afterwards is a no-op.
        fx.session.stop(&handle);
        assert_eq!(fx.calls().released_encoders, 1);
    }

    #[test]
    fn stop_while_preparing_cancels() {
        let (gate, entered, release) = gate(Stage::Acquire);
        let fx = Fixture::new(Script {
            gate: Some(gate),
            ..Default::default()
        });

        let pending = fx.session.open(DisplayMetrics::new(1920, 1080), CaptureToken::new(":0.0"));
        let id = pending.id().unwrap();
        entered.recv_timeout(WAIT).unwrap();
        assert_eq!(fx.session.state(), RecordingState::Preparing);

        fx.session.stop_id(id);
        release.send(()).unwrap();

        assert!(matches!(pending.wait(), Err(CaptureError::Cancelled)));
        assert_eq!(fx.session.state(), RecordingState::Closed);
        let calls = fx.calls();
        assert_eq!(calls.acquired.len(), 1);
        assert_eq!(calls.started, 0);
        assert_eq!(calls.released_encoders, 1);
        assert_eq!(calls.released_bindings, 1);
    }

    #[test]
    fn stop_during_failing_attempt_tries_no_further_candidates() {
        let (gate, entered, release) = gate(Stage::Acquire);
        let fx = Fixture::new(Script {
            fail_acquire: 1,
            gate: Some(gate),
            ..Default::default()
        });

        let pending = fx.session.open(DisplayMetrics::new(1920, 1080), CaptureToken::new(":0.0"));
        entered.recv_timeout(WAIT).unwrap();
        fx.session.stop_id(pending.id().unwrap());
        release.send(()).unwrap();

        assert!(matches!(pending.wait(), Err(CaptureError::Cancelled)));
        assert!(entered.try_recv().is_err(), "a second candidate was attempted");
        let calls = fx.calls();
        assert!(calls.acquired.is_empty());
        assert_eq!(calls.released_encoders, 0);
        assert_eq!(fx.session.state(), RecordingState::Closed);
    }

    #[test]
    fn stop_after_binding_never_starts_encoder() {
        let (gate, entered, release) = gate(Stage::Bind);
        let fx = Fixture::new(Script {
            gate: Some(gate),
            ..Default::default()
        });

        let pending = fx.session.open(DisplayMetrics::new(1920, 1080), CaptureToken::new(":0.0"));
        entered.recv_timeout(WAIT).unwrap();
        fx.session.stop_id(pending.id().unwrap());
        release.send(()).unwrap();

        assert!(matches!(pending.wait(), Err(CaptureError::Cancelled)));
        let calls = fx.calls();
        assert_eq!(calls.started, 0);
        assert_eq!(calls.released_bindings, 1);
        assert_eq!(calls.released_encoders, 1);
    }

    #[test]
    fn stop_after_start_leaves_no_file() {
        let (gate, entered, release) = gate(Stage::Start);
        let fx = Fixture::new(Script {
            write_output: true,
            gate: Some(gate),
            ..Default::default()
        });

        let pending = fx.session.open(DisplayMetrics::new(1920, 1080), CaptureToken::new(":0.0"));
        entered.recv_timeout(WAIT).unwrap();
        fx.session.stop_id(pending.id().unwrap());
        release.send(()).unwrap();

        assert!(matches!(pending.wait(), Err(CaptureError::Cancelled)));
        let calls = fx.calls();
        assert_eq!(calls.started, 1);
        assert_eq!(calls.released_encoders, 1);
        assert_eq!(files_in(&fx.session.config().output_dir), Vec::<std::path::PathBuf>::new());
    }

    #[test]
    fn stopped_session_keeps_its_file() {
        let fx = Fixture::new(Script {
            write_output: true,
            ..Default::default()
        });
        let handle = fx.open(1920, 1080).unwrap();
        fx.session.stop(&handle);
        assert_eq!(files_in(&fx.session.config().output_dir), vec![handle.output_path().to_path_buf()]);
    }

    #[test]
    fn concurrent_stop_waits_for_teardown() {
        let (gate, entered, release) = gate(Stage::ReleaseEncoder);
        let fx = Arc::new(Fixture::new(Script {
            gate: Some(gate),
            ..Default::default()
        }));
        let handle = fx.open(1920, 1080).unwrap();

        let first = {
            let fx = Arc::clone(&fx);
            let handle = handle.clone();
            std::thread::spawn(move || fx.session.stop(&handle))
        };
        entered.recv_timeout(WAIT).unwrap();
        assert_eq!(fx.session.state(), RecordingState::Stopping);

        let second_done = Arc::new(AtomicBool::new(false));
        let second = {
            let fx = Arc::clone(&fx);
            let handle = handle.clone();
            let done = Arc::clone(&second_done);
            std::thread::spawn(move || {
                fx.session.stop(&handle);
                done.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        assert!(!second_done.load(Ordering::SeqCst), "second stop returned before teardown");

        release.send(()).unwrap();
        first.join().unwrap();
        second.join().unwrap();
        assert!(second_done.load(Ordering::SeqCst));
        assert_eq!(fx.session.state(), RecordingState::Closed);
        assert_eq!(fx.calls().released_encoders, 1);
    }

    #[test]
    fn undrained_events_are_bounded() {
        let fx = Fixture::new(Script::default());
        let mut last = None;
        for _ in 0..EVENT_BACKLOG {
            let handle = fx.open(1920, 1080).unwrap();
            fx.session.stop(&handle);
            last = Some(handle.id());
        }

        let events = fx.session.events();
        assert_eq!(events.len(), EVENT_BACKLOG);
        let newest = events.drain().last().unwrap();
        assert!(matches!(newest, SessionEvent::Closed { id, .. } if Some(id) == last));
    }

    #[test]
    fn teardown_errors_are_swallowed() {
        let fx = Fixture::new(Script {
            fail_release: true,
            ..Default::default()
        });
        let handle = fx.open(1920, 1080).unwrap();
        fx.session.stop(&handle);
        assert_eq!(fx.session.state(), RecordingState::Closed);
        let calls = fx.calls();
        assert_eq!(calls.released_bindings, 1);
        assert_eq!(calls.released_encoders, 1);
    }

    #[test]
    fn drop_releases_live_session() {
        let fx = Fixture::new(Script::default());
        let calls = Arc::clone(&fx.calls);
        fx.open(1920, 1080).unwrap();

        drop(fx);
        assert_eq!(calls.lock().unwrap().released_encoders, 1);
    }

    #[test]
    fn custom_candidates_are_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend {
            calls: Arc::new(Mutex::new(Calls::default())),
            fault: Arc::new(AtomicBool::new(false)),
            script: Script::default(),
        };
        let config = RecordingConfig {
            output_dir: dir.path().to_path_buf(),
            candidates: CandidateList::new(vec![800]),
            ..Default::default()
        };
        let session = CaptureSession::new(backend, config).unwrap();
        let handle = session
            .open(DisplayMetrics::new(1920, 1200), CaptureToken::new(":1"))
            .wait()
            .unwrap();
        assert_eq!(handle.resolution(), Resolution { width: 800, height: 500 });
    }
}
