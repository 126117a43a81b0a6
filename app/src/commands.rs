use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use flume::Receiver;
use log::{info, warn};
use screen_capture::resolution;
use screen_capture::{
    CandidateList, CaptureBackend, CaptureToken, DisplayMetrics, SessionEvent, SessionHandle, SessionId,
};

use crate::cli::RecordArgs;
use crate::display;
use crate::events::{ProbeEvent, Reporter};
use crate::state::{AppState, Settings};

/// Why a running recording ended
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    Requested,
    Interrupted,
    Elapsed,
    Faulted(String),
}

/// Platform default grabber input
pub fn default_capture_target() -> Result<String> {
    if cfg!(target_os = "macos") {
        Ok("Capture screen 0:none".to_string())
    } else if cfg!(target_os = "windows") {
        Ok("desktop".to_string())
    } else {
        std::env::var("DISPLAY")
            .ok()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| anyhow!("No X display found (DISPLAY is unset); set captureTarget or pass --target"))
    }
}

/// Make sure the output folder exists and accepts new files.
pub fn ensure_output_folder(folder: &Path) -> Result<()> {
    if !folder.exists() {
        info!("📁 Creating output folder: {:?}", folder);
        std::fs::create_dir_all(folder)
            .with_context(|| format!("Failed to create output folder {:?}", folder))?;
    }

    let probe = folder.join(".screen-recorder-write-test");
    std::fs::write(&probe, b"")
        .with_context(|| format!("Output folder {:?} is not writable", folder))?;
    if let Err(e) = std::fs::remove_file(&probe) {
        warn!("⚠️  Failed to remove {:?}: {}", probe, e);
    }
    Ok(())
}

/// Check recording prerequisites and produce the capture authorization.
pub fn authorize_capture(settings: &Settings) -> Result<CaptureToken> {
    ensure_output_folder(&settings.output_folder)?;
    let target = match &settings.capture_target {
        Some(target) if !target.trim().is_empty() => target.clone(),
        _ => default_capture_target()?,
    };
    info!("🔑 Capture authorized for input {:?}", target);
    Ok(CaptureToken::new(target))
}

/// Resolution the recorder would use for `display`
pub fn probe(display: DisplayMetrics, candidates: &CandidateList) -> ProbeEvent {
    let evened = display.evened();
    ProbeEvent {
        display: display.to_string(),
        selected: resolution::select(evened, candidates).ok(),
        qualifying: resolution::qualifying(evened, candidates).collect(),
    }
}

/// Fold command-line overrides into the loaded settings
pub fn apply_overrides(settings: &mut Settings, args: &RecordArgs) {
    if let Some(folder) = &args.output_folder {
        settings.output_folder = folder.clone();
    }
    if let Some(target) = &args.capture_target {
        settings.capture_target = Some(target.clone());
    }
    if let Some(size) = args.display_size {
        settings.display_size = Some(size);
    }
}

/// First line on stdin. EOF never fires, so piped input does not stop a recording.
fn spawn_enter_listener() -> Receiver<()> {
    let (tx, rx) = flume::bounded(1);
    let spawned = std::thread::Builder::new()
        .name("stop-key".into())
        .spawn(move || {
            let mut line = String::new();
            if matches!(std::io::stdin().read_line(&mut line), Ok(n) if n > 0) {
                let _ = tx.send(());
            }
        });
    if let Err(e) = spawned {
        warn!("⚠️  Cannot listen for Enter: {}", e);
    }
    rx
}

/// Process shutdown requests: Ctrl+C everywhere, SIGTERM on unix.
pub struct Shutdown {
    #[cfg(unix)]
    terminate: Option<tokio::signal::unix::Signal>,
}

impl Shutdown {
    /// Install the handlers now, so a signal sent before the first `recv` is not lost.
    #[cfg(unix)]
    pub fn listen() -> Self {
        use tokio::signal::unix::{signal, SignalKind};

        let terminate = match signal(SignalKind::terminate()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!("⚠️  Cannot listen for SIGTERM: {}", e);
                None
            }
        };
        Self { terminate }
    }

    #[cfg(not(unix))]
    pub fn listen() -> Self {
        Self {}
    }

    #[cfg(unix)]
    pub async fn recv(&mut self) {
        let terminate = async {
            match self.terminate.as_mut() {
                Some(signal) => {
                    signal.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = ctrl_c() => {}
            _ = terminate => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("⚠️  Cannot listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Everything that can end a recording from outside the session.
pub struct StopTriggers {
    enter: Receiver<()>,
    shutdown: Shutdown,
}

impl StopTriggers {
    pub fn listen() -> Self {
        Self::new(spawn_enter_listener(), Shutdown::listen())
    }

    pub fn new(enter: Receiver<()>, shutdown: Shutdown) -> Self {
        Self { enter, shutdown }
    }
}

async fn enter_pressed(rx: &Receiver<()>) {
    if rx.recv_async().await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn elapsed(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

/// Wait for a fault on session `id`; other events are skipped.
pub async fn next_fault(events: &Receiver<SessionEvent>, id: SessionId) -> String {
    loop {
        match events.recv_async().await {
            Ok(SessionEvent::Faulted { id: faulted, reason }) if faulted == id => return reason,
            Ok(_) => continue,
            Err(_) => std::future::pending::<()>().await,
        }
    }
}

async fn wait_for_stop(
    triggers: &mut StopTriggers,
    duration: Option<Duration>,
    events: &Receiver<SessionEvent>,
    id: SessionId,
) -> StopReason {
    tokio::select! {
        _ = enter_pressed(&triggers.enter) => StopReason::Requested,
        _ = triggers.shutdown.recv() => StopReason::Interrupted,
        _ = elapsed(duration) => StopReason::Elapsed,
        reason = next_fault(events, id) => StopReason::Faulted(reason),
    }
}

/// Start a session; a shutdown request while the encoder is being prepared cancels it.
pub async fn start_recording<B: CaptureBackend>(
    state: &AppState<B>,
    shutdown: &mut Shutdown,
    token: CaptureToken,
    display: DisplayMetrics,
) -> Result<Option<SessionHandle>> {
    let pending = state.session.open(display, token);
    let id = pending.id();

    tokio::select! {
        biased;
        opened = pending.wait_async() => Ok(Some(opened.context("Failed to start recording")?)),
        _ = shutdown.recv() => {
            if let Some(id) = id {
                state.session.stop_id(id);
            }
            Ok(None)
        }
    }
}

/// Stop and wait for the encoder to finalize the file, also when a
/// fault-driven stop is already tearing the session down.
pub fn stop_recording<B: CaptureBackend>(state: &AppState<B>, handle: &SessionHandle) -> PathBuf {
    tokio::task::block_in_place(|| state.session.stop(handle));
    handle.output_path().to_path_buf()
}

/// Record until Enter, a shutdown signal, `duration`, or an encoder fault.
///
/// Returns why the recording ended, or None when it was cancelled while preparing.
pub async fn record<B: CaptureBackend>(
    state: &AppState<B>,
    reporter: Reporter,
    duration: Option<Duration>,
    triggers: &mut StopTriggers,
) -> Result<Option<StopReason>> {
    let token = authorize_capture(&state.settings)?;
    let display = display::resolve(None, state.settings.display_size, token.as_str()).await?;

    reporter.status("preparing");
    let Some(handle) = start_recording(state, &mut triggers.shutdown, token, display).await? else {
        reporter.status("cancelled");
        return Ok(None);
    };
    reporter.started(&handle);

    let events = state.session.events();
    let started = Instant::now();
    let reason = wait_for_stop(triggers, duration, &events, handle.id()).await;
    record_until_stopped(state, reporter, &handle, reason, started).map(Some)
}

fn record_until_stopped<B: CaptureBackend>(
    state: &AppState<B>,
    reporter: Reporter,
    handle: &SessionHandle,
    reason: StopReason,
    started: Instant,
) -> Result<StopReason> {
    info!("Stopping recording: {:?}", reason);
    reporter.status("stopping");
    let path = stop_recording(state, handle);
    let duration_ms = started.elapsed().as_millis() as u64;

    if let StopReason::Faulted(message) = &reason {
        reporter.error("recording_fault", message);
    }

    match std::fs::metadata(&path) {
        Ok(meta) if meta.len() > 0 => {
            reporter.clip_saved(&path, duration_ms, meta.len());
            Ok(reason)
        }
        _ => {
            reporter.error("no_output", &format!("No video was written to {}", path.display()));
            bail!("Recording produced no file")
        }
    }
}
