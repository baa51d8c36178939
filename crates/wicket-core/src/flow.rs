//! Kiosk flow controller.
//!
//! One controller instance owns every piece of cycle state: the single camera
//! slot, the QR scanner, the validated code, the pending request and the
//! submission latches. It runs as a single task fed by a command channel.
//! Timers are spawned tasks that post [`TimerEvent`]s back into that channel,
//! each tagged with the generation that scheduled it.
//!
//! Transitions:
//!
//! | from              | trigger                         | to                |
//! |-------------------|---------------------------------|-------------------|
//! | `Idle`            | `StartScan`, camera opened      | `ScanningQr`      |
//! | `Idle`            | `StartScan`, camera unavailable | `Idle`            |
//! | `ScanningQr`      | `StopScan`                      | `Idle`            |
//! | `Idle/ScanningQr` | code detected / typed           | `LivenessCapture` |
//! | `LivenessCapture` | burst with >= 1 frame           | `Verifying`       |
//! | `LivenessCapture` | face camera unavailable         | `ResultShown`     |
//! | `LivenessCapture` | burst retries exhausted         | `ResultShown`     |
//! | `Verifying`       | any verification result         | `ResultShown`     |
//! | `ResultShown`     | reset timer                     | `Idle` (then `ScanningQr` when rescanning) |
//!
//! Any generation bump (reset, teardown, stop, code accepted) turns every
//! timer scheduled before it into a no-op.

use crate::decoder::QrDecoder;
use crate::liveness::{capture_burst, BurstConfig};
use crate::scanner::{ManualEntry, QrScanner};
use crate::submitter::{Latches, Submitter, Verifier};
use crate::types::{
    DecodedCode, FlowEvent, FrameBurst, Severity, StatusUpdate, VerificationRequest,
    VerificationResult,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use wicket_hw::{CameraSession, Constraints, FacingMode, StreamSource};

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("flow controller has stopped")]
    ChannelClosed,
}

/// Timings and camera constraints for the flow.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// QR poll cadence.
    pub scan_interval: Duration,
    /// Pause between accepting a code and opening the face camera.
    pub transition_delay: Duration,
    /// Quiet period before a typed code is accepted.
    pub manual_debounce: Duration,
    pub burst: BurstConfig,
    /// Wait before retrying a burst that captured nothing.
    pub burst_retry: Duration,
    /// Bursts attempted per cycle before giving up.
    pub burst_max_attempts: u32,
    /// How long a result stays on screen before the reset.
    pub reset_delay: Duration,
    /// Reopen the QR camera after every reset.
    pub rescan_after_reset: bool,
    pub qr_constraints: Constraints,
    pub face_constraints: Constraints,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_millis(200),
            transition_delay: Duration::from_millis(1000),
            manual_debounce: Duration::from_millis(1000),
            burst: BurstConfig::default(),
            burst_retry: Duration::from_millis(800),
            burst_max_attempts: 5,
            reset_delay: Duration::from_millis(5000),
            rescan_after_reset: true,
            qr_constraints: Constraints::facing(FacingMode::Environment),
            face_constraints: Constraints::facing(FacingMode::User),
        }
    }
}

/// External collaborators the flow drives.
#[derive(Clone)]
pub struct FlowDeps {
    pub source: Arc<dyn StreamSource>,
    pub decoder: Arc<dyn QrDecoder>,
    pub verifier: Arc<dyn Verifier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Idle,
    ScanningQr,
    LivenessCapture,
    Verifying,
    ResultShown,
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FlowState::Idle => "idle",
            FlowState::ScanningQr => "scanning_qr",
            FlowState::LivenessCapture => "liveness_capture",
            FlowState::Verifying => "verifying",
            FlowState::ResultShown => "result_shown",
        })
    }
}

/// Read-only view of the controller.
#[derive(Debug, Clone, Serialize)]
pub struct FlowSnapshot {
    pub state: FlowState,
    pub generation: u64,
    pub validated_code: Option<String>,
    pub last_code: Option<String>,
    pub frames: usize,
    pub latches: Latches,
    pub camera_open: bool,
    pub poll_active: bool,
    pub status: Option<StatusUpdate>,
}

/// Timer callbacks, tagged with the generation that scheduled them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    PollTick { generation: u64 },
    StartLiveness { generation: u64 },
    RetryBurst { generation: u64 },
    ManualSettle { generation: u64, value: String },
    Reset { generation: u64 },
}

impl TimerEvent {
    pub fn generation(&self) -> u64 {
        match self {
            TimerEvent::PollTick { generation }
            | TimerEvent::StartLiveness { generation }
            | TimerEvent::RetryBurst { generation }
            | TimerEvent::ManualSettle { generation, .. }
            | TimerEvent::Reset { generation } => *generation,
        }
    }
}

/// Requests processed by the controller task.
#[derive(Debug)]
pub enum Command {
    StartScan,
    StopScan,
    /// Keystroke-level edit of the code field; debounced.
    ManualInput(String),
    /// Explicit submit of a typed code; accepted immediately.
    SubmitCode(String),
    Snapshot(oneshot::Sender<FlowSnapshot>),
    Timer(TimerEvent),
}

/// Shortest poll period; `interval` rejects zero.
const MIN_POLL_PERIOD: Duration = Duration::from_millis(1);

/// Spawned timers. Every handle is aborted on teardown.
///
/// Timers hold only a weak sender, so they never keep the command channel
/// open once every [`FlowHandle`] is gone.
struct Timers {
    tx: mpsc::WeakSender<Command>,
    poll: Option<JoinHandle<()>>,
    pending: Vec<JoinHandle<()>>,
}

impl Timers {
    fn new(tx: mpsc::WeakSender<Command>) -> Self {
        Self {
            tx,
            poll: None,
            pending: Vec::new(),
        }
    }

    fn schedule(&mut self, delay: Duration, event: TimerEvent) {
        self.pending.retain(|h| !h.is_finished());
        let tx = self.tx.clone();
        self.pending.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::Timer(event)).await;
            }
        }));
    }

    fn start_poll(&mut self, period: Duration, generation: u64) {
        self.stop_poll();
        let tx = self.tx.clone();
        let period = period.max(MIN_POLL_PERIOD);
        self.poll = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately; polling starts one period in.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(tx) = tx.upgrade() else {
                    break;
                };
                if tx
                    .send(Command::Timer(TimerEvent::PollTick { generation }))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }));
    }

    fn stop_poll(&mut self) {
        if let Some(handle) = self.poll.take() {
            handle.abort();
        }
    }

    fn poll_active(&self) -> bool {
        self.poll.is_some()
    }

    fn cancel_all(&mut self) {
        self.stop_poll();
        for handle in self.pending.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

pub struct FlowController {
    config: FlowConfig,
    source: Arc<dyn StreamSource>,
    verifier: Arc<dyn Verifier>,
    events: broadcast::Sender<FlowEvent>,
    timers: Timers,
    shutdown: CancellationToken,

    state: FlowState,
    generation: u64,
    /// The only camera slot; at most one session exists at a time.
    camera: Option<CameraSession>,
    scanner: QrScanner,
    manual: ManualEntry,
    validated_code: Option<DecodedCode>,
    request: Option<VerificationRequest>,
    burst_attempts: u32,
    submitter: Submitter,
    status: Option<StatusUpdate>,
}

impl FlowController {
    /// `tx` must feed the receiver this controller is driven from; timers
    /// post their events through it. Only a weak reference is kept, so the
    /// channel closes when the caller's senders are dropped.
    pub fn new(
        config: FlowConfig,
        deps: FlowDeps,
        tx: mpsc::Sender<Command>,
        events: broadcast::Sender<FlowEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            source: deps.source,
            verifier: deps.verifier,
            events,
            timers: Timers::new(tx.downgrade()),
            shutdown,
            state: FlowState::Idle,
            generation: 0,
            camera: None,
            scanner: QrScanner::new(deps.decoder),
            manual: ManualEntry::default(),
            validated_code: None,
            request: None,
            burst_attempts: 0,
            submitter: Submitter::default(),
            status: None,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            state: self.state,
            generation: self.generation,
            validated_code: self.validated_code.as_ref().map(|c| c.value.clone()),
            last_code: self.scanner.last_accepted().map(str::to_string),
            frames: self.request.as_ref().map_or(0, |r| r.frames.len()),
            latches: self.submitter.latches(),
            camera_open: self.camera.as_ref().is_some_and(CameraSession::is_active),
            poll_active: self.timers.poll_active(),
            status: self.status.clone(),
        }
    }

    /// Process commands until shutdown, then tear down.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        tracing::info!("flow controller started");
        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
            }
        }
        self.teardown();
        tracing::info!("flow controller stopped");
    }

    pub async fn handle(&mut self, cmd: Command) {
        if self.shutdown.is_cancelled() {
            return;
        }
        match cmd {
            Command::StartScan => self.start_scan().await,
            Command::StopScan => self.stop_scan(),
            Command::ManualInput(raw) => self.manual_input(&raw),
            Command::SubmitCode(raw) => self.accept_code(DecodedCode::new(raw.trim())).await,
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Timer(event) => self.on_timer(event).await,
        }
    }

    async fn on_timer(&mut self, event: TimerEvent) {
        if event.generation() != self.generation {
            tracing::trace!(?event, current = self.generation, "stale timer ignored");
            return;
        }
        match event {
            TimerEvent::PollTick { .. } => self.poll_tick().await,
            TimerEvent::StartLiveness { .. } => self.start_liveness().await,
            TimerEvent::RetryBurst { .. } => {
                if self.state == FlowState::LivenessCapture {
                    self.run_burst().await;
                }
            }
            TimerEvent::ManualSettle { value, .. } => {
                if self.manual.settle(&value) {
                    self.accept_code(DecodedCode::new(value)).await;
                }
            }
            TimerEvent::Reset { .. } => self.reset().await,
        }
    }

    async fn start_scan(&mut self) {
        if self.state != FlowState::Idle {
            tracing::debug!(state = %self.state, "start scan ignored");
            return;
        }

        self.close_camera();
        match CameraSession::open(&*self.source, self.config.qr_constraints).await {
            Ok(session) => {
                tracing::debug!(
                    device = session.label(),
                    facing = ?session.facing(),
                    "QR camera granted"
                );
                self.camera = Some(session);
                self.scanner.start();
                self.state = FlowState::ScanningQr;
                self.timers
                    .start_poll(self.config.scan_interval, self.generation);
                tracing::info!(generation = self.generation, "scanning for QR code");
                self.publish_status("Scanning QR code...", Severity::Info);
            }
            Err(err) => {
                tracing::warn!(error = %err, "QR camera unavailable");
                self.publish_status(
                    format!("Error: cannot access the camera. {err}"),
                    Severity::Error,
                );
            }
        }
    }

    fn stop_scan(&mut self) {
        if self.state != FlowState::ScanningQr {
            return;
        }
        self.timers.stop_poll();
        self.scanner.stop();
        self.close_camera();
        self.generation += 1;
        self.state = FlowState::Idle;
        tracing::info!("QR scanning stopped");
        self.publish_status("Scanning stopped", Severity::Info);
    }

    async fn poll_tick(&mut self) {
        if self.state != FlowState::ScanningQr {
            return;
        }
        let Some(camera) = self.camera.as_mut() else {
            return;
        };
        let Some(frame) = camera.current_frame().await else {
            return;
        };
        if let Some(code) = self.scanner.scan(&frame) {
            self.accept_code(code).await;
        }
    }

    fn manual_input(&mut self, raw: &str) {
        if !matches!(self.state, FlowState::Idle | FlowState::ScanningQr) {
            return;
        }
        if let Some(value) = self.manual.input(raw, self.scanner.last_accepted()) {
            self.timers.schedule(
                self.config.manual_debounce,
                TimerEvent::ManualSettle {
                    generation: self.generation,
                    value,
                },
            );
        }
    }

    /// Single entry point for `Detected(code)`, from the camera or the keyboard.
    async fn accept_code(&mut self, code: DecodedCode) {
        if !matches!(self.state, FlowState::Idle | FlowState::ScanningQr)
            || self.validated_code.is_some()
            || !self.submitter.latches().is_clear()
        {
            tracing::debug!(code = %code.value, state = %self.state, "code ignored, cycle in progress");
            return;
        }

        if !code.is_plausible() {
            tracing::warn!(len = code.value.len(), "implausible code rejected");
            if self.state == FlowState::ScanningQr {
                self.scanner.start();
            }
            self.publish_status("Invalid QR code", Severity::Warning);
            return;
        }

        tracing::info!(code = %code.value, "code accepted");
        self.scanner.remember(&code.value);
        self.scanner.stop();
        self.manual.clear();
        self.timers.stop_poll();
        self.close_camera();
        self.validated_code = Some(code);
        self.burst_attempts = 0;
        self.generation += 1;
        self.state = FlowState::LivenessCapture;
        self.publish_status(
            "QR code scanned. Proceeding to face verification...",
            Severity::Success,
        );
        self.timers.schedule(
            self.config.transition_delay,
            TimerEvent::StartLiveness {
                generation: self.generation,
            },
        );
    }

    async fn start_liveness(&mut self) {
        if self.state != FlowState::LivenessCapture {
            return;
        }

        self.close_camera();
        match CameraSession::open(&*self.source, self.config.face_constraints).await {
            Ok(session) => {
                tracing::debug!(
                    device = session.label(),
                    facing = ?session.facing(),
                    "face camera granted"
                );
                self.camera = Some(session);
                self.publish_status("Camera ready. Detecting face...", Severity::Info);
                self.run_burst().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "face camera unavailable");
                self.end_cycle(format!("Error: cannot access the camera. {err}"));
            }
        }
    }

    async fn run_burst(&mut self) {
        if !self.submitter.latches().is_clear() || self.validated_code.is_none() {
            return;
        }
        if self.camera.is_none() {
            return;
        }

        self.burst_attempts += 1;
        self.publish_status(
            "Center your face and blink (collecting samples)...",
            Severity::Info,
        );

        let burst = {
            let Some(camera) = self.camera.as_mut() else {
                return;
            };
            let submitter = &self.submitter;
            let shutdown = &self.shutdown;
            capture_burst(camera, &self.config.burst, || {
                !submitter.latches().is_clear() || shutdown.is_cancelled()
            })
            .await
        };

        if self.shutdown.is_cancelled() || self.state != FlowState::LivenessCapture {
            return;
        }

        if burst.is_empty() {
            if self.burst_attempts >= self.config.burst_max_attempts {
                tracing::warn!(attempts = self.burst_attempts, "no face frames captured");
                self.close_camera();
                self.end_cycle("Face not captured. Please try again.".to_string());
            } else {
                tracing::debug!(attempt = self.burst_attempts, "empty burst, retrying");
                self.timers.schedule(
                    self.config.burst_retry,
                    TimerEvent::RetryBurst {
                        generation: self.generation,
                    },
                );
            }
            return;
        }

        self.close_camera();
        self.submit(burst).await;
    }

    async fn submit(&mut self, burst: FrameBurst) {
        let Some(code) = self.validated_code.as_ref() else {
            return;
        };
        let request = VerificationRequest::new(code.value.clone(), burst);

        self.state = FlowState::Verifying;
        tracing::info!(code = %request.code, frames = request.frames.len(), "submitting verification");
        self.publish_status("Verification in progress...", Severity::Info);

        let request = self.request.insert(request);
        let outcome = self.submitter.submit(&*self.verifier, request).await;
        match outcome {
            Ok(result) => self.show_result(result),
            Err(err) => {
                tracing::warn!(error = %err, "submission refused");
                self.end_cycle("Verification failed. Please try again.".to_string());
            }
        }
    }

    fn show_result(&mut self, result: VerificationResult) {
        tracing::info!(outcome = result.outcome(), "verification finished");
        self.state = FlowState::ResultShown;
        let _ = self.events.send(FlowEvent::Finished(result.clone()));
        self.publish_status(result.headline(), result.severity());
        self.schedule_reset();
    }

    /// Terminal failure without a verdict: latch the cycle and take the
    /// normal reset path.
    fn end_cycle(&mut self, message: String) {
        self.submitter.mark_completed();
        self.state = FlowState::ResultShown;
        self.publish_status(message, Severity::Error);
        self.schedule_reset();
    }

    fn schedule_reset(&mut self) {
        self.timers.schedule(
            self.config.reset_delay,
            TimerEvent::Reset {
                generation: self.generation,
            },
        );
    }

    async fn reset(&mut self) {
        self.teardown();
        tracing::info!(generation = self.generation, "flow reset");
        self.publish_status("Ready to scan QR code", Severity::Info);
        let _ = self.events.send(FlowEvent::ResetComplete);
        if self.config.rescan_after_reset {
            self.start_scan().await;
        }
    }

    /// Abort every timer, release the camera and clear the cycle.
    ///
    /// Used by the reset timer and on shutdown; safe to call repeatedly.
    pub fn teardown(&mut self) {
        self.timers.cancel_all();
        self.close_camera();
        self.scanner.stop();
        self.scanner.clear_cache();
        self.manual.clear();
        self.validated_code = None;
        self.request = None;
        self.burst_attempts = 0;
        self.submitter.reset();
        self.generation += 1;
        self.state = FlowState::Idle;
    }

    fn close_camera(&mut self) {
        if let Some(mut camera) = self.camera.take() {
            camera.close();
        }
    }

    fn publish_status(&mut self, message: impl Into<String>, severity: Severity) {
        let update = StatusUpdate {
            message: message.into(),
            severity,
        };
        tracing::debug!(message = %update.message, %severity, "status");
        self.status = Some(update.clone());
        let _ = self.events.send(FlowEvent::Status(update));
    }
}

/// Clone-safe handle to a running controller.
#[derive(Clone)]
pub struct FlowHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<FlowEvent>,
    shutdown: CancellationToken,
}

impl FlowHandle {
    async fn send(&self, cmd: Command) -> Result<(), FlowError> {
        self.tx.send(cmd).await.map_err(|_| FlowError::ChannelClosed)
    }

    pub async fn start_scan(&self) -> Result<(), FlowError> {
        self.send(Command::StartScan).await
    }

    pub async fn stop_scan(&self) -> Result<(), FlowError> {
        self.send(Command::StopScan).await
    }

    pub async fn manual_input(&self, value: impl Into<String>) -> Result<(), FlowError> {
        self.send(Command::ManualInput(value.into())).await
    }

    pub async fn submit_code(&self, value: impl Into<String>) -> Result<(), FlowError> {
        self.send(Command::SubmitCode(value.into())).await
    }

    pub async fn snapshot(&self) -> Result<FlowSnapshot, FlowError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot(reply)).await?;
        rx.await.map_err(|_| FlowError::ChannelClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    /// Ask the controller to tear down and exit. Returns immediately.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Spawn a controller task and return its handle.
pub fn spawn_flow(config: FlowConfig, deps: FlowDeps) -> (FlowHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(32);
    let (events, _) = broadcast::channel(64);
    let shutdown = CancellationToken::new();
    let controller = FlowController::new(
        config,
        deps,
        tx.clone(),
        events.clone(),
        shutdown.clone(),
    );
    let task = tokio::spawn(controller.run(rx));
    (
        FlowHandle {
            tx,
            events,
            shutdown,
        },
        task,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DecodeError;
    use crate::submitter::{SubmitError, VerifyResponse};
    use crate::types::Payload;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;
    use wicket_hw::mock::{MockBehavior, MockSource};

    struct ScriptedDecoder(Mutex<VecDeque<Option<String>>>);

    impl QrDecoder for ScriptedDecoder {
        fn decode(&self, _: &[u8], _: u32, _: u32) -> Result<Option<String>, DecodeError> {
            Ok(self.0.lock().unwrap().pop_front().flatten())
        }
    }

    enum Reply {
        Json(serde_json::Value),
        Fail,
    }

    struct RecordingVerifier {
        reply: Reply,
        calls: Mutex<Vec<VerificationRequest>>,
    }

    impl RecordingVerifier {
        fn calls(&self) -> Vec<VerificationRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Verifier for RecordingVerifier {
        async fn verify(
            &self,
            request: &VerificationRequest,
        ) -> Result<VerifyResponse, SubmitError> {
            self.calls.lock().unwrap().push(request.clone());
            match &self.reply {
                Reply::Json(body) => Ok(serde_json::from_value(body.clone())?),
                Reply::Fail => Err(SubmitError::Status {
                    status: 503,
                    body: "unavailable".into(),
                }),
            }
        }
    }

    fn granted() -> Reply {
        Reply::Json(serde_json::json!({
            "success": true,
            "result": "ACCEPT",
            "message": "Access granted",
            "first_name": "Ada",
            "last_name": "Lovelace",
        }))
    }

    fn test_config() -> FlowConfig {
        FlowConfig {
            rescan_after_reset: false,
            ..FlowConfig::default()
        }
    }

    fn deps(
        behavior: MockBehavior,
        script: &[Option<&str>],
        reply: Reply,
    ) -> (FlowDeps, MockSource, Arc<RecordingVerifier>) {
        let source = MockSource::new(behavior);
        let verifier = Arc::new(RecordingVerifier {
            reply,
            calls: Mutex::new(Vec::new()),
        });
        let decoder = ScriptedDecoder(Mutex::new(
            script.iter().map(|s| s.map(str::to_string)).collect(),
        ));
        let deps = FlowDeps {
            source: Arc::new(source.clone()),
            decoder: Arc::new(decoder),
            verifier: verifier.clone(),
        };
        (deps, source, verifier)
    }

    struct Harness {
        flow: FlowController,
        /// Keeps the command channel open; the controller holds a weak sender.
        _tx: mpsc::Sender<Command>,
        rx: mpsc::Receiver<Command>,
        events: broadcast::Receiver<FlowEvent>,
        source: MockSource,
        verifier: Arc<RecordingVerifier>,
    }

    impl Harness {
        fn new(
            behavior: MockBehavior,
            script: &[Option<&str>],
            reply: Reply,
            config: FlowConfig,
        ) -> Self {
            let (deps, source, verifier) = deps(behavior, script, reply);
            let (tx, rx) = mpsc::channel(32);
            let (events_tx, events) = broadcast::channel(64);
            let flow = FlowController::new(
                config,
                deps,
                tx.clone(),
                events_tx,
                CancellationToken::new(),
            );
            Self {
                flow,
                _tx: tx,
                rx,
                events,
                source,
                verifier,
            }
        }

        /// Feed timer callbacks to the controller until one matching `want`
        /// has been handled.
        async fn run_until(&mut self, want: impl Fn(&TimerEvent) -> bool) {
            loop {
                let cmd = self.rx.recv().await.expect("command channel open");
                let hit = matches!(&cmd, Command::Timer(event) if want(event));
                self.flow.handle(cmd).await;
                if hit {
                    return;
                }
            }
        }

        fn drain_events(&mut self) -> Vec<FlowEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        fn severity(&self) -> Severity {
            self.flow.snapshot().status.unwrap().severity
        }
    }

    fn is_start_liveness(event: &TimerEvent) -> bool {
        matches!(event, TimerEvent::StartLiveness { .. })
    }

    fn is_reset(event: &TimerEvent) -> bool {
        matches!(event, TimerEvent::Reset { .. })
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cycle_granted_then_reset() {
        let mut h = Harness::new(
            MockBehavior::default(),
            &[None, Some("BADGE123")],
            granted(),
            test_config(),
        );

        h.flow.handle(Command::StartScan).await;
        assert_eq!(h.flow.state(), FlowState::ScanningQr);
        assert_eq!(
            h.source.requests()[0].facing,
            Some(FacingMode::Environment)
        );

        h.run_until(is_start_liveness).await;
        assert_eq!(h.flow.state(), FlowState::ResultShown);
        assert_eq!(h.source.requests()[1].facing, Some(FacingMode::User));
        assert_eq!(h.source.peak_active(), 1);
        assert_eq!(h.source.active_streams(), 0);

        let calls = h.verifier.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].code, "BADGE123");
        assert!(matches!(calls[0].payload(), Some(Payload::Multi(f)) if f.len() == 6));

        let snap = h.flow.snapshot();
        assert_eq!(snap.validated_code.as_deref(), Some("BADGE123"));
        assert_eq!(snap.frames, 6);
        assert!(snap.latches.completed);
        assert_eq!(h.severity(), Severity::Success);
        assert!(h.drain_events().contains(&FlowEvent::Finished(
            VerificationResult::Granted {
                first_name: Some("Ada".into()),
                last_name: Some("Lovelace".into()),
                message: "Access granted".into(),
            }
        )));

        let shown_at = Instant::now();
        h.run_until(is_reset).await;
        let waited = shown_at.elapsed();
        assert!(waited >= Duration::from_millis(5000));
        assert!(waited < Duration::from_millis(5100));

        let snap = h.flow.snapshot();
        assert_eq!(snap.state, FlowState::Idle);
        assert_eq!(snap.validated_code, None);
        assert_eq!(snap.frames, 0);
        assert!(snap.latches.is_clear());
        assert_eq!(snap.last_code, None);
        assert!(!snap.camera_open);
        assert!(!snap.poll_active);
        assert!(h.drain_events().contains(&FlowEvent::ResetComplete));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspicious_is_warning_and_still_resets() {
        let mut h = Harness::new(
            MockBehavior::default(),
            &[],
            Reply::Json(serde_json::json!({
                "success": false,
                "result": "SUSPICIOUS",
                "message": "motion anomaly",
            })),
            test_config(),
        );

        h.flow.handle(Command::SubmitCode("BADGE123".into())).await;
        h.run_until(is_start_liveness).await;
        assert_eq!(h.flow.state(), FlowState::ResultShown);
        assert_eq!(h.severity(), Severity::Warning);

        let events = h.drain_events();
        assert!(events.contains(&FlowEvent::Finished(VerificationResult::Suspicious {
            message: "motion anomaly".into()
        })));
        assert!(!events
            .iter()
            .any(|e| matches!(e, FlowEvent::Status(s) if s.severity == Severity::Error)));

        h.run_until(is_reset).await;
        assert_eq!(h.flow.state(), FlowState::Idle);
        assert!(h.drain_events().contains(&FlowEvent::ResetComplete));
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_unavailable_starts_no_timers() {
        let mut h = Harness::new(
            MockBehavior {
                reject_all: true,
                ..MockBehavior::default()
            },
            &[Some("BADGE123")],
            granted(),
            test_config(),
        );

        h.flow.handle(Command::StartScan).await;
        let snap = h.flow.snapshot();
        assert_eq!(snap.state, FlowState::Idle);
        assert!(!snap.poll_active);
        assert!(!snap.camera_open);
        assert_eq!(h.severity(), Severity::Error);
        // Preferred facing, then no facing constraint.
        assert_eq!(h.source.requests().len(), 2);
        assert_eq!(h.source.requests()[1].facing, None);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.rx.try_recv().is_err());
        assert!(h.verifier.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_camera_is_used_when_facing_rejected() {
        let mut h = Harness::new(
            MockBehavior {
                reject_facing: true,
                ..MockBehavior::default()
            },
            &[Some("BADGE123")],
            granted(),
            test_config(),
        );

        h.flow.handle(Command::StartScan).await;
        assert_eq!(h.flow.state(), FlowState::ScanningQr);
        h.run_until(is_start_liveness).await;
        assert_eq!(h.verifier.calls().len(), 1);
        assert_eq!(h.source.peak_active(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_bursts_never_submit() {
        let mut h = Harness::new(
            MockBehavior {
                never_ready: true,
                ..MockBehavior::default()
            },
            &[],
            granted(),
            FlowConfig {
                burst_max_attempts: 2,
                ..test_config()
            },
        );

        h.flow.handle(Command::SubmitCode("BADGE123".into())).await;
        h.run_until(is_start_liveness).await;
        let snap = h.flow.snapshot();
        assert_eq!(snap.state, FlowState::LivenessCapture);
        assert!(snap.camera_open);
        assert!(snap.latches.is_clear());
        assert!(h.verifier.calls().is_empty());

        h.run_until(|e| matches!(e, TimerEvent::RetryBurst { .. }))
            .await;
        let snap = h.flow.snapshot();
        assert_eq!(snap.state, FlowState::ResultShown);
        assert!(!snap.camera_open);
        assert!(snap.latches.completed);
        assert_eq!(h.severity(), Severity::Error);

        h.run_until(is_reset).await;
        assert!(h.flow.snapshot().latches.is_clear());
        assert!(h.verifier.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_frame_uses_single_image_payload() {
        let mut config = test_config();
        config.burst.max_frames = 1;
        let mut h = Harness::new(MockBehavior::default(), &[], granted(), config);

        h.flow.handle(Command::SubmitCode("BADGE123".into())).await;
        h.run_until(is_start_liveness).await;
        let calls = h.verifier.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0].payload(), Some(Payload::Single(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_near_simultaneous_triggers_submit_once() {
        let mut h = Harness::new(MockBehavior::default(), &[], granted(), test_config());

        h.flow.handle(Command::SubmitCode("BADGE123".into())).await;
        h.flow.handle(Command::SubmitCode("OTHER".into())).await;
        h.flow.handle(Command::ManualInput("THIRD".into())).await;
        assert_eq!(
            h.flow.snapshot().validated_code.as_deref(),
            Some("BADGE123")
        );

        h.run_until(is_start_liveness).await;

        // Late duplicate callbacks for the live generation change nothing.
        let generation = h.flow.snapshot().generation;
        h.flow
            .handle(Command::Timer(TimerEvent::StartLiveness { generation }))
            .await;
        h.flow
            .handle(Command::Timer(TimerEvent::RetryBurst { generation }))
            .await;

        let calls = h.verifier.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].code, "BADGE123");
        assert_eq!(h.source.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_latches_and_resets() {
        let mut h = Harness::new(MockBehavior::default(), &[], Reply::Fail, test_config());

        h.flow.handle(Command::SubmitCode("BADGE123".into())).await;
        h.run_until(is_start_liveness).await;
        let snap = h.flow.snapshot();
        assert_eq!(snap.state, FlowState::ResultShown);
        assert!(snap.latches.completed);
        assert!(!snap.latches.in_progress);
        assert_eq!(h.severity(), Severity::Error);
        assert!(h
            .drain_events()
            .iter()
            .any(|e| matches!(e, FlowEvent::Finished(VerificationResult::TransportError { .. }))));

        h.run_until(is_reset).await;
        assert!(h.flow.snapshot().latches.is_clear());
    }

    #[tokio::test(start_paused = true)]
    async fn test_face_camera_failure_funnels_into_reset() {
        let mut h = Harness::new(
            MockBehavior {
                reject_all: true,
                ..MockBehavior::default()
            },
            &[],
            granted(),
            test_config(),
        );

        h.flow.handle(Command::SubmitCode("BADGE123".into())).await;
        h.run_until(is_start_liveness).await;
        let snap = h.flow.snapshot();
        assert_eq!(snap.state, FlowState::ResultShown);
        assert!(snap.latches.completed);
        assert_eq!(h.severity(), Severity::Error);

        h.run_until(is_reset).await;
        assert_eq!(h.flow.state(), FlowState::Idle);
        assert!(h.verifier.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_entry_is_debounced() {
        let mut h = Harness::new(MockBehavior::default(), &[], granted(), test_config());

        h.flow.handle(Command::ManualInput("BAD".into())).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        h.flow.handle(Command::ManualInput("BADGE123".into())).await;
        assert_eq!(h.flow.state(), FlowState::Idle);

        h.run_until(|e| matches!(e, TimerEvent::ManualSettle { value, .. } if value == "BAD"))
            .await;
        assert_eq!(h.flow.state(), FlowState::Idle);

        h.run_until(|e| matches!(e, TimerEvent::ManualSettle { .. }))
            .await;
        assert_eq!(h.flow.state(), FlowState::LivenessCapture);
        assert_eq!(
            h.flow.snapshot().validated_code.as_deref(),
            Some("BADGE123")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_reset_leaves_new_cycle_alone() {
        let mut h = Harness::new(MockBehavior::default(), &[], granted(), test_config());

        h.flow.handle(Command::SubmitCode("BADGE123".into())).await;
        h.run_until(is_start_liveness).await;
        let stale = h.flow.snapshot().generation;

        h.flow.teardown();
        h.flow.handle(Command::SubmitCode("NEXT".into())).await;
        h.flow
            .handle(Command::Timer(TimerEvent::Reset { generation: stale }))
            .await;

        let snap = h.flow.snapshot();
        assert_eq!(snap.state, FlowState::LivenessCapture);
        assert_eq!(snap.validated_code.as_deref(), Some("NEXT"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_releases_camera_and_timers() {
        let mut h = Harness::new(MockBehavior::default(), &[], granted(), test_config());

        h.flow.handle(Command::StartScan).await;
        assert!(h.flow.snapshot().poll_active);
        assert_eq!(h.source.active_streams(), 1);

        h.flow.teardown();
        h.flow.teardown();
        let snap = h.flow.snapshot();
        assert_eq!(snap.state, FlowState::Idle);
        assert!(!snap.poll_active);
        assert_eq!(h.source.active_streams(), 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_scan_returns_to_idle() {
        let mut h = Harness::new(MockBehavior::default(), &[], granted(), test_config());

        h.flow.handle(Command::StartScan).await;
        h.flow.handle(Command::StopScan).await;
        let snap = h.flow.snapshot();
        assert_eq!(snap.state, FlowState::Idle);
        assert!(!snap.camera_open);
        assert!(!snap.poll_active);

        h.flow.handle(Command::StartScan).await;
        assert_eq!(h.flow.state(), FlowState::ScanningQr);
        assert_eq!(h.source.peak_active(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_implausible_code_is_rejected() {
        let mut h = Harness::new(MockBehavior::default(), &[], granted(), test_config());

        h.flow.handle(Command::SubmitCode("   ".into())).await;
        assert_eq!(h.flow.state(), FlowState::Idle);
        assert_eq!(h.flow.snapshot().validated_code, None);
        assert_eq!(h.severity(), Severity::Warning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_flow_rescans_after_reset_and_shuts_down() {
        let (deps, source, verifier) = deps(MockBehavior::default(), &[Some("BADGE123")], granted());
        let (handle, task) = spawn_flow(FlowConfig::default(), deps);
        let mut events = handle.subscribe();

        handle.start_scan().await.unwrap();
        loop {
            if events.recv().await.unwrap() == FlowEvent::ResetComplete {
                break;
            }
        }

        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.state, FlowState::ScanningQr);
        assert_eq!(snap.validated_code, None);
        assert!(snap.latches.is_clear());
        assert_eq!(verifier.calls().len(), 1);
        assert_eq!(source.peak_active(), 1);

        handle.shutdown();
        task.await.unwrap();
        assert_eq!(source.active_streams(), 0);
        assert!(handle.start_scan().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_scan_interval_still_polls() {
        let mut h = Harness::new(
            MockBehavior::default(),
            &[Some("BADGE123")],
            granted(),
            FlowConfig {
                scan_interval: Duration::ZERO,
                ..test_config()
            },
        );

        h.flow.handle(Command::StartScan).await;
        assert_eq!(h.flow.state(), FlowState::ScanningQr);
        h.run_until(|e| matches!(e, TimerEvent::PollTick { .. }))
            .await;
        assert_eq!(h.flow.state(), FlowState::LivenessCapture);
        assert_eq!(
            h.flow.snapshot().validated_code.as_deref(),
            Some("BADGE123")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_every_handle_stops_the_controller() {
        let (deps, source, _) = deps(MockBehavior::default(), &[], granted());
        let (handle, task) = spawn_flow(FlowConfig::default(), deps);

        handle.start_scan().await.unwrap();
        let snap = handle.snapshot().await.unwrap();
        assert!(snap.camera_open);
        assert!(snap.poll_active);

        drop(handle);
        task.await.unwrap();
        assert_eq!(source.active_streams(), 0);
    }
}
