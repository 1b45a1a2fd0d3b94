use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use visageguard_core::{
    ConfigError, FrameSample, LockDecision, LockReason, Phase, PolicyConfig, PresencePolicy,
};

use crate::ports::{CaptureDevice, CaptureError, FrameStream, LockAction, Pipeline};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("detection session is already running")]
    AlreadyRunning,
    #[error("cannot start detection: {0}")]
    CaptureUnavailable(#[source] CaptureError),
    #[error("invalid policy configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("a previous session worker panicked; restart the daemon")]
    WorkerLost,
    #[error("failed to spawn session worker: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Outcome of the single lock decision of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockReport {
    pub reason: LockReason,
    pub message: String,
    /// Milliseconds since the session started.
    pub session_ms: u64,
    pub at: DateTime<Utc>,
    /// Set when the lock action failed. Lock actions are never retried.
    pub lock_error: Option<String>,
}

/// Why the most recent session ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum SessionEnd {
    Stopped,
    Locked,
    CaptureFailed(String),
}

/// Immutable view of the running session, published once per frame.
///
/// Readers never touch the worker's live state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub running: bool,
    pub phase: Phase,
    pub face_detected: bool,
    pub blinking: bool,
    pub ear: Option<f32>,
    pub frames_read: u64,
    pub frames_evaluated: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_lock: Option<LockReport>,
    pub ended_by: Option<SessionEnd>,
}

struct Worker<F> {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Pipeline<F>>,
}

/// Owns the detection loop: at most one worker thread at a time.
///
/// The worker takes exclusive ownership of the analysis pipeline, the policy
/// state and the open capture stream. They are handed back (or dropped) when
/// the worker is joined, so nothing leaks from one session into the next.
pub struct Session<D: CaptureDevice> {
    device: D,
    pipeline: Option<Pipeline<D::Frame>>,
    lock_action: Arc<dyn LockAction>,
    config: PolicyConfig,
    frame_stride: u32,
    worker: Option<Worker<D::Frame>>,
    snapshot_tx: Arc<watch::Sender<SessionSnapshot>>,
}

impl<D: CaptureDevice> Session<D> {
    pub fn new(
        device: D,
        pipeline: Pipeline<D::Frame>,
        lock_action: Arc<dyn LockAction>,
        config: PolicyConfig,
        frame_stride: u32,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());
        Self {
            device,
            pipeline: Some(pipeline),
            lock_action,
            config,
            frame_stride: frame_stride.max(1),
            worker: None,
            snapshot_tx: Arc::new(snapshot_tx),
        }
    }

    /// Subscribe to snapshots published by the worker.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Replace the policy configuration. Takes effect on the next `start`.
    pub fn update_config(&mut self, config: PolicyConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Open the capture device and spawn the detection worker.
    pub fn start(&mut self) -> Result<(), SessionError> {
        self.reap_finished();
        if self.worker.is_some() {
            return Err(SessionError::AlreadyRunning);
        }
        self.config.validate()?;
        if self.pipeline.is_none() {
            return Err(SessionError::WorkerLost);
        }

        let stream = self.device.open().map_err(|e| {
            tracing::error!(device = %self.device.describe(), error = %e, "capture open failed");
            SessionError::CaptureUnavailable(e)
        })?;
        let pipeline = self.pipeline.take().ok_or(SessionError::WorkerLost)?;

        let stop = Arc::new(AtomicBool::new(false));
        let ctx = WorkerContext {
            config: self.config.clone(),
            frame_stride: self.frame_stride,
            stop: Arc::clone(&stop),
            lock_action: Arc::clone(&self.lock_action),
            snapshot_tx: Arc::clone(&self.snapshot_tx),
        };

        let previous_lock = self.snapshot_tx.borrow().last_lock.clone();
        self.snapshot_tx.send_replace(SessionSnapshot {
            running: true,
            started_at: Some(Utc::now()),
            last_lock: previous_lock,
            ..SessionSnapshot::default()
        });

        let handle = std::thread::Builder::new()
            .name("visageguard-session".into())
            .spawn(move || run_worker(stream, pipeline, ctx))
            .map_err(|e| {
                self.snapshot_tx.send_modify(|s| s.running = false);
                SessionError::Spawn(e)
            })?;

        tracing::info!(
            device = %self.device.describe(),
            ear_threshold = self.config.ear_threshold,
            consecutive_frames = self.config.consecutive_frames,
            frame_stride = self.frame_stride,
            "detection started"
        );
        self.worker = Some(Worker { stop, handle });
        Ok(())
    }

    /// Signal the worker to stop and wait for it to exit.
    ///
    /// No frame is evaluated once this returns. Returns whether a worker was
    /// still running; a session that already ended on its own reports false.
    pub fn stop(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            return false;
        };
        // The worker clears `running` as its last act before exiting.
        let was_running = self.snapshot_tx.borrow().running;
        worker.stop.store(true, Ordering::Release);
        self.join(worker);
        was_running
    }

    fn reap_finished(&mut self) {
        if self.worker.as_ref().is_some_and(|w| w.handle.is_finished()) {
            if let Some(worker) = self.worker.take() {
                self.join(worker);
            }
        }
    }

    fn join(&mut self, worker: Worker<D::Frame>) {
        match worker.handle.join() {
            Ok(pipeline) => self.pipeline = Some(pipeline),
            Err(_) => {
                tracing::error!("session worker panicked");
                self.snapshot_tx.send_modify(|s| s.running = false);
            }
        }
        tracing::info!("detection stopped");
    }
}

impl<D: CaptureDevice> Drop for Session<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WorkerContext {
    config: PolicyConfig,
    frame_stride: u32,
    stop: Arc<AtomicBool>,
    lock_action: Arc<dyn LockAction>,
    snapshot_tx: Arc<watch::Sender<SessionSnapshot>>,
}

impl WorkerContext {
    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Detection loop. Returns the pipeline so the next session can reuse it.
fn run_worker<S: FrameStream>(
    mut stream: S,
    mut pipeline: Pipeline<S::Frame>,
    ctx: WorkerContext,
) -> Pipeline<S::Frame> {
    tracing::info!("session worker started");
    let started = Instant::now();
    let mut policy = PresencePolicy::new(ctx.config.clone(), Duration::ZERO);
    let mut frames_read = 0u64;
    let mut frames_evaluated = 0u64;

    let ended = loop {
        if ctx.stop_requested() {
            break SessionEnd::Stopped;
        }

        let frame = match stream.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "capture failed; ending session without lock");
                break SessionEnd::CaptureFailed(e.to_string());
            }
        };
        // Re-check so a frame that arrived during a stop request is dropped.
        if ctx.stop_requested() {
            break SessionEnd::Stopped;
        }

        frames_read += 1;
        if (frames_read - 1) % u64::from(ctx.frame_stride) != 0 {
            continue;
        }

        let sample = build_sample(&mut pipeline, &frame, started.elapsed(), &policy);
        let eval = policy.evaluate(&sample);
        frames_evaluated += 1;

        ctx.snapshot_tx.send_modify(|s| {
            s.phase = eval.phase;
            s.face_detected = sample.face_present;
            s.blinking = eval.blink.is_some_and(|b| b.is_blinking);
            s.ear = eval.ear;
            s.frames_read = frames_read;
            s.frames_evaluated = frames_evaluated;
        });

        if let Some(decision) = eval.decision {
            let report = perform_lock(ctx.lock_action.as_ref(), decision);
            ctx.snapshot_tx.send_modify(|s| s.last_lock = Some(report));
            break SessionEnd::Locked;
        }
    };

    tracing::info!(
        frames_read,
        frames_evaluated,
        ended = ?ended,
        "session worker exiting"
    );
    ctx.snapshot_tx.send_modify(|s| {
        s.running = false;
        s.frames_read = frames_read;
        s.frames_evaluated = frames_evaluated;
        s.ended_by = Some(ended);
    });
    pipeline
}

fn build_sample<F>(
    pipeline: &mut Pipeline<F>,
    frame: &F,
    now: Duration,
    policy: &PresencePolicy,
) -> FrameSample {
    let faces = pipeline.landmarks.detect(frame);
    let Some(face) = faces.first() else {
        return FrameSample::absent(now);
    };

    let identity = if policy.config().identity.is_enabled() {
        pipeline
            .recognizer
            .as_mut()
            .and_then(|r| r.recognize(frame, 0))
    } else {
        None
    };
    FrameSample::with_face(now, *face, identity)
}

/// Invoke the lock collaborator once. Failures are logged and reported, not retried.
fn perform_lock(action: &dyn LockAction, decision: LockDecision) -> LockReport {
    let lock_error = match action.lock() {
        Ok(()) => {
            tracing::info!(reason = %decision.reason, "{}", decision.reason.describe());
            None
        }
        Err(e) => {
            tracing::error!(reason = %decision.reason, error = %e, "lock action failed");
            Some(e.to_string())
        }
    };

    LockReport {
        reason: decision.reason,
        message: decision.reason.describe().to_string(),
        session_ms: decision.triggered_at.as_millis() as u64,
        at: Utc::now(),
        lock_error,
    }
}
