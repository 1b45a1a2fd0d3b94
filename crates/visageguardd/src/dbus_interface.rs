use std::sync::{Arc, PoisonError};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinError;
use visageguard_core::PolicyConfig;
use zbus::interface;
use zbus::object_server::SignalEmitter;

use crate::config::{self, Config};
use crate::feed_source::FeedDevice;
use crate::session::{Session, SessionError, SessionSnapshot};

pub const BUS_NAME: &str = "org.freedesktop.VisageGuard1";
pub const OBJECT_PATH: &str = "/org/freedesktop/VisageGuard1";

pub type SharedSession = Arc<std::sync::Mutex<Session<FeedDevice>>>;

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub session: SharedSession,
    /// Published session state; reading it never touches the worker.
    pub snapshots: watch::Receiver<SessionSnapshot>,
}

/// D-Bus control surface for the VisageGuard daemon.
///
/// Bus name: org.freedesktop.VisageGuard1
/// Object path: /org/freedesktop/VisageGuard1
pub struct GuardService {
    pub state: Arc<Mutex<AppState>>,
}

/// Run `f` against the session on the blocking pool.
///
/// `start` and `stop` may block for up to one feed poll interval.
pub async fn with_session<T, F>(session: SharedSession, f: F) -> Result<T, JoinError>
where
    T: Send + 'static,
    F: FnOnce(&mut Session<FeedDevice>) -> T + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut guard = session.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    })
    .await
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.freedesktop.VisageGuard1")]
impl GuardService {
    /// Start a detection session.
    async fn start(&self) -> zbus::fdo::Result<()> {
        tracing::info!("start requested");
        let session = self.state.lock().await.session.clone();

        with_session(session, |s| s.start())
            .await
            .map_err(failed)?
            .map_err(|e| {
                match &e {
                    SessionError::AlreadyRunning => tracing::debug!("start: already running"),
                    other => tracing::error!(error = %other, "start failed"),
                }
                failed(e)
            })
    }

    /// Stop the running session. Returns false if none was running.
    async fn stop(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop requested");
        let session = self.state.lock().await.session.clone();
        with_session(session, |s| s.stop()).await.map_err(failed)
    }

    /// Return daemon and session status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        let snapshot = state.snapshots.borrow().clone();

        let session = serde_json::to_value(&snapshot).map_err(failed)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "feed": state.config.feed_path.display().to_string(),
            "dry_run": state.config.dry_run,
            "session": session,
        })
        .to_string())
    }

    /// Return the policy settings used by the next session as JSON.
    async fn get_settings(&self) -> zbus::fdo::Result<String> {
        let session = self.state.lock().await.session.clone();
        let policy = with_session(session, |s| s.config().clone())
            .await
            .map_err(failed)?;
        serde_json::to_string(&policy).map_err(failed)
    }

    /// Replace the policy settings. Missing keys take their defaults.
    ///
    /// Applies to the next session; a running session keeps its settings.
    async fn set_settings(&self, settings: &str) -> zbus::fdo::Result<()> {
        let policy: PolicyConfig = serde_json::from_str(settings)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

        let (session, settings_path) = {
            let state = self.state.lock().await;
            (state.session.clone(), state.config.settings_path.clone())
        };

        let applied = policy.clone();
        with_session(session, move |s| s.update_config(applied))
            .await
            .map_err(failed)?
            .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

        if let Some(path) = &settings_path {
            config::save_settings(path, &policy).map_err(|e| {
                tracing::error!(error = %e, "settings: save failed");
                failed(e)
            })?;
            tracing::info!(path = %path.display(), "settings saved");
        }

        tracing::info!(
            ear_threshold = policy.ear_threshold,
            consecutive_frames = policy.consecutive_frames,
            max_face_absence = ?policy.max_face_absence,
            max_eyes_closed = ?policy.max_eyes_closed,
            max_no_blink = ?policy.max_no_blink,
            "settings updated"
        );
        Ok(())
    }

    /// Emitted once per lock decision, with the reason and a user-facing message.
    #[zbus(signal)]
    async fn lock_triggered(
        emitter: &SignalEmitter<'_>,
        reason: &str,
        message: &str,
    ) -> zbus::Result<()>;
}

/// Emit `LockTriggered` for every new lock report the session publishes.
pub async fn forward_lock_signals(
    conn: &zbus::Connection,
    mut snapshots: watch::Receiver<SessionSnapshot>,
) -> zbus::Result<()> {
    let iface = conn
        .object_server()
        .interface::<_, GuardService>(OBJECT_PATH)
        .await?;

    tokio::spawn(async move {
        let mut last_seen = snapshots.borrow().last_lock.as_ref().map(|r| r.at);
        while snapshots.changed().await.is_ok() {
            let report = snapshots.borrow_and_update().last_lock.clone();
            let Some(report) = report else {
                continue;
            };
            if last_seen == Some(report.at) {
                continue;
            }
            last_seen = Some(report.at);

            let reason = report.reason.to_string();
            if let Err(e) =
                GuardService::lock_triggered(iface.signal_emitter(), &reason, &report.message)
                    .await
            {
                tracing::warn!(error = %e, "failed to emit LockTriggered");
            }
        }
    });
    Ok(())
}
