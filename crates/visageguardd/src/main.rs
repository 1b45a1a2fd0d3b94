use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod feed_source;
mod lock;
mod ports;
mod session;

use config::Config;
use dbus_interface::{AppState, GuardService, BUS_NAME, OBJECT_PATH};
use feed_source::{FeedDevice, FeedLandmarks, FeedRecognizer};
use lock::{CommandLockAction, LogOnlyLockAction};
use ports::{LockAction, Pipeline};
use session::Session;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("visageguardd starting");

    let config = Config::from_env().context("failed to load configuration")?;

    let lock_action: Arc<dyn LockAction> = if config.dry_run {
        tracing::warn!("dry run enabled: lock decisions will only be logged");
        Arc::new(LogOnlyLockAction)
    } else {
        Arc::new(
            CommandLockAction::from_command_line(&config.lock_command)
                .context("VISAGEGUARD_LOCK_COMMAND is empty")?,
        )
    };

    let device = FeedDevice::new(&config.feed_path, config.feed_poll_interval());
    let pipeline = Pipeline {
        landmarks: Box::new(FeedLandmarks),
        recognizer: Some(Box::new(FeedRecognizer)),
    };
    let session = Session::new(
        device,
        pipeline,
        lock_action,
        config.policy.clone(),
        config.frame_stride,
    );
    let snapshots = session.subscribe();
    let session = Arc::new(std::sync::Mutex::new(session));

    tracing::info!(
        feed = %config.feed_path.display(),
        system_bus = config.system_bus,
        "session controller ready"
    );

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let autostart = config.autostart;
    let service = GuardService {
        state: Arc::new(Mutex::new(AppState {
            config,
            session: Arc::clone(&session),
            snapshots: snapshots.clone(),
        })),
    };

    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;
    dbus_interface::forward_lock_signals(&conn, snapshots).await?;

    if autostart {
        match dbus_interface::with_session(Arc::clone(&session), |s| s.start()).await? {
            Ok(()) => tracing::info!("autostart: detection started"),
            Err(e) => tracing::error!(error = %e, "autostart failed"),
        }
    }

    tracing::info!("visageguardd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("visageguardd shutting down");

    let last = dbus_interface::with_session(session, |s| {
        s.stop();
        s.snapshot()
    })
    .await?;
    tracing::info!(
        frames_evaluated = last.frames_evaluated,
        last_lock = ?last.last_lock.map(|r| r.reason),
        "visageguardd stopped"
    );
    Ok(())
}
