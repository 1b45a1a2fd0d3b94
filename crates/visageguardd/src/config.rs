use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use visageguard_core::{ConfigError, EyeRequirement, IdentityRule, PolicyConfig, SettingsError};

use crate::lock::DEFAULT_LOCK_COMMAND;

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bad settings file {path}: {source}")]
    Settings {
        path: PathBuf,
        #[source]
        source: SettingsError,
    },
    #[error("failed to write settings file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode settings: {0}")]
    Encode(#[source] SettingsError),
    #[error("invalid settings: {0}")]
    Invalid(#[from] ConfigError),
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Landmark feed written by the external landmark process.
    pub feed_path: PathBuf,
    /// Longest a feed read may block before the worker re-checks for stop.
    pub feed_poll_ms: u64,
    /// Evaluate every n-th frame (1 = every frame).
    pub frame_stride: u32,
    /// Command run to lock the session.
    pub lock_command: String,
    /// Log lock decisions without running the lock command.
    pub dry_run: bool,
    /// Start a detection session as soon as the daemon is ready.
    pub autostart: bool,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
    /// Optional TOML file holding the policy settings; also where updated
    /// settings are saved.
    pub settings_path: Option<PathBuf>,
    /// Policy tunables: settings file first, then `VISAGEGUARD_*` overrides.
    pub policy: PolicyConfig,
}

impl Config {
    /// Load configuration from `VISAGEGUARD_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigLoadError> {
        let runtime_dir = get("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
            .join("visageguard");

        let settings_path = get("VISAGEGUARD_SETTINGS").map(PathBuf::from);
        let mut policy = match &settings_path {
            Some(path) if path.exists() => load_settings(path)?,
            _ => PolicyConfig::default(),
        };
        apply_policy_overrides(&mut policy, &get);
        policy.validate()?;

        Ok(Self {
            feed_path: get("VISAGEGUARD_FEED")
                .map(PathBuf::from)
                .unwrap_or_else(|| runtime_dir.join("landmarks.fifo")),
            feed_poll_ms: parse_or(&get, "VISAGEGUARD_FEED_POLL_MS", 200).max(1),
            frame_stride: parse_or(&get, "VISAGEGUARD_FRAME_STRIDE", 1).max(1),
            lock_command: get("VISAGEGUARD_LOCK_COMMAND")
                .unwrap_or_else(|| DEFAULT_LOCK_COMMAND.to_string()),
            dry_run: flag(&get, "VISAGEGUARD_DRY_RUN", false),
            autostart: flag(&get, "VISAGEGUARD_AUTOSTART", false),
            system_bus: flag(&get, "VISAGEGUARD_SYSTEM_BUS", false),
            settings_path,
            policy,
        })
    }

    pub fn feed_poll_interval(&self) -> Duration {
        Duration::from_millis(self.feed_poll_ms)
    }
}

/// Read a [`PolicyConfig`] from a TOML file. Missing keys keep their defaults.
pub fn load_settings(path: &Path) -> Result<PolicyConfig, ConfigLoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    PolicyConfig::from_toml_str(&text).map_err(|source| ConfigLoadError::Settings {
        path: path.to_path_buf(),
        source,
    })
}

/// Write `policy` to `path` as TOML, replacing the file atomically.
pub fn save_settings(path: &Path, policy: &PolicyConfig) -> Result<(), ConfigLoadError> {
    let text = policy.to_toml_string().map_err(ConfigLoadError::Encode)?;
    let write_err = |source| ConfigLoadError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    let tmp = path.with_extension("toml.part");
    std::fs::write(&tmp, text).map_err(write_err)?;
    std::fs::rename(&tmp, path).map_err(write_err)?;
    Ok(())
}

fn apply_policy_overrides(policy: &mut PolicyConfig, get: &impl Fn(&str) -> Option<String>) {
    policy.ear_threshold = parse_or(get, "VISAGEGUARD_EAR_THRESHOLD", policy.ear_threshold);
    policy.consecutive_frames =
        parse_or(get, "VISAGEGUARD_CONSECUTIVE_FRAMES", policy.consecutive_frames);
    policy.max_face_absence = timeout_or(
        get,
        "VISAGEGUARD_MAX_FACE_ABSENCE_SECS",
        policy.max_face_absence,
    );
    policy.max_eyes_closed = timeout_or(
        get,
        "VISAGEGUARD_MAX_EYES_CLOSED_SECS",
        policy.max_eyes_closed,
    );
    policy.max_no_blink = timeout_or(get, "VISAGEGUARD_MAX_NO_BLINK_SECS", policy.max_no_blink);

    if get("VISAGEGUARD_SINGLE_EYE").is_some() {
        policy.eye_requirement = if flag(get, "VISAGEGUARD_SINGLE_EYE", false) {
            EyeRequirement::EitherEye
        } else {
            EyeRequirement::BothEyes
        };
    }

    if let Some(rule) = get("VISAGEGUARD_IDENTITY") {
        policy.identity = parse_identity_rule(&rule);
    }
}

/// `off` disables recognition, `any` accepts every enrolled identity,
/// anything else is a comma-separated allow-list.
fn parse_identity_rule(value: &str) -> IdentityRule {
    match value.trim() {
        "" | "off" => IdentityRule::Disabled,
        "any" => IdentityRule::AnyEnrolled,
        list => IdentityRule::Allowed(
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        ),
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match get(key) {
        Some(v) => v.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "ignoring unparsable setting");
            default
        }),
        None => default,
    }
}

fn timeout_or(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Option<Duration>,
) -> Option<Duration> {
    let Some(v) = get(key) else {
        return default;
    };
    if v.trim().eq_ignore_ascii_case("off") {
        return None;
    }
    match v.trim().parse::<f64>().map(Duration::try_from_secs_f64) {
        Ok(Ok(d)) => Some(d),
        _ => {
            tracing::warn!(key, value = %v, "ignoring unparsable timeout");
            default
        }
    }
}

fn flag(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    get(key)
        .map(|v| {
            !matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "" | "0" | "false" | "no" | "off"
            )
        })
        .unwrap_or(default)
}
