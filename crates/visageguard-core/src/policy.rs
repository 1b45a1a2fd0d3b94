//! Presence and liveness policy.
//!
//! Fuses the per-frame face, identity and eye signals into at most one
//! [`LockDecision`] per session. Rules are evaluated in a fixed order and
//! the first one to fire ends evaluation for the session:
//!
//! 1. face presence: no face for longer than `max_face_absence`
//! 2. identity: a face that is not an accepted enrolled identity (no grace period)
//! 3. eyes: closed continuously for longer than `max_eyes_closed`, or open
//!    without a single registered blink for longer than `max_no_blink`
//!
//! Every timeout is optional; `None` disables that rule.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blink::{BlinkDetector, BlinkSignal};
use crate::geometry::{average_ear, EarReading, EyeRequirement};
use crate::types::{FrameSample, LockDecision, LockReason};

pub const DEFAULT_EAR_THRESHOLD: f32 = 0.25;
pub const DEFAULT_CONSECUTIVE_FRAMES: u32 = 3;
pub const DEFAULT_MAX_FACE_ABSENCE: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_EYES_CLOSED: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_NO_BLINK: Duration = Duration::from_secs(10);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("EAR threshold must be a positive finite number, got {0}")]
    InvalidThreshold(f32),
    #[error("consecutive frame requirement must be at least 1")]
    ZeroFrames,
    #[error("timeout for {0} must be greater than zero (use \"off\" to disable it)")]
    ZeroTimeout(&'static str),
    #[error("identity allow-list is empty")]
    EmptyAllowList,
}

/// Failure to read or write policy settings as TOML.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("malformed settings: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to encode settings: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("invalid settings: {0}")]
    Invalid(#[from] ConfigError),
}

/// Which recognized identities keep the session unlocked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityRule {
    /// Recognition is not consulted.
    #[default]
    Disabled,
    /// Any enrolled identity is accepted.
    AnyEnrolled,
    /// Only the listed identity labels are accepted.
    Allowed(Vec<String>),
}

impl IdentityRule {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, IdentityRule::Disabled)
    }

    pub fn accepts(&self, identity: Option<&str>) -> bool {
        match self {
            IdentityRule::Disabled => true,
            IdentityRule::AnyEnrolled => identity.is_some(),
            IdentityRule::Allowed(labels) => {
                identity.is_some_and(|id| labels.iter().any(|l| l == id))
            }
        }
    }
}

/// Tunables for one detection session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Averaged EAR below this value counts as eyes closed.
    pub ear_threshold: f32,
    /// Consecutive low-EAR frames needed to register a blink.
    pub consecutive_frames: u32,
    /// Longest tolerated stretch without a detected face.
    #[serde(with = "timeout_secs")]
    pub max_face_absence: Option<Duration>,
    /// Longest tolerated continuous eye closure.
    #[serde(with = "timeout_secs")]
    pub max_eyes_closed: Option<Duration>,
    /// Longest tolerated stretch of open eyes without a blink.
    #[serde(with = "timeout_secs")]
    pub max_no_blink: Option<Duration>,
    pub eye_requirement: EyeRequirement,
    pub identity: IdentityRule,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            ear_threshold: DEFAULT_EAR_THRESHOLD,
            consecutive_frames: DEFAULT_CONSECUTIVE_FRAMES,
            max_face_absence: Some(DEFAULT_MAX_FACE_ABSENCE),
            max_eyes_closed: Some(DEFAULT_MAX_EYES_CLOSED),
            max_no_blink: Some(DEFAULT_MAX_NO_BLINK),
            eye_requirement: EyeRequirement::default(),
            identity: IdentityRule::default(),
        }
    }
}

impl PolicyConfig {
    /// Parse and validate a settings file. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, SettingsError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.ear_threshold.is_finite() && self.ear_threshold > 0.0) {
            return Err(ConfigError::InvalidThreshold(self.ear_threshold));
        }
        if self.consecutive_frames == 0 {
            return Err(ConfigError::ZeroFrames);
        }
        for (name, timeout) in [
            ("max_face_absence", self.max_face_absence),
            ("max_eyes_closed", self.max_eyes_closed),
            ("max_no_blink", self.max_no_blink),
        ] {
            if timeout == Some(Duration::ZERO) {
                return Err(ConfigError::ZeroTimeout(name));
            }
        }
        if matches!(&self.identity, IdentityRule::Allowed(labels) if labels.is_empty()) {
            return Err(ConfigError::EmptyAllowList);
        }
        Ok(())
    }
}

/// Timeouts on the wire: seconds as a number, or `"off"` for a disabled rule.
mod timeout_secs {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    const OFF: &str = "off";

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Secs(f64),
        Keyword(String),
    }

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => Repr::Secs(d.as_secs_f64()),
            None => Repr::Keyword(OFF.to_string()),
        }
        .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        match Repr::deserialize(d)? {
            Repr::Secs(secs) => Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(|e| D::Error::custom(format!("invalid timeout {secs}: {e}"))),
            Repr::Keyword(k) if k.eq_ignore_ascii_case(OFF) => Ok(None),
            Repr::Keyword(k) => Err(D::Error::custom(format!(
                "invalid timeout {k:?} (expected seconds or \"off\")"
            ))),
        }
    }
}

/// Coarse view of where the session stands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No frame evaluated yet.
    #[default]
    Idle,
    FaceAbsent,
    FacePresentWatching,
    /// A lock decision was raised; the policy ignores further frames.
    Locking,
}

/// Result of evaluating one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Evaluation {
    pub phase: Phase,
    /// Averaged EAR, when the frame carried a usable eye signal.
    pub ear: Option<f32>,
    pub blink: Option<BlinkSignal>,
    /// Present exactly once per session, on the frame that fired a rule.
    pub decision: Option<LockDecision>,
}

/// Timer watermarks, relative to the session clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub last_face_seen: Duration,
    pub last_blink: Duration,
    pub last_eyes_open: Duration,
    pub last_identity_confirmed: Option<Duration>,
}

/// Per-session state machine. Owned by exactly one worker.
#[derive(Debug, Clone)]
pub struct PresencePolicy {
    config: PolicyConfig,
    blink: BlinkDetector,
    clock: Duration,
    marks: Watermarks,
    /// Start of the current uninterrupted run of closed-eye frames.
    closed_since: Option<Duration>,
    /// Last open-eye frame, while no gap has followed it.
    open_anchor: Option<Duration>,
    phase: Phase,
    decision: Option<LockDecision>,
}

impl PresencePolicy {
    /// Start a fresh session whose watermarks all begin at `start`.
    pub fn new(config: PolicyConfig, start: Duration) -> Self {
        Self {
            config,
            blink: BlinkDetector::new(),
            clock: start,
            marks: Watermarks {
                last_face_seen: start,
                last_blink: start,
                last_eyes_open: start,
                last_identity_confirmed: None,
            },
            closed_since: None,
            open_anchor: Some(start),
            phase: Phase::Idle,
            decision: None,
        }
    }

    /// Discard all session state, keeping the configuration.
    pub fn reset(&mut self, start: Duration) {
        *self = Self::new(self.config.clone(), start);
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn decision(&self) -> Option<LockDecision> {
        self.decision
    }

    pub fn watermarks(&self) -> Watermarks {
        self.marks
    }

    pub fn is_blinking(&self) -> bool {
        self.blink.is_blinking()
    }

    /// Evaluate one frame. Frames must be fed in arrival order.
    pub fn evaluate(&mut self, sample: &FrameSample) -> Evaluation {
        if self.decision.is_some() {
            return Evaluation {
                phase: Phase::Locking,
                ..Evaluation::default()
            };
        }

        // Watermarks never rewind, even if a collaborator hands us a stale stamp.
        let now = sample.timestamp.max(self.clock);
        self.clock = now;

        if !sample.face_present {
            self.phase = Phase::FaceAbsent;
            self.blink.reset();
            self.break_eye_run();
            if let Some(limit) = self.config.max_face_absence {
                if now.saturating_sub(self.marks.last_face_seen) > limit {
                    return self.lock(LockReason::NoFacePresence, now, None, None);
                }
            }
            return self.evaluation(None, None);
        }

        self.phase = Phase::FacePresentWatching;
        self.marks.last_face_seen = now;

        if self.config.identity.is_enabled() {
            if !self.config.identity.accepts(sample.identity.as_deref()) {
                tracing::debug!(identity = ?sample.identity, "face is not an accepted identity");
                return self.lock(LockReason::UnrecognizedIdentity, now, None, None);
            }
            self.marks.last_identity_confirmed = Some(now);
        }

        let reading = average_ear(
            sample.left_eye.as_ref(),
            sample.right_eye.as_ref(),
            self.config.eye_requirement,
        );
        let ear = match reading {
            EarReading::Unusable => {
                self.break_eye_run();
                return self.evaluation(None, None);
            }
            EarReading::Both(v) | EarReading::Single(v) => v,
        };

        let threshold = self.config.ear_threshold;
        let signal = self
            .blink
            .observe(ear, now, threshold, self.config.consecutive_frames);
        if signal.just_closed {
            self.marks.last_blink = now;
        }

        if ear >= threshold {
            self.marks.last_eyes_open = now;
            self.closed_since = None;
            self.open_anchor = Some(now);
            if let Some(limit) = self.config.max_no_blink {
                if now.saturating_sub(self.marks.last_blink) > limit {
                    return self.lock(LockReason::NoBlinkActivity, now, Some(ear), Some(signal));
                }
            }
        } else {
            // A closure that directly follows an open frame counts from that frame.
            let anchor = self.open_anchor.take();
            let closed_since = *self.closed_since.get_or_insert(anchor.unwrap_or(now));
            if let Some(limit) = self.config.max_eyes_closed {
                if now.saturating_sub(closed_since) > limit {
                    return self.lock(LockReason::NoBlinkActivity, now, Some(ear), Some(signal));
                }
            }
        }

        self.evaluation(Some(ear), Some(signal))
    }

    /// The eye signal was interrupted; a later closure starts a new run.
    fn break_eye_run(&mut self) {
        self.closed_since = None;
        self.open_anchor = None;
    }

    fn evaluation(&self, ear: Option<f32>, blink: Option<BlinkSignal>) -> Evaluation {
        Evaluation {
            phase: self.phase,
            ear,
            blink,
            decision: None,
        }
    }

    fn lock(
        &mut self,
        reason: LockReason,
        now: Duration,
        ear: Option<f32>,
        blink: Option<BlinkSignal>,
    ) -> Evaluation {
        let decision = LockDecision {
            reason,
            triggered_at: now,
        };
        tracing::info!(
            reason = %reason,
            at_ms = now.as_millis() as u64,
            since_face_ms = now.saturating_sub(self.marks.last_face_seen).as_millis() as u64,
            since_blink_ms = now.saturating_sub(self.marks.last_blink).as_millis() as u64,
            "lock requested"
        );
        self.phase = Phase::Locking;
        self.decision = Some(decision);
        Evaluation {
            phase: Phase::Locking,
            ear,
            blink,
            decision: Some(decision),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EyeLandmarks, Point};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    /// Eye whose aspect ratio is exactly `ear` (width 30).
    fn eye_with_ear(ear: f32) -> EyeLandmarks {
        let h = ear * 30.0;
        EyeLandmarks::new([
            Point::new(0.0, 0.0),
            Point::new(10.0, -h / 2.0),
            Point::new(20.0, -h / 2.0),
            Point::new(30.0, 0.0),
            Point::new(20.0, h / 2.0),
            Point::new(10.0, h / 2.0),
        ])
    }

    fn face(t: u64, ear: f32) -> FrameSample {
        FrameSample {
            timestamp: ms(t),
            face_present: true,
            left_eye: Some(eye_with_ear(ear)),
            right_eye: Some(eye_with_ear(ear)),
            identity: None,
        }
    }

    fn named(t: u64, ear: f32, who: Option<&str>) -> FrameSample {
        FrameSample {
            identity: who.map(str::to_string),
            ..face(t, ear)
        }
    }

    /// Open eyes with a three-frame blink every 2 s.
    fn healthy(t: u64) -> FrameSample {
        let in_cycle = t % 2000;
        let ear = if (1000..1300).contains(&in_cycle) { 0.1 } else { 0.3 };
        face(t, ear)
    }

    fn decisions(policy: &mut PresencePolicy, frames: &[FrameSample]) -> Vec<LockDecision> {
        frames
            .iter()
            .filter_map(|f| policy.evaluate(f).decision)
            .collect()
    }

    #[test]
    fn test_defaults_match_reference() {
        let c = PolicyConfig::default();
        assert_eq!(c.ear_threshold, 0.25);
        assert_eq!(c.consecutive_frames, 3);
        assert_eq!(c.max_face_absence, Some(ms(5000)));
        assert_eq!(c.max_eyes_closed, Some(ms(5000)));
        assert_eq!(c.max_no_blink, Some(ms(10_000)));
        assert_eq!(c.eye_requirement, EyeRequirement::BothEyes);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad_threshold = PolicyConfig {
            ear_threshold: f32::NAN,
            ..PolicyConfig::default()
        };
        assert!(matches!(
            bad_threshold.validate(),
            Err(ConfigError::InvalidThreshold(_))
        ));

        let zero_frames = PolicyConfig {
            consecutive_frames: 0,
            ..PolicyConfig::default()
        };
        assert_eq!(zero_frames.validate(), Err(ConfigError::ZeroFrames));

        let zero_timeout = PolicyConfig {
            max_no_blink: Some(Duration::ZERO),
            ..PolicyConfig::default()
        };
        assert_eq!(
            zero_timeout.validate(),
            Err(ConfigError::ZeroTimeout("max_no_blink"))
        );

        let empty = PolicyConfig {
            identity: IdentityRule::Allowed(vec![]),
            ..PolicyConfig::default()
        };
        assert_eq!(empty.validate(), Err(ConfigError::EmptyAllowList));
    }

    #[test]
    fn test_face_absence_locks_once_after_limit() {
        let mut policy = PresencePolicy::new(PolicyConfig::default(), Duration::ZERO);
        let frames: Vec<_> = (0..=60).map(|i| FrameSample::absent(ms(i * 100))).collect();

        let mut fired = Vec::new();
        for f in &frames {
            if let Some(d) = policy.evaluate(f).decision {
                fired.push(d);
            }
        }
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].reason, LockReason::NoFacePresence);
        assert!(fired[0].triggered_at > ms(5000));
        assert_eq!(policy.phase(), Phase::Locking);
    }

    #[test]
    fn test_face_absence_exactly_at_limit_does_not_lock() {
        let mut policy = PresencePolicy::new(PolicyConfig::default(), Duration::ZERO);
        let eval = policy.evaluate(&FrameSample::absent(ms(5000)));
        assert_eq!(eval.decision, None);
        assert_eq!(eval.phase, Phase::FaceAbsent);
    }

    #[test]
    fn test_face_returning_resets_absence_timer() {
        let mut policy = PresencePolicy::new(PolicyConfig::default(), Duration::ZERO);
        let mut frames = Vec::new();
        frames.extend((0..40).map(|i| FrameSample::absent(ms(i * 100))));
        frames.push(healthy(4000));
        frames.extend((41..80).map(|i| FrameSample::absent(ms(i * 100))));
        assert!(decisions(&mut policy, &frames).is_empty());
    }

    #[test]
    fn test_disabled_face_rule_never_fires() {
        let config = PolicyConfig {
            max_face_absence: None,
            ..PolicyConfig::default()
        };
        let mut policy = PresencePolicy::new(config, Duration::ZERO);
        let frames: Vec<_> = (0..600).map(|i| FrameSample::absent(ms(i * 100))).collect();
        assert!(decisions(&mut policy, &frames).is_empty());
    }

    #[test]
    fn test_unrecognized_identity_locks_immediately() {
        let config = PolicyConfig {
            identity: IdentityRule::AnyEnrolled,
            ..PolicyConfig::default()
        };
        let mut policy = PresencePolicy::new(config, Duration::ZERO);
        assert_eq!(policy.evaluate(&named(0, 0.3, Some("alice"))).decision, None);
        assert_eq!(policy.evaluate(&named(100, 0.3, Some("alice"))).decision, None);

        let eval = policy.evaluate(&named(200, 0.3, None));
        let decision = eval.decision.expect("lock on first unmatched face");
        assert_eq!(decision.reason, LockReason::UnrecognizedIdentity);
        assert_eq!(decision.triggered_at, ms(200));
    }

    #[test]
    fn test_allow_list_rejects_other_enrolled_identity() {
        let config = PolicyConfig {
            identity: IdentityRule::Allowed(vec!["alice".into()]),
            ..PolicyConfig::default()
        };
        let mut policy = PresencePolicy::new(config, Duration::ZERO);
        assert_eq!(policy.evaluate(&named(0, 0.3, Some("alice"))).decision, None);
        assert_eq!(
            policy.watermarks().last_identity_confirmed,
            Some(Duration::ZERO)
        );
        let decision = policy.evaluate(&named(100, 0.3, Some("bob"))).decision;
        assert_eq!(
            decision.map(|d| d.reason),
            Some(LockReason::UnrecognizedIdentity)
        );
    }

    #[test]
    fn test_identity_ignored_when_disabled() {
        let mut policy = PresencePolicy::new(PolicyConfig::default(), Duration::ZERO);
        let eval = policy.evaluate(&named(0, 0.3, None));
        assert_eq!(eval.decision, None);
        assert_eq!(policy.watermarks().last_identity_confirmed, None);
    }

    #[test]
    fn test_face_absence_checked_before_identity() {
        let config = PolicyConfig {
            identity: IdentityRule::AnyEnrolled,
            ..PolicyConfig::default()
        };
        let mut policy = PresencePolicy::new(config, Duration::ZERO);
        // Absent frames carry no identity and must not trip the identity rule.
        let eval = policy.evaluate(&FrameSample::absent(ms(100)));
        assert_eq!(eval.decision, None);
    }

    #[test]
    fn test_blinking_person_never_locks() {
        let mut policy = PresencePolicy::new(PolicyConfig::default(), Duration::ZERO);
        let frames: Vec<_> = (0..600).map(|i| healthy(i * 100)).collect();
        assert!(decisions(&mut policy, &frames).is_empty());
        assert!(policy.watermarks().last_blink > ms(50_000));
    }

    #[test]
    fn test_static_open_eyes_lock_after_no_blink_limit() {
        let mut policy = PresencePolicy::new(PolicyConfig::default(), Duration::ZERO);
        let frames: Vec<_> = (0..=120).map(|i| face(i * 100, 0.3)).collect();
        let fired = decisions(&mut policy, &frames);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].reason, LockReason::NoBlinkActivity);
        assert_eq!(fired[0].triggered_at, ms(10_100));
    }

    #[test]
    fn test_long_eye_closure_locks() {
        let mut policy = PresencePolicy::new(PolicyConfig::default(), Duration::ZERO);
        let mut frames = vec![face(0, 0.3)];
        frames.extend((1..=60).map(|i| face(i * 100, 0.1)));
        let fired = decisions(&mut policy, &frames);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].reason, LockReason::NoBlinkActivity);
        // Last open measurement at t=0; the first frame strictly past 5 s fires.
        assert_eq!(fired[0].triggered_at, ms(5100));
    }

    #[test]
    fn test_closed_eyes_after_looking_away_start_a_new_run() {
        let mut policy = PresencePolicy::new(PolicyConfig::default(), Duration::ZERO);
        let mut frames: Vec<_> = (0..30).map(|i| healthy(i * 100)).collect();
        frames.extend((30..80).map(|i| FrameSample::absent(ms(i * 100))));
        frames.push(face(8000, 0.2));
        assert!(decisions(&mut policy, &frames).is_empty());

        // The run started at 8 s, so it only fires once it exceeds 5 s.
        let late: Vec<_> = (81..=131).map(|i| face(i * 100, 0.2)).collect();
        let fired = decisions(&mut policy, &late);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].reason, LockReason::NoBlinkActivity);
        assert_eq!(fired[0].triggered_at, ms(13_100));
    }

    #[test]
    fn test_unusable_frame_interrupts_closure_run() {
        let mut policy = PresencePolicy::new(PolicyConfig::default(), Duration::ZERO);
        let mut frames = vec![face(0, 0.3)];
        frames.extend((1..=40).map(|i| face(i * 100, 0.1)));
        frames.push(FrameSample {
            left_eye: None,
            ..face(4100, 0.1)
        });
        frames.extend((42..=95).map(|i| face(i * 100, 0.1)));
        let fired = decisions(&mut policy, &frames);
        assert_eq!(fired.len(), 1);
        // New run from 4200 ms.
        assert_eq!(fired[0].triggered_at, ms(9300));
    }

    #[test]
    fn test_closure_rule_disabled() {
        let config = PolicyConfig {
            max_eyes_closed: None,
            ..PolicyConfig::default()
        };
        let mut policy = PresencePolicy::new(config, Duration::ZERO);
        let frames: Vec<_> = (0..200).map(|i| face(i * 100, 0.1)).collect();
        assert!(decisions(&mut policy, &frames).is_empty());
    }

    #[test]
    fn test_single_eye_frames_are_ignored_by_default() {
        let mut policy = PresencePolicy::new(PolicyConfig::default(), Duration::ZERO);
        let frames: Vec<_> = (0..=150)
            .map(|i| FrameSample {
                right_eye: None,
                ..face(i * 100, 0.3)
            })
            .collect();
        let mut last = Evaluation::default();
        for f in &frames {
            last = policy.evaluate(f);
            assert_eq!(last.decision, None);
        }
        assert_eq!(last.ear, None);
        assert_eq!(last.phase, Phase::FacePresentWatching);
    }

    #[test]
    fn test_single_eye_frames_count_when_allowed() {
        let config = PolicyConfig {
            eye_requirement: EyeRequirement::EitherEye,
            ..PolicyConfig::default()
        };
        let mut policy = PresencePolicy::new(config, Duration::ZERO);
        let frames: Vec<_> = (0..=120)
            .map(|i| FrameSample {
                right_eye: None,
                ..face(i * 100, 0.3)
            })
            .collect();
        let fired = decisions(&mut policy, &frames);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].reason, LockReason::NoBlinkActivity);
    }

    #[test]
    fn test_degenerate_frame_skipped_without_nan() {
        let mut policy = PresencePolicy::new(PolicyConfig::default(), Duration::ZERO);
        let flat = EyeLandmarks::new([Point::new(1.0, 1.0); 6]);
        let eval = policy.evaluate(&FrameSample {
            timestamp: ms(100),
            face_present: true,
            left_eye: Some(flat),
            right_eye: Some(flat),
            identity: None,
        });
        assert_eq!(eval.ear, None);
        assert_eq!(eval.blink, None);
        assert_eq!(policy.watermarks().last_face_seen, ms(100));
    }

    #[test]
    fn test_face_absence_resets_blink_counter() {
        let mut policy = PresencePolicy::new(PolicyConfig::default(), Duration::ZERO);
        policy.evaluate(&face(0, 0.1));
        policy.evaluate(&face(100, 0.1));
        policy.evaluate(&FrameSample::absent(ms(200)));
        let eval = policy.evaluate(&face(300, 0.1));
        assert_eq!(eval.blink.map(|b| b.is_blinking), Some(false));
    }

    #[test]
    fn test_face_absence_keeps_blink_watermark() {
        let mut policy = PresencePolicy::new(PolicyConfig::default(), Duration::ZERO);
        let mut frames: Vec<_> = (0..60).map(|i| face(i * 100, 0.3)).collect();
        frames.extend((60..100).map(|i| FrameSample::absent(ms(i * 100))));
        frames.extend((100..105).map(|i| face(i * 100, 0.3)));
        let fired = decisions(&mut policy, &frames);
        // Looking away does not restart the no-blink timer.
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].reason, LockReason::NoBlinkActivity);
        assert_eq!(fired[0].triggered_at, ms(10_000 + 100));
    }

    #[test]
    fn test_frames_after_lock_are_ignored() {
        let mut policy = PresencePolicy::new(PolicyConfig::default(), Duration::ZERO);
        let fired = policy.evaluate(&FrameSample::absent(ms(6000)));
        assert!(fired.decision.is_some());
        for t in [6100, 7000, 20_000] {
            let eval = policy.evaluate(&FrameSample::absent(ms(t)));
            assert_eq!(eval.decision, None);
            assert_eq!(eval.phase, Phase::Locking);
        }
    }

    #[test]
    fn test_stale_timestamps_do_not_rewind() {
        let mut policy = PresencePolicy::new(PolicyConfig::default(), Duration::ZERO);
        policy.evaluate(&face(3000, 0.3));
        policy.evaluate(&face(1000, 0.3));
        assert_eq!(policy.watermarks().last_face_seen, ms(3000));
    }

    #[test]
    fn test_reset_discards_previous_session() {
        let mut policy = PresencePolicy::new(PolicyConfig::default(), Duration::ZERO);
        assert!(policy
            .evaluate(&FrameSample::absent(ms(6000)))
            .decision
            .is_some());

        policy.reset(ms(60_000));
        assert_eq!(policy.phase(), Phase::Idle);
        assert_eq!(policy.decision(), None);
        let eval = policy.evaluate(&FrameSample::absent(ms(60_100)));
        assert_eq!(eval.decision, None);
        assert_eq!(policy.watermarks().last_face_seen, ms(60_000));
    }

    #[test]
    fn test_settings_text_is_validated() {
        let config = PolicyConfig::from_toml_str("max_eyes_closed = 3\n").unwrap();
        assert_eq!(config.max_eyes_closed, Some(Duration::from_secs(3)));
        assert_eq!(config.ear_threshold, DEFAULT_EAR_THRESHOLD);

        assert!(matches!(
            PolicyConfig::from_toml_str("max_no_blink = 0\n"),
            Err(SettingsError::Invalid(ConfigError::ZeroTimeout("max_no_blink")))
        ));
        assert!(matches!(
            PolicyConfig::from_toml_str("ear_threshold = \"high\"\n"),
            Err(SettingsError::Parse(_))
        ));
    }

    #[test]
    fn test_settings_text_roundtrip() {
        let config = PolicyConfig {
            max_face_absence: None,
            identity: IdentityRule::Allowed(vec!["alice".into()]),
            ..PolicyConfig::default()
        };
        let text = config.to_toml_string().unwrap();
        assert_eq!(PolicyConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_config_toml_roundtrip_with_disabled_rule() {
        let parsed: PolicyConfig = toml::from_str(
            r#"
            ear_threshold = 0.22
            max_face_absence = 3
            max_no_blink = "off"
            identity = { allowed = ["alice", "bob"] }
            "#,
        )
        .unwrap();
        assert!((parsed.ear_threshold - 0.22).abs() < 1e-6);
        assert_eq!(parsed.max_face_absence, Some(ms(3000)));
        assert_eq!(parsed.max_no_blink, None);
        assert_eq!(parsed.max_eyes_closed, Some(DEFAULT_MAX_EYES_CLOSED));
        assert_eq!(parsed.consecutive_frames, DEFAULT_CONSECUTIVE_FRAMES);
        assert!(parsed.identity.accepts(Some("bob")));
        assert!(!parsed.identity.accepts(Some("carol")));
    }

    #[test]
    fn test_config_rejects_negative_timeout() {
        let parsed: Result<PolicyConfig, _> = serde_json::from_str(r#"{"max_no_blink": -1}"#);
        assert!(parsed.is_err());
        let parsed: Result<PolicyConfig, _> = serde_json::from_str(r#"{"max_no_blink": "soon"}"#);
        assert!(parsed.is_err());
    }
}
