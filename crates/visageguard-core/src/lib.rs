//! visageguard-core: presence and liveness decision engine.
//!
//! Consumes landmark coordinates and recognition verdicts produced by
//! external collaborators and decides, frame by frame, whether the session
//! should be locked. No image decoding or model inference happens here.

pub mod blink;
pub mod feed;
pub mod geometry;
pub mod policy;
pub mod types;

pub use blink::{BlinkDetector, BlinkSignal};
pub use geometry::{eye_aspect_ratio, EarReading, EyeRequirement, GeometryError};
pub use policy::{
    ConfigError, Evaluation, IdentityRule, Phase, PolicyConfig, PresencePolicy, SettingsError,
};
pub use types::{EyeLandmarks, FaceLandmarks, FrameSample, LockDecision, LockReason, Point};
