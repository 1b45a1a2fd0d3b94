//! Eye aspect ratio (EAR) from six-point eye contours.
//!
//! EAR = (|p1 - p5| + |p2 - p4|) / (2 * |p0 - p3|)
//!
//! An open eye sits around 0.3; the ratio falls towards zero as the lids
//! close. The horizontal span is the denominator, so coincident corner
//! points make the ratio undefined and are reported as an error instead of
//! leaking NaN or infinity into the blink detector.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::EyeLandmarks;

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum GeometryError {
    #[error("degenerate eye geometry: horizontal span is {span}")]
    Degenerate { span: f32 },
}

/// Compute the eye aspect ratio of a single eye.
pub fn eye_aspect_ratio(eye: &EyeLandmarks) -> Result<f32, GeometryError> {
    let p = eye.points();
    let a = p[1].distance(&p[5]);
    let b = p[2].distance(&p[4]);
    let c = p[0].distance(&p[3]);

    if !(c.is_finite() && c > 0.0) {
        return Err(GeometryError::Degenerate { span: c });
    }

    let ear = (a + b) / (2.0 * c);
    if !ear.is_finite() {
        return Err(GeometryError::Degenerate { span: c });
    }
    Ok(ear)
}

/// How many eyes must be visible before a frame yields a usable EAR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EyeRequirement {
    /// Both contours must be present; a single visible eye is no signal.
    #[default]
    BothEyes,
    /// Fall back to the one visible eye when the other is missing.
    EitherEye,
}

/// Per-frame EAR after applying the [`EyeRequirement`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EarReading {
    /// Mean of left and right EAR.
    Both(f32),
    /// Only one eye contributed.
    Single(f32),
    /// No usable signal this frame.
    Unusable,
}

impl EarReading {
    pub fn value(&self) -> Option<f32> {
        match self {
            EarReading::Both(v) | EarReading::Single(v) => Some(*v),
            EarReading::Unusable => None,
        }
    }
}

/// Combine the per-eye ratios for one frame.
///
/// A degenerate eye is treated as missing, so with [`EyeRequirement::BothEyes`]
/// a single degenerate contour makes the whole frame unusable.
pub fn average_ear(
    left: Option<&EyeLandmarks>,
    right: Option<&EyeLandmarks>,
    requirement: EyeRequirement,
) -> EarReading {
    let ratio = |eye: Option<&EyeLandmarks>| {
        eye.and_then(|e| match eye_aspect_ratio(e) {
            Ok(v) => Some(v),
            Err(err) => {
                tracing::debug!(error = %err, "skipping eye");
                None
            }
        })
    };

    match (ratio(left), ratio(right), requirement) {
        (Some(l), Some(r), _) => EarReading::Both((l + r) / 2.0),
        (Some(v), None, EyeRequirement::EitherEye) | (None, Some(v), EyeRequirement::EitherEye) => {
            EarReading::Single(v)
        }
        _ => EarReading::Unusable,
    }
}
