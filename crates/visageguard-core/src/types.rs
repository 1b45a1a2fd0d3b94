use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A 2-D landmark coordinate in pixel units.
///
/// Serialized as a `[x, y]` pair, the layout emitted by common landmark
/// predictors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f32, f32)", into = "(f32, f32)")]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Plane Euclidean distance to `other`.
    pub fn distance(&self, other: &Point) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }
}

impl From<(f32, f32)> for Point {
    fn from((x, y): (f32, f32)) -> Self {
        Self { x, y }
    }
}

impl From<Point> for (f32, f32) {
    fn from(p: Point) -> Self {
        (p.x, p.y)
    }
}

/// Number of landmarks describing one eye.
pub const EYE_POINTS: usize = 6;

/// Ordered six-point eye contour.
///
/// Index convention: 0 = outer corner, 1–2 = upper lid, 3 = inner corner,
/// 4–5 = lower lid. The EAR computation relies on this order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Point>", into = "Vec<Point>")]
pub struct EyeLandmarks {
    points: [Point; EYE_POINTS],
}

impl EyeLandmarks {
    pub const fn new(points: [Point; EYE_POINTS]) -> Self {
        Self { points }
    }

    /// Build from a slice, returning `None` unless it holds exactly six points.
    pub fn from_slice(points: &[Point]) -> Option<Self> {
        let points: [Point; EYE_POINTS] = points.try_into().ok()?;
        Some(Self { points })
    }

    pub fn points(&self) -> &[Point; EYE_POINTS] {
        &self.points
    }
}

impl TryFrom<Vec<Point>> for EyeLandmarks {
    type Error = String;

    fn try_from(points: Vec<Point>) -> Result<Self, Self::Error> {
        let len = points.len();
        Self::from_slice(&points)
            .ok_or_else(|| format!("eye landmark set must have {EYE_POINTS} points, got {len}"))
    }
}

impl From<EyeLandmarks> for Vec<Point> {
    fn from(eye: EyeLandmarks) -> Self {
        eye.points.to_vec()
    }
}

/// Full 68-point layout (iBUG 300-W / dlib).
pub const FACE_68_POINTS: usize = 68;
/// Minimal layout carrying only the two eye contours.
pub const FACE_12_POINTS: usize = 12;

const RIGHT_EYE_68: std::ops::Range<usize> = 36..42;
const LEFT_EYE_68: std::ops::Range<usize> = 42..48;

/// Eye contours extracted from one detected face.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaceLandmarks {
    pub right_eye: Option<EyeLandmarks>,
    pub left_eye: Option<EyeLandmarks>,
}

impl FaceLandmarks {
    /// Extract both eyes from a 68-point or 12-point landmark set.
    ///
    /// Any other length yields a face with no usable eyes.
    pub fn from_points(points: &[Point]) -> Self {
        match points.len() {
            FACE_68_POINTS => Self {
                right_eye: EyeLandmarks::from_slice(&points[RIGHT_EYE_68]),
                left_eye: EyeLandmarks::from_slice(&points[LEFT_EYE_68]),
            },
            FACE_12_POINTS => Self {
                right_eye: EyeLandmarks::from_slice(&points[..EYE_POINTS]),
                left_eye: EyeLandmarks::from_slice(&points[EYE_POINTS..]),
            },
            other => {
                tracing::debug!(points = other, "unsupported landmark layout");
                Self::default()
            }
        }
    }
}

/// Everything the policy needs to know about one processed frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameSample {
    /// Monotonic offset from the session start.
    pub timestamp: Duration,
    pub face_present: bool,
    pub left_eye: Option<EyeLandmarks>,
    pub right_eye: Option<EyeLandmarks>,
    /// Enrolled identity label reported by the recognizer, if any.
    pub identity: Option<String>,
}

impl FrameSample {
    /// A frame in which no face was found.
    pub fn absent(timestamp: Duration) -> Self {
        Self {
            timestamp,
            ..Self::default()
        }
    }

    /// A frame with a detected face and its eye contours.
    pub fn with_face(timestamp: Duration, face: FaceLandmarks, identity: Option<String>) -> Self {
        Self {
            timestamp,
            face_present: true,
            left_eye: face.left_eye,
            right_eye: face.right_eye,
            identity,
        }
    }
}

/// Why the policy asked for the session to be locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockReason {
    NoFacePresence,
    NoBlinkActivity,
    UnrecognizedIdentity,
}

impl LockReason {
    /// Message suitable for showing to the person who was locked out.
    pub fn describe(&self) -> &'static str {
        match self {
            LockReason::NoFacePresence => {
                "Session locked: no face detected for a prolonged period."
            }
            LockReason::NoBlinkActivity => {
                "Session locked: no blinking detected for a prolonged period."
            }
            LockReason::UnrecognizedIdentity => "Session locked: an unknown user was detected.",
        }
    }
}

impl fmt::Display for LockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockReason::NoFacePresence => "no-face-presence",
            LockReason::NoBlinkActivity => "no-blink-activity",
            LockReason::UnrecognizedIdentity => "unrecognized-identity",
        };
        f.write_str(name)
    }
}

/// Terminal output of the policy for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockDecision {
    pub reason: LockReason,
    pub triggered_at: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: usize) -> Vec<Point> {
        (0..n).map(|i| Point::new(i as f32, 0.0)).collect()
    }

    #[test]
    fn test_distance_pythagorean() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(3.0, 4.0);
        assert!((a.distance(&b) - 5.0).abs() < 1e-6);
        assert!((b.distance(&a) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_eye_from_slice_requires_six_points() {
        assert!(EyeLandmarks::from_slice(&numbered(6)).is_some());
        assert!(EyeLandmarks::from_slice(&numbered(5)).is_none());
        assert!(EyeLandmarks::from_slice(&numbered(7)).is_none());
    }

    #[test]
    fn test_face_68_uses_dlib_eye_indices() {
        let face = FaceLandmarks::from_points(&numbered(68));
        let right = face.right_eye.unwrap();
        let left = face.left_eye.unwrap();
        assert_eq!(right.points()[0].x, 36.0);
        assert_eq!(right.points()[5].x, 41.0);
        assert_eq!(left.points()[0].x, 42.0);
        assert_eq!(left.points()[5].x, 47.0);
    }

    #[test]
    fn test_face_12_splits_right_then_left() {
        let face = FaceLandmarks::from_points(&numbered(12));
        assert_eq!(face.right_eye.unwrap().points()[0].x, 0.0);
        assert_eq!(face.left_eye.unwrap().points()[0].x, 6.0);
    }

    #[test]
    fn test_face_unknown_layout_has_no_eyes() {
        let face = FaceLandmarks::from_points(&numbered(5));
        assert_eq!(face, FaceLandmarks::default());
    }

    #[test]
    fn test_eye_serde_rejects_wrong_length() {
        let ok: Result<EyeLandmarks, _> =
            serde_json::from_str("[[0,0],[1,1],[2,1],[3,0],[2,-1],[1,-1]]");
        assert!(ok.is_ok());
        let short: Result<EyeLandmarks, _> = serde_json::from_str("[[0,0],[1,1]]");
        assert!(short.is_err());
    }

    #[test]
    fn test_lock_reason_display() {
        assert_eq!(LockReason::NoFacePresence.to_string(), "no-face-presence");
        assert!(LockReason::UnrecognizedIdentity
            .describe()
            .contains("unknown user"));
    }
}
