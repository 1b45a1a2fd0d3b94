//! Landmark feed wire format.
//!
//! An external landmark process writes one JSON object per line:
//!
//! ```text
//! {"t_ms": 1200, "faces": [{"landmarks": [[x, y], ...], "identity": "alice"}]}
//! ```
//!
//! `landmarks` is either the 68-point layout or the 12-point two-eye subset.
//! A face may instead (or additionally) carry explicit `right_eye` /
//! `left_eye` six-point arrays, which take precedence. `t_ms` is optional
//! for live feeds and required when replaying a recording.

use std::io::BufRead;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{EyeLandmarks, FaceLandmarks, FrameSample, Point};

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("line {line}: malformed frame record: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("line {line}: frame record has no t_ms timestamp")]
    MissingTimestamp { line: usize },
    #[error("feed read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// One detected face as reported by the landmark process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceRecord {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub landmarks: Vec<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_eye: Option<EyeLandmarks>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_eye: Option<EyeLandmarks>,
    /// Enrolled identity label from the recognizer, if it matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

impl FaceRecord {
    pub fn eyes(&self) -> FaceLandmarks {
        let mut face = if self.landmarks.is_empty() {
            FaceLandmarks::default()
        } else {
            FaceLandmarks::from_points(&self.landmarks)
        };
        if self.right_eye.is_some() {
            face.right_eye = self.right_eye;
        }
        if self.left_eye.is_some() {
            face.left_eye = self.left_eye;
        }
        face
    }
}

/// One processed camera frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_ms: Option<u64>,
    #[serde(default)]
    pub faces: Vec<FaceRecord>,
}

impl FrameRecord {
    pub fn parse_line(line: &str, line_no: usize) -> Result<Self, FeedError> {
        serde_json::from_str(line).map_err(|source| FeedError::Parse {
            line: line_no,
            source,
        })
    }

    pub fn timestamp(&self) -> Option<Duration> {
        self.t_ms.map(Duration::from_millis)
    }

    /// The face the policy looks at. Only the first reported face is used.
    pub fn primary_face(&self) -> Option<&FaceRecord> {
        self.faces.first()
    }

    pub fn to_sample(&self, timestamp: Duration) -> FrameSample {
        match self.primary_face() {
            Some(face) => FrameSample::with_face(timestamp, face.eyes(), face.identity.clone()),
            None => FrameSample::absent(timestamp),
        }
    }
}

/// Iterate the records of a recorded feed, skipping blank and `#` lines.
///
/// Items carry the 1-based line number alongside the record.
pub fn read_records<R: BufRead>(
    reader: R,
) -> impl Iterator<Item = Result<(usize, FrameRecord), FeedError>> {
    reader
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            let line_no = idx + 1;
            match line {
                Err(e) => Some(Err(FeedError::Io(e))),
                Ok(text) => {
                    let trimmed = text.trim();
                    if trimmed.is_empty() || trimmed.starts_with('#') {
                        None
                    } else {
                        Some(FrameRecord::parse_line(trimmed, line_no).map(|r| (line_no, r)))
                    }
                }
            }
        })
}
