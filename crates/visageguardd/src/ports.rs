//! Collaborator boundary of the session controller.
//!
//! Camera capture, landmark extraction, face recognition and the platform
//! lock live behind these traits. The daemon wires in the landmark-feed
//! implementations from [`crate::feed_source`] and [`crate::lock`]; tests
//! substitute scripted ones.

use thiserror::Error;
use visageguard_core::FaceLandmarks;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture device unavailable: {0}")]
    Unavailable(String),
    #[error("capture stream ended")]
    EndOfStream,
    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("failed to run lock command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("lock command `{command}` exited with {status}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
    },
}

/// A capture source that can be opened once per detection session.
pub trait CaptureDevice: Send {
    type Frame: Send + 'static;
    type Stream: FrameStream<Frame = Self::Frame> + Send + 'static;

    /// Open the device. Failure here means the session cannot start.
    fn open(&self) -> Result<Self::Stream, CaptureError>;

    /// Human-readable identifier for logs and status output.
    fn describe(&self) -> String;
}

/// An open capture stream, read by the session worker.
pub trait FrameStream {
    type Frame;

    /// Block for the next frame.
    ///
    /// `Ok(None)` is a transient miss (no frame this call) and must not be
    /// read as "no face". `Err` is fatal for the session.
    fn next_frame(&mut self) -> Result<Option<Self::Frame>, CaptureError>;
}

/// Face and eye landmark extraction.
pub trait LandmarkDetector<F>: Send {
    /// Faces found in the frame, most prominent first.
    fn detect(&mut self, frame: &F) -> Vec<FaceLandmarks>;
}

/// Enrolled-identity matching.
pub trait IdentityRecognizer<F>: Send {
    /// Label of the enrolled identity matching face `face_index`, if any.
    fn recognize(&mut self, frame: &F, face_index: usize) -> Option<String>;
}

/// Platform session lock.
pub trait LockAction: Send + Sync {
    fn lock(&self) -> Result<(), LockError>;
}

/// Per-frame analysis collaborators, owned by whichever worker is running.
pub struct Pipeline<F> {
    pub landmarks: Box<dyn LandmarkDetector<F>>,
    pub recognizer: Option<Box<dyn IdentityRecognizer<F>>>,
}
