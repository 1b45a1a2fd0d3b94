//! Landmark feed capture source.
//!
//! The daemon does not talk to the camera itself. An external landmark
//! process writes [`FrameRecord`] lines to a FIFO (or a regular file for
//! testing) and this module streams them into the session worker.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use visageguard_core::feed::{read_records, FeedError, FrameRecord};
use visageguard_core::FaceLandmarks;

use crate::ports::{CaptureDevice, CaptureError, FrameStream, IdentityRecognizer, LandmarkDetector};

/// Records buffered between the reader thread and the session worker.
const FEED_BUFFER: usize = 64;

type FeedItem = Result<FrameRecord, CaptureError>;

/// The stream currently attached to the reader thread.
struct Subscription {
    id: u64,
    tx: SyncSender<FeedItem>,
}

#[derive(Default)]
struct FeedShared {
    current: Mutex<Option<Subscription>>,
}

impl FeedShared {
    fn sender(&self) -> Option<SyncSender<FeedItem>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.tx.clone())
    }

    /// Hand an item to the attached stream. Returns false when none is attached.
    fn deliver(&self, item: FeedItem) -> bool {
        // Send outside the lock: a full channel must not block detaching.
        match self.sender() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    fn detach(&self, id: u64) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|s| s.id == id) {
            *current = None;
        }
    }
}

/// A landmark feed at a filesystem path.
///
/// One reader thread serves the device for as long as the feed stays open;
/// each session attaches a fresh stream to it. A reader blocked on an idle
/// FIFO is reused by the next session instead of competing with it.
pub struct FeedDevice {
    path: PathBuf,
    poll_interval: Duration,
    shared: Arc<FeedShared>,
    reader: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl FeedDevice {
    pub fn new(path: impl AsRef<Path>, poll_interval: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            poll_interval,
            shared: Arc::new(FeedShared::default()),
            reader: Mutex::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    /// Spawn the reader thread unless a live one is already serving the feed.
    fn ensure_reader(&self) -> Result<(), CaptureError> {
        let mut reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        if reader.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        if let Some(finished) = reader.take() {
            let _ = finished.join();
        }

        let path = self.path.clone();
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("visageguard-feed".into())
            .spawn(move || read_feed(&path, &shared))
            .map_err(|e| CaptureError::Unavailable(format!("feed reader thread: {e}")))?;
        *reader = Some(handle);
        Ok(())
    }
}

fn read_feed(path: &Path, shared: &FeedShared) {
    // Opening a FIFO blocks until a writer appears.
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            shared.deliver(Err(CaptureError::Io(e)));
            return;
        }
    };
    tracing::debug!(path = %path.display(), "feed opened");

    for item in read_records(BufReader::new(file)) {
        match item {
            Ok((line, record)) => {
                if !shared.deliver(Ok(record)) {
                    tracing::trace!(line, "no session attached; record dropped");
                }
            }
            Err(FeedError::Io(e)) => {
                shared.deliver(Err(CaptureError::Io(e)));
                return;
            }
            Err(e) => tracing::warn!(error = %e, "skipping feed line"),
        }
    }
    tracing::debug!(path = %path.display(), "feed writer closed");
    shared.deliver(Err(CaptureError::EndOfStream));
}

impl CaptureDevice for FeedDevice {
    type Frame = FrameRecord;
    type Stream = FeedStream;

    fn open(&self) -> Result<FeedStream, CaptureError> {
        std::fs::metadata(&self.path)
            .map_err(|e| CaptureError::Unavailable(format!("{}: {e}", self.path.display())))?;

        let (tx, rx) = mpsc::sync_channel(FEED_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        *self
            .shared
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Subscription { id, tx });

        if let Err(e) = self.ensure_reader() {
            self.shared.detach(id);
            return Err(e);
        }

        Ok(FeedStream {
            rx,
            poll_interval: self.poll_interval,
            id,
            shared: Arc::clone(&self.shared),
        })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Open feed, yielding records in arrival order.
///
/// Dropping the stream detaches it from the reader thread.
pub struct FeedStream {
    rx: Receiver<FeedItem>,
    poll_interval: Duration,
    id: u64,
    shared: Arc<FeedShared>,
}

impl FrameStream for FeedStream {
    type Frame = FrameRecord;

    /// Waits at most one poll interval so the worker can notice stop requests.
    fn next_frame(&mut self) -> Result<Option<FrameRecord>, CaptureError> {
        match self.rx.recv_timeout(self.poll_interval) {
            Ok(Ok(record)) => Ok(Some(record)),
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::EndOfStream),
        }
    }
}

impl Drop for FeedStream {
    fn drop(&mut self) {
        self.shared.detach(self.id);
    }
}

/// Landmarks arrive pre-extracted in the feed.
pub struct FeedLandmarks;

impl LandmarkDetector<FrameRecord> for FeedLandmarks {
    fn detect(&mut self, frame: &FrameRecord) -> Vec<FaceLandmarks> {
        frame.faces.iter().map(|f| f.eyes()).collect()
    }
}

/// Identity labels arrive pre-matched in the feed.
pub struct FeedRecognizer;

impl IdentityRecognizer<FrameRecord> for FeedRecognizer {
    fn recognize(&mut self, frame: &FrameRecord, face_index: usize) -> Option<String> {
        frame.faces.get(face_index)?.identity.clone()
    }
}
