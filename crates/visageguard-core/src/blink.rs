//! Hysteresis blink detector.
//!
//! A blink is registered only after the averaged EAR has stayed below the
//! threshold for `frames_required` consecutive frames. One noisy low frame
//! from the landmark predictor is therefore never mistaken for a blink.

use std::time::Duration;

/// Per-frame output of [`BlinkDetector::observe`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlinkSignal {
    /// Eyes have been below threshold for at least the required run of frames.
    pub is_blinking: bool,
    /// This frame completed the run, i.e. a new blink was registered.
    pub just_closed: bool,
}

/// Consecutive-low-frame counter scoped to one detection session.
#[derive(Debug, Clone, Default)]
pub struct BlinkDetector {
    consecutive_low: u32,
    blinking: bool,
    last_blink_at: Option<Duration>,
}

impl BlinkDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame's averaged EAR.
    pub fn observe(
        &mut self,
        ear: f32,
        now: Duration,
        threshold: f32,
        frames_required: u32,
    ) -> BlinkSignal {
        if ear < threshold {
            self.consecutive_low = self.consecutive_low.saturating_add(1);
            if self.consecutive_low >= frames_required && !self.blinking {
                self.blinking = true;
                self.last_blink_at = Some(now);
                tracing::trace!(at_ms = now.as_millis() as u64, "blink registered");
                return BlinkSignal {
                    is_blinking: true,
                    just_closed: true,
                };
            }
        } else {
            self.consecutive_low = 0;
            self.blinking = false;
        }

        BlinkSignal {
            is_blinking: self.blinking,
            just_closed: false,
        }
    }

    /// Clear the run counter and blink state (face lost, session restart).
    pub fn reset(&mut self) {
        self.consecutive_low = 0;
        self.blinking = false;
    }

    pub fn consecutive_low(&self) -> u32 {
        self.consecutive_low
    }

    pub fn is_blinking(&self) -> bool {
        self.blinking
    }

    /// Time of the most recent registered blink in this session.
    pub fn last_blink_at(&self) -> Option<Duration> {
        self.last_blink_at
    }
}
