//! # Operator Capture Buffer
//!
//! Accumulates operator speech between `start-stream` and `stop-stream`.
//! One buffer holds exactly one utterance; `take_utterance` drains it when
//! the operator finishes speaking and the samples head to the recognition
//! collaborator.
//!
//! ## Memory Management:
//! - A sliding cap (derived from `max_utterance_ms`) discards the oldest
//!   samples once an utterance exceeds the configured length, so a stuck
//!   client cannot grow the buffer without bound.
//! - Efficient append/drain using VecDeque.

use crate::engine::codec::SampleBuffer;
use std::collections::VecDeque;

/// Accumulates one operator utterance worth of decoded samples.
///
/// Owned exclusively by the session worker; no locking needed.
pub struct CaptureBuffer {
    samples: VecDeque<i16>,
    sample_rate: u32,
    max_samples: usize,
    /// Count of samples evicted because the utterance overran the cap.
    overflowed: usize,
}

impl CaptureBuffer {
    /// Create a buffer capped at `max_utterance_ms` of audio.
    pub fn new(sample_rate: u32, max_utterance_ms: u32) -> Self {
        let max_samples = (max_utterance_ms as usize * sample_rate as usize) / 1000;
        Self {
            samples: VecDeque::with_capacity(max_samples.min(sample_rate as usize)),
            sample_rate,
            max_samples,
            overflowed: 0,
        }
    }

    /// Append a decoded chunk of operator audio.
    pub fn append(&mut self, buffer: &SampleBuffer) {
        for &sample in &buffer.samples {
            self.samples.push_back(sample);
            if self.samples.len() > self.max_samples {
                self.samples.pop_front();
                self.overflowed += 1;
            }
        }
    }

    /// Drain the accumulated utterance, leaving the buffer empty for the
    /// next turn.
    pub fn take_utterance(&mut self) -> SampleBuffer {
        self.overflowed = 0;
        SampleBuffer::new(self.samples.drain(..).collect(), self.sample_rate)
    }

    /// Discard any accumulated audio without producing an utterance.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.overflowed = 0;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration of audio currently buffered, in seconds.
    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Samples discarded from the front of the current utterance.
    pub fn overflowed_samples(&self) -> usize {
        self.overflowed
    }
}
