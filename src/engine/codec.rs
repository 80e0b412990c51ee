//! # Audio Codec
//!
//! Converts between raw 16-bit PCM samples and transport-safe payloads.
//!
//! ## Payload shapes:
//! The synthesis collaborator is free to send either a self-describing WAV
//! container or a headerless raw PCM stream. `decode` attempts the container
//! parse first and falls back to raw little-endian PCM interpretation, so a
//! single decode path covers both.
//!
//! ## Audio Format Requirements:
//! - **Capture direction**: 16 kHz (recognition collaborator input)
//! - **Playback direction**: 24 kHz (synthesis collaborator output)
//! - **Bit Depth**: 16-bit signed PCM, little-endian
//! - **Channels**: mono
//!
//! Rates are configurable per direction but fixed for the lifetime of a
//! session.

use crate::error::{EngineError, EngineResult};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::time::Duration;

/// Which half of the conversation a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Operator speech heading to the recognition collaborator
    Capture,
    /// Agent speech heading to the output device
    Playback,
}

/// A decoded, playable run of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl SampleBuffer {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    /// Real-time duration of this buffer when played at its sample rate.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Stateless encoder/decoder bound to the session's fixed sample rates.
#[derive(Debug, Clone)]
pub struct AudioCodec {
    capture_sample_rate: u32,
    playback_sample_rate: u32,
}

impl AudioCodec {
    pub fn new(capture_sample_rate: u32, playback_sample_rate: u32) -> Self {
        Self {
            capture_sample_rate,
            playback_sample_rate,
        }
    }

    /// The fixed sample rate for one direction.
    pub fn sample_rate(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Capture => self.capture_sample_rate,
            Direction::Playback => self.playback_sample_rate,
        }
    }

    /// Wrap raw samples in a self-describing WAV envelope.
    pub fn encode(&self, samples: &[i16], direction: Direction) -> Vec<u8> {
        let header = wav::Header::new(
            wav::header::WAV_FORMAT_PCM,
            1,
            self.sample_rate(direction),
            16,
        );
        let mut cursor = Cursor::new(Vec::new());
        // Writing PCM16 into an in-memory cursor cannot fail.
        wav::write(header, &wav::BitDepth::Sixteen(samples.to_vec()), &mut cursor)
            .expect("in-memory WAV write");
        cursor.into_inner()
    }

    /// Decode a transport payload into a playable buffer.
    ///
    /// Tries the WAV container parse first; on failure re-interprets the
    /// payload as headerless raw PCM at the direction's fixed rate.
    pub fn decode(&self, payload: &[u8], direction: Direction) -> EngineResult<SampleBuffer> {
        if payload.is_empty() {
            return Err(EngineError::MalformedAudio("empty payload".to_string()));
        }

        if let Some(result) = self.decode_container(payload) {
            return result;
        }

        self.decode_raw_pcm(payload, direction)
    }

    /// Attempt the self-describing container parse.
    ///
    /// Returns `None` when the payload is not a WAV container at all (the
    /// caller falls back to raw PCM), and `Some(Err(..))` when it is a
    /// container but carries an unsupported track format.
    fn decode_container(&self, payload: &[u8]) -> Option<EngineResult<SampleBuffer>> {
        let mut cursor = Cursor::new(payload);
        let (header, data) = wav::read(&mut cursor).ok()?;

        match data {
            wav::BitDepth::Sixteen(samples) => Some(Ok(SampleBuffer::new(
                samples,
                header.sampling_rate,
            ))),
            other => Some(Err(EngineError::MalformedAudio(format!(
                "unsupported container bit depth: {:?}",
                other
            )))),
        }
    }

    /// Interpret the payload as headerless 16-bit little-endian PCM.
    fn decode_raw_pcm(&self, payload: &[u8], direction: Direction) -> EngineResult<SampleBuffer> {
        if payload.len() % 2 != 0 {
            return Err(EngineError::MalformedAudio(format!(
                "payload length {} is not a whole number of 16-bit frames",
                payload.len()
            )));
        }

        let mut cursor = Cursor::new(payload);
        let mut samples = Vec::with_capacity(payload.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample);
        }

        Ok(SampleBuffer::new(samples, self.sample_rate(direction)))
    }
}
