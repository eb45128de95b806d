//! Message types passed between the audio layer and the VAD/playback paths.

use std::time::Instant;

/// A chunk of raw audio samples from the caller leg of a call.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Interleaved f32 samples, mono, at the configured input sample rate.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Timestamp when this chunk was received.
    pub captured_at: Instant,
}

/// A complete speech segment detected by the server-side VAD, used as a
/// secondary natural-end-of-speech signal alongside the STT idle finaliser.
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    /// Concatenated audio samples for the entire utterance.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// When the speech segment started.
    pub started_at: Instant,
}

/// One chunk of synthesised reply audio ready for playback, already
/// downsampled and encoded to the telephony format (mulaw, 8 kHz).
#[derive(Debug, Clone)]
pub struct PlaybackChunk {
    pub bytes: Vec<u8>,
    pub sample_rate_hz: u32,
    /// True on the last chunk of a synthesised segment.
    pub is_final: bool,
}
