//! Voice Activity Detection using energy-based analysis.
//!
//! Used by the in-process AI server to detect a caller's natural end of
//! speech (the `recognizer-final` path) independent of, and usually faster
//! than, the STT stage's idle-timeout finaliser. Silero ONNX model
//! integration is planned for a future version; RMS thresholding is the
//! first cut.

use crate::config::VadConfig;
use crate::pipeline::messages::{AudioChunk, SpeechSegment};
use std::collections::VecDeque;
use std::time::Instant;

/// VAD processing output.
pub struct VadOutput {
    /// Whether this chunk started a new speech segment.
    pub speech_started: bool,
    /// Whether this chunk is classified as speech.
    pub is_speech: bool,
    /// Completed speech segment, if one ended on this chunk.
    pub segment: Option<SpeechSegment>,
    /// RMS energy of the processed chunk.
    pub rms: f32,
}

/// Voice activity detector using RMS energy thresholding.
pub struct SileroVad {
    /// Pre-roll audio buffer for `speech_pad_ms`.
    pre_roll: VecDeque<f32>,
    /// Maximum number of samples to keep in pre-roll.
    pre_roll_max: usize,
    /// Accumulated samples for the current speech segment.
    speech_buffer: Vec<f32>,
    /// Whether we are currently in a speech segment.
    in_speech: bool,
    /// Number of consecutive silent samples.
    silence_samples: usize,
    /// Threshold for the number of silence samples to end a segment.
    silence_samples_threshold: usize,
    /// When the current speech segment started.
    speech_start: Option<Instant>,
    /// Configured sample rate.
    sample_rate: u32,
    /// VAD threshold.
    threshold: f32,
    /// Minimum speech duration in samples.
    min_speech_samples: usize,
}

impl SileroVad {
    /// Create a new VAD instance for a stream at `sample_rate` Hz.
    pub fn new(config: &VadConfig, sample_rate: u32) -> Self {
        let silence_samples_threshold =
            (config.min_silence_duration_ms as usize * sample_rate as usize) / 1000;
        let pre_roll_max = (config.speech_pad_ms as usize * sample_rate as usize) / 1000;
        let min_speech_samples =
            (config.min_speech_duration_ms as usize * sample_rate as usize) / 1000;

        Self {
            pre_roll: VecDeque::with_capacity(
                pre_roll_max.saturating_add(sample_rate as usize / 2),
            ),
            pre_roll_max,
            speech_buffer: Vec::new(),
            in_speech: false,
            silence_samples: 0,
            silence_samples_threshold,
            speech_start: None,
            sample_rate,
            threshold: config.threshold,
            min_speech_samples,
        }
    }

    /// Process an audio chunk and return a speech segment if a complete
    /// utterance has been detected.
    pub fn process_chunk(&mut self, chunk: &AudioChunk) -> VadOutput {
        let rms = compute_rms_energy(&chunk.samples);
        let is_speech = rms > self.threshold;

        // Update pre-roll buffer (for future speech starts)
        if self.pre_roll_max > 0 {
            self.pre_roll.extend(chunk.samples.iter().copied());
            while self.pre_roll.len() > self.pre_roll_max {
                let _ = self.pre_roll.pop_front();
            }
        }

        let mut speech_started = false;
        let mut completed: Option<SpeechSegment> = None;

        if is_speech {
            if !self.in_speech {
                self.in_speech = true;
                speech_started = true;
                self.speech_start = Some(chunk.captured_at);
                self.speech_buffer.clear();

                // Prepend pre-roll so we don't clip the initial phoneme.
                if !self.pre_roll.is_empty() {
                    self.speech_buffer.extend(self.pre_roll.iter().copied());
                }
            }
            self.silence_samples = 0;
            self.speech_buffer.extend_from_slice(&chunk.samples);
        } else if self.in_speech {
            self.silence_samples = self.silence_samples.saturating_add(chunk.samples.len());
            // Still append silence within tolerance
            self.speech_buffer.extend_from_slice(&chunk.samples);

            if self.silence_samples >= self.silence_samples_threshold {
                // Speech segment ended
                self.in_speech = false;
                self.silence_samples = 0;

                if self.speech_buffer.len() >= self.min_speech_samples {
                    let started_at = match self.speech_start {
                        Some(t) => t,
                        None => Instant::now(),
                    };
                    let segment = SpeechSegment {
                        samples: std::mem::take(&mut self.speech_buffer),
                        sample_rate: self.sample_rate,
                        started_at,
                    };
                    completed = Some(segment);
                } else {
                    self.speech_buffer.clear();
                }
            }
        }

        VadOutput {
            speech_started,
            is_speech,
            segment: completed,
            rms,
        }
    }

    /// Update the silence duration threshold at runtime.
    ///
    /// This allows the coordinator to use a shorter threshold during assistant
    /// speech (for faster barge-in segment delivery) and revert to the normal
    /// threshold when the assistant is idle.
    pub fn set_silence_threshold_ms(&mut self, ms: u32) {
        self.silence_samples_threshold = (ms as usize * self.sample_rate as usize) / 1000;
    }

    /// Reset the VAD state.
    pub fn reset(&mut self) {
        self.pre_roll.clear();
        self.speech_buffer.clear();
        self.in_speech = false;
        self.silence_samples = 0;
        self.speech_start = None;
    }
}

/// Compute RMS energy of audio samples.
fn compute_rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VadConfig {
        VadConfig {
            threshold: 0.1,
            min_silence_duration_ms: 100,
            speech_pad_ms: 0,
            min_speech_duration_ms: 10,
        }
    }

    fn chunk(samples: Vec<f32>) -> AudioChunk {
        AudioChunk {
            samples,
            sample_rate: 16_000,
            captured_at: Instant::now(),
        }
    }

    #[test]
    fn silence_never_starts_a_speech_segment() {
        let mut vad = SileroVad::new(&config(), 16_000);
        let out = vad.process_chunk(&chunk(vec![0.0; 1_600]));
        assert!(!out.is_speech);
        assert!(!out.speech_started);
        assert!(out.segment.is_none());
    }

    #[test]
    fn speech_then_enough_silence_completes_a_segment() {
        let mut vad = SileroVad::new(&config(), 16_000);
        let speech = vad.process_chunk(&chunk(vec![0.5; 1_600])); // 100ms
        assert!(speech.speech_started);
        assert!(speech.segment.is_none());

        // 100ms of silence meets min_silence_duration_ms, ending the segment.
        let silence = vad.process_chunk(&chunk(vec![0.0; 1_600]));
        let segment = silence.segment.expect("segment should complete");
        assert_eq!(segment.sample_rate, 16_000);
        assert!(segment.samples.len() >= 1_600);
    }

    #[test]
    fn segment_shorter_than_min_speech_duration_is_dropped() {
        let mut cfg = config();
        cfg.min_speech_duration_ms = 5_000;
        let mut vad = SileroVad::new(&cfg, 16_000);
        vad.process_chunk(&chunk(vec![0.5; 1_600]));
        let out = vad.process_chunk(&chunk(vec![0.0; 1_600]));
        assert!(out.segment.is_none());
    }

    #[test]
    fn reset_clears_in_progress_speech() {
        let mut vad = SileroVad::new(&config(), 16_000);
        vad.process_chunk(&chunk(vec![0.5; 1_600]));
        vad.reset();
        let out = vad.process_chunk(&chunk(vec![0.0; 100]));
        assert!(out.segment.is_none());
        assert!(!out.is_speech);
    }
}
