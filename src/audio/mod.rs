//! Audio codec: μ-law/PCM16 conversion, resampling, framing, and metering.

pub mod codec;

pub use codec::{chunk, mulaw_to_pcm16, pcm16_to_mulaw, resample, rms, AudioFrame, Encoding};
