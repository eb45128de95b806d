//! Kokoro-82M TTS engine — single-model ONNX inference with `misaki-rs` G2P phonemization.

mod download;
mod engine;
mod phonemize;

pub use engine::KokoroTts;
