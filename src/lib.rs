//! A real-time telephony voice agent: bridges an Asterisk/FreePBX call leg to
//! pluggable speech-to-text, language-model, and text-to-speech back-ends.
//!
//! # Architecture
//!
//! Caller audio arrives over the telephony leg (μ-law, 8 kHz) and is
//! converted, transcribed, answered, and spoken back through a small set of
//! cooperating components:
//!
//! - **Audio codec** ([`audio::codec`]): μ-law ↔ PCM16 conversion, linear
//!   resampling between the telephony/STT/TTS sample rates, and playback
//!   chunking.
//! - **Back-end session multiplexer** ([`session`], [`backend`]): a duplex
//!   channel to an in-process AI server, split into per-call, per-stage
//!   sub-sessions.
//! - **STT stage** ([`stt`]): a streaming recognizer with an idle finaliser
//!   and duplicate-transcript suppression.
//! - **LLM stage** ([`llm`]): rolling conversation history, token-budget
//!   prompt trimming, and a server-side single-flight mutex around
//!   inference, with a timeout and fallback reply.
//! - **TTS stage** ([`tts`]): synthesises replies to mulaw 8 kHz chunks.
//! - **Pipeline orchestrator and turn coordinator** ([`pipeline`]): per-call
//!   state machine routing STT → LLM → TTS, the gating token that enforces
//!   at most one agent reply in flight, and barge-in detection.
//! - **Call lifecycle** ([`call`]): session data owned by the orchestrator
//!   and read by the coordinator and stage tasks.

// Fail early with a clear message when the metal feature is enabled but the
// Metal Toolchain is not installed. Without this, mistralrs panics deep in a
// build script with an opaque error.
#[cfg(missing_metal_toolchain)]
compile_error!(
    "The `metal` feature requires Apple's Metal Toolchain. Install it with:\n\n    \
     xcodebuild -downloadComponent MetalToolchain\n\n\
     This is a one-time ~700 MB download."
);

pub mod audio;
pub mod backend;
pub mod call;
pub mod config;
pub mod error;
pub mod llm;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod session;
pub mod stt;
pub mod tts;
pub mod vad;

pub use call::{CallSession, PipelineDescriptor, SessionStore};
pub use config::SpeechConfig;
pub use error::{Result, SpeechError};
pub use logging::init_tracing;
pub use pipeline::orchestrator::{CallControl, Orchestrator};
pub use progress::{ProgressCallback, ProgressEvent};
