//! Error types for the telephony voice-agent core.

/// Top-level error type for the telephony voice-agent core.
#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    /// Speech-to-text transcription error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Language model inference error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Model download or loading error.
    #[error("model error: {0}")]
    Model(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation exceeded its deadline. Recovered locally by the caller
    /// (e.g. the LLM stage falls back to a fixed reply).
    #[error("timeout in {stage} after {elapsed_ms}ms: {detail}")]
    Timeout {
        /// Which stage the timeout occurred in (for logging).
        stage: &'static str,
        /// Elapsed time in milliseconds when the deadline was hit.
        elapsed_ms: u64,
        /// Human-readable detail.
        detail: String,
    },

    /// A required model is not loaded or failed to load. Fatal at startup,
    /// otherwise propagated to the caller.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// An audio encoding was requested that the codec does not support.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// The back-end duplex channel has closed.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// A sub-session handshake (`set_mode` / `mode_ready`) did not complete.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// An operation could not proceed because a resource is at capacity
    /// (e.g. send would block past `send_timeout`).
    #[error("busy: {0}")]
    Busy(String),

    /// A correctness invariant was violated (double-clear rejected, two
    /// concurrent replies attempted, etc). Never silently ignored — the
    /// call is terminated when this is observed.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The caller hung up or the telephony leg is gone.
    #[error("caller gone: {0}")]
    CallerGone(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SpeechError>;
