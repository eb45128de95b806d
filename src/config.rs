//! Configuration types for the telephony voice-agent pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the voice-agent core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Audio rates and chunking shared by the codec and stages.
    pub audio: AudioConfig,
    /// Back-end session multiplexer (C2) settings.
    pub session: SessionConfig,
    /// Speech-to-text settings (C3).
    pub stt: SttConfig,
    /// Language model settings (C4).
    pub llm: LlmConfig,
    /// Text-to-speech settings (C5).
    pub tts: TtsConfig,
    /// Turn/barge-in coordinator settings (C7).
    pub coordinator: CoordinatorConfig,
    /// Per-call pipeline orchestrator settings (C6/C8).
    pub pipeline: PipelineConfig,
    /// Model management settings (download/cache).
    pub models: ModelConfig,
    /// Voice-activity detection settings used for server-side end-of-speech.
    pub vad: VadConfig,
}

/// Audio rate and chunking configuration.
///
/// These are the four rates named in the data model: telephony audio is
/// 8 kHz μ-law, STT input is 16 kHz PCM16, and TTS engines commonly
/// synthesise at 22050 or 24000 Hz before being converted back down to
/// 8 kHz μ-law for playback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Telephony leg sample rate in Hz (μ-law).
    pub telephony_rate_hz: u32,
    /// STT input sample rate in Hz (PCM16).
    pub stt_rate_hz: u32,
    /// Native TTS synthesis sample rate in Hz, before down-conversion.
    pub tts_synth_rate_hz: u32,
    /// Chunk size in milliseconds used by `chunk()` for outbound playback frames.
    pub chunk_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            telephony_rate_hz: 8_000,
            stt_rate_hz: 16_000,
            tts_synth_rate_hz: 22_050,
            chunk_ms: 40,
        }
    }
}

/// Back-end session multiplexer (C2) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds to wait for `mode_ready` before proceeding unconfirmed.
    pub handshake_timeout_sec: u64,
    /// Milliseconds a `send` may block before surfacing `Busy`.
    pub send_timeout_ms: u64,
    /// Seconds to wait for a response to a request before giving up.
    pub response_timeout_sec: u64,
    /// Bound on each sub-session's inbound event queue.
    pub inbound_queue_size: usize,
    /// Initial reconnect backoff in milliseconds.
    pub reconnect_backoff_initial_ms: u64,
    /// Maximum reconnect backoff in milliseconds.
    pub reconnect_backoff_max_ms: u64,
    /// Maximum number of reconnect attempts before giving up.
    pub reconnect_max_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_sec: 5,
            send_timeout_ms: 2_000,
            response_timeout_sec: 5,
            inbound_queue_size: 64,
            reconnect_backoff_initial_ms: 200,
            reconnect_backoff_max_ms: 5_000,
            reconnect_max_attempts: 10,
        }
    }
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// HuggingFace model ID for the STT engine.
    pub model_id: String,
    /// Milliseconds of silence before the idle finaliser promotes a final.
    pub idle_ms: u64,
    /// Window in milliseconds within which two normalised-identical finals
    /// are treated as duplicates and suppressed.
    pub duplicate_suppress_window_ms: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            model_id: "istupakov/parakeet-tdt-0.6b-v3-onnx".to_owned(),
            idle_ms: 3_000,
            duplicate_suppress_window_ms: 500,
        }
    }
}

/// Language model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// HuggingFace model repo ID containing the GGUF file.
    pub model_id: String,
    /// GGUF filename within the model repo.
    pub gguf_file: String,
    /// HuggingFace repo ID for the tokenizer. Empty uses the bundled one.
    pub tokenizer_id: String,
    /// Context window size in tokens.
    pub context_size_tokens: usize,
    /// Maximum tokens to generate per reply.
    pub max_tokens: usize,
    /// Sampling temperature.
    pub temperature: f64,
    /// Top-p (nucleus) sampling threshold.
    pub top_p: f64,
    /// Repeat penalty.
    pub repeat_penalty: f32,
    /// Stop sequences that end generation.
    pub stop_tokens: Vec<String>,
    /// Fixed system prompt prefixed to every prompt.
    pub system_prompt: String,
    /// Deadline in seconds for a single inference call before falling back.
    pub infer_timeout_sec: u64,
    /// Maximum number of prior user turns retained in rolling history before trimming.
    pub max_history_turns: usize,
    /// `max_tokens` used for the one-shot startup warm-up inference.
    pub warmup_max_tokens: usize,
    /// Interval in seconds for the warm-up heartbeat log while it is outstanding.
    pub warmup_heartbeat_interval_sec: u64,
    /// Fixed reply returned when inference times out.
    pub fallback_reply: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model_id: "unsloth/Qwen3-4B-Instruct-2507-GGUF".to_owned(),
            gguf_file: "Qwen3-4B-Instruct-2507-Q4_K_M.gguf".to_owned(),
            tokenizer_id: "Qwen/Qwen3-4B-Instruct-2507".to_owned(),
            context_size_tokens: 768,
            max_tokens: 48,
            temperature: 0.2,
            top_p: 0.85,
            repeat_penalty: 1.05,
            stop_tokens: vec![
                "<|user|>".to_owned(),
                "<|assistant|>".to_owned(),
                "<|end|>".to_owned(),
            ],
            system_prompt: "You are a concise, helpful phone assistant. Keep replies to one or \
                two short sentences suitable for being spoken aloud."
                .to_owned(),
            infer_timeout_sec: 20,
            max_history_turns: 12,
            warmup_max_tokens: 32,
            warmup_heartbeat_interval_sec: 5,
            fallback_reply: "I'm here to help you. Could you please repeat that?".to_owned(),
        }
    }
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Voice style/profile name passed to the synthesiser.
    pub voice: String,
    /// Playback chunk size in milliseconds; chunks never split a sample.
    pub chunk_size_ms: u32,
    /// ONNX model variant, where applicable (e.g. "q8", "fp16").
    pub model_variant: String,
    /// Playback speed multiplier passed to the synthesiser.
    pub speed: f32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            voice: "default".to_owned(),
            chunk_size_ms: 40,
            model_variant: "q8".to_owned(),
            speed: 1.0,
        }
    }
}

/// Voice-activity detection configuration, used server-side to detect a
/// caller's natural end-of-speech (recognizer-final) independent of
/// the STT stage's idle finaliser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS energy threshold (in `f32` units, caller audio is normalised to
    /// [-1.0, 1.0]) above which a chunk is classified as speech.
    pub threshold: f32,
    /// Milliseconds of continuous silence that ends an in-progress utterance.
    pub min_silence_duration_ms: u32,
    /// Milliseconds of pre-roll audio retained so utterance onsets aren't clipped.
    pub speech_pad_ms: u32,
    /// Minimum utterance duration in milliseconds to be treated as real speech.
    pub min_speech_duration_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.02,
            min_silence_duration_ms: 600,
            speech_pad_ms: 200,
            min_speech_duration_ms: 150,
        }
    }
}

/// Turn/barge-in coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Minimum non-whitespace characters in a caller partial to flag barge-in.
    pub barge_min_chars: usize,
    /// RMS threshold (16-bit units) on the caller stream that flags barge-in.
    pub barge_rms_threshold: f32,
    /// Minimum continuous duration in milliseconds above `barge_rms_threshold`
    /// before a barge-in is confirmed from energy alone.
    pub barge_min_ms: u64,
    /// Deadline in seconds for per-call cleanup to complete before resources
    /// are force-released.
    pub cleanup_deadline_sec: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            barge_min_chars: 3,
            barge_rms_threshold: 800.0,
            barge_min_ms: 250,
            cleanup_deadline_sec: 5,
        }
    }
}

/// Per-call pipeline orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Greeting text synthesised and played when a call is answered.
    pub greeting_text: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            greeting_text: "Hello, how can I help you today?".to_owned(),
        }
    }
}

/// Model management configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Directory for caching downloaded models.
    pub cache_dir: PathBuf,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("VOICE_AGENT_CACHE_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::cache_dir()
        .map(|d| d.join("fae-voice-agent"))
        .unwrap_or_else(|| PathBuf::from("/tmp/fae-voice-agent-cache"))
}

impl SpeechConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::SpeechError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::SpeechError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path, platform-appropriate
    /// (`~/.config/fae-voice-agent/config.toml` on Linux).
    ///
    /// Override with the `VOICE_AGENT_CONFIG_DIR` environment variable.
    pub fn default_config_path() -> PathBuf {
        if let Some(override_dir) = std::env::var_os("VOICE_AGENT_CONFIG_DIR") {
            return PathBuf::from(override_dir).join("config.toml");
        }
        dirs::config_dir()
            .map(|d| d.join("fae-voice-agent").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("/tmp/fae-voice-agent-config/config.toml"))
    }

    /// Computes the maximum prompt token budget for the LLM stage:
    /// `context − max_reply_tokens − 64`.
    pub fn llm_max_prompt_tokens(&self) -> usize {
        self.llm
            .context_size_tokens
            .saturating_sub(self.llm.max_tokens)
            .saturating_sub(64)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_is_valid() {
        let config = SpeechConfig::default();
        assert!(config.audio.telephony_rate_hz > 0);
        assert!(config.audio.stt_rate_hz > 0);
        assert!(!config.stt.model_id.is_empty());
        assert!(config.llm.max_tokens > 0);
        assert!(config.llm.context_size_tokens > 0);
        assert!(config.llm.temperature >= 0.0);
        assert!(config.llm.top_p >= 0.0 && config.llm.top_p <= 1.0);
        assert!(config.tts.chunk_size_ms > 0);
        assert!(!config.llm.fallback_reply.is_empty());
    }

    #[test]
    fn save_and_load_round_trip() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("config.toml");

        let mut config = SpeechConfig::default();
        config.audio.stt_rate_hz = 16_000;
        config.llm.temperature = 0.5;
        config.pipeline.greeting_text = "Hi there".to_string();

        assert!(config.save_to_file(&path).is_ok());
        assert!(path.exists());

        let loaded = SpeechConfig::from_file(&path).expect("load should succeed");
        assert_eq!(loaded.audio.stt_rate_hz, 16_000);
        assert!((loaded.llm.temperature - 0.5).abs() < f64::EPSILON);
        assert_eq!(loaded.pipeline.greeting_text, "Hi there");
    }

    #[test]
    fn from_file_nonexistent_returns_error() {
        let result = SpeechConfig::from_file(std::path::Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml {{{").ok();

        let result = SpeechConfig::from_file(&path);
        assert!(result.is_err());
    }

    #[test]
    fn default_config_path_ends_with_config_toml() {
        let path = SpeechConfig::default_config_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.ends_with("config.toml"));
    }

    #[test]
    fn default_config_path_override_via_env() {
        let key = "VOICE_AGENT_CONFIG_DIR";
        let original = std::env::var_os(key);

        // SAFETY: tests run single-threaded per module.
        unsafe { std::env::set_var(key, "/custom/config") };
        let path = SpeechConfig::default_config_path();
        assert_eq!(path, PathBuf::from("/custom/config/config.toml"));

        match original {
            Some(val) => unsafe { std::env::set_var(key, val) },
            None => unsafe { std::env::remove_var(key) },
        }
    }

    #[test]
    fn default_cache_dir_override_via_env() {
        let key = "VOICE_AGENT_CACHE_DIR";
        let original = std::env::var_os(key);

        unsafe { std::env::set_var(key, "/custom/cache") };
        let config = ModelConfig::default();
        assert_eq!(config.cache_dir, PathBuf::from("/custom/cache"));

        match original {
            Some(val) => unsafe { std::env::set_var(key, val) },
            None => unsafe { std::env::remove_var(key) },
        }
    }

    #[test]
    fn llm_max_prompt_tokens_matches_invariant() {
        let config = SpeechConfig::default();
        assert_eq!(
            config.llm_max_prompt_tokens(),
            config.llm.context_size_tokens - config.llm.max_tokens - 64
        );
    }

    #[test]
    fn llm_max_prompt_tokens_saturates_for_tiny_context() {
        let mut config = SpeechConfig::default();
        config.llm.context_size_tokens = 10;
        config.llm.max_tokens = 48;
        assert_eq!(config.llm_max_prompt_tokens(), 1);
    }

    #[test]
    fn config_serializes_to_toml() {
        let config = SpeechConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        assert!(toml_str.contains("telephony_rate_hz"));
        assert!(toml_str.contains("infer_timeout_sec"));
    }
}
