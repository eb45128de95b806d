//! Parakeet TDT recognition engine, owned exclusively by the in-process AI
//! server. The engine transcribes a whole PCM16 buffer at a time; the server
//! realises the streaming contract on top of it by re-running transcription
//! over the growing per-utterance buffer.

use crate::config::{ModelConfig, SttConfig};
use crate::error::{Result, SpeechError};
use crate::models::ModelManager;
use parakeet_rs::{ParakeetTDT, TimestampMode, Transcriber};
use std::time::Instant;
use tracing::info;

const ENCODER_ONNX: &str = "encoder-model.onnx";
const ENCODER_DATA: &str = "encoder-model.onnx.data";
const DECODER_ONNX: &str = "decoder_joint-model.onnx";
const VOCAB_TXT: &str = "vocab.txt";

/// Batch-oriented speech-to-text engine (Parakeet TDT, multilingual).
pub struct SttEngine {
    model: Option<ParakeetTDT>,
    model_id: String,
    model_manager: ModelManager,
}

impl SttEngine {
    /// Models are loaded lazily on first use via [`ModelManager`].
    pub fn new(config: &SttConfig, model_config: &ModelConfig) -> Result<Self> {
        let model_manager = ModelManager::new(model_config)?;
        info!("STT configured with model: {}", config.model_id);
        Ok(Self {
            model: None,
            model_id: config.model_id.clone(),
            model_manager,
        })
    }

    /// Transcribe raw 16 kHz PCM16 samples accumulated for one utterance.
    pub fn transcribe_pcm16(&mut self, samples: &[i16], sample_rate_hz: u32) -> Result<String> {
        if self.model.is_none() {
            self.initialize()?;
        }

        let transcribe_start = Instant::now();
        let floats: Vec<f32> = samples.iter().map(|&s| s as f32 / 32768.0).collect();
        let rms = if floats.is_empty() {
            0.0
        } else {
            (floats.iter().map(|s| s * s).sum::<f32>() / floats.len() as f32).sqrt()
        };
        info!(
            "transcribing {:.1}s of audio (rms={rms:.6})",
            floats.len() as f32 / sample_rate_hz as f32
        );

        let model = self
            .model
            .as_mut()
            .ok_or_else(|| SpeechError::ModelUnavailable("STT model not initialized".into()))?;

        let result = model
            .transcribe_samples(floats, sample_rate_hz, 1, Some(TimestampMode::Sentences))
            .map_err(|e| SpeechError::Stt(format!("transcription failed: {e}")))?;

        info!(
            "transcribed in {:.0}ms: \"{}\"",
            transcribe_start.elapsed().as_millis(),
            result.text
        );
        Ok(result.text)
    }

    /// Eagerly load the model (e.g. at process start-up).
    pub fn ensure_loaded(&mut self) -> Result<()> {
        if self.model.is_none() {
            self.initialize()?;
        }
        Ok(())
    }

    fn initialize(&mut self) -> Result<()> {
        info!("loading STT model: {}", self.model_id);
        for filename in [ENCODER_ONNX, ENCODER_DATA, DECODER_ONNX, VOCAB_TXT] {
            self.model_manager.get_model_path(&self.model_id, filename)?;
        }
        let repo_dir = self.model_manager.get_repo_dir(&self.model_id)?;
        let model = ParakeetTDT::from_pretrained(&repo_dir, None)
            .map_err(|e| SpeechError::ModelUnavailable(format!("failed to load Parakeet TDT: {e}")))?;
        info!("STT model loaded successfully");
        self.model = Some(model);
        Ok(())
    }
}
