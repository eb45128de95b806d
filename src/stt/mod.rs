//! Speech-to-text stage (C3): a thin wire client over a `stt` sub-session.
//!
//! The engine that actually recognises speech lives server-side (see
//! [`crate::backend`] and [`engine`]); this module only converts caller audio
//! to the wire format, forwards it, and demultiplexes partials (used by the
//! turn coordinator for barge-in) from finals (placed on the result queue).

pub mod engine;

use crate::error::Result;
use crate::session::{ComponentKind, Envelope, Event, Frame, SharedChannel, SubSessionHandle};
use base64::Engine as _;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

/// The format caller audio arrives in before conversion to the wire's PCM16
/// 16 kHz requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Pcm16_16k,
    Pcm16_8k,
    Mulaw8k,
}

/// `start_stream(call_id, options)` / `send_audio` / `iter_results` /
/// `stop_stream` (C3's public contract).
pub struct SttStage {
    channel: SharedChannel,
    handle: Arc<SubSessionHandle>,
    results_rx: Mutex<mpsc::Receiver<Option<String>>>,
    last_partial: Arc<Mutex<String>>,
    recv_task: JoinHandle<()>,
}

impl SttStage {
    /// `start_stream(call_id, options)`.
    pub async fn start_stream(channel: SharedChannel, call_id: &str) -> Result<Self> {
        let handle = Arc::new(
            channel
                .open_sub_session(call_id, ComponentKind::Stt, Value::Null)
                .await?,
        );
        let (results_tx, results_rx) = mpsc::channel(8);
        let last_partial = Arc::new(Mutex::new(String::new()));

        let task_handle = Arc::clone(&handle);
        let task_last_partial = Arc::clone(&last_partial);
        let recv_task = tokio::spawn(async move {
            loop {
                match task_handle.recv_event().await {
                    Some(Event::PartialStt { text }) => {
                        *task_last_partial.lock().await = text;
                    }
                    Some(Event::FinalStt { text }) => {
                        if results_tx.send(Some(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Event::Error { message }) => {
                        warn!(call_id = task_handle.call_id(), message, "stt sub-session error");
                        let _ = results_tx.send(None).await;
                        break;
                    }
                    Some(Event::Closed) | None => {
                        let _ = results_tx.send(None).await;
                        break;
                    }
                    Some(_) => {}
                }
            }
        });

        Ok(Self {
            channel,
            handle,
            results_rx: Mutex::new(results_rx),
            last_partial,
            recv_task,
        })
    }

    /// `send_audio(call_id, bytes, fmt)`. Converts to 16 kHz PCM16 and
    /// base64-wraps it as `{type:"audio", mode:"stt", rate:16000, data:...}`.
    /// Empty input is a no-op.
    pub async fn send_audio(&self, bytes: &[u8], fmt: AudioFormat) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let pcm16_16k = to_pcm16_16k(bytes, fmt);
        let data = base64::engine::general_purpose::STANDARD.encode(&pcm16_16k);
        let envelope = Envelope::new("audio", self.handle.call_id())
            .with_mode("stt")
            .with_field("rate", 16000)
            .with_field("format", "pcm16le")
            .with_field("data", data);
        self.channel.send(&self.handle, Frame::Json(envelope)).await
    }

    /// `iter_results(call_id)`: yields final transcript strings (possibly
    /// empty) until the sentinel, after which it always returns `None`.
    pub async fn iter_results(&self) -> Option<String> {
        let mut rx = self.results_rx.lock().await;
        rx.recv().await.flatten()
    }

    /// The most recent unconfirmed partial text, used by the turn coordinator
    /// to evaluate the `barge_min_chars` threshold. Never placed on the
    /// result queue itself.
    pub async fn last_partial(&self) -> String {
        self.last_partial.lock().await.clone()
    }

    /// `stop_stream(call_id)`: cancels the receive loop and drains the queue
    /// with a sentinel via [`SharedChannel::close_sub_session`].
    pub async fn stop_stream(self) {
        self.channel.close_sub_session(&self.handle).await;
        self.recv_task.abort();
    }

    /// Same effect as [`Self::stop_stream`] but through a shared reference,
    /// for the common case where the stage is held behind an `Arc` (the
    /// orchestrator keeps one alive for both the per-call turn loop and
    /// `on_caller_audio`, neither of which owns it outright). The closed
    /// sub-session delivers `Event::Closed`, which ends the receive loop
    /// without needing to abort it.
    pub async fn close(&self) {
        self.channel.close_sub_session(&self.handle).await;
    }
}

fn to_pcm16_16k(bytes: &[u8], fmt: AudioFormat) -> Vec<u8> {
    use crate::audio::codec::{bytes_to_pcm16, mulaw_to_pcm16, pcm16_to_bytes, resample};
    match fmt {
        AudioFormat::Pcm16_16k => bytes.to_vec(),
        AudioFormat::Pcm16_8k => {
            let samples = bytes_to_pcm16(bytes);
            pcm16_to_bytes(&resample(&samples, 8_000, 16_000))
        }
        AudioFormat::Mulaw8k => {
            let samples = mulaw_to_pcm16(bytes);
            pcm16_to_bytes(&resample(&samples, 8_000, 16_000))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mulaw8k_converts_and_upsamples_to_16k_pcm16() {
        let mulaw = vec![0xFFu8; 80]; // 10ms at 8kHz
        let pcm16_16k = to_pcm16_16k(&mulaw, AudioFormat::Mulaw8k);
        // 10ms @ 16kHz, 2 bytes/sample.
        assert_eq!(pcm16_16k.len(), 160 * 2);
    }

    #[test]
    fn pcm16_16k_passthrough_is_unchanged() {
        let bytes = vec![1u8, 2, 3, 4];
        assert_eq!(to_pcm16_16k(&bytes, AudioFormat::Pcm16_16k), bytes);
    }

    #[test]
    fn empty_input_converts_to_empty_output() {
        assert!(to_pcm16_16k(&[], AudioFormat::Pcm16_8k).is_empty());
    }
}
