//! Text-to-speech stage (C5): a thin wire client over a `tts` sub-session.
//!
//! The synthesiser itself lives server-side (see [`crate::backend`] and
//! [`kokoro`]); this module sends a `tts_request`, collects the resulting
//! `tts_audio` binary chunks (already downsampled and mulaw-encoded for the
//! telephony leg), and returns them once the server's `tts_response`
//! completion envelope arrives.

pub mod kokoro;

use crate::error::{Result, SpeechError};
use crate::session::{ComponentKind, Envelope, Event, Frame, SharedChannel, SubSessionHandle};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// `start(call_id, options)` / `synthesize` / `stop` (C5's public contract).
pub struct TtsStage {
    channel: SharedChannel,
    handle: Arc<SubSessionHandle>,
}

impl TtsStage {
    pub async fn start(channel: SharedChannel, call_id: &str) -> Result<Self> {
        let handle = Arc::new(
            channel
                .open_sub_session(call_id, ComponentKind::Tts, Value::Null)
                .await?,
        );
        Ok(Self { channel, handle })
    }

    /// Synthesise `text`, returning one logical mulaw 8 kHz audio segment.
    /// The server delivers it as either a `tts_audio` metadata envelope
    /// followed by a binary frame, or a single base64 `tts_response`
    /// envelope; both collapse to one [`Event::TtsAudio`] here. Splitting the
    /// segment into playback-sized chunks is the orchestrator's job via
    /// [`crate::audio::codec::chunk`].
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let request_id = Uuid::new_v4().to_string();
        let envelope = Envelope::new("tts_request", self.handle.call_id())
            .with_request_id(request_id)
            .with_field("text", text);
        self.channel
            .send(&self.handle, Frame::Json(envelope))
            .await?;

        loop {
            match self.handle.recv_event().await {
                Some(Event::TtsMeta { .. }) => {}
                Some(Event::TtsAudio { bytes }) => return Ok(bytes.to_vec()),
                Some(Event::Error { message }) => return Err(SpeechError::Tts(message)),
                Some(Event::Closed) | None => {
                    return Err(SpeechError::ChannelClosed(
                        "tts sub-session closed before synthesis completed".into(),
                    ));
                }
                Some(_) => {}
            }
        }
    }

    /// Cancel any in-flight synthesis and close the sub-session, used when a
    /// barge-in interrupts agent speech.
    pub async fn stop(self) {
        self.channel.close_sub_session(&self.handle).await;
    }
}

#[cfg(test)]
mod tests {
    // `synthesize` needs a live sub-session; covered by the pipeline's
    // end-to-end scenario tests rather than unit tests here.
}
