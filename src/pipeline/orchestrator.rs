//! Pipeline orchestrator and call lifecycle (C6 + C8).
//!
//! One [`Orchestrator`] is shared across every call on a host. Each call gets
//! its own background task (`run_call`) that opens the STT/LLM/TTS
//! sub-sessions for that `call_id`, speaks the greeting, then loops:
//! transcript in, reply out, subject to the gating token and barge-in flag
//! owned by [`TurnCoordinator`]. `on_caller_audio` is called directly by the
//! telephony integration on the call's own task, so it never blocks the
//! per-call loop; it only forwards to STT and feeds the barge-in signals.

use crate::audio::codec::{self, Encoding};
use crate::call::{CallSession, PipelineDescriptor, SessionStore};
use crate::config::SpeechConfig;
use crate::llm::{assemble_context, is_duplicate_turn, normalize_text, LlmStage};
use crate::pipeline::messages::PlaybackChunk;
use crate::pipeline::turn::TurnCoordinator;
use crate::session::SharedChannel;
use crate::stt::{AudioFormat, SttStage};
use crate::tts::TtsStage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The telephony call-control collaborator the orchestrator drives: inbound
/// call events reach it through `on_call_answered` / `on_caller_audio` /
/// `on_call_ended`; it drives the PBX channel back through these three
/// outbound methods. Implementations bridge to Asterisk/FreePBX (AGI, ARI,
/// ...) or a test double; the orchestrator calls only this trait.
#[async_trait]
pub trait CallControl: Send + Sync + 'static {
    /// Play one synthesised reply, already split into playback-sized chunks
    /// by [`crate::audio::codec::chunk`]. Best-effort: implementations log
    /// and drop rather than fail a call over a playback error.
    async fn play(&self, call_id: &str, chunks: Vec<PlaybackChunk>);
    /// Stop whatever is currently playing — issued on a confirmed barge-in.
    async fn truncate_playback(&self, call_id: &str);
    /// Redirect the call to another dialplan extension/context (e.g. a
    /// human-transfer request). The core never calls this itself; it exists
    /// so a transfer tool built on top of the pipeline has somewhere to go.
    async fn redirect(&self, call_id: &str, dialplan_target: &str);
}

struct CallRuntime {
    stt: Arc<SttStage>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Drives every call's STT → LLM → TTS turn cycle and owns sub-session
/// lifecycle. Cloning shares the same session store, back-end channel, and
/// in-flight call runtimes.
pub struct Orchestrator<C: CallControl> {
    sessions: SessionStore,
    channel: SharedChannel,
    config: SpeechConfig,
    turn: Arc<TurnCoordinator>,
    call_control: Arc<C>,
    runtimes: Arc<Mutex<HashMap<String, CallRuntime>>>,
}

impl<C: CallControl> Clone for Orchestrator<C> {
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
            channel: self.channel.clone(),
            config: self.config.clone(),
            turn: Arc::clone(&self.turn),
            call_control: Arc::clone(&self.call_control),
            runtimes: Arc::clone(&self.runtimes),
        }
    }
}

impl<C: CallControl> Orchestrator<C> {
    pub fn new(config: SpeechConfig, channel: SharedChannel, call_control: Arc<C>) -> Self {
        let sessions = SessionStore::new();
        let turn = Arc::new(TurnCoordinator::new(sessions.clone(), config.coordinator.clone()));
        Self {
            sessions,
            channel,
            config,
            turn,
            call_control,
            runtimes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// `on_call_answered`: register the call, spawn its per-call task (opens
    /// sub-sessions lazily, speaks the greeting, then runs the turn loop).
    pub async fn on_call_answered(&self, call_id: String, pipeline: PipelineDescriptor) {
        self.sessions.upsert_call(CallSession::new(call_id.clone(), pipeline)).await;

        let stt = match SttStage::start_stream(self.channel.clone(), &call_id).await {
            Ok(stage) => Arc::new(stage),
            Err(e) => {
                warn!(call_id, "failed to open stt sub-session: {e}");
                self.sessions.remove_call(&call_id).await;
                return;
            }
        };

        let cancel = CancellationToken::new();
        let orchestrator = self.clone();
        let task_call_id = call_id.clone();
        let task_stt = Arc::clone(&stt);
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            orchestrator.run_call(task_call_id, task_stt, task_cancel).await;
        });

        self.runtimes.lock().await.insert(call_id, CallRuntime { stt, cancel, task });
    }

    /// `on_caller_audio`: forward one inbound frame. Per §4.6, caller audio
    /// always reaches STT regardless of gating — only whether a resulting
    /// final transcript is *acted on* depends on the gate — so the barge-in
    /// heuristics in [`TurnCoordinator`] have partials and RMS to judge from
    /// even while the agent holds the floor.
    pub async fn on_caller_audio(&self, call_id: &str, bytes: &[u8], fmt: AudioFormat) {
        self.sessions.touch_caller_audio(call_id).await;

        let runtime = {
            let runtimes = self.runtimes.lock().await;
            match runtimes.get(call_id) {
                Some(r) => Arc::clone(&r.stt),
                None => return,
            }
        };

        let pcm16 = match fmt {
            AudioFormat::Pcm16_16k | AudioFormat::Pcm16_8k => codec::bytes_to_pcm16(bytes),
            AudioFormat::Mulaw8k => codec::mulaw_to_pcm16(bytes),
        };
        let sample_rms = codec::rms(&pcm16);
        self.turn.on_caller_rms(call_id, sample_rms).await;

        if let Err(e) = runtime.send_audio(bytes, fmt).await {
            warn!(call_id, "failed to forward caller audio to stt: {e}");
        }

        let partial = runtime.last_partial().await;
        if !partial.is_empty() {
            self.turn.on_caller_partial(call_id, &partial).await;
        }
    }

    /// `on_call_ended`: cancel the call's task and release its sub-sessions,
    /// bounded by `cleanup_deadline_sec` so a wedged stage can never hang
    /// call teardown indefinitely.
    pub async fn on_call_ended(&self, call_id: &str) {
        let runtime = self.runtimes.lock().await.remove(call_id);
        self.turn.forget_call(call_id);
        if let Some(runtime) = runtime {
            runtime.cancel.cancel();
            let deadline = Duration::from_secs(self.config.coordinator.cleanup_deadline_sec);
            if tokio::time::timeout(deadline, runtime.task).await.is_err() {
                warn!(call_id, "call task did not finish within cleanup deadline");
            }
        }
        self.sessions.remove_call(call_id).await;
    }

    async fn run_call(&self, call_id: String, stt: Arc<SttStage>, cancel: CancellationToken) {
        let tts = match TtsStage::start(self.channel.clone(), &call_id).await {
            Ok(stage) => stage,
            Err(e) => {
                warn!(call_id, "failed to open tts sub-session: {e}");
                return;
            }
        };

        self.speak(&call_id, &tts, &self.config.pipeline.greeting_text).await;

        let llm = match LlmStage::start(self.channel.clone(), &call_id).await {
            Ok(stage) => stage,
            Err(e) => {
                warn!(call_id, "failed to open llm sub-session: {e}");
                return;
            }
        };

        loop {
            let final_text = tokio::select! {
                _ = cancel.cancelled() => break,
                result = stt.iter_results() => result,
            };
            let Some(final_text) = final_text else {
                info!(call_id, "stt sub-session closed, ending call turn loop");
                break;
            };
            if final_text.trim().is_empty() {
                continue;
            }

            let gated = self.turn.is_gated(&call_id).await;
            let barged = self.turn.take_barge(&call_id).await;

            if gated && !barged {
                // Agent has the floor and the caller hasn't earned an
                // interrupt yet: per-invariant, never queue a second reply.
                continue;
            }

            if gated && barged {
                self.call_control.truncate_playback(&call_id).await;
                if let Some(stream_id) = self.sessions.snapshot(&call_id).await.and_then(|s| s.gating_token.current()) {
                    self.turn.on_tts_end(&call_id, stream_id).await;
                }
            }

            if !self.sessions.try_begin_reply(&call_id).await {
                continue;
            }
            self.handle_turn(&call_id, &llm, &tts, &final_text).await;
            self.sessions.end_reply(&call_id).await;
        }

        llm.stop().await;
        tts.stop().await;
        stt.close().await;
    }

    async fn handle_turn(&self, call_id: &str, llm: &LlmStage, tts: &TtsStage, final_text: &str) {
        let Some(session) = self.sessions.snapshot(call_id).await else {
            return;
        };
        if is_duplicate_turn(final_text, session.history.last_user_turn_norm.as_deref()) {
            info!(call_id, "duplicate transcript suppressed, skipping reply");
            return;
        }

        let max_prompt_tokens = self.config.llm_max_prompt_tokens();
        let context = assemble_context(&self.config.llm.system_prompt, &session.history.user_turns, max_prompt_tokens);

        let reply = match llm.request_reply(final_text, &context).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(call_id, "llm request failed: {e}");
                self.config.llm.fallback_reply.clone()
            }
        };

        let mut user_turns = session.history.user_turns.clone();
        user_turns.push(final_text.to_owned());
        self.sessions
            .set_history(
                call_id,
                crate::call::ConversationHistory {
                    user_turns,
                    last_user_turn_norm: Some(normalize_text(final_text)),
                },
            )
            .await;

        self.speak(call_id, tts, &reply).await;
    }

    async fn speak(&self, call_id: &str, tts: &TtsStage, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let mulaw = match tts.synthesize(text).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(call_id, "tts synthesis failed, skipping playback: {e}");
                return;
            }
        };
        if mulaw.is_empty() {
            return;
        }

        let Some(stream_id) = self.turn.on_tts_start(call_id).await else {
            warn!(call_id, "unknown call, dropping synthesised reply");
            return;
        };

        let chunk_ms = self.config.audio.chunk_ms;
        let rate = self.config.audio.telephony_rate_hz;
        let chunks = match codec::chunk(&mulaw, Encoding::Mulaw, rate, chunk_ms) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(call_id, "failed to chunk synthesised audio: {e}");
                Vec::new()
            }
        };
        let last_index = chunks.len().saturating_sub(1);
        let playback_chunks: Vec<PlaybackChunk> = chunks
            .into_iter()
            .enumerate()
            .map(|(i, bytes)| PlaybackChunk {
                bytes,
                sample_rate_hz: rate,
                is_final: i == last_index,
            })
            .collect();

        self.sessions.touch_agent_audio(call_id).await;

        // `play` only hands chunks to the telephony leg; the audio itself
        // keeps playing out there for roughly `chunk_ms * chunks.len()`. Hold
        // the gate for that long (rather than clearing it the instant `play`
        // returns) so a barge-in signalled by `on_caller_audio` during actual
        // playback has a chance to be observed before the turn loop resumes.
        let total_playback = Duration::from_millis(u64::from(chunk_ms) * playback_chunks.len() as u64);
        let play_call_id = call_id.to_owned();
        let call_control = Arc::clone(&self.call_control);
        let play_task = tokio::spawn(async move {
            call_control.play(&play_call_id, playback_chunks).await;
        });

        let poll_interval = Duration::from_millis(50);
        let mut elapsed = Duration::ZERO;
        let mut barged = false;
        while elapsed < total_playback {
            if self.turn.take_barge(call_id).await {
                barged = true;
                break;
            }
            let step = poll_interval.min(total_playback - elapsed);
            tokio::time::sleep(step).await;
            elapsed += step;
        }
        if !barged {
            barged = self.turn.take_barge(call_id).await;
        }

        if barged {
            self.call_control.truncate_playback(call_id).await;
        }
        let _ = play_task.await;
        self.turn.on_tts_end(call_id, stream_id).await;
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn turn_coordinator(&self) -> &Arc<TurnCoordinator> {
        &self.turn
    }

    pub fn call_control(&self) -> &Arc<C> {
        &self.call_control
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub(crate) struct RecordingCallControl {
        pub played: Mutex<Vec<(String, usize)>>,
        pub truncated: AtomicUsize,
    }

    #[async_trait]
    impl CallControl for RecordingCallControl {
        async fn play(&self, call_id: &str, chunks: Vec<PlaybackChunk>) {
            self.played.lock().await.push((call_id.to_owned(), chunks.len()));
        }
        async fn truncate_playback(&self, _call_id: &str) {
            self.truncated.fetch_add(1, Ordering::SeqCst);
        }
        async fn redirect(&self, _call_id: &str, _dialplan_target: &str) {}
    }

    #[test]
    fn call_control_trait_is_object_safe_over_arc() {
        fn assert_object_safe<T: CallControl>() {}
        assert_object_safe::<RecordingCallControl>();
    }
}
