//! The in-process AI server: owns every model engine and all server-side
//! per-call state (STT buffer, duplicate suppression, the single-flight LLM
//! mutex). The STT buffer is promoted to a final transcript by whichever of
//! two independent triggers fires first: the VAD observing the caller's
//! natural end of speech (`recognizer-final`), or no new audio for `idle_ms`
//! (`idle-timeout`). [`spawn`] returns the client-facing ends of a duplex
//! [`crate::session::Frame`] channel; [`crate::session::SharedChannel::connect`]
//! is built around exactly this shape so the multiplexer never needs to know
//! whether it's talking to an in-process task or a real socket.

use crate::audio::codec::{bytes_to_pcm16, pcm16_to_mulaw, resample};
use crate::config::SpeechConfig;
use crate::llm::engine::{ChatTurn, LlmEngine};
use crate::pipeline::messages::AudioChunk;
use crate::session::{Envelope, Frame, ServerConnection};
use crate::stt::engine::SttEngine;
use crate::tts::kokoro::KokoroTts;
use crate::vad::SileroVad;
use bytes::Bytes;
use mistralrs::TextMessageRole;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Spawn the in-process AI server as a background task and return the
/// client-facing ends of its duplex channel. Intended as the `connector`
/// closure passed to [`crate::session::SharedChannel::connect`].
pub fn spawn(config: SpeechConfig) -> ServerConnection {
    let (client_to_server_tx, client_to_server_rx) = mpsc::channel(256);
    let (server_to_client_tx, server_to_client_rx) = mpsc::channel(256);

    tokio::spawn(run(config, client_to_server_rx, server_to_client_tx));

    ServerConnection {
        to_server: client_to_server_tx,
        from_server: server_to_client_rx,
    }
}

/// One pending idle-finaliser timer firing for `call_id`, tagged with the
/// buffer generation it was armed against so a timer superseded by newer
/// audio is a no-op rather than promoting a stale partial.
struct IdleFire {
    call_id: String,
    generation: u64,
    /// `"recognizer-final"` when the VAD detected the caller's natural end
    /// of speech, `"idle-timeout"` when no new audio arrived for `idle_ms`.
    /// Carried through only for logging; the finalisation logic itself is
    /// identical either way.
    reason: &'static str,
}

struct SttCallState {
    pcm_buffer: Vec<i16>,
    /// Shared with the spawned transcription task so it can record the
    /// latest partial without the main dispatch loop waiting on it.
    last_partial: Arc<Mutex<String>>,
    generation: u64,
    last_final_norm: Option<String>,
    last_final_at: Option<Instant>,
    /// Detects the caller's natural end of speech (`recognizer-final`) ahead
    /// of, and independent from, the idle-timeout finaliser.
    vad: SileroVad,
}

impl SttCallState {
    fn new(config: &SpeechConfig) -> Self {
        Self {
            pcm_buffer: Vec::new(),
            last_partial: Arc::new(Mutex::new(String::new())),
            generation: 0,
            last_final_norm: None,
            last_final_at: None,
            vad: SileroVad::new(&config.vad, config.audio.stt_rate_hz),
        }
    }
}

struct CallState {
    stt: SttCallState,
    llm_interrupt: Arc<AtomicBool>,
}

impl CallState {
    fn new(config: &SpeechConfig) -> Self {
        Self {
            stt: SttCallState::new(config),
            llm_interrupt: Arc::new(AtomicBool::new(false)),
        }
    }
}

async fn run(
    config: SpeechConfig,
    mut from_client: mpsc::Receiver<Frame>,
    to_client: mpsc::Sender<Frame>,
) {
    let stt_engine = match SttEngine::new(&config.stt, &config.models) {
        Ok(e) => Arc::new(Mutex::new(e)),
        Err(e) => {
            error!("in-process AI server: STT engine unavailable: {e}");
            return;
        }
    };
    let llm_engine = match LlmEngine::new(&config.llm).await {
        Ok(e) => Arc::new(e),
        Err(e) => {
            error!("in-process AI server: LLM engine unavailable: {e}");
            return;
        }
    };
    let tts_engine = match KokoroTts::new(&config.tts) {
        Ok(e) => Arc::new(Mutex::new(e)),
        Err(e) => {
            error!("in-process AI server: TTS engine unavailable: {e}");
            return;
        }
    };

    spawn_warmup_with_heartbeat(Arc::clone(&llm_engine), config.llm.warmup_heartbeat_interval_sec);

    // Serialises LLM calls process-wide: the model is not reentrant.
    let llm_single_flight = Arc::new(Mutex::new(()));

    let mut calls: HashMap<String, CallState> = HashMap::new();
    let (idle_tx, mut idle_rx) = mpsc::channel::<IdleFire>(64);

    loop {
        tokio::select! {
            frame = from_client.recv() => {
                let Some(frame) = frame else { break };
                match frame {
                    Frame::Json(envelope) => {
                        handle_envelope(
                            envelope,
                            &mut calls,
                            &config,
                            &stt_engine,
                            &llm_engine,
                            &llm_single_flight,
                            &tts_engine,
                            &idle_tx,
                            &to_client,
                        )
                        .await;
                    }
                    Frame::Binary(_) => {
                        warn!("in-process AI server received an unexpected inbound binary frame");
                    }
                }
            }
            Some(fire) = idle_rx.recv() => {
                finalize_if_current(&fire, &mut calls, &config, &to_client).await;
            }
        }
    }
    info!("in-process AI server shutting down: client channel closed");
}

#[allow(clippy::too_many_arguments)]
async fn handle_envelope(
    envelope: Envelope,
    calls: &mut HashMap<String, CallState>,
    config: &SpeechConfig,
    stt_engine: &Arc<Mutex<SttEngine>>,
    llm_engine: &Arc<LlmEngine>,
    llm_single_flight: &Arc<Mutex<()>>,
    tts_engine: &Arc<Mutex<KokoroTts>>,
    idle_tx: &mpsc::Sender<IdleFire>,
    to_client: &mpsc::Sender<Frame>,
) {
    let call_id = envelope.call_id.clone();
    match envelope.kind.as_str() {
        "set_mode" => {
            calls.entry(call_id.clone()).or_insert_with(|| CallState::new(config));
            let mode = envelope.mode.clone().unwrap_or_default();
            let reply = Envelope::new("mode_ready", call_id).with_mode(mode);
            let _ = to_client.send(Frame::Json(reply)).await;
        }
        "audio" if envelope.mode.as_deref() == Some("stt") => {
            handle_audio(envelope, calls, config, stt_engine, idle_tx, to_client).await;
        }
        "llm_request" => {
            let text = envelope.field_str("text").unwrap_or_default().to_owned();
            let context = envelope.field_str("context").unwrap_or_default().to_owned();
            let request_id = envelope.request_id.clone();
            let interrupt = calls
                .entry(call_id.clone())
                .or_insert_with(|| CallState::new(config))
                .llm_interrupt
                .clone();
            interrupt.store(false, Ordering::Relaxed);

            let llm_engine = Arc::clone(llm_engine);
            let llm_single_flight = Arc::clone(llm_single_flight);
            let to_client = to_client.clone();
            let system_prompt = config.llm.system_prompt.clone();
            tokio::spawn(async move {
                let turns = build_chat_turns(&system_prompt, &context, &text);
                let reply = {
                    let _guard = llm_single_flight.lock().await;
                    llm_engine.generate_with_timeout(&turns, interrupt).await
                };
                let mut reply_envelope = Envelope::new("llm_response", call_id).with_field("text", reply);
                if let Some(rid) = request_id {
                    reply_envelope = reply_envelope.with_request_id(rid);
                }
                let _ = to_client.send(Frame::Json(reply_envelope)).await;
            });
        }
        "tts_request" => {
            let text = envelope.field_str("text").unwrap_or_default().to_owned();
            let request_id = envelope.request_id.clone();
            let tts_engine = Arc::clone(tts_engine);
            let to_client = to_client.clone();
            let telephony_rate_hz = config.audio.telephony_rate_hz;
            tokio::spawn(async move {
                synthesize_and_send(&tts_engine, &call_id, request_id, &text, telephony_rate_hz, &to_client).await;
            });
        }
        "status" => {
            let payload = serde_json::json!({
                "calls_active": calls.len(),
            });
            let reply = Envelope::new("status_response", call_id).with_field("payload", payload);
            let _ = to_client.send(Frame::Json(reply)).await;
        }
        "reload_models" | "reload_llm" => {
            // Model hot-reload is out of scope for the in-process server's
            // first cut; acknowledge so callers don't block on a handshake
            // that will never arrive.
            let reply = Envelope::new(envelope.kind.clone(), call_id)
                .with_field("status", "ok");
            let _ = to_client.send(Frame::Json(reply)).await;
        }
        other => {
            warn!(kind = other, call_id = %call_id, "in-process AI server: unknown envelope type, skipping");
        }
    }
}

fn build_chat_turns(system_prompt: &str, context: &str, text: &str) -> Vec<ChatTurn> {
    let mut turns = vec![ChatTurn {
        role: TextMessageRole::System,
        content: system_prompt.to_owned(),
    }];
    if !context.is_empty() {
        turns.push(ChatTurn {
            role: TextMessageRole::User,
            content: format!("Earlier in this call:\n{context}"),
        });
        turns.push(ChatTurn {
            role: TextMessageRole::Assistant,
            content: "Understood.".to_owned(),
        });
    }
    turns.push(ChatTurn {
        role: TextMessageRole::User,
        content: text.to_owned(),
    });
    turns
}

async fn handle_audio(
    envelope: Envelope,
    calls: &mut HashMap<String, CallState>,
    config: &SpeechConfig,
    stt_engine: &Arc<Mutex<SttEngine>>,
    idle_tx: &mpsc::Sender<IdleFire>,
    to_client: &mpsc::Sender<Frame>,
) {
    let call_id = envelope.call_id.clone();
    let data = envelope.field_str("data").unwrap_or_default();
    let rate = envelope.field_u64("rate").unwrap_or(16_000) as u32;
    let Ok(raw) = crate::session::base64_decode(data) else {
        warn!(call_id = %call_id, "invalid base64 in stt audio frame");
        return;
    };
    let samples = bytes_to_pcm16(&raw);

    // Fed to the VAD ahead of the buffer extend below, since `extend` moves
    // `samples` and we need this chunk's own samples, not the whole buffer.
    let vad_samples: Vec<f32> = samples.iter().map(|&s| s as f32 / i16::MAX as f32).collect();

    let state = calls.entry(call_id.clone()).or_insert_with(|| CallState::new(config));
    state.stt.pcm_buffer.extend(samples);
    state.stt.generation += 1;
    let generation = state.stt.generation;

    let vad_chunk = AudioChunk {
        samples: vad_samples,
        sample_rate: rate,
        captured_at: Instant::now(),
    };
    let recognizer_final = state.stt.vad.process_chunk(&vad_chunk).segment.is_some();

    let stt_engine = Arc::clone(stt_engine);
    let buffer = state.stt.pcm_buffer.clone();
    let last_partial = Arc::clone(&state.stt.last_partial);
    let to_client = to_client.clone();
    let idle_tx = idle_tx.clone();
    let idle_ms = config.stt.idle_ms;
    let call_id_for_task = call_id.clone();

    tokio::spawn(async move {
        let text = tokio::task::spawn_blocking(move || {
            let mut engine = stt_engine.blocking_lock();
            engine.transcribe_pcm16(&buffer, rate)
        })
        .await;

        let text = match text {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!(call_id = %call_id_for_task, "stt transcription failed: {e}");
                return;
            }
            Err(e) => {
                warn!(call_id = %call_id_for_task, "stt transcription task panicked: {e}");
                return;
            }
        };

        *last_partial.lock().await = text.clone();

        let reply = Envelope::new("stt_result", call_id_for_task.clone())
            .with_field("text", text)
            .with_field("is_partial", true)
            .with_field("is_final", false);
        let _ = to_client.send(Frame::Json(reply)).await;

        if recognizer_final {
            // The caller's natural end of speech already arrived; finalise
            // now instead of waiting out the idle timer.
            let _ = idle_tx
                .send(IdleFire {
                    call_id: call_id_for_task,
                    generation,
                    reason: "recognizer-final",
                })
                .await;
        } else {
            tokio::time::sleep(Duration::from_millis(idle_ms)).await;
            let _ = idle_tx
                .send(IdleFire {
                    call_id: call_id_for_task,
                    generation,
                    reason: "idle-timeout",
                })
                .await;
        }
    });
}

async fn finalize_if_current(
    fire: &IdleFire,
    calls: &mut HashMap<String, CallState>,
    config: &SpeechConfig,
    to_client: &mpsc::Sender<Frame>,
) {
    let Some(state) = calls.get_mut(&fire.call_id) else {
        return;
    };
    if state.stt.generation != fire.generation {
        // Newer audio arrived since this timer was armed; superseded.
        return;
    }
    finalize_now(&fire.call_id, state, config, to_client, fire.reason).await;
}

/// Promotes the call's current best partial to a final `stt_result`, shared
/// by both finalisation triggers (`recognizer-final` and `idle-timeout`).
/// `reason` is carried only for logging.
async fn finalize_now(
    call_id: &str,
    state: &mut CallState,
    config: &SpeechConfig,
    to_client: &mpsc::Sender<Frame>,
    reason: &'static str,
) {
    if state.stt.pcm_buffer.is_empty() {
        return;
    }

    let final_text = state.stt.last_partial.lock().await.clone();
    let normalized = crate::llm::normalize_text(&final_text);

    let is_duplicate = state
        .stt
        .last_final_norm
        .as_deref()
        .map(|last| {
            last == normalized
                && state
                    .stt
                    .last_final_at
                    .is_some_and(|at| at.elapsed() < Duration::from_millis(config.stt.duplicate_suppress_window_ms))
        })
        .unwrap_or(false);

    if !is_duplicate {
        debug!(call_id, reason, "stt finalized");
        let reply = Envelope::new("stt_result", call_id.to_owned())
            .with_field("text", final_text)
            .with_field("is_partial", false)
            .with_field("is_final", true);
        let _ = to_client.send(Frame::Json(reply)).await;
    }

    state.stt.last_final_norm = Some(normalized);
    state.stt.last_final_at = Some(Instant::now());
    state.stt.pcm_buffer.clear();
    state.stt.generation += 1;
}

async fn synthesize_and_send(
    tts_engine: &Arc<Mutex<KokoroTts>>,
    call_id: &str,
    request_id: Option<String>,
    text: &str,
    telephony_rate_hz: u32,
    to_client: &mpsc::Sender<Frame>,
) {
    let samples = {
        let mut engine = tts_engine.lock().await;
        match engine.synthesize(text).await {
            Ok(samples) => samples,
            Err(e) => {
                warn!(call_id, "tts synthesis failed: {e}");
                let reply = Envelope::new("error", call_id)
                    .with_mode("tts")
                    .with_field("message", format!("tts synthesis failed: {e}"));
                let _ = to_client.send(Frame::Json(reply)).await;
                return;
            }
        }
    };

    let source_rate = {
        let engine = tts_engine.lock().await;
        engine.sample_rate()
    };
    let pcm16: Vec<i16> = samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect();
    let telephony_pcm16 = resample(&pcm16, source_rate, telephony_rate_hz);
    let mulaw = pcm16_to_mulaw(&telephony_pcm16);

    let mut meta = Envelope::new("tts_audio", call_id)
        .with_field("encoding", "mulaw")
        .with_field("sample_rate_hz", telephony_rate_hz)
        .with_field("byte_length", mulaw.len());
    if let Some(rid) = request_id {
        meta = meta.with_request_id(rid);
    }
    let _ = to_client.send(Frame::Json(meta)).await;
    let _ = to_client.send(Frame::Binary(Bytes::from(mulaw))).await;
}

fn spawn_warmup_with_heartbeat(llm_engine: Arc<LlmEngine>, heartbeat_interval_sec: u64) {
    tokio::spawn(async move {
        let warmup = tokio::spawn(async move { llm_engine.warmup().await });
        tokio::pin!(warmup);
        let mut elapsed = Duration::ZERO;
        let tick = Duration::from_secs(heartbeat_interval_sec.max(1));
        loop {
            tokio::select! {
                result = &mut warmup => {
                    match result {
                        Ok(Ok(())) => info!("LLM warm-up complete after {:.0}s", elapsed.as_secs_f64()),
                        Ok(Err(e)) => warn!("LLM warm-up failed: {e}"),
                        Err(e) => warn!("LLM warm-up task panicked: {e}"),
                    }
                    break;
                }
                _ = tokio::time::sleep(tick) => {
                    elapsed += tick;
                    info!("LLM warm-up still in progress ({:.0}s elapsed)", elapsed.as_secs_f64());
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_chat_turns_includes_system_and_text() {
        let turns = build_chat_turns("be helpful", "", "hello");
        assert_eq!(turns.len(), 2);
        assert!(matches!(turns[0].role, TextMessageRole::System));
        assert!(matches!(turns[1].role, TextMessageRole::User));
        assert_eq!(turns[1].content, "hello");
    }

    #[test]
    fn build_chat_turns_folds_in_context() {
        let turns = build_chat_turns("be helpful", "Caller: hi", "how are you");
        assert_eq!(turns.len(), 4);
        assert!(turns[1].content.contains("Caller: hi"));
    }

    async fn call_state_with_partial(config: &SpeechConfig, partial: &str) -> CallState {
        let state = CallState::new(config);
        *state.stt.last_partial.lock().await = partial.to_owned();
        state
    }

    #[tokio::test]
    async fn finalize_now_emits_final_for_either_reason() {
        let config = SpeechConfig::default();
        let mut state = call_state_with_partial(&config, "hello there").await;
        state.stt.pcm_buffer = vec![1, 2, 3];
        let (tx, mut rx) = mpsc::channel(4);

        finalize_now("call-1", &mut state, &config, &tx, "recognizer-final").await;

        let Frame::Json(envelope) = rx.recv().await.expect("a final stt_result") else {
            panic!("expected a json frame");
        };
        assert_eq!(envelope.kind, "stt_result");
        assert_eq!(envelope.field_str("text"), Some("hello there"));
        assert_eq!(envelope.field_bool("is_final"), Some(true));
        assert!(state.stt.pcm_buffer.is_empty());
    }

    #[tokio::test]
    async fn finalize_now_is_a_noop_on_an_empty_buffer() {
        let config = SpeechConfig::default();
        let mut state = call_state_with_partial(&config, "hello").await;
        let (tx, mut rx) = mpsc::channel(4);

        finalize_now("call-1", &mut state, &config, &tx, "idle-timeout").await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn finalize_now_promotes_an_empty_partial_on_idle_timeout() {
        // Silence still fills the PCM buffer with zero-valued samples, so an
        // idle-timeout finalisation on a silent utterance must still emit a
        // (possibly empty) final, not be treated as "no utterance happened".
        let config = SpeechConfig::default();
        let mut state = call_state_with_partial(&config, "").await;
        state.stt.pcm_buffer = vec![0; 8_000];
        let (tx, mut rx) = mpsc::channel(4);

        finalize_now("call-1", &mut state, &config, &tx, "idle-timeout").await;

        let Frame::Json(envelope) = rx.recv().await.expect("a final stt_result") else {
            panic!("expected a json frame");
        };
        assert_eq!(envelope.field_str("text"), Some(""));
        assert_eq!(envelope.field_bool("is_final"), Some(true));
    }

    #[tokio::test]
    async fn finalize_now_suppresses_a_near_duplicate_final() {
        let config = SpeechConfig::default();
        let mut state = call_state_with_partial(&config, "book a flight").await;
        state.stt.pcm_buffer = vec![1, 2, 3];
        let (tx, mut rx) = mpsc::channel(4);
        finalize_now("call-1", &mut state, &config, &tx, "recognizer-final").await;
        let _ = rx.recv().await;

        // Same utterance repeated immediately after (e.g. two overlapping
        // finalisation triggers racing on the same buffer).
        *state.stt.last_partial.lock().await = "book a flight".to_owned();
        state.stt.pcm_buffer = vec![1, 2, 3];
        finalize_now("call-1", &mut state, &config, &tx, "idle-timeout").await;

        assert!(rx.try_recv().is_err());
    }
}
