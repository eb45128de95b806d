//! Back-end session multiplexer (C2).
//!
//! Owns a single duplex message channel to the in-process AI server (see
//! [`crate::backend`]) and multiplexes it into per-call, per-stage
//! sub-sessions. "In-process" means the duplex channel is a pair of
//! [`tokio::sync::mpsc`] queues carrying a typed [`Frame`], not a literal
//! socket — there is no separate process to dial. The envelope side is still
//! routed through `serde_json` so the wire shapes and unknown-type handling
//! behave exactly as a real socket transport would.

use crate::error::{Result, SpeechError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Which stage a sub-session carries traffic for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Stt,
    Llm,
    Tts,
    Full,
}

impl ComponentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stt => "stt",
            Self::Llm => "llm",
            Self::Tts => "tts",
            Self::Full => "full",
        }
    }
}

/// A JSON envelope as exchanged on the back-end channel (external interfaces
/// table). Unrecognised fields are preserved in `fields` rather than dropped,
/// so forwarding/echoing a message never loses data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub call_id: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            call_id: call_id.into(),
            mode: None,
            request_id: None,
            fields: Map::new(),
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn field_u64(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(Value::as_u64)
    }

    pub fn field_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(Value::as_bool)
    }

    /// Key used to demultiplex channel traffic: `request_id` when present,
    /// otherwise `mode` (matching the server's tolerance for mode-scoped
    /// traffic that omits a request id, e.g. unsolicited STT results).
    fn routing_key(&self) -> String {
        if let Some(rid) = &self.request_id {
            format!("{}:{rid}", self.call_id)
        } else {
            let mode = self.mode.as_deref().unwrap_or("full");
            format!("{}:{mode}", self.call_id)
        }
    }
}

/// A frame exchanged on the duplex channel: either a JSON envelope or a raw
/// binary payload interpreted in the context of the most recent envelope.
#[derive(Debug, Clone)]
pub enum Frame {
    Json(Envelope),
    Binary(Bytes),
}

/// A demultiplexed, typed event delivered to a sub-session's inbound queue.
#[derive(Debug, Clone)]
pub enum Event {
    PartialStt {
        text: String,
    },
    FinalStt {
        text: String,
    },
    LlmText {
        text: String,
    },
    TtsMeta {
        request_id: Option<String>,
        encoding: String,
        sample_rate_hz: u32,
        byte_length: usize,
    },
    TtsAudio {
        bytes: Bytes,
    },
    ModeReady {
        mode: String,
    },
    StatusResponse {
        payload: Value,
    },
    ControlResponse {
        status: String,
        message: Option<String>,
    },
    Error {
        message: String,
    },
    /// Terminal sentinel: the sub-session's queue will deliver nothing else.
    Closed,
}

/// Handle to an open sub-session: `(call_id, kind)` scoped to one channel.
pub struct SubSessionHandle {
    call_id: String,
    kind: ComponentKind,
    send_lock: Arc<Mutex<()>>,
    inbound: Mutex<mpsc::Receiver<Event>>,
    outbound: mpsc::Sender<Frame>,
    registry: Arc<Mutex<Registry>>,
    closed: AtomicBool,
}

impl SubSessionHandle {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }
}

struct Registry {
    /// routing key -> inbound sender for that sub-session.
    queues: HashMap<String, mpsc::Sender<Event>>,
}

impl Registry {
    fn new() -> Self {
        Self {
            queues: HashMap::new(),
        }
    }
}

/// Owns the duplex channel to the in-process AI server and the registry of
/// open sub-sessions. Cloning shares the same underlying connection.
#[derive(Clone)]
pub struct SharedChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    config: crate::config::SessionConfig,
    to_server: Mutex<mpsc::Sender<Frame>>,
    registry: Arc<Mutex<Registry>>,
    /// Set when the receive loop observes the server side close.
    closed: Arc<AtomicBool>,
    connector: Box<dyn Fn() -> ServerConnection + Send + Sync>,
}

/// What connecting to the in-process AI server yields: the client's sending
/// half plus a background task handle that owns the receiving half.
pub struct ServerConnection {
    pub to_server: mpsc::Sender<Frame>,
    pub from_server: mpsc::Receiver<Frame>,
}

impl SharedChannel {
    /// Establish the duplex channel against a connector closure that spawns
    /// (or re-spawns, on reconnect) the in-process AI server task and returns
    /// the client-facing ends of the pair.
    pub fn connect<F>(config: crate::config::SessionConfig, connector: F) -> Self
    where
        F: Fn() -> ServerConnection + Send + Sync + 'static,
    {
        let conn = connector();
        let registry = Arc::new(Mutex::new(Registry::new()));
        let closed = Arc::new(AtomicBool::new(false));
        spawn_receive_loop(conn.from_server, Arc::clone(&registry), Arc::clone(&closed));

        Self {
            inner: Arc::new(ChannelInner {
                config,
                to_server: Mutex::new(conn.to_server),
                registry,
                closed,
                connector: Box::new(connector),
            }),
        }
    }

    /// Whether the receive loop has observed the server side close. A
    /// diagnostic accessor for callers that want to log or alert on a dead
    /// channel ahead of the next `send`/`open_sub_session` surfacing
    /// [`SpeechError::ChannelClosed`].
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Reconnect to the in-process AI server. Does not replay state; callers
    /// must re-issue `set_mode` as needed.
    ///
    /// The connector for this in-process transport is infallible — it always
    /// hands back a fresh channel pair — so reconnecting always succeeds on
    /// the first attempt. [`crate::config::SessionConfig`]'s bounded
    /// exponential backoff fields are honoured here for a connector that can
    /// fail (e.g. a real socket transport): each failed attempt sleeps for
    /// `delay` before retrying, doubling up to `reconnect_backoff_max_ms`,
    /// until `reconnect_max_attempts` is exhausted.
    pub async fn reconnect(&self) -> Result<()> {
        let mut delay = Duration::from_millis(self.inner.config.reconnect_backoff_initial_ms);
        let max_delay = Duration::from_millis(self.inner.config.reconnect_backoff_max_ms);
        let mut last_err: Option<String> = None;
        for attempt in 0..self.inner.config.reconnect_max_attempts.max(1) {
            if let Some(ref e) = last_err {
                warn!(attempt, error = %e, delay_ms = delay.as_millis(), "retrying reconnect after backoff");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max_delay);
            }
            let conn = (self.inner.connector)();
            *self.inner.to_server.lock().await = conn.to_server;
            self.inner.closed.store(false, Ordering::SeqCst);
            spawn_receive_loop(
                conn.from_server,
                Arc::clone(&self.inner.registry),
                Arc::clone(&self.inner.closed),
            );
            debug!(attempt, "reconnected to in-process AI server");
            return Ok(());
        }
        warn!("exhausted reconnect attempts");
        Err(SpeechError::ChannelClosed(
            last_err.unwrap_or_else(|| "reconnect attempts exhausted".to_owned()),
        ))
    }

    /// `open_sub_session(call_id, kind, options)`.
    pub async fn open_sub_session(
        &self,
        call_id: &str,
        kind: ComponentKind,
        options: Value,
    ) -> Result<SubSessionHandle> {
        let routing_key = format!("{call_id}:{}", kind.as_str());
        let (tx, mut rx) = mpsc::channel(self.inner.config.inbound_queue_size.max(1));
        {
            let mut reg = self.inner.registry.lock().await;
            reg.queues.insert(routing_key.clone(), tx);
        }

        let mut envelope = Envelope::new("set_mode", call_id).with_mode(kind.as_str());
        if let Value::Object(map) = options {
            for (k, v) in map {
                envelope = envelope.with_field(k, v);
            }
        }

        if let Err(e) = self.send_envelope(envelope).await {
            warn!(call_id, kind = kind.as_str(), error = %e, "failed to send set_mode");
        }

        // Wait for mode_ready on this sub-session's own queue (mode_ready
        // routes here: its kind_hint is the envelope's mode, which is this
        // kind's wire name), but tolerate timeout and a closed queue by
        // proceeding unconfirmed — callers still observe any subsequent
        // events normally via `recv_event`.
        let handshake = Duration::from_secs(self.inner.config.handshake_timeout_sec);
        match timeout(handshake, wait_for_mode_ready(&mut rx)).await {
            Ok(true) => {}
            Ok(false) => warn!(
                call_id,
                kind = kind.as_str(),
                "sub-session closed before mode_ready arrived"
            ),
            Err(_) => warn!(
                call_id,
                kind = kind.as_str(),
                "mode_ready handshake timed out; proceeding unconfirmed"
            ),
        }

        Ok(SubSessionHandle {
            call_id: call_id.to_owned(),
            kind,
            send_lock: Arc::new(Mutex::new(())),
            inbound: Mutex::new(rx),
            outbound: self.inner.to_server.lock().await.clone(),
            registry: Arc::clone(&self.inner.registry),
            closed: AtomicBool::new(false),
        })
    }

    async fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        let sender = self.inner.to_server.lock().await.clone();
        sender
            .send(Frame::Json(envelope))
            .await
            .map_err(|_| SpeechError::ChannelClosed("send to in-process server failed".into()))
    }

    /// `send(handle, envelope_or_bytes)`.
    pub async fn send(&self, handle: &SubSessionHandle, frame: Frame) -> Result<()> {
        let _guard = handle.send_lock.lock().await;
        let send_timeout = Duration::from_millis(self.inner.config.send_timeout_ms);
        let sender = handle.outbound.clone();
        timeout(send_timeout, sender.send(frame))
            .await
            .map_err(|_| SpeechError::Busy("send_timeout exceeded".into()))?
            .map_err(|_| SpeechError::ChannelClosed("in-process server gone".into()))
    }

    /// `close_sub_session(handle)`. Idempotent: closing twice is a no-op.
    pub async fn close_sub_session(&self, handle: &SubSessionHandle) {
        if handle.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let routing_key = format!("{}:{}", handle.call_id, handle.kind.as_str());
        let mut reg = self.inner.registry.lock().await;
        if let Some(tx) = reg.queues.remove(&routing_key) {
            let _ = tx.send(Event::Closed).await;
        }
    }
}

/// `recv_events(handle)` — yields typed events until `Event::Closed`.
impl SubSessionHandle {
    pub async fn recv_event(&self) -> Option<Event> {
        let mut rx = self.inbound.lock().await;
        rx.recv().await
    }
}

fn spawn_receive_loop(
    mut from_server: mpsc::Receiver<Frame>,
    registry: Arc<Mutex<Registry>>,
    closed: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        // The most recent `tts_audio` meta envelope, globally: binary frames
        // carry no call_id of their own, so a frame is attached to whichever
        // meta arrived most recently and then consumed, never broadcast to
        // every call that has ever opened a `tts` sub-session.
        let mut last_meta: Option<String> = None;
        while let Some(frame) = from_server.recv().await {
            match frame {
                Frame::Json(envelope) => dispatch_envelope(envelope, &registry, &mut last_meta).await,
                Frame::Binary(bytes) => dispatch_binary(bytes, &registry, &mut last_meta).await,
            }
        }
        closed.store(true, Ordering::SeqCst);
        let reg = registry.lock().await;
        for tx in reg.queues.values() {
            let _ = tx
                .send(Event::Error {
                    message: "back-end channel closed".to_owned(),
                })
                .await;
        }
    });
}

async fn dispatch_envelope(
    envelope: Envelope,
    registry: &Arc<Mutex<Registry>>,
    last_meta: &mut Option<String>,
) {
    let call_key = envelope.call_id.clone();
    // Route by the stage an event naturally belongs to rather than
    // `Envelope::routing_key()`: sub-session queues are registered under
    // `call_id:kind`, never `call_id:request_id`, so a response that carries
    // a request_id would otherwise always miss the registry and fall through
    // to the ambiguous fixed-order fallback below — which misdelivers when a
    // call has more than one stage's sub-session open at once.
    let (kind_hint, event) = match envelope.kind.as_str() {
        "mode_ready" => {
            let mode = envelope.mode.clone().unwrap_or_default();
            (mode.clone(), Event::ModeReady { mode })
        }
        "stt_result" => {
            let text = envelope.field_str("text").unwrap_or_default().to_owned();
            let is_partial = envelope.field_bool("is_partial").unwrap_or(false);
            let event = if is_partial {
                Event::PartialStt { text }
            } else {
                Event::FinalStt { text }
            };
            ("stt".to_owned(), event)
        }
        "llm_response" => (
            "llm".to_owned(),
            Event::LlmText {
                text: envelope.field_str("text").unwrap_or_default().to_owned(),
            },
        ),
        "tts_audio" => {
            let encoding = envelope.field_str("encoding").unwrap_or("mulaw").to_owned();
            let sample_rate_hz = envelope.field_u64("sample_rate_hz").unwrap_or(8000) as u32;
            let byte_length = envelope.field_u64("byte_length").unwrap_or(0) as usize;
            // Overwrite, never merge: the next binary frame belongs to this
            // call, and whatever call was waiting on a prior, undelivered
            // meta has lost its one shot at the bytes (matches the server's
            // own one-in-flight-tts-at-a-time behavior).
            *last_meta = Some(call_key.clone());
            (
                "tts".to_owned(),
                Event::TtsMeta {
                    request_id: envelope.request_id.clone(),
                    encoding,
                    sample_rate_hz,
                    byte_length,
                },
            )
        }
        "tts_response" => {
            let data = envelope.field_str("audio_data").unwrap_or_default();
            let event = match base64_decode(data) {
                Ok(bytes) => Event::TtsAudio {
                    bytes: Bytes::from(bytes),
                },
                Err(e) => Event::Error {
                    message: format!("invalid tts_response base64: {e}"),
                },
            };
            ("tts".to_owned(), event)
        }
        "status_response" => (
            "full".to_owned(),
            Event::StatusResponse {
                payload: Value::Object(envelope.fields.clone()),
            },
        ),
        "reload_models" | "reload_llm" => (
            "full".to_owned(),
            Event::ControlResponse {
                status: envelope.field_str("status").unwrap_or("ok").to_owned(),
                message: envelope.field_str("message").map(str::to_owned),
            },
        ),
        "error" => {
            // Scope the error to whichever stage reported it when known,
            // otherwise it falls back to the fixed search order below.
            let kind_hint = envelope.mode.clone().unwrap_or_else(|| "full".to_owned());
            (
                kind_hint,
                Event::Error {
                    message: envelope.field_str("message").unwrap_or("unknown error").to_owned(),
                },
            )
        }
        other => {
            warn!(kind = other, call_id = %envelope.call_id, "unknown envelope type, skipping");
            return;
        }
    };

    route_event(&call_key, &kind_hint, event, registry).await;
}

async fn dispatch_binary(bytes: Bytes, registry: &Arc<Mutex<Registry>>, last_meta: &mut Option<String>) {
    // A binary frame is attached to the most recent tts_meta envelope; since
    // we don't know the call_id from the bytes alone, route to whichever
    // call set that meta and consume it, so a later frame with no meta of
    // its own can't be misdelivered to a stale call.
    let Some(call_key) = last_meta.take() else {
        warn!("tts binary frame with no preceding tts_audio meta, dropping");
        return;
    };
    let reg = registry.lock().await;
    let key = format!("{call_key}:tts");
    if let Some(tx) = reg.queues.get(&key) {
        let _ = tx
            .send(Event::TtsAudio {
                bytes: bytes.clone(),
            })
            .await;
    }
}

async fn route_event(call_id: &str, kind_hint: &str, event: Event, registry: &Arc<Mutex<Registry>>) {
    let reg = registry.lock().await;
    let primary_key = format!("{call_id}:{kind_hint}");
    if let Some(tx) = reg.queues.get(&primary_key) {
        let _ = tx.send(event).await;
        return;
    }
    // Fall back for a hint that didn't match any open sub-session (e.g.
    // `full`-scoped control traffic delivered to whichever stage is open).
    for kind in ["stt", "llm", "tts", "full"] {
        let fallback_key = format!("{call_id}:{kind}");
        if let Some(tx) = reg.queues.get(&fallback_key) {
            let _ = tx.send(event).await;
            return;
        }
    }
    debug!(call_id, "no open sub-session for event, dropping");
}

/// Drain `rx` until a `ModeReady` event arrives (`true`), the queue is
/// closed (`false`), or the caller's timeout fires first. Other event kinds
/// arriving before `mode_ready` (there should be none this early) are
/// discarded rather than misinterpreted as confirmation.
async fn wait_for_mode_ready(rx: &mut mpsc::Receiver<Event>) -> bool {
    while let Some(event) = rx.recv().await {
        match event {
            Event::ModeReady { .. } => return true,
            Event::Closed => return false,
            _ => continue,
        }
    }
    false
}

pub(crate) fn base64_decode(data: &str) -> std::result::Result<Vec<u8>, String> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A channel with no server on the other end: `open_sub_session`'s
    /// `mode_ready` wait always times out (or, once the receiver is
    /// dropped, observes the sub-session queue close), exercising the
    /// tolerant-handshake path rather than a full server loop.
    fn test_channel_loopback() -> (SharedChannel, mpsc::Receiver<Frame>) {
        let (to_server_tx, to_server_rx) = mpsc::channel::<Frame>(32);
        let config = crate::config::SessionConfig::default();
        let channel = SharedChannel::connect(config, move || {
            let (_unused_tx, from_server) = mpsc::channel::<Frame>(32);
            ServerConnection {
                to_server: to_server_tx.clone(),
                from_server,
            }
        });
        (channel, to_server_rx)
    }

    #[tokio::test]
    async fn envelope_routing_key_uses_request_id_when_present() {
        let e = Envelope::new("llm_response", "call-1").with_request_id("req-1");
        assert_eq!(e.routing_key(), "call-1:req-1");
    }

    #[tokio::test]
    async fn envelope_routing_key_falls_back_to_mode() {
        let e = Envelope::new("stt_result", "call-1").with_mode("stt");
        assert_eq!(e.routing_key(), "call-1:stt");
    }

    #[tokio::test]
    async fn envelope_unknown_fields_round_trip_through_serde() {
        let e = Envelope::new("audio", "call-1")
            .with_mode("stt")
            .with_field("rate", 16000)
            .with_field("data", "AAAA");
        let json = serde_json::to_string(&e).expect("serialize");
        let back: Envelope = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.field_u64("rate"), Some(16000));
        assert_eq!(back.field_str("data"), Some("AAAA"));
    }

    #[tokio::test]
    async fn close_sub_session_is_idempotent() {
        let (channel, _rx) = test_channel_loopback();
        let handle = channel
            .open_sub_session("call-1", ComponentKind::Stt, Value::Null)
            .await
            .expect("open");
        channel.close_sub_session(&handle).await;
        channel.close_sub_session(&handle).await; // no panic, no double-send
    }

    #[tokio::test]
    async fn component_kind_as_str_matches_wire_values() {
        assert_eq!(ComponentKind::Stt.as_str(), "stt");
        assert_eq!(ComponentKind::Llm.as_str(), "llm");
        assert_eq!(ComponentKind::Tts.as_str(), "tts");
        assert_eq!(ComponentKind::Full.as_str(), "full");
    }
}
