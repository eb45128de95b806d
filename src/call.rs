//! Call session data model: the per-call state owned by the pipeline
//! orchestrator and read by the turn coordinator and stage receive loops.
//!
//! A [`SessionStore`] is the single source of truth for `call_id` lookup
//! across the orchestrator, coordinator, and stage receive loops — an arena
//! of sessions keyed by call id. Tasks carry the `call_id` and re-look-up
//! under the store's single-writer lock rather than holding long-lived
//! strong references to a session, so teardown is a plain map-delete.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

/// Which pipeline descriptor a call was answered with: the chosen STT/LLM/TTS
/// back-ends and their merged options. The core only cares that one exists
/// per call; the concrete back-end selection lives with the caller.
#[derive(Debug, Clone, Default)]
pub struct PipelineDescriptor {
    pub stt_backend: String,
    pub llm_backend: String,
    pub tts_backend: String,
}

/// The gating token (Turn Token): a per-call nonce present exactly while
/// the agent is permitted to speak. `None` means the caller is free to speak.
#[derive(Debug, Clone, Default)]
pub struct GatingToken(Option<u64>);

impl GatingToken {
    /// Set unconditionally to a new stream id, returning the previous value.
    fn set(&mut self, stream_id: u64) -> Option<u64> {
        self.0.replace(stream_id)
    }

    /// Nonce-compare-and-clear: clears only if the current token equals
    /// `stream_id`. Returns whether it actually cleared. Calling this twice
    /// with the same `stream_id` clears once and reports *not-cleared* the
    /// second time.
    fn clear_if(&mut self, stream_id: u64) -> bool {
        if self.0 == Some(stream_id) {
            self.0 = None;
            true
        } else {
            false
        }
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    pub fn current(&self) -> Option<u64> {
        self.0
    }
}

/// One caller-utterance → agent-reply cycle's worth of rolling history.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    /// Prior user turns, oldest first, trimmed to the LLM's token budget.
    pub user_turns: Vec<String>,
    /// Normalised text of the most recently remembered user turn, used for
    /// duplicate-transcript skip detection.
    pub last_user_turn_norm: Option<String>,
}

/// The call session. Exclusively owned by its orchestrator; visible
/// read-only to the coordinator and stages via [`SessionStore`].
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: String,
    pub pipeline: PipelineDescriptor,
    pub history: ConversationHistory,
    pub gating_token: GatingToken,
    /// Whether a barge-in has been flagged for the in-flight agent turn.
    pub barge_requested: bool,
    /// Whether a reply is currently being produced (invariant: at most one).
    pub reply_in_flight: bool,
    pub last_caller_audio_at: Option<Instant>,
    pub last_agent_audio_at: Option<Instant>,
    pub created_at: Instant,
}

impl CallSession {
    pub fn new(call_id: impl Into<String>, pipeline: PipelineDescriptor) -> Self {
        Self {
            call_id: call_id.into(),
            pipeline,
            history: ConversationHistory::default(),
            gating_token: GatingToken::default(),
            barge_requested: false,
            reply_in_flight: false,
            last_caller_audio_at: None,
            last_agent_audio_at: None,
            created_at: Instant::now(),
        }
    }
}

/// Concurrent map `call_id → CallSession`.
///
/// All mutations go through the store's single-writer lock. Readers may
/// clone a snapshot rather than hold the lock across `.await` points.
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<Mutex<HashMap<String, CallSession>>>,
    next_stream_id: Arc<std::sync::atomic::AtomicU64>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new monotonically increasing stream id, used to tag each
    /// gating-token set so its matching clear can be nonce-checked.
    pub fn next_stream_id(&self) -> u64 {
        self.next_stream_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    pub async fn upsert_call(&self, session: CallSession) {
        let mut guard = self.inner.lock().await;
        guard.insert(session.call_id.clone(), session);
    }

    pub async fn remove_call(&self, call_id: &str) -> Option<CallSession> {
        let mut guard = self.inner.lock().await;
        guard.remove(call_id)
    }

    pub async fn snapshot(&self, call_id: &str) -> Option<CallSession> {
        let guard = self.inner.lock().await;
        guard.get(call_id).cloned()
    }

    pub async fn contains(&self, call_id: &str) -> bool {
        let guard = self.inner.lock().await;
        guard.contains_key(call_id)
    }

    /// Set the gating token to a fresh stream id for `call_id` (`on_tts_start`).
    /// Returns the new stream id, or `None` if the call is unknown.
    pub async fn set_gating_token(&self, call_id: &str) -> Option<u64> {
        let stream_id = self.next_stream_id();
        let mut guard = self.inner.lock().await;
        let session = guard.get_mut(call_id)?;
        session.gating_token.set(stream_id);
        session.barge_requested = false;
        Some(stream_id)
    }

    /// Nonce-compare-and-clear the gating token (`on_tts_end` / `on_tts_cancel`).
    /// Returns whether this call actually cleared it — `false` on a call that
    /// has already been cleared, matching the idempotent-clear invariant.
    pub async fn clear_gating_token(&self, call_id: &str, stream_id: u64) -> bool {
        let mut guard = self.inner.lock().await;
        let Some(session) = guard.get_mut(call_id) else {
            return false;
        };
        session.gating_token.clear_if(stream_id)
    }

    pub async fn set_barge_requested(&self, call_id: &str) {
        let mut guard = self.inner.lock().await;
        if let Some(session) = guard.get_mut(call_id) {
            session.barge_requested = true;
        }
    }

    pub async fn take_barge_requested(&self, call_id: &str) -> bool {
        let mut guard = self.inner.lock().await;
        guard
            .get_mut(call_id)
            .map(|s| std::mem::take(&mut s.barge_requested))
            .unwrap_or(false)
    }

    /// Atomically try to mark a reply in flight. Returns `false` (and leaves
    /// state unchanged) if one is already in flight — enforces the
    /// at-most-one-reply-in-flight invariant under the session's
    /// single-writer lock rather than a separate flag race.
    pub async fn try_begin_reply(&self, call_id: &str) -> bool {
        let mut guard = self.inner.lock().await;
        let Some(session) = guard.get_mut(call_id) else {
            return false;
        };
        if session.reply_in_flight {
            return false;
        }
        session.reply_in_flight = true;
        true
    }

    pub async fn end_reply(&self, call_id: &str) {
        let mut guard = self.inner.lock().await;
        if let Some(session) = guard.get_mut(call_id) {
            session.reply_in_flight = false;
        }
    }

    pub async fn touch_caller_audio(&self, call_id: &str) {
        let mut guard = self.inner.lock().await;
        if let Some(session) = guard.get_mut(call_id) {
            session.last_caller_audio_at = Some(Instant::now());
        }
    }

    pub async fn touch_agent_audio(&self, call_id: &str) {
        let mut guard = self.inner.lock().await;
        if let Some(session) = guard.get_mut(call_id) {
            session.last_agent_audio_at = Some(Instant::now());
        }
    }

    /// Replace the call's rolling user-turn history (persisted after
    /// prompt-trimming).
    pub async fn set_history(&self, call_id: &str, history: ConversationHistory) {
        let mut guard = self.inner.lock().await;
        if let Some(session) = guard.get_mut(call_id) {
            session.history = history;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gating_token_clear_is_nonce_checked_and_idempotent() {
        let store = SessionStore::new();
        store
            .upsert_call(CallSession::new("c1", PipelineDescriptor::default()))
            .await;

        let sid = store.set_gating_token("c1").await.expect("set");
        assert!(store.snapshot("c1").await.unwrap().gating_token.is_set());

        assert!(store.clear_gating_token("c1", sid).await);
        assert!(!store.snapshot("c1").await.unwrap().gating_token.is_set());

        // Second clear with the same nonce is a no-op, reports not-cleared.
        assert!(!store.clear_gating_token("c1", sid).await);
    }

    #[tokio::test]
    async fn clear_gating_token_rejects_stale_stream_id() {
        let store = SessionStore::new();
        store
            .upsert_call(CallSession::new("c1", PipelineDescriptor::default()))
            .await;
        let old_sid = store.set_gating_token("c1").await.unwrap();
        let new_sid = store.set_gating_token("c1").await.unwrap();
        assert_ne!(old_sid, new_sid);
        // Clearing with the stale id must not clear the current token.
        assert!(!store.clear_gating_token("c1", old_sid).await);
        assert!(store.snapshot("c1").await.unwrap().gating_token.is_set());
        assert!(store.clear_gating_token("c1", new_sid).await);
    }

    #[tokio::test]
    async fn try_begin_reply_enforces_at_most_one_in_flight() {
        let store = SessionStore::new();
        store
            .upsert_call(CallSession::new("c1", PipelineDescriptor::default()))
            .await;
        assert!(store.try_begin_reply("c1").await);
        assert!(!store.try_begin_reply("c1").await);
        store.end_reply("c1").await;
        assert!(store.try_begin_reply("c1").await);
    }

    #[tokio::test]
    async fn remove_call_drops_session() {
        let store = SessionStore::new();
        store
            .upsert_call(CallSession::new("c1", PipelineDescriptor::default()))
            .await;
        assert!(store.contains("c1").await);
        store.remove_call("c1").await;
        assert!(!store.contains("c1").await);
    }
}
