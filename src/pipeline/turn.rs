//! Turn/barge-in coordinator (C7).
//!
//! Owns no audio or transcripts itself — it only judges, from signals the
//! orchestrator hands it, whether the caller is trying to interrupt the
//! agent's speech, and exposes the gating-token lifecycle
//! ([`crate::call::SessionStore`]'s nonce-based set/clear) through names
//! that match the call lifecycle events that drive them.

use crate::call::SessionStore;
use crate::config::CoordinatorConfig;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Default)]
struct RmsAccumulator {
    above_since: Option<Instant>,
}

/// Judges barge-in from two independent signals — partial-transcript length
/// and sustained caller-stream energy — and owns the per-call gating token
/// through [`SessionStore`].
pub struct TurnCoordinator {
    sessions: SessionStore,
    config: CoordinatorConfig,
    rms_state: Mutex<HashMap<String, RmsAccumulator>>,
}

impl TurnCoordinator {
    pub fn new(sessions: SessionStore, config: CoordinatorConfig) -> Self {
        Self {
            sessions,
            config,
            rms_state: Mutex::new(HashMap::new()),
        }
    }

    /// The agent started speaking: set a fresh gating token, resetting any
    /// barge bookkeeping left over from the previous turn.
    pub async fn on_tts_start(&self, call_id: &str) -> Option<u64> {
        self.rms_state.lock().unwrap().remove(call_id);
        self.sessions.set_gating_token(call_id).await
    }

    /// The agent's speech finished or was cancelled: clear the gating token
    /// if `stream_id` still matches the one this call holds (idempotent —
    /// see [`crate::call::GatingToken`]).
    pub async fn on_tts_end(&self, call_id: &str, stream_id: u64) -> bool {
        self.rms_state.lock().unwrap().remove(call_id);
        self.sessions.clear_gating_token(call_id, stream_id).await
    }

    /// A caller partial transcript arrived. Flags a barge-in once it carries
    /// at least `barge_min_chars` non-whitespace characters while the gate
    /// is held; a no-op while the caller already has the floor.
    pub async fn on_caller_partial(&self, call_id: &str, partial_text: &str) {
        let gated = self.is_gated(call_id).await;
        if !gated {
            return;
        }
        let non_whitespace = partial_text.chars().filter(|c| !c.is_whitespace()).count();
        if non_whitespace >= self.config.barge_min_chars {
            self.sessions.set_barge_requested(call_id).await;
        }
    }

    /// A caller-stream RMS sample arrived (16-bit units, see
    /// [`crate::audio::codec::rms`]). Flags a barge-in once the signal has
    /// stayed above `barge_rms_threshold` continuously for `barge_min_ms`
    /// while the gate is held.
    pub async fn on_caller_rms(&self, call_id: &str, rms: f64) {
        if !self.is_gated(call_id).await {
            self.rms_state.lock().unwrap().remove(call_id);
            return;
        }

        let sustained = {
            let mut state = self.rms_state.lock().unwrap();
            let entry = state.entry(call_id.to_owned()).or_default();
            if rms >= f64::from(self.config.barge_rms_threshold) {
                let since = *entry.above_since.get_or_insert_with(Instant::now);
                since.elapsed() >= Duration::from_millis(self.config.barge_min_ms)
            } else {
                entry.above_since = None;
                false
            }
        };

        if sustained {
            self.sessions.set_barge_requested(call_id).await;
        }
    }

    /// Consume and clear the barge-in flag for the call's current turn.
    pub async fn take_barge(&self, call_id: &str) -> bool {
        self.sessions.take_barge_requested(call_id).await
    }

    /// Whether the agent currently holds the floor.
    pub async fn is_gated(&self, call_id: &str) -> bool {
        self.sessions
            .snapshot(call_id)
            .await
            .is_some_and(|s| s.gating_token.is_set())
    }

    pub fn forget_call(&self, call_id: &str) {
        self.rms_state.lock().unwrap().remove(call_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{CallSession, PipelineDescriptor};

    fn config() -> CoordinatorConfig {
        CoordinatorConfig {
            barge_min_chars: 3,
            barge_rms_threshold: 800.0,
            barge_min_ms: 0,
            cleanup_deadline_sec: 5,
        }
    }

    async fn store_with_call(call_id: &str) -> SessionStore {
        let store = SessionStore::new();
        store
            .upsert_call(CallSession::new(call_id, PipelineDescriptor::default()))
            .await;
        store
    }

    #[tokio::test]
    async fn partial_barge_only_flags_while_gated() {
        let store = store_with_call("c1").await;
        let turn = TurnCoordinator::new(store.clone(), config());

        turn.on_caller_partial("c1", "stop").await;
        assert!(!turn.take_barge("c1").await, "ungated partials must not flag barge");

        turn.on_tts_start("c1").await;
        turn.on_caller_partial("c1", "stop").await;
        assert!(turn.take_barge("c1").await);
    }

    #[tokio::test]
    async fn short_partial_does_not_flag_barge() {
        let store = store_with_call("c1").await;
        let turn = TurnCoordinator::new(store.clone(), config());
        turn.on_tts_start("c1").await;
        turn.on_caller_partial("c1", "ok").await;
        assert!(!turn.take_barge("c1").await);
    }

    #[tokio::test]
    async fn rms_barge_requires_gate_and_threshold() {
        let store = store_with_call("c1").await;
        let turn = TurnCoordinator::new(store.clone(), config());

        turn.on_caller_rms("c1", 2000.0).await;
        assert!(!turn.take_barge("c1").await, "ungated rms must not flag barge");

        turn.on_tts_start("c1").await;
        turn.on_caller_rms("c1", 100.0).await;
        assert!(!turn.take_barge("c1").await, "below-threshold rms must not flag barge");

        turn.on_caller_rms("c1", 2000.0).await;
        assert!(turn.take_barge("c1").await);
    }

    #[tokio::test]
    async fn tts_end_clears_gate_only_for_matching_stream_id() {
        let store = store_with_call("c1").await;
        let turn = TurnCoordinator::new(store.clone(), config());
        let sid = turn.on_tts_start("c1").await.unwrap();
        assert!(turn.is_gated("c1").await);
        assert!(!turn.on_tts_end("c1", sid + 1).await);
        assert!(turn.is_gated("c1").await);
        assert!(turn.on_tts_end("c1", sid).await);
        assert!(!turn.is_gated("c1").await);
    }
}
