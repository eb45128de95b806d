//! Language model stage (C4): a thin wire client over an `llm` sub-session.
//!
//! The inference engine itself lives server-side (see [`crate::backend`] and
//! [`engine`]); this module assembles and trims the prompt from rolling
//! history, forwards an `llm_request`, and waits for the matching
//! `llm_response`. Prompt assembly and the duplicate-turn check are plain
//! functions so they can be unit-tested without a channel.

pub mod engine;

use crate::error::{Result, SpeechError};
use crate::session::{ComponentKind, Envelope, Event, Frame, SharedChannel, SubSessionHandle};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// `start(call_id, options)` / `request_reply` / `stop` (C4's public contract).
pub struct LlmStage {
    channel: SharedChannel,
    handle: Arc<SubSessionHandle>,
}

impl LlmStage {
    pub async fn start(channel: SharedChannel, call_id: &str) -> Result<Self> {
        let handle = Arc::new(
            channel
                .open_sub_session(call_id, ComponentKind::Llm, Value::Null)
                .await?,
        );
        Ok(Self { channel, handle })
    }

    /// Send the new caller utterance plus trimmed prior context and block for
    /// the matching reply. The server applies its own inference timeout and
    /// fallback text, so this call always eventually resolves to some reply
    /// string (or an error if the channel itself goes away).
    pub async fn request_reply(&self, text: &str, context: &str) -> Result<String> {
        let request_id = Uuid::new_v4().to_string();
        let envelope = Envelope::new("llm_request", self.handle.call_id())
            .with_request_id(request_id)
            .with_field("text", text)
            .with_field("context", context);
        self.channel
            .send(&self.handle, Frame::Json(envelope))
            .await?;

        loop {
            match self.handle.recv_event().await {
                Some(Event::LlmText { text }) => return Ok(text),
                Some(Event::Error { message }) => return Err(SpeechError::Llm(message)),
                Some(Event::Closed) | None => {
                    return Err(SpeechError::ChannelClosed(
                        "llm sub-session closed before a reply arrived".into(),
                    ));
                }
                Some(_) => {}
            }
        }
    }

    pub async fn stop(self) {
        self.channel.close_sub_session(&self.handle).await;
    }
}

/// Normalises text for duplicate-transcript comparison: lowercase with
/// whitespace runs collapsed to a single space, trimmed.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = false;
    for ch in text.trim().chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.extend(ch.to_lowercase());
            last_was_space = false;
        }
    }
    out
}

/// Whether `candidate` is a duplicate of the last remembered user turn,
/// compared after normalisation so casing/whitespace differences don't
/// defeat suppression.
pub fn is_duplicate_turn(candidate: &str, last_user_turn_norm: Option<&str>) -> bool {
    match last_user_turn_norm {
        Some(last) => !candidate.is_empty() && normalize_text(candidate) == last,
        None => false,
    }
}

/// Rough token estimate (~4 characters per token) used for prompt trimming
/// without loading a real tokenizer client-side.
fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4).max(1)
}

/// Drop the oldest turns until the remaining turns, plus the system prompt,
/// fit within `max_prompt_tokens`. Always keeps at least the most recent
/// turn, even if it alone exceeds the budget.
pub fn trim_turns_to_budget(
    system_prompt: &str,
    turns: &[String],
    max_prompt_tokens: usize,
) -> Vec<String> {
    let mut budget = max_prompt_tokens.saturating_sub(estimate_tokens(system_prompt));
    let mut kept: Vec<String> = Vec::new();
    for turn in turns.iter().rev() {
        let cost = estimate_tokens(turn);
        if !kept.is_empty() && cost > budget {
            break;
        }
        budget = budget.saturating_sub(cost);
        kept.push(turn.clone());
    }
    kept.reverse();
    kept
}

/// Assemble the `context` field sent over the wire: trimmed prior turns
/// joined one per line, budgeted against `max_prompt_tokens` with
/// `system_prompt`'s cost reserved (the system prompt itself is config the
/// server already holds, so it is not re-sent here).
pub fn assemble_context(system_prompt: &str, turns: &[String], max_prompt_tokens: usize) -> String {
    trim_turns_to_budget(system_prompt, turns, max_prompt_tokens).join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace_and_case() {
        assert_eq!(normalize_text("  Hello   World  "), "hello world");
    }

    #[test]
    fn duplicate_turn_matches_after_normalisation() {
        assert!(is_duplicate_turn("  HELLO  world", Some("hello world")));
        assert!(!is_duplicate_turn("goodbye", Some("hello world")));
    }

    #[test]
    fn duplicate_turn_empty_candidate_never_matches() {
        assert!(!is_duplicate_turn("", Some("")));
    }

    #[test]
    fn trim_turns_keeps_most_recent_first() {
        let turns = vec!["a".repeat(40), "b".repeat(40), "c".repeat(40)];
        let kept = trim_turns_to_budget("sys", &turns, 15);
        assert_eq!(kept.last().map(String::as_str), Some(turns.last().unwrap().as_str()));
    }

    #[test]
    fn trim_turns_always_keeps_at_least_the_last_turn() {
        let turns = vec!["x".repeat(10_000)];
        let kept = trim_turns_to_budget("sys", &turns, 1);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn assemble_context_joins_trimmed_turns_without_system_prompt() {
        let turns = vec!["user: hi".to_owned(), "user: how are you".to_owned()];
        let context = assemble_context("be nice", &turns, 1000);
        assert!(!context.starts_with("be nice"));
        assert!(context.contains("user: hi"));
        assert!(context.contains("user: how are you"));
    }
}
