//! Local GGUF language model engine, owned exclusively by the in-process AI
//! server and guarded there by a single process-wide mutex (the model is not
//! reentrant). Conversation assembly and prompt trimming are the caller's
//! responsibility; this module only turns a message list into generated text.

use crate::config::LlmConfig;
use crate::error::{Result, SpeechError};
use mistralrs::{
    GgufModelBuilder, MemoryGpuConfig, Model, PagedAttentionMetaBuilder, RequestBuilder, Response,
    StopTokens, TextMessageRole, TextMessages,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Abort generation when a model emits only reasoning deltas for too long.
/// Keeps conversational latency bounded for models that ignore no-think
/// controls and never surface visible content.
const REASONING_ONLY_EVENT_LIMIT: usize = 96;
const REASONING_ONLY_DURATION_LIMIT: Duration = Duration::from_secs(12);
const FIRST_TOKEN_TIMEOUT: Duration = Duration::from_secs(120);

/// Incrementally strips `<think>...</think>` blocks across streaming chunks.
#[derive(Debug, Default)]
pub(crate) struct ThinkTagStripper {
    in_think_block: bool,
    carry: String,
}

impl ThinkTagStripper {
    const OPEN: &'static str = "<think>";
    const CLOSE: &'static str = "</think>";

    /// Feed one fragment and return newly-visible text (outside think blocks).
    pub(crate) fn push(&mut self, fragment: &str) -> String {
        if fragment.is_empty() {
            return String::new();
        }
        self.carry.push_str(fragment);

        let mut visible = String::new();
        loop {
            if self.in_think_block {
                if let Some(end) = self.carry.find(Self::CLOSE) {
                    self.carry.drain(..end + Self::CLOSE.len());
                    self.in_think_block = false;
                    continue;
                }
                let keep = Self::CLOSE.len().saturating_sub(1);
                if self.carry.len() > keep {
                    let drain = self.carry.len() - keep;
                    self.carry.drain(..drain);
                }
                break;
            }

            if let Some(start) = self.carry.find(Self::OPEN) {
                visible.push_str(&self.carry[..start]);
                self.carry.drain(..start + Self::OPEN.len());
                self.in_think_block = true;
                continue;
            }

            let keep = Self::OPEN.len().max(Self::CLOSE.len()).saturating_sub(1);
            if self.carry.len() > keep {
                let emit = self.carry.len() - keep;
                visible.push_str(&self.carry[..emit]);
                self.carry.drain(..emit);
            }
            break;
        }

        visible
    }

    /// Flush any remaining visible tail.
    pub(crate) fn finish(&mut self) -> String {
        if self.in_think_block {
            self.carry.clear();
            return String::new();
        }
        std::mem::take(&mut self.carry)
    }
}

pub(crate) fn should_abort_reasoning_only(
    reasoning_only_events: usize,
    has_visible_output: bool,
    elapsed: Duration,
) -> bool {
    !has_visible_output
        && reasoning_only_events >= REASONING_ONLY_EVENT_LIMIT
        && elapsed >= REASONING_ONLY_DURATION_LIMIT
}

/// One turn of conversation to feed the model, oldest first.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: TextMessageRole,
    pub content: String,
}

/// Local text-only GGUF inference engine.
pub struct LlmEngine {
    model: Arc<Model>,
    config: LlmConfig,
}

impl LlmEngine {
    /// Build the engine, downloading and loading the configured GGUF model.
    pub async fn new(config: &LlmConfig) -> Result<Self> {
        info!("loading GGUF LLM: {} / {}", config.model_id, config.gguf_file);

        let mut builder =
            GgufModelBuilder::new(&config.model_id, vec![&config.gguf_file]).with_logging();
        if !config.tokenizer_id.is_empty() {
            builder = builder.with_tok_model_id(&config.tokenizer_id);
        }

        let context_size = config.context_size_tokens;
        let model = builder
            .with_paged_attn(|| {
                PagedAttentionMetaBuilder::default()
                    .with_gpu_memory(MemoryGpuConfig::ContextSize(context_size))
                    .build()
            })
            .map_err(|e| SpeechError::Llm(format!("paged attention config failed: {e}")))?
            .build()
            .await
            .map_err(|e| SpeechError::Llm(format!("GGUF model build failed: {e}")))?;

        info!("GGUF LLM loaded successfully");
        Ok(Self {
            model: Arc::new(model),
            config: config.clone(),
        })
    }

    /// One-shot warm-up inference to pay model load/compile cost before the
    /// first real call arrives.
    pub async fn warmup(&self) -> Result<()> {
        let turns = vec![ChatTurn {
            role: TextMessageRole::User,
            content: "Hello".to_owned(),
        }];
        let interrupt = Arc::new(AtomicBool::new(false));
        self.generate_capped(&turns, self.config.warmup_max_tokens, interrupt)
            .await?;
        Ok(())
    }

    /// Generate a reply, applying [`LlmConfig::infer_timeout_sec`] and
    /// substituting [`LlmConfig::fallback_reply`] on timeout or failure. This
    /// is the entry point the in-process AI server calls under its
    /// single-flight mutex.
    pub async fn generate_with_timeout(
        &self,
        turns: &[ChatTurn],
        interrupt: Arc<AtomicBool>,
    ) -> String {
        let deadline = Duration::from_secs(self.config.infer_timeout_sec);
        match tokio::time::timeout(
            deadline,
            self.generate_capped(turns, self.config.max_tokens, interrupt),
        )
        .await
        {
            Ok(Ok(text)) if !text.is_empty() => text,
            Ok(Ok(_)) => self.config.fallback_reply.clone(),
            Ok(Err(e)) => {
                warn!("LLM generation failed, using fallback reply: {e}");
                self.config.fallback_reply.clone()
            }
            Err(_) => {
                warn!(
                    "LLM generation exceeded {}s, using fallback reply",
                    self.config.infer_timeout_sec
                );
                self.config.fallback_reply.clone()
            }
        }
    }

    async fn generate_capped(
        &self,
        turns: &[ChatTurn],
        max_tokens: usize,
        interrupt: Arc<AtomicBool>,
    ) -> Result<String> {
        interrupt.store(false, Ordering::Relaxed);

        let mut messages = TextMessages::new();
        for turn in turns {
            messages = messages.add_message(turn.role.clone(), &turn.content);
        }

        let mut request = RequestBuilder::from(messages)
            .set_sampler_temperature(self.config.temperature)
            .set_sampler_topp(self.config.top_p)
            .set_sampler_max_len(max_tokens)
            .enable_thinking(false);
        if !self.config.stop_tokens.is_empty() {
            request = request.set_sampler_stop_toks(StopTokens::Seqs(self.config.stop_tokens.clone()));
        }

        let gen_start = Instant::now();
        let mut stream = self
            .model
            .stream_chat_request(request)
            .await
            .map_err(|e| SpeechError::Llm(format!("stream request failed: {e}")))?;

        let mut generated_text = String::new();
        let mut think_stripper = ThinkTagStripper::default();
        let mut reasoning_only_events: usize = 0;
        let mut has_visible_output = false;
        let mut first_token_received = false;
        let mut token_count: usize = 0;

        loop {
            if interrupt.load(Ordering::Relaxed) {
                info!("generation interrupted after {token_count} tokens (barge-in)");
                break;
            }

            let response = if !first_token_received {
                match tokio::time::timeout(FIRST_TOKEN_TIMEOUT, stream.next()).await {
                    Ok(Some(r)) => r,
                    Ok(None) => break,
                    Err(_) => {
                        return Err(SpeechError::Llm(
                            "first token timeout — model did not produce output in time".into(),
                        ));
                    }
                }
            } else {
                match stream.next().await {
                    Some(r) => r,
                    None => break,
                }
            };

            match response {
                Response::Chunk(chunk) => {
                    let Some(choice) = chunk.choices.first() else {
                        continue;
                    };
                    let content = choice.delta.content.as_deref().unwrap_or_default();
                    let reasoning = choice.delta.reasoning_content.as_deref().unwrap_or_default();
                    if content.is_empty() && reasoning.is_empty() {
                        continue;
                    }
                    if !first_token_received {
                        first_token_received = true;
                    }
                    token_count += 1;

                    if content.is_empty() && !reasoning.is_empty() {
                        reasoning_only_events += 1;
                        if should_abort_reasoning_only(
                            reasoning_only_events,
                            has_visible_output,
                            gen_start.elapsed(),
                        ) {
                            return Err(SpeechError::Llm(
                                "model produced reasoning-only output for too long".into(),
                            ));
                        }
                        continue;
                    }

                    let visible = think_stripper.push(content);
                    if !visible.is_empty() {
                        has_visible_output = true;
                        generated_text.push_str(&visible);
                    }
                }
                Response::Done(done) => {
                    if let Some(choice) = done.choices.first() {
                        let content = choice.message.content.as_deref().unwrap_or_default();
                        if !content.is_empty() {
                            let visible = think_stripper.push(content);
                            generated_text.push_str(&visible);
                        }
                    }
                    break;
                }
                Response::ModelError(msg, _) => {
                    return Err(SpeechError::Llm(format!("model error: {msg}")));
                }
                Response::InternalError(e) => {
                    return Err(SpeechError::Llm(format!("internal error: {e}")));
                }
                Response::ValidationError(e) => {
                    return Err(SpeechError::Llm(format!("validation error: {e}")));
                }
                _ => {}
            }
        }

        generated_text.push_str(&think_stripper.finish());
        let elapsed = gen_start.elapsed();
        info!(
            "generated {token_count} tokens in {:.1}s",
            elapsed.as_secs_f64()
        );
        Ok(generated_text.trim().to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn think_stripper_passes_plain_text() {
        let mut s = ThinkTagStripper::default();
        let out = s.push("hello world");
        let tail = s.finish();
        assert_eq!(format!("{out}{tail}"), "hello world");
    }

    #[test]
    fn think_stripper_removes_inline_block() {
        let mut s = ThinkTagStripper::default();
        let out = s.push("hi <think>hidden</think> there");
        let tail = s.finish();
        assert_eq!(format!("{out}{tail}"), "hi  there");
    }

    #[test]
    fn think_stripper_handles_split_tags() {
        let mut s = ThinkTagStripper::default();
        let a = s.push("pre<thi");
        let b = s.push("nk>hide");
        let c = s.push("n</thin");
        let d = s.push("k>post");
        let tail = s.finish();
        assert_eq!(format!("{a}{b}{c}{d}{tail}"), "prepost");
    }

    #[test]
    fn reasoning_only_cutoff_triggers_without_visible_output() {
        assert!(should_abort_reasoning_only(
            REASONING_ONLY_EVENT_LIMIT,
            false,
            REASONING_ONLY_DURATION_LIMIT
        ));
    }

    #[test]
    fn reasoning_only_cutoff_does_not_trigger_with_visible_output() {
        assert!(!should_abort_reasoning_only(
            REASONING_ONLY_EVENT_LIMIT * 2,
            true,
            REASONING_ONLY_DURATION_LIMIT * 2
        ));
    }

    #[test]
    fn reasoning_only_cutoff_does_not_trigger_before_time_limit() {
        assert!(!should_abort_reasoning_only(
            REASONING_ONLY_EVENT_LIMIT * 2,
            false,
            REASONING_ONLY_DURATION_LIMIT.saturating_sub(Duration::from_secs(1))
        ));
    }
}
