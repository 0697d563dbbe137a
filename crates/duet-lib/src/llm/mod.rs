//! Language-model stage.
//!
//! Vendors stream text in one of three shapes, all folded into
//! [`ModelFrame`]:
//!
//! - token deltas with an explicit finish reason (`openai`, `gemini`)
//! - whole-candidate snapshots, each replacing the previous one
//! - a single batch reply (`openai-batch`)
//!
//! [`GenerationStage`] turns frames into [`GenerationChunk`]s. Accumulation is
//! always computed here, never taken from the vendor, and every run ends in
//! exactly one final chunk.

pub mod gemini;
pub mod openai;

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tracing::{debug, warn};

use duet_core::types::{Capabilities, ChatMessage, GenerationChunk, GenerationConfig};

use crate::error::{PipelineError, PipelineResult};

/// Finish reason of a chunk standing in for a failed vendor call.
pub const FINISH_ERROR: &str = "error";

/// Finish reason of a canned reply that never reached a vendor.
pub const FINISH_FALLBACK: &str = "fallback";

/// Everything a model needs for one reply.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub system_prompt: String,
    /// Prior turns, oldest first.
    pub history: Vec<ChatMessage>,
    pub user_message: String,
    pub config: GenerationConfig,
}

impl GenerationRequest {
    /// System prompt, history, then the new user message.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        if !self.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(&self.system_prompt));
        }
        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::user(&self.user_message));
        messages
    }
}

/// Vendor output, before accumulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelFrame {
    /// New text to append.
    Delta {
        text: String,
        finish_reason: Option<String>,
    },
    /// The full candidate so far.
    Snapshot {
        text: String,
        finish_reason: Option<String>,
    },
    /// A whole reply in one piece.
    Complete {
        text: String,
        finish_reason: Option<String>,
    },
}

/// One vendor's language model.
pub trait LanguageModel: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Checked before any network call; out-of-range values are rejected,
    /// never clamped.
    fn validate(&self, config: &GenerationConfig) -> PipelineResult<()> {
        validate_generation_config(&self.capabilities(), config)
    }

    /// Lazy: nothing is sent until the stream is polled.
    fn stream(&self, request: GenerationRequest) -> BoxStream<'static, PipelineResult<ModelFrame>>;
}

pub fn validate_generation_config(
    caps: &Capabilities,
    config: &GenerationConfig,
) -> PipelineResult<()> {
    if !caps.supports_model(&config.model_name) {
        return Err(PipelineError::Validation(format!(
            "model {:?} is not offered by {}",
            config.model_name, caps.provider
        )));
    }
    if !(0.0..=2.0).contains(&config.temperature) {
        return Err(PipelineError::Validation(format!(
            "temperature {} outside 0.0..=2.0",
            config.temperature
        )));
    }
    if let Some(top_p) = config.top_p {
        if !(top_p > 0.0 && top_p <= 1.0) {
            return Err(PipelineError::Validation(format!(
                "top_p {top_p} outside (0.0, 1.0]"
            )));
        }
    }
    if let Some(max_tokens) = config.max_tokens {
        let limit = caps.max_output_tokens.unwrap_or(u32::MAX);
        if max_tokens == 0 || max_tokens > limit {
            return Err(PipelineError::Validation(format!(
                "max_tokens {max_tokens} outside 1..={limit}"
            )));
        }
    }
    Ok(())
}

// ─── Accumulation ──────────────────────────────────────────────────────────

/// Builds numbered chunks and their running text.
#[derive(Debug, Default)]
pub struct ChunkAccumulator {
    accumulated: String,
    next_index: u32,
    finished: bool,
}

impl ChunkAccumulator {
    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn emit(&mut self, content: String, finish_reason: Option<String>) -> Option<GenerationChunk> {
        if self.finished || (content.is_empty() && finish_reason.is_none()) {
            return None;
        }
        self.accumulated.push_str(&content);
        let chunk = GenerationChunk {
            content,
            accumulated_content: self.accumulated.clone(),
            is_final: finish_reason.is_some(),
            chunk_index: self.next_index,
            finish_reason,
        };
        self.next_index += 1;
        self.finished = chunk.is_final;
        Some(chunk)
    }

    pub fn push_delta(&mut self, text: String, finish_reason: Option<String>) -> Option<GenerationChunk> {
        self.emit(text, finish_reason)
    }

    /// Only the part of `text` beyond what was already emitted goes out. A
    /// snapshot that does not extend the accumulated text is skipped.
    pub fn push_snapshot(
        &mut self,
        text: String,
        finish_reason: Option<String>,
    ) -> Option<GenerationChunk> {
        match text.strip_prefix(self.accumulated.as_str()) {
            Some(suffix) => {
                let suffix = suffix.to_string();
                self.emit(suffix, finish_reason)
            }
            None => {
                warn!(
                    "llm: candidate diverged from emitted text ({} vs {} chars), frame skipped",
                    text.chars().count(),
                    self.accumulated.chars().count()
                );
                finish_reason.and_then(|reason| self.emit(String::new(), Some(reason)))
            }
        }
    }

    /// Final chunk for a stream that ended without a finish reason.
    pub fn finish(&mut self, reason: &str) -> Option<GenerationChunk> {
        self.emit(String::new(), Some(reason.to_string()))
    }

    /// Final chunk for a failed stream. Text already sent stands; if nothing
    /// was sent the apology becomes the reply.
    pub fn fail(&mut self, fallback: &str) -> Option<GenerationChunk> {
        let content = if self.accumulated.is_empty() {
            fallback.to_string()
        } else {
            String::new()
        };
        self.emit(content, Some(FINISH_ERROR.to_string()))
    }
}

// ─── Stage ─────────────────────────────────────────────────────────────────

/// Guarded view over one language model.
pub struct GenerationStage {
    model: Arc<dyn LanguageModel>,
    event_timeout: Duration,
    fallback_message: String,
}

impl GenerationStage {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        event_timeout: Duration,
        fallback_message: impl Into<String>,
    ) -> Self {
        Self {
            model,
            event_timeout,
            fallback_message: fallback_message.into(),
        }
    }

    pub fn provider(&self) -> String {
        self.model.capabilities().provider
    }

    pub fn validate(&self, config: &GenerationConfig) -> PipelineResult<()> {
        self.model.validate(config)
    }

    /// Validate, then stream the reply. A rejected config returns before the
    /// vendor is touched. Vendor failures and stalls end the stream with a
    /// terminal chunk rather than an error.
    pub fn run(
        &self,
        request: GenerationRequest,
    ) -> PipelineResult<BoxStream<'static, GenerationChunk>> {
        self.validate(&request.config)?;
        let mut inner = self.model.stream(request);
        let timeout = self.event_timeout;
        let fallback = self.fallback_message.clone();

        Ok(Box::pin(stream! {
            let mut acc = ChunkAccumulator::default();
            loop {
                let chunk = match tokio::time::timeout(timeout, inner.next()).await {
                    Ok(Some(Ok(frame))) => match frame {
                        ModelFrame::Delta { text, finish_reason } => acc.push_delta(text, finish_reason),
                        ModelFrame::Snapshot { text, finish_reason } => acc.push_snapshot(text, finish_reason),
                        ModelFrame::Complete { text, finish_reason } => {
                            acc.push_delta(text, Some(finish_reason.unwrap_or_else(|| "stop".into())))
                        }
                    },
                    Ok(Some(Err(e))) => {
                        warn!("llm: vendor failure after {} chars: {e}", acc.accumulated().chars().count());
                        acc.fail(&fallback)
                    }
                    Ok(None) => {
                        debug!("llm: stream ended without finish reason");
                        acc.finish("stop")
                    }
                    Err(_) => {
                        warn!("llm: no event within {timeout:?}");
                        acc.fail(&fallback)
                    }
                };

                if let Some(chunk) = chunk {
                    yield chunk;
                }
                if acc.is_finished() {
                    break;
                }
            }
        }))
    }

    /// A canned single-chunk reply that never reaches the vendor.
    pub fn fallback(&self, message: &str) -> BoxStream<'static, GenerationChunk> {
        let mut acc = ChunkAccumulator::default();
        let chunk = acc.push_delta(message.to_string(), Some(FINISH_FALLBACK.to_string()));
        Box::pin(futures_util::stream::iter(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLanguageModel;

    fn request(temperature: f32) -> GenerationRequest {
        GenerationRequest {
            system_prompt: "Be brief.".into(),
            history: vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")],
            user_message: "how are you".into(),
            config: GenerationConfig {
                temperature,
                ..Default::default()
            },
        }
    }

    fn assert_accumulates(chunks: &[GenerationChunk]) {
        let mut expected = String::new();
        for (i, chunk) in chunks.iter().enumerate() {
            expected.push_str(&chunk.content);
            assert_eq!(chunk.accumulated_content, expected, "chunk {i}");
            assert_eq!(chunk.chunk_index, i as u32);
        }
        assert_eq!(chunks.iter().filter(|c| c.is_final).count(), 1);
        assert!(chunks.last().unwrap().is_final);
    }

    async fn run(model: MockLanguageModel) -> Vec<GenerationChunk> {
        let stage = GenerationStage::new(Arc::new(model), Duration::from_millis(200), "sorry");
        stage.run(request(0.7)).unwrap().collect().await
    }

    fn delta(text: &str, finish: Option<&str>) -> ModelFrame {
        ModelFrame::Delta {
            text: text.into(),
            finish_reason: finish.map(Into::into),
        }
    }

    fn snapshot(text: &str, finish: Option<&str>) -> ModelFrame {
        ModelFrame::Snapshot {
            text: text.into(),
            finish_reason: finish.map(Into::into),
        }
    }

    // ── Accumulation across vendor shapes ───────────────────────────

    #[tokio::test]
    async fn deltas_accumulate() {
        let chunks = run(MockLanguageModel::new().with_frames(vec![
            delta("Hel", None),
            delta("", None),
            delta("lo", None),
            delta(" there", Some("stop")),
        ]))
        .await;
        assert_eq!(chunks.len(), 3);
        assert_accumulates(&chunks);
        assert_eq!(chunks[2].accumulated_content, "Hello there");
        assert_eq!(chunks[2].finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn snapshots_emit_suffixes() {
        let chunks = run(MockLanguageModel::new().with_frames(vec![
            snapshot("你好", None),
            snapshot("你好，世界", None),
            snapshot("完全不同", None),
            snapshot("你好，世界！", Some("stop")),
        ]))
        .await;
        let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["你好", "，世界", "！"]);
        assert_accumulates(&chunks);
    }

    #[tokio::test]
    async fn batch_reply_is_one_final_chunk() {
        let chunks = run(MockLanguageModel::new().with_frames(vec![ModelFrame::Complete {
            text: "All at once.".into(),
            finish_reason: None,
        }]))
        .await;
        assert_eq!(chunks.len(), 1);
        assert_accumulates(&chunks);
        assert_eq!(chunks[0].content, "All at once.");
        assert_eq!(chunks[0].finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn missing_finish_reason_closes_with_empty_final() {
        let chunks = run(MockLanguageModel::new().with_frames(vec![delta("a", None)])).await;
        assert_eq!(chunks.len(), 2);
        assert_accumulates(&chunks);
        assert_eq!(chunks[1].content, "");
    }

    // ── Failure handling ────────────────────────────────────────────

    #[tokio::test]
    async fn failure_before_content_yields_apology() {
        let chunks = run(MockLanguageModel::new().failing_after(0)).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "sorry");
        assert_eq!(chunks[0].finish_reason.as_deref(), Some(FINISH_ERROR));
        assert!(chunks[0].is_final);
    }

    #[tokio::test]
    async fn failure_after_content_keeps_partial_text() {
        let chunks = run(MockLanguageModel::new()
            .with_frames(vec![delta("partial ", None), delta("text", None)])
            .failing_after(2))
        .await;
        assert_accumulates(&chunks);
        let last = chunks.last().unwrap();
        assert_eq!(last.content, "");
        assert_eq!(last.accumulated_content, "partial text");
        assert_eq!(last.finish_reason.as_deref(), Some(FINISH_ERROR));
    }

    #[tokio::test]
    async fn stall_times_out_into_terminal_chunk() {
        let chunks = run(MockLanguageModel::new()
            .with_frames(vec![delta("slow", None)])
            .with_delay(Duration::from_secs(5)))
        .await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_final);
        assert_eq!(chunks[0].content, "sorry");
    }

    // ── Validation ──────────────────────────────────────────────────

    #[tokio::test]
    async fn out_of_range_temperature_makes_no_call() {
        let model = Arc::new(MockLanguageModel::new());
        let stage = GenerationStage::new(model.clone(), Duration::from_secs(1), "sorry");
        let err = stage.run(request(3.0)).err().unwrap();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(model.calls(), 0);
    }

    #[test]
    fn ranges_are_checked_not_clamped() {
        let caps = Capabilities::new("t", true)
            .with_models(&["m"])
            .with_limits(Some(8192), Some(1024));
        let ok = GenerationConfig {
            model_name: "m".into(),
            temperature: 2.0,
            top_p: Some(1.0),
            max_tokens: Some(1024),
        };
        assert!(validate_generation_config(&caps, &ok).is_ok());

        for bad in [
            GenerationConfig { model_name: "x".into(), ..ok.clone() },
            GenerationConfig { temperature: -0.1, ..ok.clone() },
            GenerationConfig { top_p: Some(0.0), ..ok.clone() },
            GenerationConfig { max_tokens: Some(0), ..ok.clone() },
            GenerationConfig { max_tokens: Some(1025), ..ok.clone() },
        ] {
            assert!(validate_generation_config(&caps, &bad).is_err(), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn fallback_is_single_final_chunk() {
        let stage = GenerationStage::new(Arc::new(MockLanguageModel::new()), Duration::from_secs(1), "sorry");
        let chunks: Vec<_> = stage.fallback("didn't catch that").collect().await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_final);
        assert_eq!(chunks[0].accumulated_content, "didn't catch that");
        assert_eq!(chunks[0].finish_reason.as_deref(), Some(FINISH_FALLBACK));
    }

    #[test]
    fn messages_order() {
        let msgs = request(0.5).messages();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0], ChatMessage::system("Be brief."));
        assert_eq!(msgs[3], ChatMessage::user("how are you"));
    }
}
