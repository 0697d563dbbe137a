//! In-process adapters for every stage.
//!
//! Registered under the id `mock`, so a server started without vendor
//! credentials still completes turns end to end. Tests use the builder
//! methods to script stalls, failures and odd vendor shapes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_stream::stream;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tracing::debug;

use duet_core::types::{AudioChunk, Capabilities, SttConfig, SynthesisConfig, TranscriptEvent};

use crate::error::{PipelineError, PipelineResult};
use crate::ingest::AudioStream;
use crate::llm::{GenerationRequest, LanguageModel, ModelFrame};
use crate::stt::SpeechRecognizer;
use crate::tts::SpeechSynthesizer;

/// Bytes of silence per synthesized reply.
pub const MOCK_AUDIO_BYTES: usize = 4096;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Sets its flag when the stream holding it is dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

// ─── STT ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SttBehavior {
    #[default]
    Normal,
    Stall,
    Fail,
    NoFinal,
}

/// Hears `text` in any non-empty audio; silence transcribes to nothing.
#[derive(Debug)]
pub struct MockRecognizer {
    text: String,
    behavior: SttBehavior,
    calls: Arc<AtomicUsize>,
}

impl Default for MockRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRecognizer {
    pub fn new() -> Self {
        Self {
            text: "hello there".into(),
            behavior: SttBehavior::Normal,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = text.into();
        self
    }

    /// Never produce an event.
    pub fn stalling(mut self) -> Self {
        self.behavior = SttBehavior::Stall;
        self
    }

    pub fn failing(mut self) -> Self {
        self.behavior = SttBehavior::Fail;
        self
    }

    /// Partials only; the stream closes without a final result.
    pub fn without_final(mut self) -> Self {
        self.behavior = SttBehavior::NoFinal;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SpeechRecognizer for MockRecognizer {
    fn capabilities(&self) -> Capabilities {
        Capabilities::new("mock", true)
    }

    fn transcribe(
        &self,
        mut audio: AudioStream,
        _config: &SttConfig,
    ) -> BoxStream<'static, PipelineResult<TranscriptEvent>> {
        let calls = self.calls.clone();
        let behavior = self.behavior;
        let text = self.text.clone();

        Box::pin(stream! {
            calls.fetch_add(1, Ordering::SeqCst);
            let mut heard = 0usize;
            while let Some(frame) = audio.next().await {
                heard += frame.len();
            }
            match behavior {
                SttBehavior::Stall => futures_util::future::pending::<()>().await,
                SttBehavior::Fail => {
                    yield Err(PipelineError::Transport("mock vendor refused the audio".into()));
                    return;
                }
                _ => {}
            }
            if heard == 0 {
                yield Ok(TranscriptEvent::finished("", 0.0));
                return;
            }

            let words: Vec<&str> = text.split_whitespace().collect();
            let first = words.first().copied().unwrap_or_default();
            yield Ok(TranscriptEvent::partial(first, 0.6));
            yield Ok(TranscriptEvent::partial(text.clone(), 0.8));
            if behavior != SttBehavior::NoFinal {
                yield Ok(TranscriptEvent::finished(text.clone(), 0.95));
            }
        })
    }
}

// ─── LLM ───────────────────────────────────────────────────────────────────

/// Echoes the user message back as token deltas unless frames are scripted.
#[derive(Debug)]
pub struct MockLanguageModel {
    frames: Option<Vec<ModelFrame>>,
    fail_after: Option<usize>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    dropped: Arc<AtomicBool>,
    last_request: Arc<Mutex<Option<GenerationRequest>>>,
}

impl Default for MockLanguageModel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLanguageModel {
    pub fn new() -> Self {
        Self {
            frames: None,
            fail_after: None,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            dropped: Arc::new(AtomicBool::new(false)),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_frames(mut self, frames: Vec<ModelFrame>) -> Self {
        self.frames = Some(frames);
        self
    }

    /// Fail once `n` frames have gone out.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Pause before every frame.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether a stream handed out by this model has been dropped.
    pub fn stream_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<GenerationRequest> {
        lock(&self.last_request).clone()
    }
}

fn echo_frames(user_message: &str) -> Vec<ModelFrame> {
    let reply = format!("You said: {}", user_message.trim());
    let words: Vec<&str> = reply.split_inclusive(' ').collect();
    let last = words.len().saturating_sub(1);
    words
        .iter()
        .enumerate()
        .map(|(i, word)| ModelFrame::Delta {
            text: word.to_string(),
            finish_reason: (i == last).then(|| "stop".to_string()),
        })
        .collect()
}

impl LanguageModel for MockLanguageModel {
    fn capabilities(&self) -> Capabilities {
        Capabilities::new("mock", true).with_limits(Some(8_192), Some(4_096))
    }

    fn stream(&self, request: GenerationRequest) -> BoxStream<'static, PipelineResult<ModelFrame>> {
        let frames = self
            .frames
            .clone()
            .unwrap_or_else(|| echo_frames(&request.user_message));
        *lock(&self.last_request) = Some(request);
        let calls = self.calls.clone();
        let guard = DropFlag(self.dropped.clone());
        let fail_after = self.fail_after;
        let delay = self.delay;

        Box::pin(stream! {
            let _guard = guard;
            calls.fetch_add(1, Ordering::SeqCst);
            for (i, frame) in frames.into_iter().enumerate() {
                if fail_after == Some(i) {
                    yield Err(PipelineError::Transport("mock vendor dropped the stream".into()));
                    return;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(frame);
            }
            if let Some(n) = fail_after {
                debug!("mock llm: failing after {n} frames");
                yield Err(PipelineError::Transport("mock vendor dropped the stream".into()));
            }
        })
    }
}

// ─── TTS ───────────────────────────────────────────────────────────────────

/// Answers every text with [`MOCK_AUDIO_BYTES`] of silence in one chunk.
#[derive(Debug)]
pub struct MockSynthesizer {
    fail: bool,
    delay: Duration,
    texts: Arc<Mutex<Vec<String>>>,
}

impl Default for MockSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSynthesizer {
    pub fn new() -> Self {
        Self {
            fail: false,
            delay: Duration::ZERO,
            texts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        lock(&self.texts).len()
    }

    /// Texts received, in call order.
    pub fn texts(&self) -> Vec<String> {
        lock(&self.texts).clone()
    }
}

impl SpeechSynthesizer for MockSynthesizer {
    fn capabilities(&self) -> Capabilities {
        Capabilities::new("mock", true)
    }

    fn synthesize(
        &self,
        text: String,
        config: &SynthesisConfig,
    ) -> BoxStream<'static, PipelineResult<AudioChunk>> {
        let texts = self.texts.clone();
        let fail = self.fail;
        let delay = self.delay;
        let format = config.format;
        let sample_rate = config.sample_rate;

        Box::pin(stream! {
            lock(&texts).push(text);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if fail {
                yield Err(PipelineError::Transport("mock vendor could not synthesize".into()));
                return;
            }
            yield Ok(AudioChunk::new(vec![0u8; MOCK_AUDIO_BYTES], format, sample_rate));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::AudioClip;
    use duet_core::types::AudioFormat;
    use duet_core::types::GenerationConfig;

    #[tokio::test]
    async fn silence_transcribes_to_nothing() {
        let rec = MockRecognizer::new();
        let events: Vec<_> = rec
            .transcribe(AudioClip::new(Vec::new(), AudioFormat::Pcm, 16_000).into_stream(), &SttConfig::default())
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        let event = events[0].as_ref().unwrap();
        assert!(event.is_final);
        assert!(event.text.is_empty());
        assert_eq!(rec.calls(), 1);
    }

    #[tokio::test]
    async fn echo_reply_ends_with_finish_reason() {
        let llm = MockLanguageModel::new();
        let request = GenerationRequest {
            system_prompt: String::new(),
            history: Vec::new(),
            user_message: "hi there".into(),
            config: GenerationConfig::default(),
        };
        let frames: Vec<ModelFrame> = llm.stream(request).map(Result::unwrap).collect().await;
        let text: String = frames
            .iter()
            .map(|f| match f {
                ModelFrame::Delta { text, .. } => text.as_str(),
                _ => "",
            })
            .collect();
        assert_eq!(text, "You said: hi there");
        assert!(matches!(
            frames.last(),
            Some(ModelFrame::Delta { finish_reason: Some(_), .. })
        ));
        assert!(llm.stream_dropped());
        assert_eq!(llm.last_request().unwrap().user_message, "hi there");
    }
}
