//! Shared types for the duet voice pipeline.
//!
//! Every value a turn hands from one stage to the next lives here, so the
//! adapters in duet-lib, the coordinator, and downstream consumers agree on
//! one event model without pulling in tokio or reqwest.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Audio ─────────────────────────────────────────────────────────────────

/// Default capture rate recognizers expect (16 kHz mono).
pub const STT_SAMPLE_RATE: u32 = 16_000;

/// Default synthesis rate.
pub const TTS_SAMPLE_RATE: u32 = 24_000;

/// Container/encoding of an audio payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    Pcm,
    Wav,
    Opus,
}

impl AudioFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Pcm => "pcm",
            AudioFormat::Wav => "wav",
            AudioFormat::Opus => "opus",
        }
    }

    /// Case-insensitive lookup, accepting a few common aliases.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp3" | "mpeg" | "lame" => Some(AudioFormat::Mp3),
            "pcm" | "raw" | "l16" => Some(AudioFormat::Pcm),
            "wav" | "wave" => Some(AudioFormat::Wav),
            "opus" | "ogg" => Some(AudioFormat::Opus),
            _ => None,
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One piece of synthesized audio. Chunks of a turn are strictly ordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub bytes: Vec<u8>,
    pub format: AudioFormat,
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(bytes: Vec<u8>, format: AudioFormat, sample_rate: u32) -> Self {
        Self {
            bytes,
            format,
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// ─── Transcription ─────────────────────────────────────────────────────────

/// Normalized recognizer output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    pub text: String,
    pub confidence: f32,
    pub is_final: bool,
    pub start_ms: u64,
    pub end_ms: u64,
    /// Set when the recognizer failed; `text` is then empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TranscriptEvent {
    pub fn partial(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
            is_final: false,
            start_ms: 0,
            end_ms: 0,
            error: None,
        }
    }

    pub fn finished(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            is_final: true,
            ..Self::partial(text, confidence)
        }
    }

    /// Terminal event standing in for a recognizer that failed or timed out.
    pub fn failed(marker: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            confidence: 0.0,
            is_final: true,
            start_ms: 0,
            end_ms: 0,
            error: Some(marker.into()),
        }
    }

    pub fn with_span(mut self, start_ms: u64, end_ms: u64) -> Self {
        self.start_ms = start_ms;
        self.end_ms = end_ms;
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

// ─── Generation ────────────────────────────────────────────────────────────

/// Normalized language-model output.
///
/// `accumulated_content` is always computed locally: after chunk *k* it equals
/// the concatenation of `content` over chunks `0..=k`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationChunk {
    pub content: String,
    pub accumulated_content: String,
    pub is_final: bool,
    pub chunk_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

// ─── Pipeline events ───────────────────────────────────────────────────────

/// Which part of a turn an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorScope {
    Turn,
    Transcription,
    Generation,
    Synthesis,
}

impl ErrorScope {
    /// Whether an error in this scope ends the turn without a `Complete`.
    ///
    /// Synthesis errors only cost the audio; the text already reached the
    /// client, so the turn still completes.
    pub fn suppresses_complete(self) -> bool {
        !matches!(self, ErrorScope::Synthesis)
    }
}

/// Everything the coordinator forwards to the multiplexer.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Status(String),
    TranscriptResult(TranscriptEvent),
    GenerationChunk(GenerationChunk),
    AudioChunk(AudioChunk),
    Error { scope: ErrorScope, message: String },
    Complete,
}

impl PipelineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::Status(_) => "status",
            PipelineEvent::TranscriptResult(_) => "transcript",
            PipelineEvent::GenerationChunk(_) => "generation",
            PipelineEvent::AudioChunk(_) => "audio",
            PipelineEvent::Error { .. } => "error",
            PipelineEvent::Complete => "complete",
        }
    }
}

// ─── Turn ──────────────────────────────────────────────────────────────────

/// Per-turn state machine.
///
/// ```text
/// Idle → Transcribing → Generating → Synthesizing → Completed
///   └──────────────────────↑   (text input skips Transcribing)
/// any non-terminal state → Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    Idle,
    Transcribing,
    Generating,
    Synthesizing,
    Completed,
    Failed,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TurnState::Completed | TurnState::Failed)
    }

    pub fn can_advance_to(self, next: TurnState) -> bool {
        use TurnState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Idle, Transcribing)
            | (Idle, Generating)
            | (Transcribing, Generating)
            | (Generating, Synthesizing)
            | (Synthesizing, Completed) => true,
            _ => false,
        }
    }
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: TurnState,
    pub to: TurnState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal turn transition {:?} -> {:?}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// Latency bookkeeping for one turn, in milliseconds from turn start.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnMetrics {
    pub transcription_ms: Option<u64>,
    pub first_token_ms: Option<u64>,
    pub generation_ms: Option<u64>,
    pub synthesis_ms: Option<u64>,
    pub output_tokens: usize,
}

impl TurnMetrics {
    /// Estimated generation throughput, measured from first token to final chunk.
    pub fn tokens_per_second(&self) -> Option<f64> {
        let first = self.first_token_ms?;
        let done = self.generation_ms?;
        let span = done.saturating_sub(first);
        if span == 0 || self.output_tokens == 0 {
            return None;
        }
        Some(self.output_tokens as f64 * 1000.0 / span as f64)
    }
}

/// One user-input-to-assistant-output cycle.
#[derive(Debug, Clone)]
pub struct Turn {
    pub turn_id: Uuid,
    pub conversation_id: String,
    pub transcript: Option<String>,
    pub generated_text: Option<String>,
    pub audio_chunks: Vec<AudioChunk>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metrics: TurnMetrics,
    state: TurnState,
}

impl Turn {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            turn_id: Uuid::new_v4(),
            conversation_id: conversation_id.into(),
            transcript: None,
            generated_text: None,
            audio_chunks: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            metrics: TurnMetrics::default(),
            state: TurnState::Idle,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn advance(&mut self, next: TurnState) -> Result<(), InvalidTransition> {
        if !self.state.can_advance_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Move to `Failed` unless the turn already ended.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = TurnState::Failed;
            self.completed_at = Some(Utc::now());
        }
    }

    /// Milliseconds since the turn started.
    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as u64
    }

    pub fn audio_bytes(&self) -> usize {
        self.audio_chunks.iter().map(AudioChunk::len).sum()
    }

    pub fn summary(&self) -> TurnSummary {
        TurnSummary {
            turn_id: self.turn_id,
            state: self.state,
            transcript_chars: self.transcript.as_deref().map_or(0, |t| t.chars().count()),
            generated_chars: self
                .generated_text
                .as_deref()
                .map_or(0, |t| t.chars().count()),
            audio_chunks: self.audio_chunks.len(),
            audio_bytes: self.audio_bytes(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            metrics: self.metrics.clone(),
        }
    }
}

/// Archived view of a finished turn.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnSummary {
    pub turn_id: Uuid,
    pub state: TurnState,
    pub transcript_chars: usize,
    pub generated_chars: usize,
    pub audio_chunks: usize,
    pub audio_bytes: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metrics: TurnMetrics,
}

// ─── Conversation context ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of model context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Author of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    User,
    Assistant,
}

impl SenderType {
    pub fn role(self) -> Role {
        match self {
            SenderType::User => Role::User,
            SenderType::Assistant => Role::Assistant,
        }
    }
}

/// Persona and per-conversation settings from the context provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationProfile {
    pub persona: String,
    pub character_name: String,
    pub context_window_size: Option<usize>,
    pub temperature: Option<f32>,
    pub voice_id: Option<String>,
    pub language: Option<String>,
    pub model_name: Option<String>,
    pub max_tokens: Option<u32>,
}

impl Default for ConversationProfile {
    fn default() -> Self {
        Self {
            persona: String::new(),
            character_name: "Assistant".into(),
            context_window_size: None,
            temperature: None,
            voice_id: None,
            language: None,
            model_name: None,
            max_tokens: None,
        }
    }
}

// ─── Provider configuration ────────────────────────────────────────────────

/// Recognizer input description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SttConfig {
    pub language: String,
    pub sample_rate: u32,
    pub format: AudioFormat,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            language: "zh-CN".into(),
            sample_rate: STT_SAMPLE_RATE,
            format: AudioFormat::Pcm,
        }
    }
}

/// Language-model parameters. Validated by the adapter, never clamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub model_name: String,
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model_name: String::new(),
            temperature: 0.7,
            top_p: None,
            max_tokens: None,
        }
    }
}

/// Synthesis parameters. `speed`, `volume` and `pitch` are ratios around 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisConfig {
    pub voice_id: String,
    pub language: String,
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub speed: f32,
    pub volume: f32,
    pub pitch: f32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            voice_id: "xiaoyan".into(),
            language: "zh-CN".into(),
            format: AudioFormat::Mp3,
            sample_rate: TTS_SAMPLE_RATE,
            speed: 1.0,
            volume: 1.0,
            pitch: 1.0,
        }
    }
}

/// Server-side fallbacks for fields a profile leaves unset.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderDefaults {
    pub model_name: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub context_window: usize,
    pub voice_id: String,
    pub language: String,
    pub audio_format: AudioFormat,
    pub audio_sample_rate: u32,
}

impl Default for ProviderDefaults {
    fn default() -> Self {
        Self {
            model_name: String::new(),
            temperature: 0.7,
            max_tokens: None,
            context_window: 10,
            voice_id: "xiaoyan".into(),
            language: "zh-CN".into(),
            audio_format: AudioFormat::Mp3,
            audio_sample_rate: TTS_SAMPLE_RATE,
        }
    }
}

/// Immutable per-turn configuration for all three stages.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub stt: SttConfig,
    pub generation: GenerationConfig,
    pub synthesis: SynthesisConfig,
    pub context_window: usize,
}

impl ProviderConfig {
    /// Merge a conversation profile over server defaults. `input` describes
    /// the audio the client announced, when there is any.
    pub fn resolve(
        profile: &ConversationProfile,
        defaults: &ProviderDefaults,
        input: Option<(AudioFormat, u32)>,
    ) -> Self {
        let language = profile
            .language
            .clone()
            .unwrap_or_else(|| defaults.language.clone());
        let (format, sample_rate) = input.unwrap_or((AudioFormat::Pcm, STT_SAMPLE_RATE));

        Self {
            stt: SttConfig {
                language: language.clone(),
                sample_rate,
                format,
            },
            generation: GenerationConfig {
                model_name: profile
                    .model_name
                    .clone()
                    .unwrap_or_else(|| defaults.model_name.clone()),
                temperature: profile.temperature.unwrap_or(defaults.temperature),
                top_p: None,
                max_tokens: profile.max_tokens.or(defaults.max_tokens),
            },
            synthesis: SynthesisConfig {
                voice_id: profile
                    .voice_id
                    .clone()
                    .unwrap_or_else(|| defaults.voice_id.clone()),
                language,
                format: defaults.audio_format,
                sample_rate: defaults.audio_sample_rate,
                ..SynthesisConfig::default()
            },
            context_window: profile.context_window_size.unwrap_or(defaults.context_window),
        }
    }
}

// ─── Capabilities ──────────────────────────────────────────────────────────

/// What an adapter reports about itself before any call is made.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub provider: String,
    pub available: bool,
    pub streaming: bool,
    pub supported_models: Vec<String>,
    pub supported_voices: Vec<String>,
    pub languages: Vec<String>,
    pub max_context_length: Option<u32>,
    pub max_output_tokens: Option<u32>,
}

impl Capabilities {
    pub fn new(provider: impl Into<String>, available: bool) -> Self {
        Self {
            provider: provider.into(),
            available,
            streaming: true,
            supported_models: Vec::new(),
            supported_voices: Vec::new(),
            languages: Vec::new(),
            max_context_length: None,
            max_output_tokens: None,
        }
    }

    pub fn batch(mut self) -> Self {
        self.streaming = false;
        self
    }

    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.supported_models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_voices(mut self, voices: &[&str]) -> Self {
        self.supported_voices = voices.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn with_languages(mut self, languages: &[&str]) -> Self {
        self.languages = languages.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn with_limits(mut self, max_context: Option<u32>, max_output: Option<u32>) -> Self {
        self.max_context_length = max_context;
        self.max_output_tokens = max_output;
        self
    }

    /// An empty model list means the adapter accepts any model name.
    pub fn supports_model(&self, model: &str) -> bool {
        self.supported_models.is_empty() || self.supported_models.iter().any(|m| m == model)
    }

    pub fn supports_voice(&self, voice: &str) -> bool {
        self.supported_voices.is_empty() || self.supported_voices.iter().any(|v| v == voice)
    }
}
