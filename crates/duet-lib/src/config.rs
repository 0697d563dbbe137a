//! Server configuration.
//!
//! Loaded from TOML; every section and field has a default, so an empty file
//! (or no file at all) yields a server wired to the mock providers.
//! Credentials are never stored in the file: provider sections name the
//! environment variable that holds each secret.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use duet_core::text_prep::DEFAULT_SEGMENT_CHARS;
use duet_core::types::{AudioFormat, ProviderDefaults, TTS_SAMPLE_RATE};

use crate::error::{PipelineError, PipelineResult};

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub pipeline: PipelineSettings,
    pub providers: ProviderSettings,
    pub conversations: Vec<ConversationSeed>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Upper bound on audio buffered for one turn.
    pub max_audio_bytes: usize,
    /// Binary payloads above this size go out as several frames.
    pub max_binary_frame: usize,
    /// How long a closing session waits for its turn to unwind.
    pub cancel_grace_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 2003,
            max_audio_bytes: 10 * 1024 * 1024,
            max_binary_frame: 50 * 1024,
            cancel_grace_ms: 500,
        }
    }
}

/// How finalized text is handed to the synthesizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthesisMode {
    /// One synthesis call for the whole reply.
    #[default]
    Whole,
    /// Sentence segments batched into small windows.
    Segmented,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Registry ids of the active adapters.
    pub stt: String,
    pub llm: String,
    pub tts: String,

    pub default_model: String,
    pub default_temperature: f32,
    pub default_max_tokens: Option<u32>,
    pub default_context_window: usize,
    pub default_voice: String,
    pub default_language: String,
    pub audio_format: AudioFormat,
    pub audio_sample_rate: u32,

    /// Longest wait for the next vendor event, per stage.
    pub stt_timeout_ms: u64,
    pub llm_timeout_ms: u64,
    pub tts_timeout_ms: u64,
    /// Longest a checkpoint write may hold up the next stage.
    pub persistence_flush_ms: u64,

    pub synthesis_mode: SynthesisMode,
    pub segment_max_items: usize,
    pub segment_max_chars: usize,
    pub segment_window_ms: u64,

    /// Spoken when the language model fails before producing any text.
    pub fallback_message: String,
    /// Spoken when nothing intelligible was transcribed.
    pub unheard_message: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stt: "mock".into(),
            llm: "mock".into(),
            tts: "mock".into(),
            default_model: String::new(),
            default_temperature: 0.7,
            default_max_tokens: Some(1024),
            default_context_window: 10,
            default_voice: "xiaoyan".into(),
            default_language: "zh-CN".into(),
            audio_format: AudioFormat::Mp3,
            audio_sample_rate: TTS_SAMPLE_RATE,
            stt_timeout_ms: 15_000,
            llm_timeout_ms: 30_000,
            tts_timeout_ms: 20_000,
            persistence_flush_ms: 2_000,
            synthesis_mode: SynthesisMode::Whole,
            segment_max_items: 3,
            segment_max_chars: DEFAULT_SEGMENT_CHARS,
            segment_window_ms: 300,
            fallback_message: "Sorry, the AI service is temporarily unavailable. Please try again later."
                .into(),
            unheard_message: "Sorry, I didn't catch that. Could you say it again?".into(),
        }
    }
}

impl PipelineSettings {
    pub fn provider_defaults(&self) -> ProviderDefaults {
        ProviderDefaults {
            model_name: self.default_model.clone(),
            temperature: self.default_temperature,
            max_tokens: self.default_max_tokens,
            context_window: self.default_context_window,
            voice_id: self.default_voice.clone(),
            language: self.default_language.clone(),
            audio_format: self.audio_format,
            audio_sample_rate: self.audio_sample_rate,
        }
    }

    pub fn stt_timeout(&self) -> Duration {
        Duration::from_millis(self.stt_timeout_ms)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_timeout_ms)
    }

    pub fn tts_timeout(&self) -> Duration {
        Duration::from_millis(self.tts_timeout_ms)
    }

    pub fn persistence_flush(&self) -> Duration {
        Duration::from_millis(self.persistence_flush_ms)
    }
}

// ─── Providers ─────────────────────────────────────────────────────────────

/// Vendor sections. An absent section means the adapter is not registered.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub whisper: Option<WhisperSettings>,
    pub chunked_stt: Option<ChunkedSttSettings>,
    pub xunfei: Option<XunfeiSettings>,
    pub openai: Option<OpenAiSettings>,
    pub gemini: Option<GeminiSettings>,
    pub speech: Option<SpeechSettings>,
    pub volcan: Option<VolcanSettings>,
}

/// OpenAI-compatible batch transcription endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WhisperSettings {
    pub base_url: String,
    pub model: String,
    pub api_key_env: Option<String>,
}

impl Default for WhisperSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:2022".into(),
            model: "whisper-1".into(),
            api_key_env: None,
        }
    }
}

/// Streaming recognizer behind a chunked HTTP endpoint returning NDJSON.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkedSttSettings {
    pub url: String,
    pub api_key_env: Option<String>,
    pub window_ms: u64,
}

impl Default for ChunkedSttSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:2024/v1/stream/recognize".into(),
            api_key_env: None,
            window_ms: 100,
        }
    }
}

/// Xunfei open platform credentials, shared by its STT and TTS sockets.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct XunfeiSettings {
    pub app_id: String,
    /// `wss` when true, plain `ws` otherwise (local stand-ins).
    pub tls: bool,
    pub api_key_env: String,
    pub api_secret_env: String,
    pub stt_host: String,
    pub stt_path: String,
    pub tts_host: String,
    pub tts_path: String,
    /// Keep-alive period while awaiting recognition results.
    pub keepalive_ms: u64,
    /// Pause between uploaded audio frames; the vendor expects near real time.
    pub frame_interval_ms: u64,
}

impl Default for XunfeiSettings {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            tls: true,
            api_key_env: "XUNFEI_API_KEY".into(),
            api_secret_env: "XUNFEI_API_SECRET".into(),
            stt_host: "iat-api.xfyun.cn".into(),
            stt_path: "/v2/iat".into(),
            tts_host: "tts-api.xfyun.cn".into(),
            tts_path: "/v2/tts".into(),
            keepalive_ms: 30_000,
            frame_interval_ms: 40,
        }
    }
}

/// Key pair for signing Xunfei socket URLs.
#[derive(Debug, Clone)]
pub struct XunfeiCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl XunfeiSettings {
    pub fn credentials(&self) -> Option<XunfeiCredentials> {
        Some(XunfeiCredentials {
            api_key: secret(&self.api_key_env)?,
            api_secret: secret(&self.api_secret_env)?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub api_key_env: String,
    pub default_model: String,
    /// Overrides the built-in model list, e.g. for compatible gateways.
    pub models: Option<Vec<String>>,
    pub timeout_secs: u64,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            default_model: "gpt-3.5-turbo".into(),
            models: None,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeminiSettings {
    pub base_url: String,
    pub api_key_env: String,
    pub default_model: String,
    pub window_ms: u64,
    pub timeout_secs: u64,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com".into(),
            api_key_env: "GEMINI_API_KEY".into(),
            default_model: "gemini-1.5-flash".into(),
            window_ms: 100,
            timeout_secs: 60,
        }
    }
}

/// OpenAI-compatible `/v1/audio/speech` synthesizer (Kokoro, OpenAI, ...).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeechSettings {
    pub base_url: String,
    pub model: String,
    pub api_key_env: Option<String>,
    pub voices: Vec<String>,
}

impl Default for SpeechSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8880".into(),
            model: "kokoro".into(),
            api_key_env: None,
            voices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VolcanSettings {
    pub base_url: String,
    pub app_id: String,
    pub cluster: String,
    pub access_token_env: String,
}

impl Default for VolcanSettings {
    fn default() -> Self {
        Self {
            base_url: "https://openspeech.bytedance.com".into(),
            app_id: String::new(),
            cluster: "volcano_tts".into(),
            access_token_env: "VOLCAN_ACCESS_TOKEN".into(),
        }
    }
}

/// Seed data for the in-memory conversation store.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConversationSeed {
    pub id: String,
    pub owner: String,
    pub character_name: Option<String>,
    pub persona: String,
    pub context_window: Option<usize>,
    pub temperature: Option<f32>,
    pub voice_id: Option<String>,
    pub language: Option<String>,
    pub model: Option<String>,
}

// ─── Loading ───────────────────────────────────────────────────────────────

impl Settings {
    /// Load configuration from a TOML file. Missing fields use defaults.
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("{}: {e}", path.display())))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> PipelineResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Load from `path` if given and present, else defaults. A file that
    /// exists but does not parse is still an error.
    pub fn load_or_default(path: Option<&Path>) -> PipelineResult<Self> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            _ => Ok(Self::default()),
        }
    }

    /// Apply environment variable overrides.
    ///
    /// - `DUET_HOST` / `DUET_PORT` → server address
    /// - `DUET_STT` / `DUET_LLM` / `DUET_TTS` → active provider ids
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(host) = env_nonempty("DUET_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_nonempty("DUET_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(id) = env_nonempty("DUET_STT") {
            self.pipeline.stt = id;
        }
        if let Some(id) = env_nonempty("DUET_LLM") {
            self.pipeline.llm = id;
        }
        if let Some(id) = env_nonempty("DUET_TTS") {
            self.pipeline.tts = id;
        }
        self
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Resolve a credential from the environment variable `env_name`.
pub fn secret(env_name: &str) -> Option<String> {
    env_nonempty(env_name)
}
