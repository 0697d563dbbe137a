//! Batch transcription against an OpenAI-compatible Whisper server.
//!
//! The whole clip is uploaded in one multipart request; the reply becomes a
//! single final event. Raw PCM is wrapped in a WAV container first.

use async_stream::stream;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tracing::debug;

use duet_core::types::{AudioFormat, Capabilities, SttConfig, TranscriptEvent};
use duet_core::wav::{pcm_duration_ms, pcm_to_wav};

use crate::config::WhisperSettings;
use crate::error::{PipelineError, PipelineResult};
use crate::ingest::AudioStream;
use crate::stt::SpeechRecognizer;

pub struct WhisperRecognizer {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl WhisperRecognizer {
    pub fn new(settings: &WhisperSettings, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!(
                "{}/v1/audio/transcriptions",
                settings.base_url.trim_end_matches('/')
            ),
            model: settings.model.clone(),
            api_key,
        }
    }
}

impl SpeechRecognizer for WhisperRecognizer {
    fn capabilities(&self) -> Capabilities {
        Capabilities::new("whisper", true)
            .batch()
            .with_models(&[self.model.as_str()])
    }

    fn transcribe(
        &self,
        audio: AudioStream,
        config: &SttConfig,
    ) -> BoxStream<'static, PipelineResult<TranscriptEvent>> {
        let client = self.client.clone();
        let url = self.url.clone();
        let model = self.model.clone();
        let api_key = self.api_key.clone();
        let config = config.clone();

        Box::pin(stream! {
            let frames: Vec<Vec<u8>> = audio.collect().await;
            let raw = frames.concat();
            if raw.is_empty() {
                yield Ok(TranscriptEvent::finished("", 0.0));
                return;
            }

            let (file, capture_ms) = match config.format {
                AudioFormat::Pcm => (
                    pcm_to_wav(&raw, config.sample_rate),
                    Some(pcm_duration_ms(raw.len(), config.sample_rate)),
                ),
                _ => (raw, None),
            };
            let upload = Upload {
                file,
                format: config.format,
                language: whisper_language(&config.language),
                model: &model,
            };

            match transcribe_file(&client, &url, api_key.as_deref(), upload).await {
                Ok((text, duration_ms)) => {
                    let end_ms = duration_ms.or(capture_ms).unwrap_or(0);
                    let confidence = if text.is_empty() { 0.0 } else { 1.0 };
                    yield Ok(TranscriptEvent::finished(text, confidence).with_span(0, end_ms));
                }
                Err(e) => yield Err(e),
            }
        })
    }
}

/// Whisper takes ISO-639-1 codes: `zh-CN` → `zh`.
fn whisper_language(language: &str) -> String {
    language
        .split(['-', '_'])
        .next()
        .unwrap_or(language)
        .to_ascii_lowercase()
}

struct Upload<'a> {
    file: Vec<u8>,
    format: AudioFormat,
    language: String,
    model: &'a str,
}

fn file_meta(format: AudioFormat) -> (&'static str, &'static str) {
    match format {
        AudioFormat::Pcm | AudioFormat::Wav => ("audio.wav", "audio/wav"),
        AudioFormat::Mp3 => ("audio.mp3", "audio/mpeg"),
        AudioFormat::Opus => ("audio.ogg", "audio/ogg"),
    }
}

async fn transcribe_file(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    upload: Upload<'_>,
) -> PipelineResult<(String, Option<u64>)> {
    let (file_name, mime) = file_meta(upload.format);
    let part = reqwest::multipart::Part::bytes(upload.file)
        .file_name(file_name)
        .mime_str(mime)?;

    let form = reqwest::multipart::Form::new()
        .part("file", part)
        .text("model", upload.model.to_string())
        .text("language", upload.language)
        .text("response_format", "json");

    let mut request = client.post(url).multipart(form);
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }
    let resp = request.send().await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(PipelineError::Vendor {
            code: i64::from(status.as_u16()),
            message: body,
        });
    }

    let body = resp.text().await?;
    let value: serde_json::Value = serde_json::from_str(&body)
        .map_err(|e| PipelineError::Decode(format!("{e}; raw={body}")))?;

    let raw_text = value.get("text").and_then(|v| v.as_str()).unwrap_or("");
    let text = raw_text.replace("[BLANK_AUDIO]", "").trim().to_string();
    let duration_ms = value.get("duration_ms").and_then(|v| v.as_u64());
    debug!("whisper: {} chars transcribed", text.chars().count());

    Ok((text, duration_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::AudioClip;
    use axum::Router;
    use axum::extract::Multipart;
    use axum::http::StatusCode;
    use axum::routing::post;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn recognizer(base_url: String) -> WhisperRecognizer {
        WhisperRecognizer::new(
            &WhisperSettings {
                base_url,
                ..Default::default()
            },
            None,
        )
    }

    fn clip() -> AudioStream {
        AudioClip::new(vec![vec![0u8; 3200]], AudioFormat::Pcm, 16_000).into_stream()
    }

    #[test]
    fn language_codes() {
        assert_eq!(whisper_language("zh-CN"), "zh");
        assert_eq!(whisper_language("en_US"), "en");
        assert_eq!(whisper_language("ja"), "ja");
    }

    #[tokio::test]
    async fn uploads_wav_and_returns_single_final() {
        let app = Router::new().route(
            "/v1/audio/transcriptions",
            post(|mut form: Multipart| async move {
                let mut saw_wav = false;
                let mut language = String::new();
                while let Some(field) = form.next_field().await.unwrap() {
                    match field.name() {
                        Some("file") => saw_wav = field.bytes().await.unwrap().starts_with(b"RIFF"),
                        Some("language") => language = field.text().await.unwrap(),
                        _ => {}
                    }
                }
                assert!(saw_wav);
                axum::Json(serde_json::json!({
                    "text": format!(" [BLANK_AUDIO] hello from {language} "),
                }))
            }),
        );
        let base = serve(app).await;

        let events: Vec<_> = recognizer(base)
            .transcribe(clip(), &SttConfig::default())
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        let event = events[0].as_ref().unwrap();
        assert!(event.is_final);
        assert_eq!(event.text, "hello from zh");
        assert_eq!(event.end_ms, 100);
    }

    #[tokio::test]
    async fn http_error_is_vendor_error() {
        let app = Router::new().route(
            "/v1/audio/transcriptions",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "model loading") }),
        );
        let base = serve(app).await;

        let events: Vec<_> = recognizer(base)
            .transcribe(clip(), &SttConfig::default())
            .collect()
            .await;
        match &events[0] {
            Err(PipelineError::Vendor { code, message }) => {
                assert_eq!(*code, 503);
                assert_eq!(message, "model loading");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_clip_skips_upload() {
        let rec = recognizer("http://127.0.0.1:9".into());
        let empty = AudioClip::new(Vec::new(), AudioFormat::Pcm, 16_000).into_stream();
        let events: Vec<_> = rec.transcribe(empty, &SttConfig::default()).collect().await;
        let event = events[0].as_ref().unwrap();
        assert!(event.is_final);
        assert!(event.text.is_empty());
    }
}
