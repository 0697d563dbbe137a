//! Streaming recognizer over chunked HTTP.
//!
//! Audio goes up as a chunked request body while results come back on the
//! same response as newline-delimited JSON:
//!
//! ```text
//! {"text":"你","isFinal":false,"confidence":0.6}
//! {"text":"你好","isFinal":true,"confidence":0.93,"startMs":0,"endMs":820}
//! ```
//!
//! Response bytes are grouped into short windows and only complete objects
//! are parsed; a half-received object waits for the next window.

use std::time::Duration;

use async_stream::stream;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Deserialize;
use tracing::{debug, warn};

use duet_core::types::{AudioFormat, Capabilities, SttConfig, TranscriptEvent};

use crate::config::ChunkedSttSettings;
use crate::error::{PipelineError, PipelineResult};
use crate::framing::{JsonObjectFramer, windowed};
use crate::ingest::AudioStream;
use crate::stt::SpeechRecognizer;

pub struct ChunkedRecognizer {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    window: Duration,
}

impl ChunkedRecognizer {
    pub fn new(settings: &ChunkedSttSettings, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: settings.url.clone(),
            api_key,
            window: Duration::from_millis(settings.window_ms),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultLine {
    #[serde(default)]
    text: String,
    #[serde(default, alias = "is_final")]
    is_final: bool,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default, alias = "start_ms")]
    start_ms: u64,
    #[serde(default, alias = "end_ms")]
    end_ms: u64,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<i64>,
}

fn parse_result(raw: &[u8]) -> PipelineResult<TranscriptEvent> {
    let line: ResultLine = serde_json::from_slice(raw)?;
    if let Some(message) = line.error {
        return Err(PipelineError::Vendor {
            code: line.code.unwrap_or(-1),
            message,
        });
    }
    let confidence = line.confidence.unwrap_or(if line.is_final { 1.0 } else { 0.0 });
    let event = if line.is_final {
        TranscriptEvent::finished(line.text, confidence)
    } else {
        TranscriptEvent::partial(line.text, confidence)
    };
    Ok(event.with_span(line.start_ms, line.end_ms))
}

fn content_type(config: &SttConfig) -> String {
    match config.format {
        AudioFormat::Pcm => format!("audio/L16;rate={}", config.sample_rate),
        AudioFormat::Wav => "audio/wav".into(),
        AudioFormat::Mp3 => "audio/mpeg".into(),
        AudioFormat::Opus => "audio/ogg;codecs=opus".into(),
    }
}

impl SpeechRecognizer for ChunkedRecognizer {
    fn capabilities(&self) -> Capabilities {
        Capabilities::new("chunked", true)
    }

    fn transcribe(
        &self,
        audio: AudioStream,
        config: &SttConfig,
    ) -> BoxStream<'static, PipelineResult<TranscriptEvent>> {
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, content_type(config))
            .header("X-Language", config.language.clone())
            .body(reqwest::Body::wrap_stream(
                audio.map(Ok::<_, std::io::Error>),
            ));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let window = self.window;

        Box::pin(stream! {
            let resp = match request.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    yield Err(e.into());
                    return;
                }
            };
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                yield Err(PipelineError::Vendor {
                    code: i64::from(status.as_u16()),
                    message: body,
                });
                return;
            }

            let mut body = windowed(resp.bytes_stream(), window);
            let mut framer = JsonObjectFramer::default();
            while let Some(window_bytes) = body.next().await {
                let bytes = match window_bytes {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield Err(e.into());
                        return;
                    }
                };
                for raw in framer.push(&bytes) {
                    match parse_result(&raw) {
                        Ok(event) => {
                            let done = event.is_final;
                            yield Ok(event);
                            if done {
                                return;
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
            if framer.pending() > 0 {
                warn!("chunked stt: {} bytes of an unterminated result dropped", framer.pending());
            }
            debug!("chunked stt: response closed");
        })
    }
}
