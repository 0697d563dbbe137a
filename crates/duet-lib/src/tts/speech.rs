//! OpenAI-compatible `/v1/audio/speech` (Kokoro, OpenAI and friends).
//!
//! One POST per text; the body streams back as raw audio in the requested
//! format. PCM is 16-bit little-endian, so an odd byte at the end of a
//! network chunk is carried into the next one before the samples go out.

use async_stream::stream;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tracing::{debug, error};

use duet_core::types::{AudioChunk, AudioFormat, Capabilities, SynthesisConfig};
use duet_core::wav::align_pcm;

use crate::config::SpeechSettings;
use crate::error::{PipelineError, PipelineResult};
use crate::tts::{ChunkCoalescer, MIN_CHUNK_BYTES, SpeechSynthesizer};

pub struct OpenAiSpeech {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    voices: Vec<String>,
    min_chunk: usize,
}

impl OpenAiSpeech {
    pub fn new(settings: &SpeechSettings, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}/v1/audio/speech", settings.base_url.trim_end_matches('/')),
            model: settings.model.clone(),
            api_key,
            voices: settings.voices.clone(),
            min_chunk: MIN_CHUNK_BYTES,
        }
    }

    #[cfg(test)]
    fn with_min_chunk(mut self, bytes: usize) -> Self {
        self.min_chunk = bytes;
        self
    }
}

impl SpeechSynthesizer for OpenAiSpeech {
    fn capabilities(&self) -> Capabilities {
        let voices: Vec<&str> = self.voices.iter().map(String::as_str).collect();
        Capabilities::new("speech", true).with_voices(&voices)
    }

    fn synthesize(
        &self,
        text: String,
        config: &SynthesisConfig,
    ) -> BoxStream<'static, PipelineResult<AudioChunk>> {
        let body = serde_json::json!({
            "input": text,
            "voice": config.voice_id,
            "model": self.model,
            "response_format": config.format.as_str(),
            "stream": true,
            "speed": config.speed,
        });
        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let format = config.format;
        let sample_rate = config.sample_rate;
        let min_chunk = self.min_chunk;
        let chars = text.chars().count();

        Box::pin(stream! {
            debug!("speech: POST {chars} chars");
            let resp = match request.send().await {
                Ok(resp) if resp.status().is_success() => resp,
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    error!("speech: vendor error {status}: {text}");
                    yield Err(PipelineError::Vendor {
                        code: i64::from(status.as_u16()),
                        message: text,
                    });
                    return;
                }
                Err(e) => {
                    error!("speech: request failed: {e}");
                    yield Err(e.into());
                    return;
                }
            };

            let mut body = resp.bytes_stream();
            let mut carry: Option<u8> = None;
            let mut coalescer = ChunkCoalescer::new(format, sample_rate, min_chunk);
            while let Some(next) = body.next().await {
                let bytes = match next {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!("speech: stream error: {e}");
                        yield Err(e.into());
                        return;
                    }
                };
                let ready = if format == AudioFormat::Pcm {
                    coalescer.push(&align_pcm(&bytes, &mut carry))
                } else {
                    coalescer.push(&bytes)
                };
                if let Some(chunk) = ready {
                    yield Ok(chunk);
                }
            }
            if carry.is_some() {
                debug!("speech: dropped a trailing odd byte");
            }
            if let Some(chunk) = coalescer.finish() {
                yield Ok(chunk);
            }
        })
    }
}
