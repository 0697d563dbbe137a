//! Speech-to-text stage.
//!
//! Adapters implement [`SpeechRecognizer`] over whatever transport their
//! vendor speaks: a batch upload (`whisper`), a chunked HTTP stream
//! (`chunked`), or a signed websocket (`xunfei`). [`TranscriptionStage`]
//! wraps the chosen adapter with the guarantees the coordinator relies on:
//! a bounded wait per event, no raw faults past the stage, and exactly one
//! final event.

pub mod chunked;
pub mod whisper;
pub mod xunfei;

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tracing::{debug, warn};

use duet_core::types::{Capabilities, SttConfig, TranscriptEvent};

use crate::error::{PipelineError, PipelineResult};
use crate::ingest::AudioStream;

/// One vendor's recognizer.
pub trait SpeechRecognizer: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Checked before any network call.
    fn validate(&self, config: &SttConfig) -> PipelineResult<()> {
        validate_stt_config(&self.capabilities(), config)
    }

    /// Lazy: nothing is sent until the stream is polled.
    fn transcribe(
        &self,
        audio: AudioStream,
        config: &SttConfig,
    ) -> BoxStream<'static, PipelineResult<TranscriptEvent>>;
}

pub fn validate_stt_config(caps: &Capabilities, config: &SttConfig) -> PipelineResult<()> {
    if !(8_000..=48_000).contains(&config.sample_rate) {
        return Err(PipelineError::Validation(format!(
            "sample rate {} outside 8000..=48000",
            config.sample_rate
        )));
    }
    if !caps.languages.is_empty() && !caps.languages.iter().any(|l| l == &config.language) {
        return Err(PipelineError::Validation(format!(
            "{} does not recognize language {}",
            caps.provider, config.language
        )));
    }
    Ok(())
}

/// Marker placed on the terminal event of a failed recognition.
pub(crate) fn error_marker(err: &PipelineError) -> String {
    match err {
        PipelineError::Timeout(_) => "timeout".into(),
        other => other.client_message(),
    }
}

/// Guarded view over one recognizer.
pub struct TranscriptionStage {
    recognizer: Arc<dyn SpeechRecognizer>,
    event_timeout: Duration,
}

impl TranscriptionStage {
    pub fn new(recognizer: Arc<dyn SpeechRecognizer>, event_timeout: Duration) -> Self {
        Self {
            recognizer,
            event_timeout,
        }
    }

    pub fn provider(&self) -> String {
        self.recognizer.capabilities().provider
    }

    pub fn validate(&self, config: &SttConfig) -> PipelineResult<()> {
        self.recognizer.validate(config)
    }

    /// Transcribe `audio`. The returned stream always ends with exactly one
    /// `is_final` event: the vendor's own, one synthesized from the last
    /// partial when the vendor closes without finalizing, or an empty event
    /// carrying an error marker when the vendor fails or goes quiet.
    pub fn run(&self, audio: AudioStream, config: &SttConfig) -> BoxStream<'static, TranscriptEvent> {
        let inner = self
            .recognizer
            .validate(config)
            .map(|()| self.recognizer.transcribe(audio, config));
        let timeout = self.event_timeout;

        Box::pin(stream! {
            let mut inner = match inner {
                Ok(inner) => inner,
                Err(e) => {
                    warn!("stt: rejected config: {e}");
                    yield TranscriptEvent::failed(error_marker(&e));
                    return;
                }
            };

            let mut last_partial: Option<TranscriptEvent> = None;
            loop {
                match tokio::time::timeout(timeout, inner.next()).await {
                    Ok(Some(Ok(event))) if event.is_final => {
                        debug!("stt: final ({} chars)", event.text.chars().count());
                        yield event;
                        return;
                    }
                    Ok(Some(Ok(event))) => {
                        last_partial = Some(event.clone());
                        yield event;
                    }
                    Ok(Some(Err(e))) => {
                        warn!("stt: vendor failure: {e}");
                        yield TranscriptEvent::failed(error_marker(&e));
                        return;
                    }
                    Ok(None) => {
                        let last = match last_partial.take() {
                            Some(partial) => TranscriptEvent { is_final: true, ..partial },
                            None => TranscriptEvent::finished("", 0.0),
                        };
                        debug!("stt: stream closed without final, promoting last result");
                        yield last;
                        return;
                    }
                    Err(_) => {
                        warn!("stt: no event within {timeout:?}");
                        yield TranscriptEvent::failed(error_marker(&PipelineError::Timeout(timeout)));
                        return;
                    }
                }
            }
        })
    }
}
