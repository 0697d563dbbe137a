//! Text-to-speech stage.
//!
//! Request/response vendors (`volcan`) answer one call with one audio blob;
//! streaming vendors (`speech`, `xunfei`) send many frames and close with a
//! terminal status. Both come out of [`SpeechSynthesizer::synthesize`] as a
//! finite stream of [`AudioChunk`]s. [`SynthesisStage`] adds text cleanup,
//! per-event timeouts and segment batching, and reports failures as a
//! [`SynthesisEvent::Failed`] instead of an error.

pub mod speech;
pub mod volcan;
pub mod xunfei;

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::time::Instant;
use tracing::{debug, warn};

use duet_core::text_prep::{clean_text_for_tts, is_speakable};
use duet_core::types::{AudioChunk, AudioFormat, Capabilities, SynthesisConfig};

use crate::error::{PipelineError, PipelineResult};

/// Streaming vendors often send a few hundred bytes per frame; smaller
/// pieces are merged before they reach the client.
pub const MIN_CHUNK_BYTES: usize = 32 * 1024;

/// One vendor's synthesizer.
pub trait SpeechSynthesizer: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Checked before any network call.
    fn validate(&self, config: &SynthesisConfig) -> PipelineResult<()> {
        validate_synthesis_config(&self.capabilities(), config)
    }

    /// Lazy: nothing is sent until the stream is polled.
    fn synthesize(
        &self,
        text: String,
        config: &SynthesisConfig,
    ) -> BoxStream<'static, PipelineResult<AudioChunk>>;
}

pub fn validate_synthesis_config(
    caps: &Capabilities,
    config: &SynthesisConfig,
) -> PipelineResult<()> {
    if !caps.supports_voice(&config.voice_id) {
        return Err(PipelineError::Validation(format!(
            "voice {:?} is not offered by {}",
            config.voice_id, caps.provider
        )));
    }
    let ranges = [
        ("speed", config.speed, 0.25, 4.0),
        ("volume", config.volume, 0.0, 2.0),
        ("pitch", config.pitch, 0.5, 2.0),
    ];
    for (name, value, lo, hi) in ranges {
        if !(lo..=hi).contains(&value) {
            return Err(PipelineError::Validation(format!(
                "{name} {value} outside {lo}..={hi}"
            )));
        }
    }
    if !(8_000..=48_000).contains(&config.sample_rate) {
        return Err(PipelineError::Validation(format!(
            "sample rate {} outside 8000..=48000",
            config.sample_rate
        )));
    }
    Ok(())
}

/// Merges small vendor frames into chunks of at least `min_bytes`.
#[derive(Debug)]
pub struct ChunkCoalescer {
    format: AudioFormat,
    sample_rate: u32,
    min_bytes: usize,
    buf: Vec<u8>,
}

impl ChunkCoalescer {
    pub fn new(format: AudioFormat, sample_rate: u32, min_bytes: usize) -> Self {
        Self {
            format,
            sample_rate,
            min_bytes,
            buf: Vec::new(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Option<AudioChunk> {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() >= self.min_bytes {
            return self.take();
        }
        None
    }

    /// Whatever is left once the vendor is done.
    pub fn finish(&mut self) -> Option<AudioChunk> {
        self.take()
    }

    fn take(&mut self) -> Option<AudioChunk> {
        if self.buf.is_empty() {
            return None;
        }
        Some(AudioChunk::new(
            std::mem::take(&mut self.buf),
            self.format,
            self.sample_rate,
        ))
    }
}

/// What the stage hands the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisEvent {
    Audio(AudioChunk),
    /// Terminal; carries the client-safe message.
    Failed(String),
}

/// Bounds for grouping text segments into one vendor call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentBatch {
    pub max_items: usize,
    pub max_chars: usize,
    /// How long the first segment of a batch may wait for company.
    pub window: Duration,
}

impl Default for SegmentBatch {
    fn default() -> Self {
        Self {
            max_items: 3,
            max_chars: 200,
            window: Duration::from_millis(300),
        }
    }
}

/// Guarded view over one synthesizer.
pub struct SynthesisStage {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    event_timeout: Duration,
    batch: SegmentBatch,
}

impl SynthesisStage {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        event_timeout: Duration,
        batch: SegmentBatch,
    ) -> Self {
        Self {
            synthesizer,
            event_timeout,
            batch,
        }
    }

    pub fn provider(&self) -> String {
        self.synthesizer.capabilities().provider
    }

    pub fn validate(&self, config: &SynthesisConfig) -> PipelineResult<()> {
        self.synthesizer.validate(config)
    }

    /// Synthesize a finished reply in one vendor call. Text with nothing to
    /// pronounce yields an empty stream.
    pub fn whole(&self, text: &str, config: &SynthesisConfig) -> BoxStream<'static, SynthesisEvent> {
        let cleaned = clean_text_for_tts(text);
        if !is_speakable(&cleaned) {
            debug!("tts: nothing speakable in {} chars", text.chars().count());
            return Box::pin(futures_util::stream::empty());
        }
        if let Err(e) = self.validate(config) {
            warn!("tts: rejected config: {e}");
            return Box::pin(futures_util::stream::iter([SynthesisEvent::Failed(
                e.client_message(),
            )]));
        }
        guarded(
            self.synthesizer.synthesize(cleaned, config),
            self.event_timeout,
        )
    }

    /// Synthesize text segments as they arrive, grouping them into small
    /// batches to get the first audio out early. A failed batch ends the
    /// stream.
    pub fn segmented(
        &self,
        segments: BoxStream<'static, String>,
        config: &SynthesisConfig,
    ) -> BoxStream<'static, SynthesisEvent> {
        if let Err(e) = self.validate(config) {
            warn!("tts: rejected config: {e}");
            return Box::pin(futures_util::stream::iter([SynthesisEvent::Failed(
                e.client_message(),
            )]));
        }
        let synthesizer = self.synthesizer.clone();
        let config = config.clone();
        let timeout = self.event_timeout;
        let mut batches = batched(segments, self.batch);

        Box::pin(stream! {
            let mut index = 0usize;
            while let Some(batch) = batches.next().await {
                let cleaned = clean_text_for_tts(&batch);
                if !is_speakable(&cleaned) {
                    continue;
                }
                debug!("tts: batch {index} ({} chars)", cleaned.chars().count());
                index += 1;
                let mut events = guarded(synthesizer.synthesize(cleaned, &config), timeout);
                while let Some(event) = events.next().await {
                    let failed = matches!(event, SynthesisEvent::Failed(_));
                    yield event;
                    if failed {
                        return;
                    }
                }
            }
        })
    }
}

/// Bounded wait per chunk; the first fault ends the stream.
fn guarded(
    mut inner: BoxStream<'static, PipelineResult<AudioChunk>>,
    timeout: Duration,
) -> BoxStream<'static, SynthesisEvent> {
    Box::pin(stream! {
        loop {
            match tokio::time::timeout(timeout, inner.next()).await {
                Ok(Some(Ok(chunk))) if chunk.is_empty() => continue,
                Ok(Some(Ok(chunk))) => yield SynthesisEvent::Audio(chunk),
                Ok(Some(Err(e))) => {
                    warn!("tts: vendor failure: {e}");
                    yield SynthesisEvent::Failed(e.client_message());
                    return;
                }
                Ok(None) => return,
                Err(_) => {
                    warn!("tts: no audio within {timeout:?}");
                    yield SynthesisEvent::Failed(PipelineError::Timeout(timeout).client_message());
                    return;
                }
            }
        }
    })
}

/// Group segments until a batch is full or its window closes. Segments are
/// joined with a space.
fn batched(
    mut segments: BoxStream<'static, String>,
    limits: SegmentBatch,
) -> BoxStream<'static, String> {
    Box::pin(stream! {
        let mut batch: Vec<String> = Vec::new();
        let mut chars = 0usize;
        let mut deadline: Option<Instant> = None;

        loop {
            let next = match deadline {
                Some(at) => match tokio::time::timeout_at(at, segments.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        deadline = None;
                        chars = 0;
                        yield std::mem::take(&mut batch).join(" ");
                        continue;
                    }
                },
                None => segments.next().await,
            };

            let Some(segment) = next else { break };
            let len = segment.chars().count();
            if !batch.is_empty() && chars + len > limits.max_chars {
                deadline = None;
                chars = 0;
                yield std::mem::take(&mut batch).join(" ");
            }
            if batch.is_empty() {
                deadline = Some(Instant::now() + limits.window);
            }
            chars += len;
            batch.push(segment);
            if batch.len() >= limits.max_items {
                deadline = None;
                chars = 0;
                yield std::mem::take(&mut batch).join(" ");
            }
        }
        if !batch.is_empty() {
            yield batch.join(" ");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSynthesizer;

    fn stage(synth: Arc<MockSynthesizer>, batch: SegmentBatch) -> SynthesisStage {
        SynthesisStage::new(synth, Duration::from_millis(200), batch)
    }

    fn segments(items: &[&str]) -> BoxStream<'static, String> {
        let items: Vec<String> = items.iter().map(|s| s.to_string()).collect();
        Box::pin(futures_util::stream::iter(items))
    }

    fn audio_bytes(events: &[SynthesisEvent]) -> usize {
        events
            .iter()
            .map(|e| match e {
                SynthesisEvent::Audio(chunk) => chunk.len(),
                SynthesisEvent::Failed(_) => 0,
            })
            .sum()
    }

    // ── Whole text ──────────────────────────────────────────────────

    #[tokio::test]
    async fn whole_text_yields_audio() {
        let synth = Arc::new(MockSynthesizer::new());
        let events: Vec<_> = stage(synth.clone(), SegmentBatch::default())
            .whole("**Hello** there.", &SynthesisConfig::default())
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert_eq!(audio_bytes(&events), 4096);
        assert_eq!(synth.texts(), vec!["Hello there.".to_string()]);
    }

    #[tokio::test]
    async fn unspeakable_text_skips_vendor() {
        let synth = Arc::new(MockSynthesizer::new());
        let events: Vec<_> = stage(synth.clone(), SegmentBatch::default())
            .whole("🎉 🎉", &SynthesisConfig::default())
            .collect()
            .await;
        assert!(events.is_empty());
        assert_eq!(synth.calls(), 0);
    }

    #[tokio::test]
    async fn vendor_failure_is_terminal_event() {
        let synth = Arc::new(MockSynthesizer::new().failing());
        let events: Vec<_> = stage(synth, SegmentBatch::default())
            .whole("Hello there.", &SynthesisConfig::default())
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        let SynthesisEvent::Failed(message) = &events[0] else {
            panic!("expected failure, got {events:?}");
        };
        assert!(!message.contains("mock vendor"));
    }

    #[tokio::test]
    async fn stall_times_out() {
        let synth = Arc::new(MockSynthesizer::new().with_delay(Duration::from_secs(5)));
        let events: Vec<_> = stage(synth, SegmentBatch::default())
            .whole("Hello there.", &SynthesisConfig::default())
            .collect()
            .await;
        assert_eq!(
            events,
            vec![SynthesisEvent::Failed("upstream service timed out".into())]
        );
    }

    #[tokio::test]
    async fn bad_speed_makes_no_call() {
        let synth = Arc::new(MockSynthesizer::new());
        let config = SynthesisConfig {
            speed: 5.0,
            ..Default::default()
        };
        let events: Vec<_> = stage(synth.clone(), SegmentBatch::default())
            .whole("Hello there.", &config)
            .collect()
            .await;
        assert!(matches!(events[0], SynthesisEvent::Failed(_)));
        assert_eq!(synth.calls(), 0);
    }

    // ── Segments ────────────────────────────────────────────────────

    #[tokio::test]
    async fn segments_batched_by_count() {
        let synth = Arc::new(MockSynthesizer::new());
        let batch = SegmentBatch {
            max_items: 2,
            max_chars: 1000,
            window: Duration::from_secs(5),
        };
        let events: Vec<_> = stage(synth.clone(), batch)
            .segmented(segments(&["One.", "Two.", "Three.", "Four.", "Five."]), &SynthesisConfig::default())
            .collect()
            .await;
        assert_eq!(events.len(), 3);
        assert_eq!(synth.texts(), vec!["One. Two.", "Three. Four.", "Five."]);
    }

    #[tokio::test]
    async fn segments_batched_by_chars() {
        let synth = Arc::new(MockSynthesizer::new());
        let batch = SegmentBatch {
            max_items: 10,
            max_chars: 10,
            window: Duration::from_secs(5),
        };
        let _: Vec<_> = stage(synth.clone(), batch)
            .segmented(segments(&["Hello.", "World.", "Again."]), &SynthesisConfig::default())
            .collect()
            .await;
        assert_eq!(synth.texts(), vec!["Hello.", "World.", "Again."]);
    }

    #[tokio::test]
    async fn window_flushes_slow_segments() {
        let synth = Arc::new(MockSynthesizer::new());
        let batch = SegmentBatch {
            max_items: 10,
            max_chars: 1000,
            window: Duration::from_millis(20),
        };
        let slow: BoxStream<'static, String> = Box::pin(stream! {
            yield "First.".to_string();
            tokio::time::sleep(Duration::from_millis(100)).await;
            yield "Second.".to_string();
        });
        let _: Vec<_> = stage(synth.clone(), batch)
            .segmented(slow, &SynthesisConfig::default())
            .collect()
            .await;
        assert_eq!(synth.texts(), vec!["First.", "Second."]);
    }

    #[tokio::test]
    async fn failed_batch_stops_the_rest() {
        let synth = Arc::new(MockSynthesizer::new().failing());
        let batch = SegmentBatch {
            max_items: 1,
            ..Default::default()
        };
        let events: Vec<_> = stage(synth.clone(), batch)
            .segmented(segments(&["One.", "Two."]), &SynthesisConfig::default())
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert_eq!(synth.calls(), 1);
    }

    // ── Helpers ─────────────────────────────────────────────────────

    #[test]
    fn coalescer_merges_small_frames() {
        let mut c = ChunkCoalescer::new(AudioFormat::Mp3, 24_000, 8);
        assert!(c.push(&[1, 2, 3]).is_none());
        let chunk = c.push(&[4, 5, 6, 7, 8, 9]).unwrap();
        assert_eq!(chunk.bytes, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert!(c.finish().is_none());
        c.push(&[10]);
        assert_eq!(c.finish().unwrap().bytes, vec![10]);
    }

    #[test]
    fn synthesis_ranges() {
        let caps = Capabilities::new("t", true).with_voices(&["a"]);
        let ok = SynthesisConfig {
            voice_id: "a".into(),
            ..Default::default()
        };
        assert!(validate_synthesis_config(&caps, &ok).is_ok());
        for bad in [
            SynthesisConfig { voice_id: "b".into(), ..ok.clone() },
            SynthesisConfig { volume: 2.5, ..ok.clone() },
            SynthesisConfig { pitch: 0.1, ..ok.clone() },
            SynthesisConfig { sample_rate: 96_000, ..ok.clone() },
        ] {
            assert!(validate_synthesis_config(&caps, &bad).is_err(), "{bad:?}");
        }
    }
}
