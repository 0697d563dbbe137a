//! Inbound audio for one turn.
//!
//! `audio_start` opens a capture, binary frames append to it, `audio_end`
//! closes it into an [`AudioClip`]. The capture is bounded: a client that
//! keeps streaming past the limit loses the capture rather than the server
//! buffering without end.

use futures_util::stream::{self, BoxStream};

use duet_core::types::{AudioFormat, STT_SAMPLE_RATE};
use duet_core::wav::pcm_duration_ms;

use crate::error::{PipelineError, PipelineResult};

/// Audio handed to a recognizer, frame by frame.
pub type AudioStream = BoxStream<'static, Vec<u8>>;

/// Audio captured between `audio_start` and `audio_end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub frames: Vec<Vec<u8>>,
    pub format: AudioFormat,
    pub sample_rate: u32,
}

impl AudioClip {
    pub fn new(frames: Vec<Vec<u8>>, format: AudioFormat, sample_rate: u32) -> Self {
        Self {
            frames,
            format,
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Playback length, meaningful for raw PCM only.
    pub fn duration_ms(&self) -> Option<u64> {
        (self.format == AudioFormat::Pcm).then(|| pcm_duration_ms(self.len(), self.sample_rate))
    }

    pub fn into_stream(self) -> AudioStream {
        Box::pin(stream::iter(self.frames))
    }
}

#[derive(Debug)]
enum Capture {
    Idle,
    Receiving {
        format: AudioFormat,
        sample_rate: u32,
        frames: Vec<Vec<u8>>,
        bytes: usize,
    },
}

/// Per-session capture state.
#[derive(Debug)]
pub struct AudioIngest {
    max_bytes: usize,
    capture: Capture,
}

impl AudioIngest {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            capture: Capture::Idle,
        }
    }

    /// Open a capture. A capture already in progress is discarded.
    pub fn start(&mut self, format: Option<AudioFormat>, sample_rate: Option<u32>) {
        self.capture = Capture::Receiving {
            format: format.unwrap_or(AudioFormat::Pcm),
            sample_rate: sample_rate.unwrap_or(STT_SAMPLE_RATE),
            frames: Vec::new(),
            bytes: 0,
        };
    }

    pub fn is_receiving(&self) -> bool {
        matches!(self.capture, Capture::Receiving { .. })
    }

    /// Append one binary frame; returns the bytes captured so far.
    pub fn push(&mut self, frame: Vec<u8>) -> PipelineResult<usize> {
        let Capture::Receiving { frames, bytes, .. } = &mut self.capture else {
            return Err(PipelineError::Validation(
                "audio frame received before audio_start".into(),
            ));
        };
        if *bytes + frame.len() > self.max_bytes {
            self.capture = Capture::Idle;
            return Err(PipelineError::Validation(format!(
                "audio exceeds {} bytes; capture discarded",
                self.max_bytes
            )));
        }
        *bytes += frame.len();
        if !frame.is_empty() {
            frames.push(frame);
        }
        Ok(*bytes)
    }

    /// Close the capture.
    pub fn finish(&mut self) -> PipelineResult<AudioClip> {
        match std::mem::replace(&mut self.capture, Capture::Idle) {
            Capture::Receiving {
                format,
                sample_rate,
                frames,
                ..
            } => Ok(AudioClip::new(frames, format, sample_rate)),
            Capture::Idle => Err(PipelineError::Validation(
                "audio_end received without audio_start".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn capture_between_boundaries() {
        let mut ingest = AudioIngest::new(10_000);
        ingest.start(None, None);
        assert_eq!(ingest.push(vec![0u8; 1000]).unwrap(), 1000);
        assert_eq!(ingest.push(vec![0u8; 3096]).unwrap(), 4096);

        let clip = ingest.finish().unwrap();
        assert!(!ingest.is_receiving());
        assert_eq!(clip.len(), 4096);
        assert_eq!(clip.format, AudioFormat::Pcm);
        assert_eq!(clip.duration_ms(), Some(128));

        let frames: Vec<Vec<u8>> = clip.into_stream().collect().await;
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn frame_before_start_is_rejected() {
        let mut ingest = AudioIngest::new(100);
        assert!(matches!(
            ingest.push(vec![1, 2]),
            Err(PipelineError::Validation(_))
        ));
        assert!(ingest.finish().is_err());
    }

    #[test]
    fn overflow_discards_capture() {
        let mut ingest = AudioIngest::new(100);
        ingest.start(Some(AudioFormat::Wav), Some(8_000));
        ingest.push(vec![0u8; 80]).unwrap();
        assert!(ingest.push(vec![0u8; 40]).is_err());
        assert!(!ingest.is_receiving());
    }

    #[test]
    fn restart_drops_previous_frames() {
        let mut ingest = AudioIngest::new(100);
        ingest.start(None, None);
        ingest.push(vec![0u8; 10]).unwrap();
        ingest.start(Some(AudioFormat::Mp3), None);
        assert!(ingest.is_receiving());
        let clip = ingest.finish().unwrap();
        assert!(clip.is_empty());
        assert_eq!(clip.format, AudioFormat::Mp3);
        assert_eq!(clip.duration_ms(), None);
    }
}
