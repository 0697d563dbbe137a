//! Wire protocol for the conversation socket.
//!
//! ```text
//! client → server   {"type":"audio_start"} · binary audio · {"type":"audio_end"}
//!                   {"type":"text_message","data":{"message":"..."}}
//!                   {"type":"ping"}
//! server → client   status · stt_result · llm_text_stream · tts_audio_meta (+ binary)
//!                   error · complete · pong
//! ```
//!
//! Every outbound frame carries a millisecond `timestamp`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{AudioChunk, AudioFormat, ErrorScope, GenerationChunk, TranscriptEvent};

/// Audio is announced as mono.
pub const AUDIO_CHANNELS: u16 = 1;

/// Bit depth announced in `tts_audio_meta`.
pub const AUDIO_BIT_DEPTH: u16 = 16;

// ─── Inbound ───────────────────────────────────────────────────────────────

/// JSON control frame sent by the client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    AudioStart {
        #[serde(default)]
        format: Option<AudioFormat>,
        #[serde(default)]
        sample_rate: Option<u32>,
    },
    AudioEnd,
    TextMessage {
        data: TextPayload,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TextPayload {
    pub message: String,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// ─── Outbound ──────────────────────────────────────────────────────────────

/// JSON frame sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Status {
        message: String,
        timestamp: i64,
    },
    SttResult {
        text: String,
        is_final: bool,
        confidence: f32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: i64,
    },
    LlmTextStream {
        text: String,
        accumulated_text: String,
        character_name: String,
        is_complete: bool,
        chunk_index: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
        timestamp: i64,
    },
    /// Precedes `frames` binary messages carrying `audio_size` bytes in total.
    TtsAudioMeta {
        audio_size: usize,
        format: AudioFormat,
        sample_rate: u32,
        channels: u16,
        bit_depth: u16,
        frames: usize,
        timestamp: i64,
    },
    Error {
        error: String,
        scope: ErrorScope,
        timestamp: i64,
    },
    Complete {
        message: String,
        turn_id: Uuid,
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl ServerFrame {
    pub fn status(message: impl Into<String>) -> Self {
        ServerFrame::Status {
            message: message.into(),
            timestamp: now_ms(),
        }
    }

    pub fn pong() -> Self {
        ServerFrame::Pong { timestamp: now_ms() }
    }

    pub fn error(scope: ErrorScope, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            error: message.into(),
            scope,
            timestamp: now_ms(),
        }
    }

    pub fn complete(turn_id: Uuid) -> Self {
        ServerFrame::Complete {
            message: "turn complete".into(),
            turn_id,
            timestamp: now_ms(),
        }
    }

    pub fn transcript(event: &TranscriptEvent) -> Self {
        ServerFrame::SttResult {
            text: event.text.clone(),
            is_final: event.is_final,
            confidence: event.confidence,
            error: event.error.clone(),
            timestamp: now_ms(),
        }
    }

    pub fn generation(chunk: &GenerationChunk, character_name: &str) -> Self {
        ServerFrame::LlmTextStream {
            text: chunk.content.clone(),
            accumulated_text: chunk.accumulated_content.clone(),
            character_name: character_name.to_string(),
            is_complete: chunk.is_final,
            chunk_index: chunk.chunk_index,
            finish_reason: chunk.finish_reason.clone(),
            timestamp: now_ms(),
        }
    }

    pub fn audio_meta(chunk: &AudioChunk, frames: usize) -> Self {
        ServerFrame::TtsAudioMeta {
            audio_size: chunk.len(),
            format: chunk.format,
            sample_rate: chunk.sample_rate,
            channels: AUDIO_CHANNELS,
            bit_depth: AUDIO_BIT_DEPTH,
            frames,
            timestamp: now_ms(),
        }
    }

    /// The `type` tag as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Status { .. } => "status",
            ServerFrame::SttResult { .. } => "stt_result",
            ServerFrame::LlmTextStream { .. } => "llm_text_stream",
            ServerFrame::TtsAudioMeta { .. } => "tts_audio_meta",
            ServerFrame::Error { .. } => "error",
            ServerFrame::Complete { .. } => "complete",
            ServerFrame::Pong { .. } => "pong",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn json(frame: &ServerFrame) -> Value {
        serde_json::from_str(&frame.to_json().unwrap()).unwrap()
    }

    // ── ClientFrame ─────────────────────────────────────────────────

    #[test]
    fn parses_bare_audio_start() {
        let frame = ClientFrame::parse(r#"{"type":"audio_start"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::AudioStart {
                format: None,
                sample_rate: None
            }
        );
    }

    #[test]
    fn parses_audio_start_with_format() {
        let frame =
            ClientFrame::parse(r#"{"type":"audio_start","format":"wav","sampleRate":8000}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::AudioStart {
                format: Some(AudioFormat::Wav),
                sample_rate: Some(8000)
            }
        );
    }

    #[test]
    fn parses_text_message() {
        let frame =
            ClientFrame::parse(r#"{"type":"text_message","data":{"message":"hi there"}}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::TextMessage {
                data: TextPayload {
                    message: "hi there".into()
                }
            }
        );
    }

    #[test]
    fn parses_ping_and_end() {
        assert_eq!(ClientFrame::parse(r#"{"type":"ping"}"#).unwrap(), ClientFrame::Ping);
        assert_eq!(
            ClientFrame::parse(r#"{"type":"audio_end"}"#).unwrap(),
            ClientFrame::AudioEnd
        );
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(ClientFrame::parse(r#"{"type":"dance"}"#).is_err());
        assert!(ClientFrame::parse("not json").is_err());
    }

    // ── ServerFrame ─────────────────────────────────────────────────

    #[test]
    fn stt_result_field_names() {
        let v = json(&ServerFrame::transcript(&TranscriptEvent::finished("你好", 0.9)));
        assert_eq!(v["type"], "stt_result");
        assert_eq!(v["text"], "你好");
        assert_eq!(v["isFinal"], true);
        assert!(v.get("error").is_none());
        assert!(v["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn failed_stt_result_carries_marker() {
        let v = json(&ServerFrame::transcript(&TranscriptEvent::failed("timeout")));
        assert_eq!(v["text"], "");
        assert_eq!(v["isFinal"], true);
        assert_eq!(v["error"], "timeout");
    }

    #[test]
    fn llm_text_stream_field_names() {
        let chunk = GenerationChunk {
            content: "lo".into(),
            accumulated_content: "hello".into(),
            is_final: true,
            chunk_index: 2,
            finish_reason: Some("stop".into()),
        };
        let v = json(&ServerFrame::generation(&chunk, "Aria"));
        assert_eq!(v["type"], "llm_text_stream");
        assert_eq!(v["text"], "lo");
        assert_eq!(v["accumulatedText"], "hello");
        assert_eq!(v["characterName"], "Aria");
        assert_eq!(v["isComplete"], true);
        assert_eq!(v["chunkIndex"], 2);
        assert_eq!(v["finishReason"], "stop");
    }

    #[test]
    fn audio_meta_declares_size_and_format() {
        let chunk = AudioChunk::new(vec![0u8; 4096], AudioFormat::Mp3, 24_000);
        let v = json(&ServerFrame::audio_meta(&chunk, 1));
        assert_eq!(v["type"], "tts_audio_meta");
        assert_eq!(v["audioSize"], 4096);
        assert_eq!(v["format"], "mp3");
        assert_eq!(v["sampleRate"], 24_000);
        assert_eq!(v["channels"], 1);
        assert_eq!(v["bitDepth"], 16);
        assert_eq!(v["frames"], 1);
    }

    #[test]
    fn error_and_complete_tags() {
        let v = json(&ServerFrame::error(ErrorScope::Synthesis, "speech unavailable"));
        assert_eq!(v["type"], "error");
        assert_eq!(v["error"], "speech unavailable");
        assert_eq!(v["scope"], "synthesis");

        let id = Uuid::new_v4();
        let v = json(&ServerFrame::complete(id));
        assert_eq!(v["type"], "complete");
        assert_eq!(v["turnId"], id.to_string());
        assert_eq!(ServerFrame::pong().kind(), "pong");
    }
}
