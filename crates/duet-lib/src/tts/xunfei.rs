//! Xunfei online synthesis over a signed websocket.
//!
//! ```text
//! client → {common{app_id}, business{aue, auf, vcn, speed, volume, pitch, tte},
//!           data{status:2, text:base64}}
//! vendor → {code, message, sid, data{audio:base64, status, ced}} ...
//! ```
//!
//! The whole text goes out in one frame; audio comes back in pieces until
//! `data.status == 2`. Raw output is 16-bit PCM at 8 or 16 kHz. `wav` is the
//! same PCM, streamed behind a header whose size fields are left open.

use async_stream::stream;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error};

use duet_core::types::{AudioChunk, AudioFormat, Capabilities, SynthesisConfig};
use duet_core::wav::{align_pcm, streaming_wav_header};

use crate::config::{XunfeiCredentials, XunfeiSettings};
use crate::error::{PipelineError, PipelineResult};
use crate::signing::SignedEndpoint;
use crate::tts::{ChunkCoalescer, MIN_CHUNK_BYTES, SpeechSynthesizer};

const STATUS_LAST: u8 = 2;

pub const XUNFEI_VOICES: &[&str] = &[
    "xiaoyan", "xiaoyu", "xiaoxue", "xiaofeng", "xiaomei", "xiaolin", "xiaorong", "xiaoqian",
    "xiaokun", "xiaoqiang", "vixy", "vixq", "vixf", "vixl", "catherine", "john",
];

pub struct XunfeiSynthesizer {
    settings: XunfeiSettings,
    credentials: Option<XunfeiCredentials>,
    min_chunk: usize,
}

impl XunfeiSynthesizer {
    pub fn new(settings: &XunfeiSettings, credentials: Option<XunfeiCredentials>) -> Self {
        Self {
            settings: settings.clone(),
            credentials,
            min_chunk: MIN_CHUNK_BYTES,
        }
    }
}

/// The vendor renders 16 kHz unless 8 kHz is asked for explicitly.
fn vendor_rate(requested: u32) -> u32 {
    if requested == 8_000 { 8_000 } else { 16_000 }
}

/// Ratios around 1.0 onto the vendor's 0..=100 scales.
fn scale(value: f32, factor: f32) -> u32 {
    (value * factor).round().clamp(0.0, 100.0) as u32
}

fn request_frame(app_id: &str, text: &str, config: &SynthesisConfig) -> String {
    let aue = match config.format {
        AudioFormat::Mp3 => "lame",
        _ => "raw",
    };
    let mut business = json!({
        "aue": aue,
        "auf": format!("audio/L16;rate={}", vendor_rate(config.sample_rate)),
        "vcn": config.voice_id,
        "speed": scale(config.speed, 50.0),
        "volume": scale(config.volume, 100.0),
        "pitch": scale(config.pitch, 50.0),
        "tte": "UTF8",
    });
    if aue == "lame" {
        business["sfl"] = json!(1);
    }
    json!({
        "common": { "app_id": app_id },
        "business": business,
        "data": { "status": STATUS_LAST, "text": STANDARD.encode(text) },
    })
    .to_string()
}

#[derive(Debug, Deserialize)]
struct TtsFrame {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    sid: String,
    data: Option<TtsData>,
}

#[derive(Debug, Deserialize)]
struct TtsData {
    #[serde(default)]
    audio: String,
    status: u8,
}

impl SpeechSynthesizer for XunfeiSynthesizer {
    fn capabilities(&self) -> Capabilities {
        Capabilities::new("xunfei", self.credentials.is_some())
            .with_voices(XUNFEI_VOICES)
            .with_languages(&["zh-CN", "en-US"])
    }

    fn validate(&self, config: &SynthesisConfig) -> PipelineResult<()> {
        super::validate_synthesis_config(&self.capabilities(), config)?;
        if config.format == AudioFormat::Opus {
            return Err(PipelineError::Validation(
                "xunfei synthesis offers mp3, pcm or wav".into(),
            ));
        }
        Ok(())
    }

    fn synthesize(
        &self,
        text: String,
        config: &SynthesisConfig,
    ) -> BoxStream<'static, PipelineResult<AudioChunk>> {
        let settings = self.settings.clone();
        let credentials = self.credentials.clone();
        let request = request_frame(&settings.app_id, &text, config);
        let format = config.format;
        let sample_rate = vendor_rate(config.sample_rate);
        let min_chunk = self.min_chunk;

        Box::pin(stream! {
            let Some(credentials) = credentials else {
                yield Err(PipelineError::ProviderUnavailable("xunfei credentials not set".into()));
                return;
            };
            let endpoint = SignedEndpoint {
                host: &settings.tts_host,
                path: &settings.tts_path,
                api_key: &credentials.api_key,
                api_secret: &credentials.api_secret,
                tls: settings.tls,
            };
            let url = match endpoint.url(Utc::now()) {
                Ok(url) => url,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let (mut socket, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok(ok) => ok,
                Err(e) => {
                    yield Err(e.into());
                    return;
                }
            };
            if let Err(e) = socket.send(Message::text(request)).await {
                yield Err(e.into());
                return;
            }
            debug!("xunfei tts: request sent to {}", settings.tts_host);

            let mut carry: Option<u8> = None;
            let mut coalescer = ChunkCoalescer::new(format, sample_rate, min_chunk);
            let mut header = (format == AudioFormat::Wav).then(|| streaming_wav_header(sample_rate));
            let mut finished = false;

            while let Some(message) = socket.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        yield Err(e.into());
                        return;
                    }
                };
                let frame: TtsFrame = match serde_json::from_str(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        yield Err(e.into());
                        return;
                    }
                };
                if frame.code != 0 {
                    error!("xunfei tts: code {} (sid {}): {}", frame.code, frame.sid, frame.message);
                    yield Err(PipelineError::Vendor {
                        code: frame.code,
                        message: frame.message,
                    });
                    return;
                }
                let Some(data) = frame.data else { continue };
                let audio = match STANDARD.decode(data.audio.as_bytes()) {
                    Ok(audio) => audio,
                    Err(e) => {
                        yield Err(PipelineError::Decode(format!("xunfei audio: {e}")));
                        return;
                    }
                };
                match format {
                    AudioFormat::Pcm | AudioFormat::Wav => {
                        if let Some(chunk) = coalescer.push(&align_pcm(&audio, &mut carry)) {
                            yield Ok(behind_header(chunk, &mut header));
                        }
                    }
                    _ => {
                        if let Some(chunk) = coalescer.push(&audio) {
                            yield Ok(chunk);
                        }
                    }
                }
                if data.status == STATUS_LAST {
                    finished = true;
                    break;
                }
            }
            let _ = socket.close(None).await;

            if !finished {
                yield Err(PipelineError::Transport("xunfei tts socket closed early".into()));
                return;
            }
            if let Some(chunk) = coalescer.finish() {
                yield Ok(behind_header(chunk, &mut header));
            } else if let Some(header) = header {
                yield Ok(AudioChunk::new(header, format, sample_rate));
            }
        })
    }
}

/// Prefix the first chunk of a stream with its pending header, if any.
fn behind_header(mut chunk: AudioChunk, header: &mut Option<Vec<u8>>) -> AudioChunk {
    if let Some(mut bytes) = header.take() {
        bytes.append(&mut chunk.bytes);
        chunk.bytes = bytes;
    }
    chunk
}
