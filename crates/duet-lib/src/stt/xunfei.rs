//! Xunfei dictation over a signed websocket.
//!
//! ```text
//! client → {common, business, data{status:0, audio}}   first frame
//!        → {data{status:1, audio}} ...                 1280 bytes each
//!        → {data{status:2, audio:""}}                  end of audio
//! vendor → {code, data{status, result{sn, pgs, rg, ws[].cw[].w}}}
//! ```
//!
//! With dynamic correction (`dwa=wpgs`) a result either appends segment `sn`
//! or replaces the segments numbered `rg[0]..=rg[1]`. `data.status == 2`
//! marks the final result. While waiting for it the uploader keeps the
//! socket alive with ping frames.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_stream::stream;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use futures_util::stream::{BoxStream, SplitSink};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use duet_core::types::{AudioFormat, Capabilities, SttConfig, TranscriptEvent};
use duet_core::wav::{WAV_HEADER_LEN, is_wav, parse_wav_header};

use crate::config::{XunfeiCredentials, XunfeiSettings};
use crate::error::{PipelineError, PipelineResult};
use crate::ingest::AudioStream;
use crate::signing::SignedEndpoint;
use crate::stt::SpeechRecognizer;

/// Audio bytes per upload frame (40 ms at 16 kHz).
const FRAME_BYTES: usize = 1280;

const STATUS_FIRST: u8 = 0;
const STATUS_CONTINUE: u8 = 1;
const STATUS_LAST: u8 = 2;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct XunfeiRecognizer {
    settings: XunfeiSettings,
    credentials: Option<XunfeiCredentials>,
}

impl XunfeiRecognizer {
    pub fn new(settings: &XunfeiSettings, credentials: Option<XunfeiCredentials>) -> Self {
        Self {
            settings: settings.clone(),
            credentials,
        }
    }
}

impl SpeechRecognizer for XunfeiRecognizer {
    fn capabilities(&self) -> Capabilities {
        Capabilities::new("xunfei", self.credentials.is_some()).with_languages(&[
            "zh-CN", "zh_cn", "en-US", "en_us",
        ])
    }

    fn validate(&self, config: &SttConfig) -> PipelineResult<()> {
        super::validate_stt_config(&self.capabilities(), config)?;
        if !matches!(config.format, AudioFormat::Pcm | AudioFormat::Wav) {
            return Err(PipelineError::Validation(format!(
                "xunfei dictation takes raw pcm, not {}",
                config.format
            )));
        }
        if !matches!(config.sample_rate, 8_000 | 16_000) {
            return Err(PipelineError::Validation(format!(
                "xunfei dictation takes 8000 or 16000 Hz, not {}",
                config.sample_rate
            )));
        }
        Ok(())
    }

    fn transcribe(
        &self,
        audio: AudioStream,
        config: &SttConfig,
    ) -> BoxStream<'static, PipelineResult<TranscriptEvent>> {
        let settings = self.settings.clone();
        let credentials = self.credentials.clone();
        let params = SessionParams {
            app_id: settings.app_id.clone(),
            language: vendor_language(&config.language),
            sample_rate: config.sample_rate,
            wav: config.format == AudioFormat::Wav,
        };

        Box::pin(stream! {
            let Some(credentials) = credentials else {
                yield Err(PipelineError::ProviderUnavailable("xunfei credentials not set".into()));
                return;
            };
            let endpoint = SignedEndpoint {
                host: &settings.stt_host,
                path: &settings.stt_path,
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

            let (socket, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok(ok) => ok,
                Err(e) => {
                    yield Err(e.into());
                    return;
                }
            };
            debug!("xunfei stt: connected to {}", settings.stt_host);

            let (sink, mut source) = socket.split();
            let closing = Arc::new(AtomicBool::new(false));
            let _uploader = AbortOnDrop(tokio::spawn(upload(
                sink,
                audio,
                params,
                Duration::from_millis(settings.frame_interval_ms),
                Duration::from_millis(settings.keepalive_ms.max(10)),
                closing.clone(),
            )));

            let mut transcript = Transcript::default();
            while let Some(message) = source.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        closing.store(true, Ordering::SeqCst);
                        yield Err(e.into());
                        return;
                    }
                };

                let frame: IatFrame = match serde_json::from_str(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        closing.store(true, Ordering::SeqCst);
                        yield Err(e.into());
                        return;
                    }
                };
                if frame.code != 0 {
                    closing.store(true, Ordering::SeqCst);
                    yield Err(PipelineError::Vendor {
                        code: frame.code,
                        message: format!("{} (sid {})", frame.message, frame.sid),
                    });
                    return;
                }

                let Some(data) = frame.data else { continue };
                let updated = match data.result {
                    Some(result) => {
                        transcript.apply(result);
                        true
                    }
                    None => false,
                };
                if data.status == STATUS_LAST {
                    closing.store(true, Ordering::SeqCst);
                    yield Ok(TranscriptEvent::finished(transcript.text(), transcript.confidence()));
                    return;
                }
                if updated {
                    yield Ok(TranscriptEvent::partial(transcript.text(), transcript.confidence()));
                }
            }
            closing.store(true, Ordering::SeqCst);
            debug!("xunfei stt: socket closed before final result");
        })
    }
}

/// `zh-CN` → `zh_cn`.
fn vendor_language(language: &str) -> String {
    language.replace('-', "_").to_ascii_lowercase()
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ─── Upload ────────────────────────────────────────────────────────────────

struct SessionParams {
    app_id: String,
    language: String,
    sample_rate: u32,
    wav: bool,
}

fn audio_frame(status: u8, audio: &[u8], params: &SessionParams) -> String {
    let data = json!({
        "status": status,
        "format": format!("audio/L16;rate={}", params.sample_rate),
        "encoding": "raw",
        "audio": STANDARD.encode(audio),
    });
    let frame = if status == STATUS_FIRST {
        json!({
            "common": { "app_id": params.app_id },
            "business": {
                "language": params.language,
                "domain": "iat",
                "accent": "mandarin",
                "vad_eos": 3000,
                "dwa": "wpgs",
            },
            "data": data,
        })
    } else {
        json!({ "data": data })
    };
    frame.to_string()
}

async fn upload(
    mut sink: WsSink,
    mut audio: AudioStream,
    params: SessionParams,
    frame_interval: Duration,
    keepalive: Duration,
    closing: Arc<AtomicBool>,
) {
    let mut buf: Vec<u8> = Vec::new();
    let mut status = STATUS_FIRST;
    let mut header_checked = !params.wav;

    while let Some(chunk) = audio.next().await {
        buf.extend_from_slice(&chunk);
        if !header_checked && buf.len() >= WAV_HEADER_LEN {
            if is_wav(&buf) {
                if let Ok(header) = parse_wav_header(&buf) {
                    buf.drain(..header.data_offset.min(buf.len()));
                }
            }
            header_checked = true;
        }
        while header_checked && buf.len() >= FRAME_BYTES {
            let frame: Vec<u8> = buf.drain(..FRAME_BYTES).collect();
            if let Err(e) = sink
                .send(Message::text(audio_frame(status, &frame, &params)))
                .await
            {
                debug!("xunfei stt: upload stopped: {e}");
                return;
            }
            status = STATUS_CONTINUE;
            tokio::time::sleep(frame_interval).await;
        }
    }

    // Whatever is left, then the end marker
    if status == STATUS_FIRST || !buf.is_empty() {
        let tail = std::mem::take(&mut buf);
        if sink
            .send(Message::text(audio_frame(status, &tail, &params)))
            .await
            .is_err()
        {
            return;
        }
    }
    if let Err(e) = sink
        .send(Message::text(audio_frame(STATUS_LAST, &[], &params)))
        .await
    {
        debug!("xunfei stt: end frame not sent: {e}");
        return;
    }

    loop {
        tokio::time::sleep(keepalive).await;
        if closing.load(Ordering::SeqCst) {
            break;
        }
        if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
            break;
        }
    }
}

// ─── Results ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IatFrame {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    sid: String,
    data: Option<IatData>,
}

#[derive(Debug, Deserialize)]
struct IatData {
    status: u8,
    result: Option<IatResult>,
}

#[derive(Debug, Deserialize)]
struct IatResult {
    sn: u32,
    #[serde(default)]
    pgs: Option<String>,
    #[serde(default)]
    rg: Option<[u32; 2]>,
    #[serde(default)]
    ws: Vec<IatWord>,
}

#[derive(Debug, Deserialize)]
struct IatWord {
    #[serde(default)]
    cw: Vec<IatCandidate>,
}

#[derive(Debug, Deserialize)]
struct IatCandidate {
    #[serde(default)]
    w: String,
    #[serde(default)]
    sc: f32,
}

#[derive(Debug)]
struct Segment {
    text: String,
    score: Option<f32>,
}

/// Running transcript keyed by segment number.
#[derive(Debug, Default)]
struct Transcript {
    segments: BTreeMap<u32, Segment>,
}

impl Transcript {
    fn apply(&mut self, result: IatResult) {
        if result.pgs.as_deref() == Some("rpl") {
            match result.rg {
                Some([from, to]) => self.segments.retain(|sn, _| *sn < from || *sn > to),
                None => warn!("xunfei stt: replacement without range for sn {}", result.sn),
            }
        }

        let best: Vec<&IatCandidate> = result.ws.iter().filter_map(|w| w.cw.first()).collect();
        let text: String = best.iter().map(|c| c.w.as_str()).collect();
        let scored: Vec<f32> = best.iter().map(|c| c.sc).filter(|sc| *sc > 0.0).collect();
        let score = (!scored.is_empty()).then(|| scored.iter().sum::<f32>() / scored.len() as f32);

        self.segments.insert(result.sn, Segment { text, score });
    }

    fn text(&self) -> String {
        self.segments.values().map(|s| s.text.as_str()).collect()
    }

    /// Mean word score; the dictation API often leaves scores at zero, in
    /// which case the result is taken at face value.
    fn confidence(&self) -> f32 {
        let scores: Vec<f32> = self.segments.values().filter_map(|s| s.score).collect();
        if scores.is_empty() {
            return if self.segments.is_empty() { 0.0 } else { 1.0 };
        }
        scores.iter().sum::<f32>() / scores.len() as f32
    }
}
