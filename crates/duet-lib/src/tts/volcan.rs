//! Volcengine (ByteDance) HTTP synthesis: one JSON request, one base64 audio
//! blob in the reply. Code 3000 is success; anything else carries a vendor
//! message.

use async_stream::stream;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::stream::BoxStream;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error};
use uuid::Uuid;

use duet_core::types::{AudioChunk, AudioFormat, Capabilities, SynthesisConfig};

use crate::config::VolcanSettings;
use crate::error::{PipelineError, PipelineResult};
use crate::tts::SpeechSynthesizer;

const SUCCESS: i64 = 3000;

pub struct VolcanSynthesizer {
    client: reqwest::Client,
    url: String,
    app_id: String,
    cluster: String,
    access_token: Option<String>,
}

impl VolcanSynthesizer {
    pub fn new(settings: &VolcanSettings, access_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}/api/v1/tts", settings.base_url.trim_end_matches('/')),
            app_id: settings.app_id.clone(),
            cluster: settings.cluster.clone(),
            access_token,
        }
    }
}

fn encoding(format: AudioFormat) -> &'static str {
    match format {
        AudioFormat::Mp3 => "mp3",
        AudioFormat::Pcm => "pcm",
        AudioFormat::Wav => "wav",
        AudioFormat::Opus => "ogg_opus",
    }
}

fn request_body(app_id: &str, token: &str, cluster: &str, text: &str, config: &SynthesisConfig) -> Value {
    json!({
        "app": { "appid": app_id, "token": token, "cluster": cluster },
        "user": { "uid": "duet" },
        "audio": {
            "voice_type": config.voice_id,
            "encoding": encoding(config.format),
            "speed_ratio": config.speed,
            "volume_ratio": config.volume,
            "pitch_ratio": config.pitch,
            "rate": config.sample_rate,
        },
        "request": {
            "reqid": Uuid::new_v4().to_string(),
            "text": text,
            "text_type": "plain",
            "operation": "query",
        },
    })
}

#[derive(Debug, Deserialize)]
struct VolcanReply {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    reqid: String,
    data: Option<String>,
}

impl SpeechSynthesizer for VolcanSynthesizer {
    fn capabilities(&self) -> Capabilities {
        Capabilities::new("volcan", self.access_token.is_some() && !self.app_id.is_empty())
            .batch()
            .with_languages(&["zh-CN", "en-US"])
    }

    fn synthesize(
        &self,
        text: String,
        config: &SynthesisConfig,
    ) -> BoxStream<'static, PipelineResult<AudioChunk>> {
        let token = self.access_token.clone();
        let body = request_body(
            &self.app_id,
            token.as_deref().unwrap_or_default(),
            &self.cluster,
            &text,
            config,
        );
        let request = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer;{}", token.clone().unwrap_or_default()))
            .json(&body);
        let format = config.format;
        let sample_rate = config.sample_rate;

        Box::pin(stream! {
            if token.is_none() {
                yield Err(PipelineError::ProviderUnavailable("volcan access token not set".into()));
                return;
            }
            let resp = match request.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    yield Err(e.into());
                    return;
                }
            };
            let status = resp.status();
            let text = match resp.text().await {
                Ok(text) => text,
                Err(e) => {
                    yield Err(e.into());
                    return;
                }
            };
            let reply: VolcanReply = match serde_json::from_str(&text) {
                Ok(reply) => reply,
                Err(_) => {
                    error!("volcan: unreadable reply ({status}): {text}");
                    yield Err(PipelineError::Vendor {
                        code: i64::from(status.as_u16()),
                        message: text,
                    });
                    return;
                }
            };
            if reply.code != SUCCESS {
                error!("volcan: code {} for {}: {}", reply.code, reply.reqid, reply.message);
                yield Err(PipelineError::Vendor {
                    code: reply.code,
                    message: reply.message,
                });
                return;
            }
            let audio = match reply.data.as_deref().map(|data| STANDARD.decode(data)) {
                Some(Ok(audio)) => audio,
                Some(Err(e)) => {
                    yield Err(PipelineError::Decode(format!("volcan audio: {e}")));
                    return;
                }
                None => {
                    yield Err(PipelineError::Decode("volcan reply without audio".into()));
                    return;
                }
            };
            debug!("volcan: {} bytes for {}", audio.len(), reply.reqid);
            yield Ok(AudioChunk::new(audio, format, sample_rate));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::Router;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use futures_util::StreamExt;

    async fn serve(reply: Value) -> String {
        let app = Router::new().route(
            "/api/v1/tts",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let reply = reply.clone();
                async move {
                    assert_eq!(headers["authorization"], "Bearer;tok");
                    assert_eq!(body["app"]["appid"], "app-1");
                    assert_eq!(body["audio"]["voice_type"], "BV001_streaming");
                    assert_eq!(body["request"]["operation"], "query");
                    Json(reply)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn synthesizer(base_url: String) -> VolcanSynthesizer {
        VolcanSynthesizer::new(
            &VolcanSettings {
                base_url,
                app_id: "app-1".into(),
                ..Default::default()
            },
            Some("tok".into()),
        )
    }

    fn config() -> SynthesisConfig {
        SynthesisConfig {
            voice_id: "BV001_streaming".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn success_decodes_blob() {
        let base_url = serve(json!({
            "reqid": "r1",
            "code": 3000,
            "message": "Success",
            "data": STANDARD.encode([7u8; 300]),
        }))
        .await;
        let chunks: Vec<_> = synthesizer(base_url)
            .synthesize("你好".into(), &config())
            .collect()
            .await;
        assert_eq!(chunks.len(), 1);
        let chunk = chunks[0].as_ref().unwrap();
        assert_eq!(chunk.bytes, vec![7u8; 300]);
        assert_eq!(chunk.format, AudioFormat::Mp3);
    }

    #[tokio::test]
    async fn vendor_code_is_an_error() {
        let base_url = serve(json!({
            "reqid": "r2",
            "code": 3001,
            "message": "invalid voice",
        }))
        .await;
        let chunks: Vec<_> = synthesizer(base_url)
            .synthesize("你好".into(), &config())
            .collect()
            .await;
        assert!(matches!(chunks[0], Err(PipelineError::Vendor { code: 3001, .. })));
    }

    #[test]
    fn unavailable_without_token() {
        let tts = VolcanSynthesizer::new(&VolcanSettings::default(), None);
        let caps = tts.capabilities();
        assert!(!caps.available);
        assert!(!caps.streaming);
    }

    #[test]
    fn opus_maps_to_ogg() {
        let body = request_body("a", "t", "c", "hi", &SynthesisConfig {
            format: AudioFormat::Opus,
            ..Default::default()
        });
        assert_eq!(body["audio"]["encoding"], "ogg_opus");
        assert_eq!(body["request"]["text"], "hi");
    }
}
