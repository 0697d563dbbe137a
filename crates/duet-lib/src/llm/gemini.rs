//! Gemini `streamGenerateContent`.
//!
//! The response body is one JSON array streamed element by element. Each
//! element carries only the text generated since the previous one, so it is
//! forwarded as a delta. Gemini has no system role: the system prompt is sent as a
//! leading user message prefixed with `System:`, and assistant turns use the
//! `model` role.

use std::time::Duration;

use async_stream::stream;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use duet_core::types::{Capabilities, GenerationConfig, Role};

use crate::config::GeminiSettings;
use crate::error::{PipelineError, PipelineResult};
use crate::framing::{JsonObjectFramer, windowed};
use crate::llm::{GenerationRequest, LanguageModel, ModelFrame, validate_generation_config};

pub const GEMINI_MODELS: &[&str] = &["gemini-1.5-flash", "gemini-1.5-pro", "gemini-1.0-pro"];

const MAX_OUTPUT_TOKENS: u32 = 8_192;
const DEFAULT_OUTPUT_TOKENS: u32 = 2_048;
const MAX_CONTEXT: u32 = 1_048_576;

pub struct GeminiModel {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    window: Duration,
}

impl GeminiModel {
    pub fn new(settings: &GeminiSettings, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: settings.default_model.clone(),
            window: Duration::from_millis(settings.window_ms),
        }
    }

    fn effective(&self, config: &GenerationConfig) -> GenerationConfig {
        let mut config = config.clone();
        if config.model_name.is_empty() {
            config.model_name = self.default_model.clone();
        }
        config
    }
}

fn contents(request: &GenerationRequest) -> Vec<Value> {
    let mut contents = Vec::with_capacity(request.history.len() + 2);
    if !request.system_prompt.trim().is_empty() {
        contents.push(json!({
            "role": "user",
            "parts": [{ "text": format!("System: {}", request.system_prompt) }],
        }));
    }
    for message in &request.history {
        let role = match message.role {
            Role::Assistant => "model",
            Role::User | Role::System => "user",
        };
        contents.push(json!({ "role": role, "parts": [{ "text": message.content }] }));
    }
    contents.push(json!({ "role": "user", "parts": [{ "text": request.user_message }] }));
    contents
}

fn request_body(request: &GenerationRequest) -> Value {
    let config = &request.config;
    let mut generation = json!({
        "temperature": config.temperature,
        "maxOutputTokens": config
            .max_tokens
            .unwrap_or(DEFAULT_OUTPUT_TOKENS)
            .min(MAX_OUTPUT_TOKENS),
    });
    if let Some(top_p) = config.top_p {
        generation["topP"] = json!(top_p);
    }
    json!({
        "contents": contents(request),
        "generationConfig": generation,
    })
}

impl LanguageModel for GeminiModel {
    fn capabilities(&self) -> Capabilities {
        Capabilities::new("gemini", self.api_key.is_some())
            .with_models(GEMINI_MODELS)
            .with_limits(Some(MAX_CONTEXT), Some(MAX_OUTPUT_TOKENS))
    }

    fn validate(&self, config: &GenerationConfig) -> PipelineResult<()> {
        validate_generation_config(&self.capabilities(), &self.effective(config))
    }

    fn stream(&self, request: GenerationRequest) -> BoxStream<'static, PipelineResult<ModelFrame>> {
        let config = self.effective(&request.config);
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent",
            self.base_url, config.model_name
        );
        let body = request_body(&GenerationRequest {
            config,
            ..request
        });
        let builder = self
            .client
            .post(url)
            .query(&[("key", self.api_key.clone().unwrap_or_default())])
            .json(&body);
        let window = self.window;

        Box::pin(stream! {
            let resp = match builder.send().await {
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
                    match parse_candidate(&raw) {
                        Ok(Some(frame)) => {
                            let done = matches!(&frame, ModelFrame::Delta { finish_reason: Some(_), .. });
                            yield Ok(frame);
                            if done {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
            if framer.pending() > 0 {
                warn!("gemini: {} bytes of an unterminated element dropped", framer.pending());
            }
            debug!("gemini: response closed");
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamElement {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// Normalize Gemini finish reasons to the chat-completions vocabulary.
fn finish_reason(reason: &str) -> String {
    match reason {
        "STOP" => "stop".into(),
        "MAX_TOKENS" => "length".into(),
        other => other.to_ascii_lowercase(),
    }
}

fn parse_candidate(raw: &[u8]) -> PipelineResult<Option<ModelFrame>> {
    let element: StreamElement = serde_json::from_slice(raw)?;
    if let Some(err) = element.error {
        return Err(PipelineError::Vendor {
            code: err.code,
            message: err.message,
        });
    }
    let Some(candidate) = element.candidates.into_iter().next() else {
        return Ok(None);
    };
    let text = candidate
        .content
        .and_then(|c| c.parts.into_iter().next())
        .map(|p| p.text)
        .unwrap_or_default();
    let finish_reason = candidate
        .finish_reason
        .filter(|r| r != "FINISH_REASON_UNSPECIFIED")
        .map(|r| finish_reason(&r));
    if text.is_empty() && finish_reason.is_none() {
        return Ok(None);
    }
    Ok(Some(ModelFrame::Delta {
        text,
        finish_reason,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::GenerationStage;
    use axum::Router;
    use axum::body::{Body, Bytes};
    use axum::extract::{Path, Query};
    use axum::routing::post;
    use duet_core::types::ChatMessage;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn request(max_tokens: Option<u32>) -> GenerationRequest {
        GenerationRequest {
            system_prompt: "You are Aria.".into(),
            history: vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")],
            user_message: "what's new".into(),
            config: GenerationConfig {
                max_tokens,
                ..Default::default()
            },
        }
    }

    #[test]
    fn system_prompt_and_roles() {
        let body = request_body(&request(None));
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 4);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"][0]["text"], "System: You are Aria.");
        assert_eq!(contents[2]["role"], "model");
        assert_eq!(contents[3]["parts"][0]["text"], "what's new");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 2048);
    }

    #[test]
    fn output_tokens_capped() {
        let body = request_body(&request(Some(100_000)));
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 8192);
    }

    #[test]
    fn candidate_parsing() {
        let frame = parse_candidate(
            br#"{"candidates":[{"content":{"parts":[{"text":"Hi"}],"role":"model"},"finishReason":"MAX_TOKENS"}]}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            frame,
            ModelFrame::Delta {
                text: "Hi".into(),
                finish_reason: Some("length".into())
            }
        );
        let err = parse_candidate(br#"{"error":{"code":400,"message":"API key not valid"}}"#)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Vendor { code: 400, .. }));
        assert!(parse_candidate(br#"{"candidates":[]}"#).unwrap().is_none());
    }

    async fn spawn_vendor(parts: &[&'static [u8]]) -> String {
        let parts = parts.to_vec();
        let app = Router::new().route(
            "/v1beta/models/{call}",
            post(
                move |Path(call): Path<String>, Query(q): Query<HashMap<String, String>>| {
                    let parts = parts.clone();
                    async move {
                        assert_eq!(call, "gemini-1.5-flash:streamGenerateContent");
                        assert_eq!(q["key"], "g-key");
                        let body: Vec<Result<Bytes, std::io::Error>> =
                            parts.into_iter().map(|p| Ok(Bytes::from_static(p))).collect();
                        Body::from_stream(futures_util::stream::iter(body))
                    }
                },
            ),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn model(base_url: String) -> GeminiModel {
        GeminiModel::new(
            &GeminiSettings {
                base_url,
                window_ms: 10,
                ..Default::default()
            },
            Some("g-key".into()),
        )
    }

    #[tokio::test]
    async fn streamed_array_becomes_deltas() {
        let base = spawn_vendor(&[
            b"[{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel",
            b"lo\"}]}}]}\n,\r\n{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\" world\"}]},",
            b"\"finishReason\":\"STOP\"}]}]",
        ])
        .await;
        let frames: Vec<ModelFrame> = model(base).stream(request(None)).map(Result::unwrap).collect().await;
        assert_eq!(
            frames,
            vec![
                ModelFrame::Delta {
                    text: "Hello".into(),
                    finish_reason: None
                },
                ModelFrame::Delta {
                    text: " world".into(),
                    finish_reason: Some("stop".into())
                },
            ]
        );
    }

    #[tokio::test]
    async fn increments_accumulate_through_the_stage() {
        let base = spawn_vendor(&[
            b"[{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hello\"}]}}]}",
            b",{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\" world, how are you?\"}]},\"finishReason\":\"STOP\"}]}]",
        ])
        .await;
        let stage = GenerationStage::new(Arc::new(model(base)), Duration::from_secs(5), "sorry");
        let chunks: Vec<_> = stage.run(request(None)).unwrap().collect().await;
        let last = chunks.last().unwrap();
        assert!(last.is_final);
        assert_eq!(last.accumulated_content, "Hello world, how are you?");
        assert_eq!(chunks.iter().filter(|c| c.is_final).count(), 1);
    }
}
