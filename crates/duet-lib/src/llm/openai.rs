//! OpenAI chat completions, streamed or batch.
//!
//! Streaming replies are server-sent events carrying token deltas; the
//! `[DONE]` line ends the stream. The batch variant sends `stream: false`
//! and yields the whole reply as one frame.

use async_stream::stream;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use duet_core::types::{Capabilities, GenerationConfig};

use crate::config::OpenAiSettings;
use crate::error::{PipelineError, PipelineResult};
use crate::framing::{SseEvent, SseFramer};
use crate::llm::{GenerationRequest, LanguageModel, ModelFrame, validate_generation_config};

/// Models offered by default, with their context lengths.
pub const OPENAI_MODELS: &[(&str, u32)] = &[
    ("gpt-3.5-turbo", 4_096),
    ("gpt-3.5-turbo-16k", 16_384),
    ("gpt-4", 8_192),
    ("gpt-4-turbo", 128_000),
    ("gpt-4o", 128_000),
    ("gpt-4-32k", 32_768),
];

/// Completion tokens accepted per request.
const MAX_OUTPUT_TOKENS: u32 = 4_096;

pub struct OpenAiModel {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    default_model: String,
    models: Vec<String>,
    streaming: bool,
}

impl OpenAiModel {
    /// Token-streaming client.
    pub fn streaming(settings: &OpenAiSettings, api_key: Option<String>) -> Self {
        Self::build(settings, api_key, true)
    }

    /// `stream: false` client; one frame per reply.
    pub fn batch(settings: &OpenAiSettings, api_key: Option<String>) -> Self {
        Self::build(settings, api_key, false)
    }

    fn build(settings: &OpenAiSettings, api_key: Option<String>, streaming: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(settings.timeout_secs))
            .build()
            .unwrap_or_default();
        let models = settings.models.clone().unwrap_or_else(|| {
            OPENAI_MODELS.iter().map(|(m, _)| m.to_string()).collect()
        });
        Self {
            client,
            url: format!(
                "{}/v1/chat/completions",
                settings.base_url.trim_end_matches('/')
            ),
            api_key,
            default_model: settings.default_model.clone(),
            models,
            streaming,
        }
    }

    /// An unset model name means the configured default.
    fn effective(&self, config: &GenerationConfig) -> GenerationConfig {
        let mut config = config.clone();
        if config.model_name.is_empty() {
            config.model_name = self.default_model.clone();
        }
        config
    }

    fn body(&self, request: &GenerationRequest) -> Value {
        let config = self.effective(&request.config);
        let mut body = json!({
            "model": config.model_name,
            "messages": request.messages(),
            "temperature": config.temperature,
            "stream": self.streaming,
        });
        if let Some(max_tokens) = config.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(top_p) = config.top_p {
            body["top_p"] = json!(top_p);
        }
        body
    }
}

impl LanguageModel for OpenAiModel {
    fn capabilities(&self) -> Capabilities {
        let provider = if self.streaming { "openai" } else { "openai-batch" };
        let models: Vec<&str> = self.models.iter().map(String::as_str).collect();
        let max_context = self
            .models
            .iter()
            .filter_map(|m| context_length(m))
            .max();
        let caps = Capabilities::new(provider, self.api_key.is_some())
            .with_models(&models)
            .with_limits(max_context, Some(MAX_OUTPUT_TOKENS));
        if self.streaming { caps } else { caps.batch() }
    }

    fn validate(&self, config: &GenerationConfig) -> PipelineResult<()> {
        validate_generation_config(&self.capabilities(), &self.effective(config))
    }

    fn stream(&self, request: GenerationRequest) -> BoxStream<'static, PipelineResult<ModelFrame>> {
        let mut builder = self.client.post(&self.url).json(&self.body(&request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let streaming = self.streaming;

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

            if !streaming {
                let reply = match resp.text().await {
                    Ok(body) => parse_completion(&body),
                    Err(e) => Err(e.into()),
                };
                yield reply;
                return;
            }

            let mut body = resp.bytes_stream();
            let mut framer = SseFramer::default();
            let mut tail = false;
            loop {
                let events = match body.next().await {
                    Some(Ok(bytes)) => framer.push(&bytes),
                    Some(Err(e)) => {
                        yield Err(e.into());
                        return;
                    }
                    None => {
                        tail = true;
                        framer.finish()
                    }
                };
                for event in events {
                    let data = match event {
                        SseEvent::Done => {
                            debug!("openai: [DONE]");
                            return;
                        }
                        SseEvent::Data(data) => data,
                    };
                    match parse_delta(&data) {
                        Ok(Some(frame)) => yield Ok(frame),
                        Ok(None) => {}
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
                if tail {
                    return;
                }
            }
        })
    }
}

pub fn context_length(model: &str) -> Option<u32> {
    OPENAI_MODELS
        .iter()
        .find(|(m, _)| *m == model)
        .map(|(_, len)| *len)
}

#[derive(Debug, Deserialize)]
struct VendorError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<Value>,
}

fn vendor_error(err: VendorError) -> PipelineError {
    PipelineError::Vendor {
        code: err.code.as_ref().and_then(Value::as_i64).unwrap_or(-1),
        message: err.message,
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<VendorError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

/// One SSE payload. Role-only and empty deltas yield nothing.
fn parse_delta(data: &str) -> PipelineResult<Option<ModelFrame>> {
    let chunk: StreamChunk = serde_json::from_str(data)?;
    if let Some(err) = chunk.error {
        return Err(vendor_error(err));
    }
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(None);
    };
    let text = choice.delta.content.unwrap_or_default();
    if text.is_empty() && choice.finish_reason.is_none() {
        return Ok(None);
    }
    Ok(Some(ModelFrame::Delta {
        text,
        finish_reason: choice.finish_reason,
    }))
}

#[derive(Debug, Deserialize)]
struct Completion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    error: Option<VendorError>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

fn parse_completion(body: &str) -> PipelineResult<ModelFrame> {
    let completion: Completion = serde_json::from_str(body)?;
    if let Some(err) = completion.error {
        return Err(vendor_error(err));
    }
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::Decode("completion without choices".into()))?;
    Ok(ModelFrame::Complete {
        text: choice.message.content.unwrap_or_default(),
        finish_reason: choice.finish_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use duet_core::types::ChatMessage;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn settings(base_url: String) -> OpenAiSettings {
        OpenAiSettings {
            base_url,
            ..Default::default()
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            system_prompt: "You are Aria.".into(),
            history: vec![ChatMessage::user("hi"), ChatMessage::assistant("hey")],
            user_message: "tell me a joke".into(),
            config: GenerationConfig::default(),
        }
    }

    // ── Parsing ─────────────────────────────────────────────────────

    #[test]
    fn delta_parsing() {
        let frame = parse_delta(r#"{"choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            frame,
            ModelFrame::Delta {
                text: "Hi".into(),
                finish_reason: None
            }
        );
        assert!(parse_delta(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#)
            .unwrap()
            .is_none());
        let last = parse_delta(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(last, ModelFrame::Delta { finish_reason: Some(r), .. } if r == "stop"));
    }

    #[test]
    fn in_stream_error_object() {
        let err = parse_delta(r#"{"error":{"message":"overloaded","code":529}}"#).unwrap_err();
        assert!(matches!(err, PipelineError::Vendor { code: 529, .. }));
    }

    #[test]
    fn request_body_shape() {
        let model = OpenAiModel::streaming(&settings("http://x".into()), Some("k".into()));
        let mut req = request();
        req.config.max_tokens = Some(256);
        let body = model.body(&req);
        assert_eq!(body["model"], "gpt-3.5-turbo");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 256);
        assert!(body.get("top_p").is_none());
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["role"], "assistant");
    }

    #[test]
    fn capabilities_follow_credentials() {
        let model = OpenAiModel::streaming(&settings("http://x".into()), None);
        let caps = model.capabilities();
        assert!(!caps.available);
        assert!(caps.supports_model("gpt-4o"));
        assert_eq!(caps.max_context_length, Some(128_000));
        assert_eq!(context_length("gpt-4"), Some(8_192));

        let unknown = GenerationConfig {
            model_name: "gpt-9".into(),
            ..Default::default()
        };
        assert!(model.validate(&unknown).is_err());
        assert!(model.validate(&GenerationConfig::default()).is_ok());
    }

    // ── Against a local endpoint ────────────────────────────────────

    #[tokio::test]
    async fn streams_deltas_until_done() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|headers: HeaderMap| async move {
                assert_eq!(headers["authorization"], "Bearer sk-test");
                concat!(
                    "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
                    "data: {\"choices\":[{\"delta\":{\"content\":\"Why \"}}]}\n\n",
                    "data: {\"choices\":[{\"delta\":{\"content\":\"not?\"},\"finish_reason\":\"stop\"}]}\n\n",
                    "data: [DONE]\n\n",
                    "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
                )
            }),
        );
        let base = serve(app).await;
        let model = OpenAiModel::streaming(&settings(base), Some("sk-test".into()));

        let frames: Vec<ModelFrame> = model.stream(request()).map(Result::unwrap).collect().await;
        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames[1],
            ModelFrame::Delta {
                text: "not?".into(),
                finish_reason: Some("stop".into())
            }
        );
    }

    #[tokio::test]
    async fn batch_reply_and_http_errors() {
        let app = Router::new()
            .route(
                "/ok/v1/chat/completions",
                post(|| async {
                    axum::Json(json!({
                        "choices": [{"message": {"role": "assistant", "content": "Whole reply."},
                                     "finish_reason": "stop"}]
                    }))
                }),
            )
            .route(
                "/down/v1/chat/completions",
                post(|| async { (StatusCode::TOO_MANY_REQUESTS, "{\"error\":\"rate limited\"}") }),
            );
        let base = serve(app).await;

        let model = OpenAiModel::batch(&settings(format!("{base}/ok")), Some("k".into()));
        let frames: Vec<_> = model.stream(request()).collect().await;
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].as_ref().unwrap(),
            &ModelFrame::Complete {
                text: "Whole reply.".into(),
                finish_reason: Some("stop".into())
            }
        );
        assert!(!model.capabilities().streaming);

        let model = OpenAiModel::streaming(&settings(format!("{base}/down")), Some("k".into()));
        let frames: Vec<_> = model.stream(request()).collect().await;
        assert!(matches!(frames[0], Err(PipelineError::Vendor { code: 429, .. })));
    }
}
