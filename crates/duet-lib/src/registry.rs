//! Static provider registry: identifier → adapter, fixed at startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use duet_core::types::Capabilities;

use crate::config::{ProviderSettings, secret};
use crate::error::{PipelineError, PipelineResult};
use crate::llm::LanguageModel;
use crate::llm::gemini::GeminiModel;
use crate::llm::openai::OpenAiModel;
use crate::mock::{MockLanguageModel, MockRecognizer, MockSynthesizer};
use crate::stt::SpeechRecognizer;
use crate::stt::chunked::ChunkedRecognizer;
use crate::stt::whisper::WhisperRecognizer;
use crate::stt::xunfei::XunfeiRecognizer;
use crate::tts::SpeechSynthesizer;
use crate::tts::speech::OpenAiSpeech;
use crate::tts::volcan::VolcanSynthesizer;
use crate::tts::xunfei::XunfeiSynthesizer;

#[derive(Default)]
pub struct ProviderRegistry {
    stt: BTreeMap<String, Arc<dyn SpeechRecognizer>>,
    llm: BTreeMap<String, Arc<dyn LanguageModel>>,
    tts: BTreeMap<String, Arc<dyn SpeechSynthesizer>>,
}

/// One registered adapter as reported by `GET /providers`.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub id: String,
    #[serde(flatten)]
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderCatalog {
    pub stt: Vec<CatalogEntry>,
    pub llm: Vec<CatalogEntry>,
    pub tts: Vec<CatalogEntry>,
}

fn resolve<T: ?Sized>(
    map: &BTreeMap<String, Arc<T>>,
    stage: &str,
    id: &str,
    available: impl Fn(&T) -> bool,
) -> PipelineResult<Arc<T>> {
    let adapter = map
        .get(id)
        .ok_or_else(|| PipelineError::ProviderNotFound(format!("{stage} provider {id:?}")))?;
    if !available(adapter) {
        return Err(PipelineError::ProviderUnavailable(format!(
            "{stage} provider {id:?} has no credentials"
        )));
    }
    Ok(adapter.clone())
}

fn entries<T: ?Sized>(
    map: &BTreeMap<String, Arc<T>>,
    caps: impl Fn(&T) -> Capabilities,
) -> Vec<CatalogEntry> {
    map.iter()
        .map(|(id, adapter)| CatalogEntry {
            id: id.clone(),
            capabilities: caps(adapter),
        })
        .collect()
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock adapters only.
    pub fn with_mocks() -> Self {
        let mut registry = Self::new();
        registry.register_stt("mock", Arc::new(MockRecognizer::new()));
        registry.register_llm("mock", Arc::new(MockLanguageModel::new()));
        registry.register_tts("mock", Arc::new(MockSynthesizer::new()));
        registry
    }

    /// Mocks plus every vendor with a `[providers.*]` section. Credentials
    /// come from the environment variables the sections name.
    pub fn from_settings(providers: &ProviderSettings) -> Self {
        let mut registry = Self::with_mocks();

        if let Some(s) = &providers.whisper {
            let key = s.api_key_env.as_deref().and_then(secret);
            registry.register_stt("whisper", Arc::new(WhisperRecognizer::new(s, key)));
        }
        if let Some(s) = &providers.chunked_stt {
            let key = s.api_key_env.as_deref().and_then(secret);
            registry.register_stt("chunked", Arc::new(ChunkedRecognizer::new(s, key)));
        }
        if let Some(s) = &providers.xunfei {
            registry.register_stt("xunfei", Arc::new(XunfeiRecognizer::new(s, s.credentials())));
            registry.register_tts("xunfei", Arc::new(XunfeiSynthesizer::new(s, s.credentials())));
        }
        if let Some(s) = &providers.openai {
            let key = secret(&s.api_key_env);
            registry.register_llm("openai", Arc::new(OpenAiModel::streaming(s, key.clone())));
            registry.register_llm("openai-batch", Arc::new(OpenAiModel::batch(s, key)));
        }
        if let Some(s) = &providers.gemini {
            registry.register_llm("gemini", Arc::new(GeminiModel::new(s, secret(&s.api_key_env))));
        }
        if let Some(s) = &providers.speech {
            let key = s.api_key_env.as_deref().and_then(secret);
            registry.register_tts("speech", Arc::new(OpenAiSpeech::new(s, key)));
        }
        if let Some(s) = &providers.volcan {
            let token = secret(&s.access_token_env);
            registry.register_tts("volcan", Arc::new(VolcanSynthesizer::new(s, token)));
        }

        info!(
            "registry: stt [{}], llm [{}], tts [{}]",
            registry.stt.keys().cloned().collect::<Vec<_>>().join(", "),
            registry.llm.keys().cloned().collect::<Vec<_>>().join(", "),
            registry.tts.keys().cloned().collect::<Vec<_>>().join(", "),
        );
        registry
    }

    pub fn register_stt(&mut self, id: &str, adapter: Arc<dyn SpeechRecognizer>) {
        self.stt.insert(id.to_string(), adapter);
    }

    pub fn register_llm(&mut self, id: &str, adapter: Arc<dyn LanguageModel>) {
        self.llm.insert(id.to_string(), adapter);
    }

    pub fn register_tts(&mut self, id: &str, adapter: Arc<dyn SpeechSynthesizer>) {
        self.tts.insert(id.to_string(), adapter);
    }

    pub fn stt(&self, id: &str) -> PipelineResult<Arc<dyn SpeechRecognizer>> {
        resolve(&self.stt, "stt", id, |a| a.capabilities().available)
    }

    pub fn llm(&self, id: &str) -> PipelineResult<Arc<dyn LanguageModel>> {
        resolve(&self.llm, "llm", id, |a| a.capabilities().available)
    }

    pub fn tts(&self, id: &str) -> PipelineResult<Arc<dyn SpeechSynthesizer>> {
        resolve(&self.tts, "tts", id, |a| a.capabilities().available)
    }

    pub fn catalog(&self) -> ProviderCatalog {
        ProviderCatalog {
            stt: entries(&self.stt, |a| a.capabilities()),
            llm: entries(&self.llm, |a| a.capabilities()),
            tts: entries(&self.tts, |a| a.capabilities()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OpenAiSettings, VolcanSettings};

    #[test]
    fn unknown_id_is_not_found() {
        let registry = ProviderRegistry::with_mocks();
        assert!(registry.stt("mock").is_ok());
        assert!(matches!(
            registry.llm("nope"),
            Err(PipelineError::ProviderNotFound(_))
        ));
    }

    #[test]
    fn missing_credentials_is_unavailable() {
        let providers = ProviderSettings {
            volcan: Some(VolcanSettings {
                access_token_env: "DUET_TEST_UNSET_VOLCAN_TOKEN".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let registry = ProviderRegistry::from_settings(&providers);
        assert!(matches!(
            registry.tts("volcan"),
            Err(PipelineError::ProviderUnavailable(_))
        ));
    }

    #[test]
    fn catalog_lists_every_adapter() {
        let providers = ProviderSettings {
            openai: Some(OpenAiSettings {
                api_key_env: "DUET_TEST_UNSET_OPENAI_KEY".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let catalog = ProviderRegistry::from_settings(&providers).catalog();
        let llm: Vec<&str> = catalog.llm.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(llm, vec!["mock", "openai", "openai-batch"]);

        let openai = &catalog.llm[1];
        assert!(!openai.capabilities.available);
        assert!(openai.capabilities.supports_model("gpt-4o"));

        let json = serde_json::to_value(&catalog).unwrap();
        assert_eq!(json["llm"][2]["streaming"], false);
        assert_eq!(json["stt"][0]["id"], "mock");
    }
}
