//! Provider factory registry.
//!
//! Vendor integrations register factories under string keys from an
//! explicit assembly call, never from init side-effects. The pool manager
//! selects factories by the keys named in configuration.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::providers::openai;
use crate::providers::{AsrProvider, LlmProvider, TtsProvider, VlllmProvider};

#[async_trait]
pub trait AsrFactory: Send + Sync {
    async fn create(&self, config: &ProviderConfig) -> Result<Arc<dyn AsrProvider>>;
}

#[async_trait]
pub trait LlmFactory: Send + Sync {
    async fn create(&self, config: &ProviderConfig) -> Result<Arc<dyn LlmProvider>>;
}

impl std::fmt::Debug for dyn LlmFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn LlmFactory")
    }
}

#[async_trait]
pub trait VlllmFactory: Send + Sync {
    async fn create(&self, config: &ProviderConfig) -> Result<Arc<dyn VlllmProvider>>;
}

#[async_trait]
pub trait TtsFactory: Send + Sync {
    async fn create(&self, config: &ProviderConfig) -> Result<Arc<dyn TtsProvider>>;
}

#[derive(Default)]
pub struct ProviderRegistry {
    asr: HashMap<String, Arc<dyn AsrFactory>>,
    llm: HashMap<String, Arc<dyn LlmFactory>>,
    vlllm: HashMap<String, Arc<dyn VlllmFactory>>,
    tts: HashMap<String, Arc<dyn TtsFactory>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_asr(&mut self, key: impl Into<String>, factory: Arc<dyn AsrFactory>) {
        self.asr.insert(key.into(), factory);
    }

    pub fn register_llm(&mut self, key: impl Into<String>, factory: Arc<dyn LlmFactory>) {
        self.llm.insert(key.into(), factory);
    }

    pub fn register_vlllm(&mut self, key: impl Into<String>, factory: Arc<dyn VlllmFactory>) {
        self.vlllm.insert(key.into(), factory);
    }

    pub fn register_tts(&mut self, key: impl Into<String>, factory: Arc<dyn TtsFactory>) {
        self.tts.insert(key.into(), factory);
    }

    pub fn asr_factory(&self, key: &str) -> Result<Arc<dyn AsrFactory>> {
        self.asr
            .get(key)
            .cloned()
            .ok_or_else(|| unknown_provider("asr", key))
    }

    pub fn llm_factory(&self, key: &str) -> Result<Arc<dyn LlmFactory>> {
        self.llm
            .get(key)
            .cloned()
            .ok_or_else(|| unknown_provider("llm", key))
    }

    pub fn vlllm_factory(&self, key: &str) -> Result<Arc<dyn VlllmFactory>> {
        self.vlllm
            .get(key)
            .cloned()
            .ok_or_else(|| unknown_provider("vlllm", key))
    }

    pub fn tts_factory(&self, key: &str) -> Result<Arc<dyn TtsFactory>> {
        self.tts
            .get(key)
            .cloned()
            .ok_or_else(|| unknown_provider("tts", key))
    }
}

fn unknown_provider(kind: &str, key: &str) -> Error {
    Error::Config(format!("no {kind} provider registered under key '{key}'"))
}

/// Register the built-in vendor integrations. Called once from server
/// assembly.
pub fn register_builtin_providers(registry: &mut ProviderRegistry) {
    registry.register_asr("openai", Arc::new(openai::OpenAiAsrFactory));
    registry.register_llm("openai", Arc::new(openai::OpenAiLlmFactory));
    registry.register_vlllm("openai", Arc::new(openai::OpenAiVlllmFactory));
    registry.register_tts("openai", Arc::new(openai::OpenAiTtsFactory));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registration_covers_all_kinds() {
        let mut registry = ProviderRegistry::new();
        register_builtin_providers(&mut registry);
        assert!(registry.asr_factory("openai").is_ok());
        assert!(registry.llm_factory("openai").is_ok());
        assert!(registry.vlllm_factory("openai").is_ok());
        assert!(registry.tts_factory("openai").is_ok());
    }

    #[test]
    fn unknown_key_is_a_config_error() {
        let registry = ProviderRegistry::new();
        let err = registry.llm_factory("doubao").expect_err("empty registry");
        assert_eq!(err.kind(), "config_error");
    }
}
