//! Model access for the summarisation stages.
//!
//! Stages talk to a [`SummaryModel`]: prompt (plus optional image) in, text
//! out. The production implementation, [`ProviderModel`], wraps an
//! `edgequake_llm` provider and adds a per-call timeout. Retries are not
//! done here; the executor's retry wrapper covers the whole stage.

use crate::config::IngestConfig;
use crate::error::{IngestError, StageError};
use crate::pipeline::encode;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Model used when a provider is named without one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// One model call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    /// Image attached to the user turn.
    pub image: Option<PathBuf>,
}

/// Text (or vision) completion used by the summarisation stages.
#[async_trait]
pub trait SummaryModel: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, StageError>;
}

/// [`SummaryModel`] backed by an `edgequake_llm` provider.
pub struct ProviderModel {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
    timeout: Duration,
}

impl ProviderModel {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &IngestConfig) -> Self {
        Self {
            provider,
            options: build_options(config),
            timeout: config.api_timeout(),
        }
    }

    /// Resolve the provider from config and environment, see [`resolve_provider`].
    pub fn from_config(config: &IngestConfig) -> Result<Self, IngestError> {
        Ok(Self::new(resolve_provider(config)?, config))
    }
}

#[async_trait]
impl SummaryModel for ProviderModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, StageError> {
        let user = match &request.image {
            Some(path) => {
                let image = encode::encode_file(path).await?;
                ChatMessage::user_with_images(&request.prompt, vec![image])
            }
            None => ChatMessage::user(&request.prompt),
        };
        let messages = vec![ChatMessage::system(&request.system), user];

        let start = Instant::now();
        let response = tokio::time::timeout(
            self.timeout,
            self.provider.chat(&messages, Some(&self.options)),
        )
        .await
        .map_err(|_| {
            StageError::external(
                "llm",
                format!("no response within {}s", self.timeout.as_secs()),
            )
        })?
        .map_err(|e| StageError::external("llm", e.to_string()))?;

        debug!(
            "{} input tokens, {} output tokens, {:?}",
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );
        Ok(response.content)
    }
}

fn build_options(config: &IngestConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, IngestError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        IngestError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. `config.provider`, used as-is
/// 2. `config.provider_name` + `config.model` (default [`DEFAULT_MODEL`])
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, when both are set
/// 4. OpenAI when `OPENAI_API_KEY` is set
/// 5. `ProviderFactory::from_env()` auto-detection
pub fn resolve_provider(config: &IngestConfig) -> Result<Arc<dyn LLMProvider>, IngestError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
    if let Some(ref name) = config.provider_name {
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_provider(&prov, &env_model);
        }
    }

    if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        return create_provider("openai", model);
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| IngestError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_follow_config() {
        let config = IngestConfig::builder()
            .temperature(0.3)
            .max_tokens(1024)
            .build()
            .unwrap();
        let opts = build_options(&config);
        assert_eq!(opts.temperature, Some(0.3));
        assert_eq!(opts.max_tokens, Some(1024));
    }

    #[test]
    fn default_options_are_deterministic() {
        let opts = build_options(&IngestConfig::default());
        assert_eq!(opts.temperature, Some(0.0));
        assert_eq!(opts.max_tokens, Some(4096));
    }
}
