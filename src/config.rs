//! Configuration types for PDF ingestion.
//!
//! All driver, stage and adapter behaviour is controlled through
//! [`IngestConfig`], built via its [`IngestConfigBuilder`]. Setters clamp to
//! sane ranges; [`IngestConfigBuilder::build`] rejects what cannot be clamped.

use crate::error::IngestError;
use crate::progress::ProgressCallback;
use crate::retry::RetryPolicy;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default Upstage document-parse endpoint used by [`crate::pipeline::layout::UpstageLayoutClient`].
pub const DEFAULT_LAYOUT_ENDPOINT: &str = "https://api.upstage.ai/v1/document-ai/document-parse";

/// Configuration for an ingestion run.
///
/// # Example
/// ```rust
/// use pdfgraph_ingest::IngestConfig;
///
/// let config = IngestConfig::builder()
///     .input_dir("./data/pdf")
///     .language("ko")
///     .concurrency(4)
///     .build()
///     .unwrap();
/// assert_eq!(config.split_batch_size, 10);
/// ```
#[derive(Clone)]
pub struct IngestConfig {
    /// Directory scanned for `.pdf` files (non-recursive). Default: `./data`.
    pub input_dir: PathBuf,

    /// Ledger file. Default: `<input_dir>/processed_states.json`.
    pub ledger_path: Option<PathBuf>,

    /// Root for cropped images and tables. Default: `<input_dir>/artifacts`.
    pub artifact_dir: Option<PathBuf>,

    /// JSON-lines file receiving index documents (CLI sink). Default: `<input_dir>/documents.jsonl`.
    pub documents_path: Option<PathBuf>,

    /// Language the summaries are written in, e.g. `"en"`, `"ko"`. Default: `"en"`.
    pub language: String,

    /// Pages per split file. Range: 1–500. Default: 10.
    ///
    /// The layout service bills and times out per request; smaller files keep
    /// each call short and let a failed batch be retried cheaply.
    pub split_batch_size: usize,

    /// Width in pixels pages are rendered at before cropping. Default: 2000.
    pub render_width: u32,

    /// Concurrent model calls within one summarisation stage. Default: 10.
    pub concurrency: usize,

    /// PDFs processed at the same time. Default: 1.
    pub file_concurrency: usize,

    /// Attempts per stage or sink call, including the first. Default: 3.
    pub max_attempts: u32,

    /// Delay after the first failed attempt, doubling afterwards. Default: 500.
    pub retry_backoff_ms: u64,

    /// Cap for a single backoff delay. Default: 8000.
    pub max_backoff_ms: u64,

    /// One-off wait after the first rate-limit error. Default: 30.
    pub rate_limit_cooldown_secs: u64,

    /// LLM model identifier, e.g. "gpt-4.1-nano". If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for summaries. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens per model response. Default: 4096.
    pub max_tokens: usize,

    /// Layout analysis endpoint. Default: [`DEFAULT_LAYOUT_ENDPOINT`].
    pub layout_endpoint: String,

    /// Layout API key. Falls back to `UPSTAGE_API_KEY` when None.
    pub layout_api_key: Option<String>,

    /// Per-call timeout for model and layout requests, in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Re-run files already present in the ledger. Default: false.
    pub force: bool,

    /// Re-run files whose last run was partial. Default: false.
    pub reprocess_partial: bool,

    /// Drop ledger entries whose source PDF no longer exists. Default: false.
    pub prune_missing: bool,

    /// Receives batch, file and stage events. Default: None (no-op).
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("./data"),
            ledger_path: None,
            artifact_dir: None,
            documents_path: None,
            language: "en".to_string(),
            split_batch_size: 10,
            render_width: 2000,
            concurrency: 10,
            file_concurrency: 1,
            max_attempts: 3,
            retry_backoff_ms: 500,
            max_backoff_ms: 8000,
            rate_limit_cooldown_secs: 30,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 4096,
            layout_endpoint: DEFAULT_LAYOUT_ENDPOINT.to_string(),
            layout_api_key: None,
            api_timeout_secs: 60,
            force: false,
            reprocess_partial: false,
            prune_missing: false,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for IngestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestConfig")
            .field("input_dir", &self.input_dir)
            .field("ledger_path", &self.ledger_path())
            .field("artifact_dir", &self.artifact_dir())
            .field("language", &self.language)
            .field("split_batch_size", &self.split_batch_size)
            .field("render_width", &self.render_width)
            .field("concurrency", &self.concurrency)
            .field("file_concurrency", &self.file_concurrency)
            .field("max_attempts", &self.max_attempts)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("layout_endpoint", &self.layout_endpoint)
            .field("layout_api_key", &self.layout_api_key.as_ref().map(|_| "<redacted>"))
            .field("force", &self.force)
            .field("reprocess_partial", &self.reprocess_partial)
            .field("prune_missing", &self.prune_missing)
            .finish()
    }
}

impl IngestConfig {
    pub fn builder() -> IngestConfigBuilder {
        IngestConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ledger_path
            .clone()
            .unwrap_or_else(|| self.input_dir.join("processed_states.json"))
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.artifact_dir
            .clone()
            .unwrap_or_else(|| self.input_dir.join("artifacts"))
    }

    pub fn documents_path(&self) -> PathBuf {
        self.documents_path
            .clone()
            .unwrap_or_else(|| self.input_dir.join("documents.jsonl"))
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// The retry policy applied to every stage and sink call.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_backoff_ms),
            multiplier: 2,
            max_delay: Duration::from_millis(self.max_backoff_ms),
            rate_limit_cooldown: Duration::from_secs(self.rate_limit_cooldown_secs),
        }
    }
}

/// Builder for [`IngestConfig`].
#[derive(Clone)]
pub struct IngestConfigBuilder {
    config: IngestConfig,
}

impl fmt::Debug for IngestConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl IngestConfigBuilder {
    pub fn input_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.input_dir = dir.into();
        self
    }

    pub fn ledger_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ledger_path = Some(path.into());
        self
    }

    pub fn artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.artifact_dir = Some(dir.into());
        self
    }

    pub fn documents_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.documents_path = Some(path.into());
        self
    }

    pub fn language(mut self, lang: impl Into<String>) -> Self {
        self.config.language = lang.into();
        self
    }

    pub fn split_batch_size(mut self, n: usize) -> Self {
        self.config.split_batch_size = n.clamp(1, 500);
        self
    }

    pub fn render_width(mut self, px: u32) -> Self {
        self.config.render_width = px.clamp(200, 8000);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn file_concurrency(mut self, n: usize) -> Self {
        self.config.file_concurrency = n.max(1);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n.max(1);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms;
        self
    }

    pub fn rate_limit_cooldown_secs(mut self, secs: u64) -> Self {
        self.config.rate_limit_cooldown_secs = secs;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn layout_endpoint(mut self, url: impl Into<String>) -> Self {
        self.config.layout_endpoint = url.into();
        self
    }

    pub fn layout_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.layout_api_key = Some(key.into());
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn force(mut self, v: bool) -> Self {
        self.config.force = v;
        self
    }

    pub fn reprocess_partial(mut self, v: bool) -> Self {
        self.config.reprocess_partial = v;
        self
    }

    pub fn prune_missing(mut self, v: bool) -> Self {
        self.config.prune_missing = v;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<IngestConfig, IngestError> {
        let c = &self.config;
        if c.language.trim().is_empty() {
            return Err(IngestError::InvalidConfig("language must not be empty".into()));
        }
        if c.concurrency == 0 || c.file_concurrency == 0 {
            return Err(IngestError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if c.max_attempts == 0 {
            return Err(IngestError::InvalidConfig("max_attempts must be ≥ 1".into()));
        }
        if c.max_backoff_ms < c.retry_backoff_ms {
            return Err(IngestError::InvalidConfig(format!(
                "max_backoff_ms ({}) is below retry_backoff_ms ({})",
                c.max_backoff_ms, c.retry_backoff_ms
            )));
        }
        if !c.layout_endpoint.starts_with("http://") && !c.layout_endpoint.starts_with("https://") {
            return Err(IngestError::InvalidConfig(format!(
                "layout endpoint must be an http(s) URL, got '{}'",
                c.layout_endpoint
            )));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_derive_paths_from_input_dir() {
        let config = IngestConfig::builder().input_dir("/data/pdf").build().unwrap();
        assert_eq!(
            config.ledger_path(),
            PathBuf::from("/data/pdf/processed_states.json")
        );
        assert_eq!(config.artifact_dir(), PathBuf::from("/data/pdf/artifacts"));
        assert_eq!(config.documents_path(), PathBuf::from("/data/pdf/documents.jsonl"));
    }

    #[test]
    fn setters_clamp() {
        let config = IngestConfig::builder()
            .split_batch_size(0)
            .concurrency(0)
            .file_concurrency(0)
            .max_attempts(0)
            .temperature(5.0)
            .build()
            .unwrap();
        assert_eq!(config.split_batch_size, 1);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.file_concurrency, 1);
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.temperature, 2.0);
    }

    #[test]
    fn retry_policy_mirrors_config() {
        let config = IngestConfig::builder()
            .retry_backoff_ms(100)
            .max_backoff_ms(1000)
            .rate_limit_cooldown_secs(5)
            .build()
            .unwrap();
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_millis(1000));
        assert_eq!(policy.rate_limit_cooldown, Duration::from_secs(5));
    }

    #[test]
    fn build_rejects_invalid_values() {
        assert!(IngestConfig::builder().language("  ").build().is_err());
        assert!(IngestConfig::builder()
            .retry_backoff_ms(5000)
            .max_backoff_ms(10)
            .build()
            .is_err());
        assert!(IngestConfig::builder()
            .layout_endpoint("ftp://example.com")
            .build()
            .is_err());
    }

    #[test]
    fn debug_redacts_secrets() {
        let config = IngestConfig::builder()
            .layout_api_key("up_secret")
            .build()
            .unwrap();
        let dbg = format!("{:?}", config);
        assert!(!dbg.contains("up_secret"));
        assert!(dbg.contains("<redacted>"));
    }
}
