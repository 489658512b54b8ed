//! TOML configuration.
//!
//! Every section except `[db]` may be omitted; missing keys fall back to
//! the defaults below. API keys are never read from the file, only from
//! the environment (`ANTHROPIC_API_KEY`, `OPENAI_API_KEY`).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use casefile_core::chunk::ChunkParams;
use casefile_core::search::RetrievalParams;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_max_tokens() -> usize {
    500
}
fn default_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_candidates")]
    pub vector_candidates: usize,
    #[serde(default = "default_candidates")]
    pub lexical_candidates: usize,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    /// Longest chunk excerpt shown to the model per result.
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_candidates: default_candidates(),
            lexical_candidates: default_candidates(),
            rrf_k: default_rrf_k(),
            final_limit: default_final_limit(),
            snippet_chars: default_snippet_chars(),
        }
    }
}

fn default_candidates() -> usize {
    20
}
fn default_rrf_k() -> f64 {
    60.0
}
fn default_final_limit() -> usize {
    10
}
fn default_snippet_chars() -> usize {
    1200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (OpenAI-compatible gateway or Ollama host).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// Chat and auxiliary model settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelsConfig {
    #[serde(default = "default_models_provider")]
    pub provider: String,
    /// Model that runs the tool-calling answer loop.
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    /// Cheaper model for enrichment, OCR, and titles.
    #[serde(default = "default_aux_model")]
    pub aux_model: String,
    #[serde(default = "default_models_url")]
    pub base_url: String,
    #[serde(default = "default_models_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_models_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_models_retries")]
    pub max_retries: u32,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            provider: default_models_provider(),
            chat_model: default_chat_model(),
            aux_model: default_aux_model(),
            base_url: default_models_url(),
            max_tokens: default_models_max_tokens(),
            timeout_secs: default_models_timeout(),
            max_retries: default_models_retries(),
        }
    }
}

fn default_models_provider() -> String {
    "anthropic".to_string()
}
fn default_chat_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}
fn default_aux_model() -> String {
    "claude-haiku-4-5-20251001".to_string()
}
fn default_models_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_models_max_tokens() -> u32 {
    4096
}
fn default_models_timeout() -> u64 {
    120
}
fn default_models_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_enrichment_retries")]
    pub max_retries: u32,
    /// Document text beyond this many characters is cut from the prompt.
    #[serde(default = "default_max_document_chars")]
    pub max_document_chars: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: default_concurrency(),
            max_retries: default_enrichment_retries(),
            max_document_chars: default_max_document_chars(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_concurrency() -> usize {
    6
}
fn default_enrichment_retries() -> u32 {
    2
}
fn default_max_document_chars() -> usize {
    100_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    /// Rasterization upscale; 1.0 is 72 DPI.
    #[serde(default = "default_ocr_scale")]
    pub scale: f32,
    #[serde(default = "default_renderer")]
    pub renderer: String,
    /// Switch to OCR when the text layer is (nearly) empty.
    #[serde(default = "default_true")]
    pub auto_fallback: bool,
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,
    #[serde(default = "default_ocr_timeout")]
    pub timeout_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            scale: default_ocr_scale(),
            renderer: default_renderer(),
            auto_fallback: true,
            min_text_chars: default_min_text_chars(),
            timeout_secs: default_ocr_timeout(),
        }
    }
}

impl OcrConfig {
    pub fn dpi(&self) -> u32 {
        (72.0 * self.scale).round() as u32
    }
}

fn default_ocr_scale() -> f32 {
    2.0
}
fn default_renderer() -> String {
    "pdftoppm".to_string()
}
fn default_min_text_chars() -> usize {
    50
}
fn default_ocr_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    #[serde(default = "default_true")]
    pub web_search: bool,
    #[serde(default = "default_max_web_searches")]
    pub max_web_searches: u32,
    /// Prior messages replayed to the model.
    #[serde(default = "default_history_messages")]
    pub history_messages: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            deadline_secs: default_deadline_secs(),
            web_search: true,
            max_web_searches: default_max_web_searches(),
            history_messages: default_history_messages(),
        }
    }
}

fn default_max_turns() -> usize {
    6
}
fn default_deadline_secs() -> u64 {
    120
}
fn default_max_web_searches() -> u32 {
    3
}
fn default_history_messages() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
        }
    }
}

fn default_max_bytes() -> usize {
    25 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7331".to_string()
}

impl Config {
    /// Defaults for everything, with the database at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            models: ModelsConfig::default(),
            enrichment: EnrichmentConfig::default(),
            ocr: OcrConfig::default(),
            agent: AgentConfig::default(),
            upload: UploadConfig::default(),
            server: ServerConfig::default(),
        }
    }

    pub fn chunk_params(&self) -> ChunkParams {
        ChunkParams {
            max_tokens: self.chunking.max_tokens,
            overlap_tokens: self.chunking.overlap_tokens,
        }
    }

    pub fn retrieval_params(&self) -> RetrievalParams {
        RetrievalParams {
            vector_candidates: self.retrieval.vector_candidates,
            lexical_candidates: self.retrieval.lexical_candidates,
            rrf_k: self.retrieval.rrf_k,
            final_limit: self.retrieval.final_limit,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }

    // Retrieval
    if config.retrieval.final_limit < 1 {
        bail!("retrieval.final_limit must be >= 1");
    }
    if config.retrieval.rrf_k <= 0.0 {
        bail!("retrieval.rrf_k must be > 0");
    }
    if config.retrieval.vector_candidates == 0 || config.retrieval.lexical_candidates == 0 {
        bail!("retrieval candidate counts must be >= 1");
    }

    // Embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    // Models
    match config.models.provider.as_str() {
        "anthropic" | "disabled" => {}
        other => bail!(
            "Unknown models provider: '{}'. Must be anthropic or disabled.",
            other
        ),
    }

    // Agent and enrichment
    if config.agent.max_turns == 0 {
        bail!("agent.max_turns must be >= 1");
    }
    if config.agent.deadline_secs == 0 {
        bail!("agent.deadline_secs must be >= 1");
    }
    if config.enrichment.concurrency == 0 {
        bail!("enrichment.concurrency must be >= 1");
    }
    if config.ocr.scale <= 0.0 {
        bail!("ocr.scale must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"./data/casefile.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.max_tokens, 500);
        assert_eq!(config.chunking.overlap_tokens, 50);
        assert_eq!(config.retrieval.rrf_k, 60.0);
        assert_eq!(config.retrieval.final_limit, 10);
        assert_eq!(config.agent.max_turns, 6);
        assert_eq!(config.agent.deadline_secs, 120);
        assert_eq!(config.ocr.dpi(), 144);
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn test_overlap_must_be_below_budget() {
        let err = parse("[db]\npath = \"x\"\n[chunking]\nmax_tokens = 50\noverlap_tokens = 50\n")
            .unwrap_err();
        assert!(err.to_string().contains("overlap_tokens"));
    }

    #[test]
    fn test_enabled_embedding_requires_model_and_dims() {
        let err = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\n").unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn test_unknown_embedding_provider() {
        let err = parse(
            "[db]\npath = \"x\"\n[embedding]\nprovider = \"magic\"\nmodel = \"m\"\ndims = 3\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_zero_turns_rejected() {
        assert!(parse("[db]\npath = \"x\"\n[agent]\nmax_turns = 0\n").is_err());
    }

    #[test]
    fn test_example_config_parses() {
        let config = parse(include_str!("../config/casefile.example.toml")).unwrap();
        assert_eq!(config.embedding.dims, Some(1536));
        assert_eq!(config.upload.max_bytes, 25 * 1024 * 1024);
    }
}
