//! Configuration models for chunkwise.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The user resolves these unknowns at runtime via config file.

use crate::graph::{Stage, StageGraph};
use crate::models::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for chunkwise.
///
/// Every section has defaults, so a minimal file only declares `[[phases]]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Run identity and store location
    #[serde(default)]
    pub run: RunConfig,

    /// Chunker settings
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Admission control budgets
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Retry policy for failed stage calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Worker pool and cross-chunk concurrency
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// LLM endpoint used by the HTTP stage invoker
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Ordered phases of the stage graph
    #[serde(default)]
    pub phases: Vec<PhaseConfig>,
}

/// Run identity and store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Run identity; checkpoints and results are keyed by it.
    /// Defaults to the input file stem when omitted.
    #[serde(default)]
    pub id: Option<String>,

    /// Root directory of the durable store
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("runs")
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            id: None,
            store_dir: default_store_dir(),
        }
    }
}

/// Chunker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Maximum chunk size in characters
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
}

fn default_max_chunk_size() -> usize {
    12_000
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: default_max_chunk_size(),
        }
    }
}

/// Admission control budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum estimated tokens granted per window
    #[serde(default = "default_token_ceiling")]
    pub token_ceiling: u64,

    /// Maximum requests granted per window
    #[serde(default = "default_request_ceiling")]
    pub request_ceiling: u32,

    /// Window duration in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Characters per token used for estimates
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
}

fn default_token_ceiling() -> u64 {
    30_000
}

fn default_request_ceiling() -> u32 {
    30
}

/// Upper bound for configured window and backoff durations (one week).
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

fn default_window_secs() -> u64 {
    60
}

fn default_chars_per_token() -> usize {
    4
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            token_ceiling: default_token_ceiling(),
            request_ceiling: default_request_ceiling(),
            window_secs: default_window_secs(),
            chars_per_token: default_chars_per_token(),
        }
    }
}

impl RateLimitConfig {
    /// Window duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Retry policy for failed stage calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed pause between attempts in seconds
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_secs() -> u64 {
    60
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_secs: default_backoff_secs(),
        }
    }
}

/// Worker pool and cross-chunk concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Chunks in flight at once (1 = strictly sequential)
    #[serde(default = "default_chunk_concurrency")]
    pub chunk_concurrency: usize,

    /// Concurrent stage invocations across all chunks
    #[serde(default = "default_stage_workers")]
    pub stage_workers: usize,
}

fn default_chunk_concurrency() -> usize {
    1
}

fn default_stage_workers() -> usize {
    4
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            chunk_concurrency: default_chunk_concurrency(),
            stage_workers: default_stage_workers(),
        }
    }
}

/// OpenAI-compatible endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base URL for the API (e.g., "http://localhost:11434/v1")
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key (may contain ${ENV_VAR} placeholders)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable name for API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model ID sent with every request
    #[serde(default = "default_model")]
    pub model: String,

    /// Custom headers to include in requests
    /// Values can contain ${ENV_VAR} for environment variable expansion
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum completion tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_timeout() -> u64 {
    180
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f64 {
    0.2
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            api_key_env: default_api_key_env(),
            model: default_model(),
            headers: HashMap::new(),
            timeout_secs: default_timeout(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// One phase of the stage graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Stages executed concurrently in this phase
    pub stages: Vec<StageConfig>,
}

/// One stage declaration.
///
/// Exactly one of `prompt` or `prompt_file` must be given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Unique stage name (e.g. "FinancialStatementsExpert")
    pub name: String,

    /// Inline prompt template
    #[serde(default)]
    pub prompt: Option<String>,

    /// Prompt template file, relative to the config file
    #[serde(default)]
    pub prompt_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source: e,
        })
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let checks: [(bool, &str); 9] = [
            (self.chunking.max_chunk_size == 0, "chunking.max_chunk_size must be > 0"),
            (self.rate_limit.token_ceiling == 0, "rate_limit.token_ceiling must be > 0"),
            (self.rate_limit.request_ceiling == 0, "rate_limit.request_ceiling must be > 0"),
            (self.rate_limit.window_secs == 0, "rate_limit.window_secs must be > 0"),
            (
                self.rate_limit.window_secs > MAX_DURATION_SECS,
                "rate_limit.window_secs must be at most one week",
            ),
            (
                self.retry.backoff_secs > MAX_DURATION_SECS,
                "retry.backoff_secs must be at most one week",
            ),
            (self.rate_limit.chars_per_token == 0, "rate_limit.chars_per_token must be > 0"),
            (
                self.concurrency.chunk_concurrency == 0,
                "concurrency.chunk_concurrency must be > 0",
            ),
            (self.concurrency.stage_workers == 0, "concurrency.stage_workers must be > 0"),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(PipelineError::InvalidConfig((*message).to_string())),
            None => Ok(()),
        }
    }

    /// Resolve prompts and build a validated stage graph.
    ///
    /// `base_dir` anchors relative `prompt_file` paths (usually the config
    /// file's directory).
    pub fn build_graph(&self, base_dir: &Path) -> Result<StageGraph, PipelineError> {
        let mut phases = Vec::with_capacity(self.phases.len());

        for phase in &self.phases {
            let mut stages = Vec::with_capacity(phase.stages.len());
            for stage in &phase.stages {
                let template = match (&stage.prompt, &stage.prompt_file) {
                    (Some(prompt), None) => prompt.clone(),
                    (None, Some(file)) => {
                        let path = base_dir.join(file);
                        std::fs::read_to_string(&path).map_err(|e| ConfigError::PromptRead {
                            stage: stage.name.clone(),
                            path,
                            source: e,
                        })?
                    }
                    _ => {
                        return Err(PipelineError::InvalidGraph(format!(
                            "stage '{}' needs exactly one of prompt or prompt_file",
                            stage.name
                        )));
                    }
                };
                stages.push(Stage::new(&stage.name, template)?);
            }
            phases.push(stages);
        }

        StageGraph::new(phases)
    }

    /// Resolve the API key for the configured endpoint.
    ///
    /// Returns `None` when no key is configured and the env var is unset,
    /// which is valid for local endpoints.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.endpoint.api_key {
            return Some(expand_env_vars(key));
        }
        std::env::var(&self.endpoint.api_key_env).ok()
    }

    /// Resolve the API key, failing when none is available.
    pub fn require_api_key(&self) -> Result<String, ConfigError> {
        self.resolve_api_key().ok_or_else(|| ConfigError::MissingApiKey {
            env_var: self.endpoint.api_key_env.clone(),
        })
    }

    /// Resolve the run identity, falling back to the input file stem.
    pub fn run_id_for(&self, input: &Path) -> String {
        self.run.id.clone().unwrap_or_else(|| {
            input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "default".to_string())
        })
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return s.to_string();
    };

    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}

/// Expand environment variables in all headers.
pub fn expand_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.clone(), expand_env_vars(v)))
        .collect()
}

/// Configuration errors.
///
/// Epistemic origin:
/// - B_i falsified: File not found, parse error
/// - I^B materialized: Missing required values
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to read prompt for stage '{stage}' from {path}: {source}")]
    PromptRead {
        stage: String,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Missing API key: set {env_var} env var or endpoint.api_key in config")]
    MissingApiKey { env_var: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
[[phases]]
stages = [{ name = "A", prompt = "alpha" }, { name = "B", prompt = "beta" }]

[[phases]]
stages = [{ name = "C", prompt_file = "c.md" }]
"#;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.chunking.max_chunk_size, 12_000);
        assert_eq!(config.rate_limit.token_ceiling, 30_000);
        assert_eq!(config.rate_limit.request_ceiling, 30);
        assert_eq!(config.rate_limit.window(), Duration::from_secs(60));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.concurrency.chunk_concurrency, 1);
        assert_eq!(config.phases.len(), 2);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = Config::from_toml_str(MINIMAL).unwrap();
        config.chunking.max_chunk_size = 0;
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(msg)) if msg.contains("max_chunk_size")
        ));

        let mut config = Config::from_toml_str(MINIMAL).unwrap();
        config.concurrency.chunk_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_durations() {
        let mut config = Config::from_toml_str(MINIMAL).unwrap();
        config.rate_limit.window_secs = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(msg)) if msg.contains("window_secs")
        ));

        let mut config = Config::from_toml_str(MINIMAL).unwrap();
        config.retry.backoff_secs = MAX_DURATION_SECS + 1;
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(msg)) if msg.contains("backoff_secs")
        ));

        let mut config = Config::from_toml_str(MINIMAL).unwrap();
        config.rate_limit.window_secs = MAX_DURATION_SECS;
        config.retry.backoff_secs = MAX_DURATION_SECS;
        config.validate().unwrap();
    }

    #[test]
    fn test_build_graph_reads_prompt_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("c.md"), "gamma template").unwrap();

        let config = Config::from_toml_str(MINIMAL).unwrap();
        let graph = config.build_graph(dir.path()).unwrap();

        assert_eq!(graph.phases().len(), 2);
        let c = graph.stage("C").unwrap();
        assert_eq!(c.template(), "gamma template");
    }

    #[test]
    fn test_build_graph_missing_prompt_file() {
        let dir = TempDir::new().unwrap();
        let config = Config::from_toml_str(MINIMAL).unwrap();
        let err = config.build_graph(dir.path()).unwrap_err();
        assert!(matches!(err, PipelineError::Config(ConfigError::PromptRead { .. })));
    }

    #[test]
    fn test_stage_needs_exactly_one_prompt_source() {
        let config = Config::from_toml_str(
            r#"
[[phases]]
stages = [{ name = "A" }]
"#,
        )
        .unwrap();
        let err = config.build_graph(Path::new(".")).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidGraph(_)));
    }

    #[test]
    fn test_run_id_falls_back_to_file_stem() {
        let config = Config::default();
        assert_eq!(config.run_id_for(Path::new("filings/acme-10k.txt")), "acme-10k");

        let mut config = Config::default();
        config.run.id = Some("explicit".to_string());
        assert_eq!(config.run_id_for(Path::new("filings/acme-10k.txt")), "explicit");
    }

    #[test]
    fn test_expand_env_vars_leaves_unknown_placeholders() {
        let out = expand_env_vars("Bearer ${CHUNKWISE_SURELY_UNSET_VAR}");
        assert_eq!(out, "Bearer ${CHUNKWISE_SURELY_UNSET_VAR}");
    }
}
