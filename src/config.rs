use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::extraction::ResponseFormat;
use crate::resolve::StrategyErrorPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub tempograph: TempographConfig,
    pub llm: LlmConfig,
    pub embeddings: EmbeddingsConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub search: SearchDefaults,
    #[serde(default)]
    pub community: CommunityConfig,
    #[serde(default)]
    pub entity_types: Vec<EntityTypeSpec>,
    #[serde(default)]
    pub edge_types: Vec<EdgeTypeSpec>,
}

/// Tempograph-specific configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TempographConfig {
    pub db_path: PathBuf,
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_group_id")]
    pub default_group_id: String,
}

/// Language model (extraction collaborator) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub api_key_env: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub response_format: ResponseFormat,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

/// Embeddings configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingsConfig {
    pub provider: String,
    pub model: String,
    pub api_key_env: String,
    pub batch_size: usize,
    pub dimensions: usize,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

/// Ingestion pipeline tuning
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_chunk_max_chars")]
    pub chunk_max_chars: usize,
    #[serde(default = "default_previous_episodes")]
    pub previous_episodes: usize,
    #[serde(default = "default_dedupe_threshold")]
    pub dedupe_threshold: f32,
    #[serde(default = "default_restatement_threshold")]
    pub restatement_threshold: f32,
    #[serde(default = "default_true")]
    pub hydrate_attributes: bool,
    #[serde(default)]
    pub update_communities: bool,
    #[serde(default = "default_non_exclusive_relations")]
    pub non_exclusive_relations: Vec<String>,
    #[serde(default)]
    pub strategy_error_policy: StrategyErrorPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_max_chars: default_chunk_max_chars(),
            previous_episodes: default_previous_episodes(),
            dedupe_threshold: default_dedupe_threshold(),
            restatement_threshold: default_restatement_threshold(),
            hydrate_attributes: true,
            update_communities: false,
            non_exclusive_relations: default_non_exclusive_relations(),
            strategy_error_policy: StrategyErrorPolicy::default(),
        }
    }
}

/// Search defaults used when a caller does not pass a full search config
#[derive(Debug, Clone, Deserialize)]
pub struct SearchDefaults {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default)]
    pub min_score: f32,
    #[serde(default = "default_bfs_max_depth")]
    pub bfs_max_depth: usize,
    #[serde(default = "default_mmr_lambda")]
    pub mmr_lambda: f32,
}

impl Default for SearchDefaults {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            min_score: 0.0,
            bfs_max_depth: default_bfs_max_depth(),
            mmr_lambda: default_mmr_lambda(),
        }
    }
}

/// Community detection tuning
#[derive(Debug, Clone, Deserialize)]
pub struct CommunityConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

impl Default for CommunityConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
        }
    }
}

/// A custom entity type the extractor may assign.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityTypeSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// A custom relation type. `exclusive = false` marks co-occurring facts that never
/// invalidate each other.
#[derive(Debug, Clone, Deserialize)]
pub struct EdgeTypeSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub exclusive: bool,
    #[serde(default)]
    pub source_types: Vec<String>,
    #[serde(default)]
    pub target_types: Vec<String>,
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_group_id() -> String {
    "default".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_max_retries() -> usize {
    3
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_chunk_max_chars() -> usize {
    2000
}

fn default_previous_episodes() -> usize {
    4
}

fn default_dedupe_threshold() -> f32 {
    0.85
}

fn default_restatement_threshold() -> f32 {
    0.95
}

fn default_true() -> bool {
    true
}

fn default_non_exclusive_relations() -> Vec<String> {
    vec!["CO_OCCURS_WITH".to_string()]
}

fn default_limit() -> usize {
    10
}

fn default_bfs_max_depth() -> usize {
    2
}

fn default_mmr_lambda() -> f32 {
    0.5
}

fn default_max_iterations() -> usize {
    20
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in TEMPOGRAPH_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        // .env is optional
        let _ = dotenv::dotenv();

        let config_path = std::env::var("TEMPOGRAPH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml_str(&config_str)?;

        std::env::var(&config.llm.api_key_env).with_context(|| {
            format!(
                "Environment variable {} not set. Set it in your .env file or as an environment variable.",
                config.llm.api_key_env
            )
        })?;
        std::env::var(&config.embeddings.api_key_env).with_context(|| {
            format!(
                "Environment variable {} not set. Set it in your .env file or as an environment variable.",
                config.embeddings.api_key_env
            )
        })?;

        Ok(config)
    }

    /// Parse and validate configuration from a TOML string (no environment checks)
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(config_str).context("Failed to parse config.toml")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.embeddings.dimensions == 0 {
            anyhow::bail!("embeddings.dimensions must be greater than 0");
        }

        if self.embeddings.batch_size == 0 {
            anyhow::bail!("embeddings.batch_size must be greater than 0");
        }

        if self.ingest.chunk_max_chars == 0 {
            anyhow::bail!("ingest.chunk_max_chars must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.ingest.dedupe_threshold) {
            anyhow::bail!("ingest.dedupe_threshold must be between 0.0 and 1.0");
        }

        if !(0.0..=1.0).contains(&self.ingest.restatement_threshold) {
            anyhow::bail!("ingest.restatement_threshold must be between 0.0 and 1.0");
        }

        if self.search.default_limit == 0 {
            anyhow::bail!("search.default_limit must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.search.mmr_lambda) {
            anyhow::bail!("search.mmr_lambda must be between 0.0 and 1.0");
        }

        if self.community.max_iterations == 0 {
            anyhow::bail!("community.max_iterations must be greater than 0");
        }

        validate_type_declarations(&self.entity_types, &self.edge_types)
            .map_err(|e| anyhow::anyhow!(e))?;

        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> &Path {
        &self.tempograph.db_path
    }

    /// Get migrations directory
    pub fn migrations_dir(&self) -> &Path {
        &self.tempograph.migrations_dir
    }
}

/// Check custom entity/edge type declarations.
///
/// Names must be identifiers, unique, must not shadow the built-in `Entity` type, and
/// edge endpoint types must refer to declared entity types (or `Entity`).
pub fn validate_type_declarations(
    entity_types: &[EntityTypeSpec],
    edge_types: &[EdgeTypeSpec],
) -> std::result::Result<(), String> {
    let ident = Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("Invalid regex pattern");

    let mut entity_names = HashSet::new();
    for spec in entity_types {
        if !ident.is_match(&spec.name) {
            return Err(format!("invalid entity type name '{}'", spec.name));
        }
        if spec.name.eq_ignore_ascii_case(crate::models::DEFAULT_ENTITY_TYPE) {
            return Err(format!(
                "entity type '{}' shadows the built-in entity type",
                spec.name
            ));
        }
        if !entity_names.insert(spec.name.to_lowercase()) {
            return Err(format!("duplicate entity type '{}'", spec.name));
        }
    }

    let mut edge_names = HashSet::new();
    for spec in edge_types {
        if !ident.is_match(&spec.name) {
            return Err(format!("invalid edge type name '{}'", spec.name));
        }
        if !edge_names.insert(crate::models::relation_class(&spec.name)) {
            return Err(format!("duplicate edge type '{}'", spec.name));
        }
        for endpoint in spec.source_types.iter().chain(spec.target_types.iter()) {
            let known = endpoint.eq_ignore_ascii_case(crate::models::DEFAULT_ENTITY_TYPE)
                || entity_names.contains(&endpoint.to_lowercase());
            if !known {
                return Err(format!(
                    "edge type '{}' references unknown entity type '{}'",
                    spec.name, endpoint
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serialize config tests that mutate process-wide env so they don't race.
    static CONFIG_TEST_LOCK: Mutex<()> = Mutex::new(());

    const BASE_CONFIG: &str = r#"
[tempograph]
db_path = "./test.db"
log_level = "debug"

[llm]
provider = "openai"
model = "gpt-4o-mini"
api_key_env = "TEMPOGRAPH_TEST_LLM_KEY"

[embeddings]
provider = "openai"
model = "text-embedding-3-small"
api_key_env = "TEMPOGRAPH_TEST_EMBED_KEY"
batch_size = 100
dimensions = 1536
"#;

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_toml_str(BASE_CONFIG).unwrap();
        assert_eq!(config.tempograph.log_level, "debug");
        assert_eq!(config.tempograph.default_group_id, "default");
        assert_eq!(config.ingest.chunk_max_chars, 2000);
        assert!((config.ingest.dedupe_threshold - 0.85).abs() < 1e-6);
        assert_eq!(config.ingest.previous_episodes, 4);
        assert_eq!(config.search.bfs_max_depth, 2);
        assert!((config.search.mmr_lambda - 0.5).abs() < 1e-6);
        assert_eq!(config.llm.response_format, ResponseFormat::Tabular);
        assert_eq!(config.ingest.strategy_error_policy, StrategyErrorPolicy::Fail);
    }

    #[test]
    fn test_example_config_parses() {
        let config = Config::from_toml_str(include_str!("../config.example.toml")).unwrap();
        assert_eq!(config.entity_types.len(), 3);
        assert!(!config.edge_types[0].exclusive);
        assert!(config.edge_types[1].exclusive);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let text = format!("{}\n[ingest]\ndedupe_threshold = 1.5\n", BASE_CONFIG);
        let err = Config::from_toml_str(&text).unwrap_err();
        assert!(err.to_string().contains("dedupe_threshold"));
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        let text = BASE_CONFIG.replace("dimensions = 1536", "dimensions = 0");
        assert!(Config::from_toml_str(&text).is_err());
    }

    #[test]
    fn test_type_declarations() {
        let text = format!(
            "{}\n{}",
            BASE_CONFIG,
            r#"
[[entity_types]]
name = "Person"
description = "A human"

[[edge_types]]
name = "WORKS_AT"
source_types = ["Person"]
target_types = ["Entity"]

[[edge_types]]
name = "co_occurs_with"
exclusive = false
"#
        );
        let config = Config::from_toml_str(&text).unwrap();
        assert_eq!(config.entity_types.len(), 1);
        assert!(!config.edge_types[1].exclusive);
    }

    #[test]
    fn test_unknown_edge_endpoint_rejected() {
        let entity_types = vec![EntityTypeSpec {
            name: "Person".to_string(),
            description: String::new(),
        }];
        let edge_types = vec![EdgeTypeSpec {
            name: "LOCATED_IN".to_string(),
            description: String::new(),
            exclusive: true,
            source_types: vec!["Place".to_string()],
            target_types: vec![],
        }];
        let err = validate_type_declarations(&entity_types, &edge_types).unwrap_err();
        assert!(err.contains("Place"));
    }

    #[test]
    fn test_shadowing_builtin_entity_rejected() {
        let entity_types = vec![EntityTypeSpec {
            name: "entity".to_string(),
            description: String::new(),
        }];
        assert!(validate_type_declarations(&entity_types, &[]).is_err());
    }

    #[test]
    fn test_config_load_missing_api_key() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, BASE_CONFIG).unwrap();

        std::env::set_var("TEMPOGRAPH_CONFIG", config_path.to_str().unwrap());
        std::env::remove_var("TEMPOGRAPH_TEST_LLM_KEY");
        let result = Config::load();
        std::env::remove_var("TEMPOGRAPH_CONFIG");

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("TEMPOGRAPH_TEST_LLM_KEY"));
    }

    #[test]
    fn test_config_load_success() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, BASE_CONFIG).unwrap();

        std::env::set_var("TEMPOGRAPH_CONFIG", config_path.to_str().unwrap());
        std::env::set_var("TEMPOGRAPH_TEST_LLM_KEY", "test-key");
        std::env::set_var("TEMPOGRAPH_TEST_EMBED_KEY", "test-key");
        let result = Config::load();
        std::env::remove_var("TEMPOGRAPH_CONFIG");
        std::env::remove_var("TEMPOGRAPH_TEST_LLM_KEY");
        std::env::remove_var("TEMPOGRAPH_TEST_EMBED_KEY");

        let config = result.expect("config should load");
        assert_eq!(config.embeddings.batch_size, 100);
    }

    #[test]
    fn test_config_invalid_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        std::env::set_var("TEMPOGRAPH_CONFIG", "nonexistent.toml");
        let config = Config::load();
        std::env::remove_var("TEMPOGRAPH_CONFIG");
        assert!(config.is_err());
    }
}
