//! Wiring of stores, collaborators, ingestion and search from a loaded [`Config`].

use std::sync::Arc;

use crate::cache::{EmbeddingCache, ResponseCache};
use crate::config::Config;
use crate::embeddings::{Embedder, OpenAIEmbedder};
use crate::error::{Result, TempographError};
use crate::ingest::{Ingestor, IngestorBuilder};
use crate::llm::{LlmClient, OpenAiChatClient};
use crate::search::{SearchConfig, SearchEngine};
use crate::store::{GraphStore, RawFactStore, SqliteGraphStore, SqliteRawFactStore};

fn api_key(var: &str) -> Result<String> {
    std::env::var(var).map_err(|_| TempographError::Config(format!("environment variable {} not set", var)))
}

fn check_provider(section: &str, provider: &str) -> Result<()> {
    if provider.eq_ignore_ascii_case("openai") {
        Ok(())
    } else {
        Err(TempographError::Config(format!("unsupported {} provider '{}'", section, provider)))
    }
}

/// Embedder configured by `[embeddings]`, with an LRU query cache when `cache_capacity > 0`.
pub fn build_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    let settings = &config.embeddings;
    check_provider("embeddings", &settings.provider)?;
    let mut embedder = OpenAIEmbedder::new(
        api_key(&settings.api_key_env)?,
        settings.model.clone(),
        settings.batch_size,
        settings.dimensions,
    )?
    .with_base_url(settings.base_url.clone());
    if settings.cache_capacity > 0 {
        embedder = embedder.with_cache(Arc::new(EmbeddingCache::new(settings.cache_capacity)));
    }
    Ok(Arc::new(embedder))
}

/// Chat client configured by `[llm]`.
pub fn build_llm(config: &Config) -> Result<Arc<dyn LlmClient>> {
    let settings = &config.llm;
    check_provider("llm", &settings.provider)?;
    let mut client = OpenAiChatClient::new(api_key(&settings.api_key_env)?, settings.model.clone())?
        .with_base_url(settings.base_url.clone())
        .with_temperature(settings.temperature)
        .with_max_retries(settings.max_retries);
    if settings.cache_capacity > 0 {
        client = client.with_cache(Arc::new(ResponseCache::new(settings.cache_capacity)));
    }
    Ok(Arc::new(client))
}

/// Everything a command needs, sharing one database.
pub struct Services {
    pub config: Config,
    pub store: Arc<dyn GraphStore>,
    pub raw_store: Arc<dyn RawFactStore>,
    pub embedder: Arc<dyn Embedder>,
    pub ingestor: Ingestor,
    pub search: SearchEngine,
}

impl Services {
    /// Open (and migrate) the database and build the collaborators from `config`.
    pub async fn open(config: Config) -> Result<Self> {
        let store = SqliteGraphStore::open(config.db_path(), config.migrations_dir()).await?;
        let raw_store: Arc<dyn RawFactStore> = Arc::new(SqliteRawFactStore::new(store.db().clone()));
        let store: Arc<dyn GraphStore> = Arc::new(store);
        let embedder = build_embedder(&config)?;
        let llm = build_llm(&config)?;

        let ingestor = IngestorBuilder::from_config(&config)
            .store(store.clone())
            .raw_store(raw_store.clone())
            .embedder(embedder.clone())
            .llm(llm)
            .build()?;
        let search = SearchEngine::new(store.clone(), embedder.clone());

        log::info!(
            "Opened {} (llm {}, embeddings {})",
            config.db_path().display(),
            config.llm.model,
            config.embeddings.model
        );
        Ok(Self { config, store, raw_store, embedder, ingestor, search })
    }

    /// Search config from the `[search]` defaults.
    pub fn search_config(&self) -> SearchConfig {
        SearchConfig::from_defaults(&self.config.search)
    }
}
