pub mod config;
pub mod error;
pub mod db;
pub mod models;
pub mod cache;
pub mod embeddings;
pub mod llm;
pub mod extraction;
pub mod store;
pub mod resolve;
pub mod ingest;
pub mod search;
pub mod services;

pub use config::Config;
pub use error::{Result, TempographError};
pub use ingest::{AddEpisodeOptions, CancelToken, Ingestor, IngestorBuilder};
pub use models::{CommunityNode, Edge, EdgeKind, EntityNode, EpisodeInput, EpisodicNode, Node};
pub use resolve::{validate_strategy, DefaultStrategy, ResolutionStrategy};
pub use search::{SearchConfig, SearchEngine, SearchResults};
pub use store::{GraphStore, SqliteGraphStore};
