pub mod cancel;
pub mod chunker;
pub mod orchestrator;

use std::fmt;

pub use cancel::CancelToken;
pub use chunker::{chunk, estimate_tokens};
pub use orchestrator::{
    AddEpisodeOptions, AddEpisodeResult, EpisodeOutcome, IngestStats, Ingestor, IngestorBuilder, PromoteResult,
    RemovalReport,
};

/// Steps of the per-episode ingestion state machine, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IngestStage {
    Validate,
    Chunk,
    ContextGather,
    ExtractEntities,
    ResolveEntities,
    ExtractRelationships,
    ResolveRelationships,
    HydrateAttributes,
    BuildEpisodicEdges,
    Persist,
    RebuildCommunities,
    Done,
}

impl IngestStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStage::Validate => "validate",
            IngestStage::Chunk => "chunk",
            IngestStage::ContextGather => "context_gather",
            IngestStage::ExtractEntities => "extract_entities",
            IngestStage::ResolveEntities => "resolve_entities",
            IngestStage::ExtractRelationships => "extract_relationships",
            IngestStage::ResolveRelationships => "resolve_relationships",
            IngestStage::HydrateAttributes => "hydrate_attributes",
            IngestStage::BuildEpisodicEdges => "build_episodic_edges",
            IngestStage::Persist => "persist",
            IngestStage::RebuildCommunities => "rebuild_communities",
            IngestStage::Done => "done",
        }
    }
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
