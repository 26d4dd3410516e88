#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use tempograph::config::IngestConfig;
use tempograph::embeddings::Embedder;
use tempograph::llm::{LlmClient, LlmRequest, PromptKind};
use tempograph::resolve::{CommunityReport, DedupeResult, RelationshipResolution, UuidMap};
use tempograph::store::{RawFactStore, SqliteRawFactStore};
use tempograph::{
    DefaultStrategy, Edge, EntityNode, EpisodeInput, EpisodicNode, GraphStore, Ingestor, ResolutionStrategy, Result,
    SqliteGraphStore, TempographError,
};

pub const GROUP: &str = "team";

pub fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap()
}

pub fn episode(name: &str, content: &str, reference_time: DateTime<Utc>) -> EpisodeInput {
    EpisodeInput::new(name, content, GROUP, reference_time)
}

/// Text between `open` and `close` in `text`, if both are present in order.
pub fn section<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let end = text[start..].find(close)? + start;
    Some(&text[start..end])
}

/// Payload section of a prompt: the chunk for extraction, the text for hydration,
/// the member list for summaries. Context blocks are ignored so rules only match the
/// text under extraction.
fn payload(request: &LlmRequest) -> String {
    let text = request.user_text();
    for (open, close) in [("<CURRENT EPISODE>", "</CURRENT EPISODE>"), ("<TEXT>", "</TEXT>"), ("<MEMBERS>", "</MEMBERS>")] {
        if let Some(inner) = section(text, open, close) {
            return inner.to_string();
        }
    }
    text.to_string()
}

struct Rule {
    kind: PromptKind,
    needle: String,
    response: String,
}

/// Language model double answering from scripted rules.
///
/// The first rule whose kind matches and whose needle occurs in the prompt payload
/// wins; unmatched requests get an empty answer.
#[derive(Default)]
pub struct ScriptedLlm {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<(PromptKind, String)>>,
    prompts: Mutex<Vec<(PromptKind, String)>>,
    fail_on: Mutex<Option<PromptKind>>,
}

impl ScriptedLlm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, kind: PromptKind, needle: &str, response: &str) {
        self.rules.lock().unwrap().push(Rule {
            kind,
            needle: needle.to_string(),
            response: response.to_string(),
        });
    }

    pub fn fail_on(&self, kind: PromptKind) {
        *self.fail_on.lock().unwrap() = Some(kind);
    }

    pub fn calls(&self, kind: PromptKind) -> usize {
        self.calls.lock().unwrap().iter().filter(|(k, _)| *k == kind).count()
    }

    /// Full user prompts sent for `kind`, oldest first.
    pub fn prompts(&self, kind: PromptKind) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn generate(&self, request: &LlmRequest) -> Result<String> {
        let text = payload(request);
        self.calls.lock().unwrap().push((request.kind, text.clone()));
        self.prompts.lock().unwrap().push((request.kind, request.user_text().to_string()));
        if *self.fail_on.lock().unwrap() == Some(request.kind) {
            return Err(TempographError::Llm(format!("scripted failure for {}", request.kind)));
        }
        let rules = self.rules.lock().unwrap();
        Ok(rules
            .iter()
            .find(|r| r.kind == request.kind && text.contains(&r.needle))
            .map(|r| r.response.clone())
            .unwrap_or_default())
    }
}

/// Deterministic bag-of-words embedder: lowercase alphanumeric tokens hashed (FNV-1a)
/// into a fixed number of dimensions, L2-normalized.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self { dims: 1024 }
    }

    fn bucket(&self, token: &str) -> usize {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in token.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        (hash % self.dims as u64) as usize
    }

    fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        let lower = text.to_lowercase();
        for token in lower.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            v[self.bucket(token)] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vector(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Which strategy operation a [`FailingStrategy`] breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breaks {
    Entities,
    Relationships,
}

/// Delegates to an inner strategy except for one operation, which always fails.
pub struct FailingStrategy {
    pub inner: Arc<dyn ResolutionStrategy>,
    pub breaks: Breaks,
}

#[async_trait]
impl ResolutionStrategy for FailingStrategy {
    async fn resolve_entities(&self, candidates: Vec<Vec<EntityNode>>, context: Vec<EntityNode>) -> Result<DedupeResult> {
        if self.breaks == Breaks::Entities {
            return Err(TempographError::Search("entity resolver offline".to_string()));
        }
        self.inner.resolve_entities(candidates, context).await
    }

    async fn resolve_relationships(
        &self,
        candidates: Vec<Edge>,
        uuid_map: &UuidMap,
        canonical_nodes: &[EntityNode],
        episode: &EpisodicNode,
    ) -> Result<RelationshipResolution> {
        if self.breaks == Breaks::Relationships {
            return Err(TempographError::Search("fact resolver offline".to_string()));
        }
        self.inner.resolve_relationships(candidates, uuid_map, canonical_nodes, episode).await
    }

    async fn build_communities(&self, group_id: &str, rebuild: bool) -> Result<CommunityReport> {
        self.inner.build_communities(group_id, rebuild).await
    }
}

/// A migrated store in a temp directory, plus the raw-fact store sharing its database.
pub async fn open_store() -> (Arc<dyn GraphStore>, Arc<dyn RawFactStore>, TempDir) {
    let temp = TempDir::new().unwrap();
    let migrations = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
    let store = SqliteGraphStore::open(&temp.path().join("graph.db"), &migrations).await.unwrap();
    let raw: Arc<dyn RawFactStore> = Arc::new(SqliteRawFactStore::new(store.db().clone()));
    (Arc::new(store), raw, temp)
}

pub struct Harness {
    pub ingestor: Ingestor,
    pub store: Arc<dyn GraphStore>,
    pub llm: Arc<ScriptedLlm>,
    pub embedder: Arc<HashEmbedder>,
    _temp: TempDir,
}

pub async fn harness() -> Harness {
    harness_with(IngestConfig::default(), None).await
}

/// Build an ingestor over a fresh store. `wrap` replaces the default strategy, given
/// the default one to delegate to.
pub async fn harness_with(
    config: IngestConfig,
    wrap: Option<Box<dyn FnOnce(Arc<dyn ResolutionStrategy>) -> Arc<dyn ResolutionStrategy>>>,
) -> Harness {
    let (store, raw, temp) = open_store().await;
    let llm = ScriptedLlm::new();
    let embedder = Arc::new(HashEmbedder::new());

    let mut builder = Ingestor::builder()
        .store(store.clone())
        .raw_store(raw)
        .embedder(embedder.clone())
        .llm(llm.clone())
        .config(config);
    if let Some(wrap) = wrap {
        let extractor = tempograph::extraction::Extractor::new(llm.clone(), Default::default());
        let default: Arc<dyn ResolutionStrategy> =
            Arc::new(DefaultStrategy::new(store.clone(), embedder.clone(), extractor));
        builder = builder.strategy("flaky", wrap(default));
    }

    Harness {
        ingestor: builder.build().unwrap(),
        store,
        llm,
        embedder,
        _temp: temp,
    }
}
