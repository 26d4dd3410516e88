//! Raw-fact store: extraction output parked until it is promoted into the graph.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::db::Db;
use crate::error::{Result, TempographError};
use crate::models::{format_timestamp, parse_timestamp, Edge, EntityNode, EpisodicNode};

/// Candidates extracted from one source, not yet resolved against the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFacts {
    pub source_id: String,
    pub group_id: String,
    /// The episode the facts came from (never written to the graph by extract-only).
    pub episode: EpisodicNode,
    /// Candidate entities per chunk, in chunk order.
    pub entities: Vec<Vec<EntityNode>>,
    /// Candidate edges whose endpoints reference candidate entity UUIDs.
    pub edges: Vec<Edge>,
    pub created_at: DateTime<Utc>,
    pub promoted_at: Option<DateTime<Utc>>,
}

impl RawFacts {
    pub fn entity_count(&self) -> usize {
        self.entities.iter().map(Vec::len).sum()
    }
}

#[async_trait]
pub trait RawFactStore: Send + Sync {
    /// Save (or replace) the facts for `facts.source_id`.
    async fn save(&self, facts: &RawFacts) -> Result<()>;

    async fn get(&self, source_id: &str) -> Result<Option<RawFacts>>;

    /// Source ids in the group not yet promoted, oldest first.
    async fn list_pending(&self, group_id: &str) -> Result<Vec<String>>;

    async fn mark_promoted(&self, source_id: &str, at: DateTime<Utc>) -> Result<()>;
}

/// Raw-fact store sharing the graph's SQLite database
#[derive(Debug, Clone)]
pub struct SqliteRawFactStore {
    db: Db,
}

impl SqliteRawFactStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RawFactStore for SqliteRawFactStore {
    async fn save(&self, facts: &RawFacts) -> Result<()> {
        let source_json = serde_json::to_string(&facts.episode)?;
        let nodes_json = serde_json::to_string(&facts.entities)?;
        let edges_json = serde_json::to_string(&facts.edges)?;
        let facts = facts.clone();
        self.db
            .with_connection(move |conn| {
                conn.execute(
                    "INSERT INTO raw_facts (source_id, group_id, source_json, nodes_json, edges_json, created_at, promoted_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(source_id) DO UPDATE SET
                        group_id = excluded.group_id,
                        source_json = excluded.source_json,
                        nodes_json = excluded.nodes_json,
                        edges_json = excluded.edges_json,
                        created_at = excluded.created_at,
                        promoted_at = excluded.promoted_at",
                    params![
                        facts.source_id,
                        facts.group_id,
                        source_json,
                        nodes_json,
                        edges_json,
                        format_timestamp(&facts.created_at),
                        facts.promoted_at.as_ref().map(format_timestamp),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn get(&self, source_id: &str) -> Result<Option<RawFacts>> {
        let source_id = source_id.to_string();
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT source_id, group_id, source_json, nodes_json, edges_json, created_at, promoted_at
                     FROM raw_facts WHERE source_id = ?1",
                )?;
                let mut rows = stmt.query(params![source_id])?;
                let Some(row) = rows.next()? else {
                    return Ok(None);
                };

                let source_json: String = row.get(2)?;
                let nodes_json: String = row.get(3)?;
                let edges_json: String = row.get(4)?;
                let created_at: String = row.get(5)?;
                let promoted_at: Option<String> = row.get(6)?;
                let bad_ts = |s: &str| TempographError::Parse(format!("invalid timestamp '{}'", s));

                Ok(Some(RawFacts {
                    source_id: row.get(0)?,
                    group_id: row.get(1)?,
                    episode: serde_json::from_str(&source_json)?,
                    entities: serde_json::from_str(&nodes_json)?,
                    edges: serde_json::from_str(&edges_json)?,
                    created_at: parse_timestamp(&created_at).ok_or_else(|| bad_ts(&created_at))?,
                    promoted_at: match promoted_at {
                        Some(s) => Some(parse_timestamp(&s).ok_or_else(|| bad_ts(&s))?),
                        None => None,
                    },
                }))
            })
            .await
    }

    async fn list_pending(&self, group_id: &str) -> Result<Vec<String>> {
        let group_id = group_id.to_string();
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT source_id FROM raw_facts
                     WHERE group_id = ?1 AND promoted_at IS NULL
                     ORDER BY created_at, source_id",
                )?;
                let ids = stmt
                    .query_map(params![group_id], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
                Ok(ids)
            })
            .await
    }

    async fn mark_promoted(&self, source_id: &str, at: DateTime<Utc>) -> Result<()> {
        let source_id = source_id.to_string();
        self.db
            .with_connection(move |conn| {
                let changed = conn.execute(
                    "UPDATE raw_facts SET promoted_at = ?2 WHERE source_id = ?1",
                    params![source_id, format_timestamp(&at)],
                )?;
                if changed == 0 {
                    return Err(TempographError::EpisodeNotFound(source_id));
                }
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EpisodeInput;
    use chrono::TimeZone;
    use std::path::Path;
    use tempfile::TempDir;

    async fn setup_store() -> (SqliteRawFactStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Db::new(temp_dir.path().join("test.db"));
        db.migrate(&Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations"))
            .await
            .unwrap();
        (SqliteRawFactStore::new(db), temp_dir)
    }

    fn facts(source_id: &str) -> RawFacts {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap();
        let episode = EpisodeInput::new(source_id, "Alice joined Acme.", "g1", now).into_node(now);
        let alice = EntityNode::new("Alice", "Person", "g1", now);
        let acme = EntityNode::new("Acme", "Organization", "g1", now);
        let edge = Edge::relates_to("g1", alice.uuid, acme.uuid, "WORKS_AT", "Alice works at Acme", now);
        RawFacts {
            source_id: source_id.to_string(),
            group_id: "g1".to_string(),
            episode,
            entities: vec![vec![alice, acme]],
            edges: vec![edge],
            created_at: now,
            promoted_at: None,
        }
    }

    #[tokio::test]
    async fn test_save_get_and_promote() {
        let (store, _tmp) = setup_store().await;
        let saved = facts("doc-1");
        store.save(&saved).await.unwrap();
        store.save(&facts("doc-2")).await.unwrap();

        let loaded = store.get("doc-1").await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(loaded.entity_count(), 2);
        assert_eq!(store.list_pending("g1").await.unwrap().len(), 2);

        store.mark_promoted("doc-1", Utc::now()).await.unwrap();
        assert_eq!(store.list_pending("g1").await.unwrap(), vec!["doc-2".to_string()]);
        assert!(store.get("doc-1").await.unwrap().unwrap().promoted_at.is_some());
    }

    #[tokio::test]
    async fn test_missing_source() {
        let (store, _tmp) = setup_store().await;
        assert!(store.get("nope").await.unwrap().is_none());
        assert!(matches!(
            store.mark_promoted("nope", Utc::now()).await,
            Err(TempographError::EpisodeNotFound(_))
        ));
    }
}
