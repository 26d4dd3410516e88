use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use uuid::Uuid;

use super::{BulkReport, GraphStats, GraphStore, RecordFailure, TemporalFilter, Traversal};
use crate::db::Db;
use crate::embeddings::{blob_to_embedding, cosine_similarity, embedding_to_blob};
use crate::error::{Result, TempographError};
use crate::models::{format_timestamp, parse_timestamp, Edge, EdgeKind, EntityNode, EpisodicNode, Node, NodeLabel};
use crate::search::keyword::{normalize_bm25_score, sanitize_fts5_query};

const EDGE_COLUMNS: &str = "e.uuid, e.group_id, e.kind, e.source_node_uuid, e.target_node_uuid, e.name, \
     e.fact, e.fact_embedding, e.episodes_json, e.attributes_json, e.created_at, e.valid_at, \
     e.invalid_at, e.expired_at";

/// Graph store on an embedded SQLite database
#[derive(Debug, Clone)]
pub struct SqliteGraphStore {
    db: Db,
}

impl SqliteGraphStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Open the database at `path` and bring its schema up to date
    pub async fn open(path: &Path, migrations_dir: &Path) -> Result<Self> {
        let db = Db::new(path);
        db.migrate(migrations_dir).await?;
        Ok(Self::new(db))
    }

    pub fn db(&self) -> &Db {
        &self.db
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| TempographError::Parse(format!("invalid uuid '{}': {}", s, e)))
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(s).ok_or_else(|| TempographError::Parse(format!("invalid timestamp '{}'", s)))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn opt_ts(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.as_ref().map(format_timestamp)
}

/// Reads `payload_json, embedding` starting at column `offset`.
fn node_from_row(row: &Row<'_>, offset: usize) -> Result<Node> {
    let payload: String = row.get(offset)?;
    let blob: Option<Vec<u8>> = row.get(offset + 1)?;
    let mut node: Node = serde_json::from_str(&payload)?;
    node.set_embedding(blob.as_deref().and_then(blob_to_embedding));
    Ok(node)
}

/// Reads the `EDGE_COLUMNS` projection.
fn edge_from_row(row: &Row<'_>) -> Result<Edge> {
    let uuid: String = row.get(0)?;
    let kind: String = row.get(2)?;
    let source: String = row.get(3)?;
    let target: String = row.get(4)?;
    let blob: Option<Vec<u8>> = row.get(7)?;
    let episodes: String = row.get(8)?;
    let attributes: String = row.get(9)?;
    let created_at: String = row.get(10)?;

    Ok(Edge {
        uuid: parse_uuid(&uuid)?,
        group_id: row.get(1)?,
        kind: EdgeKind::parse(&kind)
            .ok_or_else(|| TempographError::Parse(format!("unknown edge kind '{}'", kind)))?,
        source_node_uuid: parse_uuid(&source)?,
        target_node_uuid: parse_uuid(&target)?,
        name: row.get(5)?,
        fact: row.get(6)?,
        fact_embedding: blob.as_deref().and_then(blob_to_embedding),
        episodes: serde_json::from_str(&episodes)?,
        attributes: serde_json::from_str(&attributes)?,
        created_at: parse_ts(&created_at)?,
        valid_at: parse_opt_ts(row.get(11)?)?,
        invalid_at: parse_opt_ts(row.get(12)?)?,
        expired_at: parse_opt_ts(row.get(13)?)?,
    })
}

fn query_nodes<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Node>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(node_from_row(row, 0)?);
    }
    Ok(out)
}

fn query_edges<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Edge>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(edge_from_row(row)?);
    }
    Ok(out)
}

/// SQL predicate over `e.` columns: ?{first} is include_invalidated, ?{first+1} is as_of.
fn temporal_clause(first: usize) -> String {
    format!(
        "((?{b} IS NOT NULL AND (e.valid_at IS NULL OR e.valid_at <= ?{b}) \
           AND (e.invalid_at IS NULL OR e.invalid_at > ?{b})) \
          OR (?{b} IS NULL AND (?{a} = 1 OR e.invalid_at IS NULL)))",
        a = first,
        b = first + 1
    )
}

fn write_node(conn: &Connection, node: &Node) -> Result<()> {
    let mut stored = node.clone();
    let embedding = stored.take_embedding();
    let payload = serde_json::to_string(&stored)?;

    let changed = conn.execute(
        "INSERT INTO nodes (uuid, group_id, label, name, summary, entity_type, content, embedding,
                            payload_json, created_at, updated_at, valid_from)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(uuid) DO UPDATE SET
            label = excluded.label,
            name = excluded.name,
            summary = excluded.summary,
            entity_type = excluded.entity_type,
            content = excluded.content,
            embedding = excluded.embedding,
            payload_json = excluded.payload_json,
            updated_at = excluded.updated_at,
            valid_from = excluded.valid_from
         WHERE nodes.group_id = excluded.group_id",
        params![
            node.uuid().to_string(),
            node.group_id(),
            node.label().as_str(),
            node.name(),
            node.summary(),
            node.entity_type(),
            node.content(),
            embedding.as_deref().map(embedding_to_blob),
            payload,
            format_timestamp(&node.created_at()),
            format_timestamp(&node.updated_at()),
            format_timestamp(&node.valid_from()),
        ],
    )?;

    if changed == 0 {
        return Err(TempographError::Validation(format!(
            "node {} already exists in another group",
            node.uuid()
        )));
    }
    Ok(())
}

fn write_edge(conn: &Connection, edge: &Edge) -> Result<()> {
    let changed = conn.execute(
        "INSERT INTO edges (uuid, group_id, kind, source_node_uuid, target_node_uuid, name, relation_class,
                            fact, fact_embedding, episodes_json, attributes_json, created_at,
                            valid_at, invalid_at, expired_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(uuid) DO UPDATE SET
            kind = excluded.kind,
            source_node_uuid = excluded.source_node_uuid,
            target_node_uuid = excluded.target_node_uuid,
            name = excluded.name,
            relation_class = excluded.relation_class,
            fact = excluded.fact,
            fact_embedding = excluded.fact_embedding,
            episodes_json = excluded.episodes_json,
            attributes_json = excluded.attributes_json,
            valid_at = excluded.valid_at,
            invalid_at = excluded.invalid_at,
            expired_at = excluded.expired_at
         WHERE edges.group_id = excluded.group_id",
        params![
            edge.uuid.to_string(),
            edge.group_id,
            edge.kind.as_str(),
            edge.source_node_uuid.to_string(),
            edge.target_node_uuid.to_string(),
            edge.name,
            edge.relation_class(),
            edge.fact,
            edge.fact_embedding.as_deref().map(embedding_to_blob),
            serde_json::to_string(&edge.episodes)?,
            serde_json::to_string(&edge.attributes)?,
            format_timestamp(&edge.created_at),
            opt_ts(edge.valid_at),
            opt_ts(edge.invalid_at),
            opt_ts(edge.expired_at),
        ],
    )?;

    if changed == 0 {
        return Err(TempographError::Validation(format!(
            "edge {} already exists in another group",
            edge.uuid
        )));
    }
    Ok(())
}

/// Rank by similarity descending, ties by UUID, and keep `limit`.
fn top_by_score<T>(mut scored: Vec<(T, f32, Uuid)>, limit: usize) -> Vec<(T, f32)> {
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.2.cmp(&b.2))
    });
    scored.into_iter().take(limit).map(|(item, score, _)| (item, score)).collect()
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn upsert_node(&self, node: &Node) -> Result<()> {
        let node = node.clone();
        self.db.with_connection(move |conn| write_node(conn, &node)).await
    }

    async fn upsert_nodes(&self, nodes: &[Node]) -> Result<BulkReport> {
        if nodes.is_empty() {
            return Ok(BulkReport::default());
        }
        let nodes = nodes.to_vec();
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let mut report = BulkReport::default();
                for node in &nodes {
                    match write_node(&tx, node) {
                        Ok(()) => report.succeeded += 1,
                        Err(e) => {
                            log::warn!("Failed to persist node {}: {}", node.uuid(), e);
                            report.failures.push(RecordFailure { uuid: node.uuid(), error: e.to_string() });
                        }
                    }
                }
                tx.commit()?;
                Ok(report)
            })
            .await
    }

    async fn get_node(&self, uuid: Uuid) -> Result<Option<Node>> {
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare("SELECT payload_json, embedding FROM nodes WHERE uuid = ?1")?;
                let mut rows = stmt.query(params![uuid.to_string()])?;
                match rows.next()? {
                    Some(row) => Ok(Some(node_from_row(row, 0)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    async fn get_nodes(&self, uuids: &[Uuid]) -> Result<Vec<Node>> {
        let uuids = uuids.to_vec();
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare("SELECT payload_json, embedding FROM nodes WHERE uuid = ?1")?;
                let mut out = Vec::new();
                for uuid in uuids {
                    let mut rows = stmt.query(params![uuid.to_string()])?;
                    if let Some(row) = rows.next()? {
                        out.push(node_from_row(row, 0)?);
                    }
                }
                Ok(out)
            })
            .await
    }

    async fn delete_node(&self, uuid: Uuid) -> Result<bool> {
        self.db
            .with_connection(move |conn| {
                let id = uuid.to_string();
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM edges WHERE source_node_uuid = ?1 OR target_node_uuid = ?1",
                    params![id],
                )?;
                let deleted = tx.execute("DELETE FROM nodes WHERE uuid = ?1", params![id])?;
                tx.commit()?;
                Ok(deleted > 0)
            })
            .await
    }

    async fn upsert_edge(&self, edge: &Edge) -> Result<()> {
        let edge = edge.clone();
        self.db.with_connection(move |conn| write_edge(conn, &edge)).await
    }

    async fn upsert_edges(&self, edges: &[Edge]) -> Result<BulkReport> {
        if edges.is_empty() {
            return Ok(BulkReport::default());
        }
        let edges = edges.to_vec();
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let mut report = BulkReport::default();
                for edge in &edges {
                    match write_edge(&tx, edge) {
                        Ok(()) => report.succeeded += 1,
                        Err(e) => {
                            log::warn!("Failed to persist edge {}: {}", edge.uuid, e);
                            report.failures.push(RecordFailure { uuid: edge.uuid, error: e.to_string() });
                        }
                    }
                }
                tx.commit()?;
                Ok(report)
            })
            .await
    }

    async fn get_edge(&self, uuid: Uuid) -> Result<Option<Edge>> {
        let mut edges = self.get_edges(&[uuid]).await?;
        Ok(edges.pop())
    }

    async fn get_edges(&self, uuids: &[Uuid]) -> Result<Vec<Edge>> {
        let uuids = uuids.to_vec();
        self.db
            .with_connection(move |conn| {
                let sql = format!("SELECT {} FROM edges e WHERE e.uuid = ?1", EDGE_COLUMNS);
                let mut stmt = conn.prepare(&sql)?;
                let mut out = Vec::new();
                for uuid in uuids {
                    let mut rows = stmt.query(params![uuid.to_string()])?;
                    if let Some(row) = rows.next()? {
                        out.push(edge_from_row(row)?);
                    }
                }
                Ok(out)
            })
            .await
    }

    async fn delete_edge(&self, uuid: Uuid) -> Result<bool> {
        self.db
            .with_connection(move |conn| {
                let deleted = conn.execute("DELETE FROM edges WHERE uuid = ?1", params![uuid.to_string()])?;
                Ok(deleted > 0)
            })
            .await
    }

    async fn entity_nodes(&self, group_id: &str) -> Result<Vec<EntityNode>> {
        let group_id = group_id.to_string();
        let nodes = self
            .db
            .with_connection(move |conn| {
                query_nodes(
                    conn,
                    "SELECT payload_json, embedding FROM nodes
                     WHERE group_id = ?1 AND label = 'entity' ORDER BY uuid",
                    params![group_id],
                )
            })
            .await?;
        Ok(nodes.into_iter().filter_map(Node::into_entity).collect())
    }

    async fn live_edges_between(&self, source: Uuid, target: Uuid) -> Result<Vec<Edge>> {
        self.db
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT {} FROM edges e
                     WHERE e.kind = 'relates_to' AND e.source_node_uuid = ?1
                       AND e.target_node_uuid = ?2 AND e.invalid_at IS NULL
                     ORDER BY e.created_at, e.uuid",
                    EDGE_COLUMNS
                );
                query_edges(conn, &sql, params![source.to_string(), target.to_string()])
            })
            .await
    }

    async fn edges_of_kind(&self, group_id: &str, kind: EdgeKind, filter: TemporalFilter) -> Result<Vec<Edge>> {
        let group_id = group_id.to_string();
        let edges = self
            .db
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT {} FROM edges e WHERE e.group_id = ?1 AND e.kind = ?2 ORDER BY e.uuid",
                    EDGE_COLUMNS
                );
                query_edges(conn, &sql, params![group_id, kind.as_str()])
            })
            .await?;
        Ok(edges.into_iter().filter(|e| filter.admits(e)).collect())
    }

    async fn edges_for_node(&self, node: Uuid, kind: Option<EdgeKind>) -> Result<Vec<Edge>> {
        self.db
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT {} FROM edges e
                     WHERE (e.source_node_uuid = ?1 OR e.target_node_uuid = ?1)
                       AND (?2 IS NULL OR e.kind = ?2)
                     ORDER BY e.uuid",
                    EDGE_COLUMNS
                );
                query_edges(conn, &sql, params![node.to_string(), kind.map(|k| k.as_str())])
            })
            .await
    }

    async fn edges_with_episode(&self, group_id: &str, episode: Uuid) -> Result<Vec<Edge>> {
        let group_id = group_id.to_string();
        self.db
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT {} FROM edges e
                     WHERE e.group_id = ?1
                       AND EXISTS (SELECT 1 FROM json_each(e.episodes_json) WHERE value = ?2)
                     ORDER BY e.uuid",
                    EDGE_COLUMNS
                );
                query_edges(conn, &sql, params![group_id, episode.to_string()])
            })
            .await
    }

    async fn entities_with_episode(&self, group_id: &str, episode: Uuid) -> Result<Vec<EntityNode>> {
        let group_id = group_id.to_string();
        let nodes = self
            .db
            .with_connection(move |conn| {
                query_nodes(
                    conn,
                    "SELECT n.payload_json, n.embedding FROM nodes n
                     WHERE n.group_id = ?1 AND n.label = 'entity'
                       AND EXISTS (SELECT 1 FROM json_each(n.payload_json, '$.episodes') WHERE value = ?2)
                     ORDER BY n.uuid",
                    params![group_id, episode.to_string()],
                )
            })
            .await?;
        Ok(nodes.into_iter().filter_map(Node::into_entity).collect())
    }

    async fn recent_episodes(&self, group_id: &str, before: DateTime<Utc>, limit: usize) -> Result<Vec<EpisodicNode>> {
        let group_id = group_id.to_string();
        let nodes = self
            .db
            .with_connection(move |conn| {
                query_nodes(
                    conn,
                    "SELECT payload_json, embedding FROM nodes
                     WHERE group_id = ?1 AND label = 'episodic' AND valid_from <= ?2
                     ORDER BY valid_from DESC, uuid
                     LIMIT ?3",
                    params![group_id, format_timestamp(&before), limit as i64],
                )
            })
            .await?;
        Ok(nodes.into_iter().filter_map(Node::into_episode).collect())
    }

    async fn edges_in_range(&self, group_id: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Edge>> {
        let group_id = group_id.to_string();
        self.db
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT {} FROM edges e
                     WHERE e.group_id = ?1 AND e.kind = 'relates_to'
                       AND e.valid_at >= ?2 AND e.valid_at < ?3
                     ORDER BY e.valid_at, e.uuid",
                    EDGE_COLUMNS
                );
                query_edges(conn, &sql, params![group_id, format_timestamp(&from), format_timestamp(&to)])
            })
            .await
    }

    async fn vector_search_nodes(
        &self,
        group_id: &str,
        label: NodeLabel,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(Node, f32)>> {
        let start = std::time::Instant::now();
        let group_id = group_id.to_string();
        let nodes = self
            .db
            .with_connection(move |conn| {
                query_nodes(
                    conn,
                    "SELECT payload_json, embedding FROM nodes
                     WHERE group_id = ?1 AND label = ?2 AND embedding IS NOT NULL",
                    params![group_id, label.as_str()],
                )
            })
            .await?;

        let scored: Vec<(Node, f32, Uuid)> = nodes
            .into_iter()
            .filter_map(|node| {
                let score = cosine_similarity(query, node.embedding()?);
                let uuid = node.uuid();
                Some((node, score, uuid))
            })
            .collect();
        let results = top_by_score(scored, limit);
        log::debug!("Vector node search ({}) took {:?}, {} results", label.as_str(), start.elapsed(), results.len());
        Ok(results)
    }

    async fn vector_search_edges(
        &self,
        group_id: &str,
        query: &[f32],
        filter: TemporalFilter,
        limit: usize,
    ) -> Result<Vec<(Edge, f32)>> {
        let start = std::time::Instant::now();
        let group_id = group_id.to_string();
        let edges = self
            .db
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT {} FROM edges e
                     WHERE e.group_id = ?1 AND e.kind = 'relates_to' AND e.fact_embedding IS NOT NULL
                       AND {}",
                    EDGE_COLUMNS,
                    temporal_clause(2)
                );
                query_edges(
                    conn,
                    &sql,
                    params![group_id, filter.include_invalidated, opt_ts(filter.as_of)],
                )
            })
            .await?;

        let scored: Vec<(Edge, f32, Uuid)> = edges
            .into_iter()
            .filter_map(|edge| {
                let score = cosine_similarity(query, edge.fact_embedding.as_deref()?);
                let uuid = edge.uuid;
                Some((edge, score, uuid))
            })
            .collect();
        let results = top_by_score(scored, limit);
        log::debug!("Vector edge search took {:?}, {} results", start.elapsed(), results.len());
        Ok(results)
    }

    async fn keyword_search_nodes(
        &self,
        group_id: &str,
        label: NodeLabel,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(Node, f32)>> {
        let sanitized = sanitize_fts5_query(query);
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }
        let group_id = group_id.to_string();
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT n.payload_json, n.embedding, bm25(nodes_fts) AS raw_score
                     FROM nodes_fts
                     JOIN nodes n ON nodes_fts.uuid = n.uuid
                     WHERE nodes_fts MATCH ?1 AND n.group_id = ?2 AND n.label = ?3
                     ORDER BY raw_score, n.uuid
                     LIMIT ?4",
                )?;
                let mut rows = stmt.query(params![sanitized, group_id, label.as_str(), limit as i64])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let node = node_from_row(row, 0)?;
                    let raw: f64 = row.get(2)?;
                    out.push((node, normalize_bm25_score(raw)));
                }
                Ok(out)
            })
            .await
    }

    async fn keyword_search_edges(
        &self,
        group_id: &str,
        query: &str,
        filter: TemporalFilter,
        limit: usize,
    ) -> Result<Vec<(Edge, f32)>> {
        let sanitized = sanitize_fts5_query(query);
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }
        let group_id = group_id.to_string();
        self.db
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT {}, bm25(edges_fts) AS raw_score
                     FROM edges_fts
                     JOIN edges e ON edges_fts.uuid = e.uuid
                     WHERE edges_fts MATCH ?1 AND e.group_id = ?2 AND e.kind = 'relates_to'
                       AND {}
                     ORDER BY raw_score, e.uuid
                     LIMIT ?5",
                    EDGE_COLUMNS,
                    temporal_clause(3)
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![
                    sanitized,
                    group_id,
                    filter.include_invalidated,
                    opt_ts(filter.as_of),
                    limit as i64
                ])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let edge = edge_from_row(row)?;
                    let raw: f64 = row.get(14)?;
                    out.push((edge, normalize_bm25_score(raw)));
                }
                Ok(out)
            })
            .await
    }

    async fn traverse(
        &self,
        group_id: &str,
        origins: &[Uuid],
        max_depth: usize,
        filter: TemporalFilter,
    ) -> Result<Traversal> {
        let group_id = group_id.to_string();
        let origins = origins.to_vec();
        self.db
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT {} FROM edges e
                     WHERE e.group_id = ?1 AND e.kind IN ('relates_to', 'mentions')
                       AND (e.source_node_uuid = ?2 OR e.target_node_uuid = ?2)
                     ORDER BY e.uuid",
                    EDGE_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;

                let mut traversal = Traversal::default();
                let mut visited: HashSet<Uuid> = HashSet::new();
                let mut seen_edges: HashSet<Uuid> = HashSet::new();
                let mut frontier = Vec::new();
                for origin in origins {
                    if visited.insert(origin) {
                        traversal.nodes.push((origin, 0));
                        frontier.push(origin);
                    }
                }

                for depth in 1..=max_depth {
                    let mut next = Vec::new();
                    for node in &frontier {
                        let mut rows = stmt.query(params![group_id, node.to_string()])?;
                        while let Some(row) = rows.next()? {
                            let edge = edge_from_row(row)?;
                            if edge.kind == EdgeKind::RelatesTo && !filter.admits(&edge) {
                                continue;
                            }
                            let Some(other) = edge.other_end(*node) else { continue };
                            if seen_edges.insert(edge.uuid) {
                                traversal.edges.push((edge, depth));
                            }
                            if visited.insert(other) {
                                traversal.nodes.push((other, depth));
                                next.push(other);
                            }
                        }
                    }
                    if next.is_empty() {
                        break;
                    }
                    frontier = next;
                }
                Ok(traversal)
            })
            .await
    }

    async fn mention_counts(&self, entities: &[Uuid]) -> Result<HashMap<Uuid, usize>> {
        let entities = entities.to_vec();
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT COUNT(DISTINCT source_node_uuid) FROM edges
                     WHERE kind = 'mentions' AND target_node_uuid = ?1",
                )?;
                let mut counts = HashMap::new();
                for uuid in entities {
                    let count: i64 = stmt.query_row(params![uuid.to_string()], |row| row.get(0))?;
                    counts.insert(uuid, count as usize);
                }
                Ok(counts)
            })
            .await
    }

    async fn community_memberships(&self, group_id: &str) -> Result<HashMap<Uuid, Uuid>> {
        let group_id = group_id.to_string();
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT target_node_uuid, source_node_uuid FROM edges
                     WHERE group_id = ?1 AND kind = 'has_member'
                     ORDER BY created_at, uuid",
                )?;
                let mut rows = stmt.query(params![group_id])?;
                let mut out = HashMap::new();
                while let Some(row) = rows.next()? {
                    let entity: String = row.get(0)?;
                    let community: String = row.get(1)?;
                    out.insert(parse_uuid(&entity)?, parse_uuid(&community)?);
                }
                Ok(out)
            })
            .await
    }

    async fn community_members(&self, community: Uuid) -> Result<Vec<Uuid>> {
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT target_node_uuid FROM edges
                     WHERE kind = 'has_member' AND source_node_uuid = ?1
                     ORDER BY target_node_uuid",
                )?;
                let mut rows = stmt.query(params![community.to_string()])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let member: String = row.get(0)?;
                    out.push(parse_uuid(&member)?);
                }
                Ok(out)
            })
            .await
    }

    async fn delete_communities(&self, group_id: &str) -> Result<usize> {
        let group_id = group_id.to_string();
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM edges WHERE group_id = ?1 AND kind = 'has_member'",
                    params![group_id],
                )?;
                let deleted = tx.execute(
                    "DELETE FROM nodes WHERE group_id = ?1 AND label = 'community'",
                    params![group_id],
                )?;
                tx.commit()?;
                Ok(deleted)
            })
            .await
    }

    async fn stats(&self, group_id: Option<&str>) -> Result<GraphStats> {
        let group_id = group_id.map(str::to_string);
        self.db
            .with_connection(move |conn| {
                let count_nodes = |label: &str| -> Result<usize> {
                    let n: i64 = conn.query_row(
                        "SELECT COUNT(*) FROM nodes WHERE label = ?1 AND (?2 IS NULL OR group_id = ?2)",
                        params![label, group_id],
                        |row| row.get(0),
                    )?;
                    Ok(n as usize)
                };
                let count_edges = |kind: &str, live: Option<bool>| -> Result<usize> {
                    let n: i64 = conn.query_row(
                        "SELECT COUNT(*) FROM edges WHERE kind = ?1 AND (?2 IS NULL OR group_id = ?2)
                           AND (?3 IS NULL OR (?3 = 1) = (invalid_at IS NULL))",
                        params![kind, group_id, live],
                        |row| row.get(0),
                    )?;
                    Ok(n as usize)
                };

                Ok(GraphStats {
                    entities: count_nodes("entity")?,
                    episodes: count_nodes("episodic")?,
                    communities: count_nodes("community")?,
                    sources: count_nodes("source")?,
                    live_facts: count_edges("relates_to", Some(true))?,
                    invalidated_facts: count_edges("relates_to", Some(false))?,
                    mentions: count_edges("mentions", None)?,
                    memberships: count_edges("has_member", None)?,
                })
            })
            .await
    }

    async fn clear(&self, group_id: Option<&str>) -> Result<()> {
        let group_id = group_id.map(str::to_string);
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let edges = tx.execute("DELETE FROM edges WHERE ?1 IS NULL OR group_id = ?1", params![group_id])?;
                let nodes = tx.execute("DELETE FROM nodes WHERE ?1 IS NULL OR group_id = ?1", params![group_id])?;
                tx.commit()?;
                log::info!("Cleared {} nodes and {} edges", nodes, edges);
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CommunityNode, EpisodeInput};
    use chrono::TimeZone;
    use tempfile::TempDir;

    async fn setup_store() -> (SqliteGraphStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let migrations_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
        let store = SqliteGraphStore::open(&temp_dir.path().join("test.db"), &migrations_dir)
            .await
            .unwrap();
        (store, temp_dir)
    }

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn entity(name: &str, embedding: Option<Vec<f32>>) -> EntityNode {
        let mut node = EntityNode::new(name, "Person", "g1", t(1));
        node.embedding = embedding;
        node
    }

    fn fact(source: &EntityNode, target: &EntityNode, name: &str, text: &str, valid: DateTime<Utc>) -> Edge {
        let mut edge = Edge::relates_to("g1", source.uuid, target.uuid, name, text, t(1));
        edge.valid_at = Some(valid);
        edge
    }

    #[tokio::test]
    async fn test_node_roundtrip_with_embedding() {
        let (store, _tmp) = setup_store().await;
        let mut alice = entity("Alice", Some(vec![0.5, -0.25, 1.0]));
        alice.attributes.insert("role".into(), "engineer".into());
        store.upsert_node(&alice.clone().into()).await.unwrap();

        let loaded = store.get_node(alice.uuid).await.unwrap().unwrap();
        assert_eq!(loaded, Node::Entity(alice.clone()));
        assert!(store.get_node(Uuid::new_v4()).await.unwrap().is_none());

        let entities = store.entity_nodes("g1").await.unwrap();
        assert_eq!(entities.len(), 1);
        assert!(store.entity_nodes("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_updates_fulltext() {
        let (store, _tmp) = setup_store().await;
        let mut node = entity("Gadget", None);
        store.upsert_node(&node.clone().into()).await.unwrap();
        node.summary = "A quantum widget".to_string();
        store.upsert_node(&node.clone().into()).await.unwrap();

        let hits = store.keyword_search_nodes("g1", NodeLabel::Entity, "quantum", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.uuid(), node.uuid);
        assert!(hits[0].1 > 0.0 && hits[0].1 <= 1.0);
    }

    #[tokio::test]
    async fn test_bulk_upsert_reports_cross_group_conflict() {
        let (store, _tmp) = setup_store().await;
        let alice = entity("Alice", None);
        store.upsert_node(&alice.clone().into()).await.unwrap();

        let mut hijack = alice.clone();
        hijack.group_id = "g2".to_string();
        let bob = entity("Bob", None);

        let report = store
            .upsert_nodes(&[hijack.into(), bob.clone().into()])
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].uuid, alice.uuid);
        assert!(store.get_node(bob.uuid).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_live_edges_between_is_ordered_pair() {
        let (store, _tmp) = setup_store().await;
        let (a, b) = (entity("A", None), entity("B", None));
        let mut closed = fact(&a, &b, "LEADS", "A leads B", t(1));
        closed.invalidate(t(2), t(2));
        let live = fact(&a, &b, "LEADS", "A leads B again", t(3));
        store.upsert_edges(&[closed, live.clone()]).await.unwrap();

        let found = store.live_edges_between(a.uuid, b.uuid).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].uuid, live.uuid);
        assert!(store.live_edges_between(b.uuid, a.uuid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vector_search_respects_temporal_filter() {
        let (store, _tmp) = setup_store().await;
        let (a, b) = (entity("A", None), entity("B", None));
        let mut old = fact(&a, &b, "LEADS", "A led B", t(1));
        old.fact_embedding = Some(vec![1.0, 0.0]);
        old.invalidate(t(10), t(10));
        let mut new = fact(&a, &b, "ADVISES", "A advises B", t(10));
        new.fact_embedding = Some(vec![0.8, 0.6]);
        store.upsert_edges(&[old.clone(), new.clone()]).await.unwrap();

        let live = store.vector_search_edges("g1", &[1.0, 0.0], TemporalFilter::live(), 10).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].0.uuid, new.uuid);

        let all = store
            .vector_search_edges("g1", &[1.0, 0.0], TemporalFilter { include_invalidated: true, as_of: None }, 10)
            .await
            .unwrap();
        assert_eq!(all[0].0.uuid, old.uuid);
        assert!(all[0].1 > all[1].1);

        let past = store
            .vector_search_edges("g1", &[1.0, 0.0], TemporalFilter { include_invalidated: false, as_of: Some(t(5)) }, 10)
            .await
            .unwrap();
        assert_eq!(past.len(), 1);
        assert_eq!(past[0].0.uuid, old.uuid);
    }

    #[tokio::test]
    async fn test_keyword_search_edges() {
        let (store, _tmp) = setup_store().await;
        let (a, b) = (entity("Alice", None), entity("Billing API", None));
        let edge = fact(&a, &b, "OWNS", "Alice owns the billing service", t(1));
        store.upsert_edge(&edge).await.unwrap();

        let hits = store
            .keyword_search_edges("g1", "who owns billing?", TemporalFilter::live(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(store.keyword_search_edges("g1", "", TemporalFilter::live(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_traverse_depth_and_cycles() {
        let (store, _tmp) = setup_store().await;
        let (a, b, c, d) = (entity("A", None), entity("B", None), entity("C", None), entity("D", None));
        store
            .upsert_edges(&[
                fact(&a, &b, "KNOWS", "a-b", t(1)),
                fact(&b, &c, "KNOWS", "b-c", t(1)),
                fact(&c, &a, "KNOWS", "c-a", t(1)),
                fact(&c, &d, "KNOWS", "c-d", t(1)),
            ])
            .await
            .unwrap();

        let one = store.traverse("g1", &[a.uuid], 1, TemporalFilter::live()).await.unwrap();
        let reached: HashSet<Uuid> = one.nodes.iter().map(|(u, _)| *u).collect();
        assert_eq!(reached, HashSet::from([a.uuid, b.uuid, c.uuid]));

        let two = store.traverse("g1", &[a.uuid], 2, TemporalFilter::live()).await.unwrap();
        assert!(two.nodes.contains(&(d.uuid, 2)));
        assert_eq!(two.nodes.len(), 4);

        let zero = store.traverse("g1", &[a.uuid], 0, TemporalFilter::live()).await.unwrap();
        assert_eq!(zero.nodes, vec![(a.uuid, 0)]);
        assert!(zero.edges.is_empty());
    }

    #[tokio::test]
    async fn test_delete_node_cascades_edges() {
        let (store, _tmp) = setup_store().await;
        let (a, b) = (entity("A", None), entity("B", None));
        store.upsert_nodes(&[a.clone().into(), b.clone().into()]).await.unwrap();
        let edge = fact(&a, &b, "KNOWS", "a knows b", t(1));
        store.upsert_edge(&edge).await.unwrap();

        assert!(store.delete_node(a.uuid).await.unwrap());
        assert!(store.get_edge(edge.uuid).await.unwrap().is_none());
        assert!(!store.delete_node(a.uuid).await.unwrap());
    }

    #[tokio::test]
    async fn test_recent_episodes_and_provenance_queries() {
        let (store, _tmp) = setup_store().await;
        let mut episodes = Vec::new();
        for day in 1..=5 {
            let ep = EpisodeInput::new(format!("ep{}", day), "text", "g1", t(day)).into_node(t(day));
            store.upsert_node(&ep.clone().into()).await.unwrap();
            episodes.push(ep);
        }

        let recent = store.recent_episodes("g1", t(4), 2).await.unwrap();
        let names: Vec<_> = recent.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["ep4", "ep3"]);

        let mut alice = entity("Alice", None);
        alice.add_episode(episodes[0].uuid);
        store.upsert_node(&alice.clone().into()).await.unwrap();
        let bob = entity("Bob", None);
        let mut edge = fact(&alice, &bob, "KNOWS", "Alice knows Bob", t(1));
        edge.add_episode(episodes[0].uuid);
        store.upsert_edge(&edge).await.unwrap();

        let with_ep = store.entities_with_episode("g1", episodes[0].uuid).await.unwrap();
        assert_eq!(with_ep.len(), 1);
        assert_eq!(with_ep[0].uuid, alice.uuid);
        assert_eq!(store.edges_with_episode("g1", episodes[0].uuid).await.unwrap().len(), 1);
        assert!(store.edges_with_episode("g1", episodes[1].uuid).await.unwrap().is_empty());

        let range = store.edges_in_range("g1", t(1), t(2)).await.unwrap();
        assert_eq!(range.len(), 1);
    }

    #[tokio::test]
    async fn test_communities_mentions_and_stats() {
        let (store, _tmp) = setup_store().await;
        let (a, b) = (entity("A", None), entity("B", None));
        let ep = EpisodeInput::new("ep", "A and B", "g1", t(1)).into_node(t(1));
        let community = CommunityNode {
            uuid: Uuid::new_v4(),
            name: "Team".into(),
            group_id: "g1".into(),
            summary: String::new(),
            embedding: None,
            created_at: t(1),
            updated_at: t(1),
            valid_from: t(1),
            member_count: 2,
        };
        store
            .upsert_nodes(&[a.clone().into(), b.clone().into(), ep.clone().into(), community.clone().into()])
            .await
            .unwrap();
        store
            .upsert_edges(&[
                Edge::mentions("g1", ep.uuid, a.uuid, t(1), t(1)),
                Edge::has_member("g1", community.uuid, a.uuid, t(1)),
                Edge::has_member("g1", community.uuid, b.uuid, t(1)),
                fact(&a, &b, "KNOWS", "a knows b", t(1)),
            ])
            .await
            .unwrap();

        let counts = store.mention_counts(&[a.uuid, b.uuid]).await.unwrap();
        assert_eq!(counts[&a.uuid], 1);
        assert_eq!(counts[&b.uuid], 0);

        let memberships = store.community_memberships("g1").await.unwrap();
        assert_eq!(memberships.get(&b.uuid), Some(&community.uuid));
        assert_eq!(store.community_members(community.uuid).await.unwrap().len(), 2);

        let stats = store.stats(Some("g1")).await.unwrap();
        assert_eq!(stats.entities, 2);
        assert_eq!(stats.episodes, 1);
        assert_eq!(stats.communities, 1);
        assert_eq!(stats.live_facts, 1);
        assert_eq!(stats.mentions, 1);
        assert_eq!(stats.memberships, 2);

        assert_eq!(store.delete_communities("g1").await.unwrap(), 1);
        assert!(store.community_memberships("g1").await.unwrap().is_empty());

        store.clear(Some("g1")).await.unwrap();
        assert_eq!(store.stats(None).await.unwrap(), GraphStats::default());
    }
}
