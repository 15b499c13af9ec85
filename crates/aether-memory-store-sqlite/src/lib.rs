#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeSet;
use std::path::Path;

use aether_domain::{format_rfc3339, now_utc, parse_rfc3339_utc, EdgeKind, Modality, NodeId};
use aether_memory_core::{
    Edge, GraphCounters, GraphSnapshot, GraphStore, MemoryGraphConfig, MemoryNode,
};
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

const GRAPH_MIGRATION_VERSION: i64 = 1;

const SCHEMA_GRAPH_V1: &str = r"
CREATE TABLE IF NOT EXISTS graph_meta (
  singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
  format_version INTEGER NOT NULL,
  next_id INTEGER NOT NULL CHECK (next_id >= 0),
  total_added INTEGER NOT NULL CHECK (total_added >= 0),
  total_evicted INTEGER NOT NULL CHECK (total_evicted >= 0),
  embedding_dim INTEGER CHECK (embedding_dim >= 1 OR embedding_dim IS NULL),
  config_json TEXT NOT NULL,
  saved_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS memory_nodes (
  node_id INTEGER PRIMARY KEY CHECK (node_id >= 0),
  content TEXT NOT NULL,
  embedding BLOB NOT NULL,
  modality TEXT NOT NULL CHECK (
    modality IN ('text', 'image', 'audio', 'video', 'multimodal')
  ),
  metadata_json TEXT NOT NULL DEFAULT '{}',
  emotional_valence REAL NOT NULL CHECK (emotional_valence BETWEEN -1.0 AND 1.0),
  created_at TEXT NOT NULL,
  last_accessed_at TEXT NOT NULL,
  importance_as_of TEXT NOT NULL,
  access_count INTEGER NOT NULL CHECK (access_count >= 0),
  importance REAL NOT NULL CHECK (importance BETWEEN 0.0 AND 1.0)
);

CREATE TABLE IF NOT EXISTS memory_edges (
  source_id INTEGER NOT NULL,
  target_id INTEGER NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('temporal', 'semantic', 'causal')),
  PRIMARY KEY (source_id, target_id, kind),
  FOREIGN KEY (source_id) REFERENCES memory_nodes(node_id) ON DELETE CASCADE,
  FOREIGN KEY (target_id) REFERENCES memory_nodes(node_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_memory_edges_target_kind
  ON memory_edges(target_id, kind);
";

/// `SQLite`-backed snapshot store for the memory graph.
///
/// Every save replaces the previous snapshot inside one transaction.
pub struct SqliteGraphStore {
    conn: Mutex<Connection>,
}

impl SqliteGraphStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens `path` and applies the schema in one step.
    pub fn open_migrated(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_GRAPH_V1)
            .context("failed to apply memory graph schema")?;

        let now = format_rfc3339(now_utc())?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![GRAPH_MIGRATION_VERSION, now],
        )
        .context("failed to register memory graph schema migration")?;

        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .context("failed to read schema version")
    }

    /// Timestamp of the last successful save, if any.
    pub fn saved_at(&self) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT saved_at FROM graph_meta WHERE singleton = 1",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .context("failed to read graph_meta.saved_at")
    }

    pub fn save_snapshot(&self, snapshot: &GraphSnapshot) -> Result<()> {
        let config_json =
            serde_json::to_string(&snapshot.config).context("failed to serialize graph config")?;
        let saved_at = format_rfc3339(now_utc())?;

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .context("failed to start snapshot transaction")?;

        tx.execute_batch("DELETE FROM memory_edges; DELETE FROM memory_nodes;")
            .context("failed to clear previous snapshot")?;

        tx.execute(
            "INSERT INTO graph_meta(
                singleton, format_version, next_id, total_added, total_evicted,
                embedding_dim, config_json, saved_at
             ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(singleton) DO UPDATE SET
               format_version = excluded.format_version,
               next_id = excluded.next_id,
               total_added = excluded.total_added,
               total_evicted = excluded.total_evicted,
               embedding_dim = excluded.embedding_dim,
               config_json = excluded.config_json,
               saved_at = excluded.saved_at",
            params![
                i64::from(snapshot.format_version),
                to_i64("next_id", snapshot.counters.next_id)?,
                to_i64("total_added", snapshot.counters.total_added)?,
                to_i64("total_evicted", snapshot.counters.total_evicted)?,
                snapshot
                    .embedding_dim
                    .map(|dim| {
                        i64::try_from(dim)
                            .with_context(|| format!("embedding_dim does not fit: {dim}"))
                    })
                    .transpose()?,
                config_json,
                saved_at,
            ],
        )
        .context("failed to write graph_meta")?;

        {
            let mut insert_node = tx
                .prepare(
                    "INSERT INTO memory_nodes(
                        node_id, content, embedding, modality, metadata_json,
                        emotional_valence, created_at, last_accessed_at, importance_as_of,
                        access_count, importance
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )
                .context("failed to prepare node insert")?;

            for node in &snapshot.nodes {
                let metadata_json = serde_json::to_string(&node.metadata)
                    .with_context(|| format!("failed to serialize metadata for {}", node.id))?;
                insert_node
                    .execute(params![
                        to_i64("node_id", node.id.0)?,
                        node.content,
                        encode_embedding(&node.embedding),
                        node.modality.as_str(),
                        metadata_json,
                        node.emotional_valence,
                        format_rfc3339(node.created_at)?,
                        format_rfc3339(node.last_accessed_at)?,
                        format_rfc3339(node.importance_as_of)?,
                        to_i64("access_count", node.access_count)?,
                        node.importance,
                    ])
                    .with_context(|| format!("failed to insert memory node {}", node.id))?;
            }

            let mut insert_edge = tx
                .prepare(
                    "INSERT INTO memory_edges(source_id, target_id, kind) VALUES (?1, ?2, ?3)",
                )
                .context("failed to prepare edge insert")?;

            for node in &snapshot.nodes {
                for edge in &node.edges {
                    insert_edge
                        .execute(params![
                            to_i64("source_id", node.id.0)?,
                            to_i64("target_id", edge.target.0)?,
                            edge.kind.as_str(),
                        ])
                        .with_context(|| {
                            format!(
                                "failed to insert {} edge {} -> {}",
                                edge.kind, node.id, edge.target
                            )
                        })?;
                }
            }
        }

        tx.commit().context("failed to commit snapshot transaction")?;
        tracing::info!(nodes = snapshot.nodes.len(), "memory graph snapshot saved");
        Ok(())
    }

    pub fn load_snapshot(&self) -> Result<Option<GraphSnapshot>> {
        let conn = self.conn.lock();

        let meta = conn
            .query_row(
                "SELECT format_version, next_id, total_added, total_evicted, embedding_dim, config_json
                 FROM graph_meta WHERE singleton = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .context("failed to read graph_meta")?;

        let Some((format_version, next_id, total_added, total_evicted, embedding_dim, config_json)) =
            meta
        else {
            return Ok(None);
        };

        let config_value: Value =
            serde_json::from_str(&config_json).context("invalid stored graph config JSON")?;
        let config = MemoryGraphConfig::from_json(&config_value)
            .map_err(|err| anyhow!("failed to parse stored graph config: {err}"))?;

        let mut stmt = conn
            .prepare(
                "SELECT node_id, content, embedding, modality, metadata_json, emotional_valence,
                        created_at, last_accessed_at, importance_as_of, access_count, importance
                 FROM memory_nodes ORDER BY node_id ASC",
            )
            .context("failed to prepare node query")?;
        let mut nodes = stmt
            .query_map([], parse_node_row)
            .context("failed to query memory nodes")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to decode memory node row")?;

        let mut edge_stmt = conn
            .prepare(
                "SELECT source_id, target_id, kind FROM memory_edges
                 ORDER BY source_id ASC, target_id ASC, kind ASC",
            )
            .context("failed to prepare edge query")?;
        let edges = edge_stmt
            .query_map([], parse_edge_row)
            .context("failed to query memory edges")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to decode memory edge row")?;

        for (source, edge) in edges {
            let node = nodes
                .binary_search_by_key(&source, |node| node.id)
                .ok()
                .and_then(|index| nodes.get_mut(index))
                .ok_or_else(|| anyhow!("edge references missing source node {source}"))?;
            node.edges.insert(edge);
        }

        let snapshot = GraphSnapshot {
            format_version: u32::try_from(format_version)
                .with_context(|| format!("invalid format_version: {format_version}"))?,
            config,
            counters: GraphCounters {
                next_id: from_i64("next_id", next_id)?,
                total_added: from_i64("total_added", total_added)?,
                total_evicted: from_i64("total_evicted", total_evicted)?,
            },
            embedding_dim: embedding_dim
                .map(|dim| {
                    usize::try_from(dim).with_context(|| format!("invalid embedding_dim: {dim}"))
                })
                .transpose()?,
            nodes,
        };

        tracing::debug!(nodes = snapshot.nodes.len(), "memory graph snapshot loaded");
        Ok(Some(snapshot))
    }

    #[cfg(test)]
    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        f(&self.conn.lock())
    }
}

impl GraphStore for SqliteGraphStore {
    fn persist(&self, snapshot: &GraphSnapshot) -> Result<()> {
        self.save_snapshot(snapshot)
    }

    fn load(&self) -> Result<Option<GraphSnapshot>> {
        self.load_snapshot()
    }
}

fn parse_node_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryNode> {
    let node_id: i64 = row.get(0)?;
    let embedding_blob: Vec<u8> = row.get(2)?;
    let modality_raw: String = row.get(3)?;
    let metadata_json: String = row.get(4)?;
    let created_at_raw: String = row.get(6)?;
    let last_accessed_raw: String = row.get(7)?;
    let importance_as_of_raw: String = row.get(8)?;
    let access_count: i64 = row.get(9)?;

    let modality = Modality::parse(&modality_raw)
        .ok_or_else(|| conversion_error(3, rusqlite::types::Type::Text, format!("invalid modality: {modality_raw}")))?;
    let embedding = decode_embedding(&embedding_blob)
        .ok_or_else(|| conversion_error(2, rusqlite::types::Type::Blob, "embedding blob length is not a multiple of 4".to_string()))?;
    let metadata: Value = serde_json::from_str(&metadata_json).map_err(|err| {
        conversion_error(4, rusqlite::types::Type::Text, format!("invalid metadata_json: {err}"))
    })?;

    Ok(MemoryNode {
        id: NodeId(u64::try_from(node_id).map_err(|_| {
            conversion_error(0, rusqlite::types::Type::Integer, format!("invalid node_id: {node_id}"))
        })?),
        content: row.get(1)?,
        embedding,
        modality,
        metadata,
        emotional_valence: row.get(5)?,
        created_at: parse_timestamp_column(6, &created_at_raw)?,
        last_accessed_at: parse_timestamp_column(7, &last_accessed_raw)?,
        importance_as_of: parse_timestamp_column(8, &importance_as_of_raw)?,
        access_count: u64::try_from(access_count).map_err(|_| {
            conversion_error(
                9,
                rusqlite::types::Type::Integer,
                format!("invalid access_count: {access_count}"),
            )
        })?,
        importance: row.get(10)?,
        edges: BTreeSet::new(),
    })
}

fn parse_edge_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(NodeId, Edge)> {
    let source: i64 = row.get(0)?;
    let target: i64 = row.get(1)?;
    let kind_raw: String = row.get(2)?;

    let to_node_id = |index: usize, raw: i64| {
        u64::try_from(raw).map(NodeId).map_err(|_| {
            conversion_error(index, rusqlite::types::Type::Integer, format!("invalid node id: {raw}"))
        })
    };
    let kind = EdgeKind::parse(&kind_raw).ok_or_else(|| {
        conversion_error(2, rusqlite::types::Type::Text, format!("invalid edge kind: {kind_raw}"))
    })?;

    Ok((
        to_node_id(0, source)?,
        Edge {
            target: to_node_id(1, target)?,
            kind,
        },
    ))
}

fn parse_timestamp_column(
    index: usize,
    raw: &str,
) -> rusqlite::Result<aether_domain::DateTimeUtc> {
    parse_rfc3339_utc(raw)
        .map_err(|err| conversion_error(index, rusqlite::types::Type::Text, err.to_string()))
}

fn conversion_error(index: usize, ty: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        ty,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding
        .iter()
        .flat_map(|value| value.to_le_bytes())
        .collect()
}

fn decode_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    let chunks = bytes.chunks_exact(4);
    if !chunks.remainder().is_empty() {
        return None;
    }
    Some(
        chunks
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

fn to_i64(field: &str, value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("{field} does not fit in sqlite INTEGER: {value}"))
}

fn from_i64(field: &str, value: i64) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("invalid {field}: {value}"))
}
