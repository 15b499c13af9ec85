#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use aether_domain::{
    ensure_non_empty, ensure_unit_interval, AetherError, DateTimeUtc, EdgeKind, Modality, NodeId,
};
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::Duration;

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ScoreWeights {
    pub similarity: f64,
    pub importance: f64,
    pub recency: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            similarity: 1.0 / 3.0,
            importance: 1.0 / 3.0,
            recency: 1.0 / 3.0,
        }
    }
}

/// Tunables for the memory graph. Defaults are example values, not a contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryGraphConfig {
    pub capacity: usize,
    pub embedding_dim: Option<usize>,
    pub semantic_threshold: f64,
    pub weights: ScoreWeights,
    pub initial_importance: f64,
    pub access_boost: f64,
    pub decay_half_life_secs: f64,
    pub importance_floor: f64,
    pub recency_half_life_secs: f64,
}

impl Default for MemoryGraphConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            embedding_dim: None,
            semantic_threshold: 0.75,
            weights: ScoreWeights::default(),
            initial_importance: 0.5,
            access_boost: 0.1,
            decay_half_life_secs: 7.0 * 86_400.0,
            importance_floor: 0.05,
            recency_half_life_secs: 86_400.0,
        }
    }
}

impl MemoryGraphConfig {
    /// Validates numeric bounds of every tunable.
    ///
    /// # Errors
    /// Returns [`AetherError::Configuration`] when a value is out of range.
    pub fn validate(&self) -> Result<(), AetherError> {
        if self.embedding_dim == Some(0) {
            return Err(AetherError::Configuration(
                "embedding_dim MUST be >= 1 when set".to_string(),
            ));
        }

        if !self.semantic_threshold.is_finite() || !(-1.0..=1.0).contains(&self.semantic_threshold)
        {
            return Err(AetherError::Configuration(
                "semantic_threshold MUST be in [-1.0, 1.0]".to_string(),
            ));
        }

        for (name, value) in [
            ("initial_importance", self.initial_importance),
            ("access_boost", self.access_boost),
            ("importance_floor", self.importance_floor),
        ] {
            ensure_unit_interval(name, value)?;
        }

        for (name, value) in [
            ("weights.similarity", self.weights.similarity),
            ("weights.importance", self.weights.importance),
            ("weights.recency", self.weights.recency),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(AetherError::Configuration(format!(
                    "{name} MUST be a non-negative number"
                )));
            }
        }

        if self.weights.similarity + self.weights.importance + self.weights.recency <= 0.0 {
            return Err(AetherError::Configuration(
                "at least one score weight MUST be positive".to_string(),
            ));
        }

        for (name, value) in [
            ("decay_half_life_secs", self.decay_half_life_secs),
            ("recency_half_life_secs", self.recency_half_life_secs),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(AetherError::Configuration(format!("{name} MUST be > 0")));
            }
        }

        Ok(())
    }

    /// Decodes and validates a config from JSON.
    ///
    /// # Errors
    /// Returns [`AetherError::Configuration`] on decode or validation failure.
    pub fn from_json(value: &Value) -> Result<Self, AetherError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            AetherError::Configuration(format!("invalid memory graph config JSON: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Edge {
    pub target: NodeId,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryNode {
    pub id: NodeId,
    pub content: String,
    pub embedding: Vec<f32>,
    pub modality: Modality,
    pub metadata: Value,
    pub emotional_valence: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub last_accessed_at: DateTimeUtc,
    /// Instant up to which decay has already been applied to `importance`.
    #[serde(with = "time::serde::rfc3339")]
    pub importance_as_of: DateTimeUtc,
    pub access_count: u64,
    pub importance: f64,
    pub edges: BTreeSet<Edge>,
}

impl MemoryNode {
    #[must_use]
    pub fn has_edge(&self, target: NodeId, kind: EdgeKind) -> bool {
        self.edges.contains(&Edge { target, kind })
    }

    pub fn edge_targets(&self, kind: EdgeKind) -> impl Iterator<Item = NodeId> + '_ {
        self.edges
            .iter()
            .filter(move |edge| edge.kind == kind)
            .map(|edge| edge.target)
    }
}

/// Input for [`MemoryGraph::add`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewMemory {
    pub content: String,
    pub embedding: Vec<f32>,
    pub causal_links: Vec<NodeId>,
    pub modality: Modality,
    pub metadata: Value,
    pub emotional_valence: f64,
    pub importance: Option<f64>,
}

impl NewMemory {
    #[must_use]
    pub fn new(content: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            content: content.into(),
            embedding,
            causal_links: Vec::new(),
            modality: Modality::Text,
            metadata: Value::Object(Map::default()),
            emotional_valence: 0.0,
            importance: None,
        }
    }

    #[must_use]
    pub fn with_causal_links(mut self, links: impl IntoIterator<Item = NodeId>) -> Self {
        self.causal_links.extend(links);
        self
    }

    #[must_use]
    pub fn with_modality(mut self, modality: Modality) -> Self {
        self.modality = modality;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_emotional_valence(mut self, valence: f64) -> Self {
        self.emotional_valence = valence;
        self
    }

    #[must_use]
    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = Some(importance);
        self
    }

    fn validate(&self) -> Result<(), AetherError> {
        ensure_non_empty("content", &self.content)?;

        if self.embedding.is_empty() {
            return Err(AetherError::Validation(
                "embedding MUST contain at least one component".to_string(),
            ));
        }
        if self.embedding.iter().any(|value| !value.is_finite()) {
            return Err(AetherError::Validation(
                "embedding components MUST be finite".to_string(),
            ));
        }
        if !self.emotional_valence.is_finite() || !(-1.0..=1.0).contains(&self.emotional_valence) {
            return Err(AetherError::Validation(
                "emotional_valence MUST be in [-1.0, 1.0]".to_string(),
            ));
        }
        if let Some(importance) = self.importance {
            if !importance.is_finite() || !(0.0..=1.0).contains(&importance) {
                return Err(AetherError::Validation(
                    "importance MUST be in [0.0, 1.0]".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalQuery {
    pub embedding: Vec<f32>,
    pub k: usize,
    pub min_importance: f64,
    pub modality: Option<Modality>,
    /// When set, graph neighbours of the direct hits compete for the top k
    /// with the hit's score multiplied by this factor.
    pub neighbor_attenuation: Option<f64>,
}

impl RetrievalQuery {
    #[must_use]
    pub fn new(embedding: Vec<f32>, k: usize) -> Self {
        Self {
            embedding,
            k,
            min_importance: 0.0,
            modality: None,
            neighbor_attenuation: None,
        }
    }

    #[must_use]
    pub fn with_neighbors(mut self, attenuation: f64) -> Self {
        self.neighbor_attenuation = Some(attenuation);
        self
    }

    fn admits(&self, node: &MemoryNode) -> bool {
        node.importance >= self.min_importance
            && match self.modality {
                Some(modality) => node.modality == modality,
                None => true,
            }
    }

    #[must_use]
    pub fn with_min_importance(mut self, min_importance: f64) -> Self {
        self.min_importance = min_importance;
        self
    }

    #[must_use]
    pub fn with_modality(mut self, modality: Modality) -> Self {
        self.modality = Some(modality);
        self
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScoredMemory {
    pub node: MemoryNode,
    pub score: f64,
    pub similarity: f64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Direction {
    Outgoing,
    Both,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct GraphCounters {
    pub next_id: u64,
    pub total_added: u64,
    pub total_evicted: u64,
}

/// Full persisted state: config, counters and every resident node with its edges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphSnapshot {
    pub format_version: u32,
    pub config: MemoryGraphConfig,
    pub counters: GraphCounters,
    pub embedding_dim: Option<usize>,
    pub nodes: Vec<MemoryNode>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GraphStatistics {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub edges_by_kind: BTreeMap<EdgeKind, usize>,
    pub mean_importance: f64,
    pub mean_valence: f64,
    pub modality_distribution: BTreeMap<Modality, usize>,
    pub counters: GraphCounters,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Eq, PartialEq)]
pub struct DecayReport {
    pub nodes_visited: usize,
    pub nodes_decayed: usize,
}

#[derive(Debug, Clone)]
pub struct MemoryGraph {
    config: MemoryGraphConfig,
    nodes: BTreeMap<NodeId, MemoryNode>,
    counters: GraphCounters,
    embedding_dim: Option<usize>,
}

impl MemoryGraph {
    /// Create an empty graph.
    ///
    /// # Errors
    /// Returns [`AetherError::Configuration`] when the config is invalid.
    pub fn new(config: MemoryGraphConfig) -> Result<Self, AetherError> {
        config.validate()?;
        let embedding_dim = config.embedding_dim;
        Ok(Self {
            config,
            nodes: BTreeMap::new(),
            counters: GraphCounters::default(),
            embedding_dim,
        })
    }

    #[must_use]
    pub fn config(&self) -> &MemoryGraphConfig {
        &self.config
    }

    #[must_use]
    pub fn counters(&self) -> GraphCounters {
        self.counters
    }

    #[must_use]
    pub fn embedding_dim(&self) -> Option<usize> {
        self.embedding_dim
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&MemoryNode> {
        self.nodes.get(&id)
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Resident nodes in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = &MemoryNode> {
        self.nodes.values()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.nodes.values().map(|node| node.edges.len()).sum()
    }

    /// Insert a node, wire its temporal/causal/semantic edges and enforce capacity.
    ///
    /// The newly inserted node is never an eviction candidate for its own insert.
    ///
    /// # Errors
    /// Returns [`AetherError::CapacityExceeded`] when capacity is zero,
    /// [`AetherError::NotFound`] for unknown causal link targets and
    /// [`AetherError::Validation`] for malformed input. The graph is left
    /// untouched on error.
    pub fn add(&mut self, input: NewMemory, now: DateTimeUtc) -> Result<NodeId, AetherError> {
        if self.config.capacity == 0 {
            return Err(AetherError::CapacityExceeded {
                capacity: self.config.capacity,
                resident: self.nodes.len(),
            });
        }

        input.validate()?;
        self.ensure_dimension(input.embedding.len())?;

        let causal_links: BTreeSet<NodeId> = input.causal_links.iter().copied().collect();
        for link in &causal_links {
            if !self.nodes.contains_key(link) {
                return Err(AetherError::node_not_found(*link));
            }
        }

        let id = NodeId(self.counters.next_id);
        self.counters.next_id += 1;
        self.counters.total_added += 1;
        if self.embedding_dim.is_none() {
            self.embedding_dim = Some(input.embedding.len());
        }

        let mut edges: BTreeSet<Edge> = causal_links
            .into_iter()
            .map(|target| Edge {
                target,
                kind: EdgeKind::Causal,
            })
            .collect();

        let threshold = self.config.semantic_threshold;
        for other in self.nodes.values_mut() {
            if cosine_similarity(&input.embedding, &other.embedding) > threshold {
                edges.insert(Edge {
                    target: other.id,
                    kind: EdgeKind::Semantic,
                });
                other.edges.insert(Edge {
                    target: id,
                    kind: EdgeKind::Semantic,
                });
            }
        }

        if let Some(previous) = self.nodes.values_mut().next_back() {
            previous.edges.insert(Edge {
                target: id,
                kind: EdgeKind::Temporal,
            });
        }

        let node = MemoryNode {
            id,
            content: input.content,
            embedding: input.embedding,
            modality: input.modality,
            metadata: input.metadata,
            emotional_valence: input.emotional_valence,
            created_at: now,
            last_accessed_at: now,
            importance_as_of: now,
            access_count: 0,
            importance: input.importance.unwrap_or(self.config.initial_importance),
            edges,
        };
        self.nodes.insert(id, node);
        tracing::debug!(node_id = %id, resident = self.nodes.len(), "memory node added");

        let evicted = self.evict_to_capacity(id)?;
        if !evicted.is_empty() {
            tracing::info!(
                evicted = evicted.len(),
                capacity = self.config.capacity,
                "evicted memory nodes to stay within capacity"
            );
        }

        Ok(id)
    }

    /// Rank resident nodes against a query without touching access statistics.
    ///
    /// # Errors
    /// Returns [`AetherError::Validation`] when the query embedding is malformed
    /// or its dimensionality differs from the graph's.
    pub fn rank(
        &self,
        query: &RetrievalQuery,
        now: DateTimeUtc,
    ) -> Result<Vec<ScoredMemory>, AetherError> {
        if query.embedding.is_empty() || query.embedding.iter().any(|value| !value.is_finite()) {
            return Err(AetherError::Validation(
                "query embedding MUST be non-empty and finite".to_string(),
            ));
        }
        if let Some(dim) = self.embedding_dim {
            if dim != query.embedding.len() {
                return Err(AetherError::Validation(format!(
                    "query embedding has {} component(s), graph expects {dim}",
                    query.embedding.len()
                )));
            }
        }
        if let Some(attenuation) = query.neighbor_attenuation {
            if !attenuation.is_finite() || !(0.0..=1.0).contains(&attenuation) {
                return Err(AetherError::Validation(format!(
                    "neighbor attenuation MUST be in [0.0, 1.0], got {attenuation}"
                )));
            }
        }
        if query.k == 0 || self.nodes.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(&MemoryNode, f64, f64)> = self
            .nodes
            .values()
            .filter(|node| query.admits(node))
            .map(|node| {
                let (score, similarity) = self.composite_score(node, &query.embedding, now);
                (node, score, similarity)
            })
            .collect();
        sort_by_score(&mut scored);
        scored.truncate(query.k);

        if let Some(attenuation) = query.neighbor_attenuation {
            let kinds: BTreeSet<EdgeKind> = EdgeKind::ALL.into_iter().collect();
            let mut best: BTreeMap<NodeId, (&MemoryNode, f64, f64)> = scored
                .iter()
                .map(|hit| (hit.0.id, *hit))
                .collect();
            for (hit, hit_score, _) in &scored {
                for neighbor_id in self.neighbors(hit.id, &kinds, Direction::Both) {
                    let Some(neighbor) = self.nodes.get(&neighbor_id) else {
                        continue;
                    };
                    if !query.admits(neighbor) {
                        continue;
                    }
                    let score = hit_score * attenuation;
                    let similarity = cosine_similarity(&query.embedding, &neighbor.embedding);
                    let entry = best
                        .entry(neighbor_id)
                        .or_insert((neighbor, score, similarity));
                    if score > entry.1 {
                        entry.1 = score;
                    }
                }
            }
            scored = best.into_values().collect();
            sort_by_score(&mut scored);
            scored.truncate(query.k);
        }

        Ok(scored
            .into_iter()
            .map(|(node, score, similarity)| ScoredMemory {
                node: node.clone(),
                score,
                similarity,
            })
            .collect())
    }

    fn composite_score(&self, node: &MemoryNode, query: &[f32], now: DateTimeUtc) -> (f64, f64) {
        let weights = self.config.weights;
        let similarity = cosine_similarity(query, &node.embedding);
        let recency = half_life_factor(
            elapsed_secs(node.last_accessed_at, now),
            self.config.recency_half_life_secs,
        );
        let score = similarity * weights.similarity
            + node.importance * weights.importance
            + recency * weights.recency;
        (score, similarity)
    }

    /// Rank, then record an access on every returned node.
    ///
    /// Scores reflect the state before the access boost. Edges are never modified.
    ///
    /// # Errors
    /// Same as [`MemoryGraph::rank`].
    pub fn retrieve(
        &mut self,
        query: &RetrievalQuery,
        now: DateTimeUtc,
    ) -> Result<Vec<ScoredMemory>, AetherError> {
        let mut results = self.rank(query, now)?;
        for result in &mut results {
            if let Some(node) = self.record_access(result.node.id, now) {
                result.node = node.clone();
            }
        }
        Ok(results)
    }

    /// Apply the retrieval access boost to nodes ranked earlier with [`MemoryGraph::rank`].
    /// Unknown ids are skipped; returns how many nodes were touched.
    pub fn mark_accessed(&mut self, ids: &[NodeId], now: DateTimeUtc) -> usize {
        ids.iter()
            .filter(|id| self.record_access(**id, now).is_some())
            .count()
    }

    fn record_access(&mut self, id: NodeId, now: DateTimeUtc) -> Option<&MemoryNode> {
        let boost = self.config.access_boost;
        let node = self.nodes.get_mut(&id)?;
        node.access_count = node.access_count.saturating_add(1);
        if now > node.last_accessed_at {
            node.last_accessed_at = now;
        }
        if now > node.importance_as_of {
            node.importance_as_of = now;
        }
        node.importance = (node.importance + (1.0 - node.importance) * boost).min(1.0);
        Some(node)
    }

    /// Exponential importance decay since the last access (or last decay),
    /// floored at `importance_floor`.
    pub fn decay(&mut self, now: DateTimeUtc) -> DecayReport {
        let half_life = self.config.decay_half_life_secs;
        let floor = self.config.importance_floor;
        let mut report = DecayReport::default();

        for node in self.nodes.values_mut() {
            report.nodes_visited += 1;
            let elapsed = elapsed_secs(node.importance_as_of, now);
            if elapsed <= 0.0 {
                continue;
            }
            let decayed = node.importance * half_life_factor(elapsed, half_life);
            let next = if node.importance > floor {
                decayed.max(floor)
            } else {
                node.importance
            };
            if next < node.importance {
                report.nodes_decayed += 1;
            }
            node.importance = next;
            node.importance_as_of = now;
        }

        tracing::debug!(
            visited = report.nodes_visited,
            decayed = report.nodes_decayed,
            "memory importance decay applied"
        );
        report
    }

    /// Breadth-first walk from `start`, following only `edge_kinds`, at most `depth` hops.
    ///
    /// # Errors
    /// Returns [`AetherError::NotFound`] when `start` is not resident.
    pub fn traverse(
        &self,
        start: NodeId,
        edge_kinds: &[EdgeKind],
        depth: usize,
        direction: Direction,
    ) -> Result<Traversal<'_>, AetherError> {
        if !self.nodes.contains_key(&start) {
            return Err(AetherError::node_not_found(start));
        }
        Ok(Traversal::new(
            self,
            start,
            edge_kinds.iter().copied().collect(),
            depth,
            direction,
        ))
    }

    /// Resident nodes around `id` in creation order.
    ///
    /// # Errors
    /// Returns [`AetherError::NotFound`] when `id` is not resident.
    pub fn context_window(
        &self,
        id: NodeId,
        window_size: usize,
    ) -> Result<Vec<&MemoryNode>, AetherError> {
        let ordered: Vec<&MemoryNode> = self.nodes.values().collect();
        let position = ordered
            .iter()
            .position(|node| node.id == id)
            .ok_or_else(|| AetherError::node_not_found(id))?;
        let half = window_size / 2;
        let start = position.saturating_sub(half);
        let end = (position + half + 1).min(ordered.len());
        Ok(ordered[start..end].to_vec())
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn statistics(&self) -> GraphStatistics {
        let mut edges_by_kind: BTreeMap<EdgeKind, usize> =
            EdgeKind::ALL.iter().map(|kind| (*kind, 0)).collect();
        let mut modality_distribution: BTreeMap<Modality, usize> = BTreeMap::new();
        let mut importance_sum = 0.0;
        let mut valence_sum = 0.0;

        for node in self.nodes.values() {
            for edge in &node.edges {
                *edges_by_kind.entry(edge.kind).or_default() += 1;
            }
            *modality_distribution.entry(node.modality).or_default() += 1;
            importance_sum += node.importance;
            valence_sum += node.emotional_valence;
        }

        let total_nodes = self.nodes.len();
        let (mean_importance, mean_valence) = if total_nodes == 0 {
            (0.0, 0.0)
        } else {
            (
                importance_sum / total_nodes as f64,
                valence_sum / total_nodes as f64,
            )
        };

        GraphStatistics {
            total_nodes,
            total_edges: self.edge_count(),
            edges_by_kind,
            mean_importance,
            mean_valence,
            modality_distribution,
            counters: self.counters,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            config: self.config.clone(),
            counters: self.counters,
            embedding_dim: self.embedding_dim,
            nodes: self.nodes.values().cloned().collect(),
        }
    }

    /// Rebuild a graph from a snapshot, verifying edge consistency.
    ///
    /// # Errors
    /// Returns [`AetherError::Configuration`] for an invalid config and
    /// [`AetherError::Validation`] for inconsistent node/edge state.
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self, AetherError> {
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(AetherError::Validation(format!(
                "unsupported snapshot format_version {}",
                snapshot.format_version
            )));
        }
        snapshot.config.validate()?;

        let mut nodes = BTreeMap::new();
        for node in snapshot.nodes {
            if node.id.0 >= snapshot.counters.next_id {
                return Err(AetherError::Validation(format!(
                    "node {} is not below next_id {}",
                    node.id, snapshot.counters.next_id
                )));
            }
            if snapshot
                .embedding_dim
                .is_some_and(|dim| dim != node.embedding.len())
            {
                return Err(AetherError::Validation(format!(
                    "node {} embedding dimensionality mismatch",
                    node.id
                )));
            }
            if nodes.insert(node.id, node).is_some() {
                return Err(AetherError::Validation(
                    "snapshot contains duplicate node ids".to_string(),
                ));
            }
        }

        for node in nodes.values() {
            for edge in &node.edges {
                if edge.target == node.id {
                    return Err(AetherError::Validation(format!(
                        "node {} has a self edge",
                        node.id
                    )));
                }
                if !nodes.contains_key(&edge.target) {
                    return Err(AetherError::Validation(format!(
                        "node {} has a dangling {} edge to {}",
                        node.id, edge.kind, edge.target
                    )));
                }
            }
        }

        if nodes.len() > snapshot.config.capacity {
            return Err(AetherError::CapacityExceeded {
                capacity: snapshot.config.capacity,
                resident: nodes.len(),
            });
        }

        tracing::info!(nodes = nodes.len(), "memory graph restored from snapshot");
        Ok(Self {
            config: snapshot.config,
            nodes,
            counters: snapshot.counters,
            embedding_dim: snapshot.embedding_dim,
        })
    }

    fn ensure_dimension(&self, len: usize) -> Result<(), AetherError> {
        match self.embedding_dim {
            Some(dim) if dim != len => Err(AetherError::Validation(format!(
                "embedding has {len} component(s), graph expects {dim}"
            ))),
            _ => Ok(()),
        }
    }

    fn evict_to_capacity(&mut self, protected: NodeId) -> Result<Vec<NodeId>, AetherError> {
        let mut evicted = Vec::new();
        while self.nodes.len() > self.config.capacity {
            let victim = self
                .nodes
                .values()
                .filter(|node| node.id != protected)
                .min_by(|lhs, rhs| {
                    lhs.importance
                        .total_cmp(&rhs.importance)
                        .then_with(|| lhs.created_at.cmp(&rhs.created_at))
                        .then_with(|| lhs.id.cmp(&rhs.id))
                })
                .map(|node| node.id)
                .ok_or(AetherError::CapacityExceeded {
                    capacity: self.config.capacity,
                    resident: self.nodes.len(),
                })?;
            self.remove_node(victim);
            evicted.push(victim);
        }
        Ok(evicted)
    }

    fn remove_node(&mut self, id: NodeId) {
        for node in self.nodes.values_mut() {
            node.edges.retain(|edge| edge.target != id);
        }
        if self.nodes.remove(&id).is_some() {
            self.counters.total_evicted += 1;
            tracing::debug!(node_id = %id, "memory node evicted");
        }
    }

    fn neighbors(&self, id: NodeId, kinds: &BTreeSet<EdgeKind>, direction: Direction) -> Vec<NodeId> {
        let mut out = BTreeSet::new();
        if let Some(node) = self.nodes.get(&id) {
            out.extend(
                node.edges
                    .iter()
                    .filter(|edge| kinds.contains(&edge.kind))
                    .map(|edge| edge.target),
            );
        }
        if direction == Direction::Both {
            for other in self.nodes.values() {
                if other
                    .edges
                    .iter()
                    .any(|edge| edge.target == id && kinds.contains(&edge.kind))
                {
                    out.insert(other.id);
                }
            }
        }
        out.remove(&id);
        out.into_iter().collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Visit<'g> {
    pub node: &'g MemoryNode,
    pub depth: usize,
}

/// Lazy breadth-first traversal. Clone it, or call [`Traversal::restart`], to walk again.
#[derive(Debug, Clone)]
pub struct Traversal<'g> {
    graph: &'g MemoryGraph,
    start: NodeId,
    kinds: BTreeSet<EdgeKind>,
    max_depth: usize,
    direction: Direction,
    queue: VecDeque<(NodeId, usize)>,
    visited: BTreeSet<NodeId>,
}

impl<'g> Traversal<'g> {
    fn new(
        graph: &'g MemoryGraph,
        start: NodeId,
        kinds: BTreeSet<EdgeKind>,
        max_depth: usize,
        direction: Direction,
    ) -> Self {
        let mut traversal = Self {
            graph,
            start,
            kinds,
            max_depth,
            direction,
            queue: VecDeque::new(),
            visited: BTreeSet::new(),
        };
        traversal.restart();
        traversal
    }

    pub fn restart(&mut self) {
        self.queue.clear();
        self.visited.clear();
        self.queue.push_back((self.start, 0));
        self.visited.insert(self.start);
    }
}

impl<'g> Iterator for Traversal<'g> {
    type Item = Visit<'g>;

    fn next(&mut self) -> Option<Self::Item> {
        let (id, depth) = self.queue.pop_front()?;
        let node = self.graph.nodes.get(&id)?;
        if depth < self.max_depth {
            for neighbor in self.graph.neighbors(id, &self.kinds, self.direction) {
                if self.visited.insert(neighbor) {
                    self.queue.push_back((neighbor, depth + 1));
                }
            }
        }
        Some(Visit { node, depth })
    }
}

/// Thread-safe handle: concurrent readers, one structural writer at a time.
#[derive(Debug, Clone)]
pub struct SharedMemoryGraph {
    inner: Arc<RwLock<MemoryGraph>>,
}

impl SharedMemoryGraph {
    #[must_use]
    pub fn new(graph: MemoryGraph) -> Self {
        Self {
            inner: Arc::new(RwLock::new(graph)),
        }
    }

    /// # Errors
    /// See [`MemoryGraph::add`].
    pub fn add(&self, input: NewMemory, now: DateTimeUtc) -> Result<NodeId, AetherError> {
        self.inner.write().add(input, now)
    }

    /// Ranking runs under an upgradable read so plain readers keep going;
    /// the lock is upgraded only to record the accesses.
    ///
    /// # Errors
    /// See [`MemoryGraph::rank`].
    pub fn retrieve(
        &self,
        query: &RetrievalQuery,
        now: DateTimeUtc,
    ) -> Result<Vec<ScoredMemory>, AetherError> {
        let guard = self.inner.upgradable_read();
        let ranked = guard.rank(query, now)?;
        if ranked.is_empty() {
            return Ok(ranked);
        }
        let mut graph = RwLockUpgradableReadGuard::upgrade(guard);
        let mut results = ranked;
        for result in &mut results {
            if let Some(node) = graph.record_access(result.node.id, now) {
                result.node = node.clone();
            }
        }
        Ok(results)
    }

    /// # Errors
    /// See [`MemoryGraph::rank`].
    pub fn rank(
        &self,
        query: &RetrievalQuery,
        now: DateTimeUtc,
    ) -> Result<Vec<ScoredMemory>, AetherError> {
        self.inner.read().rank(query, now)
    }

    pub fn decay(&self, now: DateTimeUtc) -> DecayReport {
        self.inner.write().decay(now)
    }

    pub fn mark_accessed(&self, ids: &[NodeId], now: DateTimeUtc) -> usize {
        self.inner.write().mark_accessed(ids, now)
    }

    /// Collects the traversal while holding the read lock.
    ///
    /// # Errors
    /// See [`MemoryGraph::traverse`].
    pub fn traverse(
        &self,
        start: NodeId,
        edge_kinds: &[EdgeKind],
        depth: usize,
        direction: Direction,
    ) -> Result<Vec<(MemoryNode, usize)>, AetherError> {
        let graph = self.inner.read();
        let traversal = graph.traverse(start, edge_kinds, depth, direction)?;
        Ok(traversal
            .map(|visit| (visit.node.clone(), visit.depth))
            .collect())
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<MemoryNode> {
        self.inner.read().get(id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    #[must_use]
    pub fn statistics(&self) -> GraphStatistics {
        self.inner.read().statistics()
    }

    #[must_use]
    pub fn snapshot(&self) -> GraphSnapshot {
        self.inner.read().snapshot()
    }

    /// Replace the whole graph with a restored snapshot.
    ///
    /// # Errors
    /// See [`MemoryGraph::from_snapshot`]; the current graph is kept on error.
    pub fn restore(&self, snapshot: GraphSnapshot) -> Result<(), AetherError> {
        let restored = MemoryGraph::from_snapshot(snapshot)?;
        *self.inner.write() = restored;
        Ok(())
    }

    /// Run `mutate` against a staged copy under the write lock and install it
    /// only when both `mutate` and `commit` succeed. On any error the live
    /// graph is left exactly as it was.
    ///
    /// # Errors
    /// Whatever `mutate` or `commit` return.
    pub fn transact<T>(
        &self,
        mutate: impl FnOnce(&mut MemoryGraph) -> Result<T, AetherError>,
        commit: impl FnOnce(&MemoryGraph) -> Result<(), AetherError>,
    ) -> Result<T, AetherError> {
        let mut guard = self.inner.write();
        let mut staged = guard.clone();
        let value = mutate(&mut staged)?;
        commit(&staged)?;
        *guard = staged;
        Ok(value)
    }

    pub fn with_read<T>(&self, f: impl FnOnce(&MemoryGraph) -> T) -> T {
        f(&self.inner.read())
    }
}

/// Save/restore boundary for graph snapshots.
pub trait GraphStore: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn persist(&self, snapshot: &GraphSnapshot) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn load(&self) -> anyhow::Result<Option<GraphSnapshot>>;
}

#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    slot: Mutex<Option<GraphSnapshot>>,
}

impl GraphStore for InMemoryGraphStore {
    fn persist(&self, snapshot: &GraphSnapshot) -> anyhow::Result<()> {
        *self.slot.lock() = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> anyhow::Result<Option<GraphSnapshot>> {
        Ok(self.slot.lock().clone())
    }
}

/// Cosine similarity; zero-norm vectors score 0.
#[must_use]
pub fn cosine_similarity(lhs: &[f32], rhs: &[f32]) -> f64 {
    let mut dot = 0.0_f64;
    let mut lhs_norm = 0.0_f64;
    let mut rhs_norm = 0.0_f64;
    for (a, b) in lhs.iter().zip(rhs) {
        let a = f64::from(*a);
        let b = f64::from(*b);
        dot += a * b;
        lhs_norm += a * a;
        rhs_norm += b * b;
    }
    if lhs_norm == 0.0 || rhs_norm == 0.0 {
        return 0.0;
    }
    (dot / (lhs_norm.sqrt() * rhs_norm.sqrt())).clamp(-1.0, 1.0)
}

fn elapsed_secs(earlier: DateTimeUtc, later: DateTimeUtc) -> f64 {
    if later <= earlier {
        return 0.0;
    }
    let elapsed: Duration = later - earlier;
    elapsed.as_seconds_f64()
}

/// Score descending, node id ascending on ties.
fn sort_by_score(scored: &mut [(&MemoryNode, f64, f64)]) {
    scored.sort_by(|lhs, rhs| rhs.1.total_cmp(&lhs.1).then_with(|| lhs.0.id.cmp(&rhs.0.id)));
}

fn half_life_factor(elapsed_secs: f64, half_life_secs: f64) -> f64 {
    0.5_f64.powf(elapsed_secs / half_life_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aether_domain::parse_rfc3339_utc;
    use proptest::prelude::*;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn must_utc(value: &str) -> DateTimeUtc {
        must(parse_rfc3339_utc(value))
    }

    fn t0() -> DateTimeUtc {
        must_utc("2026-02-07T12:00:00Z")
    }

    fn graph_with(config: MemoryGraphConfig) -> MemoryGraph {
        must(MemoryGraph::new(config))
    }

    fn graph() -> MemoryGraph {
        graph_with(MemoryGraphConfig::default())
    }

    fn assert_no_dangling_edges(graph: &MemoryGraph) {
        for node in graph.nodes() {
            for edge in &node.edges {
                assert_ne!(edge.target, node.id, "self edge on {}", node.id);
                assert!(
                    graph.contains(edge.target),
                    "dangling {} edge {} -> {}",
                    edge.kind,
                    node.id,
                    edge.target
                );
            }
        }
    }

    #[test]
    fn add_assigns_monotonic_ids_and_temporal_edges() {
        let mut graph = graph();
        let first = must(graph.add(NewMemory::new("first", vec![1.0, 0.0]), t0()));
        let second = must(graph.add(NewMemory::new("second", vec![0.0, 1.0]), t0()));

        assert!(second > first);
        assert!(must_some(graph.get(first)).has_edge(second, EdgeKind::Temporal));
        assert!(!must_some(graph.get(second)).has_edge(first, EdgeKind::Temporal));
        assert_eq!(graph.counters().next_id, 2);
    }

    #[test]
    fn semantic_edges_are_mirrored_above_threshold_only() {
        let mut graph = graph();
        let a = must(graph.add(NewMemory::new("a", vec![1.0, 0.0, 0.0]), t0()));
        let b = must(graph.add(NewMemory::new("b", vec![0.9, 0.1, 0.0]), t0()));
        let c = must(graph.add(NewMemory::new("c", vec![0.0, 0.0, 1.0]), t0()));

        let node_b = must_some(graph.get(b));
        assert!(node_b.has_edge(a, EdgeKind::Semantic));
        assert!(must_some(graph.get(a)).has_edge(b, EdgeKind::Semantic));
        assert!(!must_some(graph.get(c)).has_edge(a, EdgeKind::Semantic));
    }

    #[test]
    fn unknown_causal_link_is_rejected_without_mutation() {
        let mut graph = graph();
        let _ = must(graph.add(NewMemory::new("a", vec![1.0]), t0()));
        let result = graph.add(
            NewMemory::new("b", vec![1.0]).with_causal_links([NodeId(42)]),
            t0(),
        );

        assert!(matches!(result, Err(AetherError::NotFound { .. })));
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.counters().next_id, 1);
    }

    #[test]
    fn zero_capacity_fails_with_capacity_exceeded() {
        let mut graph = graph_with(MemoryGraphConfig {
            capacity: 0,
            ..MemoryGraphConfig::default()
        });
        let result = graph.add(NewMemory::new("a", vec![1.0]), t0());
        assert!(matches!(result, Err(AetherError::CapacityExceeded { .. })));
        assert!(graph.is_empty());
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut graph = graph();
        let _ = must(graph.add(NewMemory::new("a", vec![1.0, 0.0]), t0()));
        let result = graph.add(NewMemory::new("b", vec![1.0]), t0());
        assert!(matches!(result, Err(AetherError::Validation(_))));
    }

    #[test]
    fn eviction_prefers_lowest_importance_then_oldest() {
        let mut graph = graph_with(MemoryGraphConfig {
            capacity: 2,
            semantic_threshold: 1.0,
            ..MemoryGraphConfig::default()
        });
        let a = must(graph.add(NewMemory::new("a", vec![1.0, 0.0]).with_importance(0.4), t0()));
        let b = must(graph.add(NewMemory::new("b", vec![0.0, 1.0]).with_importance(0.4), t0()));
        let c = must(graph.add(NewMemory::new("c", vec![1.0, 1.0]).with_importance(0.9), t0()));

        assert!(!graph.contains(a));
        assert!(graph.contains(b));
        assert!(graph.contains(c));
        assert_eq!(graph.counters().total_evicted, 1);
        assert_no_dangling_edges(&graph);
    }

    #[test]
    fn newly_added_node_is_not_evicted_by_its_own_insert() {
        let mut graph = graph_with(MemoryGraphConfig {
            capacity: 1,
            ..MemoryGraphConfig::default()
        });
        let _ = must(graph.add(NewMemory::new("a", vec![1.0]).with_importance(0.9), t0()));
        let b = must(graph.add(NewMemory::new("b", vec![1.0]).with_importance(0.1), t0()));

        assert_eq!(graph.len(), 1);
        assert!(graph.contains(b));
        assert_no_dangling_edges(&graph);
    }

    #[test]
    fn retrieve_zero_k_is_empty() {
        let mut graph = graph();
        let _ = must(graph.add(NewMemory::new("a", vec![1.0]), t0()));
        let results = must(graph.retrieve(&RetrievalQuery::new(vec![1.0], 0), t0()));
        assert!(results.is_empty());
        assert_eq!(must_some(graph.nodes().next()).access_count, 0);
    }

    #[test]
    fn retrieve_boosts_importance_and_counts_access() {
        let mut graph = graph();
        let id = must(graph.add(NewMemory::new("a", vec![1.0, 0.0]), t0()));
        let query = RetrievalQuery::new(vec![1.0, 0.0], 1);

        let mut previous = must_some(graph.get(id)).importance;
        for expected_count in 1..=5_u64 {
            let results = must(graph.retrieve(&query, t0()));
            assert_eq!(results.len(), 1);
            let node = must_some(graph.get(id));
            assert_eq!(node.access_count, expected_count);
            assert!(node.importance > previous || node.importance >= 1.0);
            assert!((results[0].node.importance - node.importance).abs() < f64::EPSILON);
            previous = node.importance;
        }
        assert!((must_some(graph.get(id)).importance - (1.0 - 0.5 * 0.9_f64.powi(5))).abs() < 1e-9);
    }

    #[test]
    fn mark_accessed_matches_retrieve_side_effects() {
        let mut peeked = graph();
        let mut retrieved = graph();
        for graph in [&mut peeked, &mut retrieved] {
            let _ = must(graph.add(NewMemory::new("a", vec![1.0, 0.0]), t0()));
            let _ = must(graph.add(NewMemory::new("b", vec![0.0, 1.0]), t0()));
        }
        let query = RetrievalQuery::new(vec![1.0, 0.0], 1);

        let ranked = must(peeked.rank(&query, t0()));
        let ids: Vec<NodeId> = ranked.iter().map(|scored| scored.node.id).collect();
        assert_eq!(peeked.mark_accessed(&ids, t0()), 1);
        assert_eq!(peeked.mark_accessed(&[NodeId(99)], t0()), 0);
        let _ = must(retrieved.retrieve(&query, t0()));

        assert_eq!(peeked.snapshot().nodes, retrieved.snapshot().nodes);
    }

    #[test]
    fn retrieve_filters_by_importance_and_modality() {
        let mut graph = graph();
        let _ = must(graph.add(NewMemory::new("low", vec![1.0]).with_importance(0.1), t0()));
        let audio = must(graph.add(
            NewMemory::new("audio", vec![1.0])
                .with_importance(0.8)
                .with_modality(Modality::Audio),
            t0(),
        ));

        let high = must(graph.rank(&RetrievalQuery::new(vec![1.0], 10).with_min_importance(0.5), t0()));
        assert_eq!(high.len(), 1);

        let by_modality = must(graph.rank(
            &RetrievalQuery::new(vec![1.0], 10).with_modality(Modality::Audio),
            t0(),
        ));
        assert_eq!(by_modality.len(), 1);
        assert_eq!(by_modality[0].node.id, audio);
    }

    #[test]
    fn equal_scores_break_ties_by_ascending_id() {
        let mut graph = graph_with(MemoryGraphConfig {
            semantic_threshold: 1.0,
            ..MemoryGraphConfig::default()
        });
        let ids: Vec<NodeId> = (0..4)
            .map(|index| must(graph.add(NewMemory::new(format!("n{index}"), vec![1.0, 1.0]), t0())))
            .collect();

        let ranked = must(graph.rank(&RetrievalQuery::new(vec![1.0, 1.0], 4), t0()));
        let ranked_ids: Vec<NodeId> = ranked.iter().map(|item| item.node.id).collect();
        assert_eq!(ranked_ids, ids);
    }

    fn similarity_only() -> MemoryGraphConfig {
        MemoryGraphConfig {
            semantic_threshold: 1.0,
            weights: ScoreWeights {
                similarity: 1.0,
                importance: 0.0,
                recency: 0.0,
            },
            ..MemoryGraphConfig::default()
        }
    }

    // m -> p -> a -> n along temporal edges; only a matches the query.
    fn neighborhood() -> (MemoryGraph, [NodeId; 4]) {
        let mut graph = graph_with(similarity_only());
        let m = must(graph.add(NewMemory::new("m", vec![0.6, 0.8, 0.0]), t0()));
        let p = must(graph.add(NewMemory::new("p", vec![0.0, 1.0, 0.0]), t0()));
        let a = must(graph.add(NewMemory::new("a", vec![1.0, 0.0, 0.0]), t0()));
        let n = must(graph.add(NewMemory::new("n", vec![0.0, 0.0, 1.0]), t0()));
        (graph, [m, p, a, n])
    }

    #[test]
    fn rank_ignores_neighbors_unless_requested() {
        let (graph, [m, _, a, _]) = neighborhood();
        let ranked = must(graph.rank(&RetrievalQuery::new(vec![1.0, 0.0, 0.0], 2), t0()));
        let ids: Vec<NodeId> = ranked.iter().map(|item| item.node.id).collect();
        assert_eq!(ids, vec![a, m]);
    }

    #[test]
    fn neighbors_of_hits_compete_at_attenuated_score() {
        let (graph, [m, p, a, n]) = neighborhood();
        let query = RetrievalQuery::new(vec![1.0, 0.0, 0.0], 3).with_neighbors(0.9);

        let ranked = must(graph.rank(&query, t0()));
        let ids: Vec<NodeId> = ranked.iter().map(|item| item.node.id).collect();
        // p and n tie at 0.9 behind a; m (0.6) drops out of the top 3
        assert_eq!(ids, vec![a, p, n]);
        assert!(!ids.contains(&m));
        assert!((ranked[1].score - 0.9).abs() < 1e-9);
        assert!(ranked[1].similarity.abs() < 1e-9);

        let top_two = must(graph.rank(&RetrievalQuery::new(vec![1.0, 0.0, 0.0], 2).with_neighbors(0.9), t0()));
        let top_ids: Vec<NodeId> = top_two.iter().map(|item| item.node.id).collect();
        assert_eq!(top_ids, vec![a, p]);
    }

    #[test]
    fn neighbor_expansion_respects_filters_and_attenuation_bounds() {
        let mut graph = graph_with(similarity_only());
        let hit = must(graph.add(NewMemory::new("hit", vec![1.0, 0.0]).with_importance(0.9), t0()));
        let _ = must(graph.add(NewMemory::new("weak", vec![0.0, 1.0]).with_importance(0.1), t0()));

        let ranked = must(graph.rank(
            &RetrievalQuery::new(vec![1.0, 0.0], 5)
                .with_min_importance(0.5)
                .with_neighbors(1.0),
            t0(),
        ));
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].node.id, hit);

        for attenuation in [-0.1, 1.5, f64::NAN] {
            let result = graph.rank(&RetrievalQuery::new(vec![1.0, 0.0], 1).with_neighbors(attenuation), t0());
            assert!(matches!(result, Err(AetherError::Validation(_))));
        }
    }

    #[test]
    fn rank_returns_only_top_k_in_total_order() {
        let mut graph = graph_with(similarity_only());
        for index in 0..40_u8 {
            let angle = f32::from(index) * 0.07;
            let _ = must(graph.add(NewMemory::new(format!("n{index}"), vec![angle.cos(), angle.sin()]), t0()));
        }
        let query = vec![1.0, 0.2];

        let all = must(graph.rank(&RetrievalQuery::new(query.clone(), 40), t0()));
        let top = must(graph.rank(&RetrievalQuery::new(query, 5), t0()));
        assert_eq!(all.len(), 40);
        assert_eq!(top.len(), 5);
        assert_eq!(top, all[..5].to_vec());
        for pair in all.windows(2) {
            assert!(
                pair[0].score > pair[1].score
                    || (pair[0].score == pair[1].score && pair[0].node.id < pair[1].node.id)
            );
        }
    }

    #[test]
    fn decay_reduces_importance_without_compounding_and_respects_floor() {
        let mut graph = graph_with(MemoryGraphConfig {
            decay_half_life_secs: 86_400.0,
            importance_floor: 0.05,
            ..MemoryGraphConfig::default()
        });
        let id = must(graph.add(NewMemory::new("a", vec![1.0]).with_importance(0.8), t0()));

        let one_day = t0() + Duration::days(1);
        let report = graph.decay(one_day);
        assert_eq!(report.nodes_decayed, 1);
        assert!((must_some(graph.get(id)).importance - 0.4).abs() < 1e-9);

        let _ = graph.decay(one_day);
        assert!((must_some(graph.get(id)).importance - 0.4).abs() < 1e-9);

        let _ = graph.decay(t0() + Duration::days(60));
        assert!((must_some(graph.get(id)).importance - 0.05).abs() < 1e-9);
        assert!(graph.contains(id));
    }

    #[test]
    fn traverse_follows_requested_kinds_within_depth() {
        let mut graph = graph_with(MemoryGraphConfig {
            semantic_threshold: 1.0,
            ..MemoryGraphConfig::default()
        });
        let a = must(graph.add(NewMemory::new("a", vec![1.0, 0.0]), t0()));
        let b = must(graph.add(NewMemory::new("b", vec![0.0, 1.0]).with_causal_links([a]), t0()));
        let c = must(graph.add(NewMemory::new("c", vec![1.0, 1.0]).with_causal_links([b]), t0()));

        let chain: Vec<NodeId> = must(graph.traverse(c, &[EdgeKind::Causal], 5, Direction::Outgoing))
            .map(|visit| visit.node.id)
            .collect();
        assert_eq!(chain, vec![c, b, a]);

        let shallow: Vec<usize> = must(graph.traverse(c, &[EdgeKind::Causal], 1, Direction::Outgoing))
            .map(|visit| visit.depth)
            .collect();
        assert_eq!(shallow, vec![0, 1]);

        let forward: Vec<NodeId> = must(graph.traverse(a, &[EdgeKind::Temporal], 5, Direction::Outgoing))
            .map(|visit| visit.node.id)
            .collect();
        assert_eq!(forward, vec![a, b, c]);

        let backward: Vec<NodeId> = must(graph.traverse(a, &[EdgeKind::Causal], 5, Direction::Both))
            .map(|visit| visit.node.id)
            .collect();
        assert_eq!(backward, vec![a, b, c]);
    }

    #[test]
    fn traversal_is_restartable() {
        let mut graph = graph();
        let a = must(graph.add(NewMemory::new("a", vec![1.0]), t0()));
        let _ = must(graph.add(NewMemory::new("b", vec![1.0]), t0()));

        let mut traversal = must(graph.traverse(a, &[EdgeKind::Temporal], 3, Direction::Outgoing));
        let first: Vec<NodeId> = traversal.by_ref().map(|visit| visit.node.id).collect();
        assert!(traversal.next().is_none());
        traversal.restart();
        let second: Vec<NodeId> = traversal.map(|visit| visit.node.id).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn traverse_unknown_start_is_not_found() {
        let graph = graph();
        let result = graph.traverse(NodeId(7), &[EdgeKind::Causal], 2, Direction::Outgoing);
        assert!(matches!(result, Err(AetherError::NotFound { .. })));
    }

    #[test]
    fn dragon_continuation_scenario() {
        let mut graph = graph();
        let emb_a = vec![0.9_f32, 0.1, 0.0, 0.2];
        let emb_b = vec![0.1_f32, 0.8, 0.5, 0.0];
        let a = must(graph.add(NewMemory::new("A dragon awakens", emb_a), t0()));
        let b = must(graph.add(
            NewMemory::new("The dragon speaks", emb_b.clone()).with_causal_links([a]),
            t0(),
        ));

        let results = must(graph.retrieve(&RetrievalQuery::new(emb_b, 1), t0()));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].node.id, b);

        let visited: Vec<NodeId> = must(graph.traverse(b, &[EdgeKind::Causal], 1, Direction::Outgoing))
            .map(|visit| visit.node.id)
            .collect();
        assert_eq!(visited, vec![b, a]);
    }

    #[test]
    fn context_window_is_centered_in_creation_order() {
        let mut graph = graph();
        let ids: Vec<NodeId> = (0..7)
            .map(|index| must(graph.add(NewMemory::new(format!("n{index}"), vec![1.0]), t0())))
            .collect();

        let window: Vec<NodeId> = must(graph.context_window(ids[3], 4))
            .iter()
            .map(|node| node.id)
            .collect();
        assert_eq!(window, ids[1..6].to_vec());

        let edge: Vec<NodeId> = must(graph.context_window(ids[0], 4))
            .iter()
            .map(|node| node.id)
            .collect();
        assert_eq!(edge, ids[0..3].to_vec());
    }

    #[test]
    fn snapshot_round_trip_preserves_state_and_ordering() {
        let mut graph = graph();
        let a = must(graph.add(NewMemory::new("a", vec![1.0, 0.2]), t0()));
        let _ = must(graph.add(NewMemory::new("b", vec![0.3, 1.0]).with_causal_links([a]), t0()));
        let query = RetrievalQuery::new(vec![1.0, 0.5], 2);
        let _ = must(graph.retrieve(&query, t0() + Duration::hours(1)));

        let snapshot = graph.snapshot();
        let mut restored = must(MemoryGraph::from_snapshot(snapshot.clone()));
        assert_eq!(restored.snapshot(), snapshot);

        let later = t0() + Duration::hours(5);
        let original_order: Vec<NodeId> = must(graph.retrieve(&query, later))
            .iter()
            .map(|item| item.node.id)
            .collect();
        let restored_order: Vec<NodeId> = must(restored.retrieve(&query, later))
            .iter()
            .map(|item| item.node.id)
            .collect();
        assert_eq!(original_order, restored_order);
    }

    #[test]
    fn snapshot_with_dangling_edge_is_rejected() {
        let mut graph = graph();
        let _ = must(graph.add(NewMemory::new("a", vec![1.0]), t0()));
        let mut snapshot = graph.snapshot();
        snapshot.nodes[0].edges.insert(Edge {
            target: NodeId(99),
            kind: EdgeKind::Causal,
        });
        assert!(matches!(
            MemoryGraph::from_snapshot(snapshot),
            Err(AetherError::Validation(_))
        ));
    }

    #[test]
    fn statistics_report_edges_and_modalities() {
        let mut graph = graph_with(MemoryGraphConfig {
            semantic_threshold: 1.0,
            ..MemoryGraphConfig::default()
        });
        let a = must(graph.add(NewMemory::new("a", vec![1.0, 0.0]), t0()));
        let _ = must(graph.add(
            NewMemory::new("b", vec![0.0, 1.0])
                .with_causal_links([a])
                .with_modality(Modality::Video)
                .with_emotional_valence(0.5),
            t0(),
        ));

        let stats = graph.statistics();
        assert_eq!(stats.total_nodes, 2);
        assert_eq!(stats.total_edges, 2);
        assert_eq!(stats.edges_by_kind.get(&EdgeKind::Causal), Some(&1));
        assert_eq!(stats.edges_by_kind.get(&EdgeKind::Temporal), Some(&1));
        assert_eq!(stats.modality_distribution.get(&Modality::Video), Some(&1));
        assert!((stats.mean_valence - 0.25).abs() < 1e-9);
    }

    #[test]
    fn config_validation_rejects_bad_values() {
        let bad_weights = MemoryGraphConfig {
            weights: ScoreWeights {
                similarity: 0.0,
                importance: 0.0,
                recency: 0.0,
            },
            ..MemoryGraphConfig::default()
        };
        assert!(bad_weights.validate().is_err());

        let bad_half_life = MemoryGraphConfig {
            decay_half_life_secs: 0.0,
            ..MemoryGraphConfig::default()
        };
        assert!(bad_half_life.validate().is_err());

        let parsed = must(MemoryGraphConfig::from_json(&serde_json::json!({
            "capacity": 3,
            "semantic_threshold": 0.5
        })));
        assert_eq!(parsed.capacity, 3);
        assert!((parsed.access_boost - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn shared_graph_supports_concurrent_readers_and_writers() {
        let shared = SharedMemoryGraph::new(graph_with(MemoryGraphConfig {
            capacity: 16,
            ..MemoryGraphConfig::default()
        }));
        std::thread::scope(|scope| {
            for worker in 0..4_u8 {
                let shared = shared.clone();
                scope.spawn(move || {
                    for step in 0..10_u8 {
                        let embedding = vec![f32::from(worker) + 1.0, f32::from(step) + 1.0];
                        let _ = must(shared.add(NewMemory::new(format!("{worker}:{step}"), embedding.clone()), t0()));
                        let _ = must(shared.retrieve(&RetrievalQuery::new(embedding, 3), t0()));
                    }
                });
            }
        });

        assert_eq!(shared.len(), 16);
        shared.with_read(assert_no_dangling_edges);
        assert_eq!(shared.statistics().counters.total_added, 40);
    }

    #[test]
    fn transact_installs_staged_graph_only_when_commit_succeeds() {
        let shared = SharedMemoryGraph::new(graph());
        let a = must(shared.add(NewMemory::new("a", vec![1.0, 0.0]), t0()));
        let before = shared.snapshot();
        let later = t0() + Duration::hours(1);

        let failed_mutation = shared.transact(
            |graph| {
                let _ = graph.mark_accessed(&[a], later);
                graph.add(NewMemory::new("b", vec![0.0, 1.0]).with_causal_links([NodeId(42)]), later)
            },
            |_| Ok(()),
        );
        assert!(matches!(failed_mutation, Err(AetherError::NotFound { .. })));
        assert_eq!(shared.snapshot(), before);

        let failed_commit = shared.transact(
            |graph| {
                let _ = graph.mark_accessed(&[a], later);
                graph.add(NewMemory::new("b", vec![0.0, 1.0]).with_causal_links([a]), later)
            },
            |_| Err(AetherError::Persistence("disk full".to_string())),
        );
        assert!(matches!(failed_commit, Err(AetherError::Persistence(_))));
        assert_eq!(shared.snapshot(), before);
        assert_eq!(must_some(shared.get(a)).access_count, 0);

        let mut committed_len = 0;
        let b = must(shared.transact(
            |graph| graph.add(NewMemory::new("b", vec![0.0, 1.0]).with_causal_links([a]), later),
            |staged| {
                committed_len = staged.len();
                Ok(())
            },
        ));
        assert_eq!(committed_len, 2);
        assert_eq!(shared.len(), 2);
        assert!(must_some(shared.get(b)).has_edge(a, EdgeKind::Causal));
    }

    #[test]
    fn in_memory_store_round_trips_snapshot() {
        let store = InMemoryGraphStore::default();
        assert!(must(store.load()).is_none());

        let mut graph = graph();
        let _ = must(graph.add(NewMemory::new("a", vec![1.0]), t0()));
        must(store.persist(&graph.snapshot()));
        assert_eq!(must(store.load()), Some(graph.snapshot()));
    }

    fn embedding_strategy() -> impl Strategy<Value = Vec<f32>> {
        prop::collection::vec(-1.0_f32..1.0, 3)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_capacity_bound_and_edge_consistency(
            capacity in 1_usize..8,
            inserts in prop::collection::vec((embedding_strategy(), 0.0_f64..1.0, any::<bool>()), 1..40),
        ) {
            let mut graph = graph_with(MemoryGraphConfig {
                capacity,
                semantic_threshold: 0.5,
                ..MemoryGraphConfig::default()
            });
            let mut last: Option<NodeId> = None;
            for (embedding, importance, link_previous) in inserts {
                let mut input = NewMemory::new("memory", embedding).with_importance(importance);
                if link_previous {
                    if let Some(previous) = last.filter(|id| graph.contains(*id)) {
                        input = input.with_causal_links([previous]);
                    }
                }
                last = Some(must(graph.add(input, t0())));
                prop_assert!(graph.len() <= capacity);
                assert_no_dangling_edges(&graph);
            }
        }

        #[test]
        fn prop_retrieval_is_bounded_and_ordered(
            embeddings in prop::collection::vec(embedding_strategy(), 1..20),
            query in embedding_strategy(),
            k in 0_usize..10,
        ) {
            let mut graph = graph();
            for embedding in embeddings {
                let _ = must(graph.add(NewMemory::new("memory", embedding), t0()));
            }
            let results = must(graph.retrieve(&RetrievalQuery::new(query, k), t0()));
            prop_assert!(results.len() <= k);
            for pair in results.windows(2) {
                prop_assert!(pair[0].score >= pair[1].score);
                if pair[0].score.total_cmp(&pair[1].score).is_eq() {
                    prop_assert!(pair[0].node.id < pair[1].node.id);
                }
            }
        }
    }
}
