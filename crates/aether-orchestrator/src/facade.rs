use std::collections::BTreeSet;

use aether_domain::{
    ensure_non_empty, now_utc, AetherError, AffectAnalysis, DateTimeUtc, Modality, NodeId,
    OutputFormat, SubmissionId,
};
use aether_memory_core::{GraphStore, NewMemory, RetrievalQuery, SharedMemoryGraph};
use aether_pipeline::{standard_pipeline, PipelineDefinition};
use aether_provider::{AffectAnalyzer, Embedder};
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::FacadeConfig;
use crate::{CancellationToken, Orchestrator, SubmissionReport, SubmitRequest};

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub formats: BTreeSet<OutputFormat>,
    pub style: Option<String>,
    /// Overrides the tone inferred by the affect analyzer.
    pub tone: Option<String>,
    pub modality: Modality,
    /// Earlier generations this one continues; become causal edges.
    pub continuation_of: Vec<NodeId>,
    /// Replaces the standard pipeline for `formats`.
    pub pipeline: Option<PipelineDefinition>,
}

impl GenerationRequest {
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            formats: BTreeSet::new(),
            style: None,
            tone: None,
            modality: Modality::default(),
            continuation_of: Vec::new(),
            pipeline: None,
        }
    }

    #[must_use]
    pub fn with_formats(mut self, formats: impl IntoIterator<Item = OutputFormat>) -> Self {
        self.formats.extend(formats);
        self
    }

    #[must_use]
    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    #[must_use]
    pub fn with_tone(mut self, tone: impl Into<String>) -> Self {
        self.tone = Some(tone.into());
        self
    }

    #[must_use]
    pub fn with_modality(mut self, modality: Modality) -> Self {
        self.modality = modality;
        self
    }

    #[must_use]
    pub fn continuing(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.continuation_of.extend(nodes);
        self
    }

    #[must_use]
    pub fn with_pipeline(mut self, pipeline: PipelineDefinition) -> Self {
        self.pipeline = Some(pipeline);
        self
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecalledMemory {
    pub node_id: NodeId,
    pub content: String,
    pub score: f64,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub submission_id: SubmissionId,
    pub affect: AffectAnalysis,
    pub context: Vec<RecalledMemory>,
    /// Terminal task output.
    pub artifact: Value,
    /// Memory node written for this generation.
    pub node_id: NodeId,
    pub report: SubmissionReport,
}

/// Single entry point: affect, recall, orchestrate, write back.
pub struct GenerationFacade<'a> {
    config: FacadeConfig,
    analyzer: &'a dyn AffectAnalyzer,
    embedder: &'a dyn Embedder,
    memory: &'a SharedMemoryGraph,
    store: Option<&'a dyn GraphStore>,
    orchestrator: &'a Orchestrator<'a>,
}

impl<'a> GenerationFacade<'a> {
    /// # Errors
    /// Returns [`AetherError::Configuration`] when the config is invalid.
    pub fn new(
        config: FacadeConfig,
        analyzer: &'a dyn AffectAnalyzer,
        embedder: &'a dyn Embedder,
        memory: &'a SharedMemoryGraph,
        orchestrator: &'a Orchestrator<'a>,
    ) -> Result<Self, AetherError> {
        config.validate()?;
        Ok(Self {
            config,
            analyzer,
            embedder,
            memory,
            store: None,
            orchestrator,
        })
    }

    #[must_use]
    pub fn with_store(mut self, store: &'a dyn GraphStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the in-memory graph with the stored snapshot, if there is one.
    ///
    /// # Errors
    /// Returns [`AetherError::Persistence`] when loading fails, or the
    /// snapshot validation error when it is inconsistent.
    pub fn restore_memory(&self) -> Result<bool, AetherError> {
        let Some(store) = self.store else {
            return Ok(false);
        };
        let snapshot = store
            .load()
            .map_err(|err| AetherError::Persistence(format!("{err:#}")))?;
        match snapshot {
            Some(snapshot) => {
                self.memory.restore(snapshot)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// # Errors
    /// Returns [`AetherError::Persistence`] when the store rejects the snapshot.
    pub fn persist_memory(&self) -> Result<(), AetherError> {
        let Some(store) = self.store else {
            return Ok(());
        };
        store
            .persist(&self.memory.snapshot())
            .map_err(|err| AetherError::Persistence(format!("{err:#}")))
    }

    /// # Errors
    /// See [`GenerationFacade::generate_at`].
    pub fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult, AetherError> {
        self.generate_at(request, cancel, now_utc())
    }

    /// Run one generation with an explicit clock. The memory graph is only
    /// written once the terminal task has completed.
    ///
    /// # Errors
    /// Returns [`AetherError::Validation`] for an empty prompt,
    /// [`AetherError::NotFound`] for an unknown continuation node,
    /// [`AetherError::CollaboratorFailure`] when affect analysis, embedding or
    /// a task fails, [`AetherError::Cancelled`] when cancelled and
    /// [`AetherError::Persistence`] when the store rejects the snapshot.
    pub fn generate_at(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
        now: DateTimeUtc,
    ) -> Result<GenerationResult, AetherError> {
        ensure_non_empty("prompt", &request.prompt)?;
        if let Some(missing) = request
            .continuation_of
            .iter()
            .find(|id| self.memory.get(**id).is_none())
        {
            return Err(AetherError::node_not_found(*missing));
        }

        ensure_not_cancelled(cancel, "affect")?;
        tracing::info!(analyzer = self.analyzer.analyzer_name(), "generation stage: affect");
        let affect = self
            .analyzer
            .analyze(&request.prompt)
            .map_err(|err| AetherError::collaborator(None, "affect", format!("{err:#}")))?
            .clamped();

        ensure_not_cancelled(cancel, "embed")?;
        let embedding = self
            .embedder
            .embed(&request.prompt)
            .map_err(|err| AetherError::collaborator(None, "embed", format!("{err:#}")))?;
        if embedding.is_empty() {
            return Err(AetherError::collaborator(
                None,
                "embed",
                "embedder returned an empty vector",
            ));
        }

        ensure_not_cancelled(cancel, "recall")?;
        if self.config.decay_before_recall {
            let _ = self.memory.decay(now);
        }
        let mut query = RetrievalQuery::new(embedding.clone(), self.config.context_k)
            .with_min_importance(self.config.context_min_importance);
        if let Some(attenuation) = self.config.context_neighbor_attenuation {
            query = query.with_neighbors(attenuation);
        }
        let context: Vec<RecalledMemory> = self
            .memory
            .rank(&query, now)?
            .into_iter()
            .map(|scored| RecalledMemory {
                node_id: scored.node.id,
                content: scored.node.content,
                score: scored.score,
                similarity: scored.similarity,
            })
            .collect();
        tracing::info!(recalled = context.len(), "generation stage: recall");

        let tone = request.tone.clone().unwrap_or_else(|| affect.tone.clone());
        let formats: Vec<&str> = request.formats.iter().map(|format| format.as_str()).collect();
        let pipeline = request
            .pipeline
            .clone()
            .unwrap_or_else(|| standard_pipeline(&request.formats));
        let payload = json!({
            "prompt": request.prompt,
            "style": request.style,
            "tone": tone,
            "formats": formats,
            "affect": affect,
            "memory_context": context,
        });

        tracing::info!(pipeline = %pipeline.pipeline_name, "generation stage: orchestrate");
        let report = self
            .orchestrator
            .submit(SubmitRequest::new(pipeline, payload), cancel)?;
        ensure_not_cancelled(cancel, "write_back")?;

        let artifact = report.output().cloned().unwrap_or(Value::Null);
        let recalled: Vec<NodeId> = context.iter().map(|memory| memory.node_id).collect();
        let metadata = json!({
            "style": request.style,
            "tone": tone,
            "formats": formats,
            "affect": affect,
            "submission_id": report.submission_id.to_string(),
            "pipeline": report.pipeline_name,
            "pipeline_hash": report.pipeline_hash,
        });
        let node = NewMemory::new(request.prompt.clone(), embedding)
            .with_causal_links(request.continuation_of.iter().copied())
            .with_modality(request.modality)
            .with_metadata(metadata)
            .with_emotional_valence(affect.valence);

        // access marks, the new node and the persisted snapshot land together or not at all
        let store = self.store.filter(|_| self.config.persist_after_write_back);
        let node_id = self.memory.transact(
            |graph| {
                let _ = graph.mark_accessed(&recalled, now);
                graph.add(node, now)
            },
            |staged| match store {
                Some(store) => store
                    .persist(&staged.snapshot())
                    .map_err(|err| AetherError::Persistence(format!("{err:#}"))),
                None => Ok(()),
            },
        )?;
        tracing::info!(node_id = %node_id, submission_id = %report.submission_id, "generation stage: write-back");

        Ok(GenerationResult {
            submission_id: report.submission_id,
            affect,
            context,
            artifact,
            node_id,
            report,
        })
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken, stage: &str) -> Result<(), AetherError> {
    if cancel.is_cancelled() {
        return Err(AetherError::cancelled(stage));
    }
    Ok(())
}
