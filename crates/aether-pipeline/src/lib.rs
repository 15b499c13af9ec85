#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use aether_domain::{ensure_non_empty, hash_bytes, hash_json, AetherError, OutputFormat, Role};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const NORMALIZATION_VERSION: u32 = 1;

pub const STANDARD_PIPELINE_NAME: &str = "standard";
pub const STANDARD_PIPELINE_VERSION: &str = "v1";

fn default_terminal_role() -> Role {
    Role::Assemble
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StageDefinition {
    pub role: Role,
    #[serde(default)]
    pub depends_on: Vec<Role>,
}

impl StageDefinition {
    #[must_use]
    pub fn new(role: Role, depends_on: impl IntoIterator<Item = Role>) -> Self {
        Self {
            role,
            depends_on: depends_on.into_iter().collect(),
        }
    }
}

/// Task graph declared as data: each stage names the roles it waits on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PipelineDefinition {
    pub pipeline_name: String,
    pub pipeline_version: String,
    #[serde(default)]
    pub normalization_version: u32,
    #[serde(default = "default_terminal_role")]
    pub terminal_role: Role,
    pub stages: Vec<StageDefinition>,
}

impl PipelineDefinition {
    #[must_use]
    pub fn new(
        pipeline_name: impl Into<String>,
        pipeline_version: impl Into<String>,
        terminal_role: Role,
        stages: Vec<StageDefinition>,
    ) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            pipeline_version: pipeline_version.into(),
            normalization_version: 0,
            terminal_role,
            stages,
        }
    }

    #[must_use]
    pub fn stage(&self, role: Role) -> Option<&StageDefinition> {
        self.stages.iter().find(|stage| stage.role == role)
    }

    pub fn roles(&self) -> impl Iterator<Item = Role> + '_ {
        self.stages.iter().map(|stage| stage.role)
    }

    /// Roles that list `role` as a direct dependency.
    #[must_use]
    pub fn dependents_of(&self, role: Role) -> Vec<Role> {
        self.stages
            .iter()
            .filter(|stage| stage.depends_on.contains(&role))
            .map(|stage| stage.role)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedPipelineEnvelope {
    pub source_format: String,
    pub source_hash: String,
    pub normalized_hash: String,
    pub pipeline: PipelineDefinition,
    pub normalized_json: Value,
    /// Deterministic dependency order; ties broken by role order.
    pub execution_order: Vec<Role>,
}

/// Load a pipeline YAML file and normalize it.
///
/// # Errors
/// Returns [`AetherError::Configuration`] when the file cannot be read, and the
/// errors of [`normalize_pipeline_yaml`] otherwise.
pub fn load_pipeline_from_path(path: &Path) -> Result<NormalizedPipelineEnvelope, AetherError> {
    let content = fs::read_to_string(path).map_err(|err| {
        AetherError::Configuration(format!(
            "failed to read pipeline file {}: {err}",
            path.display()
        ))
    })?;
    normalize_pipeline_yaml(&content)
}

/// Normalize pipeline YAML into canonical JSON + hash.
///
/// # Errors
/// Returns [`AetherError::Validation`] for malformed YAML or structure and
/// [`AetherError::CyclicDependency`] when the stages form a cycle.
pub fn normalize_pipeline_yaml(yaml: &str) -> Result<NormalizedPipelineEnvelope, AetherError> {
    let definition: PipelineDefinition = serde_yaml::from_str(yaml)
        .map_err(|err| AetherError::Validation(format!("invalid pipeline YAML structure: {err}")))?;
    build_envelope("yaml", hash_bytes(yaml.as_bytes()), definition)
}

/// Normalize an in-memory definition the same way YAML input is normalized.
///
/// # Errors
/// Same as [`normalize_pipeline_yaml`].
pub fn normalize_pipeline(
    definition: PipelineDefinition,
) -> Result<NormalizedPipelineEnvelope, AetherError> {
    let source_json = serde_json::to_value(&definition)
        .map_err(|err| AetherError::Validation(format!("failed to serialize pipeline: {err}")))?;
    let source_hash = hash_json(&source_json)?;
    build_envelope("inline", source_hash, definition)
}

fn build_envelope(
    source_format: &str,
    source_hash: String,
    mut definition: PipelineDefinition,
) -> Result<NormalizedPipelineEnvelope, AetherError> {
    validate_pipeline(&definition)?;
    normalize_definition(&mut definition);

    let execution_order = execution_order(&definition)?;
    let normalized_json = serde_json::to_value(&definition)
        .map_err(|err| AetherError::Validation(format!("failed to serialize pipeline: {err}")))?;
    let normalized_hash = hash_json(&normalized_json)?;

    tracing::debug!(
        pipeline = %definition.pipeline_name,
        stages = definition.stages.len(),
        hash = %normalized_hash,
        "pipeline normalized"
    );

    Ok(NormalizedPipelineEnvelope {
        source_format: source_format.to_string(),
        source_hash,
        normalized_hash,
        pipeline: definition,
        normalized_json,
        execution_order,
    })
}

/// Structural checks plus cycle rejection.
///
/// # Errors
/// Returns [`AetherError::Validation`] for structural problems and
/// [`AetherError::CyclicDependency`] for cycles.
pub fn validate_pipeline(definition: &PipelineDefinition) -> Result<(), AetherError> {
    ensure_non_empty("pipeline_name", &definition.pipeline_name)?;
    ensure_non_empty("pipeline_version", &definition.pipeline_version)?;

    if definition.stages.is_empty() {
        return Err(AetherError::Validation(
            "pipeline MUST declare at least one stage".to_string(),
        ));
    }

    let mut roles = BTreeSet::new();
    for stage in &definition.stages {
        if !roles.insert(stage.role) {
            return Err(AetherError::Validation(format!(
                "duplicate stage role: {}",
                stage.role
            )));
        }
    }

    for stage in &definition.stages {
        for dep in &stage.depends_on {
            if *dep == stage.role {
                return Err(AetherError::CyclicDependency {
                    roles: vec![stage.role],
                });
            }
            if !roles.contains(dep) {
                return Err(AetherError::Validation(format!(
                    "stage {} depends_on unknown stage {dep}",
                    stage.role
                )));
            }
        }
    }

    if !roles.contains(&definition.terminal_role) {
        return Err(AetherError::Validation(format!(
            "terminal_role {} is not a declared stage",
            definition.terminal_role
        )));
    }

    detect_cycle(&definition.stages)
}

fn normalize_definition(definition: &mut PipelineDefinition) {
    definition.normalization_version = NORMALIZATION_VERSION;
    definition.pipeline_name = definition.pipeline_name.trim().to_string();
    definition.pipeline_version = definition.pipeline_version.trim().to_string();
    definition.stages.sort_by_key(|stage| stage.role);
    for stage in &mut definition.stages {
        stage.depends_on.sort();
        stage.depends_on.dedup();
    }
}

/// Reject dependency cycles, naming every role that can never become ready.
///
/// # Errors
/// Returns [`AetherError::CyclicDependency`] listing the blocked roles.
pub fn detect_cycle(stages: &[StageDefinition]) -> Result<(), AetherError> {
    let mut remaining: BTreeMap<Role, BTreeSet<Role>> = stages
        .iter()
        .map(|stage| (stage.role, stage.depends_on.iter().copied().collect()))
        .collect();

    loop {
        let ready: Vec<Role> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(role, _)| *role)
            .collect();
        if ready.is_empty() {
            break;
        }

        for role in ready {
            remaining.remove(&role);
            for deps in remaining.values_mut() {
                deps.remove(&role);
            }
        }
    }

    if remaining.is_empty() {
        return Ok(());
    }

    Err(AetherError::CyclicDependency {
        roles: remaining.into_keys().collect(),
    })
}

/// Kahn order over the stages; among simultaneously ready stages the
/// catalog order of [`Role`] wins.
///
/// # Errors
/// Returns [`AetherError::CyclicDependency`] when no full order exists.
pub fn execution_order(definition: &PipelineDefinition) -> Result<Vec<Role>, AetherError> {
    let mut remaining: BTreeMap<Role, BTreeSet<Role>> = definition
        .stages
        .iter()
        .map(|stage| (stage.role, stage.depends_on.iter().copied().collect()))
        .collect();
    let mut order = Vec::with_capacity(remaining.len());

    while let Some(next) = remaining
        .iter()
        .find(|(_, deps)| deps.is_empty())
        .map(|(role, _)| *role)
    {
        remaining.remove(&next);
        for deps in remaining.values_mut() {
            deps.remove(&next);
        }
        order.push(next);
    }

    if remaining.is_empty() {
        Ok(order)
    } else {
        Err(AetherError::CyclicDependency {
            roles: remaining.into_keys().collect(),
        })
    }
}

/// Derive the default pipeline for a set of output formats.
///
/// `analyze` feeds `recall`; every requested format gets its producing stage
/// after both; `evaluate` waits on every producer and `assemble` closes the
/// graph. An empty format set falls back to a script.
#[must_use]
pub fn standard_pipeline(formats: &BTreeSet<OutputFormat>) -> PipelineDefinition {
    let producers: BTreeSet<Role> = if formats.is_empty() {
        BTreeSet::from([OutputFormat::Script.producing_role()])
    } else {
        formats.iter().map(|format| format.producing_role()).collect()
    };

    let mut stages = vec![
        StageDefinition::new(Role::Analyze, []),
        StageDefinition::new(Role::Recall, [Role::Analyze]),
    ];
    stages.extend(
        producers
            .iter()
            .map(|role| StageDefinition::new(*role, [Role::Analyze, Role::Recall])),
    );
    stages.push(StageDefinition::new(Role::Evaluate, producers.iter().copied()));
    stages.push(StageDefinition::new(
        Role::Assemble,
        std::iter::once(Role::Evaluate).chain(producers.iter().copied()),
    ));

    PipelineDefinition::new(
        STANDARD_PIPELINE_NAME,
        STANDARD_PIPELINE_VERSION,
        Role::Assemble,
        stages,
    )
}
