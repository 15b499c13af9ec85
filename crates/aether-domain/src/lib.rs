#![forbid(unsafe_code)]

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum AetherError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("memory graph capacity {capacity} exceeded with {resident} resident node(s)")]
    CapacityExceeded { capacity: usize, resident: usize },
    #[error("cyclic dependency detected among roles: {}", join_roles(.roles))]
    CyclicDependency { roles: Vec<Role> },
    #[error("task {role} skipped: dependency {dependency} failed")]
    DependencyFailed { role: Role, dependency: Role },
    #[error("cancelled during {stage}")]
    Cancelled { stage: String },
    #[error("collaborator failure at {stage}{}: {reason}", role_suffix(.role.as_ref()))]
    CollaboratorFailure {
        role: Option<Role>,
        stage: String,
        reason: String,
    },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl AetherError {
    #[must_use]
    pub fn node_not_found(id: NodeId) -> Self {
        Self::NotFound {
            kind: "memory node",
            id: id.to_string(),
        }
    }

    #[must_use]
    pub fn collaborator(role: Option<Role>, stage: &str, reason: impl Into<String>) -> Self {
        Self::CollaboratorFailure {
            role,
            stage: stage.to_string(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn cancelled(stage: &str) -> Self {
        Self::Cancelled {
            stage: stage.to_string(),
        }
    }

    /// Stable machine-readable code for reports and logs.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::CyclicDependency { .. } => "cyclic_dependency",
            Self::DependencyFailed { .. } => "dependency_failed",
            Self::Cancelled { .. } => "cancelled",
            Self::CollaboratorFailure { .. } => "collaborator_failure",
            Self::Validation(_) => "validation",
            Self::Configuration(_) => "configuration",
            Self::Persistence(_) => "persistence",
        }
    }
}

fn join_roles(roles: &[Role]) -> String {
    roles
        .iter()
        .map(|role| role.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn role_suffix(role: Option<&Role>) -> String {
    role.map(|role| format!(" (role {role})")).unwrap_or_default()
}

/// Monotonically assigned memory node identifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "mem-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TaskId(pub Ulid);

impl TaskId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SubmissionId(pub Ulid);

impl SubmissionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SubmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SubmissionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Temporal,
    Semantic,
    Causal,
}

impl EdgeKind {
    pub const ALL: [Self; 3] = [Self::Temporal, Self::Semantic, Self::Causal];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temporal => "temporal",
            Self::Semantic => "semantic",
            Self::Causal => "causal",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "temporal" => Some(Self::Temporal),
            "semantic" => Some(Self::Semantic),
            "causal" => Some(Self::Causal),
            _ => None,
        }
    }
}

impl Display for EdgeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    #[default]
    Text,
    Image,
    Audio,
    Video,
    Multimodal,
}

impl Modality {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Multimodal => "multimodal",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            "multimodal" => Some(Self::Multimodal),
            _ => None,
        }
    }
}

/// Fixed capability catalog served by the agent registry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Analyze,
    Recall,
    Generate,
    VideoSpec,
    AudioSpec,
    VoiceSpec,
    Evaluate,
    Assemble,
}

impl Role {
    pub const ALL: [Self; 8] = [
        Self::Analyze,
        Self::Recall,
        Self::Generate,
        Self::VideoSpec,
        Self::AudioSpec,
        Self::VoiceSpec,
        Self::Evaluate,
        Self::Assemble,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Recall => "recall",
            Self::Generate => "generate",
            Self::VideoSpec => "video_spec",
            Self::AudioSpec => "audio_spec",
            Self::VoiceSpec => "voice_spec",
            Self::Evaluate => "evaluate",
            Self::Assemble => "assemble",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "analyze" => Some(Self::Analyze),
            "recall" => Some(Self::Recall),
            "generate" => Some(Self::Generate),
            "video_spec" => Some(Self::VideoSpec),
            "audio_spec" => Some(Self::AudioSpec),
            "voice_spec" => Some(Self::VoiceSpec),
            "evaluate" => Some(Self::Evaluate),
            "assemble" => Some(Self::Assemble),
            _ => None,
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Video,
    Audio,
    Voice,
    Script,
}

impl OutputFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Voice => "voice",
            Self::Script => "script",
        }
    }

    /// Capability that produces this format's specification.
    #[must_use]
    pub fn producing_role(self) -> Role {
        match self {
            Self::Video => Role::VideoSpec,
            Self::Audio => Role::AudioSpec,
            Self::Voice => Role::VoiceSpec,
            Self::Script => Role::Generate,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Forward-only lifecycle: `pending -> ready -> running -> {done | failed}`.
    /// Any non-terminal task may also fail directly (dependency failure, cancellation).
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, Self::Ready)
            | (Self::Ready, Self::Running)
            | (Self::Running, Self::Done)
            | (Self::Pending | Self::Ready | Self::Running, Self::Failed) => true,
            _ => false,
        }
    }
}

/// Output schema of the affect collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AffectAnalysis {
    pub emotion: String,
    pub valence: f64,
    pub arousal: f64,
    pub tone: String,
}

impl AffectAnalysis {
    #[must_use]
    pub fn neutral() -> Self {
        Self {
            emotion: "neutral".to_string(),
            valence: 0.0,
            arousal: 0.0,
            tone: "neutral".to_string(),
        }
    }

    /// Clamp valence to [-1, 1] and arousal to [0, 1].
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.valence = self.valence.clamp(-1.0, 1.0);
        self.arousal = self.arousal.clamp(0.0, 1.0);
        self
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`AetherError::Validation`] when formatting fails.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String, AetherError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| AetherError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`AetherError::Validation`] when parsing fails or the offset is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<DateTimeUtc, AetherError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| AetherError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(AetherError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns [`AetherError::Validation`] if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String, AetherError> {
    let bytes = serde_json::to_vec(value)
        .map_err(|err| AetherError::Validation(format!("failed to serialize JSON: {err}")))?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns [`AetherError::Validation`] when the value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<(), AetherError> {
    if value.trim().is_empty() {
        return Err(AetherError::Validation(format!(
            "{field_name} MUST be non-empty"
        )));
    }
    Ok(())
}

/// Ensure a configuration value sits in the closed unit interval.
///
/// # Errors
/// Returns [`AetherError::Configuration`] when the value is outside [0, 1] or not finite.
pub fn ensure_unit_interval(field_name: &str, value: f64) -> Result<(), AetherError> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(AetherError::Configuration(format!(
            "{field_name} MUST be in [0.0, 1.0]"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_never_transition() {
        for next in [
            TaskStatus::Pending,
            TaskStatus::Ready,
            TaskStatus::Running,
            TaskStatus::Done,
            TaskStatus::Failed,
        ] {
            assert!(!TaskStatus::Done.can_transition_to(next));
            assert!(!TaskStatus::Failed.can_transition_to(next));
        }
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Ready));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Ready));
    }

    #[test]
    fn role_names_round_trip() {
        for role in Role::ALL {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("orchestrator"), None);
    }

    #[test]
    fn error_messages_carry_context() {
        let err = AetherError::CyclicDependency {
            roles: vec![Role::Analyze, Role::Generate],
        };
        assert_eq!(
            err.to_string(),
            "cyclic dependency detected among roles: analyze, generate"
        );

        let err = AetherError::collaborator(Some(Role::Generate), "execute", "boom");
        assert_eq!(
            err.to_string(),
            "collaborator failure at execute (role generate): boom"
        );
        assert_eq!(err.code(), "collaborator_failure");
    }

    #[test]
    fn rfc3339_requires_utc() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00Z").is_ok());
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
    }

    #[test]
    fn unit_interval_rejects_nan() {
        assert!(ensure_unit_interval("alpha", 0.3).is_ok());
        assert!(ensure_unit_interval("alpha", f64::NAN).is_err());
        assert!(ensure_unit_interval("alpha", 1.5).is_err());
    }
}
