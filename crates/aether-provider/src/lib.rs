#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use aether_domain::{hash_json, AffectAnalysis, DateTimeUtc, Role, TaskId};
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// `AnalyzeAffect(prompt)`.
pub trait AffectAnalyzer: Send + Sync {
    fn analyzer_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn analyze(&self, prompt: &str) -> Result<AffectAnalysis>;
}

/// `Embed(text)`; must be deterministic and keep one dimensionality.
pub trait Embedder: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// `ExecuteCapability(role, meta_prompt, inputs)`.
pub trait CapabilityExecutor: Send + Sync {
    fn executor_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn execute(&self, request: &CapabilityRequest) -> Result<CapabilityOutcome>;
}

/// `RefinePrompt(role, history)`.
pub trait PromptRefiner: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn refine(&self, request: &RefinementRequest) -> Result<String>;
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CapabilityRequest {
    pub task_id: TaskId,
    pub role: Role,
    pub meta_prompt: String,
    pub meta_prompt_version: u32,
    /// `{"request": …, "dependencies": {role: payload}}`.
    pub inputs: Value,
}

impl CapabilityRequest {
    /// Hash over everything except the task id, so identical work hashes identically.
    ///
    /// # Errors
    /// Returns an error if the inputs cannot be serialized.
    pub fn input_hash(&self) -> Result<String> {
        let material = json!({
            "role": self.role.as_str(),
            "meta_prompt": self.meta_prompt,
            "meta_prompt_version": self.meta_prompt_version,
            "inputs": self.inputs,
        });
        Ok(hash_json(&material)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityOutcome {
    pub payload: Value,
    /// Self-reported quality in [0, 1]; absent means "succeeded, unrated".
    #[serde(default)]
    pub quality: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptRevision {
    pub version: u32,
    pub meta_prompt: String,
    pub score_at_time: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RefinementRequest {
    pub role: Role,
    pub history: Vec<PromptRevision>,
    pub current_score: f64,
    pub low_quality_outcomes: Vec<f64>,
}

impl RefinementRequest {
    #[must_use]
    pub fn current(&self) -> Option<&PromptRevision> {
        self.history.last()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
enum Emotion {
    Joy,
    Sadness,
    Fear,
    Anger,
    Surprise,
}

impl Emotion {
    const ALL: [Self; 5] = [
        Self::Joy,
        Self::Sadness,
        Self::Fear,
        Self::Anger,
        Self::Surprise,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Joy => "joy",
            Self::Sadness => "sadness",
            Self::Fear => "fear",
            Self::Anger => "anger",
            Self::Surprise => "surprise",
        }
    }
}

const EMOTION_LEXICON: [(&str, Emotion); 11] = [
    ("happy", Emotion::Joy),
    ("joy", Emotion::Joy),
    ("love", Emotion::Joy),
    ("sad", Emotion::Sadness),
    ("sorrow", Emotion::Sadness),
    ("fear", Emotion::Fear),
    ("afraid", Emotion::Fear),
    ("angry", Emotion::Anger),
    ("rage", Emotion::Anger),
    ("surprise", Emotion::Surprise),
    ("wonder", Emotion::Surprise),
];

const TONE_LEXICON: [(&[&str], &str); 3] = [
    (&["magic", "fantasy"], "fantastical"),
    (&["mystery", "secret"], "mysterious"),
    (&["adventure"], "adventurous"),
];

/// Keyword-lexicon affect analysis.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexiconAffectAnalyzer;

impl AffectAnalyzer for LexiconAffectAnalyzer {
    fn analyzer_name(&self) -> &'static str {
        "lexicon"
    }

    #[allow(clippy::cast_precision_loss)]
    fn analyze(&self, prompt: &str) -> Result<AffectAnalysis> {
        let text = prompt.to_lowercase();

        let mut counts: BTreeMap<Emotion, usize> = BTreeMap::new();
        for (word, emotion) in EMOTION_LEXICON {
            if text.contains(word) {
                *counts.entry(emotion).or_default() += 1;
            }
        }

        let tone = TONE_LEXICON
            .iter()
            .find(|(words, _)| words.iter().any(|word| text.contains(word)))
            .map_or("neutral", |(_, tone)| *tone)
            .to_string();

        let total: usize = counts.values().sum();
        if total == 0 {
            return Ok(AffectAnalysis {
                tone,
                ..AffectAnalysis::neutral()
            });
        }

        let share = |emotion: Emotion| {
            counts.get(&emotion).copied().unwrap_or_default() as f64 / total as f64
        };

        let mut primary = Emotion::Joy;
        for emotion in Emotion::ALL {
            if share(emotion) > share(primary) {
                primary = emotion;
            }
        }

        let analysis = AffectAnalysis {
            emotion: primary.as_str().to_string(),
            valence: share(Emotion::Joy) - (share(Emotion::Sadness) + share(Emotion::Fear)),
            arousal: share(Emotion::Anger) + share(Emotion::Surprise),
            tone,
        };
        Ok(analysis.clamped())
    }
}

pub const DEFAULT_EMBEDDING_DIM: usize = 64;

/// Feature-hashed bag of words, L2-normalized.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_EMBEDDING_DIM,
        }
    }
}

impl HashEmbedder {
    /// # Errors
    /// Returns an error when `dimension` is zero.
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(anyhow!("embedding dimension must be >= 1"));
        }
        Ok(Self { dimension })
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

impl Embedder for HashEmbedder {
    #[allow(clippy::cast_possible_truncation)]
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0_f32; self.dimension];
        let lowered = text.to_lowercase();

        for token in lowered
            .split(|ch: char| !ch.is_alphanumeric())
            .filter(|token| !token.is_empty())
        {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]);
            let index = usize::try_from(bucket % self.dimension as u64)?;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector
            .iter()
            .map(|value| f64::from(*value) * f64::from(*value))
            .sum::<f64>()
            .sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value = (f64::from(*value) / norm) as f32;
            }
        }
        Ok(vector)
    }
}

/// Deterministic stand-in executor. Output depends only on the request.
#[derive(Debug)]
pub struct MockCapabilityExecutor {
    adapter_version: String,
    failing_roles: BTreeSet<Role>,
    qualities: BTreeMap<Role, f64>,
    delay: Option<Duration>,
    calls: Mutex<Vec<Role>>,
}

impl Default for MockCapabilityExecutor {
    fn default() -> Self {
        Self {
            adapter_version: "mock.v1".to_string(),
            failing_roles: BTreeSet::new(),
            qualities: BTreeMap::new(),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl MockCapabilityExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failing_on(mut self, roles: impl IntoIterator<Item = Role>) -> Self {
        self.failing_roles.extend(roles);
        self
    }

    #[must_use]
    pub fn with_quality(mut self, role: Role, quality: f64) -> Self {
        self.qualities.insert(role, quality);
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Roles executed so far, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<Role> {
        self.calls.lock().clone()
    }

    fn deterministic_token(&self, request: &CapabilityRequest) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(request.input_hash()?.as_bytes());
        hasher.update(self.adapter_version.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

impl CapabilityExecutor for MockCapabilityExecutor {
    fn executor_name(&self) -> &'static str {
        "mock"
    }

    fn execute(&self, request: &CapabilityRequest) -> Result<CapabilityOutcome> {
        self.calls.lock().push(request.role);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.failing_roles.contains(&request.role) {
            return Err(anyhow!("mock executor configured to fail {}", request.role));
        }

        let token = self.deterministic_token(request)?;
        let short: String = token.chars().take(16).collect();
        let dependencies = request
            .inputs
            .get("dependencies")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let payload = match request.role {
            Role::Assemble => json!({
                "role": request.role.as_str(),
                "artifact_id": format!("artifact:{short}"),
                "components": dependencies,
                "deterministic_token": token,
            }),
            Role::Evaluate => {
                let reviewed: Vec<String> = dependencies
                    .as_object()
                    .map(|map| map.keys().cloned().collect())
                    .unwrap_or_default();
                json!({
                    "role": request.role.as_str(),
                    "reviewed": reviewed,
                    "verdict": "accept",
                    "deterministic_token": token,
                })
            }
            _ => json!({
                "role": request.role.as_str(),
                "message": format!("mock:{}:{short}", request.role),
                "meta_prompt_version": request.meta_prompt_version,
                "deterministic_token": token,
            }),
        };

        Ok(CapabilityOutcome {
            payload,
            quality: self.qualities.get(&request.role).copied(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HttpExecutorConfig {
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub auth_bearer_env: Option<String>,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl HttpExecutorConfig {
    /// # Errors
    /// Returns an error when `params` is not a valid executor config.
    pub fn from_params(params: &Value) -> Result<Self> {
        let config: Self = serde_json::from_value(params.clone())
            .map_err(|err| anyhow!("invalid http executor params: {err}"))?;
        if config.url.trim().is_empty() {
            return Err(anyhow!("http executor requires a non-empty url"));
        }
        Ok(config)
    }
}

/// Posts `{role, meta_prompt, inputs}` as JSON and reads `{payload, quality?}` back.
#[derive(Debug, Clone)]
pub struct HttpJsonExecutor {
    adapter_version: String,
    config: HttpExecutorConfig,
}

impl HttpJsonExecutor {
    #[must_use]
    pub fn new(config: HttpExecutorConfig) -> Self {
        Self {
            adapter_version: "http_json.v1".to_string(),
            config,
        }
    }

    fn bearer_token(&self) -> Result<Option<String>> {
        match &self.config.auth_bearer_env {
            Some(env_name) => std::env::var(env_name).map(Some).map_err(|_| {
                anyhow!("missing env var '{env_name}' required by auth_bearer_env")
            }),
            None => Ok(None),
        }
    }
}

impl CapabilityExecutor for HttpJsonExecutor {
    fn executor_name(&self) -> &'static str {
        "http_json"
    }

    fn execute(&self, request: &CapabilityRequest) -> Result<CapabilityOutcome> {
        let outbound = json!({
            "adapter_version": self.adapter_version,
            "task_id": request.task_id.to_string(),
            "role": request.role.as_str(),
            "meta_prompt": request.meta_prompt,
            "meta_prompt_version": request.meta_prompt_version,
            "inputs": request.inputs,
            "input_hash": request.input_hash()?,
        });

        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .build();
        let mut req = agent
            .request("POST", &self.config.url)
            .set("content-type", "application/json");
        for (header, value) in &self.config.headers {
            req = req.set(header, value);
        }
        if let Some(token) = self.bearer_token()? {
            req = req.set("authorization", &format!("Bearer {token}"));
        }

        let body: Value = match req.send_json(&outbound) {
            Ok(response) => response.into_json()?,
            Err(ureq::Error::Status(code, _)) => {
                return Err(anyhow!("http status {code} from {}", self.config.url));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(anyhow!("http transport failure: {err}"));
            }
        };

        tracing::debug!(role = %request.role, url = %self.config.url, "http capability call completed");

        match body.get("payload") {
            Some(_) => serde_json::from_value(body)
                .map_err(|err| anyhow!("malformed capability response: {err}")),
            None => Ok(CapabilityOutcome {
                payload: body,
                quality: None,
            }),
        }
    }
}

const REFINEMENT_HEADING: &str = "## REFINEMENTS";

/// Appends a refinement section to the current meta-prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplatePromptRefiner;

impl PromptRefiner for TemplatePromptRefiner {
    #[allow(clippy::cast_precision_loss)]
    fn refine(&self, request: &RefinementRequest) -> Result<String> {
        let current = request
            .current()
            .ok_or_else(|| anyhow!("no revision history for role {}", request.role))?;

        let mean_quality = if request.low_quality_outcomes.is_empty() {
            request.current_score
        } else {
            request.low_quality_outcomes.iter().sum::<f64>()
                / request.low_quality_outcomes.len() as f64
        };

        let mut refined = current.meta_prompt.trim_end().to_string();
        refined.push_str("\n\n");
        refined.push_str(REFINEMENT_HEADING);
        refined.push_str(&format!(
            " (v{} -> v{})\n",
            current.version,
            current.version + 1
        ));
        refined.push_str(&format!(
            "- Observed score {:.2}; {} low-quality sample(s), mean {mean_quality:.2}\n",
            request.current_score,
            request.low_quality_outcomes.len()
        ));
        refined.push_str("- Enhanced error handling\n");
        refined.push_str("- Improved task decomposition\n");
        refined.push_str("- Better resource allocation");
        Ok(refined)
    }
}
