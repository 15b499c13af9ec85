use std::collections::{BTreeMap, VecDeque};

use aether_domain::{now_utc, AetherError, Role};
use aether_provider::{PromptRefiner, PromptRevision, RefinementRequest};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::RegistryConfig;

/// One capability's prompt lineage and rolling score.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AgentProfile {
    pub role: Role,
    pub meta_prompt: String,
    pub meta_prompt_version: u32,
    /// Append-only; the first entry is the catalog prompt.
    pub revision_history: Vec<PromptRevision>,
    pub performance_score: f64,
    pub usage_count: u64,
    pub recent_outcomes: VecDeque<f64>,
}

impl AgentProfile {
    fn new(role: Role, meta_prompt: String, initial_score: f64) -> Self {
        Self {
            role,
            revision_history: vec![PromptRevision {
                version: 1,
                meta_prompt: meta_prompt.clone(),
                score_at_time: initial_score,
                recorded_at: now_utc(),
            }],
            meta_prompt,
            meta_prompt_version: 1,
            performance_score: initial_score,
            usage_count: 0,
            recent_outcomes: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct ScoreUpdate {
    pub role: Role,
    pub previous_score: f64,
    pub score: f64,
    pub usage_count: u64,
    pub needs_refinement: bool,
    /// Set when a refinement was applied as part of this update.
    pub refined_to_version: Option<u32>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RoleStatus {
    pub role: Role,
    pub performance_score: f64,
    pub usage_count: u64,
    pub meta_prompt_version: u32,
    pub revision_count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RegistryStatus {
    pub roles: Vec<RoleStatus>,
    pub total_usage: u64,
    pub mean_score: f64,
}

/// Process-wide catalog of capabilities. Each role sits behind its own lock so
/// concurrent requests never serialize on unrelated roles.
#[derive(Debug)]
pub struct AgentRegistry {
    config: RegistryConfig,
    profiles: BTreeMap<Role, Mutex<AgentProfile>>,
}

impl AgentRegistry {
    /// Build the catalog with the default meta-prompt for every role.
    ///
    /// # Errors
    /// Returns [`AetherError::Configuration`] when the config is invalid.
    pub fn new(config: RegistryConfig) -> Result<Self, AetherError> {
        Self::with_meta_prompts(config, BTreeMap::new())
    }

    /// Like [`AgentRegistry::new`], replacing the starting prompt of selected roles.
    ///
    /// # Errors
    /// Returns [`AetherError::Configuration`] for an invalid config or an empty override.
    pub fn with_meta_prompts(
        config: RegistryConfig,
        overrides: BTreeMap<Role, String>,
    ) -> Result<Self, AetherError> {
        config.validate()?;
        if let Some((role, _)) = overrides.iter().find(|(_, prompt)| prompt.trim().is_empty()) {
            return Err(AetherError::Configuration(format!(
                "meta-prompt override for {role} MUST be non-empty"
            )));
        }

        let profiles = Role::ALL
            .iter()
            .map(|role| {
                let prompt = overrides
                    .get(role)
                    .cloned()
                    .unwrap_or_else(|| default_meta_prompt(*role));
                (
                    *role,
                    Mutex::new(AgentProfile::new(*role, prompt, config.initial_score)),
                )
            })
            .collect();

        Ok(Self { config, profiles })
    }

    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn slot(&self, role: Role) -> Result<&Mutex<AgentProfile>, AetherError> {
        self.profiles.get(&role).ok_or_else(|| AetherError::NotFound {
            kind: "agent_profile",
            id: role.to_string(),
        })
    }

    /// Copy of the current profile.
    ///
    /// # Errors
    /// Returns [`AetherError::NotFound`] for a role outside the catalog.
    pub fn profile(&self, role: Role) -> Result<AgentProfile, AetherError> {
        Ok(self.slot(role)?.lock().clone())
    }

    /// Current meta-prompt and its version.
    ///
    /// # Errors
    /// Returns [`AetherError::NotFound`] for a role outside the catalog.
    pub fn current_prompt(&self, role: Role) -> Result<(String, u32), AetherError> {
        let profile = self.slot(role)?.lock();
        Ok((profile.meta_prompt.clone(), profile.meta_prompt_version))
    }

    /// EMA update under the role's lock. Does not refine.
    ///
    /// # Errors
    /// Returns [`AetherError::Validation`] when `quality` is outside [0, 1].
    pub fn record_outcome(&self, role: Role, quality: f64) -> Result<ScoreUpdate, AetherError> {
        if !quality.is_finite() || !(0.0..=1.0).contains(&quality) {
            return Err(AetherError::Validation(format!(
                "outcome quality for {role} MUST be in [0.0, 1.0], got {quality}"
            )));
        }

        let alpha = self.config.alpha;
        let mut profile = self.slot(role)?.lock();
        let previous_score = profile.performance_score;
        let score = (previous_score * (1.0 - alpha) + quality * alpha).clamp(0.0, 1.0);
        profile.performance_score = score;
        profile.usage_count = profile.usage_count.saturating_add(1);
        profile.recent_outcomes.push_back(quality);
        while profile.recent_outcomes.len() > self.config.outcome_window {
            profile.recent_outcomes.pop_front();
        }

        let needs_refinement = score < self.config.refinement_threshold
            && profile.usage_count >= self.config.min_samples_before_refine;

        tracing::debug!(%role, previous_score, score, "agent score updated");
        Ok(ScoreUpdate {
            role,
            previous_score,
            score,
            usage_count: profile.usage_count,
            needs_refinement,
            refined_to_version: None,
        })
    }

    /// Ask `refiner` for a new meta-prompt and append it to the history.
    ///
    /// The refiner runs without holding the role lock. If another refinement
    /// landed in the meantime, this one is dropped and `Ok(None)` is returned.
    ///
    /// # Errors
    /// Returns [`AetherError::CollaboratorFailure`] when the refiner fails or
    /// returns an empty prompt. The profile is unchanged in that case.
    pub fn refine(
        &self,
        role: Role,
        refiner: &dyn PromptRefiner,
    ) -> Result<Option<u32>, AetherError> {
        let slot = self.slot(role)?;
        let (request, base_version) = {
            let profile = slot.lock();
            let threshold = self.config.refinement_threshold;
            (
                RefinementRequest {
                    role,
                    history: profile.revision_history.clone(),
                    current_score: profile.performance_score,
                    low_quality_outcomes: profile
                        .recent_outcomes
                        .iter()
                        .copied()
                        .filter(|quality| *quality < threshold)
                        .collect(),
                },
                profile.meta_prompt_version,
            )
        };

        let refined = refiner
            .refine(&request)
            .map_err(|err| AetherError::collaborator(Some(role), "refine", format!("{err:#}")))?;
        if refined.trim().is_empty() {
            return Err(AetherError::collaborator(
                Some(role),
                "refine",
                "refiner returned an empty meta-prompt",
            ));
        }

        let mut profile = slot.lock();
        if profile.meta_prompt_version != base_version {
            tracing::debug!(%role, base_version, "concurrent refinement won; dropping result");
            return Ok(None);
        }

        let version = base_version + 1;
        let score_at_time = profile.performance_score;
        profile.revision_history.push(PromptRevision {
            version,
            meta_prompt: refined.clone(),
            score_at_time,
            recorded_at: now_utc(),
        });
        profile.meta_prompt = refined;
        profile.meta_prompt_version = version;

        tracing::info!(%role, version, score = profile.performance_score, "meta-prompt refined");
        Ok(Some(version))
    }

    /// Refine when `update` asks for it; failures are logged and swallowed.
    pub fn refine_best_effort(&self, update: &ScoreUpdate, refiner: &dyn PromptRefiner) -> Option<u32> {
        if !update.needs_refinement {
            return None;
        }
        match self.refine(update.role, refiner) {
            Ok(version) => version,
            Err(err) => {
                tracing::warn!(role = %update.role, error = %err, "meta-prompt refinement failed; keeping prior prompt");
                None
            }
        }
    }

    /// Record an outcome and, if the score dropped below the threshold, refine
    /// synchronously. Refinement failure never fails the call.
    ///
    /// # Errors
    /// Same as [`AgentRegistry::record_outcome`].
    pub fn score(
        &self,
        role: Role,
        quality: f64,
        refiner: &dyn PromptRefiner,
    ) -> Result<ScoreUpdate, AetherError> {
        let mut update = self.record_outcome(role, quality)?;
        update.refined_to_version = self.refine_best_effort(&update, refiner);
        Ok(update)
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn status(&self) -> RegistryStatus {
        let roles: Vec<RoleStatus> = self
            .profiles
            .values()
            .map(|slot| {
                let profile = slot.lock();
                RoleStatus {
                    role: profile.role,
                    performance_score: profile.performance_score,
                    usage_count: profile.usage_count,
                    meta_prompt_version: profile.meta_prompt_version,
                    revision_count: profile.revision_history.len(),
                }
            })
            .collect();

        let total_usage = roles.iter().map(|role| role.usage_count).sum();
        let mean_score = if roles.is_empty() {
            0.0
        } else {
            roles.iter().map(|role| role.performance_score).sum::<f64>() / roles.len() as f64
        };

        RegistryStatus {
            roles,
            total_usage,
            mean_score,
        }
    }
}

fn role_objective(role: Role) -> &'static str {
    match role {
        Role::Analyze => "Interpret the prompt, its affect and tone, and extract the creative intent",
        Role::Recall => "Select and summarize prior generations that should inform this one",
        Role::Generate => "Write a narrative script that realizes the creative intent",
        Role::VideoSpec => "Produce a shot-by-shot video specification",
        Role::AudioSpec => "Produce a soundtrack and soundscape specification",
        Role::VoiceSpec => "Produce a voice casting and delivery specification",
        Role::Evaluate => "Review generated specifications against the intent and quality bar",
        Role::Assemble => "Combine approved specifications into the final artifact",
    }
}

/// Catalog meta-prompt (situation / problem / actions / result / critique).
#[must_use]
pub fn default_meta_prompt(role: Role) -> String {
    format!(
        "# Meta-Prompt for: {role}

## SITUATION
{objective}.

## PROBLEM
- What needs to be generated?
- What quality standards must be met?
- What context from dependencies and memory applies?

## ACTIONS
1. Read the request and every dependency output
2. Produce the {role} output as structured JSON
3. Flag missing or contradictory inputs

## RESULT
- Output matches the requested formats
- Output is consistent with the affect and tone

## CRITIQUE
- Potential failure modes
- Alternative strategies
- Learning points for future iterations",
        objective = role_objective(role),
    )
}
