#![forbid(unsafe_code)]

mod config;
mod facade;
mod registry;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aether_domain::{
    now_utc, AetherError, DateTimeUtc, Role, SubmissionId, TaskId, TaskStatus,
};
use aether_pipeline::{normalize_pipeline, PipelineDefinition};
use aether_provider::{CapabilityExecutor, CapabilityOutcome, CapabilityRequest, PromptRefiner};
use crossbeam_channel::{unbounded, RecvTimeoutError};
use serde_json::{json, Map, Value};

pub use config::{AetherConfig, FacadeConfig, OrchestratorConfig, RegistryConfig};
pub use facade::{GenerationFacade, GenerationRequest, GenerationResult, RecalledMemory};
pub use registry::{
    default_meta_prompt, AgentProfile, AgentRegistry, RegistryStatus, RoleStatus, ScoreUpdate,
};

/// Shared cancellation flag for one in-flight submission.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub pipeline: PipelineDefinition,
    /// Passed to every task as `inputs.request`.
    pub payload: Value,
}

impl SubmitRequest {
    #[must_use]
    pub fn new(pipeline: PipelineDefinition, payload: Value) -> Self {
        Self { pipeline, payload }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: TaskId,
    pub role: Role,
    pub depends_on: Vec<TaskId>,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<AetherError>,
    pub quality: Option<f64>,
    pub meta_prompt_version: Option<u32>,
    pub started_at: Option<DateTimeUtc>,
    pub ended_at: Option<DateTimeUtc>,
}

impl TaskRecord {
    fn new(role: Role) -> Self {
        Self {
            id: TaskId::new(),
            role,
            depends_on: Vec::new(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            quality: None,
            meta_prompt_version: None,
            started_at: None,
            ended_at: None,
        }
    }

    fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(now_utc());
        }
        true
    }

    fn fail(&mut self, error: AetherError) -> bool {
        if !self.transition(TaskStatus::Failed) {
            return false;
        }
        self.error = Some(error);
        true
    }
}

/// Final state of every task of one submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionReport {
    pub submission_id: SubmissionId,
    pub pipeline_name: String,
    pub pipeline_hash: String,
    pub terminal_role: Role,
    /// Dependency order.
    pub tasks: Vec<TaskRecord>,
    pub cancelled: bool,
    /// First task that failed on its own (not by propagation).
    pub first_failure: Option<AetherError>,
    pub started_at: DateTimeUtc,
    pub ended_at: DateTimeUtc,
}

impl SubmissionReport {
    #[must_use]
    pub fn task(&self, role: Role) -> Option<&TaskRecord> {
        self.tasks.iter().find(|task| task.role == role)
    }

    #[must_use]
    pub fn terminal(&self) -> Option<&TaskRecord> {
        self.task(self.terminal_role)
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.terminal()
            .is_some_and(|task| task.status == TaskStatus::Done)
    }

    #[must_use]
    pub fn output(&self) -> Option<&Value> {
        self.terminal()
            .filter(|task| task.status == TaskStatus::Done)
            .and_then(|task| task.result.as_ref())
    }

    #[must_use]
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|task| task.status == status).count()
    }

    /// Reason the submission failed, or `None` when the terminal task is done.
    #[must_use]
    pub fn failure(&self) -> Option<AetherError> {
        if self.succeeded() {
            return None;
        }
        if self.cancelled {
            return Some(AetherError::cancelled("submit"));
        }
        self.first_failure
            .clone()
            .or_else(|| self.terminal().and_then(|task| task.error.clone()))
            .or_else(|| {
                Some(AetherError::NotFound {
                    kind: "task",
                    id: self.terminal_role.to_string(),
                })
            })
    }

    /// # Errors
    /// Returns [`SubmissionReport::failure`] when the terminal task did not finish.
    pub fn into_result(self) -> Result<Self, AetherError> {
        match self.failure() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

struct Job {
    index: usize,
    request: CapabilityRequest,
}

struct Completion {
    index: usize,
    outcome: Result<CapabilityOutcome, AetherError>,
}

/// Scheduler-owned task table. Only the scheduling thread mutates it.
struct RunState {
    tasks: Vec<TaskRecord>,
    deps: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    first_failure: Option<AetherError>,
    cancelled: bool,
}

impl RunState {
    fn promote_ready(&mut self) {
        let ready: Vec<usize> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(index, task)| {
                task.status == TaskStatus::Pending
                    && self.deps[*index]
                        .iter()
                        .all(|dep| self.tasks[*dep].status == TaskStatus::Done)
            })
            .map(|(index, _)| index)
            .collect();
        for index in ready {
            self.tasks[index].transition(TaskStatus::Ready);
        }
    }

    fn next_ready(&self) -> Option<usize> {
        self.tasks
            .iter()
            .position(|task| task.status == TaskStatus::Ready)
    }

    fn dependency_inputs(&self, index: usize) -> Value {
        let mut dependencies = Map::new();
        for dep in &self.deps[index] {
            let task = &self.tasks[*dep];
            dependencies.insert(
                task.role.as_str().to_string(),
                task.result.clone().unwrap_or(Value::Null),
            );
        }
        Value::Object(dependencies)
    }

    fn fail_task(&mut self, index: usize, error: AetherError) {
        if !self.tasks[index].fail(error.clone()) {
            return;
        }
        tracing::warn!(role = %self.tasks[index].role, error = %error, "task failed");
        self.first_failure.get_or_insert(error);
        self.fail_dependents(index);
    }

    fn fail_dependents(&mut self, failed: usize) {
        let mut queue = VecDeque::from([failed]);
        while let Some(parent) = queue.pop_front() {
            let dependency = self.tasks[parent].role;
            for child in self.dependents[parent].clone() {
                let role = self.tasks[child].role;
                if self.tasks[child].fail(AetherError::DependencyFailed { role, dependency }) {
                    tracing::debug!(%role, %dependency, "task failed by dependency");
                    queue.push_back(child);
                }
            }
        }
    }

    fn cancel_remaining(&mut self) {
        self.cancelled = true;
        for task in &mut self.tasks {
            if task.status != TaskStatus::Done {
                let stage = format!("task {}", task.role);
                task.fail(AetherError::cancelled(&stage));
            }
        }
    }

    fn fail_unfinished(&mut self, reason: &str) {
        for task in &mut self.tasks {
            if !task.status.is_terminal() {
                task.fail(AetherError::collaborator(Some(task.role), "schedule", reason));
            }
        }
    }
}

/// Dependency-aware executor for one pipeline per submission.
pub struct Orchestrator<'a> {
    config: OrchestratorConfig,
    registry: &'a AgentRegistry,
    executor: &'a dyn CapabilityExecutor,
    refiner: &'a dyn PromptRefiner,
}

impl<'a> Orchestrator<'a> {
    /// # Errors
    /// Returns [`AetherError::Configuration`] when the config is invalid.
    pub fn new(
        config: OrchestratorConfig,
        registry: &'a AgentRegistry,
        executor: &'a dyn CapabilityExecutor,
        refiner: &'a dyn PromptRefiner,
    ) -> Result<Self, AetherError> {
        config.validate()?;
        Ok(Self {
            config,
            registry,
            executor,
            refiner,
        })
    }

    #[must_use]
    pub fn registry(&self) -> &'a AgentRegistry {
        self.registry
    }

    /// Update a role's score and refine its meta-prompt if it fell below the
    /// threshold. Refinement failure is logged, never returned.
    ///
    /// # Errors
    /// Returns [`AetherError::Validation`] for an out-of-range quality.
    pub fn score(&self, role: Role, outcome_quality: f64) -> Result<ScoreUpdate, AetherError> {
        self.registry.score(role, outcome_quality, self.refiner)
    }

    /// Run the pipeline and fail unless its terminal task completes.
    ///
    /// # Errors
    /// Returns [`AetherError::CyclicDependency`] or [`AetherError::Validation`]
    /// before anything runs, [`AetherError::Cancelled`] when cancelled, and the
    /// first task failure when the terminal task does not complete.
    pub fn submit(
        &self,
        request: SubmitRequest,
        cancel: &CancellationToken,
    ) -> Result<SubmissionReport, AetherError> {
        self.execute(request, cancel)?.into_result()
    }

    /// Run the pipeline and return every task's final state, even when the
    /// terminal task failed.
    ///
    /// # Errors
    /// Only up-front rejection: [`AetherError::CyclicDependency`] or
    /// [`AetherError::Validation`] for a malformed pipeline.
    #[allow(clippy::too_many_lines)]
    pub fn execute(
        &self,
        request: SubmitRequest,
        cancel: &CancellationToken,
    ) -> Result<SubmissionReport, AetherError> {
        let envelope = normalize_pipeline(request.pipeline)?;
        let submission_id = SubmissionId::new();
        let started_at = now_utc();

        let order = &envelope.execution_order;
        let index_of: BTreeMap<Role, usize> = order
            .iter()
            .enumerate()
            .map(|(index, role)| (*role, index))
            .collect();
        let deps: Vec<Vec<usize>> = order
            .iter()
            .map(|role| {
                envelope
                    .pipeline
                    .stage(*role)
                    .map(|stage| {
                        stage
                            .depends_on
                            .iter()
                            .filter_map(|dep| index_of.get(dep).copied())
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); order.len()];
        for (index, dep_indexes) in deps.iter().enumerate() {
            for dep in dep_indexes {
                dependents[*dep].push(index);
            }
        }

        let mut tasks: Vec<TaskRecord> = order.iter().map(|role| TaskRecord::new(*role)).collect();
        let ids: Vec<TaskId> = tasks.iter().map(|task| task.id).collect();
        for (task, dep_indexes) in tasks.iter_mut().zip(&deps) {
            task.depends_on = dep_indexes.iter().map(|dep| ids[*dep]).collect();
        }

        tracing::info!(
            %submission_id,
            pipeline = %envelope.pipeline.pipeline_name,
            tasks = tasks.len(),
            "submission started"
        );

        let mut run = RunState {
            tasks,
            deps,
            dependents,
            first_failure: None,
            cancelled: false,
        };

        let workers = self.config.parallelism.min(order.len()).max(1);
        let poll = Duration::from_millis(self.config.cancel_poll_ms);
        let (job_tx, job_rx) = unbounded::<Job>();
        let (done_tx, done_rx) = unbounded::<Completion>();

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                let executor = self.executor;
                let cancel = cancel.clone();
                scope.spawn(move || {
                    for job in &job_rx {
                        let role = job.request.role;
                        let outcome = if cancel.is_cancelled() {
                            Err(AetherError::cancelled(&format!("task {role}")))
                        } else {
                            executor.execute(&job.request).map_err(|err| {
                                AetherError::collaborator(Some(role), "execute", format!("{err:#}"))
                            })
                        };
                        if done_tx
                            .send(Completion {
                                index: job.index,
                                outcome,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            }
            drop(done_tx);

            let mut in_flight = 0_usize;
            loop {
                if cancel.is_cancelled() {
                    run.cancel_remaining();
                    tracing::info!(%submission_id, "submission cancelled");
                    break;
                }

                run.promote_ready();
                while in_flight < workers {
                    let Some(index) = run.next_ready() else {
                        break;
                    };
                    match self.build_job(&run, index, &request.payload) {
                        Ok(job) => {
                            let task = &mut run.tasks[index];
                            task.transition(TaskStatus::Running);
                            task.started_at = Some(now_utc());
                            task.meta_prompt_version = Some(job.request.meta_prompt_version);
                            tracing::debug!(role = %task.role, task_id = %task.id, "task dispatched");
                            if job_tx.send(job).is_err() {
                                run.fail_task(
                                    index,
                                    AetherError::collaborator(
                                        Some(run.tasks[index].role),
                                        "dispatch",
                                        "worker pool is gone",
                                    ),
                                );
                                continue;
                            }
                            in_flight += 1;
                        }
                        Err(err) => run.fail_task(index, err),
                    }
                }

                if in_flight == 0 {
                    break;
                }

                match done_rx.recv_timeout(poll) {
                    Ok(completion) => {
                        in_flight -= 1;
                        if let Some(update) = self.finish_task(&mut run, completion) {
                            let registry = self.registry;
                            let refiner = self.refiner;
                            scope.spawn(move || {
                                registry.refine_best_effort(&update, refiner);
                            });
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        run.fail_unfinished("capability workers exited early");
                        break;
                    }
                }
            }
            drop(job_tx);
        });

        run.fail_unfinished("task never became ready");

        let report = SubmissionReport {
            submission_id,
            pipeline_name: envelope.pipeline.pipeline_name.clone(),
            pipeline_hash: envelope.normalized_hash.clone(),
            terminal_role: envelope.pipeline.terminal_role,
            tasks: run.tasks,
            cancelled: run.cancelled,
            first_failure: run.first_failure,
            started_at,
            ended_at: now_utc(),
        };

        tracing::info!(
            %submission_id,
            succeeded = report.succeeded(),
            done = report.count(TaskStatus::Done),
            failed = report.count(TaskStatus::Failed),
            "submission finished"
        );
        Ok(report)
    }

    fn build_job(
        &self,
        run: &RunState,
        index: usize,
        payload: &Value,
    ) -> Result<Job, AetherError> {
        let task = &run.tasks[index];
        let (meta_prompt, meta_prompt_version) = self.registry.current_prompt(task.role)?;
        Ok(Job {
            index,
            request: CapabilityRequest {
                task_id: task.id,
                role: task.role,
                meta_prompt,
                meta_prompt_version,
                inputs: json!({
                    "request": payload,
                    "dependencies": run.dependency_inputs(index),
                }),
            },
        })
    }

    /// Apply one completion and score the role. Returns the score update when
    /// the role needs refinement.
    fn finish_task(&self, run: &mut RunState, completion: Completion) -> Option<ScoreUpdate> {
        let index = completion.index;
        if run.tasks[index].status != TaskStatus::Running {
            return None;
        }
        let role = run.tasks[index].role;

        let quality = match completion.outcome {
            Ok(outcome) => {
                let reported = outcome
                    .quality
                    .filter(|quality| quality.is_finite())
                    .map(|quality| quality.clamp(0.0, 1.0));
                let task = &mut run.tasks[index];
                task.result = Some(outcome.payload);
                task.quality = reported;
                task.transition(TaskStatus::Done);
                tracing::debug!(%role, task_id = %task.id, "task done");
                reported.unwrap_or(1.0)
            }
            Err(err) => {
                run.fail_task(index, err);
                0.0
            }
        };

        match self.registry.record_outcome(role, quality) {
            Ok(update) if update.needs_refinement => Some(update),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(%role, error = %err, "failed to record task outcome");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aether_pipeline::{standard_pipeline, StageDefinition};
    use aether_provider::{MockCapabilityExecutor, RefinementRequest, TemplatePromptRefiner};
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn must<T>(result: Result<T, AetherError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn registry() -> AgentRegistry {
        must(AgentRegistry::new(RegistryConfig::default()))
    }

    fn linear_pipeline() -> PipelineDefinition {
        PipelineDefinition::new(
            "linear",
            "v1",
            Role::Assemble,
            vec![
                StageDefinition::new(Role::Analyze, []),
                StageDefinition::new(Role::Generate, [Role::Analyze]),
                StageDefinition::new(Role::Evaluate, [Role::Generate]),
                StageDefinition::new(Role::Assemble, [Role::Evaluate]),
            ],
        )
    }

    struct FailingRefiner;

    impl PromptRefiner for FailingRefiner {
        fn refine(&self, _request: &RefinementRequest) -> anyhow::Result<String> {
            Err(anyhow::anyhow!("refiner offline"))
        }
    }

    #[test]
    fn linear_pipeline_runs_every_stage_in_order() {
        let registry = registry();
        let executor = MockCapabilityExecutor::new();
        let orchestrator = must(Orchestrator::new(
            OrchestratorConfig::default(),
            &registry,
            &executor,
            &TemplatePromptRefiner,
        ));

        let report = must(orchestrator.submit(
            SubmitRequest::new(linear_pipeline(), json!({"prompt": "A dragon awakens"})),
            &CancellationToken::new(),
        ));

        assert!(report.succeeded());
        assert_eq!(report.count(TaskStatus::Done), 4);
        assert_eq!(
            executor.calls(),
            vec![Role::Analyze, Role::Generate, Role::Evaluate, Role::Assemble]
        );
        let output = must_some(report.output());
        assert!(output["components"].get("evaluate").is_some());

        let generate = must_some(report.task(Role::Generate));
        let analyze = must_some(report.task(Role::Analyze));
        assert_eq!(generate.depends_on, vec![analyze.id]);
        assert_eq!(generate.meta_prompt_version, Some(1));
    }

    #[test]
    fn cycle_is_rejected_before_dispatch() {
        let registry = registry();
        let executor = MockCapabilityExecutor::new();
        let orchestrator = must(Orchestrator::new(
            OrchestratorConfig::default(),
            &registry,
            &executor,
            &TemplatePromptRefiner,
        ));
        let pipeline = PipelineDefinition::new(
            "loop",
            "v1",
            Role::Assemble,
            vec![
                StageDefinition::new(Role::Analyze, [Role::Generate]),
                StageDefinition::new(Role::Generate, [Role::Analyze]),
                StageDefinition::new(Role::Assemble, [Role::Generate]),
            ],
        );

        let result = orchestrator.submit(SubmitRequest::new(pipeline, json!({})), &CancellationToken::new());
        assert!(matches!(result, Err(AetherError::CyclicDependency { .. })));
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn generate_failure_propagates_and_spares_independent_branch() {
        let registry = registry();
        let executor = MockCapabilityExecutor::new().failing_on([Role::Generate]);
        let orchestrator = must(Orchestrator::new(
            OrchestratorConfig::default(),
            &registry,
            &executor,
            &TemplatePromptRefiner,
        ));
        let pipeline = PipelineDefinition::new(
            "branching",
            "v1",
            Role::Assemble,
            vec![
                StageDefinition::new(Role::Analyze, []),
                StageDefinition::new(Role::Generate, [Role::Analyze]),
                StageDefinition::new(Role::AudioSpec, [Role::Analyze]),
                StageDefinition::new(Role::Evaluate, [Role::Generate]),
                StageDefinition::new(Role::Assemble, [Role::Evaluate, Role::AudioSpec]),
            ],
        );

        let report = must(orchestrator.execute(
            SubmitRequest::new(pipeline.clone(), json!({})),
            &CancellationToken::new(),
        ));
        let evaluate = must_some(report.task(Role::Evaluate));
        assert_eq!(evaluate.status, TaskStatus::Failed);
        assert_eq!(
            evaluate.error,
            Some(AetherError::DependencyFailed {
                role: Role::Evaluate,
                dependency: Role::Generate,
            })
        );
        assert_eq!(
            must_some(report.task(Role::Assemble)).error,
            Some(AetherError::DependencyFailed {
                role: Role::Assemble,
                dependency: Role::Evaluate,
            })
        );
        assert_eq!(must_some(report.task(Role::AudioSpec)).status, TaskStatus::Done);
        assert!(!executor.calls().contains(&Role::Evaluate));

        let submitted = orchestrator.submit(SubmitRequest::new(pipeline, json!({})), &CancellationToken::new());
        match submitted {
            Err(AetherError::CollaboratorFailure { role, stage, .. }) => {
                assert_eq!(role, Some(Role::Generate));
                assert_eq!(stage, "execute");
            }
            other => panic!("expected collaborator failure, got {other:?}"),
        }
    }

    #[test]
    fn cancelled_token_fails_every_task_without_dispatch() {
        let registry = registry();
        let executor = MockCapabilityExecutor::new();
        let orchestrator = must(Orchestrator::new(
            OrchestratorConfig::default(),
            &registry,
            &executor,
            &TemplatePromptRefiner,
        ));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = must(orchestrator.execute(SubmitRequest::new(linear_pipeline(), json!({})), &cancel));
        assert!(report.cancelled);
        assert_eq!(report.count(TaskStatus::Failed), 4);
        assert!(report
            .tasks
            .iter()
            .all(|task| matches!(task.error, Some(AetherError::Cancelled { .. }))));
        assert!(executor.calls().is_empty());
        assert!(matches!(report.failure(), Some(AetherError::Cancelled { .. })));
    }

    #[test]
    fn cancellation_mid_flight_marks_unfinished_tasks_cancelled() {
        let registry = registry();
        let executor = MockCapabilityExecutor::new().with_delay(Duration::from_millis(80));
        let orchestrator = must(Orchestrator::new(
            OrchestratorConfig {
                parallelism: 2,
                cancel_poll_ms: 5,
            },
            &registry,
            &executor,
            &TemplatePromptRefiner,
        ));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let report = std::thread::scope(|scope| {
            scope.spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                trigger.cancel();
            });
            must(orchestrator.execute(SubmitRequest::new(linear_pipeline(), json!({})), &cancel))
        });

        assert!(report.cancelled);
        assert!(!report.succeeded());
        for task in &report.tasks {
            assert!(task.status == TaskStatus::Done || task.status == TaskStatus::Failed);
            if task.status == TaskStatus::Failed {
                assert!(matches!(task.error, Some(AetherError::Cancelled { .. })));
            }
        }
    }

    #[test]
    fn independent_stages_run_concurrently() {
        let registry = registry();
        let executor = MockCapabilityExecutor::new().with_delay(Duration::from_millis(60));
        let orchestrator = must(Orchestrator::new(
            OrchestratorConfig {
                parallelism: 4,
                cancel_poll_ms: 5,
            },
            &registry,
            &executor,
            &TemplatePromptRefiner,
        ));
        let formats = BTreeSet::from([
            aether_domain::OutputFormat::Video,
            aether_domain::OutputFormat::Audio,
            aether_domain::OutputFormat::Voice,
        ]);

        let started = std::time::Instant::now();
        let report = must(orchestrator.submit(
            SubmitRequest::new(standard_pipeline(&formats), json!({})),
            &CancellationToken::new(),
        ));
        let elapsed = started.elapsed();

        assert!(report.succeeded());
        assert_eq!(report.count(TaskStatus::Done), 7);
        // 5 dependency levels; fully serial execution would take 7 delays.
        assert!(elapsed < Duration::from_millis(60 * 7), "took {elapsed:?}");
    }

    #[derive(Default)]
    struct PeakTrackingExecutor {
        in_flight: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
    }

    impl CapabilityExecutor for PeakTrackingExecutor {
        fn executor_name(&self) -> &'static str {
            "peak-tracking"
        }

        fn execute(&self, request: &CapabilityRequest) -> anyhow::Result<CapabilityOutcome> {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(40));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(CapabilityOutcome {
                payload: json!({ "role": request.role.as_str() }),
                quality: None,
            })
        }
    }

    #[test]
    fn parallelism_caps_tasks_in_flight() {
        let registry = registry();
        let executor = PeakTrackingExecutor::default();
        let orchestrator = must(Orchestrator::new(
            OrchestratorConfig {
                parallelism: 2,
                cancel_poll_ms: 5,
            },
            &registry,
            &executor,
            &TemplatePromptRefiner,
        ));
        let fan_out = [Role::Recall, Role::Generate, Role::VideoSpec, Role::AudioSpec, Role::VoiceSpec];
        let mut stages = vec![StageDefinition::new(Role::Analyze, [])];
        stages.extend(fan_out.iter().map(|role| StageDefinition::new(*role, [Role::Analyze])));
        stages.push(StageDefinition::new(Role::Assemble, fan_out));
        let pipeline = PipelineDefinition::new("fan_out", "v1", Role::Assemble, stages);

        let report = must(orchestrator.submit(
            SubmitRequest::new(pipeline, json!({})),
            &CancellationToken::new(),
        ));

        assert!(report.succeeded());
        assert_eq!(report.count(TaskStatus::Done), 7);
        assert_eq!(executor.peak.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn low_quality_outcomes_trigger_refinement() {
        let registry = registry();
        let executor = MockCapabilityExecutor::new().with_quality(Role::Generate, 0.0);
        let orchestrator = must(Orchestrator::new(
            OrchestratorConfig::default(),
            &registry,
            &executor,
            &TemplatePromptRefiner,
        ));

        let report = must(orchestrator.submit(
            SubmitRequest::new(linear_pipeline(), json!({})),
            &CancellationToken::new(),
        ));
        assert!(report.succeeded());
        assert_eq!(must_some(report.task(Role::Generate)).quality, Some(0.0));

        let profile = must(registry.profile(Role::Generate));
        assert!((profile.performance_score - 0.35).abs() < 1e-9);
        assert_eq!(profile.revision_history.len(), 2);
        assert_eq!(profile.meta_prompt_version, 2);
        assert!(profile.meta_prompt.contains("## REFINEMENTS"));

        let analyze = must(registry.profile(Role::Analyze));
        assert_eq!(analyze.revision_history.len(), 1);
        assert!((analyze.performance_score - 0.65).abs() < 1e-9);
    }

    #[test]
    fn refinement_failure_is_swallowed() {
        let registry = registry();
        let executor = MockCapabilityExecutor::new().with_quality(Role::Analyze, 0.0);
        let orchestrator = must(Orchestrator::new(
            OrchestratorConfig::default(),
            &registry,
            &executor,
            &FailingRefiner,
        ));

        let report = must(orchestrator.submit(
            SubmitRequest::new(linear_pipeline(), json!({})),
            &CancellationToken::new(),
        ));
        assert!(report.succeeded());
        let profile = must(registry.profile(Role::Analyze));
        assert_eq!(profile.meta_prompt_version, 1);
        assert_eq!(profile.revision_history.len(), 1);

        let update = must(orchestrator.score(Role::Analyze, 0.0));
        assert!(update.needs_refinement);
        assert_eq!(update.refined_to_version, None);
    }

    #[test]
    fn refine_appends_revision_with_score_at_refinement() {
        let registry = registry();
        let update = must(registry.record_outcome(Role::Recall, 0.0));
        assert!((update.score - 0.35).abs() < 1e-9);

        assert_eq!(must(registry.refine(Role::Recall, &TemplatePromptRefiner)), Some(2));
        let profile = must(registry.profile(Role::Recall));
        let latest = must_some(profile.revision_history.last());
        assert_eq!(latest.version, 2);
        assert!((latest.score_at_time - 0.35).abs() < 1e-9);
        assert_eq!(latest.meta_prompt, profile.meta_prompt);
        assert_eq!(profile.meta_prompt_version, 2);
    }

    #[test]
    fn score_rejects_out_of_range_quality() {
        let registry = registry();
        assert!(matches!(
            registry.score(Role::Evaluate, 1.5, &TemplatePromptRefiner),
            Err(AetherError::Validation(_))
        ));
        assert!(registry.score(Role::Evaluate, f64::NAN, &TemplatePromptRefiner).is_err());
    }

    #[test]
    fn registry_status_reports_every_role() {
        let registry = registry();
        let _ = must(registry.score(Role::Generate, 1.0, &TemplatePromptRefiner));
        let status = registry.status();
        assert_eq!(status.roles.len(), Role::ALL.len());
        assert_eq!(status.total_usage, 1);
        let generate = must_some(status.roles.iter().find(|role| role.role == Role::Generate));
        assert_eq!(generate.revision_count, 1);
        assert!(generate.performance_score > 0.5);
    }

    #[test]
    fn concurrent_score_updates_are_not_lost() {
        let registry = registry();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        let _ = must(registry.record_outcome(Role::Recall, 1.0));
                    }
                });
            }
        });
        let profile = must(registry.profile(Role::Recall));
        assert_eq!(profile.usage_count, 200);
        assert!(profile.performance_score > 0.999);
        assert_eq!(profile.recent_outcomes.len(), 10);
    }

    #[test]
    fn outcome_window_keeps_most_recent_samples() {
        let registry = must(AgentRegistry::new(RegistryConfig {
            outcome_window: 3,
            ..RegistryConfig::default()
        }));
        for quality in [0.1, 0.2, 0.3, 0.4] {
            let _ = must(registry.record_outcome(Role::Assemble, quality));
        }
        let profile = must(registry.profile(Role::Assemble));
        assert_eq!(profile.recent_outcomes, VecDeque::from([0.2, 0.3, 0.4]));
    }

    #[test]
    fn meta_prompt_overrides_must_be_non_empty() {
        let overrides = BTreeMap::from([(Role::Generate, "   ".to_string())]);
        assert!(matches!(
            AgentRegistry::with_meta_prompts(RegistryConfig::default(), overrides),
            Err(AetherError::Configuration(_))
        ));

        let custom = BTreeMap::from([(Role::Generate, "Write haiku only.".to_string())]);
        let registry = must(AgentRegistry::with_meta_prompts(RegistryConfig::default(), custom));
        assert_eq!(must(registry.current_prompt(Role::Generate)).0, "Write haiku only.");
        assert!(must(registry.current_prompt(Role::Assemble)).0.contains("## SITUATION"));
    }

    #[test]
    fn config_loads_from_yaml_and_json() {
        let yaml = r"
memory:
  capacity: 128
registry:
  alpha: 0.5
orchestrator:
  parallelism: 2
";
        let config = must(AetherConfig::from_yaml_str(yaml));
        assert_eq!(config.memory.capacity, 128);
        assert!((config.registry.alpha - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.orchestrator.parallelism, 2);
        assert_eq!(config.facade, FacadeConfig::default());

        let json = r#"{"orchestrator": {"parallelism": 0}}"#;
        assert!(matches!(
            AetherConfig::from_json_str(json),
            Err(AetherError::Configuration(_))
        ));
        assert!(AetherConfig::from_yaml_str("unknown_section: {}").is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_repeated_perfect_outcomes_drive_score_up(
            initial in 0.0_f64..1.0,
            alpha in 0.05_f64..1.0,
            rounds in 1_usize..40,
        ) {
            let registry = must(AgentRegistry::new(RegistryConfig {
                alpha,
                initial_score: initial,
                ..RegistryConfig::default()
            }));
            let mut previous = initial;
            for _ in 0..rounds {
                let update = must(registry.record_outcome(Role::Evaluate, 1.0));
                prop_assert!(update.score >= previous);
                prop_assert!(update.score <= 1.0);
                previous = update.score;
            }
            prop_assert!(1.0 - previous <= (1.0 - initial) * (1.0 - alpha).powi(i32::try_from(rounds).unwrap_or(i32::MAX)) + 1e-9);
        }
    }
}
