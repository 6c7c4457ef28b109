//! Workflow orchestrator: the instance state machine and execution loop.
//!
//! Walks the step graph for one instance, checkpointing state before and
//! after every step so a suspended or interrupted run resumes from durable
//! state. Each instance executes as an independent sequential task; the
//! instance record is the unit of optimistic concurrency, so racing writers
//! (a cancel against a running loop, two resume calls) are serialized by the
//! store's revision check rather than by locks.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Value, json};
use stepwise_types::error::RepositoryError;
use stepwise_types::instance::{
    InstanceError, InstanceStatus, StepExecution, StepExecutionStatus, WorkflowInstance,
};
use stepwise_types::workflow::{
    ErrorAction, JoinCondition, ParallelBranch, StepConfig, WorkflowDefinition, WorkflowStep,
};
use stepwise_types::approval::{ApprovalRequest, ApprovalStatus};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::expression::{lookup_path, resolve_object, resolve_value};
use crate::repository::{ApprovalStore, DefinitionStore, DocumentStore, EventSink, HttpCaller, InstanceStore};
use crate::step::{
    ApprovalGate, OrchestrationSignal, StepFailure, StepResult, StepRunner, determine_next_step,
};

const DEFAULT_MAX_STEPS: u32 = 1_000;
const DEFAULT_MAX_SUBWORKFLOW_DEPTH: u32 = 5;

// ---------------------------------------------------------------------------
// Configuration and errors
// ---------------------------------------------------------------------------

/// Engine-level limits and the environment exposed to expressions.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Safety valve when a definition does not set `settings.max_steps`.
    pub max_steps: u32,
    /// Nesting cap for `wait_for_completion` sub-workflows.
    pub max_subworkflow_depth: u32,
    /// Values visible to `{{env.*}}`; never read from the process.
    pub env: HashMap<String, String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_subworkflow_depth: DEFAULT_MAX_SUBWORKFLOW_DEPTH,
            env: HashMap::new(),
        }
    }
}

/// Failures of the orchestrator's public operations. Step-level failures
/// never surface here; they are absorbed by the error policy and recorded on
/// the instance.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("workflow not found")]
    WorkflowNotFound,

    #[error("workflow has no active version")]
    NoActiveVersion,

    #[error("workflow version {0} not found")]
    VersionNotFound(u32),

    #[error("instance not found")]
    InstanceNotFound,

    #[error("required variable '{0}' was not supplied")]
    MissingRequiredVariable(String),

    #[error("cannot resume an instance in status '{0}'")]
    NotResumable(String),

    #[error("cannot cancel an instance in status '{0}'")]
    NotCancellable(String),

    #[error("cannot pause an instance in status '{0}'")]
    NotPausable(String),

    #[error("approval for step '{0}' is still pending")]
    ApprovalPending(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

fn status_name(status: InstanceStatus) -> String {
    // The snake_case wire name, without quotes.
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{status:?}"))
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator<DS, IS, AS, H, E, D> {
    definitions: Arc<DS>,
    instances: Arc<IS>,
    approvals: Arc<AS>,
    runner: StepRunner<H, E, D>,
    cancellations: Arc<DashMap<Uuid, CancellationToken>>,
    config: Arc<OrchestratorConfig>,
}

impl<DS, IS, AS, H, E, D> Clone for Orchestrator<DS, IS, AS, H, E, D> {
    fn clone(&self) -> Self {
        Self {
            definitions: self.definitions.clone(),
            instances: self.instances.clone(),
            approvals: self.approvals.clone(),
            runner: self.runner.clone(),
            cancellations: self.cancellations.clone(),
            config: self.config.clone(),
        }
    }
}

/// What a checkpoint write concluded.
enum Checkpoint {
    Written,
    /// A concurrent writer won; its view of the instance is returned.
    Superseded(WorkflowInstance),
}

impl<DS, IS, AS, H, E, D> Orchestrator<DS, IS, AS, H, E, D>
where
    DS: DefinitionStore + 'static,
    IS: InstanceStore + 'static,
    AS: ApprovalStore + 'static,
    H: HttpCaller + 'static,
    E: EventSink + 'static,
    D: DocumentStore + 'static,
{
    pub fn new(
        definitions: Arc<DS>,
        instances: Arc<IS>,
        approvals: Arc<AS>,
        runner: StepRunner<H, E, D>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            definitions,
            instances,
            approvals,
            runner,
            cancellations: Arc::new(DashMap::new()),
            config: Arc::new(config),
        }
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Start an instance of the workflow's active version and run it until
    /// it completes, fails, or suspends.
    pub async fn start(
        &self,
        workflow_id: &Uuid,
        input: Value,
        initiated_by: Option<String>,
    ) -> Result<WorkflowInstance, OrchestratorError> {
        let definition = self
            .definitions
            .get_active(workflow_id)
            .await?
            .ok_or(OrchestratorError::NoActiveVersion)?;
        let instance = build_instance(&definition, input, initiated_by)?;
        self.instances.create(&instance).await?;
        info!(
            instance_id = %instance.instance_id,
            workflow_id = %definition.workflow_id,
            version = definition.version,
            "instance created"
        );
        self.execute(instance, Arc::new(definition), 0).await
    }

    /// Resume a waiting or paused instance, merging `event_data` (an object)
    /// into its variables first.
    pub async fn resume(
        &self,
        instance_id: &Uuid,
        event_data: Value,
    ) -> Result<WorkflowInstance, OrchestratorError> {
        let mut instance = self
            .instances
            .get(instance_id)
            .await?
            .ok_or(OrchestratorError::InstanceNotFound)?;
        if !matches!(
            instance.status,
            InstanceStatus::Waiting | InstanceStatus::Paused
        ) {
            return Err(OrchestratorError::NotResumable(status_name(instance.status)));
        }
        let definition = Arc::new(self.load_pinned(&instance).await?);

        let Some(current_id) = instance.current_step_id.clone() else {
            return Err(OrchestratorError::NotResumable(
                "instance has no current step".to_string(),
            ));
        };

        // An approval-gated wait only advances once its request resolved.
        if let Some(request) = self.approvals.find_for_step(instance_id, &current_id).await? {
            match request.status {
                ApprovalStatus::Pending => {
                    return Err(OrchestratorError::ApprovalPending(current_id));
                }
                ApprovalStatus::Rejected | ApprovalStatus::Expired => {
                    let code = match request.status {
                        ApprovalStatus::Expired => "APPROVAL_EXPIRED",
                        _ => "APPROVAL_REJECTED",
                    };
                    self.fail_instance(
                        &mut instance,
                        Some(current_id.clone()),
                        StepFailure::new(code, format!("approval for step '{current_id}' was not granted")),
                    )
                    .await?;
                    return Ok(instance);
                }
                ApprovalStatus::Approved | ApprovalStatus::Reassigned => {}
            }
        }

        if let Value::Object(map) = event_data.clone() {
            for (key, value) in map {
                instance.variables.insert(key, value);
            }
        }

        // A suspended wait step advances past itself; a paused instance
        // re-enters at its current step.
        let waiting_exec = instance
            .step_executions
            .iter()
            .rposition(|e| e.step_id == current_id && e.status == StepExecutionStatus::Waiting);
        if let Some(idx) = waiting_exec {
            instance.step_executions[idx].complete(Some(event_data));
            instance.completed_step_ids.push(current_id.clone());
            let step = definition
                .step(&current_id)
                .ok_or_else(|| OrchestratorError::NotResumable(format!("step '{current_id}' no longer exists")))?;
            let ctx = ExecutionContext::from_instance(&instance, &self.config.env);
            instance.current_step_id =
                determine_next_step(step, &definition.steps, &ctx, &StepResult::ok(None));
            if instance.current_step_id.is_none() {
                return self.complete_instance(instance).await;
            }
        }

        info!(instance_id = %instance.instance_id, "resuming instance");
        self.execute(instance, definition, 0).await
    }

    /// Pause a running or waiting instance. A loop mid-step notices the
    /// revision bump at its next checkpoint and stops.
    pub async fn pause(&self, instance_id: &Uuid) -> Result<WorkflowInstance, OrchestratorError> {
        self.transition_guarded(instance_id, |instance| {
            if !matches!(
                instance.status,
                InstanceStatus::Running | InstanceStatus::Waiting | InstanceStatus::Pending
            ) {
                return Err(OrchestratorError::NotPausable(status_name(instance.status)));
            }
            instance.status = InstanceStatus::Paused;
            Ok(())
        })
        .await
    }

    /// Cancel an instance. Valid from pending/running/waiting/paused; the
    /// synthetic `CANCELLED` last error distinguishes it from a failure, and
    /// a later resume is rejected.
    pub async fn cancel(
        &self,
        instance_id: &Uuid,
        reason: Option<String>,
    ) -> Result<WorkflowInstance, OrchestratorError> {
        let cancelled = self
            .transition_guarded(instance_id, |instance| {
                if instance.is_terminal() {
                    return Err(OrchestratorError::NotCancellable(status_name(instance.status)));
                }
                instance.status = InstanceStatus::Cancelled;
                instance.completed_at = Some(Utc::now());
                instance.last_error = Some(InstanceError {
                    step_id: instance.current_step_id.clone(),
                    code: "CANCELLED".to_string(),
                    message: reason.clone().unwrap_or_else(|| "cancelled by caller".to_string()),
                    at: Utc::now(),
                });
                Ok(())
            })
            .await?;
        if let Some(token) = self.cancellations.get(instance_id) {
            token.cancel();
        }
        info!(instance_id = %instance_id, "instance cancelled");
        Ok(cancelled)
    }

    /// Read-modify-write with a bounded number of revision-conflict retries.
    async fn transition_guarded(
        &self,
        instance_id: &Uuid,
        mutate: impl Fn(&mut WorkflowInstance) -> Result<(), OrchestratorError>,
    ) -> Result<WorkflowInstance, OrchestratorError> {
        for _ in 0..3 {
            let mut instance = self
                .instances
                .get(instance_id)
                .await?
                .ok_or(OrchestratorError::InstanceNotFound)?;
            mutate(&mut instance)?;
            instance.updated_at = Utc::now();
            match self.instances.update(&instance).await {
                Ok(()) => {
                    instance.revision += 1;
                    return Ok(instance);
                }
                Err(RepositoryError::Conflict(_)) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(OrchestratorError::Repository(RepositoryError::Conflict(
            "instance update kept conflicting".to_string(),
        )))
    }

    // -----------------------------------------------------------------------
    // Execution loop
    // -----------------------------------------------------------------------

    fn execute<'a>(
        &'a self,
        instance: WorkflowInstance,
        definition: Arc<WorkflowDefinition>,
        depth: u32,
    ) -> Pin<Box<dyn Future<Output = Result<WorkflowInstance, OrchestratorError>> + Send + 'a>>
    {
        Box::pin(async move {
            let instance_id = instance.instance_id;
            let token = CancellationToken::new();
            self.cancellations.insert(instance_id, token.clone());
            let result = self.run_walk(instance, definition, depth, &token).await;
            self.cancellations.remove(&instance_id);
            result
        })
    }

    async fn run_walk(
        &self,
        mut instance: WorkflowInstance,
        definition: Arc<WorkflowDefinition>,
        depth: u32,
        token: &CancellationToken,
    ) -> Result<WorkflowInstance, OrchestratorError> {
        instance.status = InstanceStatus::Running;
        if instance.started_at.is_none() {
            instance.started_at = Some(Utc::now());
        }
        if let Some(latest) = self.checkpoint(&mut instance).await? {
            return Ok(latest);
        }

        let Some(first) = definition.first_step() else {
            return self.complete_instance(instance).await;
        };
        let mut current = instance
            .current_step_id
            .clone()
            .unwrap_or_else(|| first.id.clone());

        let budget = definition.settings.max_steps.unwrap_or(self.config.max_steps);
        let mut executed = 0u32;

        loop {
            if token.is_cancelled() {
                return self.latest(&instance.instance_id).await;
            }
            if let Some(max_secs) = definition.settings.max_duration_secs {
                let elapsed = instance
                    .started_at
                    .map(|t| (Utc::now() - t).num_seconds())
                    .unwrap_or(0);
                if elapsed >= 0 && elapsed as u64 > max_secs {
                    instance.status = InstanceStatus::TimedOut;
                    instance.completed_at = Some(Utc::now());
                    instance.last_error = Some(InstanceError {
                        step_id: Some(current),
                        code: "INSTANCE_TIMEOUT".to_string(),
                        message: format!("instance exceeded its {max_secs}s limit"),
                        at: Utc::now(),
                    });
                    if let Some(latest) = self.checkpoint(&mut instance).await? {
                        return Ok(latest);
                    }
                    return Ok(instance);
                }
            }
            executed += 1;
            if executed > budget {
                self.fail_instance(
                    &mut instance,
                    Some(current),
                    StepFailure::new(
                        "MAX_STEPS_EXCEEDED",
                        format!("walk exceeded the {budget}-step safety valve"),
                    ),
                )
                .await?;
                return Ok(instance);
            }

            let Some(step) = definition.step(&current) else {
                self.fail_instance(
                    &mut instance,
                    Some(current.clone()),
                    StepFailure::new("STEP_NOT_FOUND", format!("step '{current}' does not exist")),
                )
                .await?;
                return Ok(instance);
            };
            instance.current_step_id = Some(step.id.clone());

            let outcome = self
                .run_step_with_policy(&mut instance, step, token)
                .await?;
            let result = match outcome {
                StepOutcome::Superseded(latest) => return Ok(latest),
                StepOutcome::Fail(failure) => {
                    let step_id = step.id.clone();
                    self.fail_instance(&mut instance, Some(step_id), failure)
                        .await?;
                    return Ok(instance);
                }
                StepOutcome::Goto(target) => {
                    debug!(from = %step.id, to = %target, "error policy reroute");
                    current = target;
                    continue;
                }
                StepOutcome::Proceed(result) => result,
            };

            // Orchestration-level step kinds run after the dispatcher hands
            // control back.
            let result = match &result.signal {
                Some(OrchestrationSignal::WaitEvent { event_name }) => {
                    return self
                        .suspend(&mut instance, &step.id, json!({ "event": event_name }), None)
                        .await;
                }
                Some(OrchestrationSignal::WaitApproval(gate)) => {
                    let gate = gate.clone();
                    return self
                        .suspend(
                            &mut instance,
                            &step.id,
                            json!({ "approval": gate.prompt }),
                            Some(gate),
                        )
                        .await;
                }
                Some(OrchestrationSignal::Delay { seconds }) => {
                    let seconds = *seconds;
                    self.finish_execution(&mut instance, &result, Some(json!({ "delayed_secs": seconds })));
                    if let Some(latest) = self.checkpoint(&mut instance).await? {
                        return Ok(latest);
                    }
                    tokio::select! {
                        _ = token.cancelled() => return self.latest(&instance.instance_id).await,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(seconds)) => {}
                    }
                    StepResult::ok(None)
                }
                Some(OrchestrationSignal::Parallel) => {
                    self.run_parallel(&instance, step, &definition, token).await
                }
                Some(OrchestrationSignal::Loop) => {
                    self.run_loop_step(&mut instance, step, &definition, token)
                        .await?
                }
                Some(OrchestrationSignal::Subworkflow) => {
                    self.run_subworkflow(&instance, step, depth).await?
                }
                Some(OrchestrationSignal::RetryRoute {
                    step_id,
                    max_attempts,
                }) => {
                    // Reroute while the target has headroom; fall through to
                    // normal routing once attempts are spent.
                    let runs = instance.execution_count(step_id) as u32;
                    let reroute = runs < *max_attempts;
                    let target = step_id.clone();
                    let mut done = StepResult::ok(Some(json!({ "rerouted": reroute })));
                    if reroute {
                        done = done.with_next_step(Some(target));
                    }
                    done
                }
                Some(OrchestrationSignal::Compensate { steps }) => {
                    let steps = steps.clone();
                    let outputs = self
                        .run_linear(&mut instance, &definition, &steps, token, false)
                        .await?;
                    match outputs {
                        LinearOutcome::Superseded(latest) => return Ok(latest),
                        LinearOutcome::Done(outputs) => {
                            StepResult::ok(Some(Value::Array(outputs)))
                        }
                        LinearOutcome::Failed(failure) => {
                            // Compensation is best effort; run_linear only
                            // reports a failure when asked to stop on one.
                            StepResult::ok(Some(json!({ "compensation_error": failure.message })))
                        }
                    }
                }
                None => result,
            };

            // An orchestration-kind failure consults the policy without the
            // retry arm (its work is not idempotent to re-run blindly).
            if !result.success {
                let failure = result
                    .error
                    .clone()
                    .unwrap_or_else(|| StepFailure::new("STEP_EXECUTION_ERROR", "step failed"));
                if let Some(exec) = instance
                    .step_executions
                    .iter_mut()
                    .rev()
                    .find(|e| e.status == StepExecutionStatus::Running)
                {
                    exec.fail(&failure.code, &failure.message);
                }
                match step.on_error.as_ref().map(|p| p.action) {
                    Some(ErrorAction::Skip) => {
                        if let Some(exec) = instance
                            .step_executions
                            .iter_mut()
                            .rev()
                            .find(|e| e.step_id == step.id)
                        {
                            exec.status = StepExecutionStatus::Skipped;
                        }
                    }
                    Some(ErrorAction::Goto) => {
                        if let Some(target) = step
                            .on_error
                            .as_ref()
                            .and_then(|p| p.fallback_step_id.clone())
                        {
                            current = target;
                            continue;
                        }
                        let step_id = step.id.clone();
                        self.fail_instance(&mut instance, Some(step_id), failure).await?;
                        return Ok(instance);
                    }
                    _ => {
                        let step_id = step.id.clone();
                        self.fail_instance(&mut instance, Some(step_id), failure).await?;
                        return Ok(instance);
                    }
                }
            } else {
                self.finish_execution(&mut instance, &result, None);
            }

            if let Some(latest) = self.checkpoint(&mut instance).await? {
                return Ok(latest);
            }

            if result.should_terminate {
                return self.complete_instance(instance).await;
            }

            let ctx = ExecutionContext::from_instance(&instance, &self.config.env);
            match determine_next_step(step, &definition.steps, &ctx, &result) {
                Some(next) => current = next,
                None => return self.complete_instance(instance).await,
            }
        }
    }

    /// Run one step, applying the skip/retry/goto/fail error policy. The
    /// retry arm re-executes with fixed or exponential capped backoff, each
    /// attempt on its own execution record carrying the prior-failure count.
    async fn run_step_with_policy(
        &self,
        instance: &mut WorkflowInstance,
        step: &WorkflowStep,
        token: &CancellationToken,
    ) -> Result<StepOutcome, OrchestratorError> {
        let mut retry_count = 0u32;
        loop {
            let mut exec = StepExecution::started(&step.id, None);
            exec.retry_count = retry_count;
            instance.step_executions.push(exec);
            if let Some(latest) = self.checkpoint(instance).await? {
                return Ok(StepOutcome::Superseded(latest));
            }

            let ctx = ExecutionContext::from_instance(instance, &self.config.env);
            debug!(step_id = %step.id, kind = step.config.kind(), retry_count, "executing step");
            let result = self.runner.execute_step(step, &ctx).await;

            if result.success {
                return Ok(StepOutcome::Proceed(result));
            }

            let failure = result
                .error
                .clone()
                .unwrap_or_else(|| StepFailure::new("STEP_EXECUTION_ERROR", "step failed"));
            let idx = instance.step_executions.len() - 1;
            instance.step_executions[idx].fail(&failure.code, &failure.message);
            warn!(step_id = %step.id, code = %failure.code, retry_count, "step failed");
            if let Some(latest) = self.checkpoint(instance).await? {
                return Ok(StepOutcome::Superseded(latest));
            }

            let Some(policy) = &step.on_error else {
                return Ok(StepOutcome::Fail(failure));
            };
            match policy.action {
                ErrorAction::Skip => {
                    let idx = instance.step_executions.len() - 1;
                    instance.step_executions[idx].status = StepExecutionStatus::Skipped;
                    debug!(step_id = %step.id, "error policy skip");
                    let mut result = StepResult::ok(None);
                    result.skipped = true;
                    return Ok(StepOutcome::Proceed(result));
                }
                ErrorAction::Retry => {
                    let retry = policy
                        .retry_policy
                        .clone()
                        .unwrap_or_else(fallback_retry_policy);
                    if retry_count + 1 >= retry.max_attempts || !retry.retries(&failure.code) {
                        return Ok(StepOutcome::Fail(failure));
                    }
                    let delay = retry.delay_seconds(retry_count);
                    info!(step_id = %step.id, attempt = retry_count + 2, delay_secs = delay, "retrying step");
                    if delay > 0 {
                        tokio::select! {
                            _ = token.cancelled() => {
                                return Ok(StepOutcome::Superseded(
                                    self.latest(&instance.instance_id).await?,
                                ));
                            }
                            _ = tokio::time::sleep(std::time::Duration::from_secs(delay)) => {}
                        }
                    }
                    retry_count += 1;
                }
                ErrorAction::Goto => match &policy.fallback_step_id {
                    Some(target) => return Ok(StepOutcome::Goto(target.clone())),
                    None => return Ok(StepOutcome::Fail(failure)),
                },
                ErrorAction::Compensate | ErrorAction::Fail => {
                    return Ok(StepOutcome::Fail(failure));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Orchestration step kinds
    // -----------------------------------------------------------------------

    /// Fan out parallel branches against context snapshots, join, and merge
    /// variable updates in declared branch order so results are
    /// deterministic regardless of completion order.
    async fn run_parallel(
        &self,
        instance: &WorkflowInstance,
        step: &WorkflowStep,
        definition: &WorkflowDefinition,
        token: &CancellationToken,
    ) -> StepResult {
        let StepConfig::Parallel { branches, join } = &step.config else {
            return StepResult::failed("STEP_EXECUTION_ERROR", "not a parallel step");
        };
        if branches.is_empty() {
            return StepResult::ok(Some(json!({})));
        }

        let snapshot = ExecutionContext::from_instance(instance, &self.config.env);
        let mut prepared = Vec::with_capacity(branches.len());
        for branch in branches {
            match resolve_branch_steps(branch, definition) {
                Ok(steps) => prepared.push((branch.id.clone(), steps)),
                Err(missing) => {
                    return StepResult::failed(
                        "STEP_NOT_FOUND",
                        format!("branch '{}' references unknown step '{missing}'", branch.id),
                    );
                }
            }
        }

        let mut runs: Vec<Option<BranchRun>> = (0..prepared.len()).map(|_| None).collect();
        if definition.settings.parallel_execution {
            let mut set = JoinSet::new();
            for (index, (branch_id, steps)) in prepared.into_iter().enumerate() {
                let runner = self.runner.clone();
                let ctx = snapshot.clone();
                let branch_token = token.clone();
                set.spawn(async move {
                    (index, run_branch(runner, branch_id, steps, ctx, branch_token).await)
                });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((index, run)) => runs[index] = Some(run),
                    Err(join_err) => {
                        error!(%join_err, "parallel branch task panicked");
                    }
                }
            }
        } else {
            for (index, (branch_id, steps)) in prepared.into_iter().enumerate() {
                runs[index] = Some(
                    run_branch(
                        self.runner.clone(),
                        branch_id,
                        steps,
                        snapshot.clone(),
                        token.clone(),
                    )
                    .await,
                );
            }
        }

        let runs: Vec<BranchRun> = runs
            .into_iter()
            .map(|r| {
                r.unwrap_or(BranchRun {
                    id: "<panicked>".to_string(),
                    success: false,
                    updates: HashMap::new(),
                    outputs: serde_json::Map::new(),
                    error: Some("branch task panicked".to_string()),
                })
            })
            .collect();

        let successes = runs.iter().filter(|r| r.success).count();
        let needed = match join {
            JoinCondition::All => runs.len(),
            JoinCondition::Any => 1,
            JoinCondition::Count { n } => (*n as usize).min(runs.len()).max(1),
        };

        let mut output = serde_json::Map::new();
        for run in &runs {
            output.insert(
                run.id.clone(),
                json!({
                    "success": run.success,
                    "outputs": run.outputs,
                    "error": run.error,
                }),
            );
        }

        if successes >= needed {
            let mut updates = HashMap::new();
            for run in &runs {
                if run.success {
                    for (name, value) in &run.updates {
                        updates.insert(name.clone(), value.clone());
                    }
                }
            }
            StepResult::ok(Some(Value::Object(output))).with_variables(updates)
        } else {
            let failed: Vec<&str> = runs
                .iter()
                .filter(|r| !r.success)
                .map(|r| r.id.as_str())
                .collect();
            let mut result = StepResult::failed(
                "PARALLEL_JOIN_FAILED",
                format!(
                    "join needed {needed} of {} branches, got {successes} (failed: {})",
                    runs.len(),
                    failed.join(", ")
                ),
            );
            result.output = Some(Value::Object(output));
            result
        }
    }

    /// Sequential loop over a resolved collection. Iterations mutate the
    /// instance directly (single writer inside an instance), binding the
    /// item/index variables for the body and removing them afterwards.
    async fn run_loop_step(
        &self,
        instance: &mut WorkflowInstance,
        step: &WorkflowStep,
        definition: &WorkflowDefinition,
        token: &CancellationToken,
    ) -> Result<StepResult, OrchestratorError> {
        let StepConfig::Loop {
            collection,
            item_variable,
            index_variable,
            max_iterations,
            parallelism: _,
            body,
        } = &step.config
        else {
            return Ok(StepResult::failed("STEP_EXECUTION_ERROR", "not a loop step"));
        };

        let ctx = ExecutionContext::from_instance(instance, &self.config.env);
        let resolved = match resolve_value(collection, &ctx) {
            Ok(value) => value,
            Err(err) => return Ok(StepResult::failed("TRANSFORM_ERROR", err.to_string())),
        };
        let Value::Array(items) = resolved else {
            return Ok(StepResult::failed(
                "LOOP_CONFIG_ERROR",
                format!("collection '{collection}' did not resolve to an array"),
            ));
        };

        let limit = max_iterations
            .map(|m| m as usize)
            .unwrap_or(usize::MAX)
            .min(items.len());
        let mut iteration_outputs = Vec::with_capacity(limit);
        let mut failure: Option<StepFailure> = None;

        for (index, item) in items.into_iter().take(limit).enumerate() {
            instance
                .variables
                .insert(item_variable.clone(), item);
            if let Some(index_var) = index_variable {
                instance.variables.insert(index_var.clone(), json!(index));
            }
            match self
                .run_linear(instance, definition, body, token, true)
                .await?
            {
                LinearOutcome::Superseded(_) => {
                    // A concurrent writer owns the record now; the walk's
                    // next checkpoint conflicts and returns its state.
                    break;
                }
                LinearOutcome::Done(outputs) => {
                    iteration_outputs.push(Value::Array(outputs));
                }
                LinearOutcome::Failed(step_failure) => {
                    failure = Some(step_failure);
                    break;
                }
            }
        }

        instance.variables.remove(item_variable);
        if let Some(index_var) = index_variable {
            instance.variables.remove(index_var);
        }

        match failure {
            Some(failure) => {
                let mut result = StepResult::failed(failure.code, failure.message);
                result.output = Some(Value::Array(iteration_outputs));
                Ok(result)
            }
            None => Ok(StepResult::ok(Some(Value::Array(iteration_outputs)))),
        }
    }

    /// Invoke a child workflow. Inline (bounded depth) when waiting for
    /// completion, detached spawn otherwise.
    async fn run_subworkflow(
        &self,
        instance: &WorkflowInstance,
        step: &WorkflowStep,
        depth: u32,
    ) -> Result<StepResult, OrchestratorError> {
        let StepConfig::Subworkflow {
            workflow_id,
            version,
            input_mapping,
            output_mapping,
            wait_for_completion,
        } = &step.config
        else {
            return Ok(StepResult::failed("STEP_EXECUTION_ERROR", "not a subworkflow step"));
        };

        let child_definition = match version {
            Some(v) => self.definitions.get_version(workflow_id, *v).await?,
            None => self.definitions.get_active(workflow_id).await?,
        };
        let Some(child_definition) = child_definition else {
            return Ok(StepResult::failed(
                "SUBWORKFLOW_NOT_FOUND",
                format!("workflow '{workflow_id}' has no runnable version"),
            ));
        };

        let ctx = ExecutionContext::from_instance(instance, &self.config.env);
        let mut child_input = serde_json::Map::new();
        for (name, template) in input_mapping {
            match resolve_object(template, &ctx) {
                Ok(value) => {
                    child_input.insert(name.clone(), value);
                }
                Err(err) => return Ok(StepResult::failed("TRANSFORM_ERROR", err.to_string())),
            }
        }

        let child = match build_instance(
            &child_definition,
            Value::Object(child_input),
            Some(format!("instance:{}", instance.instance_id)),
        ) {
            Ok(child) => child,
            Err(err) => {
                return Ok(StepResult::failed("SUBWORKFLOW_INPUT_ERROR", err.to_string()));
            }
        };
        self.instances.create(&child).await?;
        let child_id = child.instance_id;

        if !*wait_for_completion {
            let this = self.clone();
            let definition = Arc::new(child_definition);
            tokio::spawn(async move {
                if let Err(err) = this.execute(child, definition, 0).await {
                    error!(instance_id = %child_id, %err, "detached sub-workflow failed");
                }
            });
            return Ok(StepResult::ok(Some(json!({
                "instanceId": child_id,
                "detached": true,
            }))));
        }

        if depth + 1 > self.config.max_subworkflow_depth {
            return Ok(StepResult::failed(
                "SUBWORKFLOW_DEPTH_EXCEEDED",
                format!(
                    "nesting deeper than {} is not allowed",
                    self.config.max_subworkflow_depth
                ),
            ));
        }

        // Async recursion needs the boxed future.
        let done: WorkflowInstance = Box::pin(self.execute(
            child,
            Arc::new(child_definition),
            depth + 1,
        ))
        .await?;

        if done.status != InstanceStatus::Completed {
            return Ok(StepResult::failed(
                "SUBWORKFLOW_FAILED",
                format!(
                    "child instance {} ended {}",
                    done.instance_id,
                    status_name(done.status)
                ),
            ));
        }

        // Output mapping reads the child's final variables.
        let child_root = Value::Object(
            done.variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let mut updates = HashMap::new();
        for (parent_var, expr) in output_mapping {
            let value = match expr.strip_prefix("$.") {
                Some(path) => lookup_path(&child_root, path),
                None => lookup_path(&child_root, expr),
            };
            updates.insert(parent_var.clone(), value);
        }

        Ok(StepResult::ok(Some(json!({
            "instanceId": done.instance_id,
            "status": "completed",
        })))
        .with_variables(updates))
    }

    /// Execute a list of step ids in order against the live instance.
    /// Suspension-kind steps are not allowed here; delays sleep inline.
    async fn run_linear(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        step_ids: &[String],
        token: &CancellationToken,
        stop_on_failure: bool,
    ) -> Result<LinearOutcome, OrchestratorError> {
        let mut outputs = Vec::with_capacity(step_ids.len());
        for step_id in step_ids {
            let Some(step) = definition.step(step_id) else {
                if stop_on_failure {
                    return Ok(LinearOutcome::Failed(StepFailure::new(
                        "STEP_NOT_FOUND",
                        format!("step '{step_id}' does not exist"),
                    )));
                }
                continue;
            };

            instance
                .step_executions
                .push(StepExecution::started(&step.id, None));
            let ctx = ExecutionContext::from_instance(instance, &self.config.env);
            let mut result = self.runner.execute_step(step, &ctx).await;

            if let Some(OrchestrationSignal::Delay { seconds }) = &result.signal {
                let seconds = *seconds;
                tokio::select! {
                    _ = token.cancelled() => {
                        return Ok(LinearOutcome::Superseded(
                            self.latest(&instance.instance_id).await?,
                        ));
                    }
                    _ = tokio::time::sleep(std::time::Duration::from_secs(seconds)) => {}
                }
                result = StepResult::ok(Some(json!({ "delayed_secs": seconds })));
            } else if result.signal.is_some() {
                result = StepResult::failed(
                    "UNSUPPORTED_NESTED_STEP",
                    format!("step '{step_id}' cannot run inside a loop body or compensation"),
                );
            }

            let idx = instance.step_executions.len() - 1;
            if result.success {
                instance.step_executions[idx].complete(result.output.clone());
                instance.completed_step_ids.push(step.id.clone());
                for (name, value) in &result.variable_updates {
                    instance.variables.insert(name.clone(), value.clone());
                }
                outputs.push(result.output.clone().unwrap_or(Value::Null));
                if result.should_terminate {
                    break;
                }
            } else {
                let failure = result
                    .error
                    .clone()
                    .unwrap_or_else(|| StepFailure::new("STEP_EXECUTION_ERROR", "step failed"));
                instance.step_executions[idx].fail(&failure.code, &failure.message);
                if stop_on_failure {
                    if let Some(latest) = self.checkpoint(instance).await? {
                        return Ok(LinearOutcome::Superseded(latest));
                    }
                    return Ok(LinearOutcome::Failed(failure));
                }
                warn!(step_id = %step.id, code = %failure.code, "nested step failed, continuing");
            }
            if let Some(latest) = self.checkpoint(instance).await? {
                return Ok(LinearOutcome::Superseded(latest));
            }
        }
        Ok(LinearOutcome::Done(outputs))
    }

    // -----------------------------------------------------------------------
    // State transitions
    // -----------------------------------------------------------------------

    /// Complete the pending execution record for a successful result and
    /// merge its variable updates.
    fn finish_execution(
        &self,
        instance: &mut WorkflowInstance,
        result: &StepResult,
        output_override: Option<Value>,
    ) {
        if let Some(exec) = instance
            .step_executions
            .iter_mut()
            .rev()
            .find(|e| e.status == StepExecutionStatus::Running)
        {
            let step_id = exec.step_id.clone();
            if result.skipped {
                exec.status = StepExecutionStatus::Skipped;
                exec.completed_at = Some(Utc::now());
            } else {
                exec.complete(output_override.or_else(|| result.output.clone()));
                instance.completed_step_ids.push(step_id);
            }
        }
        for (name, value) in &result.variable_updates {
            instance.variables.insert(name.clone(), value.clone());
        }
    }

    async fn suspend(
        &self,
        instance: &mut WorkflowInstance,
        step_id: &str,
        marker: Value,
        gate: Option<ApprovalGate>,
    ) -> Result<WorkflowInstance, OrchestratorError> {
        if let Some(exec) = instance
            .step_executions
            .iter_mut()
            .rev()
            .find(|e| e.step_id == step_id && e.status == StepExecutionStatus::Running)
        {
            exec.status = StepExecutionStatus::Waiting;
            exec.output = Some(marker);
        }
        instance.status = InstanceStatus::Waiting;
        instance.current_step_id = Some(step_id.to_string());
        if let Some(latest) = self.checkpoint(instance).await? {
            return Ok(latest);
        }

        if let Some(gate) = gate {
            let expires_at = gate
                .timeout_secs
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64));
            let mut request = ApprovalRequest::new(
                instance.instance_id,
                step_id,
                &gate.prompt,
                gate.required_approvals,
                expires_at,
            );
            request.approver_roles = gate.approver_roles;
            request.approver_users = gate.approver_users;
            self.approvals.create(&request).await?;
            info!(
                instance_id = %instance.instance_id,
                approval_id = %request.id,
                step_id,
                "approval request created"
            );
        }

        info!(instance_id = %instance.instance_id, step_id, "instance suspended");
        Ok(instance.clone())
    }

    async fn complete_instance(
        &self,
        mut instance: WorkflowInstance,
    ) -> Result<WorkflowInstance, OrchestratorError> {
        instance.status = InstanceStatus::Completed;
        instance.current_step_id = None;
        instance.completed_at = Some(Utc::now());
        if let Some(latest) = self.checkpoint(&mut instance).await? {
            return Ok(latest);
        }
        info!(instance_id = %instance.instance_id, "instance completed");
        Ok(instance)
    }

    async fn fail_instance(
        &self,
        instance: &mut WorkflowInstance,
        step_id: Option<String>,
        failure: StepFailure,
    ) -> Result<(), OrchestratorError> {
        instance.status = InstanceStatus::Failed;
        instance.completed_at = Some(Utc::now());
        instance.last_error = Some(InstanceError {
            step_id: step_id.clone(),
            code: failure.code.clone(),
            message: failure.message.clone(),
            at: Utc::now(),
        });
        warn!(
            instance_id = %instance.instance_id,
            step_id = step_id.as_deref().unwrap_or("<none>"),
            code = %failure.code,
            "instance failed"
        );
        self.checkpoint(instance).await?;
        Ok(())
    }

    /// Revision-checked write. A conflict means another writer (cancel,
    /// pause, a racing resume) owns the record now; its state wins.
    async fn checkpoint(
        &self,
        instance: &mut WorkflowInstance,
    ) -> Result<Option<WorkflowInstance>, OrchestratorError> {
        instance.updated_at = Utc::now();
        match self.instances.update(instance).await {
            Ok(()) => {
                instance.revision += 1;
                Ok(None)
            }
            Err(RepositoryError::Conflict(_)) => {
                let latest = self
                    .instances
                    .get(&instance.instance_id)
                    .await?
                    .ok_or(OrchestratorError::InstanceNotFound)?;
                info!(
                    instance_id = %instance.instance_id,
                    status = %status_name(latest.status),
                    "concurrent writer superseded the walk"
                );
                Ok(Some(latest))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn latest(
        &self,
        instance_id: &Uuid,
    ) -> Result<WorkflowInstance, OrchestratorError> {
        self.instances
            .get(instance_id)
            .await?
            .ok_or(OrchestratorError::InstanceNotFound)
    }

    async fn load_pinned(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<WorkflowDefinition, OrchestratorError> {
        self.definitions
            .get_version(&instance.workflow_id, instance.workflow_version)
            .await?
            .ok_or(OrchestratorError::VersionNotFound(instance.workflow_version))
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

enum StepOutcome {
    Proceed(StepResult),
    Goto(String),
    Fail(StepFailure),
    Superseded(WorkflowInstance),
}

enum LinearOutcome {
    Done(Vec<Value>),
    Failed(StepFailure),
    Superseded(WorkflowInstance),
}

struct BranchRun {
    id: String,
    success: bool,
    updates: HashMap<String, Value>,
    outputs: serde_json::Map<String, Value>,
    error: Option<String>,
}

fn resolve_branch_steps(
    branch: &ParallelBranch,
    definition: &WorkflowDefinition,
) -> Result<Vec<WorkflowStep>, String> {
    branch
        .steps
        .iter()
        .map(|id| {
            definition
                .step(id)
                .cloned()
                .ok_or_else(|| id.clone())
        })
        .collect()
}

/// Walk one branch's steps against a context snapshot. Variable updates stay
/// branch-local until the join merges them.
async fn run_branch<H, E, D>(
    runner: StepRunner<H, E, D>,
    branch_id: String,
    steps: Vec<WorkflowStep>,
    mut ctx: ExecutionContext,
    token: CancellationToken,
) -> BranchRun
where
    H: HttpCaller,
    E: EventSink,
    D: DocumentStore,
{
    let mut updates = HashMap::new();
    let mut outputs = serde_json::Map::new();
    for step in &steps {
        if token.is_cancelled() {
            return BranchRun {
                id: branch_id,
                success: false,
                updates,
                outputs,
                error: Some("cancelled".to_string()),
            };
        }
        let result = runner.execute_step(step, &ctx).await;
        let result = match &result.signal {
            Some(OrchestrationSignal::Delay { seconds }) => {
                tokio::time::sleep(std::time::Duration::from_secs(*seconds)).await;
                StepResult::ok(None)
            }
            Some(_) => StepResult::failed(
                "UNSUPPORTED_NESTED_STEP",
                format!("step '{}' cannot run inside a parallel branch", step.id),
            ),
            None => result,
        };
        if !result.success {
            let message = result
                .error
                .map(|e| format!("{}: {}", e.code, e.message))
                .unwrap_or_else(|| "step failed".to_string());
            return BranchRun {
                id: branch_id,
                success: false,
                updates,
                outputs,
                error: Some(message),
            };
        }
        if let Some(output) = &result.output {
            outputs.insert(step.id.clone(), output.clone());
        }
        for (name, value) in &result.variable_updates {
            ctx.variables.insert(name.clone(), value.clone());
            updates.insert(name.clone(), value.clone());
        }
        if result.should_terminate {
            break;
        }
    }
    BranchRun {
        id: branch_id,
        success: true,
        updates,
        outputs,
        error: None,
    }
}

/// Seed a fresh instance from a definition: declared defaults first, then
/// same-named trigger-input fields, with required declarations enforced.
pub fn build_instance(
    definition: &WorkflowDefinition,
    input: Value,
    initiated_by: Option<String>,
) -> Result<WorkflowInstance, OrchestratorError> {
    let mut instance =
        WorkflowInstance::new(definition.workflow_id, definition.version, input.clone());
    instance.initiated_by = initiated_by;

    for (name, declaration) in &definition.variables {
        let supplied = input.get(name).cloned().filter(|v| !v.is_null());
        let value = supplied.or_else(|| declaration.default.clone());
        match value {
            Some(value) => {
                instance.variables.insert(name.clone(), value);
            }
            None if declaration.required => {
                return Err(OrchestratorError::MissingRequiredVariable(name.clone()));
            }
            None => {}
        }
    }
    Ok(instance)
}

/// Policy used when `ErrorAction::Retry` carries no explicit policy.
fn fallback_retry_policy() -> stepwise_types::workflow::RetryPolicy {
    stepwise_types::workflow::RetryPolicy {
        max_attempts: 3,
        backoff: stepwise_types::workflow::BackoffKind::Fixed,
        initial_delay_seconds: 0,
        max_delay_seconds: None,
        retryable_errors: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_types::workflow::{VariableDeclaration, VariableType, WorkflowSettings, WorkflowStatus};

    fn definition_with_variables(
        variables: HashMap<String, VariableDeclaration>,
    ) -> WorkflowDefinition {
        WorkflowDefinition {
            workflow_id: Uuid::now_v7(),
            version: 1,
            name: "t".to_string(),
            description: None,
            status: WorkflowStatus::Active,
            steps: vec![],
            triggers: vec![],
            variables,
            settings: WorkflowSettings::default(),
            tags: vec![],
            category: None,
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn build_instance_applies_defaults_and_input() {
        let definition = definition_with_variables(HashMap::from([
            (
                "region".to_string(),
                VariableDeclaration {
                    var_type: VariableType::String,
                    default: Some(json!("eu")),
                    required: false,
                },
            ),
            (
                "amount".to_string(),
                VariableDeclaration {
                    var_type: VariableType::Number,
                    default: None,
                    required: true,
                },
            ),
        ]));
        let instance =
            build_instance(&definition, json!({"amount": 250}), Some("tester".to_string()))
                .unwrap();
        assert_eq!(instance.variables.get("region"), Some(&json!("eu")));
        assert_eq!(instance.variables.get("amount"), Some(&json!(250)));
        assert_eq!(instance.initiated_by.as_deref(), Some("tester"));
    }

    #[test]
    fn build_instance_rejects_missing_required() {
        let definition = definition_with_variables(HashMap::from([(
            "amount".to_string(),
            VariableDeclaration {
                var_type: VariableType::Number,
                default: None,
                required: true,
            },
        )]));
        let err = build_instance(&definition, json!({}), None).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::MissingRequiredVariable(name) if name == "amount"
        ));
    }

    #[test]
    fn status_names_are_wire_names() {
        assert_eq!(status_name(InstanceStatus::TimedOut), "timed_out");
        assert_eq!(status_name(InstanceStatus::Waiting), "waiting");
    }
}
