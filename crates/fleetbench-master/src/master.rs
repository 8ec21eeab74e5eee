// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Workflow master (spec §4.J): submission, scheduling, control operations,
//! and lifecycle for the whole master process.

use crate::aggregator::{self, AggregatedMetrics, SlaveMetrics, SummaryView, ThresholdResult};
use crate::error::{MasterError, Result};
use crate::scheduler::{self, SchedulePlan};
use crate::slave_registry::{SlaveInfo, SlaveRegistry, SlaveState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fleetbench_core::hooks::HookExecutorRegistry;
use fleetbench_core::modes::{Cancellation, ExecutionMode, ModeConfig, ModeRegistry};
use fleetbench_core::steps::StepExecutorRegistry;
use fleetbench_core::{execute_step_with_hooks, ExecutionContext, RetryExecutor, RetryPolicy, StepOutcome, Workflow};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::warn;

const LOCAL_SLAVE_ID: &str = "local";
const DEFAULT_MAX_CONCURRENT_EXECUTIONS: usize = 100;
const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterLifecycle {
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Stopping,
    Completed,
    Failed,
    Aborted,
}

/// Per-slave sub-state of a running execution.
#[derive(Debug, Clone)]
pub struct SlaveSubState {
    pub slave_id: String,
    pub status: ExecutionStatus,
    pub metrics: Option<SlaveMetrics>,
}

/// One submitted execution's full bookkeeping record.
pub struct ExecutionState {
    pub id: String,
    pub workflow: Arc<Workflow>,
    pub status: RwLock<ExecutionStatus>,
    pub error: RwLock<Vec<String>>,
    pub plan: RwLock<Option<SchedulePlan>>,
    pub sub_states: RwLock<HashMap<String, SlaveSubState>>,
    pub aggregated: RwLock<Option<AggregatedMetrics>>,
    pub cancel: Cancellation,
    pub paused: Arc<AtomicBool>,
    pub start_time: RwLock<Option<DateTime<Utc>>>,
    pub end_time: RwLock<Option<DateTime<Utc>>>,
    pub progress: RwLock<f64>,
    task: RwLock<Option<JoinHandle<()>>>,
}

/// A read-only, cloned view of an execution suitable for returning to callers.
#[derive(Debug, Clone)]
pub struct ExecutionSnapshot {
    pub id: String,
    pub status: ExecutionStatus,
    pub error: Vec<String>,
    pub slave_ids: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub progress: f64,
}

/// Options governing master behavior; mirrors the defaults spec §4.J names.
pub struct MasterOptions {
    pub max_concurrent_executions: usize,
    pub health_check_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub standalone: bool,
}

impl Default for MasterOptions {
    fn default() -> Self {
        Self {
            max_concurrent_executions: DEFAULT_MAX_CONCURRENT_EXECUTIONS,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            standalone: true,
        }
    }
}

/// Dispatches a scheduled segment of an execution onto a slave. The only
/// implementation shipped here runs the workload in-process; a networked
/// implementation is an external collaborator outside this crate's scope.
#[async_trait]
pub trait SlaveDispatcher: Send + Sync {
    async fn run(
        &self,
        execution_id: &str,
        slave_id: &str,
        workflow: Arc<Workflow>,
        cancel: Cancellation,
        paused: Arc<AtomicBool>,
    ) -> Result<SlaveMetrics>;

    /// Signals the execution's control channel to resize its active worker
    /// pool. The default implementation reports the operation as
    /// unsupported; `LocalDispatcher` overrides it by forwarding to whatever
    /// execution mode the run is using, which may itself not support scaling
    /// (only `externally-controlled` does).
    async fn scale(&self, execution_id: &str, target: i64) -> Result<()> {
        let _ = target;
        Err(MasterError::ScalingUnsupported(execution_id.to_string()))
    }
}

/// Runs a workflow's top-level steps in-process using the mode registry,
/// the step/hook executor registries, and a single iteration function that
/// walks `workflow.steps` sequentially, honoring each step's `ErrorPolicy`.
pub struct LocalDispatcher {
    pub step_executors: Arc<StepExecutorRegistry>,
    pub hook_executors: Arc<HookExecutorRegistry>,
    pub mode_registry: Arc<ModeRegistry>,
    active_modes: DashMap<String, Arc<dyn ExecutionMode>>,
}

impl LocalDispatcher {
    pub fn new() -> Self {
        Self {
            step_executors: Arc::new(StepExecutorRegistry::new()),
            hook_executors: Arc::new(HookExecutorRegistry::new()),
            mode_registry: Arc::new(ModeRegistry::new()),
            active_modes: DashMap::new(),
        }
    }
}

impl Default for LocalDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry policy applied to a step whose error policy is `retry`: base 100ms,
/// multiplier 2.0, max 5 attempts, jitter on (the teacher's own defaults).
fn step_retry_policy() -> RetryPolicy {
    RetryPolicy::new(5, Duration::from_millis(100), 2.0, Duration::from_secs(30))
}

#[async_trait]
impl SlaveDispatcher for LocalDispatcher {
    async fn run(
        &self,
        execution_id: &str,
        slave_id: &str,
        workflow: Arc<Workflow>,
        cancel: Cancellation,
        paused: Arc<AtomicBool>,
    ) -> Result<SlaveMetrics> {
        let step_executors = self.step_executors.clone();
        let hook_executors = self.hook_executors.clone();
        let workflow_inner = workflow.clone();
        let iter_paused = paused.clone();

        let iteration_fn = move |_vu_id: u32, _iteration: u64, _cancel: Cancellation| {
            let step_executors = step_executors.clone();
            let hook_executors = hook_executors.clone();
            let workflow = workflow_inner.clone();
            let paused = iter_paused.clone();
            async move {
                while paused.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                let ctx = ExecutionContext::new(workflow.variables.clone());
                for step in &workflow.steps {
                    let outcome = if step.error_policy == fleetbench_core::ErrorPolicy::Retry {
                        let executor = RetryExecutor::new(step_retry_policy());
                        executor
                            .execute(|| async {
                                match execute_step_with_hooks(step, &ctx, &step_executors, &hook_executors).await {
                                    StepOutcome::Failed(reason) => Err(fleetbench_core::EngineError::execution(
                                        step.id.clone(),
                                        std::io::Error::new(std::io::ErrorKind::Other, reason),
                                    )),
                                    other => Ok(other),
                                }
                            })
                            .await
                            .unwrap_or_else(|e| StepOutcome::Failed(e.to_string()))
                    } else {
                        execute_step_with_hooks(step, &ctx, &step_executors, &hook_executors).await
                    };

                    if let StepOutcome::Failed(reason) = outcome {
                        if step.error_policy == fleetbench_core::ErrorPolicy::Abort {
                            return Err(fleetbench_core::EngineError::other(reason));
                        }
                    }
                }
                Ok(())
            }
        };

        let mode: Arc<dyn ExecutionMode> = Arc::from(self.mode_registry.get_or_default(&workflow.options.mode)?);
        self.active_modes.insert(execution_id.to_string(), mode.clone());

        let mut cfg = ModeConfig::new(Arc::new(iteration_fn));
        cfg.vus = workflow.options.vus.max(1);
        cfg.iterations = workflow.options.iterations;
        cfg.duration = workflow.options.duration_ms.map(Duration::from_millis);
        cfg.stages = workflow.options.stages.clone();
        cfg.rate = workflow.options.rate;
        cfg.time_unit = Duration::from_millis(workflow.options.time_unit_ms.max(1));
        cfg.pre_allocated_vus = workflow.options.pre_allocated_vus;
        cfg.max_vus = workflow.options.max_vus;

        let result = tokio::select! {
            r = mode.run(cfg) => r,
            _ = cancel.cancelled() => {
                mode.stop().await;
                Ok(())
            }
        };
        self.active_modes.remove(execution_id);
        result?;

        let state = mode.get_state();
        let mut steps = HashMap::new();
        steps.insert(
            "workflow".to_string(),
            crate::aggregator::SlaveStepMetrics {
                count: state.completed_iterations,
                success: state.completed_iterations,
                failure: 0,
                custom: HashMap::new(),
                duration: crate::aggregator::DurationStats::default(),
            },
        );

        Ok(SlaveMetrics {
            slave_id: slave_id.to_string(),
            total_iterations: state.completed_iterations,
            vus: state.active_vus,
            steps,
        })
    }

    async fn scale(&self, execution_id: &str, target: i64) -> Result<()> {
        let mode = self
            .active_modes
            .get(execution_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MasterError::UnknownExecution(execution_id.to_string()))?;
        mode.scale(target as u32)
            .await
            .map_err(|_| MasterError::ScalingUnsupported(execution_id.to_string()))
    }
}

/// Workflow master process: slave registry, scheduler, aggregator, and
/// execution lifecycle.
pub struct WorkflowMaster {
    options: MasterOptions,
    registry: SlaveRegistry,
    executions: DashMap<String, Arc<ExecutionState>>,
    dispatcher: Arc<dyn SlaveDispatcher>,
    lifecycle: RwLock<MasterLifecycle>,
    health_task: RwLock<Option<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
}

impl WorkflowMaster {
    pub fn new(options: MasterOptions, dispatcher: Arc<dyn SlaveDispatcher>) -> Self {
        Self {
            options,
            registry: SlaveRegistry::new(),
            executions: DashMap::new(),
            dispatcher,
            lifecycle: RwLock::new(MasterLifecycle::Stopped),
            health_task: RwLock::new(None),
            stopped: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn registry(&self) -> &SlaveRegistry {
        &self.registry
    }

    /// Starts the health-check loop. Rejects a double start.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.write().await;
        if *lifecycle != MasterLifecycle::Stopped {
            return Err(MasterError::AlreadyStarted);
        }
        *lifecycle = MasterLifecycle::Starting;
        self.stopped.store(false, Ordering::SeqCst);

        let registry = self.registry.clone();
        let interval = self.options.health_check_interval;
        let timeout = self.options.heartbeat_timeout;
        let stopped = self.stopped.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if stopped.load(Ordering::SeqCst) {
                    return;
                }
                let now = chrono::Utc::now();
                for slave in registry.list_slaves(&Default::default()) {
                    if slave.state == SlaveState::Offline {
                        continue;
                    }
                    let elapsed = now.signed_duration_since(slave.last_seen);
                    if elapsed.to_std().unwrap_or_default() > timeout {
                        if let Err(e) = registry.mark_offline(&slave.id) {
                            warn!(slave_id = %slave.id, error = %e, "failed to mark slave offline");
                        }
                    }
                }
            }
        });
        *self.health_task.write().await = Some(handle);
        *lifecycle = MasterLifecycle::Running;
        Ok(())
    }

    /// Cancels the health-check loop, signals every running execution to
    /// stop, and transitions to `Stopped`. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.write().await;
        if *lifecycle == MasterLifecycle::Stopped {
            return Ok(());
        }
        *lifecycle = MasterLifecycle::Stopping;
        self.stopped.store(true, Ordering::SeqCst);

        if let Some(handle) = self.health_task.write().await.take() {
            handle.abort();
        }
        for entry in self.executions.iter() {
            entry.value().cancel.cancel();
        }
        *lifecycle = MasterLifecycle::Stopped;
        Ok(())
    }

    pub async fn lifecycle(&self) -> MasterLifecycle {
        *self.lifecycle.read().await
    }

    fn require_running_sync(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(MasterError::NotStarted);
        }
        Ok(())
    }

    /// `SubmitWorkflow`: allocates an execution id, stores a pending record,
    /// and schedules it. On scheduling failure the record is marked failed
    /// but its id is still returned alongside the error.
    pub async fn submit_workflow(&self, workflow: Workflow) -> (String, Result<()>) {
        let id = uuid::Uuid::new_v4().to_string();
        if let Err(e) = self.require_running_sync() {
            return (id, Err(e));
        }
        if self.executions.len() >= self.options.max_concurrent_executions {
            return (
                id,
                Err(MasterError::MaxConcurrentExecutions(self.options.max_concurrent_executions)),
            );
        }

        let state = Arc::new(ExecutionState {
            id: id.clone(),
            workflow: Arc::new(workflow),
            status: RwLock::new(ExecutionStatus::Pending),
            error: RwLock::new(Vec::new()),
            plan: RwLock::new(None),
            sub_states: RwLock::new(HashMap::new()),
            aggregated: RwLock::new(None),
            cancel: Cancellation::new(),
            paused: Arc::new(AtomicBool::new(false)),
            start_time: RwLock::new(None),
            end_time: RwLock::new(None),
            progress: RwLock::new(0.0),
            task: RwLock::new(None),
        });
        self.executions.insert(id.clone(), state.clone());

        match self.schedule_execution(state.clone()).await {
            Ok(()) => (id, Ok(())),
            Err(e) => {
                *state.status.write().await = ExecutionStatus::Failed;
                state.error.write().await.push(e.to_string());
                *state.end_time.write().await = Some(Utc::now());
                (id, Err(e))
            }
        }
    }

    /// `scheduleExecution`: selects slaves (a synthetic local slave in
    /// standalone mode), builds a schedule plan, and launches the execution.
    async fn schedule_execution(&self, state: Arc<ExecutionState>) -> Result<()> {
        let slaves = if self.options.standalone {
            if self.registry.get(LOCAL_SLAVE_ID).is_none() {
                self.registry.register(SlaveInfo::new(LOCAL_SLAVE_ID))?;
            }
            vec![self.registry.get(LOCAL_SLAVE_ID).unwrap()]
        } else {
            let selector = state
                .workflow
                .options
                .slave_selector
                .clone()
                .unwrap_or(fleetbench_core::SlaveSelector::Auto { min_slaves: 1, max_slaves: usize::MAX });
            scheduler::select_slaves(&selector, &self.registry)?
        };

        let plan = scheduler::schedule(&slaves)?;
        let mut sub_states = HashMap::new();
        for slave_id in plan.slave_ids() {
            sub_states.insert(
                slave_id.clone(),
                SlaveSubState { slave_id, status: ExecutionStatus::Pending, metrics: None },
            );
        }
        *state.plan.write().await = Some(plan.clone());
        *state.sub_states.write().await = sub_states;
        *state.status.write().await = ExecutionStatus::Running;
        *state.start_time.write().await = Some(Utc::now());

        let dispatcher = self.dispatcher.clone();
        let run_state = state.clone();
        let slave_ids = plan.slave_ids();
        let handle = tokio::spawn(async move {
            run_execution(dispatcher, run_state, slave_ids).await;
        });
        *state.task.write().await = Some(handle);
        Ok(())
    }

    fn get_execution(&self, id: &str) -> Result<Arc<ExecutionState>> {
        self.executions
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| MasterError::UnknownExecution(id.to_string()))
    }

    pub async fn stop_execution(&self, id: &str) -> Result<()> {
        let state = self.get_execution(id)?;
        *state.status.write().await = ExecutionStatus::Stopping;
        state.cancel.cancel();
        Ok(())
    }

    pub async fn pause_execution(&self, id: &str) -> Result<()> {
        let state = self.get_execution(id)?;
        let status = *state.status.read().await;
        if status != ExecutionStatus::Running {
            return Err(MasterError::InvalidTransition(format!(
                "cannot pause execution in state {status:?}"
            )));
        }
        state.paused.store(true, Ordering::SeqCst);
        *state.status.write().await = ExecutionStatus::Paused;
        Ok(())
    }

    pub async fn resume_execution(&self, id: &str) -> Result<()> {
        let state = self.get_execution(id)?;
        let status = *state.status.read().await;
        if status != ExecutionStatus::Paused {
            return Err(MasterError::InvalidTransition(format!(
                "cannot resume execution in state {status:?}"
            )));
        }
        state.paused.store(false, Ordering::SeqCst);
        *state.status.write().await = ExecutionStatus::Running;
        Ok(())
    }

    /// `ScaleExecution`: signals the execution's control channel (the active
    /// execution mode, via the dispatcher) to resize its VU pool.
    pub async fn scale_execution(&self, id: &str, target: i64) -> Result<()> {
        if target < 0 {
            return Err(MasterError::InvalidScaleTarget(target));
        }
        let state = self.get_execution(id)?;
        let status = *state.status.read().await;
        if status != ExecutionStatus::Running {
            return Err(MasterError::InvalidTransition(format!(
                "cannot scale execution in state {status:?}"
            )));
        }
        self.dispatcher.scale(id, target).await
    }

    /// `GetMetrics`: returns cached aggregated metrics if present, otherwise
    /// aggregates whatever per-slave metrics have been collected so far.
    pub async fn get_metrics(&self, id: &str) -> Result<AggregatedMetrics> {
        let state = self.get_execution(id)?;
        if let Some(aggregated) = state.aggregated.read().await.clone() {
            return Ok(aggregated);
        }
        let sub_states = state.sub_states.read().await;
        let metrics: Vec<SlaveMetrics> = sub_states
            .values()
            .filter_map(|s| s.metrics.clone())
            .collect();
        drop(sub_states);

        let start = *state.start_time.read().await;
        let end = *state.end_time.read().await;
        let duration_ms = match (start, end) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            (Some(start), None) => (Utc::now() - start).num_milliseconds().max(0) as u64,
            _ => 0,
        };
        let aggregated = aggregator::aggregate(id, duration_ms, &metrics);
        *state.aggregated.write().await = Some(aggregated.clone());
        Ok(aggregated)
    }

    pub fn evaluate_thresholds(
        &self,
        aggregated: &AggregatedMetrics,
        thresholds: &HashMap<String, Vec<fleetbench_core::ThresholdSpec>>,
    ) -> Vec<ThresholdResult> {
        aggregator::evaluate_thresholds(aggregated, thresholds)
    }

    pub fn generate_summary(&self, aggregated: &AggregatedMetrics, results: &[ThresholdResult]) -> SummaryView {
        aggregator::generate_summary(aggregated, results)
    }

    pub async fn get_execution_status(&self, id: &str) -> Result<ExecutionSnapshot> {
        let state = self.get_execution(id)?;
        let plan = state.plan.read().await;
        Ok(ExecutionSnapshot {
            id: state.id.clone(),
            status: *state.status.read().await,
            error: state.error.read().await.clone(),
            slave_ids: plan.as_ref().map(|p| p.slave_ids()).unwrap_or_default(),
            start_time: *state.start_time.read().await,
            end_time: *state.end_time.read().await,
            progress: *state.progress.read().await,
        })
    }

    pub async fn list_executions(&self) -> Vec<ExecutionSnapshot> {
        let mut snapshots = Vec::with_capacity(self.executions.len());
        for entry in self.executions.iter() {
            let state = entry.value();
            let plan = state.plan.read().await;
            snapshots.push(ExecutionSnapshot {
                id: state.id.clone(),
                status: *state.status.read().await,
                error: state.error.read().await.clone(),
                slave_ids: plan.as_ref().map(|p| p.slave_ids()).unwrap_or_default(),
                start_time: *state.start_time.read().await,
                end_time: *state.end_time.read().await,
                progress: *state.progress.read().await,
            });
        }
        snapshots
    }
}

async fn run_execution(dispatcher: Arc<dyn SlaveDispatcher>, state: Arc<ExecutionState>, slave_ids: Vec<String>) {
    let mut failed = false;
    for slave_id in slave_ids {
        let workflow = state.workflow.clone();
        match dispatcher
            .run(&state.id, &slave_id, workflow, state.cancel.clone(), state.paused.clone())
            .await
        {
            Ok(metrics) => {
                let mut sub_states = state.sub_states.write().await;
                if let Some(sub) = sub_states.get_mut(&slave_id) {
                    sub.status = ExecutionStatus::Completed;
                    sub.metrics = Some(metrics);
                }
            }
            Err(e) => {
                failed = true;
                warn!(slave_id = %slave_id, error = %e, "slave execution failed");
                state.error.write().await.push(format!("{slave_id}: {e}"));
                let mut sub_states = state.sub_states.write().await;
                if let Some(sub) = sub_states.get_mut(&slave_id) {
                    sub.status = ExecutionStatus::Failed;
                }
            }
        }
    }

    let final_status = if state.cancel.is_cancelled() {
        ExecutionStatus::Aborted
    } else if failed {
        ExecutionStatus::Failed
    } else {
        ExecutionStatus::Completed
    };
    *state.status.write().await = final_status;
    *state.end_time.write().await = Some(Utc::now());
    *state.progress.write().await = 100.0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetbench_core::ExecutionOptions;
    use std::collections::HashMap as StdHashMap;

    fn test_workflow() -> Workflow {
        Workflow {
            id: 1,
            name: "wf".to_string(),
            description: None,
            version: 1,
            pre_hook: None,
            post_hook: None,
            variables: StdHashMap::new(),
            steps: vec![],
            options: ExecutionOptions {
                mode: "shared-iterations".to_string(),
                vus: 2,
                iterations: Some(4),
                duration_ms: None,
                stages: vec![],
                rate: None,
                time_unit_ms: 1000,
                pre_allocated_vus: None,
                max_vus: None,
                graceful_stop_ms: 0,
                thresholds: StdHashMap::new(),
                slave_selector: None,
            },
        }
    }

    #[tokio::test]
    async fn test_submit_rejects_when_not_started() {
        let master = WorkflowMaster::new(MasterOptions::default(), Arc::new(LocalDispatcher::new()));
        let (_, result) = master.submit_workflow(test_workflow()).await;
        assert!(matches!(result, Err(MasterError::NotStarted)));
    }

    #[tokio::test]
    async fn test_submit_runs_standalone_local_execution() {
        let master = WorkflowMaster::new(MasterOptions::default(), Arc::new(LocalDispatcher::new()));
        master.start().await.unwrap();
        let (id, result) = master.submit_workflow(test_workflow()).await;
        assert!(result.is_ok());

        for _ in 0..50 {
            let status = master.get_execution_status(&id).await.unwrap().status;
            if status == ExecutionStatus::Completed || status == ExecutionStatus::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let snapshot = master.get_execution_status(&id).await.unwrap();
        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        master.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_start_rejected_and_stop_is_idempotent() {
        let master = WorkflowMaster::new(MasterOptions::default(), Arc::new(LocalDispatcher::new()));
        master.start().await.unwrap();
        assert!(matches!(master.start().await, Err(MasterError::AlreadyStarted)));
        master.stop().await.unwrap();
        master.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_scale_rejects_negative_target() {
        let master = WorkflowMaster::new(MasterOptions::default(), Arc::new(LocalDispatcher::new()));
        master.start().await.unwrap();
        let (id, _) = master.submit_workflow(test_workflow()).await;
        assert!(matches!(
            master.scale_execution(&id, -1).await,
            Err(MasterError::InvalidScaleTarget(-1))
        ));
        master.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_execution_errors() {
        let master = WorkflowMaster::new(MasterOptions::default(), Arc::new(LocalDispatcher::new()));
        master.start().await.unwrap();
        assert!(matches!(
            master.get_execution_status("ghost").await,
            Err(MasterError::UnknownExecution(_))
        ));
        master.stop().await.unwrap();
    }

    fn long_running_workflow() -> Workflow {
        Workflow {
            options: ExecutionOptions {
                mode: "constant-vus".to_string(),
                vus: 1,
                iterations: None,
                duration_ms: Some(5_000),
                ..test_workflow().options
            },
            ..test_workflow()
        }
    }

    #[tokio::test]
    async fn test_stop_execution_aborts_a_running_execution() {
        let master = WorkflowMaster::new(MasterOptions::default(), Arc::new(LocalDispatcher::new()));
        master.start().await.unwrap();
        let (id, result) = master.submit_workflow(long_running_workflow()).await;
        assert!(result.is_ok());

        for _ in 0..50 {
            if master.get_execution_status(&id).await.unwrap().status == ExecutionStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        master.stop_execution(&id).await.unwrap();

        let mut snapshot = master.get_execution_status(&id).await.unwrap();
        for _ in 0..50 {
            if snapshot.status == ExecutionStatus::Aborted {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            snapshot = master.get_execution_status(&id).await.unwrap();
        }
        assert_eq!(snapshot.status, ExecutionStatus::Aborted);
        assert!(snapshot.end_time.is_some());
        master.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_scale_execution_unsupported_for_default_mode() {
        let master = WorkflowMaster::new(MasterOptions::default(), Arc::new(LocalDispatcher::new()));
        master.start().await.unwrap();
        let (id, _) = master.submit_workflow(long_running_workflow()).await;

        for _ in 0..50 {
            if master.get_execution_status(&id).await.unwrap().status == ExecutionStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(
            master.scale_execution(&id, 3).await,
            Err(MasterError::ScalingUnsupported(_))
        ));
        master.stop_execution(&id).await.unwrap();
        master.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_scale_execution_resizes_externally_controlled_run() {
        let master = WorkflowMaster::new(MasterOptions::default(), Arc::new(LocalDispatcher::new()));
        master.start().await.unwrap();
        let workflow = Workflow {
            options: ExecutionOptions {
                mode: "externally-controlled".to_string(),
                vus: 1,
                iterations: None,
                duration_ms: Some(1_000),
                ..test_workflow().options
            },
            ..test_workflow()
        };
        let (id, result) = master.submit_workflow(workflow).await;
        assert!(result.is_ok());

        for _ in 0..50 {
            if master.get_execution_status(&id).await.unwrap().status == ExecutionStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        master.scale_execution(&id, 4).await.unwrap();

        master.stop_execution(&id).await.unwrap();
        master.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_then_resume_gates_dispatcher_iterations() {
        let master = WorkflowMaster::new(MasterOptions::default(), Arc::new(LocalDispatcher::new()));
        master.start().await.unwrap();
        let (id, result) = master.submit_workflow(long_running_workflow()).await;
        assert!(result.is_ok());

        for _ in 0..50 {
            if master.get_execution_status(&id).await.unwrap().status == ExecutionStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        master.pause_execution(&id).await.unwrap();
        assert_eq!(master.get_execution_status(&id).await.unwrap().status, ExecutionStatus::Paused);
        tokio::time::sleep(Duration::from_millis(50)).await;

        master.resume_execution(&id).await.unwrap();
        assert_eq!(master.get_execution_status(&id).await.unwrap().status, ExecutionStatus::Running);

        master.stop_execution(&id).await.unwrap();
        master.stop().await.unwrap();
    }

    struct FlakyExecutor {
        remaining_failures: std::sync::atomic::AtomicU32,
        attempts: Arc<std::sync::atomic::AtomicU32>,
    }

    #[async_trait]
    impl fleetbench_core::steps::StepExecutor for FlakyExecutor {
        async fn execute(
            &self,
            _step: &fleetbench_core::Step,
            _ctx: &ExecutionContext,
        ) -> std::result::Result<serde_json::Value, fleetbench_core::EngineError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.remaining_failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 { Some(n - 1) } else { None }
            }).is_ok() {
                return Err(fleetbench_core::EngineError::execution(
                    "flaky".to_string(),
                    std::io::Error::new(std::io::ErrorKind::Other, "transient failure"),
                ));
            }
            Ok(serde_json::Value::String("ok".to_string()))
        }
    }

    #[tokio::test]
    async fn test_retry_error_policy_recovers_from_transient_failures() {
        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let mut step_executors = StepExecutorRegistry::new();
        step_executors.register(
            "flaky",
            Arc::new(FlakyExecutor {
                remaining_failures: std::sync::atomic::AtomicU32::new(2),
                attempts: attempts.clone(),
            }),
        );
        let dispatcher = Arc::new(LocalDispatcher {
            step_executors: Arc::new(step_executors),
            hook_executors: Arc::new(HookExecutorRegistry::new()),
            mode_registry: Arc::new(ModeRegistry::new()),
            active_modes: DashMap::new(),
        });

        let master = WorkflowMaster::new(MasterOptions::default(), dispatcher);
        master.start().await.unwrap();

        let mut config = StdHashMap::new();
        config.insert("noop".to_string(), serde_json::Value::Bool(true));
        let workflow = Workflow {
            steps: vec![fleetbench_core::Step {
                id: "s1".to_string(),
                name: "flaky step".to_string(),
                step_type: "flaky".to_string(),
                config,
                timeout_seconds: None,
                error_policy: fleetbench_core::ErrorPolicy::Retry,
                pre_hook: None,
                post_hook: None,
                branches: Vec::new(),
                loop_: None,
                children: Vec::new(),
            }],
            options: ExecutionOptions {
                mode: "shared-iterations".to_string(),
                vus: 1,
                iterations: Some(1),
                duration_ms: None,
                ..test_workflow().options
            },
            ..test_workflow()
        };

        let (id, result) = master.submit_workflow(workflow).await;
        assert!(result.is_ok());

        let mut snapshot = master.get_execution_status(&id).await.unwrap();
        for _ in 0..50 {
            if snapshot.status == ExecutionStatus::Completed || snapshot.status == ExecutionStatus::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            snapshot = master.get_execution_status(&id).await.unwrap();
        }

        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        assert!(
            attempts.load(Ordering::SeqCst) >= 3,
            "expected at least 2 failures plus 1 successful retry, got {}",
            attempts.load(Ordering::SeqCst)
        );
        master.stop().await.unwrap();
    }
}
