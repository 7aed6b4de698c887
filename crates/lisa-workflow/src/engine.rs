//! Workflow engine.
//!
//! Drives a [`Workflow`] through its step list one step at a time:
//! guard, execute, then route by `on_success` / `on_failure` or fall through
//! to the next step.  Composite steps (`parallel`, `conditional`, `loop`)
//! recurse into other steps of the same list through one executor.
//!
//! The workflow is shared behind an async `RwLock`.  The engine never holds
//! the lock across a suspension point, so control operations (pause, resume,
//! cancel, provide input) can act while a step is in flight.
//!
//! Cancellation stops the engine from advancing.  A running agent or tool
//! call is allowed to finish, but delay steps and paused runs wake
//! immediately.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, select_all, try_join_all};
use lisa_agent::{TaskContext, TaskExecutor, TaskStatus};
use lisa_kernel::{Event, EventBus};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Result, WorkflowError};
use crate::expr::{ConditionEvaluator, ExprEvaluator};
use crate::template::{interpolate, interpolate_value};
use crate::tools::{ToolInvocation, ToolInvoker};
use crate::workflow::{SharedWorkflow, StepKind, Variables, WorkflowStatus, WorkflowStep};

/// Value bound to a `human_input` variable until someone provides one.
pub const HUMAN_INPUT_PLACEHOLDER: &str = "[awaiting human input]";

// ---------------------------------------------------------------------------
// Run control
// ---------------------------------------------------------------------------

/// Signal sent from control operations to a running engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSignal {
    Run,
    Pause,
    Cancel,
}

/// Sending half: held by whoever controls the run.
#[derive(Debug)]
pub struct RunController {
    tx: watch::Sender<RunSignal>,
}

impl RunController {
    pub fn pause(&self) {
        self.tx.send_replace(RunSignal::Pause);
    }

    pub fn resume(&self) {
        self.tx.send_replace(RunSignal::Run);
    }

    pub fn cancel(&self) {
        self.tx.send_replace(RunSignal::Cancel);
    }
}

/// Receiving half: handed to [`WorkflowEngine::run`].
#[derive(Debug, Clone)]
pub struct RunControl {
    rx: watch::Receiver<RunSignal>,
}

impl RunControl {
    /// Whether the run has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() == RunSignal::Cancel
    }

    /// Resolve once the run is cancelled.  Never resolves if the controller
    /// is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() == RunSignal::Cancel {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Wait for the next signal.  Returns `false` if the controller is gone.
    async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// Create a linked controller / control pair.
pub fn run_control() -> (RunController, RunControl) {
    let (tx, rx) = watch::channel(RunSignal::Run);
    (RunController { tx }, RunControl { rx })
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Executes workflows against a task executor and a tool invoker.
#[derive(Clone)]
pub struct WorkflowEngine {
    executor: Arc<dyn TaskExecutor>,
    tools: Arc<dyn ToolInvoker>,
    evaluator: Arc<dyn ConditionEvaluator>,
    bus: EventBus,
}

impl WorkflowEngine {
    /// Create an engine using the built-in expression evaluator.
    pub fn new(executor: Arc<dyn TaskExecutor>, tools: Arc<dyn ToolInvoker>, bus: EventBus) -> Self {
        Self {
            executor,
            tools,
            evaluator: Arc::new(ExprEvaluator),
            bus,
        }
    }

    /// Builder: replace the condition evaluator.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// The bus this engine publishes to.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Run `workflow` from its first step until it completes, fails or is
    /// cancelled, returning the final status.
    ///
    /// The workflow must be idle.  Step failures are recorded on the
    /// workflow, not returned; `Err` means the run could not start.
    pub async fn run(&self, workflow: &SharedWorkflow, mut control: RunControl) -> Result<WorkflowStatus> {
        let workflow_id = {
            let mut wf = workflow.write().await;
            wf.validate()?;
            wf.transition(WorkflowStatus::Running)?;
            wf.current_step = 0;
            wf.started_at = Some(Utc::now());
            info!(workflow_id = %wf.id, name = %wf.name, steps = wf.steps.len(), "workflow started");
            wf.id.clone()
        };
        self.bus.publish(Event::WorkflowStarted {
            workflow_id: workflow_id.clone(),
        });

        loop {
            // Wait out a pause; stop if the run was cancelled.
            let (index, step, variables) = loop {
                let wf = workflow.read().await;
                match wf.status {
                    WorkflowStatus::Running => {
                        if wf.current_step >= wf.steps.len() {
                            drop(wf);
                            return self.complete(workflow, &workflow_id).await;
                        }
                        let index = wf.current_step;
                        break (index, wf.steps[index].clone(), wf.variables.clone());
                    }
                    WorkflowStatus::Paused => {
                        drop(wf);
                        debug!(workflow_id = %workflow_id, "workflow paused, waiting");
                        if !control.changed().await {
                            return Ok(workflow.read().await.status);
                        }
                    }
                    other => {
                        debug!(workflow_id = %workflow_id, status = %other, "workflow stopped advancing");
                        return Ok(other);
                    }
                }
            };

            if let Some(guard) = &step.condition {
                if !self.check(guard, &variables, &workflow_id) {
                    debug!(workflow_id = %workflow_id, step_id = %step.id, "guard false, skipping step");
                    if let Some(status) = self.advance(workflow, index + 1).await {
                        return Ok(status);
                    }
                    continue;
                }
            }

            self.bus.publish(Event::StepStarted {
                workflow_id: workflow_id.clone(),
                step_id: step.id.clone(),
                step_index: index,
            });
            debug!(workflow_id = %workflow_id, step_id = %step.id, step_type = step.kind.type_name(), "executing step");

            let next = match self.execute_step(workflow, &workflow_id, &step, &control).await {
                Ok(()) => {
                    self.bus.publish(Event::StepCompleted {
                        workflow_id: workflow_id.clone(),
                        step_id: step.id.clone(),
                    });
                    match &step.on_success {
                        Some(target) => self.resolve_target(workflow, target).await,
                        None => Ok(index + 1),
                    }
                }
                Err(e) => {
                    let error = e.to_string();
                    let absorbed = step.on_failure.is_some();
                    warn!(workflow_id = %workflow_id, step_id = %step.id, error = %error, absorbed, "step failed");
                    self.bus.publish(Event::StepFailed {
                        workflow_id: workflow_id.clone(),
                        step_id: step.id.clone(),
                        error: error.clone(),
                        absorbed,
                    });
                    match &step.on_failure {
                        Some(target) => self.resolve_target(workflow, target).await,
                        None => Err(e),
                    }
                }
            };

            match next {
                Ok(next) => {
                    if let Some(status) = self.advance(workflow, next).await {
                        return Ok(status);
                    }
                }
                Err(e) => return Ok(self.fail(workflow, &workflow_id, &e).await),
            }
        }
    }

    /// Execute one step.  Composite steps recurse through this function.
    fn execute_step<'a>(
        &'a self,
        workflow: &'a SharedWorkflow,
        workflow_id: &'a str,
        step: &'a WorkflowStep,
        control: &'a RunControl,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match &step.kind {
                StepKind::Agent {
                    agent_id,
                    prompt,
                    output_variable,
                    context_variables,
                } => {
                    let (prompt, context) = {
                        let wf = workflow.read().await;
                        let prompt = interpolate(prompt, &wf.variables);
                        let context: TaskContext = context_variables
                            .iter()
                            .filter_map(|name| wf.variables.get(name).map(|v| (name.clone(), v.clone())))
                            .collect();
                        (prompt, (!context.is_empty()).then_some(context))
                    };

                    let task = self.executor.execute_task(agent_id, &prompt, context).await?;
                    if task.status != TaskStatus::Completed {
                        return Err(WorkflowError::TaskFailed {
                            task_id: task.id.to_string(),
                            reason: task.error.unwrap_or_else(|| format!("task ended {:?}", task.status)),
                        });
                    }

                    if let Some(variable) = output_variable {
                        let result = Value::String(task.result.unwrap_or_default());
                        let mut wf = workflow.write().await;
                        wf.variables.insert(variable.clone(), result.clone());
                        wf.results.insert(step.id.clone(), result);
                    }
                    Ok(())
                }

                StepKind::Parallel {
                    steps,
                    wait_for_all,
                } => {
                    let children = {
                        let wf = workflow.read().await;
                        steps
                            .iter()
                            .map(|id| {
                                wf.step(id).cloned().ok_or_else(|| WorkflowError::StepNotFound {
                                    step_id: id.clone(),
                                })
                            })
                            .collect::<Result<Vec<_>>>()?
                    };
                    if children.is_empty() {
                        return Ok(());
                    }

                    let branches = children
                        .iter()
                        .map(|child| self.execute_step(workflow, workflow_id, child, control));
                    if *wait_for_all {
                        try_join_all(branches).await?;
                    } else {
                        // Remaining branches are dropped once the first settles.
                        let (first, _, _) = select_all(branches).await;
                        first?;
                    }
                    Ok(())
                }

                StepKind::Conditional {
                    expression,
                    true_step,
                    false_step,
                } => {
                    let child = {
                        let wf = workflow.read().await;
                        let taken = self.check(expression, &wf.variables, workflow_id);
                        let target = if taken { true_step } else { false_step };
                        target.as_deref().and_then(|id| wf.step(id)).cloned()
                    };
                    match child {
                        Some(child) => self.execute_step(workflow, workflow_id, &child, control).await,
                        None => {
                            debug!(workflow_id, step_id = %step.id, "conditional has no branch to run");
                            Ok(())
                        }
                    }
                }

                StepKind::Loop {
                    items,
                    item_variable,
                    index_variable,
                    body,
                    max_iterations,
                } => {
                    let (list, body_step) = {
                        let wf = workflow.read().await;
                        let list = match wf.variables.get(items) {
                            Some(Value::Array(list)) => list.clone(),
                            Some(other) => {
                                return Err(WorkflowError::validation(format!(
                                    "loop `{}`: variable `{items}` is not an array (got {other})",
                                    step.id
                                )));
                            }
                            None => {
                                return Err(WorkflowError::validation(format!(
                                    "loop `{}`: variable `{items}` is not set",
                                    step.id
                                )));
                            }
                        };
                        let body_step = wf.step(body).cloned().ok_or_else(|| WorkflowError::StepNotFound {
                            step_id: body.clone(),
                        })?;
                        (list, body_step)
                    };

                    let count = max_iterations.map_or(list.len(), |max| max.min(list.len()));
                    let index_variable = index_variable
                        .clone()
                        .unwrap_or_else(|| format!("{item_variable}_index"));

                    for (i, item) in list.into_iter().take(count).enumerate() {
                        if control.is_cancelled() {
                            break;
                        }
                        {
                            let mut wf = workflow.write().await;
                            wf.variables.insert(item_variable.clone(), item);
                            wf.variables.insert(index_variable.clone(), Value::from(i));
                        }
                        self.execute_step(workflow, workflow_id, &body_step, control).await?;
                    }
                    Ok(())
                }

                StepKind::Delay { duration_ms } => {
                    tokio::select! {
                        () = tokio::time::sleep(Duration::from_millis(*duration_ms)) => {}
                        () = control.cancelled() => {
                            debug!(workflow_id, step_id = %step.id, "delay interrupted by cancel");
                        }
                    }
                    Ok(())
                }

                StepKind::HumanInput { prompt, variable } => {
                    let prompt = {
                        let mut wf = workflow.write().await;
                        let rendered = interpolate(prompt, &wf.variables);
                        wf.variables
                            .entry(variable.clone())
                            .or_insert_with(|| Value::String(HUMAN_INPUT_PLACEHOLDER.to_owned()));
                        rendered
                    };
                    info!(workflow_id, step_id = %step.id, variable = %variable, "human input requested");
                    self.bus.publish(Event::HumanInputRequired {
                        workflow_id: workflow_id.to_owned(),
                        step_id: step.id.clone(),
                        prompt,
                        variable: variable.clone(),
                    });
                    Ok(())
                }

                StepKind::Tool {
                    tool_id,
                    parameters,
                    output_variable,
                } => {
                    let parameters = {
                        let wf = workflow.read().await;
                        interpolate_value(parameters, &wf.variables)
                    };
                    let output = self
                        .tools
                        .invoke_tool(ToolInvocation {
                            tool_id: tool_id.clone(),
                            parameters,
                            session_id: workflow_id.to_owned(),
                        })
                        .await?;

                    if let Some(variable) = output_variable {
                        let mut wf = workflow.write().await;
                        wf.variables.insert(variable.clone(), output.clone());
                        wf.results.insert(step.id.clone(), output);
                    }
                    Ok(())
                }
            }
        })
    }

    /// Evaluate a condition, treating evaluation failure as false.
    fn check(&self, expression: &str, variables: &Variables, workflow_id: &str) -> bool {
        match self.evaluator.evaluate(expression, variables) {
            Ok(result) => result,
            Err(e) => {
                debug!(workflow_id, expression, error = %e, "condition failed to evaluate, treating as false");
                false
            }
        }
    }

    async fn resolve_target(&self, workflow: &SharedWorkflow, target: &str) -> Result<usize> {
        workflow
            .read()
            .await
            .step_index(target)
            .ok_or_else(|| WorkflowError::StepNotFound {
                step_id: target.to_owned(),
            })
    }

    /// Move to `next`.  Returns the status if the run was stopped meanwhile.
    async fn advance(&self, workflow: &SharedWorkflow, next: usize) -> Option<WorkflowStatus> {
        let mut wf = workflow.write().await;
        if !wf.status.is_active() {
            return Some(wf.status);
        }
        wf.current_step = next;
        None
    }

    async fn complete(&self, workflow: &SharedWorkflow, workflow_id: &str) -> Result<WorkflowStatus> {
        {
            let mut wf = workflow.write().await;
            wf.transition(WorkflowStatus::Completed)?;
            wf.completed_at = Some(Utc::now());
            info!(workflow_id, results = wf.results.len(), "workflow completed");
        }
        self.bus.publish(Event::WorkflowCompleted {
            workflow_id: workflow_id.to_owned(),
        });
        Ok(WorkflowStatus::Completed)
    }

    async fn fail(&self, workflow: &SharedWorkflow, workflow_id: &str, error: &WorkflowError) -> WorkflowStatus {
        {
            let mut wf = workflow.write().await;
            if !wf.status.is_active() {
                return wf.status;
            }
            wf.status = WorkflowStatus::Failed;
            wf.error = Some(error.to_string());
            wf.completed_at = Some(Utc::now());
        }
        warn!(workflow_id, error = %error, "workflow failed");
        self.bus.publish(Event::WorkflowFailed {
            workflow_id: workflow_id.to_owned(),
            error: error.to_string(),
        });
        WorkflowStatus::Failed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use lisa_agent::{AgentError, AgentTask};
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::tools::ToolRegistry;
    use crate::workflow::Workflow;

    /// Records prompts; replies `reply:<prompt>` unless the prompt contains
    /// "FAIL".
    #[derive(Default)]
    struct RecordingExecutor {
        prompts: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl TaskExecutor for RecordingExecutor {
        async fn execute_task(
            &self,
            agent_id: &str,
            input: &str,
            _context: Option<TaskContext>,
        ) -> lisa_agent::Result<AgentTask> {
            if agent_id == "ghost" {
                return Err(AgentError::AgentNotFound {
                    agent_id: agent_id.to_owned(),
                });
            }
            self.prompts
                .lock()
                .unwrap()
                .push((agent_id.to_owned(), input.to_owned()));
            let failed = input.contains("FAIL");
            Ok(AgentTask {
                id: Uuid::now_v7(),
                agent_id: agent_id.to_owned(),
                input: input.to_owned(),
                context: None,
                status: if failed { TaskStatus::Failed } else { TaskStatus::Completed },
                result: (!failed).then(|| format!("reply:{input}")),
                error: failed.then(|| "agent refused".to_owned()),
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                session_id: None,
            })
        }
    }

    fn engine() -> (WorkflowEngine, Arc<RecordingExecutor>) {
        let executor = Arc::new(RecordingExecutor::default());
        let engine = WorkflowEngine::new(
            executor.clone(),
            Arc::new(ToolRegistry::new()),
            EventBus::new(256),
        );
        (engine, executor)
    }

    async fn run(engine: &WorkflowEngine, workflow: Workflow) -> (WorkflowStatus, Workflow) {
        let shared = workflow.into_shared();
        let (_controller, control) = run_control();
        let status = engine.run(&shared, control).await.unwrap();
        let snapshot = shared.read().await.clone();
        (status, snapshot)
    }

    fn prompts(executor: &RecordingExecutor) -> Vec<String> {
        executor
            .prompts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| p.clone())
            .collect()
    }

    #[tokio::test]
    async fn sequential_steps_chain_variables() {
        let (engine, executor) = engine();
        let wf = Workflow::new(
            "chain",
            vec![
                WorkflowStep::agent("one", "planner", "first").with_output("plan"),
                WorkflowStep::agent("two", "coder", "Plan: {{plan}}"),
            ],
        );
        let (status, snapshot) = run(&engine, wf).await;
        assert_eq!(status, WorkflowStatus::Completed);
        assert_eq!(prompts(&executor), vec!["first", "Plan: reply:first"]);
        assert_eq!(snapshot.results["one"], json!("reply:first"));
        assert!(!snapshot.results.contains_key("two"));
        assert!(snapshot.completed_at.is_some());
    }

    #[tokio::test]
    async fn on_success_jumps_over_steps() {
        let (engine, executor) = engine();
        let wf = Workflow::new(
            "jump",
            vec![
                WorkflowStep::agent("a", "planner", "A").on_success("c"),
                WorkflowStep::agent("b", "planner", "B"),
                WorkflowStep::agent("c", "planner", "C"),
            ],
        );
        let (status, _) = run(&engine, wf).await;
        assert_eq!(status, WorkflowStatus::Completed);
        assert_eq!(prompts(&executor), vec!["A", "C"]);
    }

    #[tokio::test]
    async fn on_failure_absorbs_the_error() {
        let (engine, executor) = engine();
        let mut sub = engine.bus().subscribe();
        let wf = Workflow::new(
            "recover",
            vec![
                WorkflowStep::agent("a", "planner", "FAIL").on_failure("b"),
                WorkflowStep::agent("b", "planner", "B"),
            ],
        );
        let (status, snapshot) = run(&engine, wf).await;
        assert_eq!(status, WorkflowStatus::Completed);
        assert!(snapshot.error.is_none());
        assert_eq!(prompts(&executor), vec!["FAIL", "B"]);
        assert!(sub.drain().iter().any(|e| matches!(
            e,
            Event::StepFailed { absorbed: true, step_id, .. } if step_id == "a"
        )));
    }

    #[tokio::test]
    async fn unhandled_failure_fails_the_workflow() {
        let (engine, executor) = engine();
        let wf = Workflow::new(
            "broken",
            vec![
                WorkflowStep::agent("a", "planner", "A").with_output("a"),
                WorkflowStep::agent("b", "planner", "FAIL"),
                WorkflowStep::agent("c", "planner", "C"),
            ],
        );
        let (status, snapshot) = run(&engine, wf).await;
        assert_eq!(status, WorkflowStatus::Failed);
        assert!(snapshot.error.unwrap().contains("agent refused"));
        assert!(snapshot.completed_at.is_some());
        assert_eq!(snapshot.current_step, 1);
        // Partial results survive.
        assert_eq!(snapshot.results["a"], json!("reply:A"));
        assert_eq!(prompts(&executor), vec!["A", "FAIL"]);
    }

    #[tokio::test]
    async fn unknown_agent_is_a_step_failure() {
        let (engine, _) = engine();
        let wf = Workflow::new("ghost", vec![WorkflowStep::agent("a", "ghost", "x")]);
        let (status, snapshot) = run(&engine, wf).await;
        assert_eq!(status, WorkflowStatus::Failed);
        assert!(snapshot.error.unwrap().contains("agent not found"));
    }

    #[tokio::test]
    async fn unknown_jump_target_fails_the_workflow() {
        let (engine, _) = engine();
        let wf = Workflow::new(
            "dangling",
            vec![WorkflowStep::agent("a", "planner", "A").on_success("nowhere")],
        );
        let (status, snapshot) = run(&engine, wf).await;
        assert_eq!(status, WorkflowStatus::Failed);
        assert!(snapshot.error.unwrap().contains("step not found: nowhere"));
    }

    #[tokio::test]
    async fn false_or_broken_guards_skip_steps() {
        let (engine, executor) = engine();
        let wf = Workflow::new(
            "guards",
            vec![
                WorkflowStep::agent("a", "planner", "A").with_condition("flag == true"),
                WorkflowStep::agent("b", "planner", "B").with_condition("missing.field"),
                WorkflowStep::agent("c", "planner", "C").with_condition("!flag"),
            ],
        );
        let (status, _) = run(&engine, wf).await;
        assert_eq!(status, WorkflowStatus::Completed);
        assert_eq!(prompts(&executor), vec!["C"]);
    }

    #[tokio::test]
    async fn loop_respects_max_iterations() {
        let (engine, executor) = engine();
        let wf = Workflow::new(
            "loop",
            vec![
                WorkflowStep::new(
                    "each",
                    StepKind::Loop {
                        items: "numbers".into(),
                        item_variable: "n".into(),
                        index_variable: None,
                        body: "body".into(),
                        max_iterations: Some(2),
                    },
                )
                .on_success("end"),
                WorkflowStep::agent("body", "planner", "item {{n}} at {{n_index}}"),
                WorkflowStep::new("end", StepKind::Delay { duration_ms: 0 }),
            ],
        )
        .with_variable("numbers", json!([1, 2, 3]));
        let (status, snapshot) = run(&engine, wf).await;
        assert_eq!(status, WorkflowStatus::Completed);
        assert_eq!(prompts(&executor), vec!["item 1 at 0", "item 2 at 1"]);
        assert_eq!(snapshot.variables["n"], json!(2));
    }

    #[tokio::test]
    async fn loop_over_non_array_is_a_validation_failure() {
        let (engine, _) = engine();
        let wf = Workflow::new(
            "bad-loop",
            vec![
                WorkflowStep::new(
                    "each",
                    StepKind::Loop {
                        items: "numbers".into(),
                        item_variable: "n".into(),
                        index_variable: None,
                        body: "each".into(),
                        max_iterations: None,
                    },
                ),
            ],
        )
        .with_variable("numbers", json!("not a list"));
        let (status, snapshot) = run(&engine, wf).await;
        assert_eq!(status, WorkflowStatus::Failed);
        assert!(snapshot.error.unwrap().contains("not an array"));
    }

    #[tokio::test]
    async fn conditional_runs_exactly_one_branch() {
        let (engine, executor) = engine();
        let wf = Workflow::new(
            "branch",
            vec![
                WorkflowStep::new(
                    "pick",
                    StepKind::Conditional {
                        expression: "score > 5".into(),
                        true_step: Some("high".into()),
                        false_step: Some("low".into()),
                    },
                )
                .on_success("done"),
                WorkflowStep::agent("high", "planner", "HIGH"),
                WorkflowStep::agent("low", "planner", "LOW"),
                WorkflowStep::new("done", StepKind::Delay { duration_ms: 0 }),
            ],
        )
        .with_variable("score", json!(9));
        run(&engine, wf).await;
        assert_eq!(prompts(&executor), vec!["HIGH"]);
    }

    #[tokio::test]
    async fn conditional_without_matching_branch_is_a_no_op() {
        let (engine, executor) = engine();
        let wf = Workflow::new(
            "branch",
            vec![WorkflowStep::new(
                "pick",
                StepKind::Conditional {
                    expression: "score > 5".into(),
                    true_step: Some("high".into()),
                    false_step: Some("missing".into()),
                },
            )],
        );
        let (status, _) = run(&engine, wf).await;
        assert_eq!(status, WorkflowStatus::Completed);
        assert!(prompts(&executor).is_empty());
    }

    #[tokio::test]
    async fn parallel_runs_all_branches() {
        let (engine, executor) = engine();
        let wf = Workflow::new(
            "fan-out",
            vec![
                WorkflowStep::new(
                    "fan",
                    StepKind::Parallel {
                        steps: vec!["x".into(), "y".into()],
                        wait_for_all: true,
                    },
                )
                .on_success("join"),
                WorkflowStep::agent("x", "researcher", "X").with_output("x"),
                WorkflowStep::agent("y", "analyst", "Y").with_output("y"),
                WorkflowStep::agent("join", "writer", "{{x}} + {{y}}"),
            ],
        );
        let (status, _) = run(&engine, wf).await;
        assert_eq!(status, WorkflowStatus::Completed);
        let mut seen = prompts(&executor);
        assert_eq!(seen.pop().unwrap(), "reply:X + reply:Y");
        seen.sort();
        assert_eq!(seen, vec!["X", "Y"]);
    }

    #[tokio::test]
    async fn parallel_with_unknown_branch_fails() {
        let (engine, executor) = engine();
        let wf = Workflow::new(
            "fan-out",
            vec![WorkflowStep::new(
                "fan",
                StepKind::Parallel {
                    steps: vec!["ghost".into()],
                    wait_for_all: true,
                },
            )],
        );
        let (status, snapshot) = run(&engine, wf).await;
        assert_eq!(status, WorkflowStatus::Failed);
        assert!(snapshot.error.unwrap().contains("ghost"));
        assert!(prompts(&executor).is_empty());
    }

    #[tokio::test]
    async fn parallel_first_to_settle_wins() {
        let (engine, executor) = engine();
        let wf = Workflow::new(
            "race",
            vec![
                WorkflowStep::new(
                    "race",
                    StepKind::Parallel {
                        steps: vec!["slow".into(), "fast".into()],
                        wait_for_all: false,
                    },
                )
                .on_success("end"),
                WorkflowStep::new("slow", StepKind::Delay { duration_ms: 5_000 }),
                WorkflowStep::agent("fast", "planner", "FAST"),
                WorkflowStep::new("end", StepKind::Delay { duration_ms: 0 }),
            ],
        );
        let started = std::time::Instant::now();
        let (status, _) = run(&engine, wf).await;
        assert_eq!(status, WorkflowStatus::Completed);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(prompts(&executor), vec!["FAST"]);
    }

    #[tokio::test]
    async fn human_input_binds_placeholder_and_continues() {
        let (engine, _) = engine();
        let mut sub = engine.bus().subscribe();
        let wf = Workflow::new(
            "ask",
            vec![WorkflowStep::new(
                "ask",
                StepKind::HumanInput {
                    prompt: "Approve {{thing}}?".into(),
                    variable: "approval".into(),
                },
            )],
        )
        .with_variable("thing", json!("deploy"));
        let (status, snapshot) = run(&engine, wf).await;
        assert_eq!(status, WorkflowStatus::Completed);
        assert_eq!(snapshot.variables["approval"], json!(HUMAN_INPUT_PLACEHOLDER));
        assert!(sub.drain().iter().any(|e| matches!(
            e,
            Event::HumanInputRequired { prompt, variable, .. }
                if prompt == "Approve deploy?" && variable == "approval"
        )));
    }

    #[tokio::test]
    async fn run_requires_an_idle_workflow() {
        let (engine, _) = engine();
        let mut wf = Workflow::new("w", vec![WorkflowStep::agent("a", "planner", "A")]);
        wf.status = WorkflowStatus::Completed;
        let shared = wf.into_shared();
        let (_controller, control) = run_control();
        assert!(matches!(
            engine.run(&shared, control).await,
            Err(WorkflowError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_interrupts_a_delay() {
        let (engine, executor) = engine();
        let shared = Workflow::new(
            "sleepy",
            vec![
                WorkflowStep::new("nap", StepKind::Delay { duration_ms: 10_000 }),
                WorkflowStep::agent("after", "planner", "AFTER"),
            ],
        )
        .into_shared();
        let (controller, control) = run_control();

        let runner = {
            let engine = engine.clone();
            let shared = shared.clone();
            tokio::spawn(async move { engine.run(&shared, control).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let mut wf = shared.write().await;
            wf.transition(WorkflowStatus::Failed).unwrap();
            wf.error = Some("cancelled".into());
        }
        controller.cancel();

        let status = tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(status, WorkflowStatus::Failed);
        assert!(prompts(&executor).is_empty());
    }
}
