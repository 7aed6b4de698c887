//! In-memory workflow store.
//!
//! Holds workflow definitions together with their runtime state, drives
//! executions through the [`WorkflowEngine`], and exposes the control
//! operations (pause, resume, cancel, provide input) that act on in-flight
//! runs.  Only one execution per workflow id runs at a time.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use lisa_kernel::{Event, EventBus};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::engine::{RunControl, RunController, WorkflowEngine, run_control};
use crate::error::{Result, WorkflowError};
use crate::workflow::{SharedWorkflow, Variables, Workflow, WorkflowStatus, WorkflowStep};

// ═══════════════════════════════════════════════════════════════════════
//  Run guard
// ═══════════════════════════════════════════════════════════════════════

type RunningSet = Arc<DashMap<String, RunController>>;

/// Marks a workflow id as running; the mark is removed on drop.
struct RunGuard {
    running: RunningSet,
    workflow_id: String,
}

impl RunGuard {
    fn acquire(running: &RunningSet, workflow_id: &str) -> Result<(Self, RunControl)> {
        match running.entry(workflow_id.to_owned()) {
            Entry::Occupied(_) => Err(WorkflowError::AlreadyRunning {
                workflow_id: workflow_id.to_owned(),
            }),
            Entry::Vacant(slot) => {
                let (controller, control) = run_control();
                slot.insert(controller);
                Ok((
                    Self {
                        running: Arc::clone(running),
                        workflow_id: workflow_id.to_owned(),
                    },
                    control,
                ))
            }
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.remove(&self.workflow_id);
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  WorkflowStore
// ═══════════════════════════════════════════════════════════════════════

/// CRUD and lifecycle operations on workflows.
///
/// Cheap to clone; clones share the same workflows.
#[derive(Clone)]
pub struct WorkflowStore {
    workflows: Arc<DashMap<String, SharedWorkflow>>,
    running: RunningSet,
    engine: WorkflowEngine,
}

impl WorkflowStore {
    /// Create an empty store executing through `engine`.
    pub fn new(engine: WorkflowEngine) -> Self {
        Self {
            workflows: Arc::new(DashMap::new()),
            running: Arc::new(DashMap::new()),
            engine,
        }
    }

    fn bus(&self) -> &EventBus {
        self.engine.bus()
    }

    fn shared(&self, workflow_id: &str) -> Result<SharedWorkflow> {
        self.workflows
            .get(workflow_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| WorkflowError::WorkflowNotFound {
                workflow_id: workflow_id.to_owned(),
            })
    }

    // ── CRUD ─────────────────────────────────────────────────────────

    /// Create and store a new idle workflow, returning a snapshot.
    #[instrument(skip(self, steps, variables))]
    pub fn create(&self, name: &str, steps: Vec<WorkflowStep>, variables: Variables) -> Result<Workflow> {
        let mut workflow = Workflow::new(name, steps);
        workflow.variables = variables;
        self.insert(workflow.clone())?;
        Ok(workflow)
    }

    /// Store a pre-built definition, returning its id.
    ///
    /// Replaces any stored workflow with the same id unless that one is
    /// running.
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    pub fn insert(&self, workflow: Workflow) -> Result<String> {
        workflow.validate()?;
        if self.is_running(&workflow.id) {
            return Err(WorkflowError::AlreadyRunning {
                workflow_id: workflow.id,
            });
        }

        for (step_id, placeholder) in workflow.unbound_placeholders() {
            warn!(
                workflow_id = %workflow.id,
                step_id = %step_id,
                placeholder = %placeholder,
                "prompt placeholder has no source; it will render empty unless set at run time"
            );
        }

        let id = workflow.id.clone();
        let name = workflow.name.clone();
        self.workflows.insert(id.clone(), workflow.into_shared());

        info!(workflow_id = %id, name = %name, "workflow stored");
        self.bus().publish(Event::WorkflowCreated {
            workflow_id: id.clone(),
            name,
        });
        Ok(id)
    }

    /// Snapshot of one workflow.
    #[instrument(skip(self))]
    pub async fn get(&self, workflow_id: &str) -> Result<Workflow> {
        let shared = self.shared(workflow_id)?;
        let snapshot = shared.read().await.clone();
        Ok(snapshot)
    }

    /// Snapshots of every workflow, oldest first.
    #[instrument(skip(self))]
    pub async fn list(&self) -> Vec<Workflow> {
        let shared: Vec<SharedWorkflow> = self.workflows.iter().map(|e| Arc::clone(e.value())).collect();
        let mut workflows = Vec::with_capacity(shared.len());
        for workflow in shared {
            workflows.push(workflow.read().await.clone());
        }
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        debug!(count = workflows.len(), "listed workflows");
        workflows
    }

    /// Remove a workflow.  Refused while it is running.
    #[instrument(skip(self))]
    pub async fn delete(&self, workflow_id: &str) -> Result<Workflow> {
        if self.is_running(workflow_id) {
            return Err(WorkflowError::AlreadyRunning {
                workflow_id: workflow_id.to_owned(),
            });
        }
        let (_, shared) = self
            .workflows
            .remove(workflow_id)
            .ok_or_else(|| WorkflowError::WorkflowNotFound {
                workflow_id: workflow_id.to_owned(),
            })?;
        info!(workflow_id, "workflow deleted");
        let snapshot = shared.read().await.clone();
        Ok(snapshot)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Whether an execution of this workflow is in flight.
    pub fn is_running(&self, workflow_id: &str) -> bool {
        self.running.contains_key(workflow_id)
    }

    /// Run a workflow to completion and return its final snapshot.
    ///
    /// A finished workflow is reset first (variables are kept).  Step
    /// failures are reported through the snapshot's status and error.
    #[instrument(skip(self))]
    pub async fn execute(&self, workflow_id: &str) -> Result<Workflow> {
        let shared = self.shared(workflow_id)?;
        let (guard, control) = RunGuard::acquire(&self.running, workflow_id)?;
        self.run_guarded(shared, guard, control).await
    }

    /// Run a workflow on a background task.
    ///
    /// The running guard is taken before returning, so a second `spawn` or
    /// `execute` of the same id fails immediately with `AlreadyRunning`.
    #[instrument(skip(self))]
    pub fn spawn(&self, workflow_id: &str) -> Result<JoinHandle<Result<Workflow>>> {
        let shared = self.shared(workflow_id)?;
        let (guard, control) = RunGuard::acquire(&self.running, workflow_id)?;
        let store = self.clone();
        Ok(tokio::spawn(async move { store.run_guarded(shared, guard, control).await }))
    }

    async fn run_guarded(&self, shared: SharedWorkflow, guard: RunGuard, control: RunControl) -> Result<Workflow> {
        {
            let mut wf = shared.write().await;
            if wf.status.is_terminal() {
                debug!(workflow_id = %wf.id, status = %wf.status, "resetting finished workflow");
                wf.reset();
            }
        }

        let outcome = self.engine.run(&shared, control).await;
        drop(guard);
        let status = outcome?;

        let snapshot = shared.read().await.clone();
        info!(workflow_id = %snapshot.id, status = %status, "workflow run finished");
        Ok(snapshot)
    }

    /// Pause a running workflow.  The step in flight finishes; the next one
    /// waits for `resume` or `cancel`.
    #[instrument(skip(self))]
    pub async fn pause(&self, workflow_id: &str) -> Result<()> {
        let shared = self.shared(workflow_id)?;
        transition_from(&shared, WorkflowStatus::Running, WorkflowStatus::Paused).await?;
        self.signal(workflow_id, RunController::pause);
        info!(workflow_id, "workflow paused");
        self.bus().publish(Event::WorkflowPaused {
            workflow_id: workflow_id.to_owned(),
        });
        Ok(())
    }

    /// Resume a paused workflow.
    #[instrument(skip(self))]
    pub async fn resume(&self, workflow_id: &str) -> Result<()> {
        let shared = self.shared(workflow_id)?;
        transition_from(&shared, WorkflowStatus::Paused, WorkflowStatus::Running).await?;
        self.signal(workflow_id, RunController::resume);
        info!(workflow_id, "workflow resumed");
        self.bus().publish(Event::WorkflowResumed {
            workflow_id: workflow_id.to_owned(),
        });
        Ok(())
    }

    /// Cancel a running or paused workflow.
    ///
    /// The workflow is marked failed immediately and stops advancing.  An
    /// agent or tool call already in flight is allowed to finish; its
    /// output is discarded from the control flow.
    #[instrument(skip(self))]
    pub async fn cancel(&self, workflow_id: &str) -> Result<()> {
        let shared = self.shared(workflow_id)?;
        {
            let mut wf = shared.write().await;
            if !wf.status.is_active() {
                return Err(WorkflowError::InvalidTransition {
                    from: wf.status,
                    to: WorkflowStatus::Failed,
                });
            }
            wf.status = WorkflowStatus::Failed;
            wf.error = Some("cancelled".to_owned());
            wf.completed_at = Some(Utc::now());
        }
        self.signal(workflow_id, RunController::cancel);
        info!(workflow_id, "workflow cancelled");
        self.bus().publish(Event::WorkflowCancelled {
            workflow_id: workflow_id.to_owned(),
        });
        Ok(())
    }

    /// Set a variable, typically the answer to a `human_input` step.
    #[instrument(skip(self, value))]
    pub async fn provide_input(&self, workflow_id: &str, variable: &str, value: Value) -> Result<()> {
        let shared = self.shared(workflow_id)?;
        shared.write().await.variables.insert(variable.to_owned(), value);
        debug!(workflow_id, variable, "input provided");
        Ok(())
    }

    fn signal(&self, workflow_id: &str, send: fn(&RunController)) {
        if let Some(controller) = self.running.get(workflow_id) {
            send(controller.value());
        }
    }

    // ── Pipelines ────────────────────────────────────────────────────

    /// Plan, research, analyze, write and review a topic.
    ///
    /// Each step stores its output (`plan`, `research`, `analysis`,
    /// `draft`, `review`) for the next one.
    #[instrument(skip(self))]
    pub fn create_research_pipeline(&self, topic: &str) -> Result<Workflow> {
        let steps = vec![
            WorkflowStep::agent(
                "plan",
                "planner",
                "Create a research plan for the topic: {{topic}}",
            )
            .with_name("Plan research")
            .with_output("plan"),
            WorkflowStep::agent(
                "research",
                "researcher",
                "Research the topic \"{{topic}}\" following this plan:\n\n{{plan}}",
            )
            .with_name("Research")
            .with_output("research"),
            WorkflowStep::agent(
                "analyze",
                "analyst",
                "Analyze these research findings and extract the key insights:\n\n{{research}}",
            )
            .with_name("Analyze findings")
            .with_output("analysis"),
            WorkflowStep::agent(
                "write",
                "writer",
                "Write a report on \"{{topic}}\" based on this analysis:\n\n{{analysis}}",
            )
            .with_name("Write report")
            .with_output("draft"),
            WorkflowStep::agent(
                "review",
                "reviewer",
                "Review this report for accuracy and clarity, and suggest improvements:\n\n{{draft}}",
            )
            .with_name("Review report")
            .with_output("review"),
        ];
        let workflow = Workflow::new(format!("Research: {topic}"), steps)
            .with_description("Plan, research, analyze, write and review a topic")
            .with_variable("topic", Value::String(topic.to_owned()));
        self.insert(workflow.clone())?;
        Ok(workflow)
    }

    /// Plan, implement, review and improve a coding task.
    ///
    /// Outputs: `plan`, `code`, `review`, `final_code`.
    #[instrument(skip(self))]
    pub fn create_code_pipeline(&self, task: &str) -> Result<Workflow> {
        let steps = vec![
            WorkflowStep::agent(
                "plan",
                "planner",
                "Create an implementation plan for this task: {{task}}",
            )
            .with_name("Plan implementation")
            .with_output("plan"),
            WorkflowStep::agent(
                "code",
                "coder",
                "Implement the following plan.\n\nTask: {{task}}\n\nPlan:\n{{plan}}",
            )
            .with_name("Write code")
            .with_output("code"),
            WorkflowStep::agent(
                "review",
                "reviewer",
                "Review this code for bugs, style and correctness:\n\n{{code}}",
            )
            .with_name("Review code")
            .with_output("review"),
            WorkflowStep::agent(
                "improve",
                "coder",
                "Improve the code based on the review.\n\nCode:\n{{code}}\n\nReview:\n{{review}}",
            )
            .with_name("Apply review")
            .with_output("final_code"),
        ];
        let workflow = Workflow::new(format!("Code: {task}"), steps)
            .with_description("Plan, implement, review and improve a coding task")
            .with_variable("task", Value::String(task.to_owned()));
        self.insert(workflow.clone())?;
        Ok(workflow)
    }
}

/// Move a workflow to `to`, but only out of `from`.  The status machine
/// alone would also let an idle workflow start running.
async fn transition_from(shared: &SharedWorkflow, from: WorkflowStatus, to: WorkflowStatus) -> Result<()> {
    let mut wf = shared.write().await;
    if wf.status != from {
        return Err(WorkflowError::InvalidTransition { from: wf.status, to });
    }
    wf.transition(to)
}

impl std::fmt::Debug for WorkflowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowStore")
            .field("workflows", &self.workflows.len())
            .field("running", &self.running.len())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use lisa_agent::{AgentTask, TaskContext, TaskExecutor, TaskStatus};
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::tools::ToolRegistry;
    use crate::workflow::StepKind;

    struct EchoExecutor;

    #[async_trait]
    impl TaskExecutor for EchoExecutor {
        async fn execute_task(
            &self,
            agent_id: &str,
            input: &str,
            _context: Option<TaskContext>,
        ) -> lisa_agent::Result<AgentTask> {
            Ok(AgentTask {
                id: Uuid::now_v7(),
                agent_id: agent_id.to_owned(),
                input: input.to_owned(),
                context: None,
                status: TaskStatus::Completed,
                result: Some(format!("{agent_id} done")),
                error: None,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                session_id: None,
            })
        }
    }

    fn store() -> WorkflowStore {
        let engine = WorkflowEngine::new(
            Arc::new(EchoExecutor),
            Arc::new(ToolRegistry::new()),
            EventBus::new(256),
        );
        WorkflowStore::new(engine)
    }

    fn one_step() -> Vec<WorkflowStep> {
        vec![WorkflowStep::agent("only", "planner", "go").with_output("out")]
    }

    #[tokio::test]
    async fn create_get_list_delete() {
        let store = store();
        let a = store.create("a", one_step(), Variables::new()).unwrap();
        let b = store.create("b", one_step(), Variables::new()).unwrap();

        assert_eq!(store.get(&a.id).await.unwrap().name, "a");
        let names: Vec<_> = store.list().await.into_iter().map(|w| w.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        store.delete(&b.id).await.unwrap();
        assert!(matches!(
            store.get(&b.id).await,
            Err(WorkflowError::WorkflowNotFound { .. })
        ));
        assert!(matches!(
            store.delete(&b.id).await,
            Err(WorkflowError::WorkflowNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn create_rejects_invalid_definitions() {
        let store = store();
        assert!(matches!(
            store.create("empty", vec![], Variables::new()),
            Err(WorkflowError::Validation { .. })
        ));
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn execute_runs_to_completion() {
        let store = store();
        let wf = store.create("w", one_step(), Variables::new()).unwrap();
        let done = store.execute(&wf.id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(done.variables["out"], json!("planner done"));
        assert!(!store.is_running(&wf.id));
    }

    #[tokio::test]
    async fn rerun_resets_runtime_state_but_keeps_variables() {
        let store = store();
        let mut vars = Variables::new();
        vars.insert("keep".into(), json!(1));
        let wf = store.create("w", one_step(), vars).unwrap();

        let first = store.execute(&wf.id).await.unwrap();
        let second = store.execute(&wf.id).await.unwrap();
        assert_eq!(second.status, WorkflowStatus::Completed);
        assert_eq!(second.variables["keep"], json!(1));
        assert!(second.started_at >= first.started_at);
    }

    #[tokio::test]
    async fn second_run_of_same_id_is_refused() {
        let store = store();
        let wf = store
            .create(
                "slow",
                vec![WorkflowStep::new("nap", StepKind::Delay { duration_ms: 10_000 })],
                Variables::new(),
            )
            .unwrap();

        let handle = store.spawn(&wf.id).unwrap();
        assert!(store.is_running(&wf.id));
        assert!(matches!(
            store.execute(&wf.id).await,
            Err(WorkflowError::AlreadyRunning { .. })
        ));
        assert!(matches!(
            store.delete(&wf.id).await,
            Err(WorkflowError::AlreadyRunning { .. })
        ));

        // Let the engine reach the delay before cancelling.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        store.cancel(&wf.id).await.unwrap();
        let done = handle.await.unwrap().unwrap();
        assert_eq!(done.status, WorkflowStatus::Failed);
        assert_eq!(done.error.as_deref(), Some("cancelled"));
        assert!(!store.is_running(&wf.id));
    }

    #[tokio::test]
    async fn control_operations_require_matching_status() {
        let store = store();
        let wf = store.create("idle", one_step(), Variables::new()).unwrap();
        assert!(matches!(
            store.pause(&wf.id).await,
            Err(WorkflowError::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.resume(&wf.id).await,
            Err(WorkflowError::InvalidTransition {
                from: WorkflowStatus::Idle,
                to: WorkflowStatus::Running
            })
        ));
        assert_eq!(store.get(&wf.id).await.unwrap().status, WorkflowStatus::Idle);
        assert!(matches!(
            store.cancel(&wf.id).await,
            Err(WorkflowError::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.pause("missing").await,
            Err(WorkflowError::WorkflowNotFound { .. })
        ));

        // The rejected calls left the workflow runnable.
        let done = store.execute(&wf.id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);

        // Finished workflows can be neither paused nor resumed.
        assert!(matches!(
            store.pause(&wf.id).await,
            Err(WorkflowError::InvalidTransition { from: WorkflowStatus::Completed, .. })
        ));
        assert!(matches!(
            store.resume(&wf.id).await,
            Err(WorkflowError::InvalidTransition { from: WorkflowStatus::Completed, .. })
        ));
    }

    #[tokio::test]
    async fn provide_input_sets_a_variable() {
        let store = store();
        let wf = store.create("w", one_step(), Variables::new()).unwrap();
        store.provide_input(&wf.id, "answer", json!("yes")).await.unwrap();
        assert_eq!(store.get(&wf.id).await.unwrap().variables["answer"], json!("yes"));
    }

    #[tokio::test]
    async fn research_pipeline_shape() {
        let store = store();
        let wf = store.create_research_pipeline("tides").unwrap();
        let agents: Vec<_> = wf
            .steps
            .iter()
            .map(|s| match &s.kind {
                StepKind::Agent {
                    agent_id,
                    output_variable,
                    ..
                } => (agent_id.as_str(), output_variable.as_deref().unwrap_or("")),
                other => panic!("unexpected step {other:?}"),
            })
            .collect();
        assert_eq!(
            agents,
            vec![
                ("planner", "plan"),
                ("researcher", "research"),
                ("analyst", "analysis"),
                ("writer", "draft"),
                ("reviewer", "review"),
            ]
        );
        assert_eq!(wf.variables["topic"], json!("tides"));
        assert!(store.get(&wf.id).await.is_ok());
    }

    #[tokio::test]
    async fn code_pipeline_shape() {
        let store = store();
        let wf = store.create_code_pipeline("parse csv").unwrap();
        let ids: Vec<_> = wf.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["plan", "code", "review", "improve"]);
        let done = store.execute(&wf.id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(done.variables["final_code"], json!("coder done"));
        assert_eq!(done.results.len(), 4);
    }
}
