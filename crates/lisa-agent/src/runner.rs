//! Task runner.
//!
//! Executes one prompt against one registered agent.  Every task gets its own
//! ephemeral session so concurrent tasks never share conversational context;
//! the session carries the agent's system prompt and sampling options and is
//! closed again on every exit path.  A task whose caller stops waiting
//! (a losing parallel branch, a cancelled workflow) is logged as cancelled
//! and its session is closed in the background.
//!
//! The runner implements [`TaskExecutor`], the seam the workflow engine
//! depends on.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lisa_kernel::{Event, EventBus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::llm::types::{Message, Role};
use crate::registry::{AgentDefinition, AgentRegistry};
use crate::session::{ChannelType, SessionHub, SessionOptions, SessionPayload};

/// Named values attached to a task and rendered ahead of its input.
pub type TaskContext = HashMap<String, Value>;

// ---------------------------------------------------------------------------
// Task types
// ---------------------------------------------------------------------------

/// Lifecycle status of an [`AgentTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether the task has reached a final state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One execution of a prompt against an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: Uuid,
    pub agent_id: String,
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<TaskContext>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// The ephemeral session the task ran in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl AgentTask {
    fn new(agent_id: &str, input: &str, context: Option<TaskContext>) -> Self {
        Self {
            id: Uuid::now_v7(),
            agent_id: agent_id.to_owned(),
            input: input.to_owned(),
            context,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            session_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Executor seam
// ---------------------------------------------------------------------------

/// Anything that can run a prompt against a named agent.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run `input` against `agent_id`.
    ///
    /// Returns `Err` only when the task could not be created (unknown agent).
    /// Failures while running are reported through the returned task's
    /// `status` and `error`.
    async fn execute_task(
        &self,
        agent_id: &str,
        input: &str,
        context: Option<TaskContext>,
    ) -> Result<AgentTask>;
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Task runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// How long a task waits for the agent's reply.
    pub task_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(120),
        }
    }
}

/// Runs tasks through ephemeral sessions and keeps a log of every task.
#[derive(Clone)]
pub struct TaskRunner {
    registry: AgentRegistry,
    sessions: Arc<dyn SessionHub>,
    bus: EventBus,
    tasks: Arc<DashMap<Uuid, AgentTask>>,
    config: RunnerConfig,
}

impl TaskRunner {
    /// Create a runner over the given registry and session hub.
    pub fn new(registry: AgentRegistry, sessions: Arc<dyn SessionHub>, bus: EventBus) -> Self {
        Self {
            registry,
            sessions,
            bus,
            tasks: Arc::new(DashMap::new()),
            config: RunnerConfig::default(),
        }
    }

    /// Builder: replace the runner configuration.
    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// The agent registry this runner resolves agents from.
    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Look up a task in the log.
    pub fn task(&self, id: Uuid) -> Option<AgentTask> {
        self.tasks.get(&id).map(|t| t.clone())
    }

    /// Every logged task, oldest first.
    pub fn tasks(&self) -> Vec<AgentTask> {
        let mut all: Vec<_> = self.tasks.iter().map(|t| t.value().clone()).collect();
        all.sort_by_key(|t| t.id);
        all
    }

    async fn run(&self, agent: &AgentDefinition, task: &mut AgentTask) -> Result<String> {
        let options = SessionOptions {
            system_prompt: Some(agent.system_prompt.clone()),
            temperature: Some(agent.temperature),
            max_tokens: Some(agent.max_tokens),
            preferred_backend: agent.preferred_backend.clone(),
        };
        let session = self
            .sessions
            .create_session(&task.id.to_string(), ChannelType::Task, options)
            .await?;
        task.session_id = Some(session.id.clone());
        self.tasks.insert(task.id, task.clone());

        self.bus.publish(Event::TaskStarted {
            task_id: task.id,
            agent_id: task.agent_id.clone(),
            session_id: session.id.clone(),
        });

        let prompt = compose_prompt(&task.input, task.context.as_ref());
        let outcome = self.await_reply(&session.id, prompt).await;

        if let Err(e) = self.sessions.close_session(&session.id).await {
            warn!(session_id = %session.id, error = %e, "failed to close task session");
        }
        outcome
    }

    async fn await_reply(&self, session_id: &str, prompt: String) -> Result<String> {
        // Subscribe before sending so a fast reply cannot be missed.
        let mut events = self.sessions.subscribe();
        self.sessions
            .send_message(session_id, Message::user(prompt))
            .await?;

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(event) if event.session_id == session_id => {
                        if let Some(outcome) = settle(session_id, &event.payload) {
                            return outcome;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        // The reply may be among the dropped events.
                        debug!(session_id, missed, "task lagged behind session events");
                        if let Some(payload) = self.sessions.latest_outcome(session_id).await? {
                            if let Some(outcome) = settle(session_id, &payload) {
                                return outcome;
                            }
                        }
                    }
                    Err(RecvError::Closed) => {
                        return Err(AgentError::SessionFailed {
                            session_id: session_id.to_owned(),
                            reason: "session event stream closed".into(),
                        });
                    }
                }
            }
        };

        tokio::time::timeout(self.config.task_timeout, wait)
            .await
            .map_err(|_| AgentError::TaskTimeout {
                timeout: self.config.task_timeout,
            })?
    }
}

#[async_trait]
impl TaskExecutor for TaskRunner {
    async fn execute_task(
        &self,
        agent_id: &str,
        input: &str,
        context: Option<TaskContext>,
    ) -> Result<AgentTask> {
        let agent = self.registry.get(agent_id)?;

        let mut task = AgentTask::new(agent_id, input, context);
        self.tasks.insert(task.id, task.clone());
        let _guard = AbandonGuard {
            runner: self,
            task_id: task.id,
        };
        debug!(task_id = %task.id, agent_id, "task created");
        self.bus.publish(Event::TaskCreated {
            task_id: task.id,
            agent_id: task.agent_id.clone(),
        });

        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        let started = Instant::now();

        match self.run(&agent, &mut task).await {
            Ok(reply) => {
                let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                task.status = TaskStatus::Completed;
                task.result = Some(reply);
                info!(task_id = %task.id, agent_id, duration_ms, "task completed");
                self.bus.publish(Event::TaskCompleted {
                    task_id: task.id,
                    agent_id: task.agent_id.clone(),
                    duration_ms,
                });
            }
            Err(e) => {
                let error = e.to_string();
                task.status = TaskStatus::Failed;
                task.error = Some(error.clone());
                warn!(task_id = %task.id, agent_id, error = %error, "task failed");
                self.bus.publish(Event::TaskFailed {
                    task_id: task.id,
                    agent_id: task.agent_id.clone(),
                    error,
                });
            }
        }

        task.completed_at = Some(Utc::now());
        self.tasks.insert(task.id, task.clone());
        Ok(task)
    }
}

/// Turn a session payload into the task outcome.  `None` for anything that
/// is not a reply.
fn settle(session_id: &str, payload: &SessionPayload) -> Option<Result<String>> {
    match payload {
        SessionPayload::Error(reason) => Some(Err(AgentError::SessionFailed {
            session_id: session_id.to_owned(),
            reason: reason.clone(),
        })),
        SessionPayload::Message(m) if m.role == Role::Assistant => Some(Ok(m.content.clone())),
        SessionPayload::Message(_) => None,
    }
}

/// Logs a task as cancelled, and closes its session, when `execute_task` is
/// dropped before the task reached a final state.
struct AbandonGuard<'a> {
    runner: &'a TaskRunner,
    task_id: Uuid,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        let Some(mut task) = self.runner.tasks.get_mut(&self.task_id) else {
            return;
        };
        if task.status.is_terminal() {
            return;
        }
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        let session_id = task.session_id.clone();
        drop(task);
        debug!(task_id = %self.task_id, "task abandoned");

        let Some(session_id) = session_id else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let sessions = Arc::clone(&self.runner.sessions);
        runtime.spawn(async move {
            if let Err(e) = sessions.close_session(&session_id).await {
                debug!(session_id = %session_id, error = %e, "abandoned session already closed");
            }
        });
    }
}

/// Prepend the context, if any, to the input as a JSON block.
pub fn compose_prompt(input: &str, context: Option<&TaskContext>) -> String {
    match context.filter(|c| !c.is_empty()) {
        Some(context) => {
            let ordered: BTreeMap<&String, &Value> = context.iter().collect();
            let rendered = serde_json::to_string_pretty(&ordered).unwrap_or_default();
            format!("Context:\n```json\n{rendered}\n```\n\n{input}")
        }
        None => input.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
