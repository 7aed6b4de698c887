//! Workflow data model.
//!
//! A [`Workflow`] is an ordered list of [`WorkflowStep`]s plus the variables
//! and results its execution reads and writes.  Steps run top to bottom
//! unless a step routes elsewhere with `on_success` / `on_failure`.
//!
//! Composite steps (`parallel`, `conditional`, `loop`) refer to other steps
//! of the same list by id.  Those referenced steps are still ordinary members
//! of the list, so a composite step usually routes past them with
//! `on_success`.
//!
//! Definitions load from JSON or TOML; each step carries an internal `type`
//! tag:
//!
//! ```toml
//! name = "triage"
//!
//! [[steps]]
//! id = "summarize"
//! type = "agent"
//! agent_id = "analyst"
//! prompt = "Summarize: {{ report }}"
//! output_variable = "summary"
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, WorkflowError};
use crate::template;

/// Workflow variables: string keys, JSON values.
pub type Variables = HashMap<String, Value>;

/// A workflow shared between the store, the engine and control operations.
pub type SharedWorkflow = Arc<tokio::sync::RwLock<Workflow>>;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Execution status of a workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Defined, not started (or reset for another run).
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

impl WorkflowStatus {
    /// Whether `self -> to` is a legal transition.
    ///
    /// `idle -> running -> {completed, failed}`, `running <-> paused`,
    /// `paused -> failed` (cancel), and `{completed, failed} -> idle` (reset
    /// before a re-run).
    pub fn can_transition_to(self, to: Self) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, to),
            (Idle, Running)
                | (Running, Paused | Completed | Failed)
                | (Paused, Running | Failed)
                | (Completed | Failed, Idle)
        )
    }

    /// Whether the workflow has finished (successfully or not).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether an execution is in flight.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Type-specific step configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Run a prompt against a registered agent.
    Agent {
        agent_id: String,
        /// Prompt template; `{{ name }}` placeholders read variables.
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_variable: Option<String>,
        /// Variables attached to the task as structured context.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        context_variables: Vec<String>,
    },

    /// Run other steps concurrently.
    Parallel {
        steps: Vec<String>,
        /// `true`: wait for every branch, fail on the first error.
        /// `false`: settle with the first branch to finish.
        #[serde(default = "default_true")]
        wait_for_all: bool,
    },

    /// Run exactly one of two steps depending on an expression.
    Conditional {
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        true_step: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        false_step: Option<String>,
    },

    /// Run a step once per element of an array variable.
    Loop {
        /// Name of the array variable to iterate.
        items: String,
        item_variable: String,
        /// Defaults to `<item_variable>_index`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index_variable: Option<String>,
        /// Id of the step run for each element.
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<usize>,
    },

    /// Sleep.
    Delay { duration_ms: u64 },

    /// Ask a human for a value.
    HumanInput { prompt: String, variable: String },

    /// Invoke a tool.
    Tool {
        tool_id: String,
        /// Every string inside is interpolated before the call.
        #[serde(default)]
        parameters: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_variable: Option<String>,
    },
}

fn default_true() -> bool {
    true
}

impl StepKind {
    /// The `type` tag of this step.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Agent { .. } => "agent",
            Self::Parallel { .. } => "parallel",
            Self::Conditional { .. } => "conditional",
            Self::Loop { .. } => "loop",
            Self::Delay { .. } => "delay",
            Self::HumanInput { .. } => "human_input",
            Self::Tool { .. } => "tool",
        }
    }
}

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
    /// Guard; the step is skipped when this evaluates false (or fails).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Step to jump to after success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<String>,
    /// Step to jump to after failure; absorbs the failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,
}

impl WorkflowStep {
    /// Create a step with no guard and no routing.
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            condition: None,
            on_success: None,
            on_failure: None,
        }
    }

    /// An `agent` step.
    pub fn agent(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            StepKind::Agent {
                agent_id: agent_id.into(),
                prompt: prompt.into(),
                output_variable: None,
                context_variables: Vec::new(),
            },
        )
    }

    /// Builder: set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Builder: store the step's output in `variable` (agent and tool steps).
    pub fn with_output(mut self, variable: impl Into<String>) -> Self {
        match &mut self.kind {
            StepKind::Agent {
                output_variable, ..
            }
            | StepKind::Tool {
                output_variable, ..
            } => *output_variable = Some(variable.into()),
            _ => {}
        }
        self
    }

    /// Builder: attach variables as task context (agent steps).
    pub fn with_context(mut self, variables: &[&str]) -> Self {
        if let StepKind::Agent {
            context_variables, ..
        } = &mut self.kind
        {
            *context_variables = variables.iter().map(|v| (*v).to_owned()).collect();
        }
        self
    }

    /// Builder: set the guard condition.
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Builder: jump to `step_id` after success.
    pub fn on_success(mut self, step_id: impl Into<String>) -> Self {
        self.on_success = Some(step_id.into());
        self
    }

    /// Builder: jump to `step_id` after failure.
    pub fn on_failure(mut self, step_id: impl Into<String>) -> Self {
        self.on_failure = Some(step_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A workflow definition together with its runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "new_workflow_id")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub status: WorkflowStatus,
    /// Index of the step being executed; meaningful while running.
    #[serde(default)]
    pub current_step: usize,
    /// Step outputs keyed by step id.
    #[serde(default)]
    pub results: HashMap<String, Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn new_workflow_id() -> String {
    Uuid::now_v7().to_string()
}

impl Workflow {
    /// Create an idle workflow.
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            id: new_workflow_id(),
            name: name.into(),
            description: None,
            steps,
            variables: Variables::new(),
            status: WorkflowStatus::Idle,
            current_step: 0,
            results: HashMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Builder: set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Builder: set one variable.
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// Parse a definition from TOML.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let workflow: Self = toml::from_str(s)?;
        workflow.validate()?;
        Ok(workflow)
    }

    /// Parse a definition from JSON.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let workflow: Self = serde_json::from_str(s)?;
        workflow.validate()?;
        Ok(workflow)
    }

    /// Load a definition from a file; `.json` is JSON, anything else TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
    }

    /// Check structural invariants: at least one step, unique non-empty step
    /// ids, and well-formed step configuration.
    ///
    /// Dangling step references are not rejected here; they fail the run
    /// when reached.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(WorkflowError::validation(format!(
                "workflow `{}` has no steps",
                self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(WorkflowError::validation("step id must not be empty"));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(WorkflowError::validation(format!(
                    "duplicate step id `{}`",
                    step.id
                )));
            }
            match &step.kind {
                StepKind::Loop { item_variable, .. } if item_variable.trim().is_empty() => {
                    return Err(WorkflowError::validation(format!(
                        "loop step `{}` needs an item_variable",
                        step.id
                    )));
                }
                StepKind::HumanInput { variable, .. } if variable.trim().is_empty() => {
                    return Err(WorkflowError::validation(format!(
                        "human_input step `{}` needs a variable",
                        step.id
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Placeholders in agent and human-input prompts that no variable,
    /// output variable or loop variable of this workflow can satisfy, as
    /// `(step_id, name)` pairs.  Dotted names are matched on their root.
    pub fn unbound_placeholders(&self) -> Vec<(String, String)> {
        let mut derived_index = Vec::new();
        let mut bound: std::collections::HashSet<&str> =
            self.variables.keys().map(String::as_str).collect();
        for step in &self.steps {
            match &step.kind {
                StepKind::Agent {
                    output_variable: Some(var),
                    ..
                }
                | StepKind::Tool {
                    output_variable: Some(var),
                    ..
                }
                | StepKind::HumanInput { variable: var, .. } => {
                    bound.insert(var);
                }
                StepKind::Loop {
                    item_variable,
                    index_variable,
                    ..
                } => {
                    bound.insert(item_variable);
                    match index_variable {
                        Some(index) => {
                            bound.insert(index);
                        }
                        None => derived_index.push(format!("{item_variable}_index")),
                    }
                }
                _ => {}
            }
        }
        bound.extend(derived_index.iter().map(String::as_str));

        let mut unbound = Vec::new();
        for step in &self.steps {
            let prompt = match &step.kind {
                StepKind::Agent { prompt, .. } | StepKind::HumanInput { prompt, .. } => prompt,
                _ => continue,
            };
            for name in template::placeholders(prompt) {
                let root = name.split('.').next().unwrap_or_default();
                if !bound.contains(root) {
                    unbound.push((step.id.clone(), name));
                }
            }
        }
        unbound
    }

    /// Index of the step with this id.
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    /// The step with this id.
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Move to `to`, rejecting illegal transitions.
    pub fn transition(&mut self, to: WorkflowStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(WorkflowError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Clear runtime state ahead of another run.  Variables are kept.
    pub fn reset(&mut self) {
        self.status = WorkflowStatus::Idle;
        self.current_step = 0;
        self.results.clear();
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
    }

    /// Wrap for sharing between the store and the engine.
    pub fn into_shared(self) -> SharedWorkflow {
        Arc::new(tokio::sync::RwLock::new(self))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn state_machine_allows_documented_transitions() {
        use WorkflowStatus::*;
        assert!(Idle.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Paused.can_transition_to(Failed));
        assert!(Completed.can_transition_to(Idle));

        assert!(!Idle.can_transition_to(Completed));
        assert!(!Idle.can_transition_to(Paused));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Paused));
    }

    #[test]
    fn illegal_transition_is_an_error() {
        let mut wf = Workflow::new("w", vec![WorkflowStep::agent("a", "planner", "x")]);
        assert!(matches!(
            wf.transition(WorkflowStatus::Completed),
            Err(WorkflowError::InvalidTransition { .. })
        ));
        wf.transition(WorkflowStatus::Running).unwrap();
        assert_eq!(wf.status, WorkflowStatus::Running);
    }

    #[test]
    fn reset_keeps_variables() {
        let mut wf = Workflow::new("w", vec![WorkflowStep::agent("a", "planner", "x")])
            .with_variable("topic", json!("rust"));
        wf.status = WorkflowStatus::Completed;
        wf.current_step = 1;
        wf.results.insert("a".into(), json!("r"));
        wf.error = Some("old".into());

        wf.reset();
        assert_eq!(wf.status, WorkflowStatus::Idle);
        assert_eq!(wf.current_step, 0);
        assert!(wf.results.is_empty());
        assert!(wf.error.is_none());
        assert_eq!(wf.variables["topic"], json!("rust"));
    }

    #[test]
    fn parses_toml_definition_with_every_step_type() {
        let wf = Workflow::from_toml_str(
            r#"
name = "everything"

[variables]
topics = ["a", "b"]

[[steps]]
id = "plan"
type = "agent"
agent_id = "planner"
prompt = "Plan {{ goal }}"
output_variable = "plan"
context_variables = ["goal"]
on_success = "fan"

[[steps]]
id = "fan"
type = "parallel"
steps = ["wait", "ask"]

[[steps]]
id = "branch"
type = "conditional"
expression = "plan.length > 0"
true_step = "wait"

[[steps]]
id = "each"
type = "loop"
items = "topics"
item_variable = "topic"
body = "call"
max_iterations = 5

[[steps]]
id = "wait"
type = "delay"
duration_ms = 10

[[steps]]
id = "ask"
type = "human_input"
prompt = "Approve?"
variable = "approval"

[[steps]]
id = "call"
type = "tool"
tool_id = "search"
parameters = { q = "{{ topic }}" }
condition = "topic != null"
"#,
        )
        .unwrap();

        assert_eq!(wf.steps.len(), 7);
        assert_eq!(wf.status, WorkflowStatus::Idle);
        let types: Vec<_> = wf.steps.iter().map(|s| s.kind.type_name()).collect();
        assert_eq!(
            types,
            vec!["agent", "parallel", "conditional", "loop", "delay", "human_input", "tool"]
        );
        assert!(matches!(
            &wf.steps[1].kind,
            StepKind::Parallel { wait_for_all: true, .. }
        ));
        assert_eq!(wf.steps[0].on_success.as_deref(), Some("fan"));
        assert_eq!(wf.steps[6].condition.as_deref(), Some("topic != null"));
        assert_eq!(wf.variables["topics"], json!(["a", "b"]));
    }

    #[test]
    fn parses_json_definition() {
        let wf = Workflow::from_json_str(
            r#"{
                "name": "j",
                "steps": [
                    { "id": "d", "type": "delay", "duration_ms": 5, "on_failure": "d" }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(wf.steps[0].kind, StepKind::Delay { duration_ms: 5 });
        assert!(!wf.id.is_empty());
    }

    #[test]
    fn duplicate_or_missing_steps_are_rejected() {
        let dup = Workflow::new(
            "d",
            vec![
                WorkflowStep::agent("a", "planner", "x"),
                WorkflowStep::agent("a", "coder", "y"),
            ],
        );
        assert!(matches!(dup.validate(), Err(WorkflowError::Validation { .. })));
        assert!(Workflow::new("empty", Vec::new()).validate().is_err());
    }

    #[test]
    fn step_round_trips_through_json() {
        let step = WorkflowStep::agent("s", "coder", "Write {{task}}")
            .with_output("code")
            .with_condition("task")
            .on_failure("fix");
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["type"], "agent");
        assert_eq!(json["output_variable"], "code");
        let back: WorkflowStep = serde_json::from_value(json).unwrap();
        assert_eq!(back, step);
    }

    #[test]
    fn unbound_placeholders_skip_every_variable_source() {
        let wf = Workflow::new(
            "w",
            vec![
                WorkflowStep::agent("plan", "planner", "Outline {{topic}} for {{ audience }}")
                    .with_output("plan"),
                WorkflowStep::new(
                    "each",
                    StepKind::Loop {
                        items: "sections".into(),
                        item_variable: "section".into(),
                        index_variable: None,
                        body: "write".into(),
                        max_iterations: None,
                    },
                ),
                WorkflowStep::agent(
                    "write",
                    "writer",
                    "Section {{section_index}}: {{section.title}} from {{plan}} in {{tone}}",
                ),
            ],
        )
        .with_variable("topic", serde_json::json!("tides"));

        assert_eq!(
            wf.unbound_placeholders(),
            vec![
                ("plan".to_owned(), "audience".to_owned()),
                ("write".to_owned(), "tone".to_owned()),
            ]
        );
    }
}
