//! Lisa workflow engine.
//!
//! Multi-step workflows over agents and tools:
//!
//! - **[`workflow`]** -- The definition and runtime-state model: steps of
//!   seven types, variables, results and the status state machine.
//! - **[`engine`]** -- The [`WorkflowEngine`] main loop and recursive step
//!   executor.
//! - **[`store`]** -- The in-memory [`WorkflowStore`] with lifecycle
//!   control, the concurrent-run guard and the research / code pipelines.
//! - **[`expr`]** -- The restricted condition grammar behind
//!   [`ConditionEvaluator`].
//! - **[`template`]** -- `{{ name }}` interpolation.
//! - **[`tools`]** -- The [`ToolInvoker`] seam and a [`ToolRegistry`] of
//!   tool adapters.
//!
//! # Example
//!
//! ```no_run
//! # async fn demo(engine: lisa_workflow::WorkflowEngine) -> lisa_workflow::Result<()> {
//! use lisa_workflow::{Variables, WorkflowStep, WorkflowStore};
//!
//! let store = WorkflowStore::new(engine);
//! let wf = store.create(
//!     "summarise",
//!     vec![
//!         WorkflowStep::agent("plan", "planner", "Outline {{topic}}").with_output("plan"),
//!         WorkflowStep::agent("write", "writer", "Write from: {{plan}}"),
//!     ],
//!     Variables::from([("topic".to_owned(), "tides".into())]),
//! )?;
//! let done = store.execute(&wf.id).await?;
//! println!("{}", done.status);
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod expr;
pub mod store;
pub mod template;
pub mod tools;
pub mod workflow;

pub use engine::{HUMAN_INPUT_PLACEHOLDER, RunControl, RunController, RunSignal, WorkflowEngine, run_control};
pub use error::{Result, WorkflowError};
pub use expr::{ConditionEvaluator, ExprEvaluator};
pub use store::WorkflowStore;
pub use template::{interpolate, interpolate_value};
pub use tools::{ToolAdapter, ToolDescriptor, ToolInvocation, ToolInvoker, ToolRegistry};
pub use workflow::{SharedWorkflow, StepKind, Variables, Workflow, WorkflowStatus, WorkflowStep};
