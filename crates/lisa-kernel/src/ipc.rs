//! Typed event bus.
//!
//! Every state transition in the orchestration core (task lifecycle, workflow
//! lifecycle, backend health, completion outcomes) is published as an
//! [`Event`] on the [`EventBus`].  The bus is the only externally observable
//! surface of the core: UIs, log shippers and metrics collectors subscribe to
//! it instead of registering callbacks on individual services.
//!
//! The bus is built on [`tokio::sync::broadcast`] with a fixed capacity.
//! Publishing never blocks; a subscriber that falls more than `capacity`
//! events behind is told exactly how many it missed through
//! [`KernelError::SubscriberLagged`], so backpressure is explicit rather than
//! an unbounded listener queue.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use lisa_kernel::ipc::{EventBus, Event};
//! # async fn example() {
//! let bus = EventBus::new(256);
//! let mut rx = bus.subscribe();
//!
//! bus.publish(Event::WorkflowStarted { workflow_id: "wf-1".into() });
//!
//! let envelope = rx.recv().await.unwrap();
//! assert_eq!(envelope.event.kind(), "workflow.started");
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{KernelError, Result};

/// Default number of events retained per subscriber.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// An event that flows through the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    // -- Task lifecycle -----------------------------------------------------
    /// A task record was created for an agent invocation.
    TaskCreated { task_id: Uuid, agent_id: String },

    /// The task opened its session and dispatched its prompt.
    TaskStarted {
        task_id: Uuid,
        agent_id: String,
        session_id: String,
    },

    /// The agent replied and the task finished successfully.
    TaskCompleted {
        task_id: Uuid,
        agent_id: String,
        duration_ms: u64,
    },

    /// The task timed out or its dispatch failed.
    TaskFailed {
        task_id: Uuid,
        agent_id: String,
        error: String,
    },

    // -- Workflow lifecycle -------------------------------------------------
    /// A workflow definition was added to the store.
    WorkflowCreated { workflow_id: String, name: String },

    /// A workflow transitioned from idle to running.
    WorkflowStarted { workflow_id: String },

    /// The engine began executing a step.
    StepStarted {
        workflow_id: String,
        step_id: String,
        step_index: usize,
    },

    /// A step finished successfully.
    StepCompleted { workflow_id: String, step_id: String },

    /// A step failed.  `absorbed` is true when an `on_failure` transition
    /// caught the failure and the workflow keeps running.
    StepFailed {
        workflow_id: String,
        step_id: String,
        error: String,
        absorbed: bool,
    },

    /// All steps were exhausted without an unhandled failure.
    WorkflowCompleted { workflow_id: String },

    /// An unhandled step failure aborted the workflow.
    WorkflowFailed { workflow_id: String, error: String },

    /// The workflow was paused by an operator.
    WorkflowPaused { workflow_id: String },

    /// A paused workflow was resumed.
    WorkflowResumed { workflow_id: String },

    /// The workflow was cancelled from outside.
    WorkflowCancelled { workflow_id: String },

    /// A `human_input` step asks for a value from outside the system.
    HumanInputRequired {
        workflow_id: String,
        step_id: String,
        prompt: String,
        variable: String,
    },

    // -- Backend health and completions -------------------------------------
    /// A periodic or on-demand probe finished for one backend.
    HealthChecked {
        backend_id: String,
        healthy: bool,
        latency_ms: Option<u64>,
        error: Option<String>,
    },

    /// A completion attempt against one backend succeeded.
    CompletionSucceeded {
        backend_id: String,
        attempt: u32,
        latency_ms: u64,
    },

    /// A single completion attempt against one backend failed.
    CompletionFailed {
        backend_id: String,
        attempt: u32,
        error: String,
    },

    /// Every backend and retry combination failed for one request.
    AllBackendsFailed { errors: Vec<String> },

    // -- Generic ------------------------------------------------------------
    /// Anything that does not fit the above (startup, shutdown, ...).
    SystemEvent { category: String, message: String },
}

impl Event {
    /// Stable dotted name of the event, suitable for log fields and metric
    /// labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskCreated { .. } => "task.created",
            Self::TaskStarted { .. } => "task.started",
            Self::TaskCompleted { .. } => "task.completed",
            Self::TaskFailed { .. } => "task.failed",
            Self::WorkflowCreated { .. } => "workflow.created",
            Self::WorkflowStarted { .. } => "workflow.started",
            Self::StepStarted { .. } => "workflow.step_started",
            Self::StepCompleted { .. } => "workflow.step_completed",
            Self::StepFailed { .. } => "workflow.step_failed",
            Self::WorkflowCompleted { .. } => "workflow.completed",
            Self::WorkflowFailed { .. } => "workflow.failed",
            Self::WorkflowPaused { .. } => "workflow.paused",
            Self::WorkflowResumed { .. } => "workflow.resumed",
            Self::WorkflowCancelled { .. } => "workflow.cancelled",
            Self::HumanInputRequired { .. } => "workflow.human_input_required",
            Self::HealthChecked { .. } => "gateway.health_check",
            Self::CompletionSucceeded { .. } => "gateway.completion_success",
            Self::CompletionFailed { .. } => "gateway.completion_error",
            Self::AllBackendsFailed { .. } => "gateway.all_backends_failed",
            Self::SystemEvent { .. } => "system",
        }
    }

    /// The workflow this event belongs to, if any.  Lets a subscriber follow
    /// a single run without matching on every variant.
    pub fn workflow_id(&self) -> Option<&str> {
        match self {
            Self::WorkflowCreated { workflow_id, .. }
            | Self::WorkflowStarted { workflow_id }
            | Self::StepStarted { workflow_id, .. }
            | Self::StepCompleted { workflow_id, .. }
            | Self::StepFailed { workflow_id, .. }
            | Self::WorkflowCompleted { workflow_id }
            | Self::WorkflowFailed { workflow_id, .. }
            | Self::WorkflowPaused { workflow_id }
            | Self::WorkflowResumed { workflow_id }
            | Self::WorkflowCancelled { workflow_id }
            | Self::HumanInputRequired { workflow_id, .. } => Some(workflow_id),
            _ => None,
        }
    }
}

/// An [`Event`] stamped by the bus with a sequence number and publish time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Monotonic per-bus sequence number, starting at 1.
    pub seq: u64,
    /// When the event was published.
    pub at: DateTime<Utc>,
    /// The event itself.
    pub event: Event,
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

/// Publish/subscribe event bus backed by [`tokio::sync::broadcast`].
///
/// The bus is cheaply cloneable (`Arc`-backed) and `Send + Sync`.  Subscribers
/// receive [`Arc<Envelope>`] references, avoiding per-subscriber cloning of the
/// event payload.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

struct EventBusInner {
    sender: broadcast::Sender<Arc<Envelope>>,
    seq: AtomicU64,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(EventBusInner {
                sender,
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of subscribers that will observe it.  With no
    /// subscribers the event is dropped, which is normal for headless runs.
    pub fn publish(&self, event: Event) -> usize {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(seq, kind = event.kind(), "event published");

        let envelope = Arc::new(Envelope {
            seq,
            at: Utc::now(),
            event,
        });
        self.inner.sender.send(envelope).unwrap_or(0)
    }

    /// Create a subscriber that receives all events published from now on.
    ///
    /// Events published *before* this call are **not** replayed.
    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            rx: self.inner.sender.subscribe(),
        }
    }

    /// Return the current number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Receiving half of the bus.
pub struct EventSubscriber {
    rx: broadcast::Receiver<Arc<Envelope>>,
}

impl EventSubscriber {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Result<Arc<Envelope>> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Lagged(missed) => {
                tracing::warn!(missed, "event subscriber lagged");
                KernelError::SubscriberLagged { missed }
            }
            broadcast::error::RecvError::Closed => KernelError::BusClosed,
        })
    }

    /// Return the next already-published event without waiting.
    ///
    /// `Ok(None)` means nothing is pending.
    pub fn try_recv(&mut self) -> Result<Option<Arc<Envelope>>> {
        match self.rx.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                Err(KernelError::SubscriberLagged { missed })
            }
            Err(broadcast::error::TryRecvError::Closed) => Err(KernelError::BusClosed),
        }
    }

    /// Drain every event that is already pending.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        loop {
            match self.try_recv() {
                Ok(Some(envelope)) => out.push(envelope.event.clone()),
                Ok(None) | Err(KernelError::BusClosed) => break,
                Err(_) => continue,
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let receivers = bus.publish(Event::SystemEvent {
            category: "test".into(),
            message: "hello".into(),
        });
        assert_eq!(receivers, 1);

        let received = rx.recv().await.expect("should receive event");
        assert_eq!(received.seq, 1);
        match &received.event {
            Event::SystemEvent { category, message } => {
                assert_eq!(category, "test");
                assert_eq!(message, "hello");
            }
            other => panic!("unexpected event variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_share_the_envelope() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(Event::WorkflowStarted {
            workflow_id: "wf".into(),
        });

        let e1 = rx1.recv().await.expect("rx1");
        let e2 = rx2.recv().await.expect("rx2");
        assert!(Arc::ptr_eq(&e1, &e2));
    }

    #[test]
    fn publish_with_no_subscribers_is_ok() {
        let bus = EventBus::new(16);
        let n = bus.publish(Event::SystemEvent {
            category: "lonely".into(),
            message: "no one listening".into(),
        });
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_is_told_how_many_it_missed() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.publish(Event::SystemEvent {
                category: "burst".into(),
                message: format!("{i}"),
            });
        }

        match rx.recv().await {
            Err(KernelError::SubscriberLagged { missed }) => assert_eq!(missed, 3),
            other => panic!("expected lag error, got {other:?}"),
        }
        // The subscriber keeps working after a lag.
        assert!(rx.recv().await.is_ok());
    }

    #[test]
    fn drain_returns_pending_events_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(Event::WorkflowStarted {
            workflow_id: "a".into(),
        });
        bus.publish(Event::WorkflowCompleted {
            workflow_id: "a".into(),
        });

        let kinds: Vec<_> = rx.drain().iter().map(Event::kind).collect();
        assert_eq!(kinds, vec!["workflow.started", "workflow.completed"]);
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn workflow_id_is_exposed_for_workflow_events_only() {
        let step = Event::StepStarted {
            workflow_id: "wf-9".into(),
            step_id: "s1".into(),
            step_index: 0,
        };
        assert_eq!(step.workflow_id(), Some("wf-9"));

        let health = Event::HealthChecked {
            backend_id: "openai/gpt-4o".into(),
            healthy: true,
            latency_ms: Some(12),
            error: None,
        };
        assert_eq!(health.workflow_id(), None);
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let event = Event::TaskCreated {
            task_id: Uuid::now_v7(),
            agent_id: "planner".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "task_created");
        assert_eq!(json["agent_id"], "planner");

        let system = Event::SystemEvent {
            category: "gateway".into(),
            message: "health-check loop started".into(),
        };
        let json = serde_json::to_value(&system).unwrap();
        assert_eq!(json["kind"], "system_event");
        assert_eq!(json["category"], "gateway");
        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, system);
    }
}
