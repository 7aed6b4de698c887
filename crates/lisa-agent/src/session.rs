//! Conversational sessions.
//!
//! A session is a message history plus the generation options of the agent
//! that owns it.  The task runner opens one ephemeral session per task, sends
//! a single user message and waits for the assistant reply on the hub's
//! broadcast stream.  A waiter that falls behind the stream reads the
//! session's latest outcome instead.
//!
//! [`SessionHub`] is the seam; [`GatewaySessionHub`] is the in-process
//! implementation that answers each user message with a gateway completion
//! over the session's history.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::llm::gateway::CompletionGateway;
use crate::llm::types::{BackendId, CompletionRequest, Message, Role};

/// Capacity of the session event stream.
const SESSION_EVENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Where a session originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    /// Opened by the task runner for a single task.
    Task,
    /// Interactive command line.
    Cli,
}

/// Generation options carried by a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionOptions {
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub preferred_backend: Option<BackendId>,
}

/// An open session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// The task or caller that opened the session.
    pub origin_id: String,
    pub channel: ChannelType,
    pub options: SessionOptions,
    pub created_at: DateTime<Utc>,
}

/// What happened in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SessionPayload {
    /// A message was appended to the history.
    Message(Message),
    /// The session could not produce a reply.
    Error(String),
}

/// An event on the hub's broadcast stream, tagged with its session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: String,
    pub payload: SessionPayload,
}

impl SessionEvent {
    /// The assistant reply carried by this event, if it is one.
    pub fn assistant_reply(&self) -> Option<&str> {
        match &self.payload {
            SessionPayload::Message(m) if m.role == Role::Assistant => Some(&m.content),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Hub trait
// ---------------------------------------------------------------------------

/// Conversational session collaborator.
#[async_trait]
pub trait SessionHub: Send + Sync {
    /// Open a new session.
    async fn create_session(
        &self,
        origin_id: &str,
        channel: ChannelType,
        options: SessionOptions,
    ) -> Result<Session>;

    /// Append a message to a session.  A user message triggers a reply,
    /// delivered asynchronously on the event stream.
    async fn send_message(&self, session_id: &str, message: Message) -> Result<()>;

    /// Subscribe to events from every session.
    fn subscribe(&self) -> broadcast::Receiver<Arc<SessionEvent>>;

    /// The reply or error produced for the session's latest user message,
    /// once there is one.  Hubs without stored state return `None`.
    async fn latest_outcome(&self, _session_id: &str) -> Result<Option<SessionPayload>> {
        Ok(None)
    }

    /// Close a session, drop its history and cancel any reply still being
    /// generated.
    async fn close_session(&self, session_id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Gateway-backed hub
// ---------------------------------------------------------------------------

struct SessionState {
    session: Session,
    history: Vec<Message>,
    /// Outcome of the latest user message; reset on every user message.
    outcome: Option<SessionPayload>,
    /// Completions still running for this session.
    in_flight: Vec<JoinHandle<()>>,
}

/// In-process [`SessionHub`] that answers through a [`CompletionGateway`].
#[derive(Clone)]
pub struct GatewaySessionHub {
    gateway: CompletionGateway,
    sessions: Arc<DashMap<String, SessionState>>,
    events: broadcast::Sender<Arc<SessionEvent>>,
}

impl GatewaySessionHub {
    /// Create a hub that answers through `gateway`.
    pub fn new(gateway: CompletionGateway) -> Self {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self {
            gateway,
            sessions: Arc::new(DashMap::new()),
            events,
        }
    }

    /// Number of open sessions.
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// A copy of a session's history.
    pub fn history(&self, session_id: &str) -> Result<Vec<Message>> {
        self.sessions
            .get(session_id)
            .map(|s| s.history.clone())
            .ok_or_else(|| AgentError::SessionNotFound {
                session_id: session_id.to_owned(),
            })
    }

    /// Record `payload` as the session's outcome, then broadcast it.
    fn settle(&self, session_id: &str, payload: SessionPayload) {
        if let Some(mut state) = self.sessions.get_mut(session_id) {
            if let SessionPayload::Message(reply) = &payload {
                state.history.push(reply.clone());
            }
            state.outcome = Some(payload.clone());
        }
        self.emit(session_id, payload);
    }

    fn emit(&self, session_id: &str, payload: SessionPayload) {
        // No subscribers is fine; the reply is still in the history.
        let _ = self.events.send(Arc::new(SessionEvent {
            session_id: session_id.to_owned(),
            payload,
        }));
    }
}

#[async_trait]
impl SessionHub for GatewaySessionHub {
    async fn create_session(
        &self,
        origin_id: &str,
        channel: ChannelType,
        options: SessionOptions,
    ) -> Result<Session> {
        let session = Session {
            id: Uuid::now_v7().to_string(),
            origin_id: origin_id.to_owned(),
            channel,
            options,
            created_at: Utc::now(),
        };
        tracing::debug!(session_id = %session.id, origin_id, ?channel, "session created");
        self.sessions.insert(
            session.id.clone(),
            SessionState {
                session: session.clone(),
                history: Vec::new(),
                outcome: None,
                in_flight: Vec::new(),
            },
        );
        Ok(session)
    }

    async fn send_message(&self, session_id: &str, message: Message) -> Result<()> {
        let request = {
            let mut state =
                self.sessions
                    .get_mut(session_id)
                    .ok_or_else(|| AgentError::SessionNotFound {
                        session_id: session_id.to_owned(),
                    })?;
            state.history.push(message.clone());
            if message.role != Role::User {
                return Ok(());
            }
            state.outcome = None;

            let options = &state.session.options;
            let mut messages = Vec::with_capacity(state.history.len() + 1);
            if let Some(system) = &options.system_prompt {
                messages.push(Message::system(system.clone()));
            }
            messages.extend(state.history.iter().cloned());
            CompletionRequest {
                messages,
                max_tokens: options.max_tokens,
                temperature: options.temperature,
                preferred_backend: options.preferred_backend.clone(),
            }
        };

        self.emit(session_id, SessionPayload::Message(message));

        let hub = self.clone();
        let owner = session_id.to_owned();
        let handle = tokio::spawn(async move {
            match hub.gateway.complete(&request).await {
                Ok(response) => {
                    let reply = Message::assistant(response.content);
                    hub.settle(&owner, SessionPayload::Message(reply));
                }
                Err(e) => {
                    tracing::warn!(session_id = %owner, error = %e, "session reply failed");
                    hub.settle(&owner, SessionPayload::Error(e.to_string()));
                }
            }
        });

        match self.sessions.get_mut(session_id) {
            Some(mut state) => {
                state.in_flight.retain(|h| !h.is_finished());
                state.in_flight.push(handle);
            }
            // Closed while the request was being built.
            None => handle.abort(),
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<SessionEvent>> {
        self.events.subscribe()
    }

    async fn latest_outcome(&self, session_id: &str) -> Result<Option<SessionPayload>> {
        self.sessions
            .get(session_id)
            .map(|s| s.outcome.clone())
            .ok_or_else(|| AgentError::SessionNotFound {
                session_id: session_id.to_owned(),
            })
    }

    async fn close_session(&self, session_id: &str) -> Result<()> {
        let (_, state) =
            self.sessions
                .remove(session_id)
                .ok_or_else(|| AgentError::SessionNotFound {
                    session_id: session_id.to_owned(),
                })?;
        let cancelled = state.in_flight.iter().filter(|h| !h.is_finished()).count();
        for handle in &state.in_flight {
            handle.abort();
        }
        tracing::debug!(session_id, cancelled, "session closed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
