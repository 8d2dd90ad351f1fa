use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concord_core::{AgentStatus, AgentType, Capability, Error, Message, Result};
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::directory::AgentDirectory;

/// A unit of work handed to an agent. Shared by reference between the
/// orchestrator and its delegates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentRequest {
    pub user_input: String,
    pub session_id: Option<String>,
    pub context: Map<String, Value>,
}

impl AgentRequest {
    pub fn new(user_input: &str) -> Self {
        Self {
            user_input: user_input.to_string(),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: Option<&str>) -> Self {
        self.session_id = session_id.map(|s| s.to_string());
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }
}

/// What an agent produced for a request.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutput {
    Answer(String),
    Structured { response: String, details: Map<String, Value> },
    /// The agent declines and names the type that should take over.
    Handoff { target: AgentType, reason: String },
    Raw(Value),
    Failed { message: String },
}

impl AgentOutput {
    /// The user-facing answer, or `DelegationInvalidResult` when there is none.
    pub fn response_text(&self) -> Result<String> {
        match self {
            AgentOutput::Answer(text) => Ok(text.clone()),
            AgentOutput::Structured { response, .. } => Ok(response.clone()),
            AgentOutput::Raw(Value::String(text)) => Ok(text.clone()),
            AgentOutput::Raw(Value::Object(map)) => map
                .get("response")
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .ok_or_else(|| Error::DelegationInvalidResult("object without a string 'response'".to_string())),
            AgentOutput::Raw(other) => Err(Error::DelegationInvalidResult(format!("raw value {}", other))),
            AgentOutput::Handoff { target, .. } => {
                Err(Error::DelegationInvalidResult(format!("handoff to {}", target)))
            }
            AgentOutput::Failed { message } => Err(Error::DelegationInvalidResult(message.clone())),
        }
    }

    pub fn details(&self) -> Option<&Map<String, Value>> {
        match self {
            AgentOutput::Structured { details, .. } => Some(details),
            _ => None,
        }
    }
}

/// Domain behavior plugged into an [`AgentRuntime`].
#[async_trait]
pub trait AgentLogic: Send + Sync {
    fn system_prompt(&self) -> &str;

    async fn execute(&self, request: &AgentRequest) -> Result<AgentOutput>;

    fn should_handoff(&self, _input: &str, _context: &Map<String, Value>) -> bool {
        false
    }

    fn determine_handoff_target(&self, _input: &str, _context: &Map<String, Value>) -> Option<AgentType> {
        None
    }
}

/// Point-in-time copy of an agent's public state.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub capabilities: Vec<Capability>,
    pub last_active_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub in_flight: u32,
    pub message_count: usize,
    pub total_requests: u64,
    pub total_errors: u64,
    pub consecutive_errors: u32,
}

impl AgentSnapshot {
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }
}

struct AgentState {
    status: AgentStatus,
    capabilities: Vec<Capability>,
    last_active_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    context: Map<String, Value>,
    history: VecDeque<Message>,
    in_flight: u32,
    /// Timestamps of the current run of consecutive failures.
    error_streak: Vec<DateTime<Utc>>,
    total_requests: u64,
    total_errors: u64,
}

impl AgentState {
    fn push_history(&mut self, msg: Message, limit: usize) {
        self.history.push_back(msg);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The instant `age` ago, or None when that lies outside the representable range.
pub(crate) fn cutoff_before(age: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
}

pub(crate) fn hours(h: u64) -> Duration {
    Duration::from_secs(h.saturating_mul(3600))
}

/// Lifecycle and state shared by every agent.
///
/// Idle → Active (request received) → Busy (executing) → Idle, with Error
/// on failure (the next request recovers it) and Offline until [`restart`].
/// Concurrent requests are counted; the agent returns to Idle when the last
/// one finishes.
///
/// [`restart`]: AgentRuntime::restart
pub struct AgentRuntime {
    id: String,
    agent_type: AgentType,
    logic: Box<dyn AgentLogic>,
    state: Mutex<AgentState>,
    directory: Mutex<Weak<AgentDirectory>>,
    max_history: usize,
}

impl AgentRuntime {
    pub fn new(
        id: &str,
        agent_type: AgentType,
        capabilities: Vec<Capability>,
        logic: Box<dyn AgentLogic>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            agent_type,
            logic,
            state: Mutex::new(AgentState {
                status: AgentStatus::Idle,
                capabilities,
                last_active_at: now,
                created_at: now,
                context: Map::new(),
                history: VecDeque::new(),
                in_flight: 0,
                error_streak: Vec::new(),
                total_requests: 0,
                total_errors: 0,
            }),
            directory: Mutex::new(Weak::new()),
            max_history: 200,
        }
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history.max(1);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    pub fn system_prompt(&self) -> &str {
        self.logic.system_prompt()
    }

    pub fn status(&self) -> AgentStatus {
        lock(&self.state).status
    }

    pub fn last_active_at(&self) -> DateTime<Utc> {
        lock(&self.state).last_active_at
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        let state = lock(&self.state);
        AgentSnapshot {
            agent_id: self.id.clone(),
            agent_type: self.agent_type,
            status: state.status,
            capabilities: state.capabilities.clone(),
            last_active_at: state.last_active_at,
            created_at: state.created_at,
            in_flight: state.in_flight,
            message_count: state.history.len(),
            total_requests: state.total_requests,
            total_errors: state.total_errors,
            consecutive_errors: state.error_streak.len() as u32,
        }
    }

    // ----- directory link -----

    pub(crate) fn attach(&self, directory: Weak<AgentDirectory>) {
        *lock(&self.directory) = directory;
    }

    pub(crate) fn detach(&self) {
        *lock(&self.directory) = Weak::new();
    }

    pub fn is_registered(&self) -> bool {
        lock(&self.directory).upgrade().is_some()
    }

    // ----- execution -----

    /// Runs the agent's logic for one request. Never returns an error:
    /// failures come back as [`AgentOutput::Failed`] and leave the agent in Error
    /// once no other request is in flight.
    pub async fn execute(&self, request: &AgentRequest) -> AgentOutput {
        if self.logic.should_handoff(&request.user_input, &request.context) {
            if let Some(target) = self
                .logic
                .determine_handoff_target(&request.user_input, &request.context)
                .filter(|t| *t != self.agent_type)
            {
                info!(agent_id = %self.id, target = %target, "Agent requested handoff");
                self.touch();
                return AgentOutput::Handoff {
                    target,
                    reason: format!("{} agent defers to {}", self.agent_type, target),
                };
            }
        }

        match self.run(self.logic.execute(request)).await {
            Ok(output) => output,
            Err(e) => AgentOutput::Failed { message: e.to_string() },
        }
    }

    /// Drives the state machine around an arbitrary unit of work. A panic in
    /// `fut` is caught and reported as `HandlerFailure`.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.begin()?;
        let result = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(r) => r,
            Err(_) => Err(Error::HandlerFailure(format!("agent '{}' panicked", self.id))),
        };
        self.finish(result.as_ref().err());
        result
    }

    fn begin(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.status == AgentStatus::Offline {
            return Err(Error::InvalidTransition(format!("agent '{}' is offline", self.id)));
        }
        if state.status == AgentStatus::Error {
            debug!(agent_id = %self.id, "Recovering from error state");
        }
        state.status = AgentStatus::Active;
        state.in_flight += 1;
        state.total_requests += 1;
        state.last_active_at = Utc::now();
        state.status = AgentStatus::Busy;
        Ok(())
    }

    fn finish(&self, error: Option<&Error>) {
        let mut state = lock(&self.state);
        state.in_flight = state.in_flight.saturating_sub(1);
        state.last_active_at = Utc::now();
        match error {
            Some(e) => {
                state.total_errors += 1;
                state.error_streak.push(Utc::now());
                // other requests still running keep the agent Busy
                if state.in_flight == 0 && state.status != AgentStatus::Offline {
                    state.status = AgentStatus::Error;
                }
                error!(agent_id = %self.id, error = %e, "Agent execution failed");
            }
            None => {
                state.error_streak.clear();
                if state.in_flight == 0 && state.status != AgentStatus::Offline {
                    state.status = AgentStatus::Idle;
                }
            }
        }
    }

    fn touch(&self) {
        lock(&self.state).last_active_at = Utc::now();
    }

    /// Consecutive failures whose timestamps fall within `window` of now.
    pub fn error_streak(&self, window: Duration) -> u32 {
        let state = lock(&self.state);
        let cutoff = cutoff_before(window);
        state
            .error_streak
            .iter()
            .filter(|t| cutoff.map_or(true, |c| **t >= c))
            .count() as u32
    }

    pub fn go_offline(&self) {
        let mut state = lock(&self.state);
        state.status = AgentStatus::Offline;
        info!(agent_id = %self.id, "Agent offline");
    }

    /// Brings an Offline or Error agent back to Idle.
    pub fn restart(&self) {
        let mut state = lock(&self.state);
        state.status = if state.in_flight > 0 { AgentStatus::Busy } else { AgentStatus::Idle };
        state.error_streak.clear();
        state.last_active_at = Utc::now();
        info!(agent_id = %self.id, "Agent restarted");
    }

    #[cfg(test)]
    pub(crate) fn set_last_active(&self, at: DateTime<Utc>) {
        lock(&self.state).last_active_at = at;
    }

    #[cfg(test)]
    pub(crate) fn set_status(&self, status: AgentStatus) {
        lock(&self.state).status = status;
    }

    // ----- capabilities -----

    /// Adds or replaces a capability. Returns true when the name is new.
    /// While registered the change goes through the directory so its index stays in step.
    pub fn add_capability(&self, capability: Capability) -> bool {
        let directory = lock(&self.directory).upgrade();
        match directory {
            Some(dir) => dir.apply_capability_added(self, capability),
            None => self.add_capability_local(capability),
        }
    }

    pub fn remove_capability(&self, name: &str) -> bool {
        let directory = lock(&self.directory).upgrade();
        match directory {
            Some(dir) => dir.apply_capability_removed(self, name),
            None => self.remove_capability_local(name),
        }
    }

    pub fn has_capability(&self, name: &str) -> bool {
        lock(&self.state).capabilities.iter().any(|c| c.name == name)
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        lock(&self.state).capabilities.clone()
    }

    pub(crate) fn add_capability_local(&self, capability: Capability) -> bool {
        let mut state = lock(&self.state);
        if let Some(existing) = state.capabilities.iter_mut().find(|c| c.name == capability.name) {
            *existing = capability;
            false
        } else {
            debug!(agent_id = %self.id, capability = %capability.name, "Capability added");
            state.capabilities.push(capability);
            true
        }
    }

    pub(crate) fn remove_capability_local(&self, name: &str) -> bool {
        let mut state = lock(&self.state);
        let before = state.capabilities.len();
        state.capabilities.retain(|c| c.name != name);
        before != state.capabilities.len()
    }

    // ----- messages -----

    pub fn send_message(&self, msg: Message) {
        let mut state = lock(&self.state);
        state.push_history(msg, self.max_history);
        state.last_active_at = Utc::now();
    }

    pub fn receive_message(&self, msg: Message) {
        let mut state = lock(&self.state);
        if msg.to_agent != self.id {
            warn!(agent_id = %self.id, to = %msg.to_agent, "Received message addressed elsewhere");
        }
        state.push_history(msg, self.max_history);
        state.last_active_at = Utc::now();
    }

    pub fn history(&self) -> Vec<Message> {
        lock(&self.state).history.iter().cloned().collect()
    }

    // ----- context -----

    pub fn update_context(&self, key: &str, value: Value) {
        lock(&self.state).context.insert(key.to_string(), value);
    }

    pub fn context_value(&self, key: &str) -> Option<Value> {
        lock(&self.state).context.get(key).cloned()
    }

    pub fn context(&self) -> Map<String, Value> {
        lock(&self.state).context.clone()
    }

    pub fn clear_context(&self) {
        lock(&self.state).context.clear();
    }
}
