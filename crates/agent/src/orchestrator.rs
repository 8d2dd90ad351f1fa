use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concord_core::{AgentType, Classification, Result, RoutingConfig};
use concord_providers::{Classifier, Generator};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::bus::{BusStats, MessageBus};
use crate::directory::{AgentDirectory, DirectoryStats};
use crate::knowledge::{KnowledgeSnippet, KnowledgeStore};
use crate::runtime::{AgentLogic, AgentOutput, AgentRequest, AgentRuntime, AgentSnapshot};

pub const ORCHESTRATOR_PROMPT: &str = "You are the orchestrator of a personal assistant made of \
specialist agents for productivity, health, finance, scheduling and journaling. Answer general \
questions yourself, clearly and warmly. When a request clearly belongs to a specialist, say so.";

const APOLOGY: &str = "I'm having trouble processing your request right now. Could you try \
rephrasing it, or tell me a bit more about what you need?";

const DIRECT_MAX_TOKENS: u32 = 500;
const DIRECT_TEMPERATURE: f32 = 0.7;
const DIRECT_CONTEXT_RESULTS: usize = 3;

fn preview(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}

/// Appends knowledge lines to a base system prompt.
pub(crate) fn with_context_lines(system_prompt: &str, snippets: &[KnowledgeSnippet]) -> String {
    if snippets.is_empty() {
        return system_prompt.to_string();
    }
    let mut prompt = format!("{}\n\nRelevant context from the knowledge base:", system_prompt);
    for s in snippets {
        prompt.push_str(&format!("\n- {}: {}", s.title, preview(&s.content, 200)));
    }
    prompt
}

pub(crate) fn interaction_context(request: &AgentRequest) -> Map<String, Value> {
    let mut ctx = request.context.clone();
    if let Some(session) = &request.session_id {
        ctx.insert("session_id".to_string(), Value::String(session.clone()));
    }
    ctx
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectReply {
    pub response: String,
    pub degraded: bool,
}

/// Answers a request with the generator alone, grounded on knowledge context.
pub struct DirectResponder {
    generator: Arc<dyn Generator>,
    knowledge: Arc<dyn KnowledgeStore>,
    system_prompt: String,
    timeout: Duration,
}

impl DirectResponder {
    pub fn new(generator: Arc<dyn Generator>, knowledge: Arc<dyn KnowledgeStore>, timeout: Duration) -> Self {
        Self {
            generator,
            knowledge,
            system_prompt: ORCHESTRATOR_PROMPT.to_string(),
            timeout,
        }
    }

    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = prompt.to_string();
        self
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub async fn respond(&self, request: &AgentRequest) -> DirectReply {
        let snippets = match self
            .knowledge
            .relevant_context(&request.user_input, DIRECT_CONTEXT_RESULTS)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Knowledge lookup failed, answering without context");
                Vec::new()
            }
        };
        let system = with_context_lines(&self.system_prompt, &snippets);

        let completion = tokio::time::timeout(
            self.timeout,
            self.generator
                .complete(&system, &request.user_input, DIRECT_MAX_TOKENS, DIRECT_TEMPERATURE),
        )
        .await;

        let response = match completion {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                error!(error = %e, "Direct response failed");
                return DirectReply { response: APOLOGY.to_string(), degraded: true };
            }
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "Direct response timed out");
                return DirectReply { response: APOLOGY.to_string(), degraded: true };
            }
        };

        if let Err(e) = self
            .knowledge
            .record_interaction(
                AgentType::Orchestrator.as_str(),
                &request.user_input,
                &response,
                &interaction_context(request),
            )
            .await
        {
            warn!(error = %e, "Failed to record interaction");
        }
        DirectReply { response, degraded: false }
    }
}

/// Logic for the orchestrator's own runtime: anything sent to it over the
/// bus is answered directly.
pub struct OrchestratorLogic {
    responder: Arc<DirectResponder>,
}

impl OrchestratorLogic {
    pub fn new(responder: Arc<DirectResponder>) -> Self {
        Self { responder }
    }
}

#[async_trait]
impl AgentLogic for OrchestratorLogic {
    fn system_prompt(&self) -> &str {
        self.responder.system_prompt()
    }

    async fn execute(&self, request: &AgentRequest) -> Result<AgentOutput> {
        let reply = self.responder.respond(request).await;
        let mut details = Map::new();
        details.insert("agent_type".to_string(), json!(AgentType::Orchestrator));
        details.insert("degraded".to_string(), json!(reply.degraded));
        Ok(AgentOutput::Structured { response: reply.response, details })
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoutePath {
    Direct,
    Delegated,
    /// Delegation was attempted and abandoned; answered directly.
    Fallback,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HandoffHop {
    pub from_agent_id: String,
    pub to_agent_type: AgentType,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingRationale {
    pub classification: Classification,
    pub path: RoutePath,
    pub target_agent_id: Option<String>,
    pub target_agent_type: Option<AgentType>,
    pub reason: String,
    pub handoff_chain: Vec<HandoffHop>,
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Ok,
    Degraded,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandleOutcome {
    pub response: String,
    pub rationale: RoutingRationale,
    pub status: OutcomeStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub orchestrator: AgentSnapshot,
    pub directory: DirectoryStats,
    pub bus: BusStats,
    pub timestamp: DateTime<Utc>,
}

/// Classifies user input and either answers it or delegates to a specialist.
pub struct Orchestrator {
    runtime: Arc<AgentRuntime>,
    directory: Arc<AgentDirectory>,
    bus: Arc<MessageBus>,
    classifier: Arc<dyn Classifier>,
    responder: Arc<DirectResponder>,
    knowledge: Arc<dyn KnowledgeStore>,
    routing: RoutingConfig,
}

impl Orchestrator {
    pub fn new(
        runtime: Arc<AgentRuntime>,
        bus: Arc<MessageBus>,
        classifier: Arc<dyn Classifier>,
        responder: Arc<DirectResponder>,
        knowledge: Arc<dyn KnowledgeStore>,
        routing: RoutingConfig,
    ) -> Self {
        Self {
            runtime,
            directory: Arc::clone(bus.directory()),
            bus,
            classifier,
            responder,
            knowledge,
            routing,
        }
    }

    pub fn id(&self) -> &str {
        self.runtime.id()
    }

    pub fn runtime(&self) -> &Arc<AgentRuntime> {
        &self.runtime
    }

    /// Entry point for a user turn. Never fails: problems surface as a
    /// degraded or error outcome.
    pub async fn handle(
        &self,
        user_input: &str,
        session_id: Option<&str>,
        context: Map<String, Value>,
    ) -> HandleOutcome {
        let request = AgentRequest::new(user_input)
            .with_session(session_id)
            .with_context(context);

        match self.runtime.run(async { Ok(self.route(&request).await) }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Orchestrator could not handle request");
                HandleOutcome {
                    response: APOLOGY.to_string(),
                    rationale: RoutingRationale {
                        classification: Classification::fallback(0.0, "Orchestrator unavailable"),
                        path: RoutePath::Direct,
                        target_agent_id: None,
                        target_agent_type: None,
                        reason: e.to_string(),
                        handoff_chain: Vec::new(),
                        session_id: request.session_id.clone(),
                        timestamp: Utc::now(),
                    },
                    status: OutcomeStatus::Error,
                }
            }
        }
    }

    pub async fn classify(&self, request: &AgentRequest) -> Classification {
        if request.user_input.trim().is_empty() {
            return Classification::fallback(0.0, "Empty input");
        }
        match self.classifier.classify(&request.user_input, &request.context).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Classification failed");
                Classification::fallback(
                    self.routing.classification_error_confidence,
                    format!("Classification error: {}", e),
                )
            }
        }
    }

    /// Routes one request without touching the orchestrator's own state.
    pub async fn route(&self, request: &AgentRequest) -> HandleOutcome {
        let classification = self.classify(request).await;
        info!(
            agent_type = %classification.agent_type,
            confidence = classification.confidence,
            method = ?classification.method,
            "Intent classified"
        );

        let specialist = !matches!(classification.agent_type, AgentType::General | AgentType::Orchestrator);
        if classification.confidence < self.routing.routing_threshold || !specialist {
            let reason = if classification.confidence < self.routing.routing_threshold {
                format!("Low confidence ({:.2}), handled by orchestrator", classification.confidence)
            } else {
                "General intent, handled by orchestrator".to_string()
            };
            return self
                .answer_directly(request, classification, RoutePath::Direct, reason, Vec::new())
                .await;
        }

        self.delegate(request, classification).await
    }

    async fn delegate(&self, request: &AgentRequest, classification: Classification) -> HandleOutcome {
        let mut tried: Vec<String> = vec![self.runtime.id().to_string()];
        let mut chain: Vec<HandoffHop> = Vec::new();
        let mut target_type = classification.agent_type;

        loop {
            let exclude: Vec<&str> = tried.iter().map(String::as_str).collect();
            let Some(delegate) = self.directory.find_best_handle(&[], Some(target_type), &exclude) else {
                let reason = format!("No available {} agent", target_type);
                warn!(agent_type = %target_type, "No delegate available, answering directly");
                return self
                    .answer_directly(request, classification, RoutePath::Fallback, reason, chain)
                    .await;
            };
            let delegate_id = delegate.id().to_string();
            tried.push(delegate_id.clone());
            info!(agent_id = %delegate_id, agent_type = %target_type, "Delegating request");

            let output = delegate.execute(request).await;
            if let AgentOutput::Handoff { target, reason } = &output {
                let target = *target;
                chain.push(HandoffHop {
                    from_agent_id: delegate_id.clone(),
                    to_agent_type: target,
                    reason: reason.clone(),
                });
                if chain.len() as u32 > self.routing.max_handoffs || target == AgentType::Orchestrator {
                    warn!(hops = chain.len(), "Handoff chain abandoned, answering directly");
                    let reason = format!("Handoff chain stopped at {}", delegate_id);
                    return self
                        .answer_directly(request, classification, RoutePath::Fallback, reason, chain)
                        .await;
                }
                debug!(from = %delegate_id, to = %target, "Following handoff");
                target_type = target;
                continue;
            }

            return match output.response_text() {
                Ok(response) => {
                    let degraded = output
                        .details()
                        .and_then(|d| d.get("status"))
                        .and_then(Value::as_str)
                        == Some("error");
                    self.record_coordination(request, &delegate_id, &response).await;
                    HandleOutcome {
                        response,
                        rationale: RoutingRationale {
                            reason: format!(
                                "Intent classified as {} ({:.2}), delegated to {}",
                                classification.agent_type, classification.confidence, delegate_id
                            ),
                            classification,
                            path: RoutePath::Delegated,
                            target_agent_id: Some(delegate_id),
                            target_agent_type: Some(delegate.agent_type()),
                            handoff_chain: chain,
                            session_id: request.session_id.clone(),
                            timestamp: Utc::now(),
                        },
                        status: if degraded { OutcomeStatus::Degraded } else { OutcomeStatus::Ok },
                    }
                }
                Err(e) => {
                    warn!(agent_id = %delegate_id, error = %e, "Delegate result unusable, answering directly");
                    self.answer_directly(request, classification, RoutePath::Fallback, e.to_string(), chain)
                        .await
                }
            };
        }
    }

    async fn answer_directly(
        &self,
        request: &AgentRequest,
        classification: Classification,
        path: RoutePath,
        reason: String,
        handoff_chain: Vec<HandoffHop>,
    ) -> HandleOutcome {
        let reply = self.responder.respond(request).await;
        HandleOutcome {
            response: reply.response,
            rationale: RoutingRationale {
                classification,
                path,
                target_agent_id: Some(self.runtime.id().to_string()),
                target_agent_type: Some(AgentType::Orchestrator),
                reason,
                handoff_chain,
                session_id: request.session_id.clone(),
                timestamp: Utc::now(),
            },
            status: if reply.degraded { OutcomeStatus::Degraded } else { OutcomeStatus::Ok },
        }
    }

    async fn record_coordination(&self, request: &AgentRequest, delegate_id: &str, response: &str) {
        let mut ctx = interaction_context(request);
        ctx.insert("delegated_to".to_string(), Value::String(delegate_id.to_string()));
        if let Err(e) = self
            .knowledge
            .record_interaction("orchestrator_coordination", &request.user_input, response, &ctx)
            .await
        {
            warn!(error = %e, "Failed to record coordination");
        }
    }

    /// Offers the request to another agent over the bus.
    pub async fn handoff(&self, to_agent_id: &str, request: &AgentRequest) -> bool {
        let description = match self.directory.get(to_agent_id) {
            Some(target) => format!("Handle {} request", target.agent_type),
            None => "Handle request".to_string(),
        };
        let mut context = request.context.clone();
        if let Some(session) = &request.session_id {
            context.insert("session_id".to_string(), Value::String(session.clone()));
        }
        self.bus
            .handoff_task(self.runtime.id(), to_agent_id, &description, context, &request.user_input)
            .await
    }

    pub fn system_status(&self) -> SystemStatus {
        SystemStatus {
            orchestrator: self.runtime.snapshot(),
            directory: self.directory.stats(),
            bus: self.bus.stats(),
            timestamp: Utc::now(),
        }
    }
}
