use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::Utc;
use concord_core::{AgentType, Capability, Config, Error, Message, MessageType};
use concord_providers::{Classifier, Generator};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::bus::{HandlerReply, MessageBus, OutgoingMessage};
use crate::directory::AgentDirectory;
use crate::intent::{HybridClassifier, PatternClassifier};
use crate::knowledge::KnowledgeStore;
use crate::orchestrator::{DirectResponder, Orchestrator, OrchestratorLogic};
use crate::runtime::{lock, AgentLogic, AgentRequest, AgentRuntime};
use crate::specialists::{
    FinanceAgent, GeneralAgent, HealthAgent, JournalAgent, ProductivityAgent, SchedulingAgent, SpecialistDeps,
};
use crate::task_board::TaskBoard;

/// External collaborators every agent is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn Generator>,
    /// Model-backed classifier consulted when pattern matching is unsure.
    pub classifier: Option<Arc<dyn Classifier>>,
    pub knowledge: Arc<dyn KnowledgeStore>,
}

fn cap(name: &str, description: &str, tools: &[&str]) -> Capability {
    Capability::new(name, description).with_tools(tools)
}

pub fn default_capabilities(agent_type: AgentType) -> Vec<Capability> {
    match agent_type {
        AgentType::Orchestrator => vec![
            cap("intent_classification", "Classify user intent and pick the right agent", &[])
                .with_parameter("confidence_threshold", json!(0.5)),
            cap("agent_coordination", "Coordinate handoffs between agents", &[])
                .with_parameter("max_handoffs", json!(3)),
            cap("conversation_management", "Keep conversation context across agents", &[]),
            cap("user_interaction", "Answer the user directly", &[])
                .with_parameter("response_style", json!("helpful_and_clear")),
        ],
        AgentType::Productivity => vec![
            cap("task_management", "Manage tasks, goals, and productivity tracking", &["google_sheets", "calendar"]),
            cap("goal_tracking", "Track and analyze goal progress", &["analytics", "reporting"]),
            cap("productivity_analysis", "Analyze productivity patterns and suggest improvements", &["data_analysis"]),
        ],
        AgentType::Health => vec![
            cap("habit_tracking", "Track and manage health habits", &["data_storage", "reminders"]),
            cap("wellness_monitoring", "Monitor wellness metrics and trends", &["analytics", "visualization"]),
            cap("routine_management", "Manage daily and weekly health routines", &["scheduling", "notifications"]),
        ],
        AgentType::Finance => vec![
            cap("expense_tracking", "Track and categorize expenses", &["google_sheets", "data_analysis"]),
            cap("budget_management", "Manage budgets and financial goals", &["analytics", "reporting"]),
            cap("financial_analysis", "Analyze spending patterns and financial health", &["data_analysis", "visualization"]),
        ],
        AgentType::Scheduling => vec![
            cap("calendar_management", "Manage calendar events and scheduling", &["google_calendar", "scheduling"]),
            cap("appointment_booking", "Book and manage appointments", &["calendar", "notifications"]),
            cap("time_optimization", "Optimize time allocation and scheduling", &["analytics", "optimization"]),
        ],
        AgentType::Journal => vec![
            cap("reflection_guidance", "Guide users through reflection exercises", &["prompting", "conversation"]),
            cap("mood_tracking", "Track and analyze mood patterns", &["data_storage", "analytics"]),
            cap("growth_insights", "Provide insights on personal growth", &["analysis", "reporting"]),
        ],
        AgentType::General => vec![
            cap("general_assistance", "Provide general help and information", &["conversation", "knowledge_base"]),
            cap("agent_coordination", "Coordinate with other agents", &["communication", "routing"]),
            cap("fallback_support", "Handle requests when other agents are unavailable", &["conversation", "basic_tools"]),
        ],
    }
}

pub fn default_agent_id(agent_type: AgentType) -> String {
    match agent_type {
        AgentType::Orchestrator => "orchestrator_main".to_string(),
        other => format!("{}_specialized", other),
    }
}

fn direct_responder(collaborators: &Collaborators, config: &Config) -> Arc<DirectResponder> {
    Arc::new(DirectResponder::new(
        Arc::clone(&collaborators.generator),
        Arc::clone(&collaborators.knowledge),
        config.agents.defaults.collaborator_timeout(),
    ))
}

fn build_agent(
    agent_type: AgentType,
    collaborators: &Collaborators,
    config: &Config,
    responder: Option<Arc<DirectResponder>>,
) -> (Arc<AgentRuntime>, Option<TaskBoard>) {
    let deps = SpecialistDeps::from_defaults(
        Arc::clone(&collaborators.generator),
        Arc::clone(&collaborators.knowledge),
        &config.agents.defaults,
    );
    let mut board = None;
    let logic: Box<dyn AgentLogic> = match agent_type {
        AgentType::Orchestrator => {
            let responder = responder.unwrap_or_else(|| direct_responder(collaborators, config));
            Box::new(OrchestratorLogic::new(responder))
        }
        AgentType::Productivity => {
            let tasks = TaskBoard::new();
            board = Some(tasks.clone());
            Box::new(ProductivityAgent::with_board(deps, tasks))
        }
        AgentType::Health => Box::new(HealthAgent::new(deps)),
        AgentType::Finance => Box::new(FinanceAgent::new(deps)),
        AgentType::Scheduling => Box::new(SchedulingAgent::new(deps)),
        AgentType::Journal => Box::new(JournalAgent::new(deps)),
        AgentType::General => Box::new(GeneralAgent::new(deps)),
    };
    let runtime = AgentRuntime::new(
        &default_agent_id(agent_type),
        agent_type,
        default_capabilities(agent_type),
        logic,
    )
    .with_max_history(config.directory.max_message_history);
    (Arc::new(runtime), board)
}

/// Builds an unregistered agent of the given type with its default id and capabilities.
pub fn create_agent(agent_type: AgentType, collaborators: &Collaborators, config: &Config) -> Arc<AgentRuntime> {
    build_agent(agent_type, collaborators, config, None).0
}

/// HANDOFF: accept right away, run the original input, report back with TASK_COMPLETION.
/// REQUEST: run the capability request and answer with the agent's response.
fn register_default_handlers(bus: &Arc<MessageBus>, agent: &Arc<AgentRuntime>) {
    let weak_bus: Weak<MessageBus> = Arc::downgrade(bus);
    let weak_agent: Weak<AgentRuntime> = Arc::downgrade(agent);
    bus.register_handler(agent.id(), MessageType::Handoff, move |msg: Message| {
        let bus = weak_bus.clone();
        let agent = weak_agent.clone();
        async move {
            let Some(agent) = agent.upgrade() else {
                return Ok(Some(
                    HandlerReply::new(json!({ "accepted": false })).with_metadata("handoff_accepted", json!(false)),
                ));
            };
            let context = msg
                .content
                .get("context")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let input = msg
                .content
                .get("original_input")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let session = context.get("session_id").and_then(Value::as_str).map(str::to_string);
            let request = AgentRequest {
                user_input: input,
                session_id: session,
                context,
            };
            let agent_id = agent.id().to_string();
            let requester = msg.from_agent.clone();
            let handoff_id = msg.message_id.clone();

            tokio::spawn(async move {
                let output = agent.execute(&request).await;
                let content = match output.response_text() {
                    Ok(text) => json!({ "status": "completed", "handoff_id": handoff_id, "response": text }),
                    Err(e) => json!({ "status": "failed", "handoff_id": handoff_id, "error": e.to_string() }),
                };
                let Some(bus) = bus.upgrade() else {
                    return;
                };
                let outgoing = OutgoingMessage::new(agent.id(), &requester, MessageType::TaskCompletion, content);
                if let Err(e) = bus.send(outgoing).await {
                    warn!(agent_id = %agent.id(), error = %e, "Could not report handoff completion");
                }
            });

            Ok(Some(
                HandlerReply::new(json!({ "accepted": true, "agent_id": agent_id }))
                    .with_metadata("handoff_accepted", json!(true)),
            ))
        }
    });

    let weak_agent: Weak<AgentRuntime> = Arc::downgrade(agent);
    bus.register_handler(agent.id(), MessageType::Request, move |msg: Message| {
        let agent = weak_agent.clone();
        async move {
            let agent = agent
                .upgrade()
                .ok_or_else(|| Error::AgentNotFound(msg.to_agent.clone()))?;
            let capability = msg
                .content
                .get("capability")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let parameters = msg
                .content
                .get("parameters")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let input = parameters
                .get("input")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("Capability request: {}", capability));

            let output = agent
                .execute(&AgentRequest::new(&input).with_context(parameters))
                .await;
            let text = output.response_text()?;
            Ok::<_, Error>(Some(HandlerReply::new(json!({ "capability": capability, "response": text }))))
        }
    });
}

/// Owns one running set of agents: directory, bus, orchestrator and collaborators.
pub struct Ecosystem {
    config: Config,
    collaborators: Collaborators,
    directory: Arc<AgentDirectory>,
    bus: Arc<MessageBus>,
    orchestrator: RwLock<Option<Arc<Orchestrator>>>,
    boards: Mutex<HashMap<String, TaskBoard>>,
    initialized: Mutex<bool>,
}

impl Ecosystem {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let directory = Arc::new(AgentDirectory::new(config.directory.clone()));
        let bus = Arc::new(MessageBus::new(Arc::clone(&directory), config.bus.clone()));
        Self {
            config,
            collaborators,
            directory,
            bus,
            orchestrator: RwLock::new(None),
            boards: Mutex::new(HashMap::new()),
            initialized: Mutex::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn directory(&self) -> &Arc<AgentDirectory> {
        &self.directory
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn orchestrator(&self) -> Option<Arc<Orchestrator>> {
        self.orchestrator.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Task board of a productivity agent, by agent id.
    pub fn task_board(&self, agent_id: &str) -> Option<TaskBoard> {
        lock(&self.boards).get(agent_id).cloned()
    }

    pub fn is_initialized(&self) -> bool {
        *lock(&self.initialized)
    }

    /// Creates the orchestrator and the requested specialists, wires their
    /// bus handlers and starts the bus. Must run inside a tokio runtime.
    pub fn initialize(&self, agent_types: &[AgentType]) -> Value {
        let mut initialized = lock(&self.initialized);
        if *initialized {
            warn!("Agent ecosystem already initialized");
            return json!({ "status": "already_initialized" });
        }

        let mut created = Vec::new();
        let mut failed = Vec::new();

        let responder = direct_responder(&self.collaborators, &self.config);
        let (runtime, _) = build_agent(
            AgentType::Orchestrator,
            &self.collaborators,
            &self.config,
            Some(Arc::clone(&responder)),
        );
        match self.directory.try_register(Arc::clone(&runtime)) {
            Ok(()) => {
                register_default_handlers(&self.bus, &runtime);
                created.push(runtime.id().to_string());
            }
            Err(e) => {
                warn!(error = %e, "Orchestrator registration failed");
                failed.push(json!({ "agent_type": AgentType::Orchestrator, "error": e.to_string() }));
            }
        }

        let classifier = Arc::new(HybridClassifier::new(
            PatternClassifier::from_config(&self.config.routing),
            self.collaborators.classifier.clone(),
            &self.config.routing,
            self.config.agents.defaults.collaborator_timeout(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            runtime,
            Arc::clone(&self.bus),
            classifier,
            responder,
            Arc::clone(&self.collaborators.knowledge),
            self.config.routing.clone(),
        ));
        *self.orchestrator.write().unwrap_or_else(|p| p.into_inner()) = Some(orchestrator);

        for agent_type in agent_types.iter().filter(|t| **t != AgentType::Orchestrator) {
            let (agent, board) = build_agent(*agent_type, &self.collaborators, &self.config, None);
            match self.directory.try_register(Arc::clone(&agent)) {
                Ok(()) => {
                    register_default_handlers(&self.bus, &agent);
                    if let Some(board) = board {
                        lock(&self.boards).insert(agent.id().to_string(), board);
                    }
                    created.push(agent.id().to_string());
                }
                Err(e) => {
                    warn!(agent_type = %agent_type, error = %e, "Agent creation failed");
                    failed.push(json!({ "agent_type": agent_type, "error": e.to_string() }));
                }
            }
        }

        let bus_started = self.bus.start() || self.bus.is_running();
        *initialized = true;
        info!(agents = created.len(), failed = failed.len(), "Agent ecosystem initialized");
        json!({
            "status": "initialized",
            "created_agents": created,
            "failed_agents": failed,
            "total_agents": created.len(),
            "bus_started": bus_started,
            "timestamp": Utc::now().to_rfc3339(),
        })
    }

    /// Starts with the agent types enabled in the configuration.
    pub fn initialize_from_config(&self) -> Value {
        let types = self.config.agents.enabled.clone();
        self.initialize(&types)
    }

    pub async fn shutdown(&self) -> Value {
        if !self.is_initialized() {
            return json!({ "status": "not_initialized" });
        }
        self.bus.stop().await;
        for id in self.directory.ids() {
            self.bus.unregister_agent_handlers(&id);
        }
        let removed = self.directory.clear();
        *self.orchestrator.write().unwrap_or_else(|p| p.into_inner()) = None;
        lock(&self.boards).clear();
        *lock(&self.initialized) = false;
        info!(agents_removed = removed, "Agent ecosystem shut down");
        json!({
            "status": "shutdown",
            "agents_removed": removed,
            "timestamp": Utc::now().to_rfc3339(),
        })
    }

    pub fn status(&self) -> Value {
        json!({
            "initialized": self.is_initialized(),
            "directory": self.directory.stats(),
            "bus": self.bus.stats(),
            "health": self.directory.health_check(),
            "timestamp": Utc::now().to_rfc3339(),
        })
    }

    /// Convenience wrapper over [`Orchestrator::handle`].
    pub async fn handle(
        &self,
        user_input: &str,
        session_id: Option<&str>,
        context: Map<String, Value>,
    ) -> Option<crate::orchestrator::HandleOutcome> {
        let orchestrator = self.orchestrator()?;
        Some(orchestrator.handle(user_input, session_id, context).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::InMemoryKnowledgeStore;
    use crate::orchestrator::tests::CannedGenerator;
    use crate::orchestrator::RoutePath;
    use concord_core::AgentStatus;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn collaborators(reply: &str) -> Collaborators {
        Collaborators {
            generator: CannedGenerator::answering(reply),
            classifier: None,
            knowledge: Arc::new(InMemoryKnowledgeStore::new()),
        }
    }

    fn ecosystem() -> Ecosystem {
        Ecosystem::new(Config::default(), collaborators("specialist answer"))
    }

    #[test]
    fn test_default_capabilities_and_ids() {
        let orch = default_capabilities(AgentType::Orchestrator);
        let coordination = orch.iter().find(|c| c.name == "agent_coordination").unwrap();
        assert_eq!(coordination.parameters.get("max_handoffs"), Some(&json!(3)));
        assert_eq!(default_agent_id(AgentType::Orchestrator), "orchestrator_main");
        assert_eq!(default_agent_id(AgentType::Finance), "finance_specialized");
        for t in AgentType::ALL {
            assert!(!default_capabilities(t).is_empty());
        }
    }

    #[test]
    fn test_create_agent() {
        let agent = create_agent(AgentType::Journal, &collaborators("x"), &Config::default());
        assert_eq!(agent.id(), "journal_specialized");
        assert!(agent.has_capability("mood_tracking"));
        assert_eq!(agent.status(), AgentStatus::Idle);
        assert!(!agent.is_registered());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let eco = ecosystem();
        let result = eco.initialize(&AgentType::SPECIALISTS);
        assert_eq!(result["status"], json!("initialized"));
        assert_eq!(result["total_agents"], json!(7));
        assert!(eco.bus().is_running());
        assert!(eco.directory().orchestrator().is_some());
        assert!(eco.task_board("productivity_specialized").is_some());

        assert_eq!(eco.initialize(&AgentType::SPECIALISTS)["status"], json!("already_initialized"));
        assert_eq!(eco.directory().len(), 7);
        eco.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_types_reported_as_failed() {
        let eco = ecosystem();
        let result = eco.initialize(&[AgentType::Health, AgentType::Health]);
        assert_eq!(result["total_agents"], json!(2));
        assert_eq!(result["failed_agents"].as_array().map(Vec::len), Some(1));
        eco.shutdown().await;
    }

    #[tokio::test]
    async fn test_end_to_end_delegation() {
        let eco = ecosystem();
        eco.initialize(&AgentType::SPECIALISTS);
        let out = eco
            .handle("I need to organize my tasks for today", Some("s1"), Map::new())
            .await
            .unwrap();
        assert_eq!(out.rationale.path, RoutePath::Delegated);
        assert_eq!(out.rationale.target_agent_id.as_deref(), Some("productivity_specialized"));
        assert_eq!(out.response, "specialist answer");
        eco.shutdown().await;
    }

    #[tokio::test]
    async fn test_handoff_over_bus_reports_completion() {
        let eco = ecosystem();
        eco.initialize(&[AgentType::Health]);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Message>();
        eco.bus().register_handler("orchestrator_main", MessageType::TaskCompletion, move |msg: Message| {
            let done_tx = done_tx.clone();
            async move {
                let _ = done_tx.send(msg);
                Ok(None)
            }
        });

        let orchestrator = eco.orchestrator().unwrap();
        let request = AgentRequest::new("help me sleep better");
        assert!(orchestrator.handoff("health_specialized", &request).await);

        let done = tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.from_agent, "health_specialized");
        assert_eq!(done.content["status"], json!("completed"));
        assert_eq!(done.content["response"], json!("specialist answer"));
        eco.shutdown().await;
    }

    #[tokio::test]
    async fn test_capability_request_is_answered() {
        let eco = ecosystem();
        eco.initialize(&[AgentType::Finance]);
        let mut params = Map::new();
        params.insert("input".to_string(), json!("track my spending"));
        let reply = eco
            .bus()
            .request_capability("orchestrator_main", "expense_tracking", params, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.from_agent, "finance_specialized");
        assert_eq!(reply.content["response"], json!("specialist answer"));
        eco.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_clears_and_allows_reinitialize() {
        let eco = ecosystem();
        assert_eq!(eco.shutdown().await["status"], json!("not_initialized"));
        eco.initialize(&[AgentType::General]);
        let result = eco.shutdown().await;
        assert_eq!(result["agents_removed"], json!(2));
        assert!(eco.directory().is_empty());
        assert!(!eco.bus().is_running());
        assert_eq!(eco.bus().stats().handlers, 0);
        assert!(eco.orchestrator().is_none());

        assert_eq!(eco.initialize(&[AgentType::General])["status"], json!("initialized"));
        assert_eq!(eco.status()["initialized"], json!(true));
        eco.shutdown().await;
    }
}
