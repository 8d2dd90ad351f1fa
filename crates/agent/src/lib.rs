pub mod bus;
pub mod directory;
pub mod factory;
pub mod health;
pub mod intent;
pub mod knowledge;
pub mod orchestrator;
pub mod runtime;
pub mod specialists;
pub mod task_board;

pub use bus::{BusStats, HandlerReply, MessageBus, OutgoingMessage};
pub use directory::{AgentDirectory, DirectoryStats, HealthReport};
pub use factory::{create_agent, default_agent_id, default_capabilities, Collaborators, Ecosystem};
pub use health::{HealthMonitor, MaintenanceReport};
pub use intent::{HybridClassifier, PatternClassifier, PatternRule};
pub use knowledge::{InMemoryKnowledgeStore, KnowledgeSnippet, KnowledgeStore, NoopKnowledgeStore};
pub use orchestrator::{
    DirectResponder, HandleOutcome, OrchestratorLogic, Orchestrator, OutcomeStatus, RoutePath, RoutingRationale,
    SystemStatus,
};
pub use runtime::{AgentLogic, AgentOutput, AgentRequest, AgentRuntime, AgentSnapshot};
pub use specialists::{
    FinanceAgent, GeneralAgent, HealthAgent, JournalAgent, ProductivityAgent, SchedulingAgent, SpecialistDeps,
};
pub use task_board::{TaskBoard, TaskSummary};
