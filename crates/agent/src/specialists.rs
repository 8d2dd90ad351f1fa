use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use concord_core::{AgentDefaults, AgentType, Result};
use concord_providers::Generator;
use serde_json::{json, Map, Value};
use tracing::{debug, error, warn};

use crate::knowledge::KnowledgeStore;
use crate::orchestrator::{interaction_context, with_context_lines};
use crate::runtime::{AgentLogic, AgentOutput, AgentRequest};
use crate::task_board::TaskBoard;

const SPECIALIST_CONTEXT_RESULTS: usize = 5;

/// Collaborators and generation settings shared by every specialist.
#[derive(Clone)]
pub struct SpecialistDeps {
    pub generator: Arc<dyn Generator>,
    pub knowledge: Arc<dyn KnowledgeStore>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

impl SpecialistDeps {
    pub fn from_defaults(
        generator: Arc<dyn Generator>,
        knowledge: Arc<dyn KnowledgeStore>,
        defaults: &AgentDefaults,
    ) -> Self {
        Self {
            generator,
            knowledge,
            max_tokens: defaults.max_tokens,
            temperature: defaults.temperature,
            timeout: defaults.collaborator_timeout(),
        }
    }
}

struct Focus {
    name: &'static str,
    keywords: &'static [&'static str],
    instruction: &'static str,
}

struct Profile {
    prompt: &'static str,
    focuses: &'static [Focus],
    general: Focus,
    apology: &'static str,
}

static PRODUCTIVITY: Profile = Profile {
    prompt: "You are the productivity agent. You help the user create, organize and prioritize \
tasks, set achievable goals, and protect their focus time. Give practical, actionable steps.",
    focuses: &[
        Focus {
            name: "task_management",
            keywords: &["task", "todo", "organize", "project"],
            instruction: "Help organize and prioritize the user's tasks. Refer to their open tasks when useful.",
        },
        Focus {
            name: "goal_setting",
            keywords: &["goal", "objective", "target", "achieve"],
            instruction: "Help shape a specific, measurable goal and break it into next steps.",
        },
        Focus {
            name: "time_management",
            keywords: &["time", "schedule", "productivity", "focus"],
            instruction: "Suggest how to allocate time and protect focus.",
        },
    ],
    general: Focus {
        name: "general_productivity",
        keywords: &[],
        instruction: "Give concise productivity advice for the request.",
    },
    apology: "I'm having trouble with productivity assistance right now. Please try again later.",
};

static HEALTH: Profile = Profile {
    prompt: "You are the health agent. You support the user's wellness: habits, routines, sleep, \
exercise and nutrition. Favor small sustainable changes and suggest a professional for \
serious concerns.",
    focuses: &[
        Focus {
            name: "meal_planning",
            keywords: &["meal", "food", "recipe", "nutrition", "diet", "eating", "breakfast", "lunch", "dinner", "cook"],
            instruction: "Propose a simple meal plan that fits the user's preferences.",
        },
        Focus {
            name: "habit_tracking",
            keywords: &["habit", "routine", "track", "exercise", "workout", "sleep", "water", "steps"],
            instruction: "Help the user build or track a healthy habit.",
        },
    ],
    general: Focus {
        name: "general_health",
        keywords: &[],
        instruction: "Answer the wellness question supportively.",
    },
    apology: "I encountered an issue while processing your health request. Please try again.",
};

static FINANCE: Profile = Profile {
    prompt: "You are the finance agent. You help the user track expenses, manage budgets and \
reach savings goals. Be practical and non-judgmental.",
    focuses: &[
        Focus {
            name: "budget_planning",
            keywords: &["budget"],
            instruction: "Help draft or adjust a budget.",
        },
        Focus {
            name: "expense_tracking",
            keywords: &["expense", "spending"],
            instruction: "Help categorize and review spending.",
        },
        Focus {
            name: "financial_goals",
            keywords: &["save", "savings", "financial goal"],
            instruction: "Help plan toward a savings or financial goal.",
        },
    ],
    general: Focus {
        name: "general_finance",
        keywords: &[],
        instruction: "Answer the personal finance question.",
    },
    apology: "I'm having trouble with financial analysis right now. Please try again later.",
};

static SCHEDULING: Profile = Profile {
    prompt: "You are the scheduling agent. You organize the user's calendar, book appointments \
and resolve conflicts. Confirm before proposing changes.",
    focuses: &[
        Focus {
            name: "scheduling",
            keywords: &["schedule", "calendar", "appointment", "meeting"],
            instruction: "Help arrange the calendar entries involved.",
        },
        Focus {
            name: "time_optimization",
            keywords: &["time block", "optimize", "time management"],
            instruction: "Suggest time blocks that fit the user's energy and priorities.",
        },
        Focus {
            name: "appointment_booking",
            keywords: &["book", "booking", "available", "availability"],
            instruction: "Help find an available slot and book it.",
        },
    ],
    general: Focus {
        name: "general_scheduling",
        keywords: &[],
        instruction: "Answer the scheduling question.",
    },
    apology: "I'm having trouble with scheduling right now. Please try again later.",
};

static JOURNAL: Profile = Profile {
    prompt: "You are the journal agent. You guide daily reflection, mood tracking and personal \
growth with warm, open questions.",
    focuses: &[
        Focus {
            name: "daily_journaling",
            keywords: &["journal", "reflection", "reflect", "mood"],
            instruction: "Guide a short reflection on the user's day.",
        },
        Focus {
            name: "goal_tracking",
            keywords: &["goal", "progress", "achievement", "milestone"],
            instruction: "Help the user review progress and celebrate milestones.",
        },
        Focus {
            name: "habit_tracking",
            keywords: &["habit", "streak", "routine", "consistency"],
            instruction: "Help the user reflect on a habit and its streak.",
        },
        Focus {
            name: "emotional_wellness",
            keywords: &["feeling", "emotion", "stress", "wellness"],
            instruction: "Help the user name and process how they feel.",
        },
    ],
    general: Focus {
        name: "general_journaling",
        keywords: &[],
        instruction: "Offer a journaling prompt related to the request.",
    },
    apology: "I'm having trouble with journaling assistance right now. Please try again later.",
};

static GENERAL: Profile = Profile {
    prompt: "You are the general assistant. You answer questions that do not belong to a \
specific life domain, clearly and briefly.",
    focuses: &[],
    general: Focus {
        name: "general_assistance",
        keywords: &[],
        instruction: "Answer the question directly.",
    },
    apology: "I'm having trouble answering right now. Please try again later.",
};

fn contains_any(input: &str, words: &[&str]) -> bool {
    let lower = input.to_lowercase();
    words.iter().any(|w| lower.contains(w))
}

/// Shared generation flow: pick a focus, gather knowledge, generate, record.
struct SpecialistCore {
    agent_type: AgentType,
    profile: &'static Profile,
    deps: SpecialistDeps,
}

impl SpecialistCore {
    fn new(agent_type: AgentType, profile: &'static Profile, deps: SpecialistDeps) -> Self {
        Self { agent_type, profile, deps }
    }

    fn focus_for(&self, input: &str) -> &'static Focus {
        self.profile
            .focuses
            .iter()
            .find(|f| contains_any(input, f.keywords))
            .unwrap_or(&self.profile.general)
    }

    async fn respond(&self, request: &AgentRequest, extra_context: Option<String>) -> AgentOutput {
        let focus = self.focus_for(&request.user_input);
        debug!(agent_type = %self.agent_type, focus = focus.name, "Specialist focus selected");

        let snippets = match self
            .deps
            .knowledge
            .relevant_context(&request.user_input, SPECIALIST_CONTEXT_RESULTS)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                warn!(agent_type = %self.agent_type, error = %e, "Knowledge lookup failed");
                Vec::new()
            }
        };

        let mut system = with_context_lines(self.profile.prompt, &snippets);
        if let Some(extra) = extra_context {
            system.push_str("\n\n");
            system.push_str(&extra);
        }
        system.push_str("\n\nFocus: ");
        system.push_str(focus.instruction);

        let mut details = Map::new();
        details.insert("agent_type".to_string(), json!(self.agent_type));
        details.insert("focus".to_string(), json!(focus.name));

        let completion = tokio::time::timeout(
            self.deps.timeout,
            self.deps.generator.complete(
                &system,
                &request.user_input,
                self.deps.max_tokens,
                self.deps.temperature,
            ),
        )
        .await;

        let response = match completion {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => return self.apologize(details, e.to_string()),
            Err(_) => return self.apologize(details, "generator timed out".to_string()),
        };

        if let Err(e) = self
            .deps
            .knowledge
            .record_interaction(self.agent_type.as_str(), &request.user_input, &response, &interaction_context(request))
            .await
        {
            warn!(agent_type = %self.agent_type, error = %e, "Failed to record interaction");
        }

        details.insert("context_used".to_string(), json!(snippets.len()));
        AgentOutput::Structured { response, details }
    }

    fn apologize(&self, mut details: Map<String, Value>, reason: String) -> AgentOutput {
        error!(agent_type = %self.agent_type, error = %reason, "Specialist generation failed");
        details.insert("status".to_string(), json!("error"));
        details.insert("error".to_string(), json!(reason));
        AgentOutput::Structured {
            response: self.profile.apology.to_string(),
            details,
        }
    }
}

const SCHEDULING_WORDS: &[&str] = &["calendar", "appointment", "meeting", "reschedule"];
const BODY_WORDS: &[&str] = &["workout", "exercise", "sleep"];

/// Tasks and goals. Owns the task board it reports on.
pub struct ProductivityAgent {
    core: SpecialistCore,
    board: TaskBoard,
}

impl ProductivityAgent {
    pub fn new(deps: SpecialistDeps) -> Self {
        Self::with_board(deps, TaskBoard::new())
    }

    pub fn with_board(deps: SpecialistDeps, board: TaskBoard) -> Self {
        Self {
            core: SpecialistCore::new(AgentType::Productivity, &PRODUCTIVITY, deps),
            board,
        }
    }

    pub fn board(&self) -> &TaskBoard {
        &self.board
    }

    async fn open_task_summary(&self) -> Option<String> {
        let open = self.board.open_tasks().await;
        if open.is_empty() {
            return None;
        }
        let summary = self.board.summary().await;
        let mut text = format!(
            "Open tasks ({} pending, {} in progress):",
            summary.pending, summary.in_progress
        );
        for task in open.iter().take(10) {
            text.push_str(&format!("\n- [{:?}] {} ({})", task.priority, task.title, task.status));
        }
        Some(text)
    }
}

#[async_trait]
impl AgentLogic for ProductivityAgent {
    fn system_prompt(&self) -> &str {
        self.core.profile.prompt
    }

    async fn execute(&self, request: &AgentRequest) -> Result<AgentOutput> {
        let summary = self.open_task_summary().await;
        Ok(self.core.respond(request, summary).await)
    }

    fn should_handoff(&self, input: &str, _context: &Map<String, Value>) -> bool {
        contains_any(input, SCHEDULING_WORDS)
    }

    fn determine_handoff_target(&self, input: &str, _context: &Map<String, Value>) -> Option<AgentType> {
        contains_any(input, SCHEDULING_WORDS).then_some(AgentType::Scheduling)
    }
}

/// Reflection and mood. Hands physical-health requests to the health agent.
pub struct JournalAgent {
    core: SpecialistCore,
}

impl JournalAgent {
    pub fn new(deps: SpecialistDeps) -> Self {
        Self { core: SpecialistCore::new(AgentType::Journal, &JOURNAL, deps) }
    }
}

#[async_trait]
impl AgentLogic for JournalAgent {
    fn system_prompt(&self) -> &str {
        self.core.profile.prompt
    }

    async fn execute(&self, request: &AgentRequest) -> Result<AgentOutput> {
        Ok(self.core.respond(request, None).await)
    }

    fn should_handoff(&self, input: &str, _context: &Map<String, Value>) -> bool {
        contains_any(input, BODY_WORDS)
    }

    fn determine_handoff_target(&self, input: &str, _context: &Map<String, Value>) -> Option<AgentType> {
        contains_any(input, BODY_WORDS).then_some(AgentType::Health)
    }
}

macro_rules! plain_specialist {
    ($(#[$doc:meta])* $name:ident, $agent_type:expr, $profile:expr) => {
        $(#[$doc])*
        pub struct $name {
            core: SpecialistCore,
        }

        impl $name {
            pub fn new(deps: SpecialistDeps) -> Self {
                Self { core: SpecialistCore::new($agent_type, &$profile, deps) }
            }
        }

        #[async_trait]
        impl AgentLogic for $name {
            fn system_prompt(&self) -> &str {
                self.core.profile.prompt
            }

            async fn execute(&self, request: &AgentRequest) -> Result<AgentOutput> {
                Ok(self.core.respond(request, None).await)
            }
        }
    };
}

plain_specialist!(
    /// Wellness, habits, nutrition.
    HealthAgent,
    AgentType::Health,
    HEALTH
);
plain_specialist!(
    /// Budgets, expenses, savings goals.
    FinanceAgent,
    AgentType::Finance,
    FINANCE
);
plain_specialist!(SchedulingAgent, AgentType::Scheduling, SCHEDULING);
plain_specialist!(GeneralAgent, AgentType::General, GENERAL);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::InMemoryKnowledgeStore;
    use crate::orchestrator::tests::CannedGenerator;
    use concord_core::{Task, TaskPriority};

    fn deps(generator: Arc<CannedGenerator>, knowledge: Arc<InMemoryKnowledgeStore>) -> SpecialistDeps {
        SpecialistDeps::from_defaults(generator, knowledge, &AgentDefaults::default())
    }

    fn detail<'a>(output: &'a AgentOutput, key: &str) -> Option<&'a Value> {
        output.details().and_then(|d| d.get(key))
    }

    #[tokio::test]
    async fn test_productivity_includes_open_tasks() {
        let generator = CannedGenerator::answering("Start with the report.");
        let knowledge = Arc::new(InMemoryKnowledgeStore::new());
        let agent = ProductivityAgent::new(deps(generator.clone(), knowledge.clone()));
        agent
            .board()
            .create(Task::new("Quarterly report", "").with_priority(TaskPriority::High))
            .await
            .unwrap();

        let out = agent
            .execute(&AgentRequest::new("help me organize my tasks"))
            .await
            .unwrap();
        assert_eq!(out.response_text().unwrap(), "Start with the report.");
        assert_eq!(detail(&out, "focus"), Some(&json!("task_management")));
        assert_eq!(detail(&out, "agent_type"), Some(&json!("productivity")));

        let system = generator.last_system_prompt().unwrap();
        assert!(system.contains("Quarterly report"));
        assert!(system.contains("1 pending"));
        assert_eq!(knowledge.interaction_count(), 1);
    }

    #[tokio::test]
    async fn test_focus_falls_back_to_general() {
        let generator = CannedGenerator::answering("ok");
        let agent = FinanceAgent::new(deps(generator, Arc::new(InMemoryKnowledgeStore::new())));
        let out = agent.execute(&AgentRequest::new("is gold a good idea")).await.unwrap();
        assert_eq!(detail(&out, "focus"), Some(&json!("general_finance")));

        let out = agent.execute(&AgentRequest::new("track my spending")).await.unwrap();
        assert_eq!(detail(&out, "focus"), Some(&json!("expense_tracking")));
    }

    #[tokio::test]
    async fn test_generator_failure_returns_domain_apology() {
        let knowledge = Arc::new(InMemoryKnowledgeStore::new());
        let agent = HealthAgent::new(deps(CannedGenerator::failing(), knowledge.clone()));
        let out = agent.execute(&AgentRequest::new("plan my meals")).await.unwrap();
        assert_eq!(out.response_text().unwrap(), HEALTH.apology);
        assert_eq!(detail(&out, "status"), Some(&json!("error")));
        assert_eq!(knowledge.interaction_count(), 0);
    }

    #[tokio::test]
    async fn test_knowledge_context_is_counted() {
        let knowledge = Arc::new(InMemoryKnowledgeStore::new());
        knowledge.add("Standup", "Team meeting every morning at 9", &["calendar"]);
        let agent = SchedulingAgent::new(deps(CannedGenerator::answering("ok"), knowledge));
        let out = agent
            .execute(&AgentRequest::new("move the morning meeting"))
            .await
            .unwrap();
        assert_eq!(detail(&out, "context_used"), Some(&json!(1)));
        assert_eq!(detail(&out, "focus"), Some(&json!("scheduling")));
    }

    #[test]
    fn test_handoff_hooks() {
        let knowledge = Arc::new(InMemoryKnowledgeStore::new());
        let productivity = ProductivityAgent::new(deps(CannedGenerator::answering(""), knowledge.clone()));
        let ctx = Map::new();
        assert!(productivity.should_handoff("Reschedule my meeting with Sam", &ctx));
        assert_eq!(
            productivity.determine_handoff_target("Reschedule my meeting with Sam", &ctx),
            Some(AgentType::Scheduling)
        );
        assert!(!productivity.should_handoff("organize my tasks", &ctx));

        let journal = JournalAgent::new(deps(CannedGenerator::answering(""), knowledge.clone()));
        assert_eq!(journal.determine_handoff_target("I skipped my workout", &ctx), Some(AgentType::Health));
        assert_eq!(journal.determine_handoff_target("I feel grateful", &ctx), None);

        let general = GeneralAgent::new(deps(CannedGenerator::answering(""), knowledge));
        assert!(!general.should_handoff("meeting", &ctx));
    }
}
