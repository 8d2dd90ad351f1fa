use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// The fixed set of agent kinds in the ecosystem.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Orchestrator,
    Productivity,
    Health,
    Finance,
    Scheduling,
    Journal,
    /// Generic fallback; requests classified here are answered directly.
    General,
}

impl AgentType {
    pub const ALL: [AgentType; 7] = [
        AgentType::Orchestrator,
        AgentType::Productivity,
        AgentType::Health,
        AgentType::Finance,
        AgentType::Scheduling,
        AgentType::Journal,
        AgentType::General,
    ];

    /// Every kind except the orchestrator.
    pub const SPECIALISTS: [AgentType; 6] = [
        AgentType::Productivity,
        AgentType::Health,
        AgentType::Finance,
        AgentType::Scheduling,
        AgentType::Journal,
        AgentType::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Orchestrator => "orchestrator",
            AgentType::Productivity => "productivity",
            AgentType::Health => "health",
            AgentType::Finance => "finance",
            AgentType::Scheduling => "scheduling",
            AgentType::Journal => "journal",
            AgentType::General => "general",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        AgentType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| Error::Validation(format!("unknown agent type '{}'", s)))
    }
}

/// Lifecycle states of an agent runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Active,
    Busy,
    Error,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Active => "active",
            AgentStatus::Busy => "busy",
            AgentStatus::Error => "error",
            AgentStatus::Offline => "offline",
        }
    }

    /// Idle and Active agents may be picked for new work.
    pub fn is_available(&self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Active)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which strategy produced a classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationMethod {
    Pattern,
    Model,
    /// Produced by error handling rather than a real judgment.
    Fallback,
}

/// An intent judgment: which agent type should handle the input, and how sure we are.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub agent_type: AgentType,
    pub confidence: f64,
    pub reason: String,
    pub method: ClassificationMethod,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<String>,
}

impl Classification {
    pub fn new(
        agent_type: AgentType,
        confidence: f64,
        reason: impl Into<String>,
        method: ClassificationMethod,
    ) -> Self {
        Self {
            agent_type,
            confidence: confidence.clamp(0.0, 1.0),
            reason: reason.into(),
            method,
            matches: Vec::new(),
        }
    }

    pub fn with_matches(mut self, matches: Vec<String>) -> Self {
        self.matches = matches;
        self
    }

    pub fn fallback(confidence: f64, reason: impl Into<String>) -> Self {
        Self::new(AgentType::General, confidence, reason, ClassificationMethod::Fallback)
    }
}
