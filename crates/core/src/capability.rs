use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A named skill an agent claims to provide. Used for routing and matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Capability {
    /// Unique within one agent.
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// External tool identifiers. Informational only.
    #[serde(default)]
    pub required_tools: Vec<String>,
}

impl Capability {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: Map::new(),
            required_tools: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, key: &str, value: Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.required_tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }
}
