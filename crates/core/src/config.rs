use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::paths::Paths;
use crate::types::AgentType;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_base: Option<String>,
    /// Unset follows HTTPS_PROXY. An empty string forces a direct connection.
    #[serde(default)]
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefaults {
    #[serde(default = "default_model")]
    pub model: String,
    /// Explicit provider name. When unset it is inferred from the model prefix.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Upper bound for one generator or classifier call.
    #[serde(default = "default_collaborator_timeout_secs")]
    pub collaborator_timeout_secs: u64,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_temperature() -> f32 {
    0.7
}

fn default_collaborator_timeout_secs() -> u64 {
    30
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            model: default_model(),
            provider: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            collaborator_timeout_secs: default_collaborator_timeout_secs(),
        }
    }
}

impl AgentDefaults {
    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_secs(self.collaborator_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    #[serde(default)]
    pub defaults: AgentDefaults,
    /// Specialists created at startup. The orchestrator is always created.
    #[serde(default = "default_enabled_agents")]
    pub enabled: Vec<AgentType>,
}

fn default_enabled_agents() -> Vec<AgentType> {
    AgentType::SPECIALISTS.to_vec()
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            defaults: AgentDefaults::default(),
            enabled: default_enabled_agents(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    /// Pattern results strictly above this skip the model classifier.
    #[serde(default = "default_fast_accept_threshold")]
    pub fast_accept_threshold: f64,
    /// Below this the orchestrator answers directly.
    #[serde(default = "default_routing_threshold")]
    pub routing_threshold: f64,
    #[serde(default = "default_pattern_base_confidence")]
    pub pattern_base_confidence: f64,
    #[serde(default = "default_pattern_step")]
    pub pattern_step: f64,
    #[serde(default = "default_pattern_cap")]
    pub pattern_cap: f64,
    #[serde(default = "default_no_match_confidence")]
    pub no_match_confidence: f64,
    #[serde(default = "default_classification_error_confidence")]
    pub classification_error_confidence: f64,
    #[serde(default = "default_max_handoffs")]
    pub max_handoffs: u32,
}

fn default_fast_accept_threshold() -> f64 {
    0.8
}

fn default_routing_threshold() -> f64 {
    0.5
}

fn default_pattern_base_confidence() -> f64 {
    0.5
}

fn default_pattern_step() -> f64 {
    0.2
}

fn default_pattern_cap() -> f64 {
    0.95
}

fn default_no_match_confidence() -> f64 {
    0.3
}

fn default_classification_error_confidence() -> f64 {
    0.5
}

fn default_max_handoffs() -> u32 {
    3
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            fast_accept_threshold: default_fast_accept_threshold(),
            routing_threshold: default_routing_threshold(),
            pattern_base_confidence: default_pattern_base_confidence(),
            pattern_step: default_pattern_step(),
            pattern_cap: default_pattern_cap(),
            no_match_confidence: default_no_match_confidence(),
            classification_error_confidence: default_classification_error_confidence(),
            max_handoffs: default_max_handoffs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_handoff_timeout_secs")]
    pub handoff_timeout_secs: u64,
    #[serde(default = "default_conversation_max_age_hours")]
    pub conversation_max_age_hours: u64,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_handoff_timeout_secs() -> u64 {
    10
}

fn default_conversation_max_age_hours() -> u64 {
    24
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            request_timeout_secs: default_request_timeout_secs(),
            handoff_timeout_secs: default_handoff_timeout_secs(),
            conversation_max_age_hours: default_conversation_max_age_hours(),
        }
    }
}

impl BusConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_secs(self.handoff_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryConfig {
    /// Agents inactive longer than this are reported stale.
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
    /// Idle agents inactive longer than this are evicted by the health monitor.
    #[serde(default = "default_max_idle_hours")]
    pub max_idle_hours: u64,
    #[serde(default = "default_error_window_secs")]
    pub error_window_secs: u64,
    #[serde(default = "default_error_streak_threshold")]
    pub error_streak_threshold: u32,
    #[serde(default = "default_max_message_history")]
    pub max_message_history: usize,
    #[serde(default = "default_health_tick_secs")]
    pub health_tick_secs: u64,
}

fn default_stale_threshold_secs() -> u64 {
    3600
}

fn default_max_idle_hours() -> u64 {
    24
}

fn default_error_window_secs() -> u64 {
    300
}

fn default_error_streak_threshold() -> u32 {
    3
}

fn default_max_message_history() -> usize {
    200
}

fn default_health_tick_secs() -> u64 {
    60
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            stale_threshold_secs: default_stale_threshold_secs(),
            max_idle_hours: default_max_idle_hours(),
            error_window_secs: default_error_window_secs(),
            error_streak_threshold: default_error_streak_threshold(),
            max_message_history: default_max_message_history(),
            health_tick_secs: default_health_tick_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert("openai".to_string(), ProviderConfig::default());
        providers.insert("openrouter".to_string(), ProviderConfig {
            api_key: String::new(),
            api_base: Some("https://openrouter.ai/api/v1".to_string()),
            proxy: None,
        });
        providers.insert("deepseek".to_string(), ProviderConfig::default());
        providers.insert("groq".to_string(), ProviderConfig::default());
        providers.insert("ollama".to_string(), ProviderConfig {
            api_key: "ollama".to_string(),
            api_base: Some("http://localhost:11434".to_string()),
            proxy: None,
        });

        Self {
            providers,
            agents: AgentsConfig::default(),
            routing: RoutingConfig::default(),
            bus: BusConfig::default(),
            directory: DirectoryConfig::default(),
        }
    }
}

impl Config {
    /// Reads a config file. JSON5 is accepted so hand-edited files may carry
    /// comments and trailing commas.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = json5::from_str(&content)?;
        config.validate()?;
        debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            debug!(path = %config_path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        info!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let r = &self.routing;
        let unit = [
            ("routing.fastAcceptThreshold", r.fast_accept_threshold),
            ("routing.routingThreshold", r.routing_threshold),
            ("routing.patternBaseConfidence", r.pattern_base_confidence),
            ("routing.patternStep", r.pattern_step),
            ("routing.patternCap", r.pattern_cap),
            ("routing.noMatchConfidence", r.no_match_confidence),
            ("routing.classificationErrorConfidence", r.classification_error_confidence),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{} must be within [0, 1], got {}", name, value)));
            }
        }

        let nonzero = [
            ("agents.defaults.collaboratorTimeoutSecs", self.agents.defaults.collaborator_timeout_secs),
            ("bus.requestTimeoutSecs", self.bus.request_timeout_secs),
            ("bus.handoffTimeoutSecs", self.bus.handoff_timeout_secs),
            ("bus.queueCapacity", self.bus.queue_capacity as u64),
            ("directory.healthTickSecs", self.directory.health_tick_secs),
            ("directory.errorStreakThreshold", self.directory.error_streak_threshold as u64),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }

    /// First provider with a usable key, in fallback order. Ollama is last.
    pub fn get_api_key(&self) -> Option<(&str, &ProviderConfig)> {
        let priority = ["openrouter", "deepseek", "openai", "groq", "ollama"];

        for name in priority {
            if let Some(provider) = self.providers.get(name) {
                if !provider.api_key.is_empty() {
                    return Some((name, provider));
                }
            }
        }
        None
    }

    pub fn get_provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.routing.fast_accept_threshold, 0.8);
        assert_eq!(cfg.routing.max_handoffs, 3);
        assert_eq!(cfg.bus.request_timeout_secs, 30);
        assert_eq!(cfg.bus.handoff_timeout_secs, 10);
        assert_eq!(cfg.directory.stale_threshold_secs, 3600);
        assert_eq!(cfg.agents.enabled.len(), 6);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_json5_with_comments() {
        let raw = r#"{
  // only override what we need
  routing: { routingThreshold: 0.6, },
  bus: { requestTimeoutSecs: 5 },
  agents: { enabled: ["health", "journal"] },
}"#;
        let cfg: Config = json5::from_str(raw).unwrap();
        assert_eq!(cfg.routing.routing_threshold, 0.6);
        assert_eq!(cfg.routing.fast_accept_threshold, 0.8);
        assert_eq!(cfg.bus.request_timeout_secs, 5);
        assert_eq!(cfg.bus.handoff_timeout_secs, 10);
        assert_eq!(cfg.agents.enabled, vec![AgentType::Health, AgentType::Journal]);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.routing.routing_threshold = 1.5;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = Config::default();
        cfg.bus.request_timeout_secs = 0;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("concord-config-{}", uuid::Uuid::new_v4()));
        let paths = Paths::with_base(dir.clone());
        let mut cfg = Config::default();
        cfg.agents.defaults.model = "deepseek-chat".to_string();
        cfg.save(&paths.config_file()).unwrap();

        let loaded = Config::load_or_default(&paths).unwrap();
        assert_eq!(loaded.agents.defaults.model, "deepseek-chat");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_get_api_key_prefers_remote_providers() {
        let mut cfg = Config::default();
        assert_eq!(cfg.get_api_key().map(|(n, _)| n), Some("ollama"));
        cfg.providers.get_mut("deepseek").unwrap().api_key = "sk-test".to_string();
        assert_eq!(cfg.get_api_key().map(|(n, _)| n), Some("deepseek"));
    }
}
