use async_trait::async_trait;
use concord_core::{AgentType, Classification, ClassificationMethod, Error, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{Classifier, Generator};

const SYSTEM_PROMPT: &str =
    "You are an expert at classifying user intents for routing to specialized AI agents.";

/// Confidence given when the model names an agent but not in the JSON form.
const LABEL_SCAN_CONFIDENCE: f64 = 0.75;
/// Confidence given when the model output names no agent at all.
const UNPARSEABLE_CONFIDENCE: f64 = 0.4;

/// Classifier that asks a [`Generator`] for a JSON routing judgment.
pub struct ModelClassifier {
    generator: Arc<dyn Generator>,
    max_tokens: u32,
}

impl ModelClassifier {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator, max_tokens: 150 }
    }

    fn build_prompt(text: &str, context: &Map<String, Value>) -> String {
        let mut prompt = format!(
            "Analyze the following user input and determine which agent should handle it:\n\
             User Input: \"{}\"\n\n\
             Available Agents:\n\
             - PRODUCTIVITY: Task management, goal tracking, productivity optimization\n\
             - HEALTH: Wellness tracking, habit formation, health routines\n\
             - FINANCE: Expense tracking, budget management, financial goals\n\
             - SCHEDULING: Calendar management, appointment scheduling, time optimization\n\
             - JOURNAL: Daily reflections, mood tracking, personal growth\n\
             - GENERAL: General questions, unclassified requests, fallback support\n\n\
             Return ONLY a JSON object like: \
             {{\"agent_type\": \"PRODUCTIVITY\", \"confidence\": 0.86, \"reason\": \"short explanation\"}}",
            text
        );
        if !context.is_empty() {
            prompt.push_str("\n\nAdditional Context:\n");
            for (k, v) in context {
                match v {
                    Value::String(s) => prompt.push_str(&format!("- {}: {}\n", k, s)),
                    other => prompt.push_str(&format!("- {}: {}\n", k, other)),
                }
            }
        }
        prompt
    }
}

#[derive(Debug, Deserialize)]
struct Judgment {
    #[serde(default)]
    agent_type: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reason: Option<String>,
}

/// The orchestrator never routes to itself, so that label reads as general.
fn routable(agent_type: AgentType) -> AgentType {
    if agent_type == AgentType::Orchestrator {
        AgentType::General
    } else {
        agent_type
    }
}

/// Slice from the first `{` to the last `}`; models like to wrap JSON in prose or fences.
fn json_object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

pub(crate) fn parse_judgment(response_text: &str) -> Classification {
    let trimmed = response_text.trim();

    if let Some(span) = json_object_span(trimmed) {
        if let Ok(judgment) = serde_json::from_str::<Judgment>(span) {
            let agent_type = judgment
                .agent_type
                .as_deref()
                .and_then(|label| label.parse::<AgentType>().ok())
                .map(routable)
                .unwrap_or(AgentType::General);
            let confidence = judgment
                .confidence
                .filter(|c| c.is_finite())
                .unwrap_or(0.5)
                .clamp(0.0, 1.0);
            let reason = judgment.reason.unwrap_or_else(|| trimmed.to_string());
            return Classification::new(agent_type, confidence, reason, ClassificationMethod::Model);
        }
    }

    let upper = trimmed.to_uppercase();
    for agent_type in AgentType::SPECIALISTS {
        if upper.contains(&agent_type.as_str().to_uppercase()) {
            return Classification::new(
                agent_type,
                LABEL_SCAN_CONFIDENCE,
                trimmed,
                ClassificationMethod::Model,
            );
        }
    }

    Classification::new(
        AgentType::General,
        UNPARSEABLE_CONFIDENCE,
        trimmed,
        ClassificationMethod::Model,
    )
}

#[async_trait]
impl Classifier for ModelClassifier {
    async fn classify(&self, text: &str, context: &Map<String, Value>) -> Result<Classification> {
        let prompt = Self::build_prompt(text, context);
        let response = self
            .generator
            .complete(SYSTEM_PROMPT, &prompt, self.max_tokens, 0.0)
            .await
            .map_err(|e| {
                warn!(error = %e, "Model classification failed");
                Error::ClassificationFailure(e.to_string())
            })?;

        let classification = parse_judgment(&response);
        debug!(
            agent_type = %classification.agent_type,
            confidence = classification.confidence,
            "Model classification"
        );
        Ok(classification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedGenerator(std::result::Result<String, String>);

    #[async_trait]
    impl Generator for CannedGenerator {
        async fn complete(&self, _s: &str, _u: &str, _m: u32, _t: f32) -> Result<String> {
            self.0.clone().map_err(Error::Provider)
        }
    }

    #[test]
    fn test_parse_json_judgment() {
        let c = parse_judgment(r#"{"agent_type": "FINANCE", "confidence": 0.86, "reason": "budget talk"}"#);
        assert_eq!(c.agent_type, AgentType::Finance);
        assert!((c.confidence - 0.86).abs() < 1e-9);
        assert_eq!(c.reason, "budget talk");
        assert_eq!(c.method, ClassificationMethod::Model);
    }

    #[test]
    fn test_parse_out_of_range_confidence_is_clamped() {
        let high = parse_judgment(r#"{"agent_type": "HEALTH", "confidence": 7.5}"#);
        assert_eq!(high.agent_type, AgentType::Health);
        assert_eq!(high.confidence, 1.0);

        let low = parse_judgment(r#"{"agent_type": "HEALTH", "confidence": -0.4}"#);
        assert_eq!(low.confidence, 0.0);

        let huge = parse_judgment(r#"{"agent_type": "HEALTH", "confidence": 1e400}"#);
        assert!(huge.confidence <= 1.0);
    }

    #[test]
    fn test_parse_fenced_json() {
        let c = parse_judgment("```json\n{\"agent_type\": \"journal\", \"confidence\": 0.7}\n```");
        assert_eq!(c.agent_type, AgentType::Journal);
        assert!((c.confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_parse_label_scan_fallback() {
        let c = parse_judgment("I think SCHEDULING fits because it mentions a meeting.");
        assert_eq!(c.agent_type, AgentType::Scheduling);
        assert_eq!(c.confidence, LABEL_SCAN_CONFIDENCE);
    }

    #[test]
    fn test_parse_unrecognized_output() {
        let c = parse_judgment("no idea");
        assert_eq!(c.agent_type, AgentType::General);
        assert_eq!(c.confidence, UNPARSEABLE_CONFIDENCE);
    }

    #[test]
    fn test_orchestrator_label_maps_to_general() {
        let c = parse_judgment(r#"{"agent_type": "ORCHESTRATOR", "confidence": 0.9}"#);
        assert_eq!(c.agent_type, AgentType::General);
    }

    #[test]
    fn test_prompt_includes_context() {
        let mut ctx = Map::new();
        ctx.insert("timezone".to_string(), Value::String("UTC".to_string()));
        let prompt = ModelClassifier::build_prompt("book a dentist", &ctx);
        assert!(prompt.contains("book a dentist"));
        assert!(prompt.contains("- timezone: UTC"));
    }

    #[tokio::test]
    async fn test_classify_through_generator() {
        let gen = Arc::new(CannedGenerator(Ok(
            r#"{"agent_type":"health","confidence":0.65,"reason":"sleep"}"#.to_string(),
        )));
        let classifier = ModelClassifier::new(gen);
        let c = classifier.classify("I can't sleep", &Map::new()).await.unwrap();
        assert_eq!(c.agent_type, AgentType::Health);
    }

    #[tokio::test]
    async fn test_generator_error_is_classification_failure() {
        let gen = Arc::new(CannedGenerator(Err("down".to_string())));
        let classifier = ModelClassifier::new(gen);
        let err = classifier.classify("hello", &Map::new()).await.unwrap_err();
        assert!(matches!(err, Error::ClassificationFailure(_)));
    }
}
