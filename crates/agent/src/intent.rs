use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use concord_core::{AgentType, Classification, ClassificationMethod, Result, RoutingConfig};
use concord_providers::Classifier;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Word patterns per specialist, in tie-break order.
const DEFAULT_PATTERNS: &[(AgentType, &[&str])] = &[
    (
        AgentType::Productivity,
        &[
            r"\b(tasks?|todos?|goals?|productivity|work|projects?|deadlines?|priority|priorities)\b",
            r"\b(organize|plan|manage|track|complete)\b",
            r"\b(efficient|focus|time management|workflow)\b",
        ],
    ),
    (
        AgentType::Health,
        &[
            r"\b(health|wellness|exercise|fitness|habits?|routine)\b",
            r"\b(sleep|diet|nutrition|workouts?|meditation|mindfulness)\b",
            r"\b(healthy|wellbeing|self-care|energy)\b",
        ],
    ),
    (
        AgentType::Finance,
        &[
            r"\b(money|budget|expenses?|spending|financial|finance)\b",
            r"\b(save|saving|savings|investments?|income|cost|price)\b",
            r"\b(bank|account|transactions?|bills?|payments?)\b",
        ],
    ),
    (
        AgentType::Scheduling,
        &[
            r"\b(calendar|appointments?|meetings?|schedule|date)\b",
            r"\b(book|reserve|arrange|reschedule)\b",
            r"\b(available|busy|free|conflict|timing)\b",
        ],
    ),
    (
        AgentType::Journal,
        &[
            r"\b(journal|reflect|reflection|mood|feelings?|emotions?)\b",
            r"\b(diary|thoughts|gratitude|mindset|growth)\b",
            r"\b(celebrate|achievements?|milestones?|progress)\b",
        ],
    ),
];

/// Case-insensitive regex, falling back to a literal match when the pattern
/// does not compile.
fn compile(pattern: &str) -> Option<Regex> {
    Regex::new(&format!("(?i){}", pattern))
        .or_else(|e| {
            warn!(pattern = %pattern, error = %e, "Invalid intent pattern, matching literally");
            Regex::new(&format!("(?i){}", regex::escape(pattern)))
        })
        .ok()
}

static DEFAULT_RULES: Lazy<Vec<PatternRule>> = Lazy::new(|| {
    DEFAULT_PATTERNS
        .iter()
        .map(|(agent_type, patterns)| PatternRule::new(*agent_type, patterns))
        .collect()
});

#[derive(Debug, Clone)]
pub struct PatternRule {
    agent_type: AgentType,
    patterns: Vec<Regex>,
}

impl PatternRule {
    pub fn new(agent_type: AgentType, patterns: &[&str]) -> Self {
        Self {
            agent_type,
            patterns: patterns.iter().filter_map(|p| compile(p)).collect(),
        }
    }

    pub fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    fn hits(&self, input: &str) -> Vec<String> {
        self.patterns
            .iter()
            .flat_map(|re| re.find_iter(input).map(|m| m.as_str().to_lowercase()))
            .collect()
    }
}

/// Fast, offline intent classifier.
///
/// Every regex hit counts once toward its agent type. The type with the most
/// hits wins, earlier rules winning ties, and its confidence grows linearly
/// with the hit count up to a cap.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    rules: Vec<PatternRule>,
    base_confidence: f64,
    step: f64,
    cap: f64,
    no_match_confidence: f64,
}

impl Default for PatternClassifier {
    fn default() -> Self {
        Self::from_config(&RoutingConfig::default())
    }
}

impl PatternClassifier {
    pub fn from_config(routing: &RoutingConfig) -> Self {
        Self {
            rules: DEFAULT_RULES.clone(),
            base_confidence: routing.pattern_base_confidence,
            step: routing.pattern_step,
            cap: routing.pattern_cap,
            no_match_confidence: routing.no_match_confidence,
        }
    }

    pub fn with_rules(mut self, rules: Vec<PatternRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn rules(&self) -> &[PatternRule] {
        &self.rules
    }

    pub fn classify(&self, input: &str) -> Classification {
        let mut best: Option<(AgentType, Vec<String>)> = None;
        for rule in &self.rules {
            let hits = rule.hits(input);
            if hits.is_empty() {
                continue;
            }
            let better = best.as_ref().map(|(_, b)| hits.len() > b.len()).unwrap_or(true);
            if better {
                best = Some((rule.agent_type, hits));
            }
        }

        match best {
            Some((agent_type, hits)) => {
                let confidence = (self.base_confidence + self.step * hits.len() as f64).min(self.cap);
                Classification::new(
                    agent_type,
                    confidence,
                    format!("{} pattern match(es) for {}", hits.len(), agent_type),
                    ClassificationMethod::Pattern,
                )
                .with_matches(hits)
            }
            None => Classification::new(
                AgentType::General,
                self.no_match_confidence,
                "No pattern matches",
                ClassificationMethod::Pattern,
            ),
        }
    }
}

/// Pattern matching first, the model classifier only when the pattern result
/// is not confident enough. The more confident of the two wins; the pattern
/// result wins ties.
pub struct HybridClassifier {
    pattern: PatternClassifier,
    model: Option<Arc<dyn Classifier>>,
    fast_accept_threshold: f64,
    error_confidence: f64,
    timeout: Duration,
}

impl HybridClassifier {
    pub fn new(
        pattern: PatternClassifier,
        model: Option<Arc<dyn Classifier>>,
        routing: &RoutingConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            pattern,
            model,
            fast_accept_threshold: routing.fast_accept_threshold,
            error_confidence: routing.classification_error_confidence,
            timeout,
        }
    }

    pub fn pattern(&self) -> &PatternClassifier {
        &self.pattern
    }
}

#[async_trait]
impl Classifier for HybridClassifier {
    async fn classify(&self, text: &str, context: &Map<String, Value>) -> Result<Classification> {
        let pattern = self.pattern.classify(text);
        if pattern.confidence > self.fast_accept_threshold {
            debug!(agent_type = %pattern.agent_type, confidence = pattern.confidence, "Fast-path classification");
            return Ok(pattern);
        }
        let Some(model) = &self.model else {
            return Ok(pattern);
        };

        let judged = match tokio::time::timeout(self.timeout, model.classify(text, context)).await {
            Ok(Ok(judged)) => judged,
            Ok(Err(e)) => {
                warn!(error = %e, "Model classification failed, falling back to general");
                Classification::fallback(self.error_confidence, format!("Classification error: {}", e))
            }
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "Model classification timed out");
                Classification::fallback(self.error_confidence, "Classification timed out")
            }
        };

        if judged.confidence > pattern.confidence {
            debug!(agent_type = %judged.agent_type, confidence = judged.confidence, method = ?judged.method, "Model result preferred");
            Ok(judged)
        } else {
            Ok(pattern)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use concord_core::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Classifier stub with a fixed answer and an optional delay.
    pub(crate) struct FixedClassifier {
        pub answer: std::result::Result<Classification, String>,
        pub delay: Option<Duration>,
        pub calls: AtomicUsize,
    }

    impl FixedClassifier {
        pub(crate) fn new(agent_type: AgentType, confidence: f64) -> Self {
            Self {
                answer: Ok(Classification::new(agent_type, confidence, "stub", ClassificationMethod::Model)),
                delay: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn failing() -> Self {
            Self { answer: Err("model offline".to_string()), ..Self::new(AgentType::General, 0.0) }
        }
    }

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(&self, _text: &str, _context: &Map<String, Value>) -> Result<Classification> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            self.answer.clone().map_err(Error::ClassificationFailure)
        }
    }

    fn hybrid(model: Arc<FixedClassifier>) -> HybridClassifier {
        HybridClassifier::new(
            PatternClassifier::default(),
            Some(model),
            &RoutingConfig::default(),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_organize_tasks_is_confident_productivity() {
        let c = PatternClassifier::default().classify("I need to organize my tasks for today");
        assert_eq!(c.agent_type, AgentType::Productivity);
        assert!((c.confidence - 0.9).abs() < 1e-9);
        assert_eq!(c.method, ClassificationMethod::Pattern);
        assert!(c.matches.contains(&"tasks".to_string()));
    }

    #[test]
    fn test_no_match_is_general() {
        let c = PatternClassifier::default().classify("what is the capital of peru");
        assert_eq!(c.agent_type, AgentType::General);
        assert!((c.confidence - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_ties_go_to_earlier_rule_and_confidence_is_capped() {
        // "plan" is a productivity word, "book" a scheduling word
        let c = PatternClassifier::default().classify("plan and book");
        assert_eq!(c.agent_type, AgentType::Productivity);

        let c = PatternClassifier::default()
            .classify("budget money expenses spending savings income bills payments");
        assert_eq!(c.agent_type, AgentType::Finance);
        assert!((c.confidence - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_custom_rules_and_literal_fallback() {
        let classifier = PatternClassifier::default()
            .with_rules(vec![PatternRule::new(AgentType::Journal, &["dear diary (", r"\bnotes\b"])]);
        assert_eq!(classifier.rules()[0].agent_type(), AgentType::Journal);
        let c = classifier.classify("Dear diary (today was long");
        assert_eq!(c.agent_type, AgentType::Journal);
    }

    #[tokio::test]
    async fn test_fast_path_skips_model() {
        let model = Arc::new(FixedClassifier::new(AgentType::Finance, 0.99));
        let c = hybrid(model.clone())
            .classify("I need to organize my tasks for today", &Map::new())
            .await
            .unwrap();
        assert_eq!(c.agent_type, AgentType::Productivity);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_model_wins_only_when_more_confident() {
        let model = Arc::new(FixedClassifier::new(AgentType::Finance, 0.85));
        let c = hybrid(model.clone()).classify("hello there", &Map::new()).await.unwrap();
        assert_eq!(c.agent_type, AgentType::Finance);
        assert_eq!(c.method, ClassificationMethod::Model);

        // one health hit gives 0.7; an equally confident model loses the tie
        let model = Arc::new(FixedClassifier::new(AgentType::Journal, 0.7));
        let c = hybrid(model).classify("my sleep", &Map::new()).await.unwrap();
        assert_eq!(c.agent_type, AgentType::Health);
    }

    #[tokio::test]
    async fn test_model_error_keeps_more_confident_pattern() {
        let c = hybrid(Arc::new(FixedClassifier::failing()))
            .classify("my sleep", &Map::new())
            .await
            .unwrap();
        assert_eq!(c.agent_type, AgentType::Health);
        assert_eq!(c.method, ClassificationMethod::Pattern);
        assert!((c.confidence - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_model_error_without_pattern_match_is_general() {
        let c = hybrid(Arc::new(FixedClassifier::failing()))
            .classify("what is the capital of peru", &Map::new())
            .await
            .unwrap();
        assert_eq!(c.agent_type, AgentType::General);
        assert_eq!(c.method, ClassificationMethod::Fallback);
        assert!((c.confidence - 0.5).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_timeout_falls_back_to_general() {
        let model = Arc::new(FixedClassifier {
            delay: Some(Duration::from_secs(120)),
            ..FixedClassifier::new(AgentType::Finance, 0.99)
        });
        let c = hybrid(model.clone()).classify("hello", &Map::new()).await.unwrap();
        assert_eq!(c.method, ClassificationMethod::Fallback);

        let c = hybrid(model).classify("my sleep", &Map::new()).await.unwrap();
        assert_eq!(c.agent_type, AgentType::Health);
    }

    #[tokio::test]
    async fn test_without_model_pattern_result_stands() {
        let classifier = HybridClassifier::new(
            PatternClassifier::default(),
            None,
            &RoutingConfig::default(),
            Duration::from_secs(1),
        );
        let c = classifier.classify("my sleep", &Map::new()).await.unwrap();
        assert_eq!(c.agent_type, AgentType::Health);
    }
}
