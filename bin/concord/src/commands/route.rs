use std::sync::Arc;

use concord_agent::{HybridClassifier, PatternClassifier};
use concord_core::Paths;
use concord_providers::{create_generator, Classifier, ModelClassifier};
use serde_json::Map;

use super::load_config;

pub async fn run(text: &str, use_model: bool) -> anyhow::Result<()> {
    let config = load_config(&Paths::new())?;
    let pattern = PatternClassifier::from_config(&config.routing);

    let classification = if use_model {
        let generator = create_generator(&config)?;
        let model: Arc<dyn Classifier> = Arc::new(ModelClassifier::new(generator));
        let hybrid = HybridClassifier::new(
            pattern,
            Some(model),
            &config.routing,
            config.agents.defaults.collaborator_timeout(),
        );
        hybrid.classify(text, &Map::new()).await?
    } else {
        pattern.classify(text)
    };

    println!("{}", serde_json::to_string_pretty(&classification)?);
    let routed = classification.confidence > config.routing.routing_threshold;
    println!(
        "→ {}",
        if routed {
            format!("delegate to {}", classification.agent_type)
        } else {
            "answer directly".to_string()
        }
    );
    Ok(())
}
