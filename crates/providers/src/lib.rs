pub mod classifier;
pub mod client;
pub mod factory;
pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use concord_core::{Classification, Result};
use serde_json::{Map, Value};

/// Text completion backend used by the orchestrator and the specialists.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String>;
}

/// Intent classifier. Implementations decide which agent type should answer.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str, context: &Map<String, Value>) -> Result<Classification>;
}

pub use classifier::ModelClassifier;
pub use factory::{create_generator, create_generator_for, infer_provider_from_model};
pub use ollama::OllamaGenerator;
pub use openai::OpenAIGenerator;
