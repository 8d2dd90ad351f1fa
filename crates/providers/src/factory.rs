use concord_core::config::ProviderConfig;
use concord_core::Config;
use std::sync::Arc;
use tracing::info;

use crate::{Generator, OllamaGenerator, OpenAIGenerator};

/// Default base URL for the OpenAI-compatible providers.
fn default_api_base(provider_name: &str) -> &'static str {
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1",
        "openai" => "https://api.openai.com/v1",
        "deepseek" => "https://api.deepseek.com/v1",
        "groq" => "https://api.groq.com/openai/v1",
        _ => "https://api.openai.com/v1",
    }
}

/// Infers the provider name from the model string prefix.
pub fn infer_provider_from_model(model: &str) -> Option<&'static str> {
    if model.starts_with("ollama/") {
        Some("ollama")
    } else if model.starts_with("openrouter/") {
        Some("openrouter")
    } else if model.starts_with("openai/")
        || model.starts_with("gpt-")
        || model.starts_with("o1")
        || model.starts_with("o3")
    {
        Some("openai")
    } else if model.starts_with("deepseek") {
        Some("deepseek")
    } else if model.starts_with("groq/") {
        Some("groq")
    } else {
        None
    }
}

/// First provider with a real key; ollama needs none and comes last.
fn fallback_provider_name(config: &Config) -> Option<&str> {
    let priority = ["openai", "openrouter", "deepseek", "groq"];
    for name in priority {
        if let Some(p) = config.providers.get(name) {
            if !p.api_key.is_empty() && p.api_key != "dummy" {
                return Some(name);
            }
        }
    }
    if config.providers.contains_key("ollama") {
        return Some("ollama");
    }
    None
}

/// Builds a generator for `model`.
///
/// Resolution order:
/// 1. `explicit_provider`
/// 2. the model prefix (`gpt-…`, `deepseek…`, `ollama/…`)
/// 3. the first configured provider with a key, ollama last
pub fn create_generator_for(
    config: &Config,
    model: &str,
    explicit_provider: Option<&str>,
) -> anyhow::Result<Arc<dyn Generator>> {
    let effective_provider: &str = if let Some(ep) = explicit_provider {
        ep
    } else if let Some(inferred) = infer_provider_from_model(model) {
        inferred
    } else if let Some(fallback) = fallback_provider_name(config) {
        fallback
    } else {
        return Err(anyhow::anyhow!(
            "No LLM provider configured. Set 'provider' in config, use a recognized model prefix \
             (e.g. 'gpt-4o', 'deepseek-chat', 'ollama/llama3'), or add an API key to the providers section."
        ));
    };

    let provider_cfg = config.providers.get(effective_provider);

    if effective_provider != "ollama" {
        match provider_cfg {
            None if explicit_provider.is_some() => {
                return Err(anyhow::anyhow!(
                    "Provider '{}' is explicitly configured but not found in providers section",
                    effective_provider
                ));
            }
            Some(cfg) if cfg.api_key.is_empty() || cfg.api_key == "dummy" => {
                return Err(anyhow::anyhow!(
                    "Provider '{}' has no API key",
                    effective_provider
                ));
            }
            None => {
                return Err(anyhow::anyhow!(
                    "Provider '{}' is not configured",
                    effective_provider
                ));
            }
            _ => {}
        }
    }

    let empty_cfg = ProviderConfig::default();
    let resolved_cfg = provider_cfg.unwrap_or(&empty_cfg);
    let provider_proxy = resolved_cfg.proxy.as_deref();

    info!(provider = %effective_provider, model = %model, "Creating generator");

    match effective_provider {
        "ollama" => Ok(Arc::new(OllamaGenerator::new_with_proxy(
            resolved_cfg.api_base.as_deref(),
            model,
            provider_proxy,
        ))),
        _ => {
            let api_base = resolved_cfg
                .api_base
                .as_deref()
                .unwrap_or_else(|| default_api_base(effective_provider));
            Ok(Arc::new(OpenAIGenerator::new_with_proxy(
                &resolved_cfg.api_key,
                Some(api_base),
                model,
                provider_proxy,
            )))
        }
    }
}

/// Generator for the configured default model.
pub fn create_generator(config: &Config) -> anyhow::Result<Arc<dyn Generator>> {
    let model = &config.agents.defaults.model;
    let explicit_provider = config.agents.defaults.provider.as_deref();
    create_generator_for(config, model, explicit_provider)
}
