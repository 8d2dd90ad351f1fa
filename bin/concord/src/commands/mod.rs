pub mod agents;
pub mod chat;
pub mod onboard;
pub mod route;
pub mod status;

use std::sync::Arc;

use concord_agent::{Collaborators, Ecosystem, InMemoryKnowledgeStore, KnowledgeStore, NoopKnowledgeStore};
use concord_core::{Config, Paths};
use concord_providers::{create_generator, Classifier, ModelClassifier};
use tracing::{info, warn};

pub(crate) fn load_config(paths: &Paths) -> anyhow::Result<Config> {
    Ok(Config::load_or_default(paths)?)
}

pub(crate) fn load_knowledge(paths: &Paths) -> Arc<dyn KnowledgeStore> {
    let path = paths.knowledge_file();
    if !path.exists() {
        return Arc::new(NoopKnowledgeStore);
    }
    match InMemoryKnowledgeStore::load_json(&path) {
        Ok(store) => {
            info!(entries = store.len(), path = %path.display(), "Loaded knowledge file");
            Arc::new(store)
        }
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Ignoring unreadable knowledge file");
            Arc::new(NoopKnowledgeStore)
        }
    }
}

/// Builds an ecosystem with every configured agent type running.
pub(crate) fn start_ecosystem(paths: &Paths) -> anyhow::Result<Ecosystem> {
    let config = load_config(paths)?;
    let generator = create_generator(&config)?;
    let classifier: Arc<dyn Classifier> = Arc::new(ModelClassifier::new(Arc::clone(&generator)));
    let collaborators = Collaborators {
        generator,
        classifier: Some(classifier),
        knowledge: load_knowledge(paths),
    };
    let ecosystem = Ecosystem::new(config, collaborators);
    ecosystem.initialize_from_config();
    Ok(ecosystem)
}
