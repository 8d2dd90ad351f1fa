use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concord_core::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeSnippet {
    pub title: String,
    pub content: String,
    pub score: f64,
}

/// Long-term context read before generation and written after it.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn relevant_context(&self, query: &str, max_results: usize) -> Result<Vec<KnowledgeSnippet>>;

    async fn record_interaction(
        &self,
        agent_type: &str,
        input: &str,
        response: &str,
        context: &Map<String, Value>,
    ) -> Result<()>;
}

/// Store for callers that have no knowledge base.
pub struct NoopKnowledgeStore;

#[async_trait]
impl KnowledgeStore for NoopKnowledgeStore {
    async fn relevant_context(&self, _query: &str, _max_results: usize) -> Result<Vec<KnowledgeSnippet>> {
        Ok(Vec::new())
    }

    async fn record_interaction(
        &self,
        _agent_type: &str,
        _input: &str,
        _response: &str,
        _context: &Map<String, Value>,
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

struct IndexedEntry {
    entry: KnowledgeEntry,
    terms: HashSet<String>,
}

impl IndexedEntry {
    fn new(entry: KnowledgeEntry) -> Self {
        let mut terms = tokenize(&entry.title);
        terms.extend(tokenize(&entry.content));
        for tag in &entry.tags {
            terms.extend(tokenize(tag));
        }
        Self { entry, terms }
    }
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "your", "with", "this", "that", "have",
    "from", "was", "what", "how", "can", "will", "would", "about", "into", "need", "want",
];

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Term-overlap knowledge store. Curated entries plus a bounded log of
/// recorded interactions.
pub struct InMemoryKnowledgeStore {
    entries: RwLock<Vec<IndexedEntry>>,
    interactions: RwLock<VecDeque<IndexedEntry>>,
    max_interactions: usize,
}

impl Default for InMemoryKnowledgeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::with_capacity(500)
    }

    pub fn with_capacity(max_interactions: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            interactions: RwLock::new(VecDeque::new()),
            max_interactions,
        }
    }

    /// Loads curated entries from a JSON array of `{title, content, tags}`.
    pub fn load_json(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let entries: Vec<KnowledgeEntry> = serde_json::from_str(&content)?;
        let store = Self::new();
        for entry in entries {
            store.add_entry(entry);
        }
        Ok(store)
    }

    pub fn add_entry(&self, entry: KnowledgeEntry) {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(IndexedEntry::new(entry));
    }

    pub fn add(&self, title: &str, content: &str, tags: &[&str]) {
        self.add_entry(KnowledgeEntry {
            title: title.to_string(),
            content: content.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            created_at: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.interaction_count() + self.entries.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn interaction_count(&self) -> usize {
        self.interactions.read().unwrap_or_else(|p| p.into_inner()).len()
    }
}

fn score(query_terms: &HashSet<String>, entry: &IndexedEntry) -> f64 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let overlap = query_terms.intersection(&entry.terms).count();
    overlap as f64 / query_terms.len() as f64
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn relevant_context(&self, query: &str, max_results: usize) -> Result<Vec<KnowledgeSnippet>> {
        let query_terms = tokenize(query);
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        let interactions = self.interactions.read().unwrap_or_else(|p| p.into_inner());

        let mut scored: Vec<KnowledgeSnippet> = entries
            .iter()
            .chain(interactions.iter().rev())
            .filter_map(|e| {
                let s = score(&query_terms, e);
                (s > 0.0).then(|| KnowledgeSnippet {
                    title: e.entry.title.clone(),
                    content: e.entry.content.clone(),
                    score: s,
                })
            })
            .collect();

        // stable sort keeps curated entries ahead of interactions on equal scores
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);
        debug!(query_terms = query_terms.len(), results = scored.len(), "Knowledge lookup");
        Ok(scored)
    }

    async fn record_interaction(
        &self,
        agent_type: &str,
        input: &str,
        response: &str,
        context: &Map<String, Value>,
    ) -> Result<()> {
        let mut tags = vec![agent_type.to_string(), "interaction".to_string()];
        if let Some(Value::String(session)) = context.get("session_id") {
            tags.push(session.clone());
        }
        let entry = IndexedEntry::new(KnowledgeEntry {
            title: format!("{} interaction", agent_type),
            content: format!("User: {}\nAssistant: {}", input, response),
            tags,
            created_at: Utc::now(),
        });

        let mut interactions = self.interactions.write().unwrap_or_else(|p| p.into_inner());
        interactions.push_back(entry);
        while interactions.len() > self.max_interactions {
            interactions.pop_front();
        }
        Ok(())
    }
}
