use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".concord"))
            .unwrap_or_else(|| PathBuf::from(".concord"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn knowledge_file(&self) -> PathBuf {
        self.base.join("knowledge.json")
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
