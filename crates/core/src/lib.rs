pub mod capability;
pub mod config;
pub mod error;
pub mod message;
pub mod paths;
pub mod task;
pub mod types;

pub use capability::Capability;
pub use config::{AgentDefaults, BusConfig, Config, DirectoryConfig, ProviderConfig, RoutingConfig};
pub use error::{Error, Result};
pub use message::{Message, MessagePriority, MessageType};
pub use paths::Paths;
pub use task::{Task, TaskPriority, TaskStatus};
pub use types::{AgentStatus, AgentType, Classification, ClassificationMethod};
