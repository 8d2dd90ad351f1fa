use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("JSON5 error: {0}")]
    Json5(#[from] json5::Error),

    #[error("Agent already registered: {0}")]
    DuplicateRegistration(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Handler failure: {0}")]
    HandlerFailure(String),

    #[error("Response timeout: {0}")]
    ResponseTimeout(String),

    #[error("Classification failure: {0}")]
    ClassificationFailure(String),

    #[error("Delegate returned an unrecognized result: {0}")]
    DelegationInvalidResult(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Task dependency not satisfied: {0}")]
    TaskDependency(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Message bus is stopped")]
    BusStopped,

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
