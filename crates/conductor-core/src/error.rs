use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("Context error: {0}")]
    Context(String),

    #[error("Context not found: {0}")]
    ContextNotFound(String),

    #[error("Interrupt error: {0}")]
    Interrupt(String),

    #[error("Stack error: {0}")]
    Stack(String),

    #[error("Chat error: {0}")]
    Chat(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ConductorError>;
