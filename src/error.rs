use thiserror::Error;

pub type Result<T> = std::result::Result<T, SentinelError>;

#[derive(Debug, Error)]
pub enum SentinelError {
    #[error("Message parse error: {0}")]
    Parse(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl From<serde_json::Error> for SentinelError {
    fn from(e: serde_json::Error) -> Self {
        SentinelError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for SentinelError {
    fn from(e: serde_yaml::Error) -> Self {
        SentinelError::Serialization(e.to_string())
    }
}
