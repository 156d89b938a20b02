use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid detection #{index}: {reason}")]
    InvalidDetection { index: usize, reason: &'static str },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Assignment Error: {0}")]
    Assignment(String),

    #[error("Sink Error: {0}")]
    Sink(String),

    #[error("Io Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),
}
