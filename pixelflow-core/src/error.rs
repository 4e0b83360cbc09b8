use thiserror::Error;

#[derive(Error, Debug)]
pub enum PixelflowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("object storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Validation(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("unsupported source_type: {0}")]
    UnsupportedSourceType(String),

    #[error("invalid pipeline action: {0}")]
    InvalidStepAction(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("webhook delivery failed after {attempts} attempts: {reason}")]
    Webhook { attempts: u32, reason: String },

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PixelflowError>;
