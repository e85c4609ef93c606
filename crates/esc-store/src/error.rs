use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("state-store table error: {0}")]
    Table(String),

    #[error("internal store error: {0}")]
    Internal(String),
}
