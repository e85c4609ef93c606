use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("cloud API call failed: {0}")]
    Api(String),

    #[error("timed out polling for {what}: no success after {attempts} attempts")]
    PollTimeout { what: String, attempts: u32 },

    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    #[error("internal driver error: {0}")]
    Internal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
