use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid instance id: {0}")]
    InvalidInstanceId(String),

    #[error("invalid CPU options JSON: {0}")]
    InvalidCpuOptions(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
