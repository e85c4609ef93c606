use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid --cpu-options value: {0}")]
    InvalidCpuOptions(String),

    #[error("invalid --reset-step value: {0}")]
    InvalidResetStep(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("domain error: {0}")]
    Domain(#[from] esc_domain::DomainError),
}
