use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] esc_store::StoreError),

    #[error("driver error: {0}")]
    Driver(#[from] esc_driver::DriverError),

    #[error("config error: {0}")]
    Config(#[from] esc_config::ConfigError),

    #[error("handler {step} failed: {message}")]
    HandlerFailed { step: String, message: String },

    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    #[error("invalid reset-step: {0}")]
    InvalidResetStep(String),

    #[error("internal engine error: {0}")]
    Internal(String),
}
