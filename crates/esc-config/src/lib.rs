pub mod cli;
pub mod config;
pub mod error;

pub use cli::Cli;
pub use config::{Command, Config, ResourceFilter};
pub use error::ConfigError;
