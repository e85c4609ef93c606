pub mod context;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod poll;

pub use context::EngineContext;
pub use engine::{reset_step, Engine};
pub use error::EngineError;
pub use handlers::HandlerOutcome;
