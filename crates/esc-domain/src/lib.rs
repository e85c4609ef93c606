pub mod error;
pub mod record;
pub mod steps;
pub mod types;

pub use error::DomainError;
pub use record::{ConversionRecord, ConversionRecordDelta};
pub use steps::{ConfigKey, StepGate, StepName, STEP_ORDER};
pub use types::*;
