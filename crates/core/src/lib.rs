// Core types and execution engine for Flowrun workflow graphs

pub mod config;
pub mod error;
pub mod events;
pub mod types;
pub mod workflow;

pub use config::{EngineConfig, FailurePolicy};
pub use error::{EngineError, EngineResult};
pub use types::*;
