pub mod advance;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod logger;
pub mod registry;
pub mod schema;

pub use engine::{Engine, EngineEvent, EngineState};
pub use error::EngineError;
pub use registry::Registry;
