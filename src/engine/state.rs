use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Lifecycle of a publish.
///
/// `Idle → Running → {Paused, Stopping, Completed, ValidationFailed, Stopped}`;
/// `Paused` goes back to `Running` or on to `Stopped`. The last three are
/// terminal and fall back to `Idle` when the next run starts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema, Display, EnumString,
)]
pub enum EngineState {
    #[default]
    Idle,
    Running,
    Paused,
    Stopping,
    Completed,
    ValidationFailed,
    Stopped,
}

impl EngineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EngineState::Completed | EngineState::ValidationFailed | EngineState::Stopped
        )
    }

    /// A session exists: the registry belongs to the engine.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            EngineState::Running | EngineState::Paused | EngineState::Stopping
        )
    }
}
