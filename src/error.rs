use thiserror::Error;
use worker_client::WorkerError;

use crate::engine::EngineState;
use crate::registry::RegistryError;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The call is not allowed from the current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: EngineState,
    },

    #[error("select at least one instance and one compatible plugin")]
    NoEligibleWork,

    /// Toggles are locked while a publish is underway.
    #[error("cannot change toggles while {0}")]
    Busy(EngineState),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("communication failure: {0}")]
    Communication(#[from] WorkerError),
}

impl EngineError {
    pub fn is_communication(&self) -> bool {
        matches!(self, EngineError::Communication(_))
    }
}
