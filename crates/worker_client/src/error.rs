use thiserror::Error;

/// Everything that can go wrong talking to a worker host.
///
/// From the driver's point of view all of these are communication
/// failures: the run halts, nothing is retried.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The host could not be reached, or the transport went away.
    #[error("worker unreachable: {0}")]
    Unreachable(String),

    /// The host answered with a non-success status.
    #[error("worker answered {status}: {message}")]
    Status { status: u16, message: String },

    /// The host answered with a JSON-RPC error object.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The host answered, but not with what the schema promises.
    #[error("schema mismatch: {0}")]
    Schema(String),
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> WorkerError {
        WorkerError::Schema(err.to_string())
    }
}

impl From<reqwest::Error> for WorkerError {
    fn from(err: reqwest::Error) -> WorkerError {
        if err.is_decode() {
            return WorkerError::Schema(err.to_string());
        }
        match err.status() {
            Some(status) => WorkerError::Status {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => WorkerError::Unreachable(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for WorkerError {
    fn from(err: anyhow::Error) -> WorkerError {
        WorkerError::Unreachable(err.to_string())
    }
}
