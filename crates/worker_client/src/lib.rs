pub mod client;
pub mod error;
pub mod http;
pub mod jsonrpc;
pub mod message;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use client::{spawn_stdio_worker, RpcWorkerClient, WorkerClient, WorkerClientType};
pub use error::WorkerError;
pub use http::HttpWorkerClient;
