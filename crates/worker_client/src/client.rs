use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::WorkerError;
use crate::http::HttpWorkerClient;
use crate::jsonrpc::{Id, Message, Method, Request, Response};
use crate::message::{
    ApplicationInfo, Cursor, InstanceRecord, JobHandle, JobStatus, ListInstancesResult,
    ListPluginsResult, PluginRecord, PollJobParams, SubmitJobParams, SubmitJobResult,
};

/// What the driver needs from a worker host. Both job calls are
/// asynchronous; the host decides how a plugin actually runs.
#[async_trait]
pub trait WorkerClientType: Send + Sync + 'static {
    /// Open a session with the host. Hosts without sessions accept this as a no-op.
    async fn connect(&self) -> Result<(), WorkerError> {
        Ok(())
    }
    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, WorkerError>;
    async fn list_plugins(&self) -> Result<Vec<PluginRecord>, WorkerError>;
    async fn submit_job(&self, instance: &str, plugin: &str) -> Result<JobHandle, WorkerError>;
    async fn poll_job(&self, handle: &JobHandle, cursor: Cursor) -> Result<JobStatus, WorkerError>;
    async fn application_info(&self) -> Result<ApplicationInfo, WorkerError>;
}

#[derive(Clone, Debug)]
pub enum WorkerClient {
    Rpc(RpcWorkerClient),
    Http(HttpWorkerClient),
    #[cfg(any(test, feature = "test-utils"))]
    Mock(crate::mock::MockWorker),
}

impl WorkerClient {
    pub fn rpc(tx: mpsc::Sender<(Request, oneshot::Sender<Response>)>) -> Self {
        WorkerClient::Rpc(RpcWorkerClient::new(tx))
    }

    pub fn transport(&self) -> &'static str {
        match self {
            WorkerClient::Rpc(_) => "rpc",
            WorkerClient::Http(_) => "http",
            #[cfg(any(test, feature = "test-utils"))]
            WorkerClient::Mock(_) => "mock",
        }
    }
}

#[async_trait]
impl WorkerClientType for WorkerClient {
    async fn connect(&self) -> Result<(), WorkerError> {
        match self {
            WorkerClient::Rpc(client) => client.connect().await,
            WorkerClient::Http(client) => client.connect().await,
            #[cfg(any(test, feature = "test-utils"))]
            WorkerClient::Mock(client) => client.connect().await,
        }
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, WorkerError> {
        match self {
            WorkerClient::Rpc(client) => client.list_instances().await,
            WorkerClient::Http(client) => client.list_instances().await,
            #[cfg(any(test, feature = "test-utils"))]
            WorkerClient::Mock(client) => client.list_instances().await,
        }
    }

    async fn list_plugins(&self) -> Result<Vec<PluginRecord>, WorkerError> {
        match self {
            WorkerClient::Rpc(client) => client.list_plugins().await,
            WorkerClient::Http(client) => client.list_plugins().await,
            #[cfg(any(test, feature = "test-utils"))]
            WorkerClient::Mock(client) => client.list_plugins().await,
        }
    }

    async fn submit_job(&self, instance: &str, plugin: &str) -> Result<JobHandle, WorkerError> {
        match self {
            WorkerClient::Rpc(client) => client.submit_job(instance, plugin).await,
            WorkerClient::Http(client) => client.submit_job(instance, plugin).await,
            #[cfg(any(test, feature = "test-utils"))]
            WorkerClient::Mock(client) => client.submit_job(instance, plugin).await,
        }
    }

    async fn poll_job(&self, handle: &JobHandle, cursor: Cursor) -> Result<JobStatus, WorkerError> {
        match self {
            WorkerClient::Rpc(client) => client.poll_job(handle, cursor).await,
            WorkerClient::Http(client) => client.poll_job(handle, cursor).await,
            #[cfg(any(test, feature = "test-utils"))]
            WorkerClient::Mock(client) => client.poll_job(handle, cursor).await,
        }
    }

    async fn application_info(&self) -> Result<ApplicationInfo, WorkerError> {
        match self {
            WorkerClient::Rpc(client) => client.application_info().await,
            WorkerClient::Http(client) => client.application_info().await,
            #[cfg(any(test, feature = "test-utils"))]
            WorkerClient::Mock(client) => client.application_info().await,
        }
    }
}

// -----------------------------------------------------------------------------
// JSON-RPC transport
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RpcWorkerClient {
    /// outbound <Request, responder> channel shared with the actor task
    tx: mpsc::Sender<(Request, oneshot::Sender<Response>)>,
}

impl RpcWorkerClient {
    pub fn new(tx: mpsc::Sender<(Request, oneshot::Sender<Response>)>) -> Self {
        Self { tx }
    }

    /// Send `method` with optional `params` and deserialize the
    /// JSON-RPC result into `R`.
    async fn call<R>(&self, method: Method, params: Option<serde_json::Value>) -> Result<R, WorkerError>
    where
        R: DeserializeOwned,
    {
        let id = Id::String(Uuid::new_v4().to_string());
        let req = Request::call(id, method, params);

        let (tx_rsp, rx_rsp) = oneshot::channel();
        self.tx
            .send((req, tx_rsp))
            .await
            .map_err(|_| anyhow!("worker actor is dead"))?;

        let rsp = rx_rsp
            .await
            .map_err(|_| anyhow!("worker actor dropped response"))?;

        if let Some(err) = rsp.error {
            return Err(WorkerError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        let val = rsp
            .result
            .ok_or_else(|| WorkerError::Schema("missing result field".into()))?;
        Ok(serde_json::from_value(val)?)
    }
}

#[async_trait]
impl WorkerClientType for RpcWorkerClient {
    async fn connect(&self) -> Result<(), WorkerError> {
        let _: serde_json::Value = self.call(Method::Connect, None).await?;
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, WorkerError> {
        let result: ListInstancesResult = self.call(Method::ListInstances, None).await?;
        Ok(result.instances)
    }

    async fn list_plugins(&self) -> Result<Vec<PluginRecord>, WorkerError> {
        let result: ListPluginsResult = self.call(Method::ListPlugins, None).await?;
        Ok(result.plugins)
    }

    async fn submit_job(&self, instance: &str, plugin: &str) -> Result<JobHandle, WorkerError> {
        let params = SubmitJobParams {
            instance: instance.to_string(),
            plugin: plugin.to_string(),
        };
        let result: SubmitJobResult = self
            .call(Method::SubmitJob, Some(serde_json::to_value(params)?))
            .await?;
        Ok(result.handle)
    }

    async fn poll_job(&self, handle: &JobHandle, cursor: Cursor) -> Result<JobStatus, WorkerError> {
        let params = PollJobParams {
            handle: handle.clone(),
            cursor,
        };
        self.call(Method::PollJob, Some(serde_json::to_value(params)?))
            .await
    }

    async fn application_info(&self) -> Result<ApplicationInfo, WorkerError> {
        self.call(Method::ApplicationInfo, None).await
    }
}

/// Launch `exe_path` as a child-process, wire JSON-RPC over stdin/stdout
/// and return a client that speaks to it.
///
/// Requests coming *from* the worker (log notifications and the like) are
/// logged and dropped; the driver only consumes responses.
pub async fn spawn_stdio_worker<P: AsRef<Path>>(exe_path: P) -> anyhow::Result<RpcWorkerClient> {
    let mut child = TokioCommand::new(exe_path.as_ref())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("worker stdin unavailable"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("worker stdout unavailable"))?;

    let (tx, mut rx) = mpsc::channel::<(Request, oneshot::Sender<Response>)>(32);

    // in-flight calls by encoded `id`
    let inflight: Arc<DashMap<String, oneshot::Sender<Response>>> = Arc::new(DashMap::new());
    {
        let inflight = Arc::clone(&inflight);
        tokio::spawn(async move {
            while let Some((req, rsp_tx)) = rx.recv().await {
                let line = match serde_json::to_string(&req) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!("could not encode request {}: {}", req.method, err);
                        continue;
                    }
                };
                if let Some(id) = &req.id {
                    inflight.insert(json!(id).to_string(), rsp_tx);
                }
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                let _ = stdin.write_all(b"\n").await;
                let _ = stdin.flush().await; // a broken pipe shows up on the reader side
            }
        });
    }

    let worker_id = exe_path
        .as_ref()
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("worker")
        .to_string();
    {
        let inflight = Arc::clone(&inflight);
        tokio::spawn(async move {
            let mut rdr = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = rdr.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Message>(&line) {
                    Ok(Message::Response(rsp)) => {
                        let key = json!(rsp.id).to_string();
                        if let Some((_, tx_rsp)) = inflight.remove(&key) {
                            let _ = tx_rsp.send(rsp);
                        }
                    }
                    Ok(Message::Request(req)) => {
                        debug!(worker = %worker_id, "ignoring request from worker: {}", req.method);
                    }
                    Err(err) => warn!(worker = %worker_id, "unreadable line from worker: {}", err),
                }
            }
            // Dropping the pending responders wakes every caller with an error.
            inflight.clear();
            let _ = child.kill().await;
        });
    }

    Ok(RpcWorkerClient::new(tx))
}
