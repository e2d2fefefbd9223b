use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::client::WorkerClientType;
use crate::error::WorkerError;
use crate::message::{
    ApplicationInfo, Cursor, ErrorRecord, InstanceRecord, JobHandle, JobStatus, LogRecord,
    PluginRecord,
};

pub const DEFAULT_PORT: u16 = 6000;
pub const DEFAULT_PREFIX: &str = "/pyblish/v1";

/// REST dialect spoken by desktop hosts: one endpoint per resource,
/// jobs are called "processes" and polled by id.
#[derive(Clone, Debug)]
pub struct HttpWorkerClient {
    client: Client,
    base: String,
}

#[derive(Deserialize)]
struct ProcessCreated {
    process_id: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessState {
    running: bool,
    #[serde(default)]
    last_index: u64,
    #[serde(default)]
    errors: Vec<ErrorRecord>,
    #[serde(default)]
    messages: Vec<LogRecord>,
}

#[derive(Deserialize)]
struct Application {
    #[serde(alias = "host")]
    host_name: String,
    #[serde(alias = "pyblishVersion")]
    version: String,
    #[serde(alias = "connectTime")]
    connect_time: Option<DateTime<Utc>>,
    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

impl HttpWorkerClient {
    /// `base` is the full prefix, e.g. `http://127.0.0.1:6000/pyblish/v1`.
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self, WorkerError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
        })
    }

    /// Host on the local machine.
    pub fn local(port: u16, prefix: &str, timeout: Duration) -> Result<Self, WorkerError> {
        Self::new(format!("http://127.0.0.1:{port}{prefix}"), timeout)
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base, endpoint)
    }

    async fn send<R: DeserializeOwned>(&self, request: RequestBuilder) -> Result<R, WorkerError> {
        let response = request
            .header("Accept", "application/json")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(WorkerError::Status {
                status: status.as_u16(),
                message,
            });
        }
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl WorkerClientType for HttpWorkerClient {
    async fn connect(&self) -> Result<(), WorkerError> {
        debug!("POST {}", self.url("/session"));
        let _: Value = self.send(self.client.post(self.url("/session"))).await?;
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, WorkerError> {
        self.send(self.client.get(self.url("/instances"))).await
    }

    async fn list_plugins(&self) -> Result<Vec<PluginRecord>, WorkerError> {
        self.send(self.client.get(self.url("/plugins"))).await
    }

    async fn submit_job(&self, instance: &str, plugin: &str) -> Result<JobHandle, WorkerError> {
        let created: ProcessCreated = self
            .send(
                self.client
                    .post(self.url("/processes"))
                    .json(&json!({"instance": instance, "plugin": plugin})),
            )
            .await?;
        // Hosts hand out either numbers or strings.
        let id = match created.process_id {
            Value::String(id) => id,
            Value::Number(id) => id.to_string(),
            other => {
                return Err(WorkerError::Schema(format!(
                    "process_id must be a string or number, got {other}"
                )));
            }
        };
        Ok(JobHandle(id))
    }

    async fn poll_job(&self, handle: &JobHandle, cursor: Cursor) -> Result<JobStatus, WorkerError> {
        let state: ProcessState = self
            .send(
                self.client
                    .get(self.url(&format!("/processes/{}", handle)))
                    .query(&[("index", cursor.0)]),
            )
            .await?;
        Ok(JobStatus {
            running: state.running,
            cursor: Cursor(state.last_index),
            errors: state.errors,
            messages: state.messages,
        })
    }

    async fn application_info(&self) -> Result<ApplicationInfo, WorkerError> {
        let app: Application = self.send(self.client.get(self.url("/application"))).await?;
        Ok(ApplicationInfo {
            host_name: app.host_name,
            version: app.version,
            connect_time: app.connect_time.unwrap_or_else(Utc::now),
            extra: app.extra,
        })
    }
}
