use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use crate::client::WorkerClientType;
use crate::error::WorkerError;
use crate::jsonrpc::{Id, Method, Request, Response, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND};
use crate::message::{
    ApplicationInfo, Cursor, ErrorRecord, InstanceRecord, JobHandle, JobStatus, ListInstancesResult,
    ListPluginsResult, LogLevel, LogRecord, PluginKind, PluginRecord, PollJobParams,
    SubmitJobParams, SubmitJobResult,
};

#[derive(Debug)]
struct MockJob {
    instance: String,
    plugin: String,
    polls_left: u32,
    finished: bool,
}

#[derive(Debug, Default)]
struct MockState {
    instances: Vec<InstanceRecord>,
    plugins: Vec<PluginRecord>,
    polls_to_finish: AtomicU32,
    next_id: AtomicU64,
    scripted_errors: DashMap<(String, String), Vec<String>>,
    scripted_logs: DashMap<(String, String), Vec<String>>,
    jobs: DashMap<String, MockJob>,
    log: Mutex<Vec<LogRecord>>,
    submissions: Mutex<Vec<(String, String)>>,
    polls: AtomicU64,
    fail_submit_at: Mutex<Option<usize>>,
    fail_polls: AtomicBool,
    connected: AtomicBool,
}

/// In-process worker host for tests. Jobs finish after a configurable
/// number of polls; errors and log lines are scripted per pair.
#[derive(Clone, Debug)]
pub struct MockWorker {
    state: Arc<MockState>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockWorker {
    pub fn new(instances: Vec<InstanceRecord>, plugins: Vec<PluginRecord>) -> Self {
        Self {
            state: Arc::new(MockState {
                instances,
                plugins,
                ..Default::default()
            }),
        }
    }

    /// Three instances and four plugins, one of which always fails.
    ///
    /// `Peter01` is a rig and starts untoggled; the two animation caches
    /// are toggled.
    pub fn napoleon() -> Self {
        let instances = vec![
            InstanceRecord::new("Peter01", "napoleon.asset.rig").with_publish(false),
            InstanceRecord::new("Richard05", "napoleon.animation.cache").with_publish(true),
            InstanceRecord::new("Steven11", "napoleon.animation.cache").with_publish(true),
        ];
        let plugins = vec![
            PluginRecord::new("ConformAsset", PluginKind::Conformer, 3.0)
                .with_families(&["napoleon.asset.rig"]),
            PluginRecord::new("ExtractAsMa", PluginKind::Extractor, 2.0)
                .with_families(&["napoleon.animation.cache"]),
            PluginRecord::new("ValidateFailureMock", PluginKind::Validator, 1.0),
            PluginRecord::new("ValidateNamespace", PluginKind::Validator, 1.0)
                .with_families(&["napoleon.animation.cache"])
                .required(),
            PluginRecord::new("SelectMockInstances", PluginKind::Selector, 0.0),
        ];
        let worker = Self::new(instances, plugins);
        for instance in ["Peter01", "Richard05", "Steven11"] {
            worker.script_errors(instance, "ValidateFailureMock", &["Instance failed"]);
        }
        for instance in ["Richard05", "Steven11"] {
            worker.script_log(
                instance,
                "ValidateNamespace",
                &["Validating namespace..", "Completed validating namespace!"],
            );
        }
        worker
    }

    /// How many polls report `running` before a job completes.
    pub fn with_polls(self, polls: u32) -> Self {
        self.state.polls_to_finish.store(polls, Ordering::SeqCst);
        self
    }

    pub fn script_errors(&self, instance: &str, plugin: &str, messages: &[&str]) {
        self.state.scripted_errors.insert(
            (instance.to_string(), plugin.to_string()),
            messages.iter().map(|m| m.to_string()).collect(),
        );
    }

    pub fn script_log(&self, instance: &str, plugin: &str, lines: &[&str]) {
        self.state.scripted_logs.insert(
            (instance.to_string(), plugin.to_string()),
            lines.iter().map(|m| m.to_string()).collect(),
        );
    }

    /// Make the `n`th submission (zero based) fail as unreachable.
    pub fn fail_submit_at(&self, n: usize) {
        *locked(&self.state.fail_submit_at) = Some(n);
    }

    pub fn clear_failures(&self) {
        *locked(&self.state.fail_submit_at) = None;
        self.state.fail_polls.store(false, Ordering::SeqCst);
    }

    pub fn fail_polls(&self, fail: bool) {
        self.state.fail_polls.store(fail, Ordering::SeqCst);
    }

    /// Every `(instance, plugin)` submitted so far, in order.
    pub fn submissions(&self) -> Vec<(String, String)> {
        locked(&self.state.submissions).clone()
    }

    pub fn poll_count(&self) -> u64 {
        self.state.polls.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Serve this mock as a JSON-RPC actor, the way a stdio worker would
    /// answer, and return the request channel for an `RpcWorkerClient`.
    pub fn serve(&self) -> mpsc::Sender<(Request, oneshot::Sender<Response>)> {
        let (tx, mut rx) = mpsc::channel::<(Request, oneshot::Sender<Response>)>(32);
        let worker = self.clone();
        tokio::spawn(async move {
            while let Some((req, rsp_tx)) = rx.recv().await {
                let rsp = worker.handle_request(req).await;
                let _ = rsp_tx.send(rsp);
            }
        });
        tx
    }

    async fn handle_request(&self, req: Request) -> Response {
        let id = req.id.clone().unwrap_or(Id::Null);
        let method: Method = match req.method.parse() {
            Ok(method) => method,
            Err(_) => {
                return Response::fail(id, METHOD_NOT_FOUND, format!("unknown method `{}`", req.method), None);
            }
        };
        let result = match method {
            Method::Connect => self.connect().await.map(|_| json!({})),
            Method::ListInstances => self
                .list_instances()
                .await
                .and_then(|instances| to_value(ListInstancesResult { instances })),
            Method::ListPlugins => self
                .list_plugins()
                .await
                .and_then(|plugins| to_value(ListPluginsResult { plugins })),
            Method::ApplicationInfo => self.application_info().await.and_then(to_value),
            Method::SubmitJob => match params::<SubmitJobParams>(req.params) {
                Ok(p) => self
                    .submit_job(&p.instance, &p.plugin)
                    .await
                    .and_then(|handle| to_value(SubmitJobResult { handle })),
                Err(rsp) => return rsp.with_id(id),
            },
            Method::PollJob => match params::<PollJobParams>(req.params) {
                Ok(p) => self.poll_job(&p.handle, p.cursor).await.and_then(to_value),
                Err(rsp) => return rsp.with_id(id),
            },
        };
        match result {
            Ok(value) => Response::success(id, value),
            Err(err) => Response::fail(id, INTERNAL_ERROR, err.to_string(), None),
        }
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, WorkerError> {
    Ok(serde_json::to_value(value)?)
}

fn params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, Response> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|err| Response::fail(Id::Null, INVALID_PARAMS, err.to_string(), None))
}

trait WithId {
    fn with_id(self, id: Id) -> Response;
}

impl WithId for Response {
    fn with_id(mut self, id: Id) -> Response {
        self.id = id;
        self
    }
}

#[async_trait]
impl WorkerClientType for MockWorker {
    async fn connect(&self) -> Result<(), WorkerError> {
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, WorkerError> {
        Ok(self.state.instances.clone())
    }

    async fn list_plugins(&self) -> Result<Vec<PluginRecord>, WorkerError> {
        Ok(self.state.plugins.clone())
    }

    async fn submit_job(&self, instance: &str, plugin: &str) -> Result<JobHandle, WorkerError> {
        let attempt = {
            let mut submissions = locked(&self.state.submissions);
            submissions.push((instance.to_string(), plugin.to_string()));
            submissions.len() - 1
        };
        if *locked(&self.state.fail_submit_at) == Some(attempt) {
            return Err(WorkerError::Unreachable("mock host refused the job".into()));
        }

        let id = format!("job-{}", self.state.next_id.fetch_add(1, Ordering::SeqCst));
        self.state.jobs.insert(
            id.clone(),
            MockJob {
                instance: instance.to_string(),
                plugin: plugin.to_string(),
                polls_left: self.state.polls_to_finish.load(Ordering::SeqCst),
                finished: false,
            },
        );
        Ok(JobHandle(id))
    }

    async fn poll_job(&self, handle: &JobHandle, cursor: Cursor) -> Result<JobStatus, WorkerError> {
        self.state.polls.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_polls.load(Ordering::SeqCst) {
            return Err(WorkerError::Unreachable("mock host went away".into()));
        }

        let mut job = self
            .state
            .jobs
            .get_mut(&handle.0)
            .ok_or_else(|| WorkerError::Rpc {
                code: INVALID_PARAMS,
                message: format!("no such job `{}`", handle),
            })?;

        let mut errors = vec![];
        if job.polls_left > 0 {
            job.polls_left -= 1;
        } else if !job.finished {
            job.finished = true;
            let key = (job.instance.clone(), job.plugin.clone());
            let mut log = locked(&self.state.log);
            if let Some(lines) = self.state.scripted_logs.get(&key) {
                for line in lines.iter() {
                    log.push(LogRecord {
                        level: LogLevel::Info,
                        message: line.clone(),
                        instance: Some(job.instance.clone()),
                        plugin: Some(job.plugin.clone()),
                    });
                }
            }
            if let Some(messages) = self.state.scripted_errors.get(&key) {
                for message in messages.iter() {
                    errors.push(ErrorRecord {
                        message: message.clone(),
                        instance: Some(job.instance.clone()),
                        plugin: Some(job.plugin.clone()),
                        traceback: None,
                    });
                }
            }
        }
        let running = !job.finished;
        drop(job);

        let log = locked(&self.state.log);
        let from = (cursor.0 as usize).min(log.len());
        Ok(JobStatus {
            running,
            cursor: Cursor(log.len() as u64),
            errors,
            messages: log[from..].to_vec(),
        })
    }

    async fn application_info(&self) -> Result<ApplicationInfo, WorkerError> {
        let mut extra = HashMap::new();
        extra.insert("port".to_string(), json!(0));
        Ok(ApplicationInfo {
            host_name: "mock".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            connect_time: Utc::now(),
            extra,
        })
    }
}
