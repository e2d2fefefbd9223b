mod events;
mod metrics;
mod session;
mod state;

pub use events::{EngineEvent, EventChannel, ProgressItem};
pub use metrics::EngineMetrics;
pub use session::PublishSession;
pub use state::EngineState;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use worker_client::message::{ApplicationInfo, Cursor, ErrorRecord, PluginKind};
use worker_client::{WorkerClientType, WorkerError};

use crate::advance::{self, Position};
use crate::error::EngineError;
use crate::gate::{self, ErrorsByInstance, RecordedError};
use crate::logger::{Logger, JOB_TARGET};
use crate::registry::Registry;

pub const NO_WORK_MESSAGE: &str = "Select at least one instance and compatible plug-in to start";

#[derive(Default)]
struct EngineCore {
    state: EngineState,
    registry: Registry,
    application: Option<ApplicationInfo>,
    session: Option<PublishSession>,
    task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

/// Everything the loop needs to run one pair without holding the lock.
struct Job {
    position: Position,
    instance: String,
    plugin: String,
    stage: PluginKind,
    cursor: Cursor,
}

struct JobOutcome {
    errors: Vec<ErrorRecord>,
    elapsed_ms: f64,
}

/// Drives one publish at a time against a worker host.
///
/// Cheap to clone; every clone talks to the same run. The submit/poll loop
/// runs on its own task, so `start` and `resume` return as soon as the run
/// is underway. Use [`Engine::wait`] or [`Engine::subscribe`] to follow it.
#[derive(Clone)]
pub struct Engine {
    core: Arc<Mutex<EngineCore>>,
    client: Arc<dyn WorkerClientType>,
    events: EventChannel,
    state_tx: Arc<watch::Sender<EngineState>>,
    metrics: EngineMetrics,
    logger: Logger,
    poll_interval: Duration,
}

impl Engine {
    pub fn new<C: WorkerClientType>(client: C, poll_interval: Duration, logger: Logger) -> Self {
        Self {
            core: Arc::new(Mutex::new(EngineCore::default())),
            client: Arc::new(client),
            events: EventChannel::default(),
            state_tx: Arc::new(watch::Sender::new(EngineState::Idle)),
            metrics: EngineMetrics::new(),
            logger,
            poll_interval,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> EngineState {
        self.core.lock().await.state
    }

    /// Snapshot of both collections.
    pub async fn registry(&self) -> Registry {
        self.core.lock().await.registry.clone()
    }

    pub async fn application(&self) -> Option<ApplicationInfo> {
        self.core.lock().await.application.clone()
    }

    /// The pair running now, or the one a resume would submit.
    pub async fn position(&self) -> Option<Position> {
        self.core.lock().await.session.as_ref().map(|s| s.position)
    }

    /// Errors of the current run.
    pub async fn errors(&self) -> ErrorsByInstance {
        self.core
            .lock()
            .await
            .session
            .as_ref()
            .map(|s| s.errors.clone())
            .unwrap_or_default()
    }

    /// Open the session with the host and load what it has to offer.
    ///
    /// The host is queried without holding the engine lock, so readers and
    /// `stop` stay responsive while it answers. A run started in the
    /// meantime wins and the fresh data is dropped.
    pub async fn populate(&self) -> Result<(), EngineError> {
        self.ensure_inactive("populate").await?;

        self.client.connect().await?;
        let application = self.client.application_info().await?;
        let instances = self.client.list_instances().await?;
        let plugins = self.client.list_plugins().await?;
        let registry = Registry::populate(instances, plugins)?;

        let mut core = self.core.lock().await;
        if core.state.is_active() {
            return Err(EngineError::InvalidState {
                operation: "populate",
                state: core.state,
            });
        }
        info!(
            host = %application.host_name,
            version = %application.version,
            instances = registry.instances().len(),
            plugins = registry.plugins().len(),
            "populated from worker host"
        );
        core.registry = registry;
        core.application = Some(application);
        if core.state != EngineState::Idle {
            self.transition(&mut core, EngineState::Idle);
        }
        Ok(())
    }

    async fn ensure_inactive(&self, operation: &'static str) -> Result<(), EngineError> {
        let state = self.core.lock().await.state;
        if state.is_active() {
            return Err(EngineError::InvalidState { operation, state });
        }
        Ok(())
    }

    pub async fn toggle_instance(&self, name: &str, toggled: bool) -> Result<(), EngineError> {
        let mut core = self.core.lock().await;
        if core.state.is_active() {
            return Err(EngineError::Busy(core.state));
        }
        core.registry.toggle_instance(name, toggled)?;
        Ok(())
    }

    pub async fn toggle_plugin(&self, name: &str, toggled: bool) -> Result<(), EngineError> {
        let mut core = self.core.lock().await;
        if core.state.is_active() {
            return Err(EngineError::Busy(core.state));
        }
        core.registry.toggle_plugin(name, toggled)?;
        Ok(())
    }

    /// UI focus; allowed at any time.
    pub async fn select_instance(&self, name: &str) -> Result<(), EngineError> {
        self.core.lock().await.registry.select_instance(name)?;
        Ok(())
    }

    pub async fn start(&self) -> Result<(), EngineError> {
        let mut core = self.core.lock().await;
        if core.state.is_terminal() {
            self.transition(&mut core, EngineState::Idle);
        }
        if core.state != EngineState::Idle {
            return Err(EngineError::InvalidState {
                operation: "start",
                state: core.state,
            });
        }

        core.registry.reset_progress();
        for instance in core.registry.instances() {
            self.events.progress(ProgressItem::Instance, &instance.name, 0.0);
        }
        for plugin in core.registry.plugins() {
            self.events.progress(ProgressItem::Plugin, &plugin.name, 0.0);
        }

        let first = advance::next(
            &core.registry.instance_toggles(),
            &core.registry.plugin_toggles(),
            None,
        );
        let Some(first) = first else {
            self.events.message(NO_WORK_MESSAGE);
            return Err(EngineError::NoEligibleWork);
        };

        let session = PublishSession::new(first);
        info!(session = %session.id, "publish started");
        core.session = Some(session);
        self.transition(&mut core, EngineState::Running);
        self.spawn_loop(&mut core);
        Ok(())
    }

    /// Withhold the next submission. The job in flight finishes first.
    pub async fn pause(&self) -> Result<(), EngineError> {
        let mut core = self.core.lock().await;
        if core.state != EngineState::Running {
            return Err(EngineError::InvalidState {
                operation: "pause",
                state: core.state,
            });
        }
        if let Some(session) = core.session.as_mut() {
            session.paused = true;
        }
        self.events.message("Pausing..");
        Ok(())
    }

    /// Submit the retained pair again and carry on.
    pub async fn resume(&self) -> Result<(), EngineError> {
        let mut core = self.core.lock().await;
        if core.state != EngineState::Paused {
            return Err(EngineError::InvalidState {
                operation: "resume",
                state: core.state,
            });
        }
        if let Some(session) = core.session.as_mut() {
            session.paused = false;
        }
        self.transition(&mut core, EngineState::Running);
        self.spawn_loop(&mut core);
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), EngineError> {
        let mut core = self.core.lock().await;
        match core.state {
            EngineState::Running => {
                if let Some(session) = core.session.as_mut() {
                    session.stopped = true;
                }
                self.transition(&mut core, EngineState::Stopping);
                self.events.message("Stopping..");
                Ok(())
            }
            EngineState::Paused => {
                self.finish(&mut core, EngineState::Stopped, "Stopped");
                Ok(())
            }
            state => Err(EngineError::InvalidState {
                operation: "stop",
                state,
            }),
        }
    }

    /// Wait for the loop to hand control back: on completion, halt, stop or
    /// pause. Returns at once when no loop is running.
    ///
    /// Any number of callers may wait. The first one joins the loop task and
    /// logs a panic; the others follow the published state.
    pub async fn wait(&self) -> EngineState {
        let (task, mut states) = {
            let mut core = self.core.lock().await;
            (core.task.take(), self.state_tx.subscribe())
        };
        match task {
            Some(task) => {
                if let Err(err) = task.await {
                    error!("publish loop panicked: {err}");
                    let mut core = self.core.lock().await;
                    if core.state.is_active() {
                        self.finish(&mut core, EngineState::Stopped, "Stopped");
                    }
                }
            }
            None => {
                let _ = states
                    .wait_for(|state| !matches!(state, EngineState::Running | EngineState::Stopping))
                    .await;
            }
        }
        self.state().await
    }

    /// Abandon the run, including the job in flight, and go back to Idle.
    pub async fn shutdown(&self) {
        let task = {
            let mut core = self.core.lock().await;
            core.cancel.cancel();
            core.task.take()
        };
        if let Some(task) = task {
            if let Err(err) = task.await {
                if err.is_panic() {
                    error!("publish loop panicked: {err}");
                }
            }
        }

        let mut core = self.core.lock().await;
        if core.session.take().is_some() {
            warn!("publish abandoned");
        }
        core.registry.clear_processing();
        if core.state != EngineState::Idle {
            self.transition(&mut core, EngineState::Idle);
        }
    }

    fn transition(&self, core: &mut EngineCore, state: EngineState) {
        debug!(from = %core.state, to = %state, "engine state");
        core.state = state;
        self.state_tx.send_replace(state);
        self.events.emit(EngineEvent::StateChanged(state));
    }

    fn spawn_loop(&self, core: &mut EngineCore) {
        core.cancel = CancellationToken::new();
        let cancel = core.cancel.clone();
        let engine = self.clone();
        core.task = Some(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!("publish loop cancelled"),
                _ = engine.drive() => {}
            }
        }));
    }

    /// End the run in `state`. Progress stays where it was.
    fn finish(&self, core: &mut EngineCore, state: EngineState, message: &str) {
        if let Some(session) = core.session.take() {
            info!(
                session = %session.id,
                jobs = session.jobs_completed,
                outcome = %state,
                "publish finished"
            );
        }
        core.registry.clear_processing();
        self.metrics.finished(&state.to_string());
        self.transition(core, state);
        self.events.message(message);
    }

    async fn drive(&self) {
        loop {
            let Some(job) = self.next_job().await else {
                return;
            };

            match self.run_job(&job).await {
                Ok(outcome) => {
                    if !self.complete(&job, outcome).await {
                        return;
                    }
                }
                Err(err) => {
                    self.lost(&job, err).await;
                    return;
                }
            }
        }
    }

    /// Mark the pending pair as processing and hand it out.
    async fn next_job(&self) -> Option<Job> {
        let mut core = self.core.lock().await;
        let EngineCore {
            registry, session, ..
        } = &mut *core;
        let session = session.as_ref()?;
        let position = session.position;

        let instance = registry.instance_mut(position.instance)?;
        instance.processing = true;
        let instance = instance.name.clone();
        let plugin = registry.plugin_mut(position.plugin)?;
        plugin.processing = true;

        Some(Job {
            position,
            instance,
            plugin: plugin.name.clone(),
            stage: plugin.kind,
            cursor: session.cursor,
        })
    }

    /// Submit one pair and poll it until the host says it is done.
    async fn run_job(&self, job: &Job) -> Result<JobOutcome, WorkerError> {
        let started = Instant::now();
        let handle = self.client.submit_job(&job.instance, &job.plugin).await?;
        self.metrics.submitted(&job.plugin);
        debug!(%handle, instance = %job.instance, plugin = %job.plugin, "job submitted");

        let mut cursor = job.cursor;
        let mut errors = vec![];
        loop {
            tokio::time::sleep(self.poll_interval).await;
            let status = self.client.poll_job(&handle, cursor).await?;

            cursor = status.cursor;
            for record in status.messages {
                self.logger.record(&record);
                self.events.emit(EngineEvent::LogAppended(record));
            }
            if let Some(session) = self.core.lock().await.session.as_mut() {
                session.cursor = cursor;
            }
            errors.extend(status.errors);

            if !status.running {
                break;
            }
        }

        Ok(JobOutcome {
            errors,
            elapsed_ms: started.elapsed().as_secs_f64() * 1_000.0,
        })
    }

    /// The completion boundary: book the result, then decide whether the
    /// loop goes on.
    async fn complete(&self, job: &Job, outcome: JobOutcome) -> bool {
        let mut core = self.core.lock().await;
        let EngineCore {
            registry, session, ..
        } = &mut *core;
        let Some(session) = session.as_mut() else {
            return false;
        };
        let position = job.position;

        if let Some(instance) = registry.instance_mut(position.instance) {
            for error in &outcome.errors {
                instance.has_error = true;
                instance.errors.push(error.clone());
                session.record_error(
                    &job.instance,
                    RecordedError {
                        plugin: job.plugin.clone(),
                        stage: job.stage,
                        record: error.clone(),
                    },
                );
                self.events.emit(EngineEvent::ErrorRaised {
                    instance: job.instance.clone(),
                    error: error.clone(),
                });
            }
        }

        let next = advance::next(
            &registry.instance_toggles(),
            &registry.plugin_toggles(),
            Some(position),
        );
        let wrapped = next.is_none_or(|n| n.plugin != position.plugin);

        let instance_progress = registry.toggled_plugins_through(position.plugin) as f64
            / registry.toggled_plugin_count().max(1) as f64;
        let plugin_progress = if wrapped {
            1.0
        } else {
            registry.toggled_instances_through(position.instance) as f64
                / registry.toggled_instance_count().max(1) as f64
        };
        if let Some(instance) = registry.instance_mut(position.instance) {
            instance.progress = instance_progress;
            instance.processing = false;
        }
        if let Some(plugin) = registry.plugin_mut(position.plugin) {
            plugin.progress = plugin_progress;
            plugin.processing = !wrapped;
        }
        self.events
            .progress(ProgressItem::Instance, &job.instance, instance_progress);
        self.events
            .progress(ProgressItem::Plugin, &job.plugin, plugin_progress);

        session.jobs_completed += 1;
        self.metrics.latency(&job.plugin, outcome.elapsed_ms);
        let status = if outcome.errors.is_empty() { "ok" } else { "error" };
        tracing::event!(
            target: JOB_TARGET,
            tracing::Level::INFO,
            session = %session.id,
            instance = %job.instance,
            plugin = %job.plugin,
            stage = %job.stage,
            latency_ms = outcome.elapsed_ms,
            errors = outcome.errors.len(),
            status,
        );

        let Some(next) = next else {
            let message = if session.has_errors() {
                "Completed with errors"
            } else {
                "Completed successfully"
            };
            self.finish(&mut core, EngineState::Completed, message);
            return false;
        };
        session.position = next;

        let next_stage = registry.plugin(next.plugin).map(|p| p.kind);
        if next_stage.is_some_and(|stage| gate::should_halt(&session.errors, stage)) {
            warn!(session = %session.id, "validation failed, not extracting");
            self.finish(&mut core, EngineState::ValidationFailed, "Validation failed");
            false
        } else if session.stopped {
            self.finish(&mut core, EngineState::Stopped, "Stopped");
            false
        } else if session.paused {
            self.transition(&mut core, EngineState::Paused);
            self.events.message("Paused");
            false
        } else {
            true
        }
    }

    /// The host could not be reached. Park the run on the failed pair.
    async fn lost(&self, job: &Job, err: WorkerError) {
        let mut core = self.core.lock().await;
        self.metrics.failed(&job.plugin);
        error!(instance = %job.instance, plugin = %job.plugin, "communication failure: {err}");

        if let Some(instance) = core.registry.instance_mut(job.position.instance) {
            instance.processing = false;
        }
        if let Some(plugin) = core.registry.plugin_mut(job.position.plugin) {
            plugin.processing = false;
        }

        let stopped = match core.session.as_mut() {
            Some(session) => {
                session.position = job.position;
                session.paused = true;
                session.stopped
            }
            None => return,
        };
        if stopped {
            self.finish(&mut core, EngineState::Stopped, "Stopped");
            return;
        }
        self.transition(&mut core, EngineState::Paused);
        self.events
            .message(format!("Communication failure: {err}"));
    }
}
