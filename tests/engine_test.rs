use std::time::Duration;

use async_trait::async_trait;
use publish_driver::advance::Position;
use publish_driver::engine::{EngineEvent, EngineState, NO_WORK_MESSAGE};
use publish_driver::logger::Logger;
use publish_driver::{Engine, EngineError};
use tokio::sync::broadcast;
use worker_client::message::{
    ApplicationInfo, Cursor, InstanceRecord, JobHandle, JobStatus, PluginKind, PluginRecord,
};
use worker_client::mock::MockWorker;
use worker_client::{WorkerClientType, WorkerError};

/// Answers like the wrapped mock, but takes its time listing plugins.
#[derive(Clone)]
struct SlowHost {
    inner: MockWorker,
    delay: Duration,
}

#[async_trait]
impl WorkerClientType for SlowHost {
    async fn connect(&self) -> Result<(), WorkerError> {
        self.inner.connect().await
    }
    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, WorkerError> {
        self.inner.list_instances().await
    }
    async fn list_plugins(&self) -> Result<Vec<PluginRecord>, WorkerError> {
        tokio::time::sleep(self.delay).await;
        self.inner.list_plugins().await
    }
    async fn submit_job(&self, instance: &str, plugin: &str) -> Result<JobHandle, WorkerError> {
        self.inner.submit_job(instance, plugin).await
    }
    async fn poll_job(&self, handle: &JobHandle, cursor: Cursor) -> Result<JobStatus, WorkerError> {
        self.inner.poll_job(handle, cursor).await
    }
    async fn application_info(&self) -> Result<ApplicationInfo, WorkerError> {
        self.inner.application_info().await
    }
}

/// Lists like the wrapped mock; any submission panics.
#[derive(Clone)]
struct BrokenHost(MockWorker);

#[async_trait]
impl WorkerClientType for BrokenHost {
    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, WorkerError> {
        self.0.list_instances().await
    }
    async fn list_plugins(&self) -> Result<Vec<PluginRecord>, WorkerError> {
        self.0.list_plugins().await
    }
    async fn submit_job(&self, _instance: &str, _plugin: &str) -> Result<JobHandle, WorkerError> {
        panic!("host bug")
    }
    async fn poll_job(&self, handle: &JobHandle, cursor: Cursor) -> Result<JobStatus, WorkerError> {
        self.0.poll_job(handle, cursor).await
    }
    async fn application_info(&self) -> Result<ApplicationInfo, WorkerError> {
        self.0.application_info().await
    }
}

fn two_by_two() -> MockWorker {
    MockWorker::new(
        vec![
            InstanceRecord::new("A", "model"),
            InstanceRecord::new("B", "model"),
        ],
        vec![
            PluginRecord::new("Extract", PluginKind::Extractor, 1.0),
            PluginRecord::new("Validate", PluginKind::Validator, 0.0),
        ],
    )
}

async fn engine_for(worker: &MockWorker) -> Engine {
    let engine = Engine::new(worker.clone(), Duration::from_millis(100), Logger::default());
    engine.populate().await.unwrap();
    engine
}

fn pairs(expected: &[(&str, &str)]) -> Vec<(String, String)> {
    expected
        .iter()
        .map(|(i, p)| (i.to_string(), p.to_string()))
        .collect()
}

fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = vec![];
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn messages(events: &[EngineEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::MessageRaised(text) => Some(text.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn full_run_visits_every_pair_instances_innermost() {
    let worker = MockWorker::new(
        vec![
            InstanceRecord::new("A", "model"),
            InstanceRecord::new("B", "model").with_publish(false),
            InstanceRecord::new("C", "rig"),
        ],
        vec![
            PluginRecord::new("Integrate", PluginKind::Integrator, 3.0),
            PluginRecord::new("Extract", PluginKind::Extractor, 2.0),
            PluginRecord::new("ValidateOne", PluginKind::Validator, 1.0),
            PluginRecord::new("ValidateTwo", PluginKind::Validator, 1.0),
            PluginRecord::new("Collect", PluginKind::Selector, 0.0),
        ],
    )
    .with_polls(2);
    let engine = engine_for(&worker).await;
    let mut events = engine.subscribe();

    engine.start().await.unwrap();
    assert_eq!(engine.wait().await, EngineState::Completed);

    assert_eq!(
        worker.submissions(),
        pairs(&[
            ("A", "ValidateOne"),
            ("C", "ValidateOne"),
            ("A", "ValidateTwo"),
            ("C", "ValidateTwo"),
            ("A", "Extract"),
            ("C", "Extract"),
            ("A", "Integrate"),
            ("C", "Integrate"),
        ])
    );
    // Every job is polled until it stops running: 2 running polls + 1 final.
    assert_eq!(worker.poll_count(), 8 * 3);

    let registry = engine.registry().await;
    for instance in registry.instances() {
        let expected = if instance.toggled { 1.0 } else { 0.0 };
        assert_eq!(instance.progress, expected, "{}", instance.name);
        assert!(!instance.processing);
    }
    for plugin in registry.plugins() {
        assert_eq!(plugin.progress, 1.0, "{}", plugin.name);
        assert!(!plugin.processing);
    }
    assert_eq!(engine.position().await, None);

    let events = drain(&mut events);
    assert_eq!(messages(&events).last().unwrap(), "Completed successfully");
}

#[tokio::test(start_paused = true)]
async fn untoggled_instance_is_never_submitted() {
    let worker = two_by_two();
    let engine = engine_for(&worker).await;
    engine.toggle_instance("B", false).await.unwrap();

    engine.start().await.unwrap();
    assert_eq!(engine.wait().await, EngineState::Completed);
    assert_eq!(
        worker.submissions(),
        pairs(&[("A", "Validate"), ("A", "Extract")])
    );
}

#[tokio::test(start_paused = true)]
async fn selector_is_left_out() {
    let worker = MockWorker::new(
        vec![InstanceRecord::new("A", "model")],
        vec![
            PluginRecord::new("Select", PluginKind::Selector, 0.0),
            PluginRecord::new("Validate", PluginKind::Validator, 1.0),
        ],
    );
    let engine = engine_for(&worker).await;
    assert_eq!(engine.registry().await.plugins().len(), 1);

    engine.start().await.unwrap();
    assert_eq!(engine.wait().await, EngineState::Completed);
    assert_eq!(worker.submissions(), pairs(&[("A", "Validate")]));
}

#[tokio::test(start_paused = true)]
async fn validation_error_halts_before_extraction() {
    let worker = two_by_two();
    worker.script_errors("A", "Validate", &["bad namespace"]);
    let engine = engine_for(&worker).await;
    let mut events = engine.subscribe();

    engine.start().await.unwrap();
    assert_eq!(engine.wait().await, EngineState::ValidationFailed);

    // Both instances are validated before the gate is consulted.
    assert_eq!(
        worker.submissions(),
        pairs(&[("A", "Validate"), ("B", "Validate")])
    );

    let registry = engine.registry().await;
    let a = &registry.instances()[0];
    assert!(a.has_error);
    assert_eq!(a.errors[0].message, "bad namespace");
    assert!(!registry.instances()[1].has_error);

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::ErrorRaised { instance, .. } if instance == "A"
    )));
    assert_eq!(messages(&events).last().unwrap(), "Validation failed");
}

#[tokio::test(start_paused = true)]
async fn failure_mock_host_fails_validation() {
    let worker = MockWorker::napoleon();
    let engine = engine_for(&worker).await;

    engine.start().await.unwrap();
    assert_eq!(engine.wait().await, EngineState::ValidationFailed);
    assert_eq!(
        worker.submissions(),
        pairs(&[
            ("Richard05", "ValidateFailureMock"),
            ("Steven11", "ValidateFailureMock"),
            ("Richard05", "ValidateNamespace"),
            ("Steven11", "ValidateNamespace"),
        ])
    );
    assert!(!worker
        .submissions()
        .iter()
        .any(|(_, plugin)| plugin == "ExtractAsMa"));
}

#[tokio::test(start_paused = true)]
async fn late_stage_errors_do_not_halt() {
    let worker = two_by_two();
    worker.script_errors("A", "Extract", &["disk full"]);
    let engine = engine_for(&worker).await;
    let mut events = engine.subscribe();

    engine.start().await.unwrap();
    assert_eq!(engine.wait().await, EngineState::Completed);
    assert_eq!(worker.submissions().len(), 4);
    assert_eq!(
        messages(&drain(&mut events)).last().unwrap(),
        "Completed with errors"
    );
}

#[tokio::test(start_paused = true)]
async fn nothing_toggled_stays_idle() {
    let worker = two_by_two();
    let engine = engine_for(&worker).await;
    engine.toggle_instance("A", false).await.unwrap();
    engine.toggle_instance("B", false).await.unwrap();
    let mut events = engine.subscribe();

    let err = engine.start().await.unwrap_err();
    assert!(matches!(err, EngineError::NoEligibleWork));
    assert_eq!(engine.state().await, EngineState::Idle);
    assert!(worker.submissions().is_empty());
    assert_eq!(messages(&drain(&mut events)), vec![NO_WORK_MESSAGE.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn pause_then_resume_continues_at_pending_pair() {
    let worker = two_by_two();
    let engine = engine_for(&worker).await;
    let mut events = engine.subscribe();

    engine.start().await.unwrap();
    engine.pause().await.unwrap();
    assert_eq!(engine.state().await, EngineState::Running);
    assert_eq!(engine.wait().await, EngineState::Paused);

    assert_eq!(worker.submissions(), pairs(&[("A", "Validate")]));
    assert_eq!(engine.position().await, Some(Position::new(1, 0)));
    let seen = messages(&drain(&mut events));
    assert!(seen.contains(&"Pausing..".to_string()));
    assert_eq!(seen.last().unwrap(), "Paused");

    engine.resume().await.unwrap();
    assert_eq!(engine.wait().await, EngineState::Completed);
    assert_eq!(
        worker.submissions(),
        pairs(&[
            ("A", "Validate"),
            ("B", "Validate"),
            ("A", "Extract"),
            ("B", "Extract"),
        ])
    );
}

#[tokio::test(start_paused = true)]
async fn stop_freezes_progress() {
    let worker = two_by_two().with_polls(3);
    let engine = engine_for(&worker).await;

    engine.start().await.unwrap();
    engine.stop().await.unwrap();
    assert_eq!(engine.state().await, EngineState::Stopping);
    assert_eq!(engine.wait().await, EngineState::Stopped);
    assert_eq!(worker.submissions().len(), 1);

    let frozen = engine.registry().await;
    assert_eq!(frozen.instances()[0].progress, 0.5);
    assert_eq!(frozen.plugins()[0].progress, 0.5);
    assert!(frozen.instances().iter().all(|i| !i.processing));

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(worker.submissions().len(), 1);
    assert_eq!(engine.registry().await, frozen);
}

#[tokio::test(start_paused = true)]
async fn stop_while_paused_is_immediate() {
    let worker = two_by_two();
    let engine = engine_for(&worker).await;

    engine.start().await.unwrap();
    engine.pause().await.unwrap();
    assert_eq!(engine.wait().await, EngineState::Paused);

    let mut events = engine.subscribe();
    engine.stop().await.unwrap();
    assert_eq!(engine.state().await, EngineState::Stopped);
    assert_eq!(messages(&drain(&mut events)), vec!["Stopped".to_string()]);
    assert_eq!(worker.submissions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_submit_parks_the_run_on_that_pair() {
    let worker = two_by_two();
    worker.fail_submit_at(1);
    let engine = engine_for(&worker).await;
    let mut events = engine.subscribe();

    engine.start().await.unwrap();
    assert_eq!(engine.wait().await, EngineState::Paused);
    assert_eq!(engine.position().await, Some(Position::new(1, 0)));
    assert!(messages(&drain(&mut events))
        .last()
        .unwrap()
        .starts_with("Communication failure"));
    assert!(!engine.registry().await.instances()[1].processing);

    worker.clear_failures();
    engine.resume().await.unwrap();
    assert_eq!(engine.wait().await, EngineState::Completed);

    let submitted = worker.submissions();
    assert_eq!(submitted.len(), 5);
    assert_eq!(submitted[1], submitted[2]);
}

#[tokio::test(start_paused = true)]
async fn failed_poll_parks_the_run_on_that_pair() {
    let worker = two_by_two();
    worker.fail_polls(true);
    let engine = engine_for(&worker).await;

    engine.start().await.unwrap();
    assert_eq!(engine.wait().await, EngineState::Paused);
    assert_eq!(engine.position().await, Some(Position::new(0, 0)));

    worker.fail_polls(false);
    engine.resume().await.unwrap();
    assert_eq!(engine.wait().await, EngineState::Completed);
    assert_eq!(worker.submissions()[0], worker.submissions()[1]);
}

#[tokio::test(start_paused = true)]
async fn toggles_are_locked_during_a_run() {
    let worker = two_by_two();
    let engine = engine_for(&worker).await;

    engine.start().await.unwrap();
    let err = engine.toggle_instance("B", false).await.unwrap_err();
    assert!(matches!(err, EngineError::Busy(EngineState::Running)));

    engine.pause().await.unwrap();
    engine.wait().await;
    let err = engine.toggle_plugin("Extract", false).await.unwrap_err();
    assert!(matches!(err, EngineError::Busy(EngineState::Paused)));
    engine.select_instance("B").await.unwrap();

    engine.stop().await.unwrap();
    engine.toggle_instance("B", false).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn invalid_transitions_fail_loudly() {
    let worker = two_by_two().with_polls(5);
    let engine = engine_for(&worker).await;

    for result in [engine.pause().await, engine.resume().await, engine.stop().await] {
        assert!(matches!(
            result,
            Err(EngineError::InvalidState { state: EngineState::Idle, .. })
        ));
    }

    engine.start().await.unwrap();
    assert!(matches!(
        engine.start().await,
        Err(EngineError::InvalidState { operation: "start", .. })
    ));
    assert!(engine.resume().await.is_err());
    assert!(engine.populate().await.is_err());
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn log_lines_are_delivered_once() {
    let worker = two_by_two().with_polls(2);
    worker.script_log("A", "Validate", &["one", "two"]);
    worker.script_log("B", "Validate", &["three"]);
    let engine = engine_for(&worker).await;
    let mut events = engine.subscribe();

    engine.start().await.unwrap();
    engine.wait().await;

    let lines: Vec<String> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            EngineEvent::LogAppended(record) => Some(record.message),
            _ => None,
        })
        .collect();
    assert_eq!(lines, vec!["one", "two", "three"]);
}

#[tokio::test(start_paused = true)]
async fn a_finished_run_can_start_over() {
    let worker = two_by_two();
    worker.script_errors("B", "Extract", &["flaky"]);
    let engine = engine_for(&worker).await;

    engine.start().await.unwrap();
    assert_eq!(engine.wait().await, EngineState::Completed);
    assert!(engine.registry().await.instances()[1].has_error);

    engine.start().await.unwrap();
    assert_eq!(engine.state().await, EngineState::Running);
    let registry = engine.registry().await;
    assert!(!registry.instances()[1].has_error);
    assert_eq!(registry.instances()[0].progress, 0.0);

    assert_eq!(engine.wait().await, EngineState::Completed);
    assert_eq!(worker.submissions().len(), 8);
}

#[tokio::test(start_paused = true)]
async fn populate_opens_the_session() {
    let worker = MockWorker::napoleon();
    let engine = engine_for(&worker).await;

    assert!(worker.is_connected());
    assert_eq!(engine.application().await.unwrap().host_name, "mock");

    let registry = engine.registry().await;
    let names: Vec<&str> = registry.plugins().iter().map(|p| p.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["ValidateFailureMock", "ValidateNamespace", "ExtractAsMa", "ConformAsset"]
    );
    assert_eq!(registry.instance_toggles(), vec![false, true, true]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_abandons_the_job_in_flight() {
    let worker = two_by_two().with_polls(1_000);
    let engine = engine_for(&worker).await;

    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    engine.shutdown().await;

    assert_eq!(engine.state().await, EngineState::Idle);
    assert_eq!(engine.position().await, None);
    assert_eq!(worker.submissions().len(), 1);
    assert!(engine.registry().await.instances().iter().all(|i| !i.processing));
}

#[tokio::test(start_paused = true)]
async fn gate_wins_over_a_stop_during_the_last_validation() {
    let worker = MockWorker::new(
        vec![InstanceRecord::new("A", "model")],
        vec![
            PluginRecord::new("Validate", PluginKind::Validator, 0.0),
            PluginRecord::new("Extract", PluginKind::Extractor, 1.0),
        ],
    )
    .with_polls(3);
    worker.script_errors("A", "Validate", &["bad namespace"]);
    let engine = engine_for(&worker).await;
    let mut events = engine.subscribe();

    engine.start().await.unwrap();
    engine.stop().await.unwrap();
    assert_eq!(engine.wait().await, EngineState::ValidationFailed);
    assert_eq!(worker.submissions(), pairs(&[("A", "Validate")]));
    assert_eq!(messages(&drain(&mut events)).last().unwrap(), "Validation failed");
}

#[tokio::test(start_paused = true)]
async fn stop_still_wins_when_validation_passed() {
    let worker = MockWorker::new(
        vec![InstanceRecord::new("A", "model")],
        vec![
            PluginRecord::new("Validate", PluginKind::Validator, 0.0),
            PluginRecord::new("Extract", PluginKind::Extractor, 1.0),
        ],
    )
    .with_polls(3);
    let engine = engine_for(&worker).await;

    engine.start().await.unwrap();
    engine.stop().await.unwrap();
    assert_eq!(engine.wait().await, EngineState::Stopped);
    assert_eq!(worker.submissions(), pairs(&[("A", "Validate")]));
}

#[tokio::test(start_paused = true)]
async fn error_on_the_last_validation_pair_still_halts() {
    let worker = MockWorker::new(
        vec![
            InstanceRecord::new("A", "model"),
            InstanceRecord::new("B", "model"),
        ],
        vec![
            PluginRecord::new("ValidateOne", PluginKind::Validator, 1.0),
            PluginRecord::new("ValidateTwo", PluginKind::Validator, 1.1),
            PluginRecord::new("Extract", PluginKind::Extractor, 2.0),
        ],
    );
    worker.script_errors("B", "ValidateTwo", &["missing uv set"]);
    let engine = engine_for(&worker).await;

    engine.start().await.unwrap();
    assert_eq!(engine.wait().await, EngineState::ValidationFailed);
    assert_eq!(
        worker.submissions(),
        pairs(&[
            ("A", "ValidateOne"),
            ("B", "ValidateOne"),
            ("A", "ValidateTwo"),
            ("B", "ValidateTwo"),
        ])
    );
    assert!(!engine.registry().await.instances()[0].has_error);
    assert!(engine.registry().await.instances()[1].has_error);
}

#[tokio::test(start_paused = true)]
async fn readers_are_not_blocked_by_a_slow_populate() {
    let host = SlowHost {
        inner: two_by_two(),
        delay: Duration::from_secs(10),
    };
    let engine = Engine::new(host, Duration::from_millis(100), Logger::default());

    let populating = tokio::spawn({
        let engine = engine.clone();
        async move { engine.populate().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let state = tokio::time::timeout(Duration::from_secs(1), engine.state()).await;
    assert_eq!(state.unwrap(), EngineState::Idle);
    let registry = tokio::time::timeout(Duration::from_secs(1), engine.registry()).await;
    assert!(registry.unwrap().plugins().is_empty());

    populating.await.unwrap().unwrap();
    assert_eq!(engine.registry().await.plugins().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn every_waiter_sees_the_end_of_the_run() {
    let worker = two_by_two().with_polls(2);
    let engine = engine_for(&worker).await;

    engine.start().await.unwrap();
    let (first, second) = tokio::join!(engine.wait(), engine.wait());
    assert_eq!(first, EngineState::Completed);
    assert_eq!(second, EngineState::Completed);
}

#[tokio::test(start_paused = true)]
async fn a_panicking_loop_ends_the_run() {
    let engine = Engine::new(
        BrokenHost(two_by_two()),
        Duration::from_millis(100),
        Logger::default(),
    );
    engine.populate().await.unwrap();

    engine.start().await.unwrap();
    assert_eq!(engine.wait().await, EngineState::Stopped);
    assert_eq!(engine.position().await, None);
}

#[tokio::test(start_paused = true)]
async fn shutdown_survives_a_panicking_loop() {
    let engine = Engine::new(
        BrokenHost(two_by_two()),
        Duration::from_millis(100),
        Logger::default(),
    );
    engine.populate().await.unwrap();

    engine.start().await.unwrap();
    engine.shutdown().await;
    assert_eq!(engine.state().await, EngineState::Idle);
    assert!(engine.registry().await.instances().iter().all(|i| !i.processing));
}
