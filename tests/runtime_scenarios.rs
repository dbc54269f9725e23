//! Assembled-runtime behavior: config-driven wiring, checkpoints on
//! execution, shared blocker state, and shutdown draining.

use std::sync::Arc;
use std::time::Duration;

use convoy::{
    task_handler_fn, BlockerSeverity, ConvoyConfig, ConvoyError, ExecutionState, RuntimeBuilder,
    Task, TaskPlan, TaskState,
};
use tempfile::TempDir;

#[tokio::test]
async fn execution_writes_checkpoints_with_plan_and_progress() {
    let dir = TempDir::new().unwrap();
    let mut config = ConvoyConfig::default();
    config.checkpoint.interval_tasks = 1;

    let runtime = RuntimeBuilder::new(config, dir.path()).build().unwrap();
    runtime.start().await.unwrap();

    runtime.scheduler().register_task_handler(
        "work",
        task_handler_fn(|_task, _ctx| async move { Ok(serde_json::json!({})) }),
    );

    let plan = TaskPlan::new(
        "nightly",
        vec![
            Task::new("a", "work"),
            Task::new("b", "work").with_dependency("a"),
        ],
    )
    .unwrap();
    let report = runtime.scheduler().execute(plan).await.unwrap();
    assert_eq!(report.state, ExecutionState::Completed);

    let latest = runtime
        .checkpoints()
        .latest("nightly")
        .await
        .unwrap()
        .expect("final checkpoint written");
    assert_eq!(latest.plan_id, "nightly");
    assert_eq!(latest.plan.len(), 2);
    assert_eq!(latest.completed_count(), 2);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn blockers_reported_by_iterations_appear_in_checkpoints() {
    let dir = TempDir::new().unwrap();
    let runtime = RuntimeBuilder::new(ConvoyConfig::default(), dir.path())
        .build()
        .unwrap();
    runtime.start().await.unwrap();

    // The iteration layer and the scheduler share one blocker registry.
    runtime
        .iterations()
        .report_blocker("missing API credentials", BlockerSeverity::High)
        .await;

    runtime.scheduler().register_task_handler(
        "work",
        task_handler_fn(|_task, _ctx| async move { Ok(serde_json::json!({})) }),
    );
    let plan = TaskPlan::new("p1", vec![Task::new("a", "work")]).unwrap();
    runtime.scheduler().execute(plan).await.unwrap();

    let latest = runtime.checkpoints().latest("p1").await.unwrap().unwrap();
    assert_eq!(latest.open_blockers(), 1);
    assert_eq!(latest.blockers[0].description, "missing API credentials");

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn handler_results_can_depend_on_bus_state() {
    let dir = TempDir::new().unwrap();
    let runtime = RuntimeBuilder::new(ConvoyConfig::default(), dir.path())
        .build()
        .unwrap();
    runtime.start().await.unwrap();

    // Handlers receive the bus in their context and may publish from inside
    // a task.
    runtime.scheduler().register_task_handler(
        "announcer",
        task_handler_fn(|task: Task, ctx: convoy::TaskContext| async move {
            ctx.bus
                .broadcast("done-tasks", serde_json::json!({ "task": task.id }))
                .await?;
            Ok(serde_json::json!({}))
        }),
    );

    let received = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&received);
    runtime.bus().subscribe_to_broadcast(
        "done-tasks",
        "listener",
        convoy::handler_fn(move |msg: convoy::Message| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock()
                    .push(msg.payload["task"].as_str().unwrap_or("?").to_string());
                Ok(())
            }
        }),
    );

    let plan = TaskPlan::new("p1", vec![Task::new("a", "announcer")]).unwrap();
    runtime.scheduler().execute(plan).await.unwrap();

    assert_eq!(*received.lock(), vec!["a".to_string()]);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_rejects_outstanding_requests_and_flushes() {
    let dir = TempDir::new().unwrap();
    let runtime = Arc::new(
        RuntimeBuilder::new(ConvoyConfig::default(), dir.path())
            .build()
            .unwrap(),
    );
    runtime.start().await.unwrap();

    let requester = runtime.bus().clone();
    let pending = tokio::spawn(async move {
        requester
            .request(
                "never.answered",
                serde_json::json!({}),
                Some(Duration::from_secs(30)),
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    runtime.shutdown().await.unwrap();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, ConvoyError::Shutdown));

    // Publishing after shutdown is refused.
    let err = runtime
        .bus()
        .publish("late", serde_json::json!({}), Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ConvoyError::Shutdown));

    // Shutdown left a final state snapshot behind.
    let snapshot = runtime
        .snapshots()
        .load_latest("runtime")
        .await
        .unwrap()
        .expect("final snapshot written");
    assert!(snapshot.state.contains_key("bus"));
}

#[tokio::test]
async fn failed_plan_reports_failed_state() {
    let dir = TempDir::new().unwrap();
    let mut config = ConvoyConfig::default();
    config.scheduler.max_task_retries = 0;

    let runtime = RuntimeBuilder::new(config, dir.path()).build().unwrap();
    runtime.start().await.unwrap();

    runtime.scheduler().register_task_handler(
        "doomed",
        task_handler_fn(|task: Task, _ctx| async move {
            Err(ConvoyError::TaskFailed {
                task_id: task.id.clone(),
                message: "no dice".into(),
            })
        }),
    );

    let plan = TaskPlan::new(
        "p1",
        vec![
            Task::new("a", "doomed"),
            Task::new("b", "doomed").with_dependency("a"),
        ],
    )
    .unwrap();
    let report = runtime.scheduler().execute(plan).await.unwrap();

    assert_eq!(report.state, ExecutionState::Failed);
    assert_eq!(report.record("a").unwrap().state, TaskState::Failed);
    assert_eq!(report.record("b").unwrap().state, TaskState::Skipped);

    let status = runtime.scheduler().get_status();
    assert_eq!(status.state, ExecutionState::Failed);
    assert_eq!(status.failed, 1);
    assert_eq!(status.skipped, 1);

    runtime.shutdown().await.unwrap();
}
