mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Map;

use common::TestEngine;
use scheduler_config::WorkerPoolConfig;
use scheduler_dispatcher::{WorkerFailureDetector, WorkerFailureDetectorService, WorkerPool};
use scheduler_domain::entities::{ConnectionState, TaskStatus, WorkerCapabilities, WorkerStatus};
use scheduler_domain::messaging::{WorkerHeartbeat, WorkerRegistration};
use scheduler_testing_utils::{TaskBuilder, TestEnv};

async fn age_heartbeat(engine: &TestEngine, worker_id: &str, seconds: i64) {
    let mut worker = engine.pool.get_worker(worker_id).await.unwrap().unwrap();
    let at = Utc::now() - chrono::Duration::seconds(seconds);
    worker.last_heartbeat = at;
    worker.last_seen_at = Some(at);
    worker.registered_at = worker.registered_at.min(at);
    engine.db.workers.update(&worker).await.unwrap();
}

#[tokio::test]
async fn test_lost_worker_task_is_requeued_and_reassigned() {
    let engine = TestEngine::new().await;
    let _rx = engine.online_worker("w1").await;
    engine.enqueue(TaskBuilder::new("t1").build()).await;
    engine.drive_until("t1", TaskStatus::EnvSetup).await;
    engine.report_running("w1", "t1").await;

    age_heartbeat(&engine, "w1", 180).await;
    let detector = WorkerFailureDetector::new(engine.pool.clone(), engine.dispatcher.clone());
    let report = detector.run_detection_cycle().await.unwrap();
    assert_eq!(report.disconnected_workers, vec!["w1".to_string()]);
    assert_eq!(report.failed_tasks, vec!["t1".to_string()]);

    let task = engine.task("t1").await;
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.worker_id, None);
    assert!(task.error.as_deref().is_some_and(|e| e.contains("心跳丢失")));

    let worker = engine.pool.get_worker("w1").await.unwrap().unwrap();
    assert_eq!(worker.connection_state, ConnectionState::Disconnected);
    assert_eq!(worker.current_task_id, None);

    // Worker重新上报心跳后任务可以再次分配
    engine
        .pool
        .heartbeat(&WorkerHeartbeat {
            worker_id: "w1".to_string(),
            status: WorkerStatus::Idle,
            current_task_id: None,
            metadata: Map::new(),
            sent_at: Utc::now(),
        })
        .await
        .unwrap();
    let task = engine.drive_until("t1", TaskStatus::EnvSetup).await;
    assert_eq!(task.worker_id.as_deref(), Some("w1"));
}

#[tokio::test]
async fn test_detection_loop_fails_task_within_bounded_time() {
    let engine = Arc::new(TestEngine::new().await);
    let _rx = engine.online_worker("w1").await;
    engine
        .enqueue(TaskBuilder::new("t1").with_max_retries(0).build())
        .await;
    engine.drive_until("t1", TaskStatus::EnvSetup).await;

    let fast_pool = Arc::new(WorkerPool::new(
        engine.db.workers.clone(),
        Some(WorkerPoolConfig {
            heartbeat_timeout_seconds: 1,
            health_check_interval_seconds: 1,
            ..Default::default()
        }),
    ));
    let detector = Arc::new(WorkerFailureDetector::new(fast_pool, engine.dispatcher.clone()));
    let loop_handle = {
        let detector = detector.clone();
        tokio::spawn(async move { detector.start_detection().await })
    };

    let probe = engine.clone();
    let failed = TestEnv::wait_for(
        || {
            let probe = probe.clone();
            async move { probe.task("t1").await.status == TaskStatus::Failed }
        },
        Duration::from_secs(6),
    )
    .await;
    detector.stop_detection().await.unwrap();
    loop_handle.abort();

    assert!(failed, "task was not failed after its worker went silent");
    let task = engine.task("t1").await;
    assert!(task.completed_at.is_some());
}

#[tokio::test]
async fn test_fresh_heartbeat_survives_detection() {
    let engine = TestEngine::new().await;
    let _rx = engine.online_worker("w1").await;
    engine.enqueue(TaskBuilder::new("t1").build()).await;
    engine.drive_until("t1", TaskStatus::EnvSetup).await;

    let detector = WorkerFailureDetector::new(engine.pool.clone(), engine.dispatcher.clone());
    let report = detector.run_detection_cycle().await.unwrap();
    assert_eq!(report.checked_workers, 1);
    assert!(report.disconnected_workers.is_empty());
    assert_eq!(engine.task("t1").await.status, TaskStatus::EnvSetup);
}

#[tokio::test]
async fn test_released_worker_requeues_without_charge_and_can_register_again() {
    let engine = TestEngine::new().await;
    let _rx = engine.online_worker("w1").await;
    engine.enqueue(TaskBuilder::new("t1").build()).await;
    engine.drive_until("t1", TaskStatus::EnvSetup).await;
    engine.report_running("w1", "t1").await;

    let requeued = engine.dispatcher.release_worker("w1", "调度器正常关闭").await.unwrap();
    assert_eq!(requeued, 1);

    let task = engine.task("t1").await;
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.retry_count, 0);
    assert_eq!(task.worker_id, None);

    let worker = engine.pool.get_worker("w1").await.unwrap().unwrap();
    assert_eq!(worker.connection_state, ConnectionState::Disconnected);
    assert_eq!(worker.status, WorkerStatus::Idle);
    assert_eq!(worker.current_task_id, None);

    // 再次释放没有变化
    assert_eq!(engine.dispatcher.release_worker("w1", "调度器正常关闭").await.unwrap(), 0);

    // 重启后的代理不会被当作重复注册拒绝
    let registered = engine
        .pool
        .register_worker(&WorkerRegistration {
            worker_id: "w1".to_string(),
            experiment_id: "exp-1".to_string(),
            compute_resource_id: "host-1".to_string(),
            capabilities: WorkerCapabilities::default(),
            hostname: None,
        })
        .await
        .unwrap();
    assert_eq!(registered.connection_state, ConnectionState::Connected);
}
