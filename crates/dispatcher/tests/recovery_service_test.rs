mod common;

use std::sync::Arc;

use chrono::Utc;
use serde_json::Map;

use scheduler_dispatcher::{
    RecoveryManager, RecoveryService, SchedulerStateManager, StagingTracker, TaskDispatchService,
    TaskDispatcher, WorkerChannels, WorkerPool,
};
use scheduler_domain::entities::{
    ConnectionState, SchedulerState, Task, TaskStatus, WorkerStatus,
};
use scheduler_domain::messaging::WorkerHeartbeat;
use scheduler_testing_utils::{
    DatabaseTestContainer, MockTransferPoller, StagingOperationBuilder, TaskBuilder, WorkerBuilder,
};

/// 一次"进程生命周期"内的全部组件，共享同一个数据库
struct Instance {
    pool: Arc<WorkerPool>,
    dispatcher: Arc<TaskDispatcher>,
    state: Arc<SchedulerStateManager>,
    recovery: RecoveryManager,
}

impl Instance {
    fn boot(db: &DatabaseTestContainer, instance_id: &str) -> Self {
        let pool = Arc::new(WorkerPool::new(db.workers.clone(), None));
        let tracker = Arc::new(StagingTracker::new(
            db.staging.clone(),
            Arc::new(MockTransferPoller::new()),
            Some(common::fast_staging_config()),
        ));
        let state = Arc::new(SchedulerStateManager::new(db.state.clone(), instance_id, None));
        let dispatcher = Arc::new(TaskDispatcher::new(
            db.tasks.clone(),
            pool.clone(),
            tracker.clone(),
            WorkerChannels::new(),
            None,
        ));
        let recovery = RecoveryManager::new(db.tasks.clone(), pool.clone(), tracker, state.clone(), None);
        Self {
            pool,
            dispatcher,
            state,
            recovery,
        }
    }

    async fn reconnect(&self, worker_id: &str) {
        self.pool
            .heartbeat(&WorkerHeartbeat {
                worker_id: worker_id.to_string(),
                status: WorkerStatus::Idle,
                current_task_id: None,
                metadata: Map::new(),
                sent_at: Utc::now(),
            })
            .await
            .unwrap();
    }
}

async fn all_tasks(db: &DatabaseTestContainer, experiments: &[String]) -> Vec<Task> {
    let mut tasks = Vec::new();
    for exp in experiments {
        tasks.extend(db.tasks.list_by_experiment(exp).await.unwrap());
    }
    tasks
}

async fn seed_connected_worker(db: &DatabaseTestContainer, worker_id: &str, experiment_id: &str) {
    db.workers
        .create(
            &WorkerBuilder::new(worker_id)
                .with_experiment(experiment_id)
                .connected()
                .build(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_crash_recovery_requeues_assigned_tasks() {
    let db = DatabaseTestContainer::new().await.unwrap();
    seed_connected_worker(&db, "w1", "exp-1").await;
    seed_connected_worker(&db, "w2", "exp-1").await;
    db.state.upsert(&SchedulerState::starting("crashed-instance")).await.unwrap();

    let seeds = vec![
        TaskBuilder::new("t-staging").with_status(TaskStatus::DataStaging).assigned_to("w1", "host-1").build(),
        TaskBuilder::new("t-running").with_status(TaskStatus::Running).with_retry_count(2).assigned_to("w2", "host-1").build(),
        TaskBuilder::new("t-queued").with_status(TaskStatus::Queued).assigned_to("w1", "host-1").build(),
        TaskBuilder::new("t-output").with_status(TaskStatus::OutputStaging).assigned_to("w2", "host-1").build(),
        TaskBuilder::new("t-done").with_status(TaskStatus::Completed).build(),
        TaskBuilder::new("t-waiting").with_status(TaskStatus::Queued).build(),
    ];
    for task in &seeds {
        db.tasks.insert_if_absent(task).await.unwrap();
    }
    db.staging
        .create(&StagingOperationBuilder::new("t-staging").build())
        .await
        .unwrap();

    let instance = Instance::boot(&db, "new-instance");
    let report = instance.recovery.start_recovery().await.unwrap();

    assert!(report.crash_detected);
    assert_eq!(report.requeued_tasks.len(), 4);
    assert_eq!(report.total_tasks_before, 6);
    assert_eq!(report.total_tasks_after, 6);
    assert_eq!(report.incomplete_operations.len(), 1);
    assert!(report.errors.is_empty(), "{:?}", report.errors);

    let assigned = db.tasks.list_assigned().await.unwrap();
    assert!(assigned.is_empty());

    let running = db.tasks.get_by_id("t-running").await.unwrap().unwrap();
    assert_eq!(running.status, TaskStatus::Queued);
    assert_eq!(running.retry_count, 2);
    assert_eq!(running.worker_id, None);

    let done = db.tasks.get_by_id("t-done").await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);

    for worker in instance.pool.list_workers().await.unwrap() {
        assert_eq!(worker.connection_state, ConnectionState::Disconnected);
        assert_eq!(worker.status, WorkerStatus::Idle);
    }

    let state = instance.state.current().await.unwrap().unwrap();
    assert_eq!(state.instance_id, "new-instance");
    assert!(state.indicates_crash());
}

#[tokio::test]
async fn test_recovery_is_idempotent() {
    let db = DatabaseTestContainer::new().await.unwrap();
    seed_connected_worker(&db, "w1", "exp-1").await;
    db.state.upsert(&SchedulerState::starting("crashed-instance")).await.unwrap();
    db.tasks
        .insert_if_absent(&TaskBuilder::new("t1").with_status(TaskStatus::EnvSetup).assigned_to("w1", "host-1").build())
        .await
        .unwrap();

    let instance = Instance::boot(&db, "new-instance");
    let first = instance.recovery.start_recovery().await.unwrap();
    assert_eq!(first.requeued_tasks, vec!["t1".to_string()]);

    let experiments = vec!["exp-1".to_string()];
    let tasks_after_first = all_tasks(&db, &experiments).await;
    let workers_after_first = instance.pool.list_workers().await.unwrap();

    let second = instance.recovery.start_recovery().await.unwrap();
    assert!(!second.crash_detected);
    assert!(second.requeued_tasks.is_empty());
    assert!(second.disconnected_workers.is_empty());
    assert_eq!(all_tasks(&db, &experiments).await, tasks_after_first);
    assert_eq!(instance.pool.list_workers().await.unwrap(), workers_after_first);
}

#[tokio::test]
async fn test_clean_shutdown_skips_repair() {
    let db = DatabaseTestContainer::new().await.unwrap();
    seed_connected_worker(&db, "w1", "exp-1").await;

    let first = Instance::boot(&db, "instance-a");
    first.recovery.start_recovery().await.unwrap();
    first.dispatcher.enqueue(TaskBuilder::new("t1").build()).await.unwrap();
    first.reconnect("w1").await;
    first.dispatcher.run_dispatch_cycle().await.unwrap();
    assert!(first.state.mark_clean_shutdown().await.unwrap());

    let second = Instance::boot(&db, "instance-b");
    let report = second.recovery.start_recovery().await.unwrap();
    assert!(!report.crash_detected);
    let task = db.tasks.get_by_id("t1").await.unwrap().unwrap();
    assert!(task.worker_id.is_some());
}

#[tokio::test]
async fn test_task_count_conserved_across_restart_cycles() {
    let db = DatabaseTestContainer::new().await.unwrap();
    let experiments: Vec<String> = (0..5).map(|i| format!("exp-{i}")).collect();

    let bootstrap = Instance::boot(&db, "instance-0");
    bootstrap.recovery.start_recovery().await.unwrap();
    for (e, exp) in experiments.iter().enumerate() {
        for w in 0..2 {
            seed_connected_worker(&db, &format!("w-{e}-{w}"), exp).await;
        }
        for t in 0..20 {
            bootstrap
                .dispatcher
                .enqueue(TaskBuilder::new(&format!("{exp}-t{t}")).with_experiment(exp).build())
                .await
                .unwrap();
        }
    }

    for cycle in 1..=3 {
        // 上一实例在分配了部分任务后崩溃
        let before = Instance::boot(&db, &format!("instance-{cycle}-a"));
        for (e, _) in experiments.iter().enumerate() {
            for w in 0..2 {
                before.reconnect(&format!("w-{e}-{w}")).await;
            }
        }
        before.dispatcher.run_dispatch_cycle().await.unwrap();
        let assigned = db.tasks.list_assigned().await.unwrap();
        assert_eq!(assigned.len(), 10, "cycle {cycle}: two tasks per experiment");

        let after = Instance::boot(&db, &format!("instance-{cycle}-b"));
        let report = after.recovery.start_recovery().await.unwrap();
        assert!(report.crash_detected, "cycle {cycle}");
        assert_eq!(report.requeued_tasks.len(), 10);
        assert!(report.tasks_conserved());
        assert_eq!(report.total_tasks_after, 100);

        let tasks = all_tasks(&db, &experiments).await;
        assert_eq!(tasks.len(), 100);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Queued && t.worker_id.is_none()));
        assert!(tasks.iter().all(|t| t.retry_count == 0));
    }
}
