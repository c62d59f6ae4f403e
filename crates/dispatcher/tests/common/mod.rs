#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Map;
use tokio::sync::mpsc;

use scheduler_config::{DispatcherConfig, StagingConfig};
use scheduler_dispatcher::{StagingTracker, TaskDispatchService, TaskDispatcher, WorkerChannels, WorkerPool};
use scheduler_domain::entities::{Task, TaskStatus, WorkerCapabilities, WorkerStatus};
use scheduler_domain::messaging::{
    SchedulerMessage, TaskResultReport, TaskStatusUpdate, WorkerHeartbeat, WorkerMessage,
    WorkerRegistration,
};
use scheduler_testing_utils::{DatabaseTestContainer, MockTransferPoller, WorkerBuilder};

/// 基于内存SQLite的完整调度引擎
pub struct TestEngine {
    pub db: DatabaseTestContainer,
    pub poller: Arc<MockTransferPoller>,
    pub pool: Arc<WorkerPool>,
    pub tracker: Arc<StagingTracker>,
    pub channels: WorkerChannels,
    pub dispatcher: Arc<TaskDispatcher>,
}

pub fn fast_staging_config() -> StagingConfig {
    StagingConfig {
        poll_interval_ms: 10,
        initial_backoff_ms: 10,
        max_backoff_ms: 40,
        max_attempts: 3,
        ..Default::default()
    }
}

impl TestEngine {
    pub async fn new() -> Self {
        Self::with_poller(MockTransferPoller::new()).await
    }

    pub async fn with_poller(poller: MockTransferPoller) -> Self {
        let db = DatabaseTestContainer::new().await.unwrap();
        let poller = Arc::new(poller);
        let pool = Arc::new(WorkerPool::new(db.workers.clone(), None));
        let tracker = Arc::new(StagingTracker::new(
            db.staging.clone(),
            poller.clone(),
            Some(fast_staging_config()),
        ));
        let channels = WorkerChannels::new();
        let dispatcher = Arc::new(TaskDispatcher::new(
            db.tasks.clone(),
            pool.clone(),
            tracker.clone(),
            channels.clone(),
            Some(DispatcherConfig {
                dispatch_interval_ms: 20,
                work_dir_base: "/work".to_string(),
                ..Default::default()
            }),
        ));

        Self {
            db,
            poller,
            pool,
            tracker,
            channels,
            dispatcher,
        }
    }

    /// 预建Worker行、注册、上报空闲并绑定下行通道
    pub async fn online_worker(&self, worker_id: &str) -> mpsc::Receiver<SchedulerMessage> {
        self.db
            .workers
            .create(&WorkerBuilder::new(worker_id).build())
            .await
            .unwrap();
        self.pool
            .register_worker(&WorkerRegistration {
                worker_id: worker_id.to_string(),
                experiment_id: "exp-1".to_string(),
                compute_resource_id: "host-1".to_string(),
                capabilities: WorkerCapabilities {
                    cpu_cores: 4,
                    memory_mb: 4096,
                    disk_gb: 20,
                    gpus: 0,
                    runtimes: vec!["sh".to_string()],
                },
                hostname: None,
            })
            .await
            .unwrap();
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

        let (tx, rx) = mpsc::channel(16);
        self.channels.attach(worker_id, tx);
        rx
    }

    pub async fn enqueue(&self, task: Task) -> Task {
        self.dispatcher.enqueue(task).await.unwrap()
    }

    pub async fn task(&self, task_id: &str) -> Task {
        self.dispatcher.get_task(task_id).await.unwrap().unwrap()
    }

    /// 反复执行调度循环直到任务进入指定状态
    pub async fn drive_until(&self, task_id: &str, status: TaskStatus) -> Task {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            self.dispatcher.run_dispatch_cycle().await.unwrap();
            let task = self.task(task_id).await;
            if task.status == status {
                return task;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {task_id} stuck in {} waiting for {status}",
                task.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn report_running(&self, worker_id: &str, task_id: &str) {
        self.dispatcher
            .handle_worker_message(&WorkerMessage::TaskStatus(TaskStatusUpdate {
                worker_id: worker_id.to_string(),
                task_id: task_id.to_string(),
                status: TaskStatus::Running,
                message: None,
            }))
            .await
            .unwrap();
    }

    pub async fn report_result(&self, worker_id: &str, task_id: &str, exit_code: i32) {
        self.dispatcher
            .handle_worker_message(&WorkerMessage::TaskResult(TaskResultReport {
                worker_id: worker_id.to_string(),
                task_id: task_id.to_string(),
                success: exit_code == 0,
                exit_code: Some(exit_code),
                output: None,
                error: (exit_code != 0).then(|| "command failed".to_string()),
                failure_class: None,
                duration_ms: 5,
            }))
            .await
            .unwrap();
    }
}

/// 从下行通道里取出下一条任务分配
pub async fn next_assignment(rx: &mut mpsc::Receiver<SchedulerMessage>) -> String {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no assignment delivered")
            .expect("channel closed");
        if let SchedulerMessage::TaskAssignment(assignment) = message {
            return assignment.task_id;
        }
    }
}
