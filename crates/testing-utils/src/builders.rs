//! Test data builders for creating test entities
//!
//! This module provides builder patterns for creating test data with
//! sensible defaults and easy customization.

use chrono::{DateTime, Duration, Utc};
use scheduler_domain::entities::{
    ConnectionState, FileMetadata, ResourceRequirements, StagingDirection, StagingOperation,
    StagingStatus, Task, TaskStatus, Worker, WorkerCapabilities, WorkerStatus,
};

/// Builder for creating test Task entities
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            task: Task::new(id, "exp-1", "true"),
        }
    }

    pub fn with_experiment(mut self, experiment_id: &str) -> Self {
        self.task.experiment_id = experiment_id.to_string();
        self
    }

    pub fn with_command(mut self, command: &str) -> Self {
        self.task.command = command.to_string();
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        if status.is_terminal() {
            self.task.completed_at = Some(Utc::now());
        }
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.task.max_retries = max_retries;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.task.retry_count = retry_count;
        self
    }

    pub fn with_input(mut self, path: &str, size: i64) -> Self {
        self.task.input_files.push(FileMetadata::new(path, size, None));
        self
    }

    pub fn with_output(mut self, path: &str) -> Self {
        self.task.output_files.push(FileMetadata::new(path, 0, None));
        self
    }

    pub fn with_requirements(mut self, requirements: ResourceRequirements) -> Self {
        self.task.requirements = requirements;
        self
    }

    /// 直接标记为已分配，用于构造恢复场景
    pub fn assigned_to(mut self, worker_id: &str, compute_resource_id: &str) -> Self {
        self.task.worker_id = Some(worker_id.to_string());
        self.task.compute_resource_id = Some(compute_resource_id.to_string());
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.task.created_at = created_at;
        self.task.updated_at = created_at;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

/// Builder for creating test Worker entities
pub struct WorkerBuilder {
    worker: Worker,
}

impl WorkerBuilder {
    pub fn new(id: &str) -> Self {
        let mut worker = Worker::provisioned(id, "exp-1", "host-1", "user-1", 3600);
        worker.capabilities = WorkerCapabilities {
            cpu_cores: 4,
            memory_mb: 8192,
            disk_gb: 50,
            gpus: 0,
            runtimes: vec!["sh".to_string()],
        };
        Self { worker }
    }

    pub fn with_experiment(mut self, experiment_id: &str) -> Self {
        self.worker.experiment_id = experiment_id.to_string();
        self
    }

    pub fn with_compute_resource(mut self, compute_resource_id: &str) -> Self {
        self.worker.compute_resource_id = compute_resource_id.to_string();
        self
    }

    pub fn with_capabilities(mut self, capabilities: WorkerCapabilities) -> Self {
        self.worker.capabilities = capabilities;
        self
    }

    pub fn connected(mut self) -> Self {
        self.worker.connection_state = ConnectionState::Connected;
        self.worker.last_seen_at = Some(Utc::now());
        self
    }

    pub fn busy_with(mut self, task_id: &str) -> Self {
        self.worker.status = WorkerStatus::Busy;
        self.worker.current_task_id = Some(task_id.to_string());
        self
    }

    pub fn registered_at(mut self, registered_at: DateTime<Utc>) -> Self {
        self.worker.registered_at = registered_at;
        self.worker.last_heartbeat = self.worker.last_heartbeat.max(registered_at);
        self
    }

    /// 把最近心跳推到过去，`registered_at` 同步前移以保持 `last_heartbeat >= registered_at`
    pub fn heartbeat_ago(mut self, age: Duration) -> Self {
        let at = Utc::now() - age;
        self.worker.last_heartbeat = at;
        self.worker.last_seen_at = Some(at);
        if self.worker.registered_at > at {
            self.worker.registered_at = at;
        }
        self
    }

    pub fn build(self) -> Worker {
        self.worker
    }
}

/// Builder for creating test StagingOperation entities
pub struct StagingOperationBuilder {
    op: StagingOperation,
}

impl StagingOperationBuilder {
    pub fn new(task_id: &str) -> Self {
        Self {
            op: StagingOperation::new(
                task_id,
                "w1",
                "host-1",
                StagingDirection::Input,
                "nfs-1:/in/data.txt",
                &format!("host-1:/work/{task_id}/data.txt"),
                0,
                600,
            ),
        }
    }

    pub fn with_paths(mut self, source: &str, destination: &str) -> Self {
        self.op.source_path = source.to_string();
        self.op.destination_path = destination.to_string();
        self
    }

    pub fn with_status(mut self, status: StagingStatus) -> Self {
        self.op.status = status;
        let now = Utc::now();
        if status != StagingStatus::Pending {
            self.op.started_at = Some(now);
        }
        if status.is_terminal() {
            self.op.completed_at = Some(now);
        }
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: i64) -> Self {
        self.op.timeout_seconds = timeout_seconds;
        self
    }

    pub fn started_ago(mut self, age: Duration) -> Self {
        self.op.started_at = Some(Utc::now() - age);
        self
    }

    pub fn completed_ago(mut self, age: Duration) -> Self {
        self.op.completed_at = Some(Utc::now() - age);
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.op.created_at = created_at;
        self
    }

    pub fn build(self) -> StagingOperation {
        self.op
    }
}
