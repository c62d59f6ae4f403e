use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use scheduler_domain::entities::{Task, TaskStatus, Worker};
use scheduler_errors::{FailureReason, SchedulerError, SchedulerResult};

use crate::task_dispatcher::{ExperimentStatus, ExperimentSummary, TaskDispatchService};

/// 只记录失败调用的调度服务
#[derive(Debug, Default)]
pub struct MockDispatchService {
    failures: Mutex<Vec<(String, FailureReason, bool)>>,
    active: Mutex<HashMap<String, Vec<Task>>>,
}

impl MockDispatchService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_active_tasks(self, worker_id: &str, tasks: Vec<Task>) -> Self {
        self.active.lock().unwrap().insert(worker_id.to_string(), tasks);
        self
    }

    pub fn failure_calls(&self) -> Vec<(String, FailureReason, bool)> {
        self.failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskDispatchService for MockDispatchService {
    async fn enqueue(&self, task: Task) -> SchedulerResult<Task> {
        Ok(task)
    }

    async fn assign_to_worker(&self, task_id: &str, _candidates: &[Worker]) -> SchedulerResult<Worker> {
        Err(SchedulerError::NoCapacity {
            task_id: task_id.to_string(),
        })
    }

    async fn record_execution_event(
        &self,
        task_id: &str,
        _status: TaskStatus,
        _error: Option<String>,
    ) -> SchedulerResult<Task> {
        Err(SchedulerError::task_not_found(task_id))
    }

    async fn handle_failure(
        &self,
        task_id: &str,
        reason: FailureReason,
        worker_reachable: bool,
    ) -> SchedulerResult<Task> {
        self.failures
            .lock()
            .unwrap()
            .push((task_id.to_string(), reason, worker_reachable));
        Ok(Task::new(task_id, "exp-1", "true"))
    }

    async fn cancel(&self, task_id: &str, _reason: &str) -> SchedulerResult<Task> {
        Err(SchedulerError::task_not_found(task_id))
    }

    async fn cancel_experiment(&self, _experiment_id: &str, _reason: &str) -> SchedulerResult<usize> {
        Ok(0)
    }

    async fn experiment_summary(&self, experiment_id: &str) -> SchedulerResult<ExperimentSummary> {
        Ok(ExperimentSummary {
            experiment_id: experiment_id.to_string(),
            total: 0,
            counts: HashMap::new(),
            status: ExperimentStatus::Pending,
        })
    }

    async fn get_task(&self, _task_id: &str) -> SchedulerResult<Option<Task>> {
        Ok(None)
    }

    async fn list_tasks_by_experiment(&self, _experiment_id: &str) -> SchedulerResult<Vec<Task>> {
        Ok(vec![])
    }

    async fn list_tasks_by_status(&self, _status: TaskStatus) -> SchedulerResult<Vec<Task>> {
        Ok(vec![])
    }

    async fn active_tasks_for_worker(&self, worker_id: &str) -> SchedulerResult<Vec<Task>> {
        Ok(self
            .active
            .lock()
            .unwrap()
            .get(worker_id)
            .cloned()
            .unwrap_or_default())
    }
}
