//! Mock implementations for repository and port traits
//!
//! In-memory implementations with the same conditional-update semantics as
//! the SQLite repositories, so unit tests exercise the real concurrency rules.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_domain::entities::{
    ConnectionState, SchedulerState, SchedulerStatus, StagingOperation, StagingStatus, Task,
    TaskStatus, Worker, WorkerStatus,
};
use scheduler_domain::ports::{
    AccessContext, Credential, CredentialKind, CredentialVault, SecretBytes, TransferPoller,
    TransferProgress,
};
use scheduler_domain::repositories::{
    SchedulerStateRepository, StagingOperationRepository, TaskRepository, WorkerRepository,
};
use scheduler_domain::ResourceType;
use scheduler_errors::{AdapterError, SchedulerError, SchedulerResult};

fn sort_tasks(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    tasks
}

/// Mock implementation of TaskRepository for testing
#[derive(Debug, Clone, Default)]
pub struct MockTaskRepository {
    tasks: Arc<Mutex<HashMap<String, Task>>>,
}

impl MockTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        let repo = Self::new();
        {
            let mut map = repo.tasks.lock().unwrap();
            for task in tasks {
                map.insert(task.id.clone(), task);
            }
        }
        repo
    }

    pub fn clear(&self) {
        self.tasks.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_all_tasks(&self) -> Vec<Task> {
        sort_tasks(self.tasks.lock().unwrap().values().cloned().collect())
    }

    /// 绕过版本检查直接覆盖，用于构造测试前置状态
    pub fn put(&self, task: Task) {
        self.tasks.lock().unwrap().insert(task.id.clone(), task);
    }

    fn select<P: Fn(&Task) -> bool>(&self, predicate: P) -> Vec<Task> {
        sort_tasks(
            self.tasks
                .lock()
                .unwrap()
                .values()
                .filter(|t| predicate(t))
                .cloned()
                .collect(),
        )
    }
}

#[async_trait]
impl TaskRepository for MockTaskRepository {
    async fn insert_if_absent(&self, task: &Task) -> SchedulerResult<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.contains_key(&task.id) {
            return Ok(false);
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(true)
    }

    async fn get_by_id(&self, id: &str) -> SchedulerResult<Option<Task>> {
        Ok(self.tasks.lock().unwrap().get(id).cloned())
    }

    async fn update_versioned(&self, task: &Task) -> SchedulerResult<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(&task.id) {
            Some(stored) if stored.version == task.version => {
                let mut next = task.clone();
                next.version += 1;
                *stored = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_by_status(&self, status: TaskStatus) -> SchedulerResult<Vec<Task>> {
        Ok(self.select(|t| t.status == status))
    }

    async fn list_by_experiment(&self, experiment_id: &str) -> SchedulerResult<Vec<Task>> {
        Ok(self.select(|t| t.experiment_id == experiment_id))
    }

    async fn list_by_worker(&self, worker_id: &str) -> SchedulerResult<Vec<Task>> {
        Ok(self.select(|t| t.worker_id.as_deref() == Some(worker_id)))
    }

    async fn list_assigned(&self) -> SchedulerResult<Vec<Task>> {
        Ok(self.select(|t| t.looks_assigned()))
    }

    async fn list_queued_unassigned(&self, limit: u32) -> SchedulerResult<Vec<Task>> {
        let mut tasks = self.select(|t| t.status == TaskStatus::Queued && t.worker_id.is_none());
        tasks.truncate(limit as usize);
        Ok(tasks)
    }

    async fn count(&self) -> SchedulerResult<u64> {
        Ok(self.len() as u64)
    }

    async fn delete_by_experiment(&self, experiment_id: &str) -> SchedulerResult<u64> {
        let mut tasks = self.tasks.lock().unwrap();
        let before = tasks.len();
        tasks.retain(|_, t| t.experiment_id != experiment_id);
        Ok((before - tasks.len()) as u64)
    }
}

/// Mock implementation of WorkerRepository for testing
#[derive(Debug, Clone, Default)]
pub struct MockWorkerRepository {
    workers: Arc<Mutex<HashMap<String, Worker>>>,
}

impl MockWorkerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(workers: Vec<Worker>) -> Self {
        let repo = Self::new();
        for worker in workers {
            repo.put(worker);
        }
        repo
    }

    pub fn put(&self, worker: Worker) {
        self.workers.lock().unwrap().insert(worker.id.clone(), worker);
    }

    pub fn len(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn select<P: Fn(&Worker) -> bool>(&self, predicate: P) -> Vec<Worker> {
        let mut workers: Vec<Worker> = self
            .workers
            .lock()
            .unwrap()
            .values()
            .filter(|w| predicate(w))
            .cloned()
            .collect();
        workers.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        workers
    }
}

#[async_trait]
impl WorkerRepository for MockWorkerRepository {
    async fn create(&self, worker: &Worker) -> SchedulerResult<()> {
        let mut workers = self.workers.lock().unwrap();
        if workers.contains_key(&worker.id) {
            return Err(SchedulerError::DatabaseOperation(format!(
                "worker {} already exists",
                worker.id
            )));
        }
        workers.insert(worker.id.clone(), worker.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> SchedulerResult<Option<Worker>> {
        Ok(self.workers.lock().unwrap().get(id).cloned())
    }

    async fn list_all(&self) -> SchedulerResult<Vec<Worker>> {
        Ok(self.select(|_| true))
    }

    async fn list_by_experiment(&self, experiment_id: &str) -> SchedulerResult<Vec<Worker>> {
        Ok(self.select(|w| w.experiment_id == experiment_id))
    }

    async fn list_by_connection(&self, state: ConnectionState) -> SchedulerResult<Vec<Worker>> {
        Ok(self.select(|w| w.connection_state == state))
    }

    async fn list_usable(&self, experiment_id: &str) -> SchedulerResult<Vec<Worker>> {
        Ok(self.select(|w| w.experiment_id == experiment_id && w.is_usable()))
    }

    async fn update(&self, worker: &Worker) -> SchedulerResult<()> {
        let mut workers = self.workers.lock().unwrap();
        match workers.get_mut(&worker.id) {
            Some(stored) => {
                *stored = worker.clone();
                Ok(())
            }
            None => Err(SchedulerError::worker_not_found(&worker.id)),
        }
    }

    async fn try_claim(
        &self,
        worker_id: &str,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut workers = self.workers.lock().unwrap();
        match workers.get_mut(worker_id) {
            Some(w) if w.is_usable() && w.current_task_id.is_none() => {
                w.status = WorkerStatus::Busy;
                w.current_task_id = Some(task_id.to_string());
                w.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(
        &self,
        worker_id: &str,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut workers = self.workers.lock().unwrap();
        match workers.get_mut(worker_id) {
            Some(w) if w.current_task_id.as_deref() == Some(task_id) => {
                w.status = WorkerStatus::Idle;
                w.current_task_id = None;
                w.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Mock implementation of StagingOperationRepository for testing
#[derive(Debug, Clone, Default)]
pub struct MockStagingOperationRepository {
    operations: Arc<Mutex<HashMap<String, StagingOperation>>>,
}

impl MockStagingOperationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, op: StagingOperation) {
        self.operations.lock().unwrap().insert(op.id.clone(), op);
    }

    pub fn len(&self) -> usize {
        self.operations.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn select<P: Fn(&StagingOperation) -> bool>(&self, predicate: P) -> Vec<StagingOperation> {
        let mut ops: Vec<StagingOperation> = self
            .operations
            .lock()
            .unwrap()
            .values()
            .filter(|op| predicate(op))
            .cloned()
            .collect();
        ops.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        ops
    }
}

#[async_trait]
impl StagingOperationRepository for MockStagingOperationRepository {
    async fn create(&self, op: &StagingOperation) -> SchedulerResult<()> {
        self.put(op.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> SchedulerResult<Option<StagingOperation>> {
        Ok(self.operations.lock().unwrap().get(id).cloned())
    }

    async fn list_by_task(&self, task_id: &str) -> SchedulerResult<Vec<StagingOperation>> {
        Ok(self.select(|op| op.task_id == task_id))
    }

    async fn list_by_status(&self, status: StagingStatus) -> SchedulerResult<Vec<StagingOperation>> {
        Ok(self.select(|op| op.status == status))
    }

    async fn list_incomplete(&self) -> SchedulerResult<Vec<StagingOperation>> {
        Ok(self.select(|op| op.is_incomplete()))
    }

    async fn update_if_status(
        &self,
        op: &StagingOperation,
        expected: StagingStatus,
    ) -> SchedulerResult<bool> {
        let mut ops = self.operations.lock().unwrap();
        match ops.get_mut(&op.id) {
            Some(stored) if stored.status == expected => {
                *stored = op.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: &str) -> SchedulerResult<bool> {
        Ok(self.operations.lock().unwrap().remove(id).is_some())
    }
}

/// Mock implementation of SchedulerStateRepository for testing
#[derive(Debug, Clone, Default)]
pub struct MockSchedulerStateRepository {
    state: Arc<Mutex<Option<SchedulerState>>>,
}

impl MockSchedulerStateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: SchedulerState) -> Self {
        let repo = Self::new();
        *repo.state.lock().unwrap() = Some(state);
        repo
    }

    pub fn current(&self) -> Option<SchedulerState> {
        self.state.lock().unwrap().clone()
    }
}

#[async_trait]
impl SchedulerStateRepository for MockSchedulerStateRepository {
    async fn get(&self) -> SchedulerResult<Option<SchedulerState>> {
        Ok(self.current())
    }

    async fn upsert(&self, state: &SchedulerState) -> SchedulerResult<()> {
        *self.state.lock().unwrap() = Some(state.clone());
        Ok(())
    }

    async fn update_heartbeat(&self, instance_id: &str, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let mut state = self.state.lock().unwrap();
        match state.as_mut() {
            Some(s) if s.instance_id == instance_id => {
                s.last_heartbeat = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_clean_shutdown(&self, instance_id: &str, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let mut state = self.state.lock().unwrap();
        match state.as_mut() {
            Some(s) if s.instance_id == instance_id => {
                s.status = SchedulerStatus::Stopped;
                s.clean_shutdown = true;
                s.last_heartbeat = now;
                s.shutdown_time = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// 可编排结果的传输轮询器。未编排的源路径直接报告完成。
#[derive(Debug, Default)]
pub struct MockTransferPoller {
    scripts: Mutex<HashMap<String, VecDeque<Result<TransferProgress, AdapterError>>>>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MockTransferPoller {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次轮询前等待，模拟慢速传输
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn script(
        &self,
        source_path: &str,
        results: Vec<Result<TransferProgress, AdapterError>>,
    ) {
        self.scripts
            .lock()
            .unwrap()
            .insert(source_path.to_string(), results.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, source_path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.as_str() == source_path)
            .count()
    }
}

#[async_trait]
impl TransferPoller for MockTransferPoller {
    async fn poll(&self, op: &StagingOperation) -> Result<TransferProgress, AdapterError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().unwrap().push(op.source_path.clone());

        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&op.source_path)
            .and_then(|queue| queue.pop_front());
        next.unwrap_or(Ok(TransferProgress::Done {
            transferred: op.total_size.max(0) as u64,
        }))
    }
}

/// 以 (resource_id, user_id) 为键的简易凭据库
#[derive(Debug, Default)]
pub struct InMemoryCredentialVault {
    entries: Mutex<HashMap<(String, String), (Credential, Vec<u8>)>>,
}

impl InMemoryCredentialVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, resource_id: &str, user_id: &str, name: &str, secret: &[u8]) {
        let credential = Credential {
            id: format!("cred-{resource_id}-{user_id}"),
            name: name.to_string(),
            kind: CredentialKind::Password,
            owner_user_id: user_id.to_string(),
        };
        self.entries.lock().unwrap().insert(
            (resource_id.to_string(), user_id.to_string()),
            (credential, secret.to_vec()),
        );
    }
}

#[async_trait]
impl CredentialVault for InMemoryCredentialVault {
    async fn get_usable_credential_for_resource(
        &self,
        resource_id: &str,
        _resource_type: ResourceType,
        user_id: &str,
        _context: &AccessContext,
    ) -> SchedulerResult<(Credential, SecretBytes)> {
        self.entries
            .lock()
            .unwrap()
            .get(&(resource_id.to_string(), user_id.to_string()))
            .map(|(credential, secret)| (credential.clone(), SecretBytes(secret.clone())))
            .ok_or_else(|| {
                SchedulerError::Permission(format!(
                    "user {user_id} has no usable credential for {resource_id}"
                ))
            })
    }
}
