//! 领域仓储抽象
//!
//! 任务、Worker、暂存操作和调度器状态四张表是唯一的事实来源。
//! 所有条件更新都返回 `bool` 表示是否命中，调用方据此判断并发冲突。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use scheduler_errors::SchedulerResult;

use crate::models::{
    ConnectionState, SchedulerState, StagingOperation, StagingStatus, Task, TaskStatus, Worker,
};

/// 任务仓储抽象
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 主键不存在时插入，返回是否真正插入
    async fn insert_if_absent(&self, task: &Task) -> SchedulerResult<bool>;
    async fn get_by_id(&self, id: &str) -> SchedulerResult<Option<Task>>;
    /// 乐观锁更新：仅当库中版本等于 `task.version` 时写入并把版本加一
    async fn update_versioned(&self, task: &Task) -> SchedulerResult<bool>;
    async fn list_by_status(&self, status: TaskStatus) -> SchedulerResult<Vec<Task>>;
    async fn list_by_experiment(&self, experiment_id: &str) -> SchedulerResult<Vec<Task>>;
    async fn list_by_worker(&self, worker_id: &str) -> SchedulerResult<Vec<Task>>;
    /// 处于执行链路或已分配Worker仍在排队的任务
    async fn list_assigned(&self) -> SchedulerResult<Vec<Task>>;
    /// 未分配Worker的排队任务，按创建时间升序
    async fn list_queued_unassigned(&self, limit: u32) -> SchedulerResult<Vec<Task>>;
    async fn count(&self) -> SchedulerResult<u64>;
    async fn delete_by_experiment(&self, experiment_id: &str) -> SchedulerResult<u64>;
}

/// Worker仓储抽象
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    /// 供给流程预创建Worker行
    async fn create(&self, worker: &Worker) -> SchedulerResult<()>;
    async fn get_by_id(&self, id: &str) -> SchedulerResult<Option<Worker>>;
    /// 按注册时间升序
    async fn list_all(&self) -> SchedulerResult<Vec<Worker>>;
    async fn list_by_experiment(&self, experiment_id: &str) -> SchedulerResult<Vec<Worker>>;
    async fn list_by_connection(&self, state: ConnectionState) -> SchedulerResult<Vec<Worker>>;
    /// 空闲且在线的Worker，按注册时间升序
    async fn list_usable(&self, experiment_id: &str) -> SchedulerResult<Vec<Worker>>;
    async fn update(&self, worker: &Worker) -> SchedulerResult<()>;
    /// 原子占用：仅当 IDLE ∧ CONNECTED ∧ 无任务 时置为 BUSY 并记录任务
    async fn try_claim(
        &self,
        worker_id: &str,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;
    /// 条件释放：仅当Worker仍持有该任务时置回 IDLE
    async fn release(&self, worker_id: &str, task_id: &str, now: DateTime<Utc>)
        -> SchedulerResult<bool>;
}

/// 暂存操作仓储抽象
#[async_trait]
pub trait StagingOperationRepository: Send + Sync {
    async fn create(&self, op: &StagingOperation) -> SchedulerResult<()>;
    async fn get_by_id(&self, id: &str) -> SchedulerResult<Option<StagingOperation>>;
    /// 按创建时间升序
    async fn list_by_task(&self, task_id: &str) -> SchedulerResult<Vec<StagingOperation>>;
    async fn list_by_status(&self, status: StagingStatus) -> SchedulerResult<Vec<StagingOperation>>;
    /// PENDING/RUNNING 的操作，按创建时间升序
    async fn list_incomplete(&self) -> SchedulerResult<Vec<StagingOperation>>;
    /// 仅当库中状态等于 `expected` 时写入，保证状态单调
    async fn update_if_status(
        &self,
        op: &StagingOperation,
        expected: StagingStatus,
    ) -> SchedulerResult<bool>;
    async fn delete(&self, id: &str) -> SchedulerResult<bool>;
}

/// 调度器状态单例仓储
#[async_trait]
pub trait SchedulerStateRepository: Send + Sync {
    async fn get(&self) -> SchedulerResult<Option<SchedulerState>>;
    async fn upsert(&self, state: &SchedulerState) -> SchedulerResult<()>;
    /// 仅刷新属于该实例的心跳，返回是否命中
    async fn update_heartbeat(&self, instance_id: &str, now: DateTime<Utc>)
        -> SchedulerResult<bool>;
    /// 写入 STOPPED + clean_shutdown
    async fn mark_clean_shutdown(&self, instance_id: &str, now: DateTime<Utc>)
        -> SchedulerResult<bool>;
}
