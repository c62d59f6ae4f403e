use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, warn};

use scheduler_config::DispatcherConfig;
use scheduler_domain::entities::{
    ResourcePath, StagingDirection, StagingOperation, StagingStatus, Task,
    TaskStatus, Worker,
};
use scheduler_domain::messaging::{
    SchedulerMessage, TaskAssignment, TaskResultReport, TaskStatusUpdate, WorkerMessage,
};
use scheduler_domain::repositories::TaskRepository;
use scheduler_errors::{FailureClass, FailureReason, SchedulerError, SchedulerResult};
use scheduler_infrastructure::EngineMetrics;

use crate::staging_tracker::StagingTracker;
use crate::worker_channels::WorkerChannels;
use crate::worker_pool::WorkerPool;

/// 任务元数据中记录本轮输入暂存操作ID的键
pub const INPUT_STAGING_KEY: &str = "input_staging_ops";
/// 任务元数据中记录本轮输出暂存操作ID的键
pub const OUTPUT_STAGING_KEY: &str = "output_staging_ops";

/// 实验的聚合状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    Pending,
    Running,
    Completed,
    /// 至少有一个任务最终失败
    Degraded,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub experiment_id: String,
    pub total: usize,
    pub counts: HashMap<TaskStatus, usize>,
    pub status: ExperimentStatus,
}

impl ExperimentSummary {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or_default()
    }

    fn from_tasks(experiment_id: &str, tasks: &[Task]) -> Self {
        let mut counts: HashMap<TaskStatus, usize> = HashMap::new();
        for task in tasks {
            *counts.entry(task.status).or_default() += 1;
        }

        let total = tasks.len();
        let all_terminal = tasks.iter().all(Task::is_terminal);
        let status = if total == 0 {
            ExperimentStatus::Pending
        } else if tasks.iter().any(|t| t.status == TaskStatus::Failed) {
            ExperimentStatus::Degraded
        } else if tasks.iter().all(|t| t.status == TaskStatus::Completed) {
            ExperimentStatus::Completed
        } else if all_terminal {
            ExperimentStatus::Canceled
        } else if tasks.iter().any(|t| t.status.is_active() || t.is_terminal()) {
            ExperimentStatus::Running
        } else {
            ExperimentStatus::Pending
        };

        Self {
            experiment_id: experiment_id.to_string(),
            total,
            counts,
            status,
        }
    }
}

/// 一轮调度循环的结果
#[derive(Debug, Clone, Default)]
pub struct DispatchCycleReport {
    pub assigned: usize,
    pub no_capacity: usize,
    pub advanced: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// 任务调度服务接口
#[async_trait]
pub trait TaskDispatchService: Send + Sync {
    /// 接收新任务并排队
    async fn enqueue(&self, task: Task) -> SchedulerResult<Task>;

    /// 从候选Worker中占用一个并开始输入暂存
    async fn assign_to_worker(&self, task_id: &str, candidates: &[Worker]) -> SchedulerResult<Worker>;

    /// 记录执行过程中的状态事件
    async fn record_execution_event(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> SchedulerResult<Task>;

    /// 按失败类别决定重试或终止
    async fn handle_failure(
        &self,
        task_id: &str,
        reason: FailureReason,
        worker_reachable: bool,
    ) -> SchedulerResult<Task>;

    /// 强制取消，不等待远端确认
    async fn cancel(&self, task_id: &str, reason: &str) -> SchedulerResult<Task>;

    async fn cancel_experiment(&self, experiment_id: &str, reason: &str) -> SchedulerResult<usize>;

    async fn experiment_summary(&self, experiment_id: &str) -> SchedulerResult<ExperimentSummary>;

    async fn get_task(&self, task_id: &str) -> SchedulerResult<Option<Task>>;

    async fn list_tasks_by_experiment(&self, experiment_id: &str) -> SchedulerResult<Vec<Task>>;

    async fn list_tasks_by_status(&self, status: TaskStatus) -> SchedulerResult<Vec<Task>>;

    /// Worker仍持有的执行中任务
    async fn active_tasks_for_worker(&self, worker_id: &str) -> SchedulerResult<Vec<Task>>;
}

enum FailureOutcome {
    Failed,
    Requeued { charged: bool },
}

/// 任务调度器
///
/// 任务行的每次修改都走版本号比较写入，冲突时重读重试，
/// Worker行的修改交给 `WorkerPool` 在每个Worker的锁内完成。
pub struct TaskDispatcher {
    task_repo: Arc<dyn TaskRepository>,
    pool: Arc<WorkerPool>,
    tracker: Arc<StagingTracker>,
    channels: WorkerChannels,
    config: DispatcherConfig,
    wake: Arc<Notify>,
    running: Arc<RwLock<bool>>,
}

impl TaskDispatcher {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        pool: Arc<WorkerPool>,
        tracker: Arc<StagingTracker>,
        channels: WorkerChannels,
        config: Option<DispatcherConfig>,
    ) -> Self {
        let wake = tracker.progress_notifier();
        Self {
            task_repo,
            pool,
            tracker,
            channels,
            config: config.unwrap_or_default(),
            wake,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn channels(&self) -> &WorkerChannels {
        &self.channels
    }

    /// 唤醒调度循环
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    async fn load_task(&self, task_id: &str) -> SchedulerResult<Task> {
        self.task_repo
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| SchedulerError::task_not_found(task_id))
    }

    /// 读-改-写任务，版本冲突时重试
    ///
    /// `mutate` 返回 `false` 表示无需修改，此时返回库中的当前值。
    async fn update_task<F>(&self, task_id: &str, mut mutate: F) -> SchedulerResult<(Task, bool)>
    where
        F: FnMut(&mut Task) -> SchedulerResult<bool> + Send,
    {
        let attempts = self.config.max_cas_retries.max(1);
        for attempt in 1..=attempts {
            let current = self.load_task(task_id).await?;
            let mut next = current.clone();
            if !mutate(&mut next)? {
                return Ok((current, false));
            }
            if self.task_repo.update_versioned(&next).await? {
                next.version += 1;
                return Ok((next, true));
            }
            debug!("任务 {} 版本冲突，第 {} 次重试", task_id, attempt);
            tokio::task::yield_now().await;
        }
        Err(SchedulerError::concurrent_modification("task", task_id))
    }

    fn staging_op_ids(task: &Task, key: &str) -> Vec<String> {
        task.metadata
            .get(key)
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| id.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn staging_ops(&self, task: &Task, key: &str) -> SchedulerResult<Vec<Option<StagingOperation>>> {
        let mut ops = Vec::new();
        for id in Self::staging_op_ids(task, key) {
            ops.push(self.tracker.get_operation(&id).await?);
        }
        Ok(ops)
    }

    fn task_work_dir(&self, task_id: &str) -> String {
        format!("{}/{}", self.config.work_dir_base.trim_end_matches('/'), task_id)
    }

    async fn create_input_operations(
        &self,
        task: &Task,
        worker: &Worker,
        work_dir: &str,
    ) -> SchedulerResult<Vec<String>> {
        let mut op_ids = Vec::with_capacity(task.input_files.len());
        for file in &task.input_files {
            let destination = ResourcePath::join(
                &worker.compute_resource_id,
                &format!("{work_dir}/{}", file.file_name()),
            );
            let id = self
                .tracker
                .create_staging_operation(
                    &task.id,
                    &worker.id,
                    &worker.compute_resource_id,
                    StagingDirection::Input,
                    &file.path,
                    &destination,
                    file.size,
                    file.checksum.as_deref(),
                    None,
                )
                .await?;
            op_ids.push(id);
        }
        Ok(op_ids)
    }

    /// 已占用Worker后，创建输入暂存并把任务推进到 DataStaging
    async fn begin_staging(&self, task: &Task, worker: &Worker) -> SchedulerResult<(Task, Vec<String>)> {
        let work_dir = self.task_work_dir(&task.id);
        let op_ids = self.create_input_operations(task, worker, &work_dir).await?;
        let ids_value = Value::from(op_ids.clone());

        let (task, _) = self
            .update_task(&task.id, |t| {
                if t.status != TaskStatus::Queued || t.worker_id.is_some() {
                    return Err(SchedulerError::invalid_transition(
                        &t.id,
                        t.status.as_str(),
                        TaskStatus::DataStaging.as_str(),
                    ));
                }
                t.worker_id = Some(worker.id.clone());
                t.compute_resource_id = Some(worker.compute_resource_id.clone());
                t.set_work_dir(work_dir.clone());
                t.metadata.insert(INPUT_STAGING_KEY.to_string(), ids_value.clone());
                t.metadata.remove(OUTPUT_STAGING_KEY);
                t.transition_to(TaskStatus::DataStaging)?;
                Ok(true)
            })
            .await?;
        Ok((task, op_ids))
    }

    fn assignment_for(task: &Task) -> TaskAssignment {
        TaskAssignment {
            task_id: task.id.clone(),
            experiment_id: task.experiment_id.clone(),
            command: task.command.clone(),
            work_dir: task.work_dir().unwrap_or_default().to_string(),
            input_files: task.input_files.clone(),
            output_files: task.output_files.clone(),
            metadata: task.metadata.clone(),
        }
    }

    fn send_assignment(&self, task: &Task) -> bool {
        let Some(worker_id) = task.worker_id.as_deref() else {
            return false;
        };
        let delivered = self
            .channels
            .send(worker_id, SchedulerMessage::TaskAssignment(Self::assignment_for(task)));
        if delivered {
            info!("任务 {} 已下发给Worker {}", task.id, worker_id);
        } else {
            warn!("任务 {} 暂未能下发给Worker {}，等待其请求任务时重发", task.id, worker_id);
        }
        delivered
    }

    fn first_failure(ops: &[Option<StagingOperation>]) -> Option<String> {
        ops.iter().find_map(|op| match op {
            None => Some("暂存记录丢失".to_string()),
            Some(op) if op.status == StagingStatus::Failed => Some(format!(
                "{} -> {}: {}",
                op.source_path,
                op.destination_path,
                op.error_message.as_deref().unwrap_or("unknown")
            )),
            Some(_) => None,
        })
    }

    fn all_completed(ops: &[Option<StagingOperation>]) -> bool {
        ops.iter()
            .all(|op| op.as_ref().is_some_and(|op| op.status == StagingStatus::Completed))
    }

    /// 输入暂存全部完成后进入 EnvSetup 并下发任务
    async fn advance_input_staging(&self, task: &Task) -> SchedulerResult<bool> {
        let ops = self.staging_ops(task, INPUT_STAGING_KEY).await?;

        if let Some(message) = Self::first_failure(&ops) {
            self.handle_failure(&task.id, FailureReason::transient(format!("输入暂存失败: {message}")), true)
                .await?;
            return Ok(true);
        }
        if !Self::all_completed(&ops) {
            return Ok(false);
        }

        let (task, applied) = self
            .update_task(&task.id, |t| {
                if t.status != TaskStatus::DataStaging {
                    return Ok(false);
                }
                t.transition_to(TaskStatus::EnvSetup)?;
                Ok(true)
            })
            .await?;
        if applied {
            debug!("任务 {} 输入暂存完成", task.id);
            self.send_assignment(&task);
        }
        Ok(applied)
    }

    /// 输出暂存全部完成后结束任务
    async fn advance_output_staging(&self, task: &Task) -> SchedulerResult<bool> {
        let ops = self.staging_ops(task, OUTPUT_STAGING_KEY).await?;

        if let Some(message) = Self::first_failure(&ops) {
            self.handle_failure(&task.id, FailureReason::transient(format!("输出暂存失败: {message}")), true)
                .await?;
            return Ok(true);
        }
        if !Self::all_completed(&ops) {
            return Ok(false);
        }

        let mut worker_id = None;
        let (task, applied) = self
            .update_task(&task.id, |t| {
                if t.status != TaskStatus::OutputStaging {
                    return Ok(false);
                }
                worker_id = t.worker_id.clone();
                t.transition_to(TaskStatus::Completed)?;
                Ok(true)
            })
            .await?;
        if applied {
            self.after_completion(&task, worker_id.as_deref()).await;
        }
        Ok(applied)
    }

    async fn after_completion(&self, task: &Task, worker_id: Option<&str>) {
        if let Some(worker_id) = worker_id {
            if let Err(e) = self.pool.release(worker_id, &task.id).await {
                error!("释放Worker {} 失败: {}", worker_id, e);
            }
        }
        EngineMetrics::task_finished("completed");
        info!("任务 {} 执行完成", task.id);
        self.wake();
    }

    async fn start_output_staging(&self, task_id: &str) -> SchedulerResult<Task> {
        let task = self.load_task(task_id).await?;
        if task.is_terminal() {
            return Ok(task);
        }
        if task.status != TaskStatus::Running {
            return Err(SchedulerError::invalid_transition(
                task_id,
                task.status.as_str(),
                TaskStatus::OutputStaging.as_str(),
            ));
        }

        let (worker_id, compute_id) = match (&task.worker_id, &task.compute_resource_id) {
            (Some(worker), Some(compute)) => (worker.clone(), compute.clone()),
            _ => {
                return Err(SchedulerError::Internal(format!(
                    "任务 {task_id} 处于运行状态但没有Worker"
                )))
            }
        };
        let work_dir = task
            .work_dir()
            .map(str::to_string)
            .unwrap_or_else(|| self.task_work_dir(task_id));

        let mut op_ids = Vec::with_capacity(task.output_files.len());
        for file in &task.output_files {
            let source = ResourcePath::join(&compute_id, &format!("{work_dir}/{}", file.file_name()));
            let created = self
                .tracker
                .create_staging_operation(
                    task_id,
                    &worker_id,
                    &compute_id,
                    StagingDirection::Output,
                    &source,
                    &file.path,
                    file.size,
                    file.checksum.as_deref(),
                    None,
                )
                .await;
            match created {
                Ok(id) => op_ids.push(id),
                Err(e) => {
                    self.abandon_staging(task_id, "创建输出暂存失败").await;
                    return Err(e);
                }
            }
        }

        let ids_value = Value::from(op_ids.clone());
        let result = self
            .update_task(task_id, |t| {
                if t.status != TaskStatus::Running {
                    return Err(SchedulerError::invalid_transition(
                        &t.id,
                        t.status.as_str(),
                        TaskStatus::OutputStaging.as_str(),
                    ));
                }
                t.transition_to(TaskStatus::OutputStaging)?;
                t.metadata.insert(OUTPUT_STAGING_KEY.to_string(), ids_value.clone());
                Ok(true)
            })
            .await;

        match result {
            Ok((task, _)) => {
                for id in &op_ids {
                    self.tracker.spawn_monitor(id);
                }
                debug!("任务 {} 开始输出暂存 ({} 个文件)", task_id, op_ids.len());
                self.wake();
                Ok(task)
            }
            Err(e) => {
                self.abandon_staging(task_id, "输出暂存未能开始").await;
                Err(e)
            }
        }
    }

    /// 外部事件要求离开暂存状态时，只有本轮暂存操作全部完成才放行
    async fn leave_staging(&self, task: &Task, key: &str, next: TaskStatus) -> SchedulerResult<Task> {
        let ops = self.staging_ops(task, key).await?;
        if !Self::all_completed(&ops) {
            debug!("任务 {} 仍有未完成的暂存操作，拒绝进入 {}", task.id, next);
            return Err(SchedulerError::invalid_transition(
                &task.id,
                task.status.as_str(),
                next.as_str(),
            ));
        }
        if key == INPUT_STAGING_KEY {
            self.advance_input_staging(task).await?;
        } else {
            self.advance_output_staging(task).await?;
        }
        self.load_task(&task.id).await
    }

    async fn complete_task(&self, task_id: &str) -> SchedulerResult<Task> {
        let current = self.load_task(task_id).await?;
        if current.status == TaskStatus::OutputStaging {
            return self
                .leave_staging(&current, OUTPUT_STAGING_KEY, TaskStatus::Completed)
                .await;
        }

        let mut worker_id = None;
        let (task, applied) = self
            .update_task(task_id, |t| {
                if t.is_terminal() {
                    return Ok(false);
                }
                let outputs_pending = t.status == TaskStatus::Running && !t.output_files.is_empty();
                if outputs_pending || t.status == TaskStatus::OutputStaging {
                    // 有输出文件时必须经过输出暂存并等待其完成
                    return Err(SchedulerError::invalid_transition(
                        &t.id,
                        t.status.as_str(),
                        TaskStatus::Completed.as_str(),
                    ));
                }
                worker_id = t.worker_id.clone();
                t.transition_to(TaskStatus::Completed)?;
                Ok(true)
            })
            .await?;
        if applied {
            self.after_completion(&task, worker_id.as_deref()).await;
        }
        Ok(task)
    }

    async fn abandon_staging(&self, task_id: &str, reason: &str) {
        if let Err(e) = self.tracker.abandon_for_task(task_id, reason).await {
            error!("放弃任务 {} 的暂存操作失败: {}", task_id, e);
        }
    }

    /// 处理Worker上报的任务状态与结果
    ///
    /// 只接受当前持有该任务的Worker的上报，其余一律丢弃。
    pub async fn handle_worker_message(&self, message: &WorkerMessage) -> SchedulerResult<()> {
        match message {
            WorkerMessage::TaskStatus(update) => self.handle_status_update(update).await,
            WorkerMessage::TaskResult(report) => self.handle_task_result(report).await,
            other => {
                debug!("调度器忽略消息 {}", other.kind());
                Ok(())
            }
        }
    }

    async fn owned_task(&self, task_id: &str, worker_id: &str) -> SchedulerResult<Option<Task>> {
        let task = self.load_task(task_id).await?;
        if task.worker_id.as_deref() != Some(worker_id) {
            debug!(
                "丢弃Worker {} 关于任务 {} 的上报 (当前状态 {}, 持有者 {:?})",
                worker_id, task_id, task.status, task.worker_id
            );
            return Ok(None);
        }
        Ok(Some(task))
    }

    async fn handle_status_update(&self, update: &TaskStatusUpdate) -> SchedulerResult<()> {
        let Some(task) = self.owned_task(&update.task_id, &update.worker_id).await? else {
            return Ok(());
        };
        if task.status == update.status {
            return Ok(());
        }
        self.record_execution_event(&update.task_id, update.status, update.message.clone())
            .await?;
        Ok(())
    }

    async fn handle_task_result(&self, report: &TaskResultReport) -> SchedulerResult<()> {
        let Some(task) = self.owned_task(&report.task_id, &report.worker_id).await? else {
            return Ok(());
        };

        if !report.success {
            let class = report.failure_class.unwrap_or(FailureClass::Execution);
            let message = match (&report.error, report.exit_code) {
                (Some(error), Some(code)) if !error.trim().is_empty() => {
                    format!("退出码 {code}: {}", error.trim())
                }
                (Some(error), None) if !error.trim().is_empty() => error.trim().to_string(),
                (_, Some(code)) => format!("退出码 {code}"),
                _ => "任务执行失败".to_string(),
            };
            self.handle_failure(&report.task_id, FailureReason::new(class, message), true)
                .await?;
            return Ok(());
        }

        if task.status == TaskStatus::OutputStaging {
            debug!("任务 {} 已在输出暂存，忽略重复的结果上报", task.id);
            return Ok(());
        }
        if task.status == TaskStatus::EnvSetup {
            self.record_execution_event(&report.task_id, TaskStatus::Running, None)
                .await?;
        }
        let next = if task.output_files.is_empty() {
            TaskStatus::Completed
        } else {
            TaskStatus::OutputStaging
        };
        info!(
            "Worker {} 报告任务 {} 执行成功，耗时 {} ms",
            report.worker_id, report.task_id, report.duration_ms
        );
        self.record_execution_event(&report.task_id, next, None).await?;
        Ok(())
    }

    /// Worker空闲时请求任务：若它已持有待执行的任务则重发，否则唤醒调度循环
    pub async fn handle_task_request(&self, worker_id: &str) -> SchedulerResult<()> {
        let held = match self.pool.get_worker(worker_id).await? {
            Some(worker) => worker.current_task_id,
            None => return Err(SchedulerError::worker_not_found(worker_id)),
        };

        if let Some(task_id) = held {
            if let Some(task) = self.task_repo.get_by_id(&task_id).await? {
                if task.status == TaskStatus::EnvSetup
                    && task.worker_id.as_deref() == Some(worker_id)
                {
                    self.send_assignment(&task);
                    return Ok(());
                }
            }
        }
        self.wake();
        Ok(())
    }

    /// 执行一轮调度：先推进暂存中的任务，再为排队任务分配Worker
    pub async fn run_dispatch_cycle(&self) -> SchedulerResult<DispatchCycleReport> {
        let mut report = DispatchCycleReport::default();

        for task in self.task_repo.list_by_status(TaskStatus::DataStaging).await? {
            match self.advance_input_staging(&task).await {
                Ok(true) => report.advanced += 1,
                Ok(false) => {}
                Err(e) => report.errors.push(format!("推进任务 {} 失败: {}", task.id, e)),
            }
        }
        for task in self.task_repo.list_by_status(TaskStatus::OutputStaging).await? {
            match self.advance_output_staging(&task).await {
                Ok(true) => report.advanced += 1,
                Ok(false) => {}
                Err(e) => report.errors.push(format!("推进任务 {} 失败: {}", task.id, e)),
            }
        }

        let queued = self
            .task_repo
            .list_queued_unassigned(self.config.max_dispatch_batch)
            .await?;
        let mut candidates: HashMap<String, Vec<Worker>> = HashMap::new();

        for task in queued {
            if !candidates.contains_key(&task.experiment_id) {
                let usable = self.pool.usable_candidates(&task.experiment_id).await?;
                candidates.insert(task.experiment_id.clone(), usable);
            }
            let Some(workers) = candidates.get_mut(&task.experiment_id) else {
                continue;
            };
            if workers.is_empty() {
                report.no_capacity += 1;
                continue;
            }

            match self.assign_to_worker(&task.id, workers).await {
                Ok(worker) => {
                    workers.retain(|w| w.id != worker.id);
                    report.assigned += 1;
                }
                Err(SchedulerError::NoCapacity { .. }) => report.no_capacity += 1,
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(format!("分配任务 {} 失败: {}", task.id, e));
                }
            }
        }

        if report.assigned > 0 || report.advanced > 0 {
            debug!(
                "调度循环: 分配 {} 个，推进 {} 个，无可用Worker {} 个",
                report.assigned, report.advanced, report.no_capacity
            );
        }
        Ok(report)
    }

    /// 启动调度循环，直到 `stop` 被调用
    pub async fn start(&self) -> SchedulerResult<()> {
        info!("启动任务调度循环");
        {
            let mut running = self.running.write().await;
            *running = true;
        }

        let interval = Duration::from_millis(self.config.dispatch_interval_ms.max(1));
        loop {
            if !*self.running.read().await {
                info!("收到停止信号，退出任务调度循环");
                break;
            }

            match self.run_dispatch_cycle().await {
                Ok(report) => {
                    for err in &report.errors {
                        warn!("{}", err);
                    }
                }
                Err(e) => error!("调度循环出错: {}", e),
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
        Ok(())
    }

    pub async fn stop(&self) {
        info!("停止任务调度循环");
        let mut running = self.running.write().await;
        *running = false;
        self.wake();
    }

    /// 交还Worker手上的任务并把它标记为断开，任务重新排队且不计入重试
    ///
    /// 用于调度器自身停止或重启本地Worker，这类中断不是任务或Worker的过错。
    pub async fn release_worker(&self, worker_id: &str, reason: &str) -> SchedulerResult<usize> {
        let mut requeued = 0;
        for task in self.active_tasks_for_worker(worker_id).await? {
            let task = self
                .handle_failure(&task.id, FailureReason::scheduler_caused(reason), true)
                .await?;
            if task.status == TaskStatus::Queued {
                requeued += 1;
            }
        }
        if let Some(task_id) = self.pool.disconnect(worker_id).await? {
            debug!("Worker {} 断开时仍记录着任务 {}", worker_id, task_id);
        }
        Ok(requeued)
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

#[async_trait]
impl TaskDispatchService for TaskDispatcher {
    async fn enqueue(&self, task: Task) -> SchedulerResult<Task> {
        if task.id.trim().is_empty() || task.experiment_id.trim().is_empty() {
            return Err(SchedulerError::validation_error("任务ID和实验ID不能为空"));
        }
        if task.command.trim().is_empty() {
            return Err(SchedulerError::validation_error(format!(
                "任务 {} 的命令不能为空",
                task.id
            )));
        }
        if task.status != TaskStatus::Created {
            if let Some(existing) = self.task_repo.get_by_id(&task.id).await? {
                return Ok(existing);
            }
            return Err(SchedulerError::invalid_transition(
                &task.id,
                task.status.as_str(),
                TaskStatus::Queued.as_str(),
            ));
        }

        let mut queued = task;
        queued.transition_to(TaskStatus::Queued)?;
        queued.version = 0;
        if self.task_repo.insert_if_absent(&queued).await? {
            EngineMetrics::task_enqueued();
            debug!("任务 {} 已进入队列 (实验 {})", queued.id, queued.experiment_id);
            self.wake();
            return Ok(queued);
        }

        // 已存在：只把仍停留在 Created 的记录推进，其余原样返回
        let (existing, applied) = self
            .update_task(&queued.id, |t| {
                if t.status != TaskStatus::Created {
                    return Ok(false);
                }
                t.transition_to(TaskStatus::Queued)?;
                Ok(true)
            })
            .await?;
        if applied {
            EngineMetrics::task_enqueued();
            self.wake();
        }
        Ok(existing)
    }

    async fn assign_to_worker(&self, task_id: &str, candidates: &[Worker]) -> SchedulerResult<Worker> {
        let task = self.load_task(task_id).await?;
        if task.status != TaskStatus::Queued || task.worker_id.is_some() {
            return Err(SchedulerError::invalid_transition(
                task_id,
                task.status.as_str(),
                TaskStatus::DataStaging.as_str(),
            ));
        }

        let mut eligible: Vec<&Worker> = candidates
            .iter()
            .filter(|w| {
                w.is_usable()
                    && w.experiment_id == task.experiment_id
                    && w.can_run(&task.requirements)
            })
            .collect();
        eligible.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut claimed = None;
        for worker in eligible {
            if self.pool.try_claim(&worker.id, task_id).await? {
                claimed = Some(worker.clone());
                break;
            }
        }
        let Some(worker) = claimed else {
            return Err(SchedulerError::NoCapacity {
                task_id: task_id.to_string(),
            });
        };

        match self.begin_staging(&task, &worker).await {
            Ok((task, op_ids)) => {
                for id in &op_ids {
                    self.tracker.spawn_monitor(id);
                }
                EngineMetrics::task_assigned();
                info!(
                    "任务 {} 分配给Worker {}，开始暂存 {} 个输入文件",
                    task.id,
                    worker.id,
                    op_ids.len()
                );
                if op_ids.is_empty() {
                    self.wake();
                }
                Ok(worker)
            }
            Err(e) => {
                // 回滚占用
                if let Err(release_err) = self.pool.release(&worker.id, task_id).await {
                    error!("回滚Worker {} 占用失败: {}", worker.id, release_err);
                }
                self.abandon_staging(task_id, "任务分配未完成").await;
                Err(e)
            }
        }
    }

    async fn record_execution_event(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> SchedulerResult<Task> {
        let task = self.load_task(task_id).await?;
        if task.is_terminal() {
            debug!("任务 {} 已处于终态 {}，丢弃事件 {}", task_id, task.status, status);
            return Ok(task);
        }

        match status {
            TaskStatus::Failed => {
                let message = error.unwrap_or_else(|| "任务执行失败".to_string());
                self.handle_failure(task_id, FailureReason::execution(message), true)
                    .await
            }
            TaskStatus::Canceled => {
                let reason = error.unwrap_or_else(|| "Worker报告任务已取消".to_string());
                self.cancel(task_id, &reason).await
            }
            TaskStatus::EnvSetup if task.status == TaskStatus::DataStaging => {
                self.leave_staging(&task, INPUT_STAGING_KEY, TaskStatus::EnvSetup).await
            }
            TaskStatus::OutputStaging => self.start_output_staging(task_id).await,
            TaskStatus::Completed => self.complete_task(task_id).await,
            TaskStatus::Created | TaskStatus::Queued => Err(SchedulerError::invalid_transition(
                task_id,
                task.status.as_str(),
                status.as_str(),
            )),
            _ => {
                let (task, applied) = self
                    .update_task(task_id, |t| {
                        if t.is_terminal() {
                            return Ok(false);
                        }
                        t.transition_to(status)?;
                        Ok(true)
                    })
                    .await?;
                if applied {
                    debug!("任务 {} 进入 {}", task_id, status);
                }
                Ok(task)
            }
        }
    }

    async fn handle_failure(
        &self,
        task_id: &str,
        reason: FailureReason,
        worker_reachable: bool,
    ) -> SchedulerResult<Task> {
        let description = reason.describe();
        let mut previous_worker = None;
        let mut outcome = FailureOutcome::Failed;

        let (task, applied) = self
            .update_task(task_id, |t| {
                if t.is_terminal() {
                    return Ok(false);
                }
                previous_worker = t.worker_id.clone();
                t.error = Some(description.clone());

                if reason.class.is_permanent() {
                    t.transition_to(TaskStatus::Failed)?;
                    outcome = FailureOutcome::Failed;
                } else if !reason.class.charges_retry() {
                    t.requeue(false)?;
                    outcome = FailureOutcome::Requeued { charged: false };
                } else if t.retries_exhausted() {
                    t.transition_to(TaskStatus::Failed)?;
                    outcome = FailureOutcome::Failed;
                } else {
                    t.requeue(true)?;
                    outcome = FailureOutcome::Requeued { charged: true };
                }
                Ok(true)
            })
            .await?;

        if !applied {
            debug!("任务 {} 已处于终态，忽略失败: {}", task_id, description);
            return Ok(task);
        }

        self.abandon_staging(task_id, &description).await;
        if worker_reachable {
            if let Some(worker_id) = previous_worker.as_deref() {
                if let Err(e) = self.pool.release(worker_id, task_id).await {
                    error!("释放Worker {} 失败: {}", worker_id, e);
                }
            }
        }

        EngineMetrics::task_failure(reason.class.as_str());
        match outcome {
            FailureOutcome::Failed => {
                EngineMetrics::task_finished("failed");
                warn!(
                    "任务 {} 最终失败 (重试 {}/{}): {}",
                    task_id, task.retry_count, task.max_retries, description
                );
            }
            FailureOutcome::Requeued { charged } => {
                EngineMetrics::task_requeued(charged);
                info!(
                    "任务 {} 重新排队 (重试 {}/{}): {}",
                    task_id, task.retry_count, task.max_retries, description
                );
            }
        }
        self.wake();
        Ok(task)
    }

    async fn cancel(&self, task_id: &str, reason: &str) -> SchedulerResult<Task> {
        let mut previous_worker = None;
        let (task, applied) = self
            .update_task(task_id, |t| {
                if t.is_terminal() {
                    return Ok(false);
                }
                previous_worker = t.worker_id.clone();
                t.metadata
                    .insert("cancel_reason".to_string(), Value::String(reason.to_string()));
                t.transition_to(TaskStatus::Canceled)?;
                Ok(true)
            })
            .await?;

        if !applied {
            return Ok(task);
        }

        self.abandon_staging(task_id, "任务已取消").await;
        if let Some(worker_id) = previous_worker.as_deref() {
            if let Err(e) = self.pool.release(worker_id, task_id).await {
                error!("释放Worker {} 失败: {}", worker_id, e);
            }
            self.channels.deliver_detached(
                worker_id,
                SchedulerMessage::CancelTask {
                    task_id: task_id.to_string(),
                    reason: reason.to_string(),
                },
                Duration::from_secs(self.config.cancel_timeout_seconds),
            );
        }

        EngineMetrics::task_finished("canceled");
        info!("任务 {} 已取消: {}", task_id, reason);
        self.wake();
        Ok(task)
    }

    async fn cancel_experiment(&self, experiment_id: &str, reason: &str) -> SchedulerResult<usize> {
        let mut canceled = 0;
        for task in self.task_repo.list_by_experiment(experiment_id).await? {
            if task.is_terminal() {
                continue;
            }
            match self.cancel(&task.id, reason).await {
                Ok(task) if task.status == TaskStatus::Canceled => canceled += 1,
                Ok(_) => {}
                Err(e) => error!("取消任务 {} 失败: {}", task.id, e),
            }
        }
        info!("实验 {} 取消了 {} 个任务", experiment_id, canceled);
        Ok(canceled)
    }

    async fn experiment_summary(&self, experiment_id: &str) -> SchedulerResult<ExperimentSummary> {
        let tasks = self.task_repo.list_by_experiment(experiment_id).await?;
        Ok(ExperimentSummary::from_tasks(experiment_id, &tasks))
    }

    async fn get_task(&self, task_id: &str) -> SchedulerResult<Option<Task>> {
        self.task_repo.get_by_id(task_id).await
    }

    async fn list_tasks_by_experiment(&self, experiment_id: &str) -> SchedulerResult<Vec<Task>> {
        self.task_repo.list_by_experiment(experiment_id).await
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> SchedulerResult<Vec<Task>> {
        self.task_repo.list_by_status(status).await
    }

    async fn active_tasks_for_worker(&self, worker_id: &str) -> SchedulerResult<Vec<Task>> {
        Ok(self
            .task_repo
            .list_by_worker(worker_id)
            .await?
            .into_iter()
            .filter(Task::looks_assigned)
            .collect())
    }
}
