use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::{debug, error, info, warn};

use scheduler_config::RecoveryConfig;
use scheduler_domain::entities::{SchedulerState, StagingOperation, Task};
use scheduler_domain::repositories::TaskRepository;
use scheduler_errors::{SchedulerError, SchedulerResult};
use scheduler_infrastructure::EngineMetrics;

use crate::scheduler_state::SchedulerStateManager;
use crate::staging_tracker::StagingTracker;
use crate::task_dispatcher::{INPUT_STAGING_KEY, OUTPUT_STAGING_KEY};
use crate::worker_pool::WorkerPool;

const MAX_REQUEUE_ATTEMPTS: u32 = 5;
const RECOVERY_ABANDON_REASON: &str = "调度器重启，任务已退回队列";

/// 恢复服务接口
#[async_trait]
pub trait RecoveryService: Send + Sync {
    /// 启动时执行完整恢复流程
    async fn start_recovery(&self) -> SchedulerResult<RecoveryReport>;

    /// 读取上一实例的状态行，判断是否崩溃退出
    async fn detect_crash(&self) -> SchedulerResult<Option<SchedulerState>>;

    /// 把仍处于执行链路中的任务退回队列
    async fn recover_interrupted_tasks(&self) -> SchedulerResult<(Vec<String>, Vec<String>)>;

    /// 断开本实例启动后尚未联系过的Worker
    async fn recover_worker_states(&self) -> SchedulerResult<(Vec<String>, Vec<String>)>;
}

/// 恢复报告
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub crash_detected: bool,
    pub previous_instance: Option<String>,
    pub requeued_tasks: Vec<String>,
    /// 需要继续监控的暂存操作，由调用方交给 `StagingTracker::resume_operations`
    pub incomplete_operations: Vec<StagingOperation>,
    pub disconnected_workers: Vec<String>,
    pub total_tasks_before: u64,
    pub total_tasks_after: u64,
    pub recovery_duration_ms: u64,
    pub errors: Vec<String>,
}

impl RecoveryReport {
    /// 恢复前后任务总数一致
    pub fn tasks_conserved(&self) -> bool {
        self.total_tasks_before == self.total_tasks_after
    }
}

/// 恢复管理器
pub struct RecoveryManager {
    task_repo: Arc<dyn TaskRepository>,
    pool: Arc<WorkerPool>,
    tracker: Arc<StagingTracker>,
    state_manager: Arc<SchedulerStateManager>,
    config: RecoveryConfig,
}

impl RecoveryManager {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        pool: Arc<WorkerPool>,
        tracker: Arc<StagingTracker>,
        state_manager: Arc<SchedulerStateManager>,
        config: Option<RecoveryConfig>,
    ) -> Self {
        Self {
            task_repo,
            pool,
            tracker,
            state_manager,
            config: config.unwrap_or_default(),
        }
    }

    /// 以乐观锁退回单个任务，不计入重试次数
    async fn requeue_task(&self, task_id: &str) -> SchedulerResult<bool> {
        for _ in 0..MAX_REQUEUE_ATTEMPTS {
            let Some(current) = self.task_repo.get_by_id(task_id).await? else {
                return Ok(false);
            };
            if !current.looks_assigned() {
                return Ok(false);
            }

            let mut next = current.clone();
            next.requeue(false)?;
            next.metadata.remove(INPUT_STAGING_KEY);
            next.metadata.remove(OUTPUT_STAGING_KEY);

            if self.task_repo.update_versioned(&next).await? {
                debug!(
                    "任务 {} 已从 {} 退回队列 (原Worker: {:?})",
                    task_id, current.status, current.worker_id
                );
                return Ok(true);
            }
        }
        Err(SchedulerError::concurrent_modification("task", task_id))
    }

    fn log_previous_state(&self, previous: &SchedulerState) {
        let threshold = Duration::seconds(self.config.stale_heartbeat_seconds as i64);
        if previous.is_heartbeat_stale(threshold, Utc::now()) {
            warn!(
                "检测到上一实例 {} 异常退出 (最后心跳: {})",
                previous.instance_id,
                previous.last_heartbeat.format("%Y-%m-%d %H:%M:%S UTC")
            );
        } else {
            warn!(
                "上一实例 {} 未正常关闭且心跳仍然新鲜，可能刚刚退出",
                previous.instance_id
            );
        }
    }

    fn summarize(&self, report: &RecoveryReport) {
        if report.crash_detected {
            info!(
                "恢复完成：退回 {} 个任务，断开 {} 个Worker，待续暂存 {} 个，耗时 {}ms",
                report.requeued_tasks.len(),
                report.disconnected_workers.len(),
                report.incomplete_operations.len(),
                report.recovery_duration_ms
            );
        } else {
            info!(
                "无需崩溃修复，待续暂存 {} 个，耗时 {}ms",
                report.incomplete_operations.len(),
                report.recovery_duration_ms
            );
        }
        for err in &report.errors {
            error!("恢复过程中的错误: {}", err);
        }
    }
}

#[async_trait]
impl RecoveryService for RecoveryManager {
    async fn start_recovery(&self) -> SchedulerResult<RecoveryReport> {
        let started = Instant::now();
        let mut report = RecoveryReport::default();

        if !self.config.enabled {
            info!("恢复功能已关闭，只登记本实例");
            self.state_manager.start().await?;
            return Ok(report);
        }

        info!("开始启动恢复，实例: {}", self.state_manager.instance_id());
        report.total_tasks_before = self.task_repo.count().await?;

        let previous = self.detect_crash().await?;
        if let Some(previous) = &previous {
            report.crash_detected = true;
            report.previous_instance = Some(previous.instance_id.clone());

            let (requeued, errors) = self.recover_interrupted_tasks().await?;
            report.requeued_tasks = requeued;
            report.errors.extend(errors);

            let (disconnected, errors) = self.recover_worker_states().await?;
            report.disconnected_workers = disconnected;
            report.errors.extend(errors);
        }

        match self.tracker.get_incomplete_operations().await {
            Ok(ops) => report.incomplete_operations = ops,
            Err(e) => report.errors.push(format!("查询未完成的暂存操作失败: {e}")),
        }

        let already_registered = self
            .state_manager
            .current()
            .await?
            .is_some_and(|state| self.state_manager.is_own_running_state(&state));
        if !already_registered {
            self.state_manager.start().await?;
        }

        report.total_tasks_after = self.task_repo.count().await?;
        if !report.tasks_conserved() {
            report.errors.push(format!(
                "恢复前后任务总数不一致: {} -> {}",
                report.total_tasks_before, report.total_tasks_after
            ));
        }

        let elapsed = started.elapsed();
        report.recovery_duration_ms = elapsed.as_millis() as u64;
        EngineMetrics::recovery_run(report.crash_detected, elapsed.as_secs_f64());

        self.summarize(&report);
        Ok(report)
    }

    async fn detect_crash(&self) -> SchedulerResult<Option<SchedulerState>> {
        let Some(previous) = self.state_manager.current().await? else {
            info!("没有上一实例的状态记录，按首次启动处理");
            return Ok(None);
        };

        // 状态行已属于本实例时说明恢复已经执行过
        if previous.instance_id == self.state_manager.instance_id() {
            debug!("状态行已属于本实例，跳过崩溃修复");
            return Ok(None);
        }

        if !previous.indicates_crash() {
            info!("上一实例 {} 已正常关闭", previous.instance_id);
            return Ok(None);
        }

        self.log_previous_state(&previous);
        Ok(Some(previous))
    }

    async fn recover_interrupted_tasks(&self) -> SchedulerResult<(Vec<String>, Vec<String>)> {
        let candidates: Vec<Task> = self.task_repo.list_assigned().await?;
        info!("发现 {} 个中断的任务", candidates.len());

        let mut requeued = Vec::new();
        let mut errors = Vec::new();
        for task in candidates {
            match self.requeue_task(&task.id).await {
                Ok(true) => {
                    // 退回的任务下一轮会重新建立暂存操作，旧的不再继续
                    if let Err(e) = self
                        .tracker
                        .abandon_for_task(&task.id, RECOVERY_ABANDON_REASON)
                        .await
                    {
                        errors.push(format!("放弃任务 {} 的暂存操作失败: {}", task.id, e));
                    }
                    requeued.push(task.id);
                }
                Ok(false) => debug!("任务 {} 已不需要修复", task.id),
                Err(e) => errors.push(format!("退回任务 {} 失败: {}", task.id, e)),
            }
        }
        Ok((requeued, errors))
    }

    async fn recover_worker_states(&self) -> SchedulerResult<(Vec<String>, Vec<String>)> {
        let since = self.state_manager.started_at();
        let workers = self.pool.list_workers().await?;

        let mut disconnected = Vec::new();
        let mut errors = Vec::new();
        for worker in workers {
            match self.pool.disconnect_if_unseen_since(&worker.id, since).await {
                Ok(true) => {
                    debug!("Worker {} 在本实例启动后未联系，标记为断开", worker.id);
                    disconnected.push(worker.id);
                }
                Ok(false) => {}
                Err(e) => errors.push(format!("断开Worker {} 失败: {}", worker.id, e)),
            }
        }
        Ok((disconnected, errors))
    }
}
