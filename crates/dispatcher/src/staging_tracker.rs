use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use scheduler_config::StagingConfig;
use scheduler_domain::entities::{StagingDirection, StagingOperation, StagingStatus};
use scheduler_domain::ports::{TransferPoller, TransferProgress};
use scheduler_domain::repositories::StagingOperationRepository;
use scheduler_errors::{SchedulerError, SchedulerResult};
use scheduler_infrastructure::EngineMetrics;

use crate::retry_policy::RetryPolicy;

const STAGING_TIMEOUT_MESSAGE: &str = "staging timeout";

/// 暂存操作统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StagingStats {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed
    }
}

/// 暂存操作跟踪器
///
/// 只记录和推进暂存操作的状态，真正的数据搬运由 `TransferPoller` 完成。
/// 每个操作最多一个监控任务，结果只写库，由调度循环读取后推进任务。
pub struct StagingTracker {
    staging_repo: Arc<dyn StagingOperationRepository>,
    poller: Arc<dyn TransferPoller>,
    config: StagingConfig,
    retry_policy: RetryPolicy,
    monitors: Mutex<HashMap<String, JoinHandle<()>>>,
    progress: Arc<Notify>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: AtomicBool,
}

impl StagingTracker {
    pub fn new(
        staging_repo: Arc<dyn StagingOperationRepository>,
        poller: Arc<dyn TransferPoller>,
        config: Option<StagingConfig>,
    ) -> Self {
        let config = config.unwrap_or_default();
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            staging_repo,
            poller,
            retry_policy: RetryPolicy::from_staging_config(&config),
            config,
            monitors: Mutex::new(HashMap::new()),
            progress: Arc::new(Notify::new()),
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// 操作进入终态时触发，调度循环据此提前醒来
    pub fn progress_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.progress)
    }

    fn monitors(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        match self.monitors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 创建一条 Pending 的暂存记录，不搬运数据
    #[allow(clippy::too_many_arguments)]
    pub async fn create_staging_operation(
        &self,
        task_id: &str,
        worker_id: &str,
        compute_resource_id: &str,
        direction: StagingDirection,
        source_path: &str,
        destination_path: &str,
        total_size: i64,
        checksum: Option<&str>,
        timeout_seconds: Option<i64>,
    ) -> SchedulerResult<String> {
        let op = StagingOperation::new(
            task_id,
            worker_id,
            compute_resource_id,
            direction,
            source_path,
            destination_path,
            total_size,
            timeout_seconds.unwrap_or(self.config.default_timeout_seconds as i64),
        )
        .with_checksum(checksum.map(str::to_string));
        self.staging_repo.create(&op).await?;
        debug!(
            "创建暂存操作 {} ({} {} -> {})",
            op.id, direction, source_path, destination_path
        );
        Ok(op.id)
    }

    pub async fn get_operation(&self, op_id: &str) -> SchedulerResult<Option<StagingOperation>> {
        self.staging_repo.get_by_id(op_id).await
    }

    pub async fn operations_for_task(&self, task_id: &str) -> SchedulerResult<Vec<StagingOperation>> {
        self.staging_repo.list_by_task(task_id).await
    }

    /// Pending/Running 的操作，按创建时间升序
    pub async fn get_incomplete_operations(&self) -> SchedulerResult<Vec<StagingOperation>> {
        self.staging_repo.list_incomplete().await
    }

    /// 以库中状态为前提写入，返回是否命中
    async fn persist(&self, current: &StagingOperation, next: &StagingOperation) -> SchedulerResult<bool> {
        self.staging_repo.update_if_status(next, current.status).await
    }

    async fn reload(&self, op_id: &str) -> SchedulerResult<StagingOperation> {
        self.staging_repo
            .get_by_id(op_id)
            .await?
            .ok_or_else(|| SchedulerError::staging_not_found(op_id))
    }

    async fn finish(
        &self,
        op: StagingOperation,
        status: StagingStatus,
        transferred: Option<u64>,
        message: Option<String>,
    ) -> SchedulerResult<StagingOperation> {
        let now = Utc::now();
        let mut next = op.clone();
        next.status = status;
        next.completed_at = Some(now);
        next.updated_at = now;
        next.last_heartbeat = Some(now);
        if let Some(transferred) = transferred {
            next.transferred_size = transferred as i64;
        }
        if message.is_some() {
            next.error_message = message;
        }

        if !self.persist(&op, &next).await? {
            debug!("暂存操作 {} 已被其他流程更新，放弃写入 {}", op.id, status);
            return self.reload(&op.id).await;
        }

        let duration = next
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or_default();
        match status {
            StagingStatus::Completed => {
                info!("暂存操作 {} 完成，传输 {} 字节", next.id, next.transferred_size);
                EngineMetrics::staging_finished("completed", duration);
            }
            _ => {
                warn!(
                    "暂存操作 {} 失败: {}",
                    next.id,
                    next.error_message.as_deref().unwrap_or("unknown")
                );
                EngineMetrics::staging_finished("failed", duration);
            }
        }
        self.progress.notify_one();
        Ok(next)
    }

    /// 监控单个暂存操作直到终态，返回最终记录
    pub async fn monitor_staging_progress(
        &self,
        op_id: &str,
        poller: &dyn TransferPoller,
    ) -> SchedulerResult<StagingOperation> {
        let mut op = self.reload(op_id).await?;
        if op.status.is_terminal() {
            return Ok(op);
        }

        if op.status == StagingStatus::Pending {
            let now = Utc::now();
            let mut running = op.clone();
            running.status = StagingStatus::Running;
            running.started_at = Some(now);
            running.last_heartbeat = Some(now);
            running.updated_at = now;
            if self.persist(&op, &running).await? {
                op = running;
            } else {
                op = self.reload(op_id).await?;
                if op.status != StagingStatus::Running {
                    return Ok(op);
                }
            }
        }

        let max_attempts = self.config.max_attempts.max(1);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            let now = Utc::now();
            let started = op.started_at.unwrap_or(now);
            let deadline = started + chrono::Duration::seconds(op.timeout_seconds);
            let remaining = match (deadline - now).to_std() {
                Ok(remaining) if !remaining.is_zero() => remaining,
                _ => {
                    return self
                        .finish(op, StagingStatus::Failed, None, Some(STAGING_TIMEOUT_MESSAGE.to_string()))
                        .await;
                }
            };

            let wait = match tokio::time::timeout(remaining, poller.poll(&op)).await {
                Err(_) => {
                    return self
                        .finish(op, StagingStatus::Failed, None, Some(STAGING_TIMEOUT_MESSAGE.to_string()))
                        .await;
                }
                Ok(Ok(TransferProgress::Done { transferred })) => {
                    return self
                        .finish(op, StagingStatus::Completed, Some(transferred), None)
                        .await;
                }
                Ok(Ok(TransferProgress::InProgress { transferred, total })) => {
                    let now = Utc::now();
                    let mut next = op.clone();
                    next.transferred_size = transferred as i64;
                    if total > 0 {
                        next.total_size = total as i64;
                    }
                    next.last_heartbeat = Some(now);
                    next.updated_at = now;
                    if !self.persist(&op, &next).await? {
                        return self.reload(op_id).await;
                    }
                    op = next;
                    poll_interval
                }
                Ok(Err(err)) if err.is_transient() => {
                    let attempts = op.attempts + 1;
                    if attempts >= max_attempts {
                        let mut exhausted = op.clone();
                        exhausted.attempts = attempts;
                        return self
                            .finish(
                                exhausted,
                                StagingStatus::Failed,
                                None,
                                Some(format!("重试 {attempts} 次后仍失败: {err}")),
                            )
                            .await;
                    }

                    let now = Utc::now();
                    let mut next = op.clone();
                    next.attempts = attempts;
                    next.error_message = Some(err.to_string());
                    next.last_heartbeat = Some(now);
                    next.updated_at = now;
                    if !self.persist(&op, &next).await? {
                        return self.reload(op_id).await;
                    }
                    op = next;

                    let delay = self.retry_policy.delay_for(attempts - 1);
                    debug!(
                        "暂存操作 {} 第 {} 次传输失败，{:?} 后重试: {}",
                        op.id, attempts, delay, err
                    );
                    delay
                }
                Ok(Err(err)) => {
                    return self
                        .finish(op, StagingStatus::Failed, None, Some(err.to_string()))
                        .await;
                }
            };

            tokio::time::sleep(wait.min(remaining)).await;
        }
    }

    /// 为操作启动后台监控，已有监控在跑时不重复启动
    pub fn spawn_monitor(self: &Arc<Self>, op_id: &str) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }

        let mut monitors = self.monitors();
        if monitors.get(op_id).is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let tracker = Arc::clone(self);
        let id = op_id.to_string();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let poller = Arc::clone(&tracker.poller);
            tokio::select! {
                result = tracker.monitor_staging_progress(&id, poller.as_ref()) => {
                    if let Err(e) = result {
                        error!("监控暂存操作 {} 时出错: {}", id, e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("暂存监控 {} 随关闭信号退出", id);
                }
            }
            tracker.monitors().remove(&id);
        });
        monitors.insert(op_id.to_string(), handle);
        true
    }

    /// 为恢复出来的未完成操作重新启动监控
    pub fn resume_operations(self: &Arc<Self>, ops: &[StagingOperation]) -> usize {
        let resumed = ops
            .iter()
            .filter(|op| op.is_incomplete())
            .filter(|op| self.spawn_monitor(&op.id))
            .count();
        if resumed > 0 {
            info!("恢复了 {} 个未完成的暂存操作", resumed);
        }
        resumed
    }

    pub fn active_monitors(&self) -> usize {
        self.monitors()
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// 放弃任务的所有未完成操作（任务失败、取消或重新排队时）
    pub async fn abandon_for_task(&self, task_id: &str, reason: &str) -> SchedulerResult<usize> {
        let mut abandoned = 0;
        for op in self.staging_repo.list_by_task(task_id).await? {
            if op.status.is_terminal() {
                continue;
            }
            if let Some(handle) = self.monitors().remove(&op.id) {
                handle.abort();
            }

            let now = Utc::now();
            let mut failed = op.clone();
            failed.status = StagingStatus::Failed;
            failed.error_message = Some(reason.to_string());
            failed.completed_at = Some(now);
            failed.updated_at = now;
            if self.persist(&op, &failed).await? {
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            debug!("任务 {} 放弃了 {} 个暂存操作: {}", task_id, abandoned, reason);
        }
        Ok(abandoned)
    }

    pub async fn statistics(&self) -> SchedulerResult<StagingStats> {
        Ok(StagingStats {
            pending: self.staging_repo.list_by_status(StagingStatus::Pending).await?.len(),
            running: self.staging_repo.list_by_status(StagingStatus::Running).await?.len(),
            completed: self.staging_repo.list_by_status(StagingStatus::Completed).await?.len(),
            failed: self.staging_repo.list_by_status(StagingStatus::Failed).await?.len(),
        })
    }

    /// 删除早于保留期的终态记录，未完成的操作不受影响
    pub async fn cleanup_completed(&self, older_than: chrono::Duration) -> SchedulerResult<u64> {
        let cutoff = Utc::now() - older_than;
        let mut deleted = 0;
        for status in [StagingStatus::Completed, StagingStatus::Failed] {
            for op in self.staging_repo.list_by_status(status).await? {
                let finished_at = op.completed_at.unwrap_or(op.updated_at);
                if finished_at < cutoff && self.staging_repo.delete(&op.id).await? {
                    deleted += 1;
                }
            }
        }
        if deleted > 0 {
            info!("清理了 {} 条过期的暂存记录", deleted);
        }
        Ok(deleted)
    }

    /// 配置了保留期时按周期清理过期记录；未配置则终态记录永久保留
    pub fn start_cleanup(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let hours = self.config.retention_hours?;
        let tracker = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!("暂存记录保留 {} 小时", hours);
        Some(tokio::spawn(async move {
            let interval = Duration::from_secs(tracker.config.cleanup_interval_seconds.max(1));
            let retention = chrono::Duration::hours(hours as i64);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = tracker.cleanup_completed(retention).await {
                            error!("清理暂存记录时出错: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        }))
    }

    /// 停止所有后台监控。未完成的操作留在库中，重启后由恢复流程继续
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        let remaining = self.monitors().len();
        if remaining > 0 {
            info!("停止 {} 个暂存监控", remaining);
        }
    }
}
