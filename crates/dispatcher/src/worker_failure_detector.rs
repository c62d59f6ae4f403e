use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use scheduler_domain::entities::{ConnectionState, Worker};
use scheduler_errors::{FailureReason, SchedulerResult};
use scheduler_infrastructure::EngineMetrics;

use crate::task_dispatcher::TaskDispatchService;
use crate::worker_pool::WorkerPool;

/// 心跳丢失归咎于Worker一侧，按临时故障计入重试；
/// 调度器自身停止或重启造成的中断走 `TaskDispatcher::release_worker`，不计重试
const HEARTBEAT_LOST: &str = "Worker心跳丢失";

/// 一轮检测的结果
#[derive(Debug, Clone, Default)]
pub struct FailureDetectionReport {
    pub checked_workers: usize,
    pub disconnected_workers: Vec<String>,
    pub failed_tasks: Vec<String>,
    pub errors: Vec<String>,
}

/// Worker失效检测服务接口
#[async_trait]
pub trait WorkerFailureDetectorService: Send + Sync {
    /// 启动失效检测
    async fn start_detection(&self) -> SchedulerResult<()>;

    /// 停止失效检测
    async fn stop_detection(&self) -> SchedulerResult<()>;

    /// 检测失效的Worker
    async fn detect_failed_workers(&self) -> SchedulerResult<Vec<Worker>>;

    /// 处理失效的Worker，返回被判失败的任务
    async fn handle_failed_worker(&self, worker: &Worker) -> SchedulerResult<Vec<String>>;

    /// 执行一轮检测
    async fn run_detection_cycle(&self) -> SchedulerResult<FailureDetectionReport>;
}

/// Worker失效检测服务实现
pub struct WorkerFailureDetector {
    pool: Arc<WorkerPool>,
    dispatcher: Arc<dyn TaskDispatchService>,
    running: Arc<tokio::sync::RwLock<bool>>,
}

impl WorkerFailureDetector {
    /// 创建新的Worker失效检测器，阈值取自 `WorkerPool` 的配置
    pub fn new(pool: Arc<WorkerPool>, dispatcher: Arc<dyn TaskDispatchService>) -> Self {
        Self {
            pool,
            dispatcher,
            running: Arc::new(tokio::sync::RwLock::new(false)),
        }
    }

    /// 检查Worker是否失效
    fn is_worker_failed(&self, worker: &Worker, now: DateTime<Utc>) -> bool {
        if worker.connection_state != ConnectionState::Connected {
            return false; // 已经断开的Worker不需要重复处理
        }
        worker.is_heartbeat_expired(self.pool.heartbeat_timeout(), now)
    }

    /// 执行检测循环
    async fn detection_loop(&self) -> SchedulerResult<()> {
        info!("启动Worker失效检测循环");

        let interval_duration =
            Duration::from_secs(self.pool.config().health_check_interval_seconds.max(1));

        loop {
            if !*self.running.read().await {
                info!("收到停止信号，退出Worker失效检测循环");
                break;
            }

            match self.run_detection_cycle().await {
                Ok(report) => {
                    for err in &report.errors {
                        error!("{}", err);
                    }
                }
                Err(e) => {
                    error!("Worker失效检测时出错: {}", e);
                }
            }

            tokio::time::sleep(interval_duration).await;
        }

        Ok(())
    }
}

#[async_trait]
impl WorkerFailureDetectorService for WorkerFailureDetector {
    async fn start_detection(&self) -> SchedulerResult<()> {
        info!("启动Worker失效检测服务");

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        self.detection_loop().await
    }

    async fn stop_detection(&self) -> SchedulerResult<()> {
        info!("停止Worker失效检测服务");

        let mut running = self.running.write().await;
        *running = false;

        Ok(())
    }

    async fn detect_failed_workers(&self) -> SchedulerResult<Vec<Worker>> {
        debug!("开始检测失效的Worker");

        let now = Utc::now();
        let connected = self.pool.connected_workers().await?;
        EngineMetrics::connected_workers(connected.len());

        let failed_workers: Vec<Worker> = connected
            .into_iter()
            .filter(|worker| self.is_worker_failed(worker, now))
            .collect();

        for worker in &failed_workers {
            warn!(
                "检测到失效Worker: {} (上次心跳: {})",
                worker.id,
                worker.last_heartbeat.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }

        Ok(failed_workers)
    }

    async fn handle_failed_worker(&self, worker: &Worker) -> SchedulerResult<Vec<String>> {
        info!("处理失效Worker: {}", worker.id);

        // 1. 在Worker锁内复核并断开；期间若心跳恢复则放弃
        let held = match self
            .pool
            .disconnect_if_stale(&worker.id, self.pool.heartbeat_timeout(), Utc::now())
            .await?
        {
            Some(held) => held,
            None => {
                debug!("Worker {} 在处理前恢复了心跳", worker.id);
                return Ok(Vec::new());
            }
        };
        EngineMetrics::worker_reaped();

        // 2. 该Worker上的任务按临时故障处理，失联是Worker的问题，计入重试
        let mut task_ids: BTreeSet<String> = held.into_iter().collect();
        match self.dispatcher.active_tasks_for_worker(&worker.id).await {
            Ok(tasks) => task_ids.extend(tasks.into_iter().map(|t| t.id)),
            Err(e) => error!("查询Worker {} 上的任务失败: {}", worker.id, e),
        }

        let mut failed = Vec::new();
        for task_id in task_ids {
            match self
                .dispatcher
                .handle_failure(&task_id, FailureReason::transient(HEARTBEAT_LOST), false)
                .await
            {
                Ok(_) => failed.push(task_id),
                Err(e) => error!("处理失效Worker {} 上的任务 {} 失败: {}", worker.id, task_id, e),
            }
        }

        if failed.is_empty() {
            debug!("失效Worker {} 上没有需要处理的任务", worker.id);
        } else {
            info!("失效Worker {} 上的 {} 个任务已交给失败处理", worker.id, failed.len());
        }
        Ok(failed)
    }

    async fn run_detection_cycle(&self) -> SchedulerResult<FailureDetectionReport> {
        let mut report = FailureDetectionReport {
            checked_workers: self.pool.connected_workers().await?.len(),
            ..Default::default()
        };

        for worker in self.detect_failed_workers().await? {
            match self.handle_failed_worker(&worker).await {
                Ok(tasks) => {
                    report.disconnected_workers.push(worker.id.clone());
                    report.failed_tasks.extend(tasks);
                }
                Err(e) => report
                    .errors
                    .push(format!("处理失效Worker {} 时出错: {}", worker.id, e)),
            }
        }

        if !report.disconnected_workers.is_empty() {
            info!(
                "本轮检测断开 {} 个Worker，影响 {} 个任务",
                report.disconnected_workers.len(),
                report.failed_tasks.len()
            );
        }
        Ok(report)
    }
}
