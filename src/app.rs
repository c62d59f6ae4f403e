use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use scheduler_config::{AppConfig, LocalWorkerConfig, ResourceConfig};
use scheduler_dispatcher::{
    RecoveryManager, RecoveryReport, RecoveryService, SchedulerStateManager, StagingTracker,
    TaskDispatcher, WorkerChannels, WorkerFailureDetector, WorkerFailureDetectorService,
    WorkerPool, WorkerSessionHandler,
};
use scheduler_domain::entities::Worker;
use scheduler_domain::repositories::{TaskRepository, WorkerRepository};
use scheduler_domain::{ResourceDescriptor, ResourceType};
use scheduler_infrastructure::{
    AdapterRegistry, DatabaseManager, SqliteSchedulerStateRepository,
    SqliteStagingOperationRepository, SqliteTaskRepository, SqliteWorkerRepository,
    StorageTransferPoller,
};
use scheduler_worker::{AgentExit, InProcessConnector, WorkerAgent, WorkerIdentity};

const BACKGROUND_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_REASON: &str = "调度器正常关闭";
const LOCAL_RESTART_REASON: &str = "本地Worker重新启动";

/// 运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 恢复后持续调度
    Scheduler,
    /// 只执行一次启动恢复然后退出
    Recover,
}

impl FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduler" => Ok(AppMode::Scheduler),
            "recover" => Ok(AppMode::Recover),
            other => Err(anyhow!("未知的运行模式: {other}")),
        }
    }
}

/// 调度引擎的装配与生命周期
pub struct Application {
    config: AppConfig,
    db: DatabaseManager,
    registry: Arc<AdapterRegistry>,
    worker_repo: Arc<dyn WorkerRepository>,
    pool: Arc<WorkerPool>,
    tracker: Arc<StagingTracker>,
    dispatcher: Arc<TaskDispatcher>,
    detector: Arc<WorkerFailureDetector>,
    state_manager: Arc<SchedulerStateManager>,
    recovery: RecoveryManager,
    sessions: Arc<WorkerSessionHandler>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let db = DatabaseManager::new(&config.database)
            .await
            .with_context(|| format!("连接数据库失败: {}", config.database.url))?;
        let registry = build_registry(&config.resources)?;
        Self::with_parts(config, db, Arc::new(registry)).await
    }

    /// 使用已经建立好的数据库与适配器注册表装配
    pub async fn with_parts(
        config: AppConfig,
        db: DatabaseManager,
        registry: Arc<AdapterRegistry>,
    ) -> Result<Self> {
        db.migrate().await.context("初始化数据库表结构失败")?;

        let pool_handle = db.pool().clone();
        let task_repo: Arc<dyn TaskRepository> =
            Arc::new(SqliteTaskRepository::new(pool_handle.clone()));
        let worker_repo: Arc<dyn WorkerRepository> =
            Arc::new(SqliteWorkerRepository::new(pool_handle.clone()));
        let staging_repo = Arc::new(SqliteStagingOperationRepository::new(pool_handle.clone()));
        let state_repo = Arc::new(SqliteSchedulerStateRepository::new(pool_handle));

        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&worker_repo),
            Some(config.worker_pool.clone()),
        ));
        let poller = Arc::new(StorageTransferPoller::new(Arc::clone(&registry)));
        let tracker = Arc::new(StagingTracker::new(
            staging_repo,
            poller,
            Some(config.staging.clone()),
        ));
        let dispatcher = Arc::new(TaskDispatcher::new(
            Arc::clone(&task_repo),
            Arc::clone(&pool),
            Arc::clone(&tracker),
            WorkerChannels::new(),
            Some(config.dispatcher.clone()),
        ));
        let detector = Arc::new(WorkerFailureDetector::new(
            Arc::clone(&pool),
            dispatcher.clone(),
        ));
        let state_manager = Arc::new(SchedulerStateManager::new(
            state_repo,
            instance_id(),
            Some(config.scheduler_state.clone()),
        ));
        let recovery = RecoveryManager::new(
            task_repo,
            Arc::clone(&pool),
            Arc::clone(&tracker),
            Arc::clone(&state_manager),
            Some(config.recovery.clone()),
        );
        let sessions = Arc::new(WorkerSessionHandler::new(
            Arc::clone(&dispatcher),
            config.worker_pool.channel_capacity,
        ));

        info!("调度引擎装配完成，实例: {}", state_manager.instance_id());
        Ok(Self {
            config,
            db,
            registry,
            worker_repo,
            pool,
            tracker,
            dispatcher,
            detector,
            state_manager,
            recovery,
            sessions,
        })
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    pub fn sessions(&self) -> &Arc<WorkerSessionHandler> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn tracker(&self) -> &Arc<StagingTracker> {
        &self.tracker
    }

    pub fn database(&self) -> &DatabaseManager {
        &self.db
    }

    /// 启动恢复，并把未完成的暂存操作交还给跟踪器继续监控
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let report = self.recovery.start_recovery().await.context("启动恢复失败")?;
        let resumed = self.tracker.resume_operations(&report.incomplete_operations);

        if report.crash_detected {
            warn!(
                "检测到上一实例 {:?} 异常退出，重新排队 {} 个任务，断开 {} 个Worker",
                report.previous_instance,
                report.requeued_tasks.len(),
                report.disconnected_workers.len()
            );
        }
        for err in &report.errors {
            error!("恢复过程中的错误: {}", err);
        }
        info!(
            "恢复完成，耗时 {}ms，继续监控 {} 个暂存操作",
            report.recovery_duration_ms, resumed
        );
        Ok(report)
    }

    /// 运行后台循环直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let (local_tx, _) = broadcast::channel::<()>(1);

        let heartbeat = self.state_manager.start_heartbeat(local_tx.subscribe());
        let cleanup = self.tracker.start_cleanup();

        let dispatch_loop = {
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                if let Err(e) = dispatcher.start().await {
                    error!("任务调度循环异常退出: {}", e);
                }
            })
        };
        let detection_loop = {
            let detector = Arc::clone(&self.detector);
            tokio::spawn(async move {
                if let Err(e) = detector.start_detection().await {
                    error!("Worker失效检测异常退出: {}", e);
                }
            })
        };

        let mut agents = Vec::new();
        for worker in &self.config.local_workers {
            match self.spawn_local_worker(worker, local_tx.subscribe()).await {
                Ok(handle) => agents.push(handle),
                Err(e) => error!("启动本地Worker {} 失败: {:#}", worker.worker_id, e),
            }
        }
        info!("调度引擎已启动，本地Worker {} 个", agents.len());

        let _ = shutdown_rx.recv().await;
        info!("开始停止调度引擎");

        self.dispatcher.stop().await;
        if let Err(e) = self.detector.stop_detection().await {
            warn!("停止失效检测失败: {}", e);
        }
        let _ = local_tx.send(());
        self.tracker.shutdown();

        for handle in agents {
            match tokio::time::timeout(BACKGROUND_STOP_TIMEOUT, handle).await {
                Ok(Ok(exit)) => info!("本地Worker退出: {:?}", exit),
                Ok(Err(e)) => error!("本地Worker任务异常: {}", e),
                Err(_) => warn!("等待本地Worker退出超时"),
            }
        }
        self.release_local_workers(SHUTDOWN_REASON).await;

        dispatch_loop.abort();
        detection_loop.abort();
        if let Some(cleanup) = cleanup {
            cleanup.abort();
        }
        let _ = heartbeat.await;

        match self.state_manager.mark_clean_shutdown().await {
            Ok(true) => info!("已记录正常关闭"),
            Ok(false) => warn!("状态行已被其他实例接管，未记录正常关闭"),
            Err(e) => error!("记录正常关闭失败: {}", e),
        }
        Ok(())
    }

    /// 本地代理都已退出，它们手上的任务不计重试地退回队列
    async fn release_local_workers(&self, reason: &str) {
        for worker in &self.config.local_workers {
            match self.dispatcher.release_worker(&worker.worker_id, reason).await {
                Ok(0) => {}
                Ok(requeued) => info!(
                    "本地Worker {} 交还 {} 个任务: {}",
                    worker.worker_id, requeued, reason
                ),
                Err(e) => error!("释放本地Worker {} 失败: {}", worker.worker_id, e),
            }
        }
    }

    async fn spawn_local_worker(
        &self,
        worker: &LocalWorkerConfig,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<AgentExit>> {
        if self.worker_repo.get_by_id(&worker.worker_id).await?.is_none() {
            let row = Worker::provisioned(
                worker.worker_id.clone(),
                worker.experiment_id.clone(),
                worker.compute_resource_id.clone(),
                worker.user_id.clone(),
                worker.walltime_seconds,
            );
            self.worker_repo.create(&row).await?;
            info!("已为本地Worker {} 创建记录", worker.worker_id);
        } else {
            // 代理尚未启动，库中的在线状态和任务都来自上一个进程
            let requeued = self
                .dispatcher
                .release_worker(&worker.worker_id, LOCAL_RESTART_REASON)
                .await?;
            if requeued > 0 {
                info!("本地Worker {} 启动前退回 {} 个遗留任务", worker.worker_id, requeued);
            }
        }

        let compute = self
            .registry
            .compute(&worker.compute_resource_id)
            .map_err(|e| anyhow!("计算资源 {} 不可用: {}", worker.compute_resource_id, e))?;
        let identity = WorkerIdentity::new(
            worker.worker_id.clone(),
            worker.experiment_id.clone(),
            worker.compute_resource_id.clone(),
        );
        let mut agent = WorkerAgent::new(identity, compute, Some(self.config.worker_agent.clone()));
        if let Some(root) = &worker.filesystem_root {
            agent = agent.with_filesystem_root(root);
        }

        let connector = InProcessConnector::new(Arc::clone(&self.sessions));
        Ok(tokio::spawn(async move {
            agent.run(&connector, shutdown_rx).await
        }))
    }
}

/// 按配置注册全部资源适配器
pub fn build_registry(resources: &[ResourceConfig]) -> Result<AdapterRegistry> {
    let registry = AdapterRegistry::new();
    for resource in resources {
        let kind = ResourceType::from_str(&resource.kind).map_err(|e| anyhow!(e))?;
        let descriptor = ResourceDescriptor {
            id: resource.id.clone(),
            kind,
            endpoint: resource.endpoint.clone(),
            owner_user_id: resource.owner_user_id.clone(),
        };
        registry
            .register(&descriptor)
            .map_err(|e| anyhow!("注册资源 {} 失败: {}", resource.id, e))?;
    }
    Ok(registry)
}

fn instance_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}-{}", host, uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode() {
        assert_eq!("scheduler".parse::<AppMode>().unwrap(), AppMode::Scheduler);
        assert_eq!("recover".parse::<AppMode>().unwrap(), AppMode::Recover);
        assert!("worker".parse::<AppMode>().is_err());
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/scheduler.toml");
        let config = AppConfig::load(Some(path)).unwrap();
        assert_eq!(config.worker_pool.heartbeat_timeout_seconds, 120);
        assert_eq!(config.worker_agent.server_unresponsive_timeout_seconds, 300);
        let registry = build_registry(&config.resources).unwrap();
        assert!(registry.compute("local").is_ok());
        assert!(registry.storage("archive").is_ok());
        assert!(registry.compute("archive").is_err());
    }

    #[test]
    fn test_build_registry_rejects_unknown_kind() {
        let resources = vec![ResourceConfig {
            id: "r1".to_string(),
            kind: "mainframe".to_string(),
            endpoint: "/tmp".to_string(),
            owner_user_id: None,
        }];
        assert!(build_registry(&resources).is_err());
    }

    #[test]
    fn test_build_registry_bare_metal_provides_both_sides() {
        let dir = tempfile::TempDir::new().unwrap();
        let resources = vec![ResourceConfig {
            id: "host-1".to_string(),
            kind: "bare_metal".to_string(),
            endpoint: dir.path().display().to_string(),
            owner_user_id: None,
        }];
        let registry = build_registry(&resources).unwrap();
        assert!(registry.compute("host-1").is_ok());
        assert!(registry.storage("host-1").is_ok());
    }
}
