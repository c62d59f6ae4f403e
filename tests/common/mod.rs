#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;

use experiment_scheduler::{Application, ShutdownManager};
use scheduler_config::{AppConfig, DatabaseConfig, LocalWorkerConfig};
use scheduler_dispatcher::RecoveryReport;
use scheduler_dispatcher::TaskDispatchService;
use scheduler_domain::entities::{Task, TaskStatus};
use scheduler_domain::ports::StorageAdapter;
use scheduler_domain::ResourceType;
use scheduler_infrastructure::{
    AdapterRegistry, DatabaseManager, LocalProcessAdapter, LocalStorageAdapter,
    SqliteTaskRepository,
};
use scheduler_testing_utils::{IntegrationTestSetup, TestEnv};

pub const EXPERIMENT: &str = "exp-e2e";
pub const WORKER: &str = "local-1";
pub const HOST: &str = "host-1";
pub const ARCHIVE: &str = "archive";

/// 临时目录里的SQLite文件上运行的完整调度引擎，带一个本地Worker
pub struct Harness {
    pub app: Arc<Application>,
    pub compute: Arc<LocalProcessAdapter>,
    pub archive: Arc<LocalStorageAdapter>,
    pub host_root: PathBuf,
    pub recovery: RecoveryReport,
    shutdown: ShutdownManager,
    handle: JoinHandle<()>,
    dir: TempDir,
}

/// 指向临时目录中数据库文件的连接配置
pub fn database_config(dir: &Path) -> DatabaseConfig {
    DatabaseConfig {
        url: format!("sqlite://{}", dir.join("scheduler.db").display()),
        max_connections: 1,
        min_connections: 1,
        ..Default::default()
    }
}

fn fast_config(host_root: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.dispatcher.dispatch_interval_ms = 50;
    config.dispatcher.work_dir_base = "/work".to_string();
    config.staging.poll_interval_ms = 50;
    config.staging.initial_backoff_ms = 50;
    config.staging.max_backoff_ms = 200;
    config.scheduler_state.heartbeat_interval_seconds = 1;
    config.worker_agent.heartbeat_interval_seconds = 1;
    config.worker_agent.task_request_interval_seconds = 1;
    config.worker_agent.reconnect_backoff_ms = 50;
    config.worker_agent.job_poll_interval_ms = 50;
    config.local_workers = vec![LocalWorkerConfig {
        worker_id: WORKER.to_string(),
        experiment_id: EXPERIMENT.to_string(),
        compute_resource_id: HOST.to_string(),
        user_id: "tester".to_string(),
        walltime_seconds: 0,
        filesystem_root: Some(host_root.display().to_string()),
    }];
    config
}

impl Harness {
    pub async fn start() -> Self {
        IntegrationTestSetup::init_logging();
        Self::boot(TempDir::new().unwrap()).await
    }

    /// 在给定目录上启动，目录里已有的数据库会被沿用
    pub async fn boot(dir: TempDir) -> Self {
        let host_root = dir.path().join("host1");
        let archive_root = dir.path().join("archive");
        std::fs::create_dir_all(&host_root).unwrap();
        std::fs::create_dir_all(&archive_root).unwrap();

        let compute = Arc::new(LocalProcessAdapter::new(HOST));
        let archive = Arc::new(LocalStorageAdapter::new(ARCHIVE, ResourceType::Nfs, &archive_root));
        let registry = AdapterRegistry::new();
        registry.register_compute(compute.clone());
        registry.register_storage(Arc::new(LocalStorageAdapter::new(
            HOST,
            ResourceType::BareMetal,
            &host_root,
        )));
        registry.register_storage(archive.clone());

        let db = DatabaseManager::new(&database_config(dir.path())).await.unwrap();
        let app = Application::with_parts(fast_config(&host_root), db, Arc::new(registry))
            .await
            .unwrap();
        let recovery = app.recover().await.unwrap();
        assert!(recovery.tasks_conserved());

        let app = Arc::new(app);
        let shutdown = ShutdownManager::new();
        let handle = {
            let app = Arc::clone(&app);
            let shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move {
                app.run(shutdown_rx).await.unwrap();
            })
        };

        Self {
            app,
            compute,
            archive,
            host_root,
            recovery,
            shutdown,
            handle,
            dir,
        }
    }

    pub async fn submit(&self, task: Task) -> Task {
        self.app.dispatcher().enqueue(task).await.unwrap()
    }

    pub async fn task(&self, task_id: &str) -> Task {
        self.app
            .dispatcher()
            .get_task(task_id)
            .await
            .unwrap()
            .expect("任务不存在")
    }

    /// 等待任务到达指定状态；提前进入其他终止状态时直接失败
    pub async fn wait_for_status(&self, task_id: &str, status: TaskStatus, timeout: Duration) -> Task {
        let repo = SqliteTaskRepository::new(self.app.database().pool().clone());
        let task = TestEnv::wait_for_task_status(&repo, task_id, status, timeout)
            .await
            .expect("任务不存在");
        assert_eq!(
            task.status, status,
            "任务 {} 未进入 {:?}，错误: {:?}",
            task_id, status, task.error
        );
        task
    }

    /// 任务在本机的工作目录
    pub fn work_dir(&self, task_id: &str) -> PathBuf {
        self.host_root.join("work").join(task_id)
    }

    pub async fn put_archive(&self, path: &str, data: &[u8]) {
        self.archive.put(path, data).await.unwrap();
    }

    pub async fn stop(self) {
        self.halt().await;
    }

    /// 正常停止调度引擎，交回数据所在的目录
    pub async fn halt(self) -> TempDir {
        self.shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(20), self.handle)
            .await
            .expect("调度引擎未能按时停止")
            .unwrap();
        self.dir
    }
}

pub fn task(id: &str, command: &str) -> Task {
    Task::new(id, EXPERIMENT, command)
}
