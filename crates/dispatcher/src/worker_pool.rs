use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use scheduler_config::WorkerPoolConfig;
use scheduler_domain::entities::{ConnectionState, Worker, WorkerStatus};
use scheduler_domain::messaging::{WorkerHeartbeat, WorkerMetrics, WorkerRegistration};
use scheduler_domain::repositories::WorkerRepository;
use scheduler_errors::{SchedulerError, SchedulerResult};

use crate::keyed_lock::KeyedLocks;

/// Worker池管理
///
/// 所有对单个Worker行的读改写都在该Worker的锁内完成，
/// 心跳、占用、释放、失联判定不会互相覆盖。
pub struct WorkerPool {
    worker_repo: Arc<dyn WorkerRepository>,
    locks: KeyedLocks,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(worker_repo: Arc<dyn WorkerRepository>, config: Option<WorkerPoolConfig>) -> Self {
        Self {
            worker_repo,
            locks: KeyedLocks::new(),
            config: config.unwrap_or_default(),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::seconds(self.config.heartbeat_timeout_seconds as i64)
    }

    async fn load(&self, worker_id: &str) -> SchedulerResult<Worker> {
        self.worker_repo
            .get_by_id(worker_id)
            .await?
            .ok_or_else(|| SchedulerError::worker_not_found(worker_id))
    }

    /// 远端代理首次连上后的注册
    ///
    /// Worker行必须已由供给流程创建。注册成功后标记为 Busy + Connected，
    /// 直到第一次上报空闲的心跳才进入可分配状态。
    pub async fn register_worker(&self, registration: &WorkerRegistration) -> SchedulerResult<Worker> {
        if registration.worker_id.trim().is_empty() {
            return Err(SchedulerError::registration_error("worker_id不能为空"));
        }
        if registration.experiment_id.trim().is_empty() {
            return Err(SchedulerError::registration_error("experiment_id不能为空"));
        }
        if registration.compute_resource_id.trim().is_empty() {
            return Err(SchedulerError::registration_error("compute_resource_id不能为空"));
        }

        let _guard = self.locks.lock(&registration.worker_id).await;

        let mut worker = self
            .worker_repo
            .get_by_id(&registration.worker_id)
            .await?
            .ok_or_else(|| {
                SchedulerError::registration_error(format!(
                    "未知的Worker: {}",
                    registration.worker_id
                ))
            })?;

        if worker.experiment_id != registration.experiment_id {
            return Err(SchedulerError::registration_error(format!(
                "Worker {} 属于实验 {}，不能注册到 {}",
                worker.id, worker.experiment_id, registration.experiment_id
            )));
        }
        if worker.compute_resource_id != registration.compute_resource_id {
            return Err(SchedulerError::registration_error(format!(
                "Worker {} 绑定计算资源 {}，不能注册到 {}",
                worker.id, worker.compute_resource_id, registration.compute_resource_id
            )));
        }

        let now = Utc::now();
        if worker.connection_state == ConnectionState::Connected
            && worker.last_seen_at.is_some()
            && !worker.is_heartbeat_expired(self.heartbeat_timeout(), now)
        {
            return Err(SchedulerError::registration_error(format!(
                "Worker {} 已在线，拒绝重复注册",
                worker.id
            )));
        }

        worker.status = WorkerStatus::Busy;
        worker.connection_state = ConnectionState::Connected;
        worker.capabilities = registration.capabilities.clone();
        if let Some(hostname) = &registration.hostname {
            worker
                .metadata
                .insert("hostname".to_string(), Value::String(hostname.clone()));
        }
        worker.touch(now);
        self.worker_repo.update(&worker).await?;

        info!(
            "Worker {} 注册成功 (实验: {}, 计算资源: {})",
            worker.id, worker.experiment_id, worker.compute_resource_id
        );
        Ok(worker)
    }

    /// 处理心跳，返回更新后的Worker
    pub async fn heartbeat(&self, heartbeat: &WorkerHeartbeat) -> SchedulerResult<Worker> {
        let _guard = self.locks.lock(&heartbeat.worker_id).await;
        let mut worker = self.load(&heartbeat.worker_id).await?;

        if worker.last_seen_at.is_none() {
            return Err(SchedulerError::registration_error(format!(
                "Worker {} 尚未注册",
                worker.id
            )));
        }

        let now = Utc::now();
        if worker.connection_state == ConnectionState::Disconnected {
            info!("Worker {} 重新连接", worker.id);
            worker.connection_state = ConnectionState::Connected;
        }

        if worker.current_task_id != heartbeat.current_task_id {
            warn!(
                "Worker {} 上报的任务 {:?} 与分配记录 {:?} 不一致",
                worker.id, heartbeat.current_task_id, worker.current_task_id
            );
        }

        // 注册后尚未分配任务的Worker在首次上报空闲时进入可分配状态
        if worker.status == WorkerStatus::Busy
            && worker.current_task_id.is_none()
            && heartbeat.status == WorkerStatus::Idle
        {
            worker.status = WorkerStatus::Idle;
        }

        for (key, value) in &heartbeat.metadata {
            worker.metadata.insert(key.clone(), value.clone());
        }
        worker.touch(now);
        self.worker_repo.update(&worker).await?;

        debug!("收到Worker {} 心跳，状态 {}", worker.id, worker.status);
        Ok(worker)
    }

    pub async fn record_metrics(&self, metrics: &WorkerMetrics) -> SchedulerResult<()> {
        let _guard = self.locks.lock(&metrics.worker_id).await;
        let mut worker = self.load(&metrics.worker_id).await?;

        worker.walltime_remaining_secs = metrics.walltime_remaining_secs;
        worker.metadata.insert(
            "metrics".to_string(),
            json!({
                "cpu_usage_percent": metrics.cpu_usage_percent,
                "memory_usage_percent": metrics.memory_usage_percent,
                "tasks_completed": metrics.tasks_completed,
                "tasks_failed": metrics.tasks_failed,
                "sent_at": metrics.sent_at,
            }),
        );
        worker.touch(Utc::now());
        self.worker_repo.update(&worker).await
    }

    /// 独占占用Worker
    pub async fn try_claim(&self, worker_id: &str, task_id: &str) -> SchedulerResult<bool> {
        let _guard = self.locks.lock(worker_id).await;
        let claimed = self.worker_repo.try_claim(worker_id, task_id, Utc::now()).await?;
        if claimed {
            debug!("Worker {} 已被任务 {} 占用", worker_id, task_id);
        }
        Ok(claimed)
    }

    /// 仅当Worker仍持有该任务时释放
    pub async fn release(&self, worker_id: &str, task_id: &str) -> SchedulerResult<bool> {
        let _guard = self.locks.lock(worker_id).await;
        let released = self.worker_repo.release(worker_id, task_id, Utc::now()).await?;
        if released {
            debug!("Worker {} 已释放任务 {}", worker_id, task_id);
        }
        Ok(released)
    }

    /// 在锁内复核心跳是否超时，超时则断开
    ///
    /// 返回 `None` 表示心跳已恢复、未做任何处理；
    /// 返回 `Some(task)` 表示已断开，`task` 为断开前持有的任务。
    pub async fn disconnect_if_stale(
        &self,
        worker_id: &str,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<Option<String>>> {
        let _guard = self.locks.lock(worker_id).await;
        let mut worker = self.load(worker_id).await?;

        if worker.connection_state != ConnectionState::Connected
            || !worker.is_heartbeat_expired(timeout, now)
        {
            return Ok(None);
        }

        let held = worker.disconnect();
        self.worker_repo.update(&worker).await?;
        warn!(
            "Worker {} 心跳超时 (上次心跳: {})，已标记为断开",
            worker.id,
            worker.last_heartbeat.format("%Y-%m-%d %H:%M:%S UTC")
        );
        Ok(Some(held))
    }

    /// 重启修复：自 `since` 之后没有任何消息的Worker一律断开
    ///
    /// 已断开且空闲的Worker不再写入，重复执行不产生变化。
    pub async fn disconnect_if_unseen_since(
        &self,
        worker_id: &str,
        since: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let _guard = self.locks.lock(worker_id).await;
        let mut worker = self.load(worker_id).await?;

        let last_heard = worker.last_seen_at.unwrap_or(worker.last_heartbeat);
        if last_heard >= since {
            return Ok(false);
        }
        if worker.connection_state == ConnectionState::Disconnected
            && worker.status == WorkerStatus::Idle
            && worker.current_task_id.is_none()
        {
            return Ok(false);
        }

        if let Some(task_id) = worker.disconnect() {
            debug!("Worker {} 断开时丢弃了任务 {}", worker.id, task_id);
        }
        self.worker_repo.update(&worker).await?;
        Ok(true)
    }

    /// 无条件断开，返回断开前持有的任务；已断开且空闲的Worker不再写入
    pub async fn disconnect(&self, worker_id: &str) -> SchedulerResult<Option<String>> {
        let _guard = self.locks.lock(worker_id).await;
        let mut worker = self.load(worker_id).await?;

        if worker.connection_state == ConnectionState::Disconnected
            && worker.status == WorkerStatus::Idle
            && worker.current_task_id.is_none()
        {
            return Ok(None);
        }

        let held = worker.disconnect();
        self.worker_repo.update(&worker).await?;
        info!("Worker {} 已标记为断开", worker.id);
        Ok(held)
    }

    /// 可分配给指定实验的Worker，按注册时间排序
    pub async fn usable_candidates(&self, experiment_id: &str) -> SchedulerResult<Vec<Worker>> {
        self.worker_repo.list_usable(experiment_id).await
    }

    pub async fn get_worker(&self, worker_id: &str) -> SchedulerResult<Option<Worker>> {
        self.worker_repo.get_by_id(worker_id).await
    }

    pub async fn list_workers(&self) -> SchedulerResult<Vec<Worker>> {
        self.worker_repo.list_all().await
    }

    pub async fn connected_workers(&self) -> SchedulerResult<Vec<Worker>> {
        self.worker_repo
            .list_by_connection(ConnectionState::Connected)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_domain::entities::WorkerCapabilities;
    use scheduler_testing_utils::{MockWorkerRepository, WorkerBuilder};
    use serde_json::Map;

    fn registration(worker_id: &str) -> WorkerRegistration {
        WorkerRegistration {
            worker_id: worker_id.to_string(),
            experiment_id: "exp-1".to_string(),
            compute_resource_id: "host-1".to_string(),
            capabilities: WorkerCapabilities {
                cpu_cores: 2,
                memory_mb: 1024,
                disk_gb: 10,
                gpus: 0,
                runtimes: vec!["sh".to_string()],
            },
            hostname: Some("node-17".to_string()),
        }
    }

    fn heartbeat(worker_id: &str, status: WorkerStatus, task: Option<&str>) -> WorkerHeartbeat {
        WorkerHeartbeat {
            worker_id: worker_id.to_string(),
            status,
            current_task_id: task.map(str::to_string),
            metadata: Map::new(),
            sent_at: Utc::now(),
        }
    }

    fn pool_with(workers: Vec<Worker>) -> (WorkerPool, Arc<MockWorkerRepository>) {
        let repo = Arc::new(MockWorkerRepository::with_workers(workers));
        (WorkerPool::new(repo.clone(), None), repo)
    }

    #[tokio::test]
    async fn test_register_then_idle_heartbeat_makes_worker_usable() {
        let (pool, _) = pool_with(vec![WorkerBuilder::new("w1").build()]);

        let worker = pool.register_worker(&registration("w1")).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Busy);
        assert_eq!(worker.connection_state, ConnectionState::Connected);
        assert_eq!(worker.capabilities.cpu_cores, 2);
        assert_eq!(worker.metadata["hostname"], "node-17");
        assert!(pool.usable_candidates("exp-1").await.unwrap().is_empty());

        let worker = pool
            .heartbeat(&heartbeat("w1", WorkerStatus::Idle, None))
            .await
            .unwrap();
        assert!(worker.is_usable());
        assert_eq!(pool.usable_candidates("exp-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_rejections() {
        let (pool, _) = pool_with(vec![
            WorkerBuilder::new("w1").build(),
            WorkerBuilder::new("live").connected().build(),
        ]);

        let mut empty = registration("w1");
        empty.experiment_id = String::new();
        assert!(pool.register_worker(&empty).await.is_err());

        assert!(pool.register_worker(&registration("ghost")).await.is_err());

        let mut wrong_exp = registration("w1");
        wrong_exp.experiment_id = "exp-2".to_string();
        assert!(pool.register_worker(&wrong_exp).await.is_err());

        let mut wrong_compute = registration("w1");
        wrong_compute.compute_resource_id = "host-9".to_string();
        assert!(pool.register_worker(&wrong_compute).await.is_err());

        let err = pool.register_worker(&registration("live")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::WorkerRegistration(_)));
    }

    #[tokio::test]
    async fn test_stale_connected_worker_may_register_again() {
        let (pool, _) = pool_with(vec![WorkerBuilder::new("w1")
            .connected()
            .heartbeat_ago(Duration::minutes(5))
            .build()]);
        assert!(pool.register_worker(&registration("w1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_heartbeat_reconnects_and_keeps_assignment() {
        let (pool, repo) = pool_with(vec![WorkerBuilder::new("w1")
            .heartbeat_ago(Duration::minutes(1))
            .busy_with("t1")
            .build()]);

        let worker = pool
            .heartbeat(&heartbeat("w1", WorkerStatus::Idle, None))
            .await
            .unwrap();
        assert_eq!(worker.connection_state, ConnectionState::Connected);
        // 分配记录以调度器为准，不因上报空闲而清除
        assert_eq!(worker.status, WorkerStatus::Busy);
        assert_eq!(worker.current_task_id.as_deref(), Some("t1"));
        assert!(repo.get_by_id("w1").await.unwrap().unwrap().last_heartbeat > Utc::now() - Duration::seconds(5));
    }

    #[tokio::test]
    async fn test_heartbeat_from_unregistered_worker_is_rejected() {
        let (pool, _) = pool_with(vec![WorkerBuilder::new("w1").build()]);
        assert!(pool
            .heartbeat(&heartbeat("w1", WorkerStatus::Idle, None))
            .await
            .is_err());
        assert!(matches!(
            pool.heartbeat(&heartbeat("nope", WorkerStatus::Idle, None)).await,
            Err(SchedulerError::WorkerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_if_stale_rechecks_under_lock() {
        let (pool, _) = pool_with(vec![
            WorkerBuilder::new("stale")
                .connected()
                .busy_with("t1")
                .heartbeat_ago(Duration::minutes(3))
                .build(),
            WorkerBuilder::new("fresh").connected().build(),
        ]);
        let now = Utc::now();

        let held = pool
            .disconnect_if_stale("stale", pool.heartbeat_timeout(), now)
            .await
            .unwrap();
        assert_eq!(held, Some(Some("t1".to_string())));
        let worker = pool.get_worker("stale").await.unwrap().unwrap();
        assert_eq!(worker.connection_state, ConnectionState::Disconnected);
        assert_eq!(worker.status, WorkerStatus::Idle);

        // 已断开的不重复处理
        assert_eq!(
            pool.disconnect_if_stale("stale", pool.heartbeat_timeout(), now)
                .await
                .unwrap(),
            None
        );
        assert_eq!(
            pool.disconnect_if_stale("fresh", pool.heartbeat_timeout(), now)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_metrics_update_walltime() {
        let (pool, _) = pool_with(vec![WorkerBuilder::new("w1").connected().build()]);
        pool.record_metrics(&WorkerMetrics {
            worker_id: "w1".to_string(),
            cpu_usage_percent: 12.5,
            memory_usage_percent: 40.0,
            walltime_remaining_secs: 1200,
            tasks_completed: 3,
            tasks_failed: 1,
            sent_at: Utc::now(),
        })
        .await
        .unwrap();

        let worker = pool.get_worker("w1").await.unwrap().unwrap();
        assert_eq!(worker.walltime_remaining_secs, 1200);
        assert_eq!(worker.metadata["metrics"]["tasks_failed"], 1);
    }
}
