use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use scheduler_config::SchedulerStateConfig;
use scheduler_domain::entities::{SchedulerState, SchedulerStatus};
use scheduler_domain::repositories::SchedulerStateRepository;
use scheduler_errors::SchedulerResult;

/// 维护调度器单例状态行：启动登记、周期心跳、优雅关闭标记
pub struct SchedulerStateManager {
    state_repo: Arc<dyn SchedulerStateRepository>,
    instance_id: String,
    started_at: DateTime<Utc>,
    config: SchedulerStateConfig,
}

impl SchedulerStateManager {
    pub fn new<S: Into<String>>(
        state_repo: Arc<dyn SchedulerStateRepository>,
        instance_id: S,
        config: Option<SchedulerStateConfig>,
    ) -> Self {
        Self {
            state_repo,
            instance_id: instance_id.into(),
            started_at: Utc::now(),
            config: config.unwrap_or_default(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub async fn current(&self) -> SchedulerResult<Option<SchedulerState>> {
        self.state_repo.get().await
    }

    /// 写入本实例的运行记录
    pub async fn start(&self) -> SchedulerResult<SchedulerState> {
        let state = SchedulerState {
            startup_time: self.started_at,
            ..SchedulerState::starting(self.instance_id.as_str())
        };
        self.state_repo.upsert(&state).await?;
        info!("调度器实例 {} 已登记", self.instance_id);
        Ok(state)
    }

    /// 刷新一次心跳，返回状态行是否仍属于本实例
    pub async fn heartbeat_once(&self) -> SchedulerResult<bool> {
        let owned = self
            .state_repo
            .update_heartbeat(&self.instance_id, Utc::now())
            .await?;
        if !owned {
            warn!("调度器状态行已不属于实例 {}", self.instance_id);
        }
        Ok(owned)
    }

    /// 后台心跳，收到关闭信号后退出
    pub fn start_heartbeat(self: &Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_secs(manager.config.heartbeat_interval_seconds.max(1));
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = manager.heartbeat_once().await {
                            error!("刷新调度器心跳失败: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("调度器心跳随关闭信号退出");
                        break;
                    }
                }
            }
        })
    }

    /// 优雅关闭时调用，下次启动据此跳过崩溃修复
    pub async fn mark_clean_shutdown(&self) -> SchedulerResult<bool> {
        let marked = self
            .state_repo
            .mark_clean_shutdown(&self.instance_id, Utc::now())
            .await?;
        if marked {
            info!("调度器实例 {} 已标记为正常关闭", self.instance_id);
        } else {
            warn!("调度器实例 {} 标记正常关闭失败：状态行已被其他实例接管", self.instance_id);
        }
        Ok(marked)
    }

    /// 状态行是否已经是本实例的运行记录
    pub fn is_own_running_state(&self, state: &SchedulerState) -> bool {
        state.instance_id == self.instance_id && state.status == SchedulerStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_testing_utils::MockSchedulerStateRepository;

    #[tokio::test]
    async fn test_lifecycle() {
        let repo = Arc::new(MockSchedulerStateRepository::new());
        let manager = SchedulerStateManager::new(repo.clone(), "instance-a", None);

        let state = manager.start().await.unwrap();
        assert!(manager.is_own_running_state(&state));
        assert!(manager.heartbeat_once().await.unwrap());

        assert!(manager.mark_clean_shutdown().await.unwrap());
        let stored = repo.current().unwrap();
        assert!(stored.clean_shutdown);
        assert_eq!(stored.status, SchedulerStatus::Stopped);
        assert!(!stored.indicates_crash());
    }

    #[tokio::test]
    async fn test_heartbeat_of_replaced_instance() {
        let repo = Arc::new(MockSchedulerStateRepository::with_state(SchedulerState::starting(
            "instance-b",
        )));
        let manager = SchedulerStateManager::new(repo, "instance-a", None);
        assert!(!manager.heartbeat_once().await.unwrap());
        assert!(!manager.mark_clean_shutdown().await.unwrap());
    }

    #[tokio::test]
    async fn test_background_heartbeat_stops_on_shutdown() {
        let repo = Arc::new(MockSchedulerStateRepository::new());
        let manager = Arc::new(SchedulerStateManager::new(
            repo,
            "instance-a",
            Some(SchedulerStateConfig {
                heartbeat_interval_seconds: 1,
            }),
        ));
        manager.start().await.unwrap();

        let (tx, rx) = broadcast::channel(1);
        let handle = manager.start_heartbeat(rx);
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
