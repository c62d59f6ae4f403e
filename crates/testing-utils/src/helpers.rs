//! 等待条件成立与测试日志初始化

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use scheduler_domain::entities::{Task, TaskStatus};
use scheduler_domain::repositories::TaskRepository;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct TestEnv;

impl TestEnv {
    /// 轮询直到条件成立或超时，超时前最后再判断一次
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition().await {
                return true;
            }
            sleep(POLL_INTERVAL).await;
        }
        condition().await
    }

    /// 等待任务进入 `status`。任务先停在其他终止状态时立即返回该状态的任务
    pub async fn wait_for_task_status(
        repo: &dyn TaskRepository,
        task_id: &str,
        status: TaskStatus,
        timeout: Duration,
    ) -> Option<Task> {
        let deadline = Instant::now() + timeout;
        loop {
            let task = repo.get_by_id(task_id).await.ok().flatten();
            if let Some(task) = &task {
                if task.status == status || task.is_terminal() {
                    return Some(task.clone());
                }
            }
            if Instant::now() >= deadline {
                return task;
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

pub struct IntegrationTestSetup;

impl IntegrationTestSetup {
    /// 每个测试二进制只会生效一次
    pub fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug,sqlx=warn")
            .try_init();
    }
}
