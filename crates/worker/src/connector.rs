use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use scheduler_dispatcher::WorkerSessionHandler;
use scheduler_domain::messaging::{SchedulerMessage, WorkerMessage};
use scheduler_errors::SchedulerResult;

/// 与调度器之间的一条双工连接
pub struct SchedulerLink {
    pub tx: mpsc::Sender<WorkerMessage>,
    pub rx: mpsc::Receiver<SchedulerMessage>,
}

/// 建立到调度器的连接，断线后由Agent重新调用
#[async_trait]
pub trait SchedulerConnector: Send + Sync {
    async fn connect(&self) -> SchedulerResult<SchedulerLink>;
}

/// 与调度器运行在同一进程内时使用
pub struct InProcessConnector {
    handler: Arc<WorkerSessionHandler>,
}

impl InProcessConnector {
    pub fn new(handler: Arc<WorkerSessionHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl SchedulerConnector for InProcessConnector {
    async fn connect(&self) -> SchedulerResult<SchedulerLink> {
        let session = self.handler.open_session();
        debug!("建立进程内调度器会话");
        Ok(SchedulerLink {
            tx: session.to_scheduler,
            rx: session.from_scheduler,
        })
    }
}
