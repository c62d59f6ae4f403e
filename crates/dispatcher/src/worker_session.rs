use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use scheduler_domain::entities::WorkerStatus;
use scheduler_domain::messaging::{SchedulerMessage, WorkerMessage};
use scheduler_errors::SchedulerResult;

use crate::task_dispatcher::TaskDispatcher;
use crate::worker_channels::WorkerChannels;
use crate::worker_pool::WorkerPool;

/// Worker一侧持有的会话两端
pub struct WorkerSession {
    pub to_scheduler: mpsc::Sender<WorkerMessage>,
    pub from_scheduler: mpsc::Receiver<SchedulerMessage>,
    pub handle: JoinHandle<()>,
}

/// 调度器一侧的会话处理
///
/// 一条连接在收到第一条被接受的注册或心跳后绑定到该Worker，
/// 之后冒用其他Worker ID的消息一律丢弃。
pub struct WorkerSessionHandler {
    pool: Arc<WorkerPool>,
    dispatcher: Arc<TaskDispatcher>,
    channels: WorkerChannels,
    capacity: usize,
}

impl WorkerSessionHandler {
    pub fn new(dispatcher: Arc<TaskDispatcher>, capacity: usize) -> Self {
        Self {
            pool: Arc::clone(dispatcher.pool()),
            channels: dispatcher.channels().clone(),
            dispatcher,
            capacity: capacity.max(1),
        }
    }

    /// 建立一条进程内会话
    pub fn open_session(self: &Arc<Self>) -> WorkerSession {
        let (to_scheduler, inbound) = mpsc::channel(self.capacity);
        let (outbound, from_scheduler) = mpsc::channel(self.capacity);

        let handler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            handler.serve(inbound, outbound).await;
        });

        WorkerSession {
            to_scheduler,
            from_scheduler,
            handle,
        }
    }

    /// 处理一条连接直到对端关闭
    pub async fn serve(
        &self,
        mut inbound: mpsc::Receiver<WorkerMessage>,
        outbound: mpsc::Sender<SchedulerMessage>,
    ) {
        let mut bound: Option<String> = None;

        while let Some(message) = inbound.recv().await {
            if let Some(worker_id) = &bound {
                if message.worker_id() != worker_id {
                    warn!(
                        "连接已绑定Worker {}，丢弃来自 {} 的 {} 消息",
                        worker_id,
                        message.worker_id(),
                        message.kind()
                    );
                    continue;
                }
            }

            if let Err(e) = self.route(&message, &mut bound, &outbound).await {
                warn!(
                    "处理Worker {} 的 {} 消息失败: {}",
                    message.worker_id(),
                    message.kind(),
                    e
                );
            }
        }

        if let Some(worker_id) = bound {
            if self.channels.detach_if_same(&worker_id, &outbound) {
                info!("Worker {} 的连接已关闭", worker_id);
            }
        }
    }

    fn bind(&self, worker_id: &str, bound: &mut Option<String>, outbound: &mpsc::Sender<SchedulerMessage>) {
        if bound.is_none() {
            self.channels.attach(worker_id, outbound.clone());
            *bound = Some(worker_id.to_string());
        }
    }

    fn reply(&self, outbound: &mpsc::Sender<SchedulerMessage>, message: SchedulerMessage) {
        if let Err(e) = outbound.try_send(message) {
            warn!("回复Worker失败: {}", e);
        }
    }

    async fn route(
        &self,
        message: &WorkerMessage,
        bound: &mut Option<String>,
        outbound: &mpsc::Sender<SchedulerMessage>,
    ) -> SchedulerResult<()> {
        match message {
            WorkerMessage::Register(registration) => {
                match self.pool.register_worker(registration).await {
                    Ok(worker) => {
                        self.bind(&worker.id, bound, outbound);
                        self.reply(
                            outbound,
                            SchedulerMessage::RegistrationAck {
                                worker_id: worker.id.clone(),
                                accepted: true,
                                message: None,
                            },
                        );
                        info!("Worker {} 注册成功", worker.id);
                    }
                    Err(e) => {
                        warn!("拒绝Worker {} 的注册: {}", registration.worker_id, e);
                        self.reply(
                            outbound,
                            SchedulerMessage::RegistrationAck {
                                worker_id: registration.worker_id.clone(),
                                accepted: false,
                                message: Some(e.to_string()),
                            },
                        );
                    }
                }
                Ok(())
            }
            WorkerMessage::Heartbeat(heartbeat) => {
                let worker = self.pool.heartbeat(heartbeat).await?;
                self.bind(&worker.id, bound, outbound);
                self.reply(
                    outbound,
                    SchedulerMessage::HeartbeatAck {
                        worker_id: worker.id.clone(),
                        server_time: Utc::now(),
                    },
                );
                if worker.status == WorkerStatus::Idle {
                    self.dispatcher.wake();
                }
                Ok(())
            }
            WorkerMessage::Metrics(metrics) => self.pool.record_metrics(metrics).await,
            WorkerMessage::TaskRequest { worker_id } => {
                if bound.is_none() {
                    debug!("Worker {} 尚未完成注册，忽略任务请求", worker_id);
                    return Ok(());
                }
                self.dispatcher.handle_task_request(worker_id).await
            }
            WorkerMessage::TaskStatus(_) | WorkerMessage::TaskResult(_) => {
                self.dispatcher.handle_worker_message(message).await
            }
        }
    }
}
