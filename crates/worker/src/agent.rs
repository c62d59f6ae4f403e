use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Map;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use scheduler_config::WorkerAgentConfig;
use scheduler_domain::entities::{WorkerCapabilities, WorkerStatus};
use scheduler_domain::messaging::{
    SchedulerMessage, TaskAssignment, TaskResultReport, TaskStatusUpdate, WorkerHeartbeat,
    WorkerMessage, WorkerRegistration,
};
use scheduler_domain::ports::ComputeAdapter;
use scheduler_domain::TaskStatus;
use scheduler_errors::FailureClass;

use crate::components::{JobEvent, JobRunner, RunningJob};
use crate::connector::{SchedulerConnector, SchedulerLink};

#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    pub worker_id: String,
    pub experiment_id: String,
    pub compute_resource_id: String,
    pub capabilities: WorkerCapabilities,
    pub hostname: Option<String>,
}

impl WorkerIdentity {
    pub fn new<W, E, C>(worker_id: W, experiment_id: E, compute_resource_id: C) -> Self
    where
        W: Into<String>,
        E: Into<String>,
        C: Into<String>,
    {
        Self {
            worker_id: worker_id.into(),
            experiment_id: experiment_id.into(),
            compute_resource_id: compute_resource_id.into(),
            capabilities: WorkerCapabilities::default(),
            hostname: hostname::get().ok().and_then(|h| h.into_string().ok()),
        }
    }

    pub fn with_capabilities(mut self, capabilities: WorkerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Agent退出原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentExit {
    /// 调度器要求关闭
    Shutdown { reason: String },
    /// 调度器注册时拒绝了本Worker
    Rejected { reason: String },
    /// 超过无响应时限，已自行转为空闲
    ServerUnresponsive,
    /// 本地关闭信号
    Stopped,
}

/// 单次运行期间的连接与任务状态
struct Session {
    link: Option<SchedulerLink>,
    registered: bool,
    current: Option<RunningJob>,
    pending: VecDeque<WorkerMessage>,
    last_contact: Instant,
}

enum Step {
    Inbound(Option<SchedulerMessage>),
    Job(JobEvent),
    Heartbeat,
    RequestTask,
    Silent,
    Stop,
}

/// 运行在计算资源上的Worker代理
///
/// 负责注册、心跳、请求并执行任务。调度器超过时限没有任何消息时，
/// 取消正在执行的作业，本地转为空闲后退出。
pub struct WorkerAgent {
    identity: WorkerIdentity,
    runner: Arc<JobRunner>,
    config: WorkerAgentConfig,
    status_tx: watch::Sender<WorkerStatus>,
}

impl WorkerAgent {
    pub fn new(
        identity: WorkerIdentity,
        compute: Arc<dyn ComputeAdapter>,
        config: Option<WorkerAgentConfig>,
    ) -> Self {
        let config = config.unwrap_or_default();
        let runner = JobRunner::new(
            identity.worker_id.clone(),
            compute,
            Duration::from_millis(config.job_poll_interval_ms.max(1)),
        );
        let (status_tx, _) = watch::channel(WorkerStatus::Idle);
        Self {
            identity,
            runner: Arc::new(runner),
            config,
            status_tx,
        }
    }

    /// 工作目录映射到本机 `root` 之下
    pub fn with_filesystem_root<P: Into<PathBuf>>(self, root: P) -> Self {
        let runner = JobRunner::new(
            self.identity.worker_id.clone(),
            Arc::clone(self.runner.compute()),
            Duration::from_millis(self.config.job_poll_interval_ms.max(1)),
        )
        .with_filesystem_root(root);
        Self {
            runner: Arc::new(runner),
            ..self
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.identity.worker_id
    }

    /// 本地视角的Worker状态
    pub fn status(&self) -> WorkerStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<WorkerStatus> {
        self.status_tx.subscribe()
    }

    fn unresponsive_timeout(&self) -> Duration {
        Duration::from_secs(self.config.server_unresponsive_timeout_seconds)
    }

    /// 运行直到调度器要求关闭、注册被拒、调度器无响应或收到本地关闭信号
    pub async fn run(
        &self,
        connector: &dyn SchedulerConnector,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> AgentExit {
        info!(
            "Worker {} 启动 (实验 {}, 计算资源 {})",
            self.identity.worker_id, self.identity.experiment_id, self.identity.compute_resource_id
        );

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut session = Session {
            link: None,
            registered: false,
            current: None,
            pending: VecDeque::new(),
            last_contact: Instant::now(),
        };

        let mut heartbeat = interval(Duration::from_secs(self.config.heartbeat_interval_seconds.max(1)));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut task_request = interval(Duration::from_secs(
            self.config.task_request_interval_seconds.max(1),
        ));
        task_request.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let reconnect_backoff = Duration::from_millis(self.config.reconnect_backoff_ms.max(1));

        loop {
            if session.last_contact.elapsed() >= self.unresponsive_timeout() {
                return self.go_idle(&mut session).await;
            }

            if session.link.is_none() {
                match connector.connect().await {
                    Ok(link) => {
                        session.link = Some(link);
                        self.greet(&mut session);
                    }
                    Err(e) => {
                        warn!("Worker {} 连接调度器失败: {}", self.identity.worker_id, e);
                        tokio::select! {
                            _ = tokio::time::sleep(reconnect_backoff) => {}
                            _ = shutdown_rx.recv() => return self.stop(&mut session).await,
                            Some(event) = events_rx.recv() => self.on_job_event(&mut session, event).await,
                        }
                        continue;
                    }
                }
            }

            let idle = session.current.is_none() && session.registered;
            let deadline = session.last_contact + self.unresponsive_timeout();
            let step = match session.link.as_mut() {
                Some(link) => tokio::select! {
                    message = link.rx.recv() => Step::Inbound(message),
                    Some(event) = events_rx.recv() => Step::Job(event),
                    _ = heartbeat.tick() => Step::Heartbeat,
                    _ = task_request.tick(), if idle => Step::RequestTask,
                    _ = tokio::time::sleep_until(deadline) => Step::Silent,
                    _ = shutdown_rx.recv() => Step::Stop,
                },
                None => continue,
            };

            match step {
                Step::Inbound(Some(message)) => {
                    session.last_contact = Instant::now();
                    if let Some(exit) = self.on_scheduler_message(&mut session, message, &events_tx).await {
                        return exit;
                    }
                }
                Step::Inbound(None) => {
                    warn!("Worker {} 与调度器的连接已断开，准备重连", self.identity.worker_id);
                    session.link = None;
                    tokio::select! {
                        _ = tokio::time::sleep(reconnect_backoff) => {}
                        _ = shutdown_rx.recv() => return self.stop(&mut session).await,
                    }
                }
                Step::Job(event) => self.on_job_event(&mut session, event).await,
                Step::Heartbeat => {
                    self.flush_pending(&mut session);
                    let message = self.heartbeat_message(&session);
                    self.deliver(&mut session, message, false);
                }
                Step::RequestTask => {
                    let message = WorkerMessage::TaskRequest {
                        worker_id: self.identity.worker_id.clone(),
                    };
                    self.deliver(&mut session, message, false);
                }
                Step::Silent => return self.go_idle(&mut session).await,
                Step::Stop => return self.stop(&mut session).await,
            }
        }
    }

    /// 首次连接发送注册，重连时发送心跳刷新已有记录，并补发离线期间积压的上报
    fn greet(&self, session: &mut Session) {
        let hello = if session.registered {
            self.heartbeat_message(session)
        } else {
            WorkerMessage::Register(WorkerRegistration {
                worker_id: self.identity.worker_id.clone(),
                experiment_id: self.identity.experiment_id.clone(),
                compute_resource_id: self.identity.compute_resource_id.clone(),
                capabilities: self.identity.capabilities.clone(),
                hostname: self.identity.hostname.clone(),
            })
        };
        self.deliver(session, hello, false);
        self.flush_pending(session);
    }

    fn heartbeat_message(&self, session: &Session) -> WorkerMessage {
        let current_task_id = session.current.as_ref().map(|job| job.task_id.clone());
        WorkerMessage::Heartbeat(WorkerHeartbeat {
            worker_id: self.identity.worker_id.clone(),
            status: if current_task_id.is_some() {
                WorkerStatus::Busy
            } else {
                WorkerStatus::Idle
            },
            current_task_id,
            metadata: Map::new(),
            sent_at: Utc::now(),
        })
    }

    /// 发送一条消息，从不等待调度器读取
    ///
    /// `durable` 的消息按序进入积压队列，连接断开或对端积压时留待之后补发；
    /// 其余消息在发不出去时直接丢弃，下一个周期会重新产生。
    fn deliver(&self, session: &mut Session, message: WorkerMessage, durable: bool) {
        if durable {
            session.pending.push_back(message);
            self.flush_pending(session);
            return;
        }
        let Some(link) = session.link.as_ref() else {
            return;
        };
        match link.tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                debug!("调度器未及时读取，丢弃 {} 消息", message.kind());
            }
            Err(TrySendError::Closed(message)) => {
                warn!("发送 {} 消息失败，连接已断开", message.kind());
                session.link = None;
            }
        }
    }

    /// 按序补发积压的上报，遇到对端积压或断线即停
    fn flush_pending(&self, session: &mut Session) {
        while let Some(message) = session.pending.pop_front() {
            let Some(link) = session.link.as_ref() else {
                session.pending.push_front(message);
                return;
            };
            match link.tx.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(message)) => {
                    session.pending.push_front(message);
                    return;
                }
                Err(TrySendError::Closed(message)) => {
                    warn!("补发 {} 消息失败，连接已断开", message.kind());
                    session.pending.push_front(message);
                    session.link = None;
                    return;
                }
            }
        }
    }

    async fn on_scheduler_message(
        &self,
        session: &mut Session,
        message: SchedulerMessage,
        events: &mpsc::UnboundedSender<JobEvent>,
    ) -> Option<AgentExit> {
        match message {
            SchedulerMessage::RegistrationAck {
                accepted, message, ..
            } => {
                if !accepted {
                    let reason = message.unwrap_or_else(|| "注册被拒绝".to_string());
                    error!("Worker {} 注册被拒绝: {}", self.identity.worker_id, reason);
                    self.cancel_current(session).await;
                    return Some(AgentExit::Rejected { reason });
                }
                if !session.registered {
                    info!("Worker {} 注册成功", self.identity.worker_id);
                }
                session.registered = true;
                // 注册后仍处于Busy，首个空闲心跳才开放分配
                let message = self.heartbeat_message(session);
                self.deliver(session, message, false);
            }
            SchedulerMessage::HeartbeatAck { server_time, .. } => {
                debug!("收到心跳确认: {}", server_time);
            }
            SchedulerMessage::TaskAssignment(assignment) => {
                self.on_assignment(session, assignment, events).await;
            }
            SchedulerMessage::CancelTask { task_id, reason } => {
                match session.current.as_ref() {
                    Some(job) if job.task_id == task_id => {
                        info!("取消任务 {}: {}", task_id, reason);
                        self.cancel_current(session).await;
                        let message = self.heartbeat_message(session);
                        self.deliver(session, message, false);
                    }
                    _ => debug!("忽略对非当前任务 {} 的取消", task_id),
                }
            }
            SchedulerMessage::Shutdown { reason } => {
                info!("调度器要求Worker {} 关闭: {}", self.identity.worker_id, reason);
                self.cancel_current(session).await;
                return Some(AgentExit::Shutdown { reason });
            }
        }
        None
    }

    async fn on_assignment(
        &self,
        session: &mut Session,
        assignment: TaskAssignment,
        events: &mpsc::UnboundedSender<JobEvent>,
    ) {
        if let Some(job) = session.current.as_ref() {
            if job.task_id == assignment.task_id {
                debug!("任务 {} 已在执行，忽略重复下发", assignment.task_id);
                return;
            }
            warn!(
                "Worker {} 正在执行任务 {}，退回任务 {}",
                self.identity.worker_id, job.task_id, assignment.task_id
            );
            let report = TaskResultReport {
                worker_id: self.identity.worker_id.clone(),
                task_id: assignment.task_id,
                success: false,
                exit_code: None,
                output: None,
                error: Some(format!("Worker正在执行任务 {}", job.task_id)),
                failure_class: Some(FailureClass::SchedulerCaused),
                duration_ms: 0,
            };
            self.deliver(session, WorkerMessage::TaskResult(report), true);
            return;
        }

        info!("Worker {} 开始执行任务 {}", self.identity.worker_id, assignment.task_id);
        session.current = Some(self.runner.spawn(assignment, events.clone()));
        self.status_tx.send_replace(WorkerStatus::Busy);
    }

    async fn on_job_event(&self, session: &mut Session, event: JobEvent) {
        match event {
            JobEvent::Started { task_id } => {
                if !Self::holds(session, &task_id) {
                    return;
                }
                let update = TaskStatusUpdate {
                    worker_id: self.identity.worker_id.clone(),
                    task_id,
                    status: TaskStatus::Running,
                    message: None,
                };
                self.deliver(session, WorkerMessage::TaskStatus(update), true);
            }
            JobEvent::Finished(report) => {
                if !Self::holds(session, &report.task_id) {
                    debug!("丢弃已取消任务 {} 的结果", report.task_id);
                    return;
                }
                session.current = None;
                self.status_tx.send_replace(WorkerStatus::Idle);
                self.deliver(session, WorkerMessage::TaskResult(report), true);

                let request = WorkerMessage::TaskRequest {
                    worker_id: self.identity.worker_id.clone(),
                };
                self.deliver(session, request, false);
            }
        }
    }

    fn holds(session: &Session, task_id: &str) -> bool {
        session
            .current
            .as_ref()
            .is_some_and(|job| job.task_id == task_id)
    }

    /// 取消当前作业并等待执行协程退出
    async fn cancel_current(&self, session: &mut Session) {
        if let Some(mut job) = session.current.take() {
            job.cancel();
            job.join().await;
        }
        self.status_tx.send_replace(WorkerStatus::Idle);
    }

    /// 调度器长时间无响应：停止执行并本地转为空闲
    async fn go_idle(&self, session: &mut Session) -> AgentExit {
        warn!(
            "调度器超过 {} 秒无响应，Worker {} 停止接收任务",
            self.config.server_unresponsive_timeout_seconds, self.identity.worker_id
        );
        self.cancel_current(session).await;
        self.farewell(session);
        AgentExit::ServerUnresponsive
    }

    async fn stop(&self, session: &mut Session) -> AgentExit {
        info!("Worker {} 收到关闭信号", self.identity.worker_id);
        self.cancel_current(session).await;
        self.farewell(session);
        AgentExit::Stopped
    }

    /// 尽力发送最后一个空闲心跳，连接不可用时直接放弃
    fn farewell(&self, session: &mut Session) {
        let message = self.heartbeat_message(session);
        if let Some(link) = session.link.take() {
            if let Err(e) = link.tx.try_send(message) {
                debug!("最后的心跳未能发出: {}", e);
            }
        }
    }
}
