#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Map;
use tokio::sync::mpsc;

use scheduler_config::WorkerAgentConfig;
use scheduler_domain::messaging::{SchedulerMessage, TaskAssignment, WorkerMessage};
use scheduler_domain::ports::{ComputeAdapter, JobHandle, JobState};
use scheduler_domain::ResourceType;
use scheduler_errors::{AdapterError, SchedulerError, SchedulerResult};
use scheduler_worker::{SchedulerConnector, SchedulerLink};

/// 调度器一侧的连接端
pub struct ServerEnd {
    pub from_worker: mpsc::Receiver<WorkerMessage>,
    pub to_worker: mpsc::Sender<SchedulerMessage>,
}

impl ServerEnd {
    /// 跳过周期性的心跳与任务请求，返回下一条其他消息
    pub async fn next_significant(&mut self) -> WorkerMessage {
        loop {
            let message = self.next().await;
            match message {
                WorkerMessage::Heartbeat(_) | WorkerMessage::TaskRequest { .. } => continue,
                other => return other,
            }
        }
    }

    pub async fn next(&mut self) -> WorkerMessage {
        tokio::time::timeout(Duration::from_secs(10), self.from_worker.recv())
            .await
            .expect("等待Worker消息超时")
            .expect("Worker连接已关闭")
    }

    pub async fn send(&self, message: SchedulerMessage) {
        self.to_worker.send(message).await.unwrap();
    }

    pub async fn accept_registration(&mut self) {
        match self.next().await {
            WorkerMessage::Register(registration) => {
                self.send(SchedulerMessage::RegistrationAck {
                    worker_id: registration.worker_id,
                    accepted: true,
                    message: None,
                })
                .await
            }
            other => panic!("expected register, got {other:?}"),
        }
    }
}

/// 每次连接都交给测试一对新的服务端通道
pub struct ScriptedConnector {
    connections: mpsc::UnboundedSender<ServerEnd>,
    refuse: Mutex<usize>,
    capacity: usize,
}

impl ScriptedConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        Self::with_capacity(256)
    }

    /// 连接两个方向的通道容量都是 `capacity`
    pub fn with_capacity(capacity: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                connections: tx,
                refuse: Mutex::new(0),
                capacity,
            }),
            rx,
        )
    }

    /// 接下来的 `count` 次连接直接失败
    pub fn refuse_next(&self, count: usize) {
        *self.refuse.lock().unwrap() = count;
    }
}

#[async_trait]
impl SchedulerConnector for ScriptedConnector {
    async fn connect(&self) -> SchedulerResult<SchedulerLink> {
        {
            let mut refuse = self.refuse.lock().unwrap();
            if *refuse > 0 {
                *refuse -= 1;
                return Err(SchedulerError::Internal("connection refused".to_string()));
            }
        }

        let (tx, from_worker) = mpsc::channel(self.capacity);
        let (to_worker, rx) = mpsc::channel(self.capacity);
        self.connections
            .send(ServerEnd {
                from_worker,
                to_worker,
            })
            .map_err(|_| SchedulerError::Internal("test server gone".to_string()))?;
        Ok(SchedulerLink { tx, rx })
    }
}

pub async fn accept(connections: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    tokio::time::timeout(Duration::from_secs(10), connections.recv())
        .await
        .expect("等待连接超时")
        .expect("connector dropped")
}

pub fn fast_config() -> WorkerAgentConfig {
    WorkerAgentConfig {
        heartbeat_interval_seconds: 1,
        task_request_interval_seconds: 1,
        server_unresponsive_timeout_seconds: 30,
        reconnect_backoff_ms: 20,
        job_poll_interval_ms: 20,
    }
}

pub fn assignment(task_id: &str, command: &str, work_dir: &Path) -> TaskAssignment {
    TaskAssignment {
        task_id: task_id.to_string(),
        experiment_id: "exp-1".to_string(),
        command: command.to_string(),
        work_dir: work_dir.display().to_string(),
        input_files: vec![],
        output_files: vec![],
        metadata: Map::new(),
    }
}

/// 作业一直运行直到被取消的计算资源
#[derive(Default)]
pub struct ManualCompute {
    submitted: Mutex<Vec<String>>,
    canceled: Mutex<Vec<String>>,
}

impl ManualCompute {
    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn canceled(&self) -> Vec<String> {
        self.canceled.lock().unwrap().clone()
    }
}

#[async_trait]
impl ComputeAdapter for ManualCompute {
    fn resource_id(&self) -> &str {
        "hpc-1"
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::Slurm
    }

    async fn generate_script(
        &self,
        task: &TaskAssignment,
        output_dir: &Path,
    ) -> Result<PathBuf, AdapterError> {
        Ok(output_dir.join(format!("{}.sbatch", task.task_id)))
    }

    async fn submit_task(&self, script_path: &Path) -> Result<JobHandle, AdapterError> {
        let mut submitted = self.submitted.lock().unwrap();
        let job_id = format!("job-{}", submitted.len() + 1);
        submitted.push(script_path.display().to_string());
        Ok(JobHandle {
            resource_id: "hpc-1".to_string(),
            job_id,
        })
    }

    async fn poll_job(&self, handle: &JobHandle) -> Result<JobState, AdapterError> {
        if self.canceled.lock().unwrap().contains(&handle.job_id) {
            Ok(JobState::Canceled)
        } else {
            Ok(JobState::Running)
        }
    }

    async fn cancel_job(&self, handle: &JobHandle) -> Result<(), AdapterError> {
        self.canceled.lock().unwrap().push(handle.job_id.clone());
        Ok(())
    }
}
