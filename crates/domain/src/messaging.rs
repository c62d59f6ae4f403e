//! 调度器与远程Worker之间的双工消息
//!
//! 上行（Worker -> 调度器）：注册、心跳、指标、任务请求、任务状态、任务结果；
//! 下行（调度器 -> Worker）：注册确认、心跳确认、任务分配、取消、关闭。
//! 编码方式不做约定，这里只定义带标签的消息变体。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use scheduler_errors::FailureClass;

use crate::models::{TaskStatus, WorkerStatus};
use crate::value_objects::{FileMetadata, WorkerCapabilities};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Register(WorkerRegistration),
    Heartbeat(WorkerHeartbeat),
    Metrics(WorkerMetrics),
    TaskRequest { worker_id: String },
    TaskStatus(TaskStatusUpdate),
    TaskResult(TaskResultReport),
}

impl WorkerMessage {
    pub fn worker_id(&self) -> &str {
        match self {
            WorkerMessage::Register(m) => &m.worker_id,
            WorkerMessage::Heartbeat(m) => &m.worker_id,
            WorkerMessage::Metrics(m) => &m.worker_id,
            WorkerMessage::TaskRequest { worker_id } => worker_id,
            WorkerMessage::TaskStatus(m) => &m.worker_id,
            WorkerMessage::TaskResult(m) => &m.worker_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Register(_) => "register",
            WorkerMessage::Heartbeat(_) => "heartbeat",
            WorkerMessage::Metrics(_) => "metrics",
            WorkerMessage::TaskRequest { .. } => "task_request",
            WorkerMessage::TaskStatus(_) => "task_status",
            WorkerMessage::TaskResult(_) => "task_result",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub experiment_id: String,
    pub compute_resource_id: String,
    pub capabilities: WorkerCapabilities,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub current_task_id: Option<String>,
    pub metadata: Map<String, Value>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub worker_id: String,
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub walltime_remaining_secs: i64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub sent_at: DateTime<Utc>,
}

/// Worker上报的中间状态，例如 Running、OutputStaging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusUpdate {
    pub worker_id: String,
    pub task_id: String,
    pub status: TaskStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultReport {
    pub worker_id: String,
    pub task_id: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
    /// 由适配器层给出的失败分类；缺省视为执行失败
    pub failure_class: Option<FailureClass>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerMessage {
    RegistrationAck {
        worker_id: String,
        accepted: bool,
        message: Option<String>,
    },
    HeartbeatAck {
        worker_id: String,
        server_time: DateTime<Utc>,
    },
    TaskAssignment(TaskAssignment),
    CancelTask {
        task_id: String,
        reason: String,
    },
    Shutdown {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: String,
    pub experiment_id: String,
    pub command: String,
    /// Worker本地可见的工作目录
    pub work_dir: String,
    pub input_files: Vec<FileMetadata>,
    pub output_files: Vec<FileMetadata>,
    pub metadata: Map<String, Value>,
}
