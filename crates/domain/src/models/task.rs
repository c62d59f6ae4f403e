use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use scheduler_errors::{SchedulerError, SchedulerResult};

use crate::value_objects::{FileMetadata, ResourceRequirements};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// 元数据中保存工作目录的键
pub const WORK_DIR_KEY: &str = "work_dir";

/// 实验中一个参数组合对应的任务
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub experiment_id: String,
    pub command: String,
    pub input_files: Vec<FileMetadata>,
    pub output_files: Vec<FileMetadata>,
    pub requirements: ResourceRequirements,
    pub compute_resource_id: Option<String>,
    pub worker_id: Option<String>,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub staging_started_at: Option<DateTime<Utc>>,
    pub staging_completed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Map<String, Value>,
    /// 乐观锁版本号，每次持久化状态变更后递增
    pub version: i64,
}

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Created,
    Queued,
    DataStaging,
    EnvSetup,
    Running,
    OutputStaging,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 9] = [
        TaskStatus::Created,
        TaskStatus::Queued,
        TaskStatus::DataStaging,
        TaskStatus::EnvSetup,
        TaskStatus::Running,
        TaskStatus::OutputStaging,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "CREATED",
            TaskStatus::Queued => "QUEUED",
            TaskStatus::DataStaging => "DATA_STAGING",
            TaskStatus::EnvSetup => "ENV_SETUP",
            TaskStatus::Running => "RUNNING",
            TaskStatus::OutputStaging => "OUTPUT_STAGING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    /// 持有Worker、处于执行链路中的状态
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::DataStaging
                | TaskStatus::EnvSetup
                | TaskStatus::Running
                | TaskStatus::OutputStaging
        )
    }

    /// 状态转换表。失败与取消可从任意非终态到达；回到Queued只允许从执行中的状态发生。
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        match (*self, next) {
            (Created, Queued)
            | (Queued, DataStaging)
            | (Queued, Running)
            | (DataStaging, EnvSetup)
            | (EnvSetup, Running)
            | (Running, OutputStaging)
            | (Running, Completed)
            | (OutputStaging, Completed) => true,
            (from, Failed) | (from, Canceled) => !from.is_terminal(),
            (from, Queued) => from.is_active(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Invalid task status: {s}"))
    }
}

impl Task {
    pub fn new<I, E, C>(id: I, experiment_id: E, command: C) -> Self
    where
        I: Into<String>,
        E: Into<String>,
        C: Into<String>,
    {
        let now = Utc::now();
        Self {
            id: id.into(),
            experiment_id: experiment_id.into(),
            command: command.into(),
            input_files: Vec::new(),
            output_files: Vec::new(),
            requirements: ResourceRequirements::default(),
            compute_resource_id: None,
            worker_id: None,
            status: TaskStatus::Created,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            staging_started_at: None,
            staging_completed_at: None,
            completed_at: None,
            metadata: Map::new(),
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn work_dir(&self) -> Option<&str> {
        self.metadata.get(WORK_DIR_KEY).and_then(Value::as_str)
    }

    pub fn set_work_dir<S: Into<String>>(&mut self, dir: S) {
        self.metadata
            .insert(WORK_DIR_KEY.to_string(), Value::String(dir.into()));
    }

    /// 执行一次前向状态转换并维护时间戳
    pub fn transition_to(&mut self, next: TaskStatus) -> SchedulerResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(SchedulerError::invalid_transition(
                &self.id,
                self.status.as_str(),
                next.as_str(),
            ));
        }

        let now = Utc::now();
        match next {
            TaskStatus::DataStaging => self.staging_started_at = Some(now),
            TaskStatus::EnvSetup => self.staging_completed_at = Some(now),
            TaskStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
            }
            TaskStatus::Queued => {
                self.worker_id = None;
                self.compute_resource_id = None;
                self.completed_at = None;
            }
            _ => {}
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
            self.worker_id = None;
        }

        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// 重新排队。`charge_retry` 为 false 时不计入重试次数（调度器原因）。
    pub fn requeue(&mut self, charge_retry: bool) -> SchedulerResult<()> {
        if self.status == TaskStatus::Queued {
            self.worker_id = None;
            self.compute_resource_id = None;
            self.updated_at = Utc::now();
        } else {
            self.transition_to(TaskStatus::Queued)?;
        }
        if charge_retry {
            self.retry_count = (self.retry_count + 1).min(self.max_retries);
        }
        Ok(())
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// 是否处于"已分配但未确认"状态，重启后需要修复
    pub fn looks_assigned(&self) -> bool {
        self.status.is_active() || (self.status == TaskStatus::Queued && self.worker_id.is_some())
    }
}
