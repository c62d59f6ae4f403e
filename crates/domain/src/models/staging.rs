use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_STAGING_TIMEOUT_SECS: i64 = 600;

/// 一次有向的数据搬运请求，属于且仅属于一个任务
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StagingOperation {
    pub id: String,
    pub task_id: String,
    pub worker_id: String,
    pub compute_resource_id: String,
    pub direction: StagingDirection,
    pub source_path: String,
    pub destination_path: String,
    pub status: StagingStatus,
    pub total_size: i64,
    /// 声明的sha256摘要，传输完成后据此校验
    pub expected_checksum: Option<String>,
    pub transferred_size: i64,
    pub attempts: u32,
    pub error_message: Option<String>,
    pub timeout_seconds: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StagingStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// 暂存方向：输入从存储到工作目录，输出从工作目录回到存储
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StagingDirection {
    Input,
    Output,
}

impl StagingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagingStatus::Pending => "PENDING",
            StagingStatus::Running => "RUNNING",
            StagingStatus::Completed => "COMPLETED",
            StagingStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StagingStatus::Completed | StagingStatus::Failed)
    }

    /// 状态单调：终态不可再转出
    pub fn can_transition_to(&self, next: StagingStatus) -> bool {
        matches!(
            (self, next),
            (StagingStatus::Pending, StagingStatus::Running)
                | (StagingStatus::Pending, StagingStatus::Failed)
                | (StagingStatus::Running, StagingStatus::Running)
                | (StagingStatus::Running, StagingStatus::Completed)
                | (StagingStatus::Running, StagingStatus::Failed)
        )
    }
}

impl StagingDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagingDirection::Input => "INPUT",
            StagingDirection::Output => "OUTPUT",
        }
    }
}

impl fmt::Display for StagingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for StagingDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StagingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(StagingStatus::Pending),
            "RUNNING" => Ok(StagingStatus::Running),
            "COMPLETED" => Ok(StagingStatus::Completed),
            "FAILED" => Ok(StagingStatus::Failed),
            _ => Err(format!("Invalid staging status: {s}")),
        }
    }
}

impl FromStr for StagingDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INPUT" => Ok(StagingDirection::Input),
            "OUTPUT" => Ok(StagingDirection::Output),
            _ => Err(format!("Invalid staging direction: {s}")),
        }
    }
}

impl StagingOperation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: &str,
        worker_id: &str,
        compute_resource_id: &str,
        direction: StagingDirection,
        source_path: &str,
        destination_path: &str,
        total_size: i64,
        timeout_seconds: i64,
    ) -> Self {
        let now = Utc::now();
        let nanos = now.timestamp_nanos_opt().unwrap_or_default();
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("staging_{task_id}_{nanos}_{}", &suffix[..8]),
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            compute_resource_id: compute_resource_id.to_string(),
            direction,
            source_path: source_path.to_string(),
            destination_path: destination_path.to_string(),
            status: StagingStatus::Pending,
            total_size,
            expected_checksum: None,
            transferred_size: 0,
            attempts: 0,
            error_message: None,
            timeout_seconds: if timeout_seconds > 0 {
                timeout_seconds
            } else {
                DEFAULT_STAGING_TIMEOUT_SECS
            },
            created_at: now,
            started_at: None,
            completed_at: None,
            last_heartbeat: None,
            updated_at: now,
        }
    }

    pub fn with_checksum(mut self, checksum: Option<String>) -> Self {
        self.expected_checksum = checksum.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn is_incomplete(&self) -> bool {
        !self.status.is_terminal()
    }

    /// 从开始时间算起是否已超出操作自身的超时时间
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        match self.started_at {
            Some(started) => now - started > Duration::seconds(self.timeout_seconds),
            None => false,
        }
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_size <= 0 {
            return if self.status == StagingStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        (self.transferred_size as f64 / self.total_size as f64 * 100.0).min(100.0)
    }
}
