use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 单例行的固定主键
pub const SCHEDULER_STATE_ID: &str = "scheduler";

/// 当前或最近一次运行的调度器实例状态
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerState {
    pub id: String,
    pub instance_id: String,
    pub status: SchedulerStatus,
    pub clean_shutdown: bool,
    pub startup_time: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub shutdown_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerStatus {
    Running,
    Stopped,
}

impl SchedulerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerStatus::Running => "RUNNING",
            SchedulerStatus::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for SchedulerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchedulerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(SchedulerStatus::Running),
            "STOPPED" => Ok(SchedulerStatus::Stopped),
            _ => Err(format!("Invalid scheduler status: {s}")),
        }
    }
}

impl SchedulerState {
    /// 新实例启动时写入的记录
    pub fn starting<S: Into<String>>(instance_id: S) -> Self {
        let now = Utc::now();
        Self {
            id: SCHEDULER_STATE_ID.to_string(),
            instance_id: instance_id.into(),
            status: SchedulerStatus::Running,
            clean_shutdown: false,
            startup_time: now,
            last_heartbeat: now,
            shutdown_time: None,
        }
    }

    /// 上一个实例没有走完优雅关闭流程
    pub fn indicates_crash(&self) -> bool {
        self.status == SchedulerStatus::Running && !self.clean_shutdown
    }

    pub fn is_heartbeat_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat > threshold
    }
}
