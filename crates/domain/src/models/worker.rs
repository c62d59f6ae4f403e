use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::value_objects::{ResourceRequirements, WorkerCapabilities};

/// 绑定到一个计算资源和一个实验的远程执行代理
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Worker {
    pub id: String,
    pub compute_resource_id: String,
    pub experiment_id: String,
    pub user_id: String,
    pub status: WorkerStatus,
    pub connection_state: ConnectionState,
    pub current_task_id: Option<String>,
    pub walltime_secs: i64,
    pub walltime_remaining_secs: i64,
    pub capabilities: WorkerCapabilities,
    pub metadata: Map<String, Value>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Idle,
    Busy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "IDLE",
            WorkerStatus::Busy => "BUSY",
        }
    }
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDLE" => Ok(WorkerStatus::Idle),
            "BUSY" => Ok(WorkerStatus::Busy),
            _ => Err(format!("Invalid worker status: {s}")),
        }
    }
}

impl FromStr for ConnectionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECTED" => Ok(ConnectionState::Connected),
            "DISCONNECTED" => Ok(ConnectionState::Disconnected),
            _ => Err(format!("Invalid connection state: {s}")),
        }
    }
}

impl Worker {
    /// 供给流程预先创建的Worker记录，等待远端代理注册
    pub fn provisioned<I, E, C, U>(
        id: I,
        experiment_id: E,
        compute_resource_id: C,
        user_id: U,
        walltime_secs: i64,
    ) -> Self
    where
        I: Into<String>,
        E: Into<String>,
        C: Into<String>,
        U: Into<String>,
    {
        let now = Utc::now();
        Self {
            id: id.into(),
            compute_resource_id: compute_resource_id.into(),
            experiment_id: experiment_id.into(),
            user_id: user_id.into(),
            status: WorkerStatus::Idle,
            connection_state: ConnectionState::Disconnected,
            current_task_id: None,
            walltime_secs,
            walltime_remaining_secs: walltime_secs,
            capabilities: WorkerCapabilities::default(),
            metadata: Map::new(),
            registered_at: now,
            last_heartbeat: now,
            last_seen_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 只有空闲且在线的Worker可以被分配任务
    pub fn is_usable(&self) -> bool {
        self.status == WorkerStatus::Idle && self.connection_state == ConnectionState::Connected
    }

    pub fn can_run(&self, requirements: &ResourceRequirements) -> bool {
        self.capabilities.satisfies(requirements)
    }

    pub fn is_heartbeat_expired(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat > timeout
    }

    /// 刷新存活时间戳
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = now.max(self.registered_at);
        self.last_seen_at = Some(now);
        self.updated_at = now;
    }

    /// 断开并释放当前任务，返回被释放的任务ID
    pub fn disconnect(&mut self) -> Option<String> {
        self.connection_state = ConnectionState::Disconnected;
        self.status = WorkerStatus::Idle;
        self.updated_at = Utc::now();
        self.current_task_id.take()
    }
}
