//! 编排引擎各组件配置

use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};
use crate::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherConfig {
    pub enabled: bool,
    /// 调度循环间隔（毫秒）
    pub dispatch_interval_ms: u64,
    /// 每轮最多处理的排队任务数
    pub max_dispatch_batch: u32,
    /// 乐观锁冲突时的最大重试次数
    pub max_cas_retries: u32,
    /// 远端取消信号的投递超时（秒）
    pub cancel_timeout_seconds: u64,
    /// Worker工作目录根路径
    pub work_dir_base: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dispatch_interval_ms: 1000,
            max_dispatch_batch: 100,
            max_cas_retries: 5,
            cancel_timeout_seconds: 10,
            work_dir_base: "/tmp/scheduler/work".to_string(),
        }
    }
}

impl ConfigValidator for DispatcherConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_range(self.dispatch_interval_ms, 600_000, "dispatcher.dispatch_interval_ms")?;
        ValidationUtils::validate_count(self.max_dispatch_batch as usize, "dispatcher.max_dispatch_batch")?;
        ValidationUtils::validate_range(self.max_cas_retries as u64, 100, "dispatcher.max_cas_retries")?;
        ValidationUtils::validate_timeout_seconds(self.cancel_timeout_seconds, "dispatcher.cancel_timeout_seconds")?;
        ValidationUtils::validate_not_empty(&self.work_dir_base, "dispatcher.work_dir_base")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPoolConfig {
    /// 心跳超时阈值（秒）
    pub heartbeat_timeout_seconds: u64,
    /// 健康检查间隔（秒）
    pub health_check_interval_seconds: u64,
    /// 每个Worker下行通道容量
    pub channel_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_seconds: 120,
            health_check_interval_seconds: 30,
            channel_capacity: 64,
        }
    }
}

impl ConfigValidator for WorkerPoolConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_timeout_seconds(self.heartbeat_timeout_seconds, "worker_pool.heartbeat_timeout_seconds")?;
        ValidationUtils::validate_timeout_seconds(self.health_check_interval_seconds, "worker_pool.health_check_interval_seconds")?;
        ValidationUtils::validate_less_than(
            self.health_check_interval_seconds,
            self.heartbeat_timeout_seconds,
            "worker_pool.health_check_interval_seconds",
            "worker_pool.heartbeat_timeout_seconds",
        )?;
        ValidationUtils::validate_count(self.channel_capacity, "worker_pool.channel_capacity")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StagingConfig {
    /// 单个暂存操作默认超时（秒）
    pub default_timeout_seconds: u64,
    /// 临时传输错误的最大尝试次数
    pub max_attempts: u32,
    pub poll_interval_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// 终态操作的保留时长（小时）。缺省时永久保留，不启动清理任务
    pub retention_hours: Option<u64>,
    pub cleanup_interval_seconds: u64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 600,
            max_attempts: 5,
            poll_interval_ms: 500,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            retention_hours: None,
            cleanup_interval_seconds: 3600,
        }
    }
}

impl ConfigValidator for StagingConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_timeout_seconds(self.default_timeout_seconds, "staging.default_timeout_seconds")?;
        ValidationUtils::validate_range(self.max_attempts as u64, 100, "staging.max_attempts")?;
        ValidationUtils::validate_range(self.poll_interval_ms, 600_000, "staging.poll_interval_ms")?;
        ValidationUtils::validate_range(self.initial_backoff_ms, 600_000, "staging.initial_backoff_ms")?;
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::Validation(
                "staging.max_backoff_ms must be >= staging.initial_backoff_ms".to_string(),
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "staging.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        ValidationUtils::validate_timeout_seconds(self.cleanup_interval_seconds, "staging.cleanup_interval_seconds")?;
        if self.retention_hours == Some(0) {
            return Err(ConfigError::Validation(
                "staging.retention_hours must be > 0 when set".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryConfig {
    pub enabled: bool,
    /// 上一实例心跳超过该时长视为陈旧（秒），仅用于诊断日志
    pub stale_heartbeat_seconds: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_heartbeat_seconds: 60,
        }
    }
}

impl ConfigValidator for RecoveryConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_timeout_seconds(self.stale_heartbeat_seconds, "recovery.stale_heartbeat_seconds")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerStateConfig {
    pub heartbeat_interval_seconds: u64,
}

impl Default for SchedulerStateConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 15,
        }
    }
}

impl ConfigValidator for SchedulerStateConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_timeout_seconds(self.heartbeat_interval_seconds, "scheduler_state.heartbeat_interval_seconds")
    }
}

/// 远程Worker代理配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerAgentConfig {
    pub heartbeat_interval_seconds: u64,
    /// 空闲时请求任务的间隔
    pub task_request_interval_seconds: u64,
    /// 调度器无响应多久后自行停止接收任务
    pub server_unresponsive_timeout_seconds: u64,
    pub reconnect_backoff_ms: u64,
    pub job_poll_interval_ms: u64,
}

impl Default for WorkerAgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 10,
            task_request_interval_seconds: 5,
            server_unresponsive_timeout_seconds: 300, // 5分钟
            reconnect_backoff_ms: 1000,
            job_poll_interval_ms: 200,
        }
    }
}

impl ConfigValidator for WorkerAgentConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_timeout_seconds(self.heartbeat_interval_seconds, "worker_agent.heartbeat_interval_seconds")?;
        ValidationUtils::validate_timeout_seconds(self.task_request_interval_seconds, "worker_agent.task_request_interval_seconds")?;
        ValidationUtils::validate_timeout_seconds(
            self.server_unresponsive_timeout_seconds,
            "worker_agent.server_unresponsive_timeout_seconds",
        )?;
        ValidationUtils::validate_less_than(
            self.heartbeat_interval_seconds,
            self.server_unresponsive_timeout_seconds,
            "worker_agent.heartbeat_interval_seconds",
            "worker_agent.server_unresponsive_timeout_seconds",
        )?;
        ValidationUtils::validate_range(self.reconnect_backoff_ms, 600_000, "worker_agent.reconnect_backoff_ms")?;
        ValidationUtils::validate_range(self.job_poll_interval_ms, 600_000, "worker_agent.job_poll_interval_ms")?;
        Ok(())
    }
}
