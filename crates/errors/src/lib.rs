use thiserror::Error;

mod taxonomy;

pub use taxonomy::{AdapterError, AdapterErrorKind, FailureClass, FailureReason};

/// 调度引擎内部错误。任务失败的分类见 [`FailureClass`]
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),
    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },
    #[error("Worker未找到: {id}")]
    WorkerNotFound { id: String },
    #[error("数据暂存操作未找到: {id}")]
    StagingOperationNotFound { id: String },
    #[error("非法的状态转换: 任务 {task_id} 从 {from} 到 {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },
    #[error("没有可用的Worker: 任务 {task_id}")]
    NoCapacity { task_id: String },
    #[error("并发修改冲突: {entity} {id}")]
    ConcurrentModification { entity: String, id: String },
    #[error("Worker注册失败: {0}")]
    WorkerRegistration(String),
    #[error("适配器错误: {0}")]
    Adapter(#[from] AdapterError),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("内部错误: {0}")]
    Internal(String),
    #[error("数据验证失败: {0}")]
    ValidationError(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("权限不足: {0}")]
    Permission(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn worker_not_found<S: Into<String>>(id: S) -> Self {
        Self::WorkerNotFound { id: id.into() }
    }
    pub fn staging_not_found<S: Into<String>>(id: S) -> Self {
        Self::StagingOperationNotFound { id: id.into() }
    }
    pub fn invalid_transition<S: Into<String>>(task_id: S, from: &str, to: &str) -> Self {
        Self::InvalidTransition {
            task_id: task_id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
    pub fn concurrent_modification<S: Into<String>>(entity: &str, id: S) -> Self {
        Self::ConcurrentModification {
            entity: entity.to_string(),
            id: id.into(),
        }
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }
    pub fn registration_error<S: Into<String>>(msg: S) -> Self {
        Self::WorkerRegistration(msg.into())
    }
    pub fn timeout_error<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }
    /// 稍后重做同一操作可能成功
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::DatabaseOperation(_)
            | SchedulerError::Timeout(_)
            | SchedulerError::ConcurrentModification { .. } => true,
            SchedulerError::Adapter(err) => err.is_transient(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}
