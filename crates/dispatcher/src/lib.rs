//! 调度引擎核心
//!
//! 任务状态机与调度循环、数据暂存跟踪、Worker池与失联检测、
//! 启动恢复以及与远程Worker之间的会话通道。

pub mod keyed_lock;
pub mod recovery_service;
pub mod retry_policy;
pub mod scheduler_state;
pub mod staging_tracker;
pub mod task_dispatcher;
pub mod worker_channels;
pub mod worker_failure_detector;
pub mod worker_pool;
pub mod worker_session;

#[cfg(test)]
pub mod test_utils;

pub use recovery_service::{RecoveryManager, RecoveryReport, RecoveryService};
pub use retry_policy::RetryPolicy;
pub use scheduler_state::SchedulerStateManager;
pub use staging_tracker::{StagingStats, StagingTracker};
pub use task_dispatcher::{
    DispatchCycleReport, ExperimentStatus, ExperimentSummary, TaskDispatchService, TaskDispatcher,
};
pub use worker_channels::WorkerChannels;
pub use worker_failure_detector::{
    FailureDetectionReport, WorkerFailureDetector, WorkerFailureDetectorService,
};
pub use worker_pool::WorkerPool;
pub use worker_session::{WorkerSession, WorkerSessionHandler};
