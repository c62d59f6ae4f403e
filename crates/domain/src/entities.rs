//! 领域实体统一出口

pub use crate::models::{
    ConnectionState, SchedulerState, SchedulerStatus, StagingDirection, StagingOperation,
    StagingStatus, Task, TaskStatus, Worker, WorkerStatus, DEFAULT_MAX_RETRIES,
    DEFAULT_STAGING_TIMEOUT_SECS, SCHEDULER_STATE_ID, WORK_DIR_KEY,
};
pub use crate::value_objects::{
    FileMetadata, ResourceDescriptor, ResourcePath, ResourceRequirements, ResourceType,
    WorkerCapabilities,
};
