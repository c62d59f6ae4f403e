use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use scheduler_errors::AdapterError;

use crate::messaging::TaskAssignment;
use crate::value_objects::ResourceType;

/// 提交后由适配器返回的作业句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub resource_id: String,
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Finished {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    Canceled,
}

/// 计算资源适配器（SLURM、Kubernetes、裸机等）
#[async_trait]
pub trait ComputeAdapter: Send + Sync {
    fn resource_id(&self) -> &str;

    fn resource_type(&self) -> ResourceType;

    /// 在输出目录下生成可执行脚本，返回脚本路径
    async fn generate_script(
        &self,
        task: &TaskAssignment,
        output_dir: &Path,
    ) -> Result<PathBuf, AdapterError>;

    async fn submit_task(&self, script_path: &Path) -> Result<JobHandle, AdapterError>;

    async fn poll_job(&self, handle: &JobHandle) -> Result<JobState, AdapterError>;

    async fn cancel_job(&self, handle: &JobHandle) -> Result<(), AdapterError>;
}
