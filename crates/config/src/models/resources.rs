//! 计算与存储资源，以及与调度器同进程运行的Worker

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};
use crate::ConfigError;

const RESOURCE_KINDS: [&str; 6] = ["slurm", "kubernetes", "bare_metal", "s3", "sftp", "nfs"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    pub id: String,
    /// slurm、kubernetes、bare_metal、s3、sftp、nfs
    pub kind: String,
    /// 本地根目录或远端地址
    pub endpoint: String,
    #[serde(default)]
    pub owner_user_id: Option<String>,
}

impl ConfigValidator for ResourceConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.id, "resources.id")?;
        ValidationUtils::validate_not_empty(&self.endpoint, "resources.endpoint")?;
        if !RESOURCE_KINDS.contains(&self.kind.as_str()) {
            return Err(ConfigError::Validation(format!(
                "resources.kind must be one of {RESOURCE_KINDS:?}, got {}",
                self.kind
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalWorkerConfig {
    pub worker_id: String,
    pub experiment_id: String,
    pub compute_resource_id: String,
    #[serde(default = "default_user")]
    pub user_id: String,
    #[serde(default)]
    pub walltime_seconds: i64,
    /// 工作目录在本机的挂载根，一般与计算资源的 endpoint 相同
    #[serde(default)]
    pub filesystem_root: Option<String>,
}

fn default_user() -> String {
    "local".to_string()
}

impl ConfigValidator for LocalWorkerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.worker_id, "local_workers.worker_id")?;
        ValidationUtils::validate_not_empty(&self.experiment_id, "local_workers.experiment_id")?;
        ValidationUtils::validate_not_empty(
            &self.compute_resource_id,
            "local_workers.compute_resource_id",
        )?;
        if self.walltime_seconds < 0 {
            return Err(ConfigError::Validation(
                "local_workers.walltime_seconds must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// 资源ID与Worker ID各自唯一，本地Worker引用的计算资源必须已声明
pub fn validate_topology(
    resources: &[ResourceConfig],
    workers: &[LocalWorkerConfig],
) -> crate::ConfigResult<()> {
    let mut ids = HashSet::new();
    for resource in resources {
        resource.validate()?;
        if !ids.insert(resource.id.as_str()) {
            return Err(ConfigError::Validation(format!("duplicate resource id: {}", resource.id)));
        }
    }

    let mut worker_ids = HashSet::new();
    for worker in workers {
        worker.validate()?;
        if !worker_ids.insert(worker.worker_id.as_str()) {
            return Err(ConfigError::Validation(format!("duplicate worker id: {}", worker.worker_id)));
        }
        if !ids.contains(worker.compute_resource_id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "worker {} references unknown resource {}",
                worker.worker_id, worker.compute_resource_id
            )));
        }
    }
    Ok(())
}
