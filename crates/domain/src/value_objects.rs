//! 值对象：文件描述、资源需求与能力、资源类型

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 输入/输出文件描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// 资源限定路径，形如 `storage-1:/data/input.txt`
    pub path: String,
    pub size: i64,
    pub checksum: Option<String>,
}

impl FileMetadata {
    pub fn new<S: Into<String>>(path: S, size: i64, checksum: Option<String>) -> Self {
        Self {
            path: path.into(),
            size,
            checksum,
        }
    }

    /// 路径最后一段文件名
    pub fn file_name(&self) -> &str {
        let local = ResourcePath::parse(&self.path)
            .map(|parsed| parsed.path)
            .unwrap_or(self.path.as_str());
        local.rsplit('/').find(|s| !s.is_empty()).unwrap_or(local)
    }
}

/// 任务资源需求
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub gpus: u32,
    pub runtime: Option<String>,
}

/// Worker能力描述
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub gpus: u32,
    pub runtimes: Vec<String>,
}

impl WorkerCapabilities {
    pub fn satisfies(&self, req: &ResourceRequirements) -> bool {
        if self.cpu_cores < req.cpu_cores
            || self.memory_mb < req.memory_mb
            || self.disk_gb < req.disk_gb
            || self.gpus < req.gpus
        {
            return false;
        }
        match &req.runtime {
            Some(runtime) => self.runtimes.iter().any(|r| r.eq_ignore_ascii_case(runtime)),
            None => true,
        }
    }
}

/// 资源类型（计算与存储）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Slurm,
    Kubernetes,
    BareMetal,
    S3,
    Sftp,
    Nfs,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Slurm => "slurm",
            ResourceType::Kubernetes => "kubernetes",
            ResourceType::BareMetal => "bare_metal",
            ResourceType::S3 => "s3",
            ResourceType::Sftp => "sftp",
            ResourceType::Nfs => "nfs",
        }
    }

    pub fn is_compute(&self) -> bool {
        matches!(
            self,
            ResourceType::Slurm | ResourceType::Kubernetes | ResourceType::BareMetal
        )
    }

    pub fn is_storage(&self) -> bool {
        !self.is_compute()
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "slurm" => Ok(ResourceType::Slurm),
            "kubernetes" | "k8s" => Ok(ResourceType::Kubernetes),
            "bare_metal" | "baremetal" => Ok(ResourceType::BareMetal),
            "s3" => Ok(ResourceType::S3),
            "sftp" => Ok(ResourceType::Sftp),
            "nfs" => Ok(ResourceType::Nfs),
            other => Err(format!("未知的资源类型: {other}")),
        }
    }
}

/// 资源描述，供适配器工厂构造具体适配器
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub id: String,
    pub kind: ResourceType,
    /// 本地根目录或远端地址
    pub endpoint: String,
    pub owner_user_id: Option<String>,
}

/// `resource-id:/path` 形式的资源限定路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePath<'a> {
    pub resource_id: &'a str,
    pub path: &'a str,
}

impl<'a> ResourcePath<'a> {
    pub fn parse(raw: &'a str) -> Option<Self> {
        let (resource_id, path) = raw.split_once(':')?;
        if resource_id.is_empty() || !path.starts_with('/') {
            return None;
        }
        Some(Self { resource_id, path })
    }

    pub fn join(resource_id: &str, path: &str) -> String {
        format!("{resource_id}:{path}")
    }
}
