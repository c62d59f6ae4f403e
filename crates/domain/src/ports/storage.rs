use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scheduler_errors::AdapterError;

use crate::value_objects::ResourceType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub path: String,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UrlMethod {
    Get,
    Put,
}

impl UrlMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlMethod::Get => "GET",
            UrlMethod::Put => "PUT",
        }
    }
}

/// 存储资源适配器（对象存储、SFTP、NFS等）
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    fn resource_id(&self) -> &str;

    fn resource_type(&self) -> ResourceType;

    async fn put(&self, path: &str, data: &[u8]) -> Result<(), AdapterError>;

    async fn get(&self, path: &str) -> Result<Vec<u8>, AdapterError>;

    async fn exists(&self, path: &str) -> Result<bool, AdapterError>;

    async fn size(&self, path: &str) -> Result<u64, AdapterError>;

    /// 内容的sha256十六进制摘要
    async fn checksum(&self, path: &str) -> Result<String, AdapterError>;

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, AdapterError>;

    async fn delete(&self, path: &str) -> Result<(), AdapterError>;

    async fn copy(&self, src: &str, dst: &str) -> Result<(), AdapterError>;

    async fn move_file(&self, src: &str, dst: &str) -> Result<(), AdapterError>;

    async fn generate_signed_url(
        &self,
        path: &str,
        ttl: Duration,
        method: UrlMethod,
    ) -> Result<String, AdapterError>;

    async fn get_metadata(&self, path: &str) -> Result<HashMap<String, String>, AdapterError>;

    async fn set_metadata(
        &self,
        path: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), AdapterError>;

    async fn update_metadata(
        &self,
        path: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), AdapterError> {
        let mut current = self.get_metadata(path).await?;
        current.extend(metadata);
        self.set_metadata(path, current).await
    }

    async fn get_multiple(
        &self,
        paths: &[String],
    ) -> Result<HashMap<String, Vec<u8>>, AdapterError> {
        let mut result = HashMap::with_capacity(paths.len());
        for path in paths {
            result.insert(path.clone(), self.get(path).await?);
        }
        Ok(result)
    }

    async fn delete_multiple(&self, paths: &[String]) -> Result<(), AdapterError> {
        for path in paths {
            self.delete(path).await?;
        }
        Ok(())
    }

    /// 跨后端搬运，返回传输的字节数
    async fn transfer(
        &self,
        dest: &dyn StorageAdapter,
        src_path: &str,
        dest_path: &str,
    ) -> Result<u64, AdapterError> {
        let data = self.get(src_path).await?;
        dest.put(dest_path, &data).await?;
        Ok(data.len() as u64)
    }
}
