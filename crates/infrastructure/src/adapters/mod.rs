//! 资源适配器及其工厂

mod local_compute;
mod local_storage;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use scheduler_domain::ports::{ComputeAdapter, StorageAdapter};
use scheduler_domain::{ResourceDescriptor, ResourceType};
use scheduler_errors::{AdapterError, AdapterErrorKind};
use tracing::info;

pub use local_compute::LocalProcessAdapter;
pub use local_storage::LocalStorageAdapter;

/// 根据资源类型构造适配器
pub struct AdapterFactory;

impl AdapterFactory {
    pub fn compute(desc: &ResourceDescriptor) -> Result<Arc<dyn ComputeAdapter>, AdapterError> {
        match desc.kind {
            ResourceType::BareMetal => Ok(Arc::new(LocalProcessAdapter::new(&desc.id))),
            ResourceType::Slurm | ResourceType::Kubernetes => Err(AdapterError::new(
                &desc.id,
                "create_compute_adapter",
                AdapterErrorKind::Unsupported,
                format!("暂不支持的计算资源类型: {}", desc.kind),
            )),
            other => Err(AdapterError::new(
                &desc.id,
                "create_compute_adapter",
                AdapterErrorKind::Unsupported,
                format!("{other} 不是计算资源"),
            )),
        }
    }

    /// 计算节点本身也能作为暂存目标（工作目录），因此裸机同样返回本地存储
    pub fn storage(desc: &ResourceDescriptor) -> Result<Arc<dyn StorageAdapter>, AdapterError> {
        match desc.kind {
            ResourceType::Nfs | ResourceType::BareMetal => Ok(Arc::new(LocalStorageAdapter::new(
                &desc.id,
                desc.kind,
                &desc.endpoint,
            ))),
            other => Err(AdapterError::new(
                &desc.id,
                "create_storage_adapter",
                AdapterErrorKind::Unsupported,
                format!("暂不支持的存储资源类型: {other}"),
            )),
        }
    }
}

/// 按资源ID查找已构造的适配器
#[derive(Default)]
pub struct AdapterRegistry {
    storage: RwLock<HashMap<String, Arc<dyn StorageAdapter>>>,
    compute: RwLock<HashMap<String, Arc<dyn ComputeAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为描述的资源构造并登记所有可用的适配器
    pub fn register(&self, desc: &ResourceDescriptor) -> Result<(), AdapterError> {
        if desc.kind.is_compute() {
            let compute = AdapterFactory::compute(desc)?;
            self.register_compute(compute);
        }
        match AdapterFactory::storage(desc) {
            Ok(storage) => self.register_storage(storage),
            Err(e) if desc.kind.is_compute() => {
                info!("计算资源 {} 没有可用的存储视图: {}", desc.id, e.message);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    pub fn register_storage(&self, adapter: Arc<dyn StorageAdapter>) {
        let id = adapter.resource_id().to_string();
        if let Ok(mut map) = self.storage.write() {
            map.insert(id, adapter);
        }
    }

    pub fn register_compute(&self, adapter: Arc<dyn ComputeAdapter>) {
        let id = adapter.resource_id().to_string();
        if let Ok(mut map) = self.compute.write() {
            map.insert(id, adapter);
        }
    }

    pub fn storage(&self, resource_id: &str) -> Result<Arc<dyn StorageAdapter>, AdapterError> {
        self.storage
            .read()
            .ok()
            .and_then(|map| map.get(resource_id).cloned())
            .ok_or_else(|| {
                AdapterError::new(
                    resource_id,
                    "lookup_storage",
                    AdapterErrorKind::NotFound,
                    "未登记的存储资源",
                )
            })
    }

    pub fn compute(&self, resource_id: &str) -> Result<Arc<dyn ComputeAdapter>, AdapterError> {
        self.compute
            .read()
            .ok()
            .and_then(|map| map.get(resource_id).cloned())
            .ok_or_else(|| {
                AdapterError::new(
                    resource_id,
                    "lookup_compute",
                    AdapterErrorKind::NotFound,
                    "未登记的计算资源",
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, kind: ResourceType) -> ResourceDescriptor {
        ResourceDescriptor {
            id: id.to_string(),
            kind,
            endpoint: "/tmp".to_string(),
            owner_user_id: None,
        }
    }

    #[test]
    fn test_factory_by_resource_type() {
        assert!(AdapterFactory::compute(&descriptor("h", ResourceType::BareMetal)).is_ok());
        assert!(AdapterFactory::storage(&descriptor("n", ResourceType::Nfs)).is_ok());

        let err = AdapterFactory::compute(&descriptor("s", ResourceType::Slurm)).err().unwrap();
        assert_eq!(err.kind, AdapterErrorKind::Unsupported);
        let err = AdapterFactory::storage(&descriptor("s3", ResourceType::S3)).err().unwrap();
        assert_eq!(err.kind, AdapterErrorKind::Unsupported);
        let err = AdapterFactory::compute(&descriptor("n", ResourceType::Nfs)).err().unwrap();
        assert_eq!(err.kind, AdapterErrorKind::Unsupported);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = AdapterRegistry::new();
        registry.register(&descriptor("host-1", ResourceType::BareMetal)).unwrap();
        registry.register(&descriptor("nfs-1", ResourceType::Nfs)).unwrap();

        assert!(registry.compute("host-1").is_ok());
        assert!(registry.storage("host-1").is_ok());
        assert!(registry.storage("nfs-1").is_ok());
        assert!(registry.compute("nfs-1").is_err());
        assert_eq!(
            registry.storage("missing").err().unwrap().kind,
            AdapterErrorKind::NotFound
        );
    }
}
