//! 基于存储适配器的暂存传输

use std::sync::Arc;

use async_trait::async_trait;
use scheduler_domain::ports::{StorageAdapter, TransferPoller, TransferProgress};
use scheduler_domain::{ResourcePath, StagingOperation};
use scheduler_errors::{AdapterError, AdapterErrorKind};
use tracing::{debug, warn};

use crate::adapters::AdapterRegistry;

/// 每次轮询完成一次整文件搬运，源与目标都以 `resource-id:/path` 表示
pub struct StorageTransferPoller {
    registry: Arc<AdapterRegistry>,
}

impl StorageTransferPoller {
    pub fn new(registry: Arc<AdapterRegistry>) -> Self {
        Self { registry }
    }

    fn parse<'a>(op: &StagingOperation, raw: &'a str) -> Result<ResourcePath<'a>, AdapterError> {
        ResourcePath::parse(raw).ok_or_else(|| {
            AdapterError::new(
                &op.compute_resource_id,
                "staging",
                AdapterErrorKind::Other,
                format!("无法解析暂存路径: {raw}"),
            )
        })
    }

    /// 目标已存在且摘要与声明一致
    async fn already_staged(dst: &dyn StorageAdapter, path: &str, expected: &str) -> bool {
        if !matches!(dst.exists(path).await, Ok(true)) {
            return false;
        }
        dst.checksum(path)
            .await
            .is_ok_and(|actual| actual.eq_ignore_ascii_case(expected))
    }
}

#[async_trait]
impl TransferPoller for StorageTransferPoller {
    async fn poll(&self, op: &StagingOperation) -> Result<TransferProgress, AdapterError> {
        let source = Self::parse(op, &op.source_path)?;
        let destination = Self::parse(op, &op.destination_path)?;

        let src = self.registry.storage(source.resource_id)?;
        let dst = self.registry.storage(destination.resource_id)?;
        let expected = op.expected_checksum.as_deref();

        if let Some(expected) = expected {
            if Self::already_staged(dst.as_ref(), destination.path, expected).await {
                let size = dst.size(destination.path).await?;
                debug!(
                    "暂存操作 {} 的目标 {} 已是最新内容，跳过传输",
                    op.id, op.destination_path
                );
                return Ok(TransferProgress::Done { transferred: size });
            }
        }

        let transferred = src.transfer(dst.as_ref(), source.path, destination.path).await?;
        if op.total_size > 0 && transferred != op.total_size as u64 {
            return Err(AdapterError::new(
                destination.resource_id,
                "staging",
                AdapterErrorKind::Other,
                format!("传输大小不一致: 期望 {} 实际 {}", op.total_size, transferred),
            ));
        }

        if let Some(expected) = expected {
            let actual = dst.checksum(destination.path).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                if let Err(e) = dst.delete(destination.path).await {
                    warn!("删除校验失败的副本 {} 失败: {}", op.destination_path, e);
                }
                return Err(AdapterError::new(
                    destination.resource_id,
                    "verify",
                    AdapterErrorKind::IntegrityMismatch,
                    format!("{} 摘要不一致: 期望 {} 实际 {}", op.destination_path, expected, actual),
                ));
            }
        }

        debug!(
            "暂存操作 {} 完成传输 {} -> {} ({} 字节)",
            op.id, op.source_path, op.destination_path, transferred
        );
        Ok(TransferProgress::Done { transferred })
    }
}
