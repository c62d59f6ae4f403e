use async_trait::async_trait;

use scheduler_errors::AdapterError;

use crate::models::StagingOperation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferProgress {
    InProgress { transferred: u64, total: u64 },
    Done { transferred: u64 },
}

/// 暂存监控使用的轮询函数：推进一次传输并报告进度
///
/// 实现应当可重入：同一操作在恢复后可能被再次轮询。
#[async_trait]
pub trait TransferPoller: Send + Sync {
    async fn poll(&self, op: &StagingOperation) -> Result<TransferProgress, AdapterError>;
}
