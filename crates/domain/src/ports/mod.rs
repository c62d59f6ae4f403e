//! 外部协作方接口：计算适配器、存储适配器、凭据库、传输轮询

mod compute;
mod credentials;
mod storage;
mod transfer;

pub use compute::{ComputeAdapter, JobHandle, JobState};
pub use credentials::{AccessContext, Credential, CredentialKind, CredentialVault, SecretBytes};
pub use storage::{ObjectInfo, StorageAdapter, UrlMethod};
pub use transfer::{TransferPoller, TransferProgress};
