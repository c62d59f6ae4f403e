use std::sync::Arc;

use scheduler_domain::entities::{ResourceDescriptor, ResourceType, StagingDirection, StagingOperation};
use scheduler_domain::ports::{StorageAdapter, TransferPoller, TransferProgress};
use scheduler_errors::AdapterErrorKind;
use scheduler_infrastructure::{AdapterRegistry, StorageTransferPoller};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

fn registry(nfs_root: &TempDir, host_root: &TempDir) -> Arc<AdapterRegistry> {
    let registry = AdapterRegistry::new();
    registry
        .register(&ResourceDescriptor {
            id: "nfs-1".to_string(),
            kind: ResourceType::Nfs,
            endpoint: nfs_root.path().display().to_string(),
            owner_user_id: None,
        })
        .unwrap();
    registry
        .register(&ResourceDescriptor {
            id: "host-1".to_string(),
            kind: ResourceType::BareMetal,
            endpoint: host_root.path().display().to_string(),
            owner_user_id: None,
        })
        .unwrap();
    Arc::new(registry)
}

fn input_op(total_size: i64) -> StagingOperation {
    StagingOperation::new(
        "t1",
        "w1",
        "host-1",
        StagingDirection::Input,
        "nfs-1:/in/a.txt",
        "host-1:/work/t1/a.txt",
        total_size,
        60,
    )
}

fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

#[tokio::test]
async fn test_moves_file_between_resources() {
    let nfs = TempDir::new().unwrap();
    let host = TempDir::new().unwrap();
    let registry = registry(&nfs, &host);
    registry
        .storage("nfs-1")
        .unwrap()
        .put("/in/a.txt", b"hello")
        .await
        .unwrap();

    let poller = StorageTransferPoller::new(registry.clone());
    let progress = poller.poll(&input_op(5)).await.unwrap();
    assert_eq!(progress, TransferProgress::Done { transferred: 5 });

    let copied = registry.storage("host-1").unwrap().get("/work/t1/a.txt").await.unwrap();
    assert_eq!(copied, b"hello");

    // 重复轮询结果一致
    assert_eq!(
        poller.poll(&input_op(5)).await.unwrap(),
        TransferProgress::Done { transferred: 5 }
    );
}

#[tokio::test]
async fn test_size_mismatch_is_an_error() {
    let nfs = TempDir::new().unwrap();
    let host = TempDir::new().unwrap();
    let registry = registry(&nfs, &host);
    registry
        .storage("nfs-1")
        .unwrap()
        .put("/in/a.txt", b"hello")
        .await
        .unwrap();

    let poller = StorageTransferPoller::new(registry);
    assert!(poller.poll(&input_op(99)).await.is_err());
}

#[tokio::test]
async fn test_missing_source_is_not_found() {
    let nfs = TempDir::new().unwrap();
    let host = TempDir::new().unwrap();
    let poller = StorageTransferPoller::new(registry(&nfs, &host));

    let err = poller.poll(&input_op(0)).await.unwrap_err();
    assert_eq!(err.kind, AdapterErrorKind::NotFound);
}

#[tokio::test]
async fn test_declared_checksum_is_verified_after_transfer() {
    let nfs = TempDir::new().unwrap();
    let host = TempDir::new().unwrap();
    let registry = registry(&nfs, &host);
    registry
        .storage("nfs-1")
        .unwrap()
        .put("/in/a.txt", b"hello")
        .await
        .unwrap();
    let poller = StorageTransferPoller::new(registry.clone());

    let verified = input_op(5).with_checksum(Some(sha256_hex(b"hello")));
    assert_eq!(
        poller.poll(&verified).await.unwrap(),
        TransferProgress::Done { transferred: 5 }
    );

    let host_storage = registry.storage("host-1").unwrap();
    host_storage.delete("/work/t1/a.txt").await.unwrap();
    let corrupted = input_op(5).with_checksum(Some(sha256_hex(b"other")));
    let err = poller.poll(&corrupted).await.unwrap_err();
    assert_eq!(err.kind, AdapterErrorKind::IntegrityMismatch);
    assert!(!err.is_transient());
    // 校验失败的副本不会留在工作目录
    assert!(!host_storage.exists("/work/t1/a.txt").await.unwrap());
}

#[tokio::test]
async fn test_matching_destination_skips_transfer() {
    let nfs = TempDir::new().unwrap();
    let host = TempDir::new().unwrap();
    let registry = registry(&nfs, &host);
    registry
        .storage("host-1")
        .unwrap()
        .put("/work/t1/a.txt", b"cached")
        .await
        .unwrap();

    // 源文件不存在，只有命中已有副本才能成功
    let poller = StorageTransferPoller::new(registry);
    let op = input_op(6).with_checksum(Some(sha256_hex(b"cached")));
    assert_eq!(
        poller.poll(&op).await.unwrap(),
        TransferProgress::Done { transferred: 6 }
    );

    let stale = input_op(6).with_checksum(Some(sha256_hex(b"fresh!")));
    assert_eq!(
        poller.poll(&stale).await.unwrap_err().kind,
        AdapterErrorKind::NotFound
    );
}
