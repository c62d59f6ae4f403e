//! 基于本地（或挂载的网络）文件系统的存储适配器，对应 NFS 与裸机节点

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_domain::ports::{ObjectInfo, StorageAdapter, UrlMethod};
use scheduler_domain::ResourceType;
use scheduler_errors::{AdapterError, AdapterErrorKind};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

const META_DIR: &str = ".scheduler-meta";

pub struct LocalStorageAdapter {
    resource_id: String,
    kind: ResourceType,
    root: PathBuf,
    signing_key: String,
}

impl LocalStorageAdapter {
    pub fn new<S: Into<String>, P: Into<PathBuf>>(resource_id: S, kind: ResourceType, root: P) -> Self {
        Self {
            resource_id: resource_id.into(),
            kind,
            root: root.into(),
            signing_key: Uuid::new_v4().to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn err(&self, operation: &str, kind: AdapterErrorKind, message: impl Into<String>) -> AdapterError {
        AdapterError::new(&self.resource_id, operation, kind, message)
    }

    fn io_err(&self, operation: &str, err: std::io::Error) -> AdapterError {
        AdapterError::from_io(&self.resource_id, operation, &err)
    }

    /// 把逻辑路径映射到根目录下，拒绝 `..` 逃逸
    fn resolve(&self, operation: &str, path: &str) -> Result<PathBuf, AdapterError> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(self.err(operation, AdapterErrorKind::Authentication, format!("非法路径: {path}")));
        }
        Ok(self.root.join(relative))
    }

    fn meta_path(&self, operation: &str, path: &str) -> Result<PathBuf, AdapterError> {
        let target = self.resolve(operation, path)?;
        let relative = target.strip_prefix(&self.root).unwrap_or(&target).to_path_buf();
        let mut meta = self.root.join(META_DIR).join(relative).into_os_string();
        meta.push(".json");
        Ok(PathBuf::from(meta))
    }

    fn sign(&self, path: &str, method: UrlMethod, expires: i64) -> String {
        let payload = format!(
            "{}|{}|{}|{}|{}",
            self.resource_id,
            path,
            method.as_str(),
            expires,
            self.signing_key
        );
        let digest = Sha256::digest(payload.as_bytes());
        format!("{digest:x}")
    }

    async fn ensure_parent(&self, operation: &str, target: &Path) -> Result<(), AdapterError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_err(operation, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for LocalStorageAdapter {
    fn resource_id(&self) -> &str {
        &self.resource_id
    }

    fn resource_type(&self) -> ResourceType {
        self.kind
    }

    async fn put(&self, path: &str, data: &[u8]) -> Result<(), AdapterError> {
        let target = self.resolve("put", path)?;
        self.ensure_parent("put", &target).await?;

        // 先写临时文件再改名，读者不会看到半截内容
        let mut tmp = target.clone().into_os_string();
        tmp.push(format!(".part-{}", Uuid::new_v4().simple()));
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| self.io_err("put", e))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| self.io_err("put", e))?;

        debug!("写入文件 {}:{} ({} 字节)", self.resource_id, path, data.len());
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, AdapterError> {
        let target = self.resolve("get", path)?;
        tokio::fs::read(&target)
            .await
            .map_err(|e| self.io_err("get", e))
    }

    async fn exists(&self, path: &str) -> Result<bool, AdapterError> {
        let target = self.resolve("exists", path)?;
        tokio::fs::try_exists(&target)
            .await
            .map_err(|e| self.io_err("exists", e))
    }

    async fn size(&self, path: &str) -> Result<u64, AdapterError> {
        let target = self.resolve("size", path)?;
        let meta = tokio::fs::metadata(&target)
            .await
            .map_err(|e| self.io_err("size", e))?;
        Ok(meta.len())
    }

    async fn checksum(&self, path: &str) -> Result<String, AdapterError> {
        let data = self.get(path).await?;
        let digest = Sha256::digest(&data);
        Ok(format!("{digest:x}"))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, AdapterError> {
        let start = self.resolve("list", prefix)?;
        let meta_root = self.root.join(META_DIR);
        let mut result = Vec::new();
        let mut pending = vec![start];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(self.io_err("list", e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| self.io_err("list", e))?
            {
                let path = entry.path();
                if path.starts_with(&meta_root) {
                    continue;
                }
                let meta = entry.metadata().await.map_err(|e| self.io_err("list", e))?;
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                let relative = path.strip_prefix(&self.root).unwrap_or(&path);
                result.push(ObjectInfo {
                    path: format!("/{}", relative.to_string_lossy()),
                    size: meta.len(),
                    modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
                });
            }
        }

        result.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(result)
    }

    async fn delete(&self, path: &str) -> Result<(), AdapterError> {
        let target = self.resolve("delete", path)?;
        tokio::fs::remove_file(&target)
            .await
            .map_err(|e| self.io_err("delete", e))?;
        let meta = self.meta_path("delete", path)?;
        let _ = tokio::fs::remove_file(meta).await;
        Ok(())
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), AdapterError> {
        let from = self.resolve("copy", src)?;
        let to = self.resolve("copy", dst)?;
        self.ensure_parent("copy", &to).await?;
        tokio::fs::copy(&from, &to)
            .await
            .map_err(|e| self.io_err("copy", e))?;
        Ok(())
    }

    async fn move_file(&self, src: &str, dst: &str) -> Result<(), AdapterError> {
        let from = self.resolve("move", src)?;
        let to = self.resolve("move", dst)?;
        self.ensure_parent("move", &to).await?;
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| self.io_err("move", e))
    }

    async fn generate_signed_url(
        &self,
        path: &str,
        ttl: Duration,
        method: UrlMethod,
    ) -> Result<String, AdapterError> {
        let target = self.resolve("signed_url", path)?;
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| self.err("signed_url", AdapterErrorKind::Other, e.to_string()))?;
        let expires = (Utc::now() + ttl).timestamp();
        let signature = self.sign(path, method, expires);
        Ok(format!(
            "file://{}?method={}&expires={}&signature={}",
            target.display(),
            method.as_str(),
            expires,
            signature
        ))
    }

    async fn get_metadata(&self, path: &str) -> Result<HashMap<String, String>, AdapterError> {
        if !self.exists(path).await? {
            return Err(self.err("get_metadata", AdapterErrorKind::NotFound, format!("文件不存在: {path}")));
        }
        let meta = self.meta_path("get_metadata", path)?;
        match tokio::fs::read(&meta).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| self.err("get_metadata", AdapterErrorKind::Other, e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(self.io_err("get_metadata", e)),
        }
    }

    async fn set_metadata(
        &self,
        path: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), AdapterError> {
        if !self.exists(path).await? {
            return Err(self.err("set_metadata", AdapterErrorKind::NotFound, format!("文件不存在: {path}")));
        }
        let meta = self.meta_path("set_metadata", path)?;
        self.ensure_parent("set_metadata", &meta).await?;
        let raw = serde_json::to_vec(&metadata)
            .map_err(|e| self.err("set_metadata", AdapterErrorKind::Other, e.to_string()))?;
        tokio::fs::write(&meta, raw)
            .await
            .map_err(|e| self.io_err("set_metadata", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn adapter(dir: &TempDir) -> LocalStorageAdapter {
        LocalStorageAdapter::new("nfs-1", ResourceType::Nfs, dir.path())
    }

    #[tokio::test]
    async fn test_put_get_and_checksum() {
        let dir = TempDir::new().unwrap();
        let storage = adapter(&dir);

        storage.put("/data/a.txt", b"hello").await.unwrap();
        assert!(storage.exists("/data/a.txt").await.unwrap());
        assert_eq!(storage.get("/data/a.txt").await.unwrap(), b"hello");
        assert_eq!(storage.size("/data/a.txt").await.unwrap(), 5);
        assert_eq!(
            storage.checksum("/data/a.txt").await.unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[tokio::test]
    async fn test_rejects_parent_traversal() {
        let dir = TempDir::new().unwrap();
        let storage = adapter(&dir);
        let err = storage.get("/../etc/passwd").await.unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::Authentication);
    }

    #[tokio::test]
    async fn test_list_skips_metadata_sidecars() {
        let dir = TempDir::new().unwrap();
        let storage = adapter(&dir);
        storage.put("/a/1.txt", b"1").await.unwrap();
        storage.put("/a/b/2.txt", b"22").await.unwrap();
        storage
            .set_metadata("/a/1.txt", HashMap::from([("owner".to_string(), "alice".to_string())]))
            .await
            .unwrap();

        let listed = storage.list("/a").await.unwrap();
        let paths: Vec<_> = listed.iter().map(|o| o.path.as_str()).collect();
        assert_eq!(paths, vec!["/a/1.txt", "/a/b/2.txt"]);
    }

    #[tokio::test]
    async fn test_metadata_update_merges() {
        let dir = TempDir::new().unwrap();
        let storage = adapter(&dir);
        storage.put("/x.bin", b"x").await.unwrap();
        storage
            .set_metadata("/x.bin", HashMap::from([("a".to_string(), "1".to_string())]))
            .await
            .unwrap();
        storage
            .update_metadata("/x.bin", HashMap::from([("b".to_string(), "2".to_string())]))
            .await
            .unwrap();

        let meta = storage.get_metadata("/x.bin").await.unwrap();
        assert_eq!(meta.get("a").map(String::as_str), Some("1"));
        assert_eq!(meta.get("b").map(String::as_str), Some("2"));
    }

    #[tokio::test]
    async fn test_copy_move_delete_and_batch() {
        let dir = TempDir::new().unwrap();
        let storage = adapter(&dir);
        storage.put("/src.txt", b"abc").await.unwrap();
        storage.copy("/src.txt", "/copy/dst.txt").await.unwrap();
        storage.move_file("/copy/dst.txt", "/moved.txt").await.unwrap();
        assert!(!storage.exists("/copy/dst.txt").await.unwrap());

        let files = storage
            .get_multiple(&["/src.txt".to_string(), "/moved.txt".to_string()])
            .await
            .unwrap();
        assert_eq!(files.len(), 2);

        storage
            .delete_multiple(&["/src.txt".to_string(), "/moved.txt".to_string()])
            .await
            .unwrap();
        assert!(!storage.exists("/src.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_cross_backend_transfer() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let src = adapter(&src_dir);
        let dst = LocalStorageAdapter::new("host-1", ResourceType::BareMetal, dst_dir.path());

        src.put("/in.txt", b"payload").await.unwrap();
        let moved = src.transfer(&dst, "/in.txt", "/work/in.txt").await.unwrap();
        assert_eq!(moved, 7);
        assert_eq!(dst.get("/work/in.txt").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_signed_url_contains_expiry_and_signature() {
        let dir = TempDir::new().unwrap();
        let storage = adapter(&dir);
        let url = storage
            .generate_signed_url("/a.txt", Duration::from_secs(60), UrlMethod::Get)
            .await
            .unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.contains("method=GET"));
        assert!(url.contains("signature="));
    }
}
