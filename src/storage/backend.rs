//! Byte-level persistence behind [`SecureStorage`](super::SecureStorage).
//!
//! Backends only ever see serialized [`EncryptedRecord`](super::EncryptedRecord)
//! bytes. The file backend writes to a temporary file and renames it into
//! place so a reader never observes a half-written record.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::error::{SecurityError, SecurityResult};
use crate::storage::types::StorageType;

const RECORD_EXT: &str = "enc";

#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn read(&self, key: &str) -> SecurityResult<Option<Vec<u8>>>;

    async fn write(&self, key: &str, bytes: Vec<u8>) -> SecurityResult<()>;

    /// Write every entry or none of them.
    async fn write_batch(&self, entries: Vec<(String, Vec<u8>)>) -> SecurityResult<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> SecurityResult<bool>;

    async fn list(&self) -> SecurityResult<Vec<String>>;

    async fn clear(&self) -> SecurityResult<()>;

    /// Bytes used, when the backend can tell.
    async fn total_size(&self) -> SecurityResult<Option<u64>>;

    fn kind(&self) -> StorageType;
}

/// Volatile map, used when persistence is disabled or unavailable.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn read(&self, key: &str) -> SecurityResult<Option<Vec<u8>>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, bytes: Vec<u8>) -> SecurityResult<()> {
        self.records.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn write_batch(&self, entries: Vec<(String, Vec<u8>)>) -> SecurityResult<()> {
        let mut records = self.records.write().await;
        records.extend(entries);
        Ok(())
    }

    async fn delete(&self, key: &str) -> SecurityResult<bool> {
        Ok(self.records.write().await.remove(key).is_some())
    }

    async fn list(&self) -> SecurityResult<Vec<String>> {
        let mut keys: Vec<String> = self.records.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn clear(&self) -> SecurityResult<()> {
        self.records.write().await.clear();
        Ok(())
    }

    async fn total_size(&self) -> SecurityResult<Option<u64>> {
        Ok(None)
    }

    fn kind(&self) -> StorageType {
        StorageType::Memory
    }
}

/// One `<key>.enc` file per record in a private directory.
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Create the directory (mode 700 on unix) if missing.
    pub async fn open(dir: impl Into<PathBuf>) -> SecurityResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        set_mode(&dir, 0o700).await?;
        Ok(Self { dir })
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key, RECORD_EXT))
    }

    fn staging_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!(".{}.{}.tmp-{}", key, RECORD_EXT, uuid::Uuid::new_v4().simple()))
    }

    fn backup_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!(".{}.{}.bak", key, RECORD_EXT))
    }

    async fn stage(&self, key: &str, bytes: &[u8]) -> SecurityResult<PathBuf> {
        let tmp = self.staging_path(key);
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let result = async {
            let mut file = options.open(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            Ok::<_, std::io::Error>(())
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(tmp)
    }
}

/// One record of a batch on its way to disk.
struct StagedRecord {
    tmp: PathBuf,
    target: PathBuf,
    backup: PathBuf,
    had_original: bool,
}

/// Remove staging files and backups that will not be used.
async fn discard(records: &[StagedRecord]) {
    for record in records {
        let _ = fs::remove_file(&record.tmp).await;
        if record.had_original {
            let _ = fs::remove_file(&record.backup).await;
        }
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn read(&self, key: &str) -> SecurityResult<Option<Vec<u8>>> {
        match fs::read(self.record_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, bytes: Vec<u8>) -> SecurityResult<()> {
        let tmp = self.stage(key, &bytes).await?;
        if let Err(e) = fs::rename(&tmp, self.record_path(key)).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn write_batch(&self, entries: Vec<(String, Vec<u8>)>) -> SecurityResult<()> {
        // Stage everything first; nothing is visible until every file is on disk.
        let mut staged = Vec::with_capacity(entries.len());
        for (key, bytes) in &entries {
            match self.stage(key, bytes).await {
                Ok(tmp) => staged.push(StagedRecord {
                    backup: self.backup_path(key),
                    target: self.record_path(key),
                    tmp,
                    had_original: false,
                }),
                Err(e) => {
                    discard(&staged).await;
                    return Err(e);
                }
            }
        }

        // Hard-link the current files so a failed rename can be undone.
        for i in 0..staged.len() {
            let record = &staged[i];
            let is_file = matches!(fs::symlink_metadata(&record.target).await, Ok(meta) if meta.is_file());
            if !is_file {
                continue;
            }
            let _ = fs::remove_file(&record.backup).await;
            if let Err(e) = fs::hard_link(&record.target, &record.backup).await {
                discard(&staged).await;
                return Err(e.into());
            }
            staged[i].had_original = true;
        }

        for (committed, record) in staged.iter().enumerate() {
            if let Err(e) = fs::rename(&record.tmp, &record.target).await {
                tracing::error!(
                    path = %record.target.display(),
                    error = %e,
                    committed,
                    "Batch write failed, restoring previous records"
                );
                for done in &staged[..committed] {
                    let restored = if done.had_original {
                        fs::rename(&done.backup, &done.target).await
                    } else {
                        fs::remove_file(&done.target).await
                    };
                    if let Err(e) = restored {
                        tracing::error!(path = %done.target.display(), error = %e, "Failed to restore record");
                    }
                }
                discard(&staged[committed..]).await;
                return Err(e.into());
            }
        }

        for record in &staged {
            if record.had_original {
                let _ = fs::remove_file(&record.backup).await;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> SecurityResult<bool> {
        match fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> SecurityResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(key) = name.strip_suffix(".enc") {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn clear(&self) -> SecurityResult<()> {
        for key in self.list().await? {
            self.delete(&key).await?;
        }
        Ok(())
    }

    async fn total_size(&self) -> SecurityResult<Option<u64>> {
        let mut total = 0;
        for key in self.list().await? {
            if let Ok(meta) = fs::metadata(self.record_path(&key)).await {
                total += meta.len();
            }
        }
        Ok(Some(total))
    }

    fn kind(&self) -> StorageType {
        StorageType::File
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> SecurityResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> SecurityResult<()> {
    Ok(())
}

/// Map an arbitrary key name onto `[A-Za-z0-9_-]`.
pub fn sanitize_key(key: &str) -> SecurityResult<String> {
    let cleaned: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if cleaned.trim_matches('_').is_empty() {
        return Err(SecurityError::InvalidInput(format!("invalid storage key '{}'", key)));
    }
    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("api_keys").unwrap(), "api_keys");
        assert_eq!(sanitize_key("../etc/passwd").unwrap(), "___etc_passwd");
        assert!(sanitize_key("").is_err());
        assert!(sanitize_key("///").is_err());
    }

    #[tokio::test]
    async fn test_file_backend_layout() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path().join("store")).await.unwrap();
        backend.write("alpha", b"one".to_vec()).await.unwrap();

        let path = backend.directory().join("alpha.enc");
        assert_eq!(std::fs::read(&path).unwrap(), b"one");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            let dir_mode = std::fs::metadata(backend.directory()).unwrap().permissions().mode() & 0o777;
            assert_eq!(file_mode, 0o600);
            assert_eq!(dir_mode, 0o700);
        }
    }

    #[tokio::test]
    async fn test_file_backend_overwrite_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();
        backend.write("b", b"1".to_vec()).await.unwrap();
        backend.write("a", b"2".to_vec()).await.unwrap();
        backend.write("a", b"3".to_vec()).await.unwrap();

        assert_eq!(backend.list().await.unwrap(), vec!["a", "b"]);
        assert_eq!(backend.read("a").await.unwrap().unwrap(), b"3");
        assert_eq!(backend.total_size().await.unwrap(), Some(2));

        assert!(backend.delete("a").await.unwrap());
        assert!(!backend.delete("a").await.unwrap());
        assert!(backend.read("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_batch_replaces_all() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();
        backend.write("x", b"old".to_vec()).await.unwrap();
        backend
            .write_batch(vec![("x".into(), b"new".to_vec()), ("y".into(), b"new".to_vec())])
            .await
            .unwrap();
        assert_eq!(backend.read("x").await.unwrap().unwrap(), b"new");
        assert_eq!(backend.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_batch_restores_earlier_records() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();
        backend.write("a", b"old".to_vec()).await.unwrap();
        // A non-empty directory in place of the last record makes its rename fail.
        fs::create_dir(dir.path().join("c.enc")).await.unwrap();
        fs::write(dir.path().join("c.enc").join("occupied"), b"x").await.unwrap();

        let result = backend
            .write_batch(vec![
                ("a".into(), b"new".to_vec()),
                ("b".into(), b"new".to_vec()),
                ("c".into(), b"new".to_vec()),
            ])
            .await;
        assert!(result.is_err());

        assert_eq!(backend.read("a").await.unwrap().unwrap(), b"old");
        assert!(backend.read("b").await.unwrap().is_none());
        let mut leftovers = Vec::new();
        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                leftovers.push(name);
            }
        }
        assert!(leftovers.is_empty(), "stray files: {:?}", leftovers);
    }

    #[tokio::test]
    async fn test_memory_backend() {
        let backend = MemoryBackend::new();
        backend.write("k", b"v".to_vec()).await.unwrap();
        assert_eq!(backend.kind(), StorageType::Memory);
        assert_eq!(backend.list().await.unwrap(), vec!["k"]);
        backend.clear().await.unwrap();
        assert!(backend.list().await.unwrap().is_empty());
    }
}
