//! Audit event destinations.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::audit::event::SecurityEvent;
use crate::error::{SecurityError, SecurityResult};

pub const LOG_PREFIX: &str = "security-audit-";
pub const LOG_SUFFIX: &str = ".log";

#[async_trait]
pub trait AuditSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn write(&self, events: &[SecurityEvent]) -> SecurityResult<()>;
}

/// JSON-lines files named `security-audit-YYYY-MM-DD.log`, rotated by size.
pub struct FileSink {
    dir: PathBuf,
    max_size: u64,
    rotate_daily: bool,
    current: Mutex<Option<PathBuf>>,
}

impl FileSink {
    pub async fn open(dir: impl Into<PathBuf>, max_size: u64, rotate_daily: bool) -> SecurityResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).await?;
        }
        Ok(Self {
            dir,
            max_size,
            rotate_daily,
            current: Mutex::new(None),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    fn daily_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", LOG_PREFIX, Utc::now().format("%Y-%m-%d"), LOG_SUFFIX))
    }

    async fn rotate(&self, path: &Path) -> SecurityResult<PathBuf> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("security-audit");
        let base = format!("{}-{}", stem, Utc::now().format("%H-%M-%S-%3f"));
        let mut rotated = self.dir.join(format!("{}{}", base, LOG_SUFFIX));
        let mut n = 1;
        while fs::try_exists(&rotated).await.unwrap_or(false) {
            rotated = self.dir.join(format!("{}-{}{}", base, n, LOG_SUFFIX));
            n += 1;
        }
        fs::rename(path, &rotated).await?;
        tracing::info!(file = %rotated.display(), "Audit log rotated");
        Ok(rotated)
    }
}

#[async_trait]
impl AuditSink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn write(&self, events: &[SecurityEvent]) -> SecurityResult<()> {
        let mut lines = String::new();
        for event in events {
            lines.push_str(&serde_json::to_string(event)?);
            lines.push('\n');
        }

        let mut current = self.current.lock().await;
        let path = match current.as_ref() {
            Some(path) if !self.rotate_daily => path.clone(),
            _ => self.daily_path(),
        };

        let mut options = fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&path).await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        let size = file.metadata().await?.len();
        drop(file);

        if size > self.max_size {
            self.rotate(&path).await?;
            *current = None;
        } else {
            *current = Some(path);
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct Batch<'a> {
    events: &'a [SecurityEvent],
}

/// Batched `POST {events: [...]}` to an HTTPS collector.
pub struct RemoteSink {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteSink {
    pub fn new(endpoint: impl Into<String>) -> SecurityResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| SecurityError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl AuditSink for RemoteSink {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn write(&self, events: &[SecurityEvent]) -> SecurityResult<()> {
        self.client
            .post(&self.endpoint)
            .json(&Batch { events })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SecurityError::Transport(format!("audit upload failed: {}", e)))?;
        Ok(())
    }
}

/// Audit log files in `dir`, oldest name first.
pub async fn log_files(dir: &Path) -> SecurityResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if let Some(name) = name.to_str() {
            if name.starts_with(LOG_PREFIX) && name.ends_with(LOG_SUFFIX) {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::{SecurityEventType, Severity};

    fn event(n: usize) -> SecurityEvent {
        SecurityEvent::new(SecurityEventType::ApiUsage, Severity::Low, format!("event {}", n))
    }

    #[tokio::test]
    async fn test_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::open(dir.path(), 1024 * 1024, true).await.unwrap();
        sink.write(&[event(1), event(2)]).await.unwrap();
        sink.write(&[event(3)]).await.unwrap();

        let files = log_files(dir.path()).await.unwrap();
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("security-audit-") && name.ends_with(".log"));

        let content = std::fs::read_to_string(&files[0]).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let parsed: SecurityEvent = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(parsed.description, "event 3");
    }

    #[tokio::test]
    async fn test_rotates_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::open(dir.path(), 64, true).await.unwrap();
        sink.write(&[event(1)]).await.unwrap();
        sink.write(&[event(2)]).await.unwrap();

        let files = log_files(dir.path()).await.unwrap();
        assert!(files.len() >= 2, "expected a rotated file, got {:?}", files);
    }
}
