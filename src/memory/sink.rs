//! 知识库持久化接口：只需要整体写入与整体读取
//!
//! `FileLogSink` 先写临时文件再 rename，保证读取方看到的要么是旧镜像要么是新镜像。

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::core::RelayError;

/// 持久化落点（文件或对象存储）
#[async_trait]
pub trait LogSink: Send + Sync {
    /// 覆盖写入完整镜像
    async fn write(&self, bytes: &[u8]) -> Result<(), RelayError>;

    /// 读取最近一次写入的镜像；从未写入时返回 None
    async fn read(&self) -> Result<Option<Vec<u8>>, RelayError>;
}

/// 单文件持久化
#[derive(Debug, Clone)]
pub struct FileLogSink {
    path: PathBuf,
}

impl FileLogSink {
    pub const FILE_NAME: &'static str = "knowledge.json";

    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// 在存储目录下使用默认文件名
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(Self::FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl LogSink for FileLogSink {
    async fn write(&self, bytes: &[u8]) -> Result<(), RelayError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!("Wrote {} bytes to {}", bytes.len(), self.path.display());
        Ok(())
    }

    async fn read(&self) -> Result<Option<Vec<u8>>, RelayError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// 内存持久化（测试、禁用持久化时使用）
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    image: Mutex<Option<Vec<u8>>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_empty(&self) -> bool {
        self.image.lock().await.is_none()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn write(&self, bytes: &[u8]) -> Result<(), RelayError> {
        *self.image.lock().await = Some(bytes.to_vec());
        Ok(())
    }

    async fn read(&self) -> Result<Option<Vec<u8>>, RelayError> {
        Ok(self.image.lock().await.clone())
    }
}
