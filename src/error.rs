//! 文件系统核心的错误类型

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// 操作目标解析后位于根目录之外
    #[error("路径不在根目录内: {}", .path.display())]
    Guard { path: PathBuf },

    #[error("IO 错误 {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("压缩包解压失败 {}: {source}", .path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("删除失败 {}: {reason}", .path.display())]
    Removal { path: PathBuf, reason: String },

    #[error("无效的相对路径: {0}")]
    InvalidLayout(String),

    #[error("未配置: {0}")]
    NotConfigured(String),
}

impl SyncError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
