pub mod tacho;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use tacho::TachoClient;

// ============ 公共常量 ============

/// 默认请求超时（秒）
pub const REQUEST_TIMEOUT_SECS: u64 = 60;
/// `downloadDate` 字段格式
pub const DOWNLOAD_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// 单个文件的上传请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub file_name: String,
    pub download_date: String,
    /// 文件内容（标准 base64）
    pub file_bytes: String,
}

/// 导入接口返回的任务回执
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub job_id: String,
}

/// 上传服务抽象接口
#[async_trait]
pub trait UploadClient: Send + Sync {
    /// 校验凭据
    async fn verify(&self) -> Result<()>;

    /// 提交一个文件；返回 `Ok` 表示服务端已受理（带任务 ID）
    async fn upload(&self, request: UploadRequest) -> Result<UploadReceipt>;

    /// 获取客户端名称（用于日志）
    fn name(&self) -> &str;
}
