use super::{UploadClient, UploadReceipt, UploadRequest};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

const API_KEY_HEADER: &str = "API-KEY";

/// 公司标识必须是 UUID（版本 1-5）
pub fn validate_credentials(company_id: &str, api_key: &str) -> Result<()> {
    static UUID_RE: OnceLock<Regex> = OnceLock::new();

    if company_id.trim().is_empty() || api_key.trim().is_empty() {
        return Err(anyhow!("Please fill company identifier and api key."));
    }

    let re = UUID_RE.get_or_init(|| {
        Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[1-5][0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
            .expect("valid uuid pattern")
    });
    if !re.is_match(company_id) {
        return Err(anyhow!(
            "Company Identifier format is invalid. Example: 123e4567-e89b-12d3-a456-426614174000"
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportResponse {
    job_id: Option<Value>,
}

/// 有效的任务 ID：`null`、`false`、`0`、空字符串和空容器都不算
fn job_id(value: Option<Value>) -> Option<String> {
    match value? {
        Value::Null | Value::Bool(false) => None,
        Value::String(id) if id.is_empty() => None,
        Value::String(id) => Some(id),
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::Array(items) if items.is_empty() => None,
        Value::Object(map) if map.is_empty() => None,
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// 行驶记录仪文件导入接口客户端
pub struct TachoClient {
    client: Client,
    base_url: String,
    company_id: String,
    api_key: String,
    name: String,
}

impl TachoClient {
    pub fn new(base_url: &str, company_id: &str, api_key: &str, timeout_secs: u64) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(anyhow!("API base URL is not configured"));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("创建 HTTP 客户端失败")?;

        Ok(Self {
            client,
            name: format!("tacho:{}", base_url),
            base_url,
            company_id: company_id.to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn import_url(&self) -> String {
        format!(
            "{}/api/v2/tachofile/import/company/{}",
            self.base_url, self.company_id
        )
    }

    /// 从错误响应中提取 `message` 字段
    async fn error_message(response: Response) -> String {
        let status = response.status();
        match response.json::<ErrorBody>().await {
            Ok(ErrorBody {
                message: Some(message),
            }) => message,
            _ => format!("Cannot connect (HTTP {})", status.as_u16()),
        }
    }
}

#[async_trait]
impl UploadClient for TachoClient {
    async fn verify(&self) -> Result<()> {
        let url = format!("{}/verify", self.import_url());
        debug!("校验凭据: {}", url);

        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| anyhow!("Cannot connect: {}", e))?;

        if !response.status().is_success() {
            return Err(anyhow!(Self::error_message(response).await));
        }
        Ok(())
    }

    async fn upload(&self, request: UploadRequest) -> Result<UploadReceipt> {
        let file_name = request.file_name.clone();

        let response = self
            .client
            .post(self.import_url())
            .header(API_KEY_HEADER, &self.api_key)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("上传请求失败: {}", file_name))?;

        let status = response.status();
        if !status.is_success() {
            warn!("上传被拒绝 {}: HTTP {}", file_name, status.as_u16());
            return Err(anyhow!("Error occured by API: HTTP {}", status.as_u16()));
        }

        let body: ImportResponse = response
            .json()
            .await
            .with_context(|| format!("无法解析导入响应: {}", file_name))?;

        job_id(body.job_id)
            .map(|job_id| UploadReceipt { job_id })
            .ok_or_else(|| anyhow!("Error occured by API: response has no jobId"))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
