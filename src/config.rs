//! 应用配置模块

use crate::core::guard::RemovalPolicy;
use crate::core::scanner::{ScanConfig, MAX_SCAN_DEPTH};
use crate::core::scheduler::SchedulerOptions;
use crate::core::SyncConfig;
use crate::upload::REQUEST_TIMEOUT_SECS;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

const CONFIG_FILE: &str = "config.json";

/// `config.json` 中的一个配置段
pub trait ConfigSection: Serialize + DeserializeOwned + Default {
    /// 配置段在 JSON 中的键名
    const KEY: &'static str;

    /// 从配置文件加载，缺失或格式错误时使用默认值
    fn load(config_dir: &Path) -> Self {
        fs::read_to_string(config_dir.join(CONFIG_FILE))
            .ok()
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .and_then(|config| config.get(Self::KEY).cloned())
            .and_then(|section| serde_json::from_value::<Self>(section).ok())
            .unwrap_or_default()
    }

    /// 保存配置段，保留文件中的其它配置
    fn save(&self, config_dir: &Path) -> io::Result<()> {
        let config_file = config_dir.join(CONFIG_FILE);

        // 读取现有配置
        let mut config: serde_json::Value = if config_file.exists() {
            let content = fs::read_to_string(&config_file)?;
            serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
        } else {
            serde_json::json!({})
        };
        if !config.is_object() {
            config = serde_json::json!({});
        }

        config[Self::KEY] = serde_json::to_value(self)?;

        fs::write(&config_file, serde_json::to_string_pretty(&config)?)
    }
}

/// 导入接口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    /// 接口地址，例如 `https://api.example.com`
    #[serde(default)]
    pub base_url: String,
    /// 请求超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    REQUEST_TIMEOUT_SECS
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ConfigSection for ApiConfig {
    const KEY: &'static str = "api";
}

/// 同步行为配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// 最大扫描深度
    #[serde(default = "default_max_scan_depth")]
    pub max_scan_depth: usize,
    /// 刷新列表后等待的毫秒数
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// 删除策略: "trash" 或 "permanent"
    #[serde(default)]
    pub removal: RemovalPolicy,
    /// 休眠检测间隔（秒）
    #[serde(default = "default_resume_check_secs")]
    pub resume_check_secs: u64,
    /// 墙钟与单调时钟相差超过该秒数时视为系统唤醒
    #[serde(default = "default_resume_drift_secs")]
    pub resume_drift_secs: i64,
}

fn default_max_scan_depth() -> usize {
    MAX_SCAN_DEPTH
}

fn default_settle_delay_ms() -> u64 {
    2000
}

fn default_resume_check_secs() -> u64 {
    30
}

fn default_resume_drift_secs() -> i64 {
    120
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_scan_depth: default_max_scan_depth(),
            settle_delay_ms: default_settle_delay_ms(),
            removal: RemovalPolicy::default(),
            resume_check_secs: default_resume_check_secs(),
            resume_drift_secs: default_resume_drift_secs(),
        }
    }
}

impl ConfigSection for SyncSettings {
    const KEY: &'static str = "sync";
}

impl SyncSettings {
    /// 转换为同步引擎配置
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            scan_config: ScanConfig {
                max_depth: self.max_scan_depth,
                removal: self.removal,
                ..ScanConfig::default()
            },
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            removal: self.removal,
        }
    }

    /// 转换为调度器配置
    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            resume_check: Duration::from_secs(self.resume_check_secs.max(1)),
            resume_drift: chrono::TimeDelta::seconds(self.resume_drift_secs.max(1)),
        }
    }
}
