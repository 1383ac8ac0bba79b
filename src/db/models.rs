#![allow(non_snake_case)]

use serde::{Deserialize, Serialize};

/// 设置项名称
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    CompanyId,
    ApiKey,
    FolderPath,
    SyncSchedule,
    LastSync,
}

impl SettingKey {
    pub fn as_str(self) -> &'static str {
        match self {
            SettingKey::CompanyId => "company_id",
            SettingKey::ApiKey => "api_key",
            SettingKey::FolderPath => "folder_path",
            SettingKey::SyncSchedule => "sync_schedule",
            SettingKey::LastSync => "last_sync",
        }
    }
}

/// 设置表中的一行
#[derive(Debug, sqlx::FromRow)]
pub struct SettingRow {
    pub name: String,
    pub value: String,
}

/// 前端启动时加载的全部设置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub companyId: String,
    pub apiKey: String,
    pub lastSync: String,
    pub folderPath: String,
    pub syncSchedule: String,
}

impl Preset {
    /// 凭据是否已填写
    pub fn has_credentials(&self) -> bool {
        !self.companyId.is_empty() && !self.apiKey.is_empty()
    }
}
