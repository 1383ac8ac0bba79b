//! 凭据、同步目录和计划相关命令

use crate::core::scheduler::{SyncTrigger, TriggerReason};
use crate::core::SyncReport;
use crate::db::{self, Preset, SettingKey};
use crate::upload::tacho::validate_credentials;
use crate::upload::{TachoClient, UploadClient};
use crate::AppState;
use std::path::Path;
use tracing::{info, warn};

/// 获取全部设置
pub async fn get_preset(state: &AppState) -> Result<Preset, String> {
    Preset::load(&state.db)
        .await
        .map_err(|e| format!("加载设置失败: {}", e))
}

/// 校验凭据并保存
pub async fn connect(state: &AppState, company_id: &str, api_key: &str) -> Result<Preset, String> {
    let company_id = company_id.trim();
    let api_key = api_key.trim();
    validate_credentials(company_id, api_key).map_err(|e| e.to_string())?;

    let client = TachoClient::new(
        &state.api.base_url,
        company_id,
        api_key,
        state.api.timeout_secs,
    )
    .map_err(|e| e.to_string())?;
    client.verify().await.map_err(|e| e.to_string())?;

    db::set_setting(&state.db, SettingKey::CompanyId, company_id)
        .await
        .map_err(|e| e.to_string())?;
    db::set_setting(&state.db, SettingKey::ApiKey, api_key)
        .await
        .map_err(|e| e.to_string())?;
    db::refresh_last_sync(&state.db)
        .await
        .map_err(|e| e.to_string())?;

    info!("已连接: {}", client.name());
    get_preset(state).await
}

/// 保存同步目录
pub async fn set_folder_path(state: &AppState, path: &str) -> Result<(), String> {
    let path = path.trim();
    if path.is_empty() {
        return Err("Please select a folder first.".to_string());
    }
    if !Path::new(path).is_dir() {
        return Err(format!("目录不存在: {}", path));
    }

    db::set_setting(&state.db, SettingKey::FolderPath, path)
        .await
        .map_err(|e| e.to_string())
}

/// 应用同步计划的结果
#[derive(Debug)]
pub struct ScheduleApplied {
    pub trigger: SyncTrigger,
    /// `application_start` 立即执行的那次同步
    pub startup: Option<SyncReport>,
}

/// 保存同步计划并交给调度器
pub async fn set_schedule(state: &AppState, schedule: &str) -> Result<ScheduleApplied, String> {
    let trigger: SyncTrigger = schedule.parse().map_err(|e: anyhow::Error| e.to_string())?;

    let preset = get_preset(state).await?;
    if preset.folderPath.is_empty() {
        return Err("Please select a folder first.".to_string());
    }
    if !preset.has_credentials() {
        return Err("Please connect first.".to_string());
    }

    db::set_setting(&state.db, SettingKey::SyncSchedule, &trigger.to_string())
        .await
        .map_err(|e| e.to_string())?;

    state.ensure_scheduler().await;

    // 启动同步在这里执行并等待结束，调度器只需清除计时器
    let scheduled = match trigger {
        SyncTrigger::ApplicationStart => SyncTrigger::Manual,
        other => other,
    };
    if let Some(handle) = state.scheduler.lock().await.as_ref() {
        handle.apply(scheduled).await.map_err(|e| e.to_string())?;
    }

    let startup = match trigger {
        SyncTrigger::ApplicationStart => {
            let handle = state
                .runner()
                .start_cycle(TriggerReason::Startup)
                .await
                .map_err(|e| e.to_string())?;
            Some(handle.wait().await)
        }
        _ => None,
    };

    Ok(ScheduleApplied { trigger, startup })
}

/// 启动时恢复上次保存的计划；返回应用的触发方式
pub async fn resume_previous_schedule(state: &AppState) -> Result<Option<SyncTrigger>, String> {
    let preset = get_preset(state).await?;
    let trigger: SyncTrigger = preset
        .syncSchedule
        .parse()
        .map_err(|e: anyhow::Error| e.to_string())?;

    if trigger == SyncTrigger::Manual || preset.folderPath.is_empty() {
        return Ok(None);
    }
    if !preset.has_credentials() {
        warn!("未连接，不恢复同步计划");
        return Ok(None);
    }

    let client = TachoClient::new(
        &state.api.base_url,
        &preset.companyId,
        &preset.apiKey,
        state.api.timeout_secs,
    )
    .map_err(|e| e.to_string())?;
    if let Err(e) = client.verify().await {
        warn!("连接校验失败，不恢复同步计划: {}", e);
        return Ok(None);
    }

    state.ensure_scheduler().await;
    if let Some(handle) = state.scheduler.lock().await.as_ref() {
        handle.apply(trigger).await.map_err(|e| e.to_string())?;
    }
    info!("已恢复同步计划: {}", trigger);
    Ok(Some(trigger))
}
