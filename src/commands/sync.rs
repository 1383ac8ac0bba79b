use crate::config::ApiConfig;
use crate::core::engine::{CycleHandle, FileRow, FileStatus, SyncEvent};
use crate::core::scheduler::{CycleRunner, TriggerReason};
use crate::core::{SyncConfig, SyncEngine, SyncReport, SyncSession};
use crate::db::{self, Preset, SettingKey};
use crate::upload::{TachoClient, UploadClient};
use crate::AppState;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// 按当前设置执行同步的入口（调度器和"立即同步"共用）
pub struct SyncRunner {
    db: Arc<SqlitePool>,
    api: ApiConfig,
    config: SyncConfig,
    events: Option<mpsc::Sender<SyncEvent>>,
    /// 扫描和派发阶段正在进行
    busy: Arc<AtomicBool>,
}

impl SyncRunner {
    pub fn new(
        db: Arc<SqlitePool>,
        api: ApiConfig,
        config: SyncConfig,
        events: Option<mpsc::Sender<SyncEvent>>,
    ) -> Self {
        Self {
            db,
            api,
            config,
            events,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 根据已保存的设置组装会话；`verify` 时先校验凭据
    pub async fn session(&self, verify: bool) -> Result<SyncSession> {
        let preset = Preset::load(&self.db).await?;
        if preset.folderPath.is_empty() {
            return Err(anyhow!("Please select a folder first."));
        }
        if !preset.has_credentials() {
            return Err(anyhow!("Please connect first."));
        }

        let client = TachoClient::new(
            &self.api.base_url,
            &preset.companyId,
            &preset.apiKey,
            self.api.timeout_secs,
        )?;
        if verify {
            // 凭据失效时整次同步失败，而不是逐个文件失败
            client.verify().await?;
        }
        Ok(SyncSession {
            root: PathBuf::from(preset.folderPath),
            client: Arc::new(client),
        })
    }

    /// 开始一次同步，上传全部派发后返回
    pub async fn start_cycle(&self, reason: TriggerReason) -> Result<CycleHandle> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("同步正在进行中"));
        }
        let busy = self.busy.clone();
        scopeguard::defer! {
            busy.store(false, Ordering::SeqCst);
        }

        let result = self.dispatch(reason).await;
        if let Err(e) = &result {
            self.log(format!("Sync failed: {}", e)).await;
        }
        result
    }

    async fn dispatch(&self, reason: TriggerReason) -> Result<CycleHandle> {
        let session = self.session(reason == TriggerReason::Manual).await?;
        let engine = SyncEngine::with_config(self.config.clone());

        let handle = engine
            .run_cycle(&session, reason, self.events.clone())
            .await?;
        db::set_setting(&self.db, SettingKey::LastSync, &handle.last_sync).await?;
        Ok(handle)
    }

    async fn log(&self, message: String) {
        if let Some(tx) = &self.events {
            let _ = tx.send(SyncEvent::Log(message)).await;
        }
    }
}

#[async_trait]
impl CycleRunner for SyncRunner {
    async fn run_cycle(&self, reason: TriggerReason) -> Result<()> {
        let handle = self.start_cycle(reason).await?;
        info!("同步 {} 已派发 {} 个文件", handle.cycle_id, handle.files);

        // 上传结果在后台处理，不阻塞调度器
        tokio::spawn(async move {
            let report = handle.wait().await;
            if !report.errors.is_empty() {
                error!("同步 {} 有 {} 个错误", report.cycle_id, report.errors.len());
            }
        });
        Ok(())
    }
}

/// 立即同步，等待所有文件处理完毕
pub async fn sync_now(state: &AppState) -> Result<SyncReport, String> {
    let handle = state
        .runner()
        .start_cycle(TriggerReason::Manual)
        .await
        .map_err(|e| e.to_string())?;
    Ok(handle.wait().await)
}

/// 扫描目录（包括解压）并返回文件列表，不上传
pub async fn scan_folder(state: &AppState, root: Option<&Path>) -> Result<Vec<FileRow>, String> {
    let root = match root {
        Some(p) => p.to_path_buf(),
        None => {
            let folder = db::get_setting(&state.db, SettingKey::FolderPath)
                .await
                .map_err(|e| format!("加载设置失败: {}", e))?;
            if folder.is_empty() {
                return Err("Please select a folder first.".to_string());
            }
            PathBuf::from(folder)
        }
    };

    let engine = SyncEngine::with_config(state.sync.sync_config());
    let files = engine.refresh(&root).await.map_err(|e| e.to_string())?;

    Ok(files
        .into_iter()
        .map(|f| FileRow {
            absolute_path: f.absolute_path,
            relative_path: f.relative_path,
            status: FileStatus::NotSynced,
        })
        .collect())
}
