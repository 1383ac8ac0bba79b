use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

pub mod commands;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod logging;
pub mod upload;

pub use crate::core::{SyncConfig, SyncEngine, SyncEvent, SyncReport};
pub use commands::sync::SyncRunner;
pub use db::models::Preset;
pub use error::{SyncError, SyncResult};

use crate::config::{ApiConfig, ConfigSection, SyncSettings};
use crate::core::{SchedulerHandle, SyncScheduler};

/// 应用状态，在各个命令之间共享
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub config_dir: PathBuf,
    pub api: ApiConfig,
    pub sync: SyncSettings,
    /// 发给前端的事件
    pub events: Option<mpsc::Sender<SyncEvent>>,
    /// 当前运行的调度器
    pub scheduler: Arc<Mutex<Option<SchedulerHandle>>>,
    runner: Arc<SyncRunner>,
}

impl AppState {
    pub async fn new(events: Option<mpsc::Sender<SyncEvent>>) -> anyhow::Result<Self> {
        let config_dir = dirs::data_dir();
        std::fs::create_dir_all(&config_dir)?;

        // 初始化数据库（带连接池配置）
        let db_path = config_dir.join("roadsync.db");
        // Windows 路径需要转换反斜杠为正斜杠
        let db_path_str = db_path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid database path"))?
            .replace('\\', "/");

        let db = SqlitePoolOptions::new()
            .max_connections(5) // SQLite 单文件，不需要太多连接
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(&format!("sqlite:{}?mode=rwc", db_path_str))
            .await?;

        // 运行数据库迁移
        sqlx::migrate!("./migrations").run(&db).await?;

        let api = ApiConfig::load(&config_dir);
        let sync = SyncSettings::load(&config_dir);
        Ok(Self::with_parts(db, config_dir, api, sync, events))
    }

    /// 用已有的连接池和配置组装状态
    pub fn with_parts(
        db: SqlitePool,
        config_dir: PathBuf,
        api: ApiConfig,
        sync: SyncSettings,
        events: Option<mpsc::Sender<SyncEvent>>,
    ) -> Self {
        let db = Arc::new(db);
        let runner = Arc::new(SyncRunner::new(
            db.clone(),
            api.clone(),
            sync.sync_config(),
            events.clone(),
        ));

        Self {
            db,
            config_dir,
            api,
            sync,
            events,
            scheduler: Arc::new(Mutex::new(None)),
            runner,
        }
    }

    pub fn runner(&self) -> Arc<SyncRunner> {
        self.runner.clone()
    }

    /// 启动调度器（已启动时直接返回）
    pub async fn ensure_scheduler(&self) {
        let mut slot = self.scheduler.lock().await;
        if slot.is_none() {
            let scheduler = SyncScheduler::new(self.runner.clone(), self.sync.scheduler_options());
            *slot = Some(scheduler.spawn());
            tracing::debug!("调度器已启动");
        }
    }

    /// 清理资源（应用关闭时调用）
    pub async fn cleanup(&self) {
        tracing::info!("正在清理应用资源...");

        // 1. 停止调度器
        if let Some(handle) = self.scheduler.lock().await.take() {
            handle.shutdown().await;
        }

        // 2. 关闭数据库连接池
        tracing::debug!("关闭数据库连接池...");
        self.db.close().await;

        tracing::info!("资源清理完成");
    }
}

pub mod dirs {
    use std::path::PathBuf;

    const APP_DIR: &str = "roadsync";

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }
    }

    /// 默认应用目录
    pub fn default_data_dir() -> PathBuf {
        config_dir()
            .map(|p| p.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from(".roadsync"))
    }

    /// 实际数据目录：默认目录下 `config.json` 的 `data_path` 指向已存在的目录时使用它
    pub fn data_dir() -> PathBuf {
        let default_dir = default_data_dir();
        std::fs::read_to_string(default_dir.join("config.json"))
            .ok()
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .and_then(|config| config.get("data_path")?.as_str().map(PathBuf::from))
            .filter(|p| p.is_dir())
            .inspect(|p| tracing::debug!("使用自定义数据路径: {:?}", p))
            .unwrap_or(default_dir)
    }
}
