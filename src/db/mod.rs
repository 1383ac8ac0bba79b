pub mod models;
pub use models::*;

use crate::core::engine::LAST_SYNC_FORMAT;
use anyhow::Result;
pub use sqlx::SqlitePool;

/// 读取一个设置；不存在时返回空字符串
pub async fn get_setting(pool: &SqlitePool, key: SettingKey) -> Result<String> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE name = ?")
        .bind(key.as_str())
        .fetch_optional(pool)
        .await?;
    Ok(value.unwrap_or_default())
}

/// 写入一个设置
pub async fn set_setting(pool: &SqlitePool, key: SettingKey, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (name, value) VALUES (?, ?)
        ON CONFLICT(name) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(key.as_str())
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

/// 更新 `last_sync` 为当前本地时间，返回写入的值
pub async fn refresh_last_sync(pool: &SqlitePool) -> Result<String> {
    let now = chrono::Local::now().format(LAST_SYNC_FORMAT).to_string();
    set_setting(pool, SettingKey::LastSync, &now).await?;
    Ok(now)
}

impl Preset {
    /// 从数据库加载全部设置
    pub async fn load(pool: &SqlitePool) -> Result<Self> {
        let rows = sqlx::query_as::<_, SettingRow>("SELECT name, value FROM settings")
            .fetch_all(pool)
            .await?;

        let mut preset = Preset::default();
        for row in rows {
            let slot = match row.name.as_str() {
                "company_id" => &mut preset.companyId,
                "api_key" => &mut preset.apiKey,
                "last_sync" => &mut preset.lastSync,
                "folder_path" => &mut preset.folderPath,
                "sync_schedule" => &mut preset.syncSchedule,
                _ => continue,
            };
            *slot = row.value;
        }
        Ok(preset)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    pub(crate) async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn seeded_settings_are_empty() {
        let pool = memory_pool().await;

        let preset = Preset::load(&pool).await.unwrap();

        assert_eq!(preset, Preset::default());
        assert!(!preset.has_credentials());
    }

    #[tokio::test]
    async fn set_setting_upserts() {
        let pool = memory_pool().await;

        set_setting(&pool, SettingKey::FolderPath, "/data/a").await.unwrap();
        set_setting(&pool, SettingKey::FolderPath, "/data/b").await.unwrap();
        set_setting(&pool, SettingKey::SyncSchedule, "12H").await.unwrap();

        assert_eq!(get_setting(&pool, SettingKey::FolderPath).await.unwrap(), "/data/b");
        let preset = Preset::load(&pool).await.unwrap();
        assert_eq!(preset.folderPath, "/data/b");
        assert_eq!(preset.syncSchedule, "12H");
    }

    #[tokio::test]
    async fn last_sync_uses_display_format() {
        let pool = memory_pool().await;

        let stamp = refresh_last_sync(&pool).await.unwrap();

        assert!(chrono::NaiveDateTime::parse_from_str(&stamp, LAST_SYNC_FORMAT).is_ok());
        assert_eq!(get_setting(&pool, SettingKey::LastSync).await.unwrap(), stamp);
    }
}
