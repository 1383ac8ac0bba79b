//! 一次同步：刷新列表、并发上传、按结果移动文件

use crate::core::guard::RemovalPolicy;
use crate::core::relocator::{FileRelocator, SyncOutcome};
use crate::core::scanner::{DiscoveredFile, FileScanner, ScanConfig};
use crate::core::scheduler::TriggerReason;
use crate::error::{SyncError, SyncResult};
use crate::upload::{UploadClient, UploadRequest, DOWNLOAD_DATE_FORMAT};
use base64::Engine as _;
use chrono::{DateTime, Local, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// `last_sync` 的显示格式
pub const LAST_SYNC_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 同步配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 扫描配置
    pub scan_config: ScanConfig,
    /// 请求刷新文件列表后的等待时间
    pub settle_delay: Duration,
    /// 覆盖已存在目标时的删除策略
    pub removal: RemovalPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            scan_config: ScanConfig::default(),
            settle_delay: Duration::from_millis(2000),
            removal: RemovalPolicy::default(),
        }
    }
}

/// 文件状态（前端表格中显示的值）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileStatus {
    #[serde(rename = "Not Synced")]
    NotSynced,
    Synchronizing,
    Synced,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileStatus::NotSynced => "Not Synced",
            FileStatus::Synchronizing => "Synchronizing",
            FileStatus::Synced => "Synced",
        })
    }
}

impl From<SyncOutcome> for FileStatus {
    fn from(outcome: SyncOutcome) -> Self {
        match outcome {
            SyncOutcome::Synced => FileStatus::Synced,
            SyncOutcome::NotSynced => FileStatus::NotSynced,
        }
    }
}

/// 一个文件在列表中的一行
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRow {
    pub absolute_path: PathBuf,
    pub relative_path: PathBuf,
    pub status: FileStatus,
}

impl FileRow {
    fn new(file: &DiscoveredFile, status: FileStatus) -> Self {
        Self {
            absolute_path: file.absolute_path.clone(),
            relative_path: file.relative_path.clone(),
            status,
        }
    }
}

/// 发给前端（协作方）的事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum SyncEvent {
    FilesRefreshed(Vec<FileRow>),
    StatusChanged(FileRow),
    LastSync(String),
    Log(String),
}

/// 一次同步所需的上下文：根目录和已认证的上传客户端
#[derive(Clone)]
pub struct SyncSession {
    pub root: PathBuf,
    pub client: Arc<dyn UploadClient>,
}

/// 同步报告（所有上传结束后生成）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub cycle_id: String,
    pub reason: String,
    pub start_time: i64,
    pub end_time: i64,
    pub files_synced: u32,
    pub files_failed: u32,
    pub errors: Vec<String>,
}

/// 已派发的同步；上传仍在后台进行
pub struct CycleHandle {
    pub cycle_id: String,
    pub files: usize,
    /// 派发完成时的时间（即持久化的 `last_sync`）
    pub last_sync: String,
    completion: JoinHandle<SyncReport>,
}

impl CycleHandle {
    /// 等待所有上传和移动结束
    pub async fn wait(self) -> SyncReport {
        let cycle_id = self.cycle_id.clone();
        match self.completion.await {
            Ok(report) => report,
            Err(e) => {
                error!("同步任务异常结束 {}: {}", cycle_id, e);
                SyncReport {
                    cycle_id,
                    reason: String::new(),
                    start_time: 0,
                    end_time: Utc::now().timestamp(),
                    files_synced: 0,
                    files_failed: 0,
                    errors: vec![e.to_string()],
                }
            }
        }
    }
}

/// 单个文件的上传结果
struct UploadResult {
    file: DiscoveredFile,
    outcome: SyncOutcome,
    error: Option<String>,
}

/// 同步引擎
pub struct SyncEngine {
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn with_config(config: SyncConfig) -> Self {
        Self { config }
    }

    /// 扫描根目录（包括就地解压），返回发现的文件
    pub async fn refresh(&self, root: &Path) -> SyncResult<Vec<DiscoveredFile>> {
        if !root.is_dir() {
            return Err(SyncError::NotConfigured(format!(
                "同步目录不存在: {}",
                root.display()
            )));
        }

        let scanner = FileScanner::new(self.config.scan_config.clone());
        let root = root.to_path_buf();
        // 使用 spawn_blocking 避免阻塞 async runtime
        tokio::task::spawn_blocking(move || scanner.scan(&root).collect::<Vec<_>>())
            .await
            .map_err(|e| SyncError::io(PathBuf::new(), std::io::Error::other(e)))
    }

    /// 运行一次同步：刷新列表 → 等待 → 标记处理中 → 并发上传，结果逐个回来时移动文件
    ///
    /// 所有上传派发完成后立即返回；上传和移动在后台继续。
    pub async fn run_cycle(
        &self,
        session: &SyncSession,
        reason: TriggerReason,
        events: Option<mpsc::Sender<SyncEvent>>,
    ) -> SyncResult<CycleHandle> {
        let cycle_id = uuid::Uuid::new_v4().to_string();
        let start_time = Utc::now().timestamp();

        info!(
            "开始同步 {} (原因: {}, 目录: {})",
            cycle_id,
            reason,
            session.root.display()
        );

        let files = self.refresh(&session.root).await?;
        let rows: Vec<FileRow> = files
            .iter()
            .map(|f| FileRow::new(f, FileStatus::NotSynced))
            .collect();
        emit(&events, SyncEvent::FilesRefreshed(rows)).await;

        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }

        emit(&events, SyncEvent::Log("Processing sync..".to_string())).await;
        for file in &files {
            emit(
                &events,
                SyncEvent::StatusChanged(FileRow::new(file, FileStatus::Synchronizing)),
            )
            .await;
        }

        // 先读完所有文件再处理任何结果：移动一级子目录时，同目录的文件必须已经读入内存
        let mut pending = FuturesUnordered::new();
        for file in files.iter().cloned() {
            let request = build_request(&file.absolute_path).await;
            let client = session.client.clone();
            pending.push(tokio::spawn(upload_file(client, file, request)));
        }
        let file_count = files.len();
        info!("已派发 {} 个文件的上传", file_count);

        let last_sync = Local::now().format(LAST_SYNC_FORMAT).to_string();
        emit(&events, SyncEvent::LastSync(last_sync.clone())).await;

        let relocator = Arc::new(FileRelocator::new(&session.root, self.config.removal));
        let reason_label = reason.to_string();
        let id = cycle_id.clone();

        let completion = tokio::spawn(async move {
            let mut report = SyncReport {
                cycle_id: id,
                reason: reason_label,
                start_time,
                end_time: 0,
                files_synced: 0,
                files_failed: 0,
                errors: Vec::new(),
            };

            while let Some(joined) = pending.next().await {
                let result = match joined {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("上传任务异常结束: {}", e);
                        report.files_failed += 1;
                        report.errors.push(e.to_string());
                        continue;
                    }
                };

                match result.outcome {
                    SyncOutcome::Synced => report.files_synced += 1,
                    SyncOutcome::NotSynced => report.files_failed += 1,
                }
                if let Some(err) = &result.error {
                    report.errors.push(format!(
                        "{}: {}",
                        result.file.relative_path.display(),
                        err
                    ));
                }

                // 移动失败不影响上报的状态
                let mover = relocator.clone();
                let path = result.file.absolute_path.clone();
                let outcome = result.outcome;
                match tokio::task::spawn_blocking(move || mover.relocate(&path, outcome)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(
                        "移动文件失败 {}: {}",
                        result.file.absolute_path.display(),
                        e
                    ),
                    Err(e) => warn!("移动任务异常结束: {}", e),
                }

                emit(
                    &events,
                    SyncEvent::StatusChanged(FileRow::new(&result.file, result.outcome.into())),
                )
                .await;
            }

            report.end_time = Utc::now().timestamp();
            info!(
                "同步完成 {}: 成功 {}, 失败 {}",
                report.cycle_id, report.files_synced, report.files_failed
            );
            report
        });

        Ok(CycleHandle {
            cycle_id,
            files: file_count,
            last_sync,
            completion,
        })
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

async fn upload_file(
    client: Arc<dyn UploadClient>,
    file: DiscoveredFile,
    request: anyhow::Result<UploadRequest>,
) -> UploadResult {
    let outcome = match request {
        Ok(request) => client.upload(request).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(receipt) => {
            debug!("上传成功 {} (job {})", file.relative_path.display(), receipt.job_id);
            UploadResult {
                file,
                outcome: SyncOutcome::Synced,
                error: None,
            }
        }
        Err(e) => {
            warn!("上传失败 {}: {}", file.relative_path.display(), e);
            UploadResult {
                file,
                outcome: SyncOutcome::NotSynced,
                error: Some(e.to_string()),
            }
        }
    }
}

async fn build_request(path: &Path) -> anyhow::Result<UploadRequest> {
    let data = tokio::fs::read(path).await?;
    let modified = tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .map(DateTime::<Local>::from)
        .unwrap_or_else(|_| Local::now());

    Ok(UploadRequest {
        file_name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        download_date: modified.format(DOWNLOAD_DATE_FORMAT).to_string(),
        file_bytes: base64::engine::general_purpose::STANDARD.encode(data),
    })
}

/// 发送事件
async fn emit(tx: &Option<mpsc::Sender<SyncEvent>>, event: SyncEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::UploadReceipt;
    use async_trait::async_trait;
    use std::fs;
    use tempfile::TempDir;

    /// 文件名以 "ok" 开头的上传成功
    struct FakeClient;

    #[async_trait]
    impl UploadClient for FakeClient {
        async fn verify(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn upload(&self, request: UploadRequest) -> anyhow::Result<UploadReceipt> {
            assert!(!request.file_bytes.is_empty());
            if request.file_name.starts_with("ok") {
                Ok(UploadReceipt {
                    job_id: format!("job-{}", request.file_name),
                })
            } else {
                Err(anyhow::anyhow!("rejected"))
            }
        }

        fn name(&self) -> &str {
            "fake"
        }
    }

    fn engine() -> SyncEngine {
        SyncEngine::with_config(SyncConfig {
            scan_config: ScanConfig {
                removal: RemovalPolicy::Permanent,
                ..ScanConfig::default()
            },
            settle_delay: Duration::ZERO,
            removal: RemovalPolicy::Permanent,
        })
    }

    #[tokio::test]
    async fn cycle_uploads_and_relocates_every_file() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::write(root.join("ok-top.ddd"), b"1").unwrap();
        fs::write(root.join("bad-top.esm"), b"2").unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub/ok-inner.ddd"), b"3").unwrap();

        let session = SyncSession {
            root: root.to_path_buf(),
            client: Arc::new(FakeClient),
        };
        let (tx, mut rx) = mpsc::channel(64);
        let handle = engine()
            .run_cycle(&session, TriggerReason::Manual, Some(tx))
            .await
            .unwrap();
        assert_eq!(handle.files, 3);

        let report = handle.wait().await;
        assert_eq!(report.files_synced, 2);
        assert_eq!(report.files_failed, 1);

        assert!(root.join("Archived/ok-top.ddd").is_file());
        assert!(root.join("Archived/sub/ok-inner.ddd").is_file());
        assert!(root.join("Failed/bad-top.esm").is_file());
        assert!(!root.join("sub").exists());

        let mut terminal = Vec::new();
        let mut saw_last_sync = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                SyncEvent::StatusChanged(row) if row.status != FileStatus::Synchronizing => {
                    terminal.push(row.status)
                }
                SyncEvent::LastSync(_) => saw_last_sync = true,
                _ => {}
            }
        }
        assert_eq!(terminal.len(), 3);
        assert!(saw_last_sync);
    }

    #[tokio::test]
    async fn missing_root_is_rejected_before_cycle() {
        let tmp = TempDir::new().unwrap();
        let session = SyncSession {
            root: tmp.path().join("gone"),
            client: Arc::new(FakeClient),
        };

        let result = engine()
            .run_cycle(&session, TriggerReason::Scheduled, None)
            .await;

        assert!(matches!(result, Err(SyncError::NotConfigured(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn siblings_are_read_before_their_directory_moves() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir(root.join("sub")).unwrap();
        for i in 0..300 {
            fs::write(root.join(format!("sub/ok-{i}.ddd")), b"tacho").unwrap();
        }

        let session = SyncSession {
            root: root.to_path_buf(),
            client: Arc::new(FakeClient),
        };
        let report = engine()
            .run_cycle(&session, TriggerReason::Manual, None)
            .await
            .unwrap()
            .wait()
            .await;

        assert_eq!(report.files_failed, 0, "{:?}", report.errors.first());
        assert_eq!(report.files_synced, 300);
        assert_eq!(fs::read_dir(root.join("Archived/sub")).unwrap().count(), 300);
        assert!(!root.join("Failed").exists());
    }

    #[test]
    fn status_serializes_as_display_text() {
        assert_eq!(
            serde_json::to_string(&FileStatus::NotSynced).unwrap(),
            "\"Not Synced\""
        );
        assert_eq!(FileStatus::from(SyncOutcome::Synced).to_string(), "Synced");
    }
}
