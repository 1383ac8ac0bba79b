//! 压缩包就地解压，失败时回滚本次新建的条目并隔离原压缩包

use crate::core::guard::{PathGuard, RemovalPolicy};
use crate::error::{SyncError, SyncResult};
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 成功输出目录名
pub const ARCHIVED_DIR: &str = "Archived";
/// 失败输出目录名（也用于隔离损坏的压缩包）
pub const FAILED_DIR: &str = "Failed";

/// 压缩包解压器
pub struct ArchiveExpander<'a> {
    guard: &'a PathGuard,
    removal: RemovalPolicy,
}

impl<'a> ArchiveExpander<'a> {
    pub fn new(guard: &'a PathGuard, removal: RemovalPolicy) -> Self {
        Self { guard, removal }
    }

    /// 解压 `archive` 到 `dest_dir`
    ///
    /// 成功时删除原压缩包，调用方应以相同深度重新扫描 `dest_dir`。
    /// 失败时清理本次新建的条目，并把压缩包移到根目录的 `Failed` 下，然后返回错误。
    pub fn expand(&self, archive: &Path, dest_dir: &Path) -> SyncResult<()> {
        let before = snapshot(dest_dir).unwrap_or_else(|e| {
            warn!("解压前读取目录失败 {}: {}", dest_dir.display(), e);
            HashSet::new()
        });

        let result = extract(archive, dest_dir)
            .and_then(|_| self.guard.remove(archive, self.removal));

        match result {
            Ok(()) => {
                info!("[unzip] 已解压 {}，原压缩包已移除", archive.display());
                Ok(())
            }
            Err(e) => {
                warn!("[unzip] 解压失败 {}: {}", archive.display(), e);
                self.rollback(dest_dir, &before);
                self.quarantine(archive);
                Err(e)
            }
        }
    }

    /// 删除解压失败时新出现的条目
    fn rollback(&self, dest_dir: &Path, before: &HashSet<OsString>) {
        let after = match snapshot(dest_dir) {
            Ok(names) => names,
            Err(e) => {
                warn!("解压后读取目录失败 {}: {}", dest_dir.display(), e);
                return;
            }
        };

        for name in after.difference(before) {
            let target = dest_dir.join(name);
            match self.guard.remove(&target, self.removal) {
                Ok(()) => debug!("已清理残留条目: {}", target.display()),
                Err(e) => warn!("清理残留条目失败 {}: {}", target.display(), e),
            }
        }
    }

    /// 把损坏的压缩包移到 `Failed`
    fn quarantine(&self, archive: &Path) {
        if fs::symlink_metadata(archive).is_err() {
            return;
        }

        let failed_dir = self.guard.root().join(FAILED_DIR);
        if let Err(e) = ensure_dir(self.guard, &failed_dir) {
            warn!("无法创建 {}: {}", failed_dir.display(), e);
            return;
        }

        let Some(name) = archive.file_name() else {
            return;
        };
        let target = failed_dir.join(name);
        let target = match self.guard.check_within(&failed_dir, &target) {
            Ok(t) => t,
            Err(_) => return,
        };

        if fs::symlink_metadata(&target).is_ok() {
            if let Err(e) = self.guard.remove(&target, self.removal) {
                warn!("无法替换已存在的 {}: {}", target.display(), e);
                return;
            }
        }

        match self.guard.rename(archive, &target) {
            Ok(_) => info!("损坏的压缩包已移至 {}", target.display()),
            Err(e) => warn!("移动损坏的压缩包失败 {}: {}", archive.display(), e),
        }
    }
}

fn extract(archive: &Path, dest_dir: &Path) -> SyncResult<()> {
    let file = File::open(archive).map_err(|e| SyncError::io(archive, e))?;
    let to_archive_err = |source| SyncError::Archive {
        path: archive.to_path_buf(),
        source,
    };
    let mut zip = zip::ZipArchive::new(file).map_err(to_archive_err)?;
    zip.extract(dest_dir).map_err(to_archive_err)
}

fn snapshot(dir: &Path) -> std::io::Result<HashSet<OsString>> {
    fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect()
}

/// 在根目录内创建目录（已存在则跳过）
pub(crate) fn ensure_dir(guard: &PathGuard, dir: &Path) -> SyncResult<PathBuf> {
    let dir = guard.check_strict(dir)?;
    if !dir.is_dir() {
        fs::create_dir_all(&dir).map_err(|e| SyncError::io(&dir, e))?;
    }
    Ok(dir)
}
