//! 上传结束后把文件（或它所在的一级子目录）移到 `Archived` / `Failed`

use crate::core::archive::{ensure_dir, ARCHIVED_DIR, FAILED_DIR};
use crate::core::guard::{PathGuard, RemovalPolicy};
use crate::error::{SyncError, SyncResult};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// 上传结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced,
    NotSynced,
}

impl SyncOutcome {
    pub fn target_dir(self) -> &'static str {
        match self {
            SyncOutcome::Synced => ARCHIVED_DIR,
            SyncOutcome::NotSynced => FAILED_DIR,
        }
    }
}

pub struct FileRelocator {
    guard: PathGuard,
    removal: RemovalPolicy,
}

impl FileRelocator {
    pub fn new(root: &Path, removal: RemovalPolicy) -> Self {
        Self {
            guard: PathGuard::new(root),
            removal,
        }
    }

    /// 移动 `file`；根目录下的文件单独移动，子目录中的文件连同整个一级子目录一起移动。
    ///
    /// 返回新位置；文件已不在原处（例如同目录的另一个文件先完成）时返回 `Ok(None)`。
    pub fn relocate(&self, file: &Path, outcome: SyncOutcome) -> SyncResult<Option<PathBuf>> {
        let root = self.guard.root().to_path_buf();
        let file = self.guard.check_strict(file)?;

        if fs::symlink_metadata(&file).is_err() {
            debug!("文件已不在原位置，跳过移动: {}", file.display());
            return Ok(None);
        }

        let relative = file
            .strip_prefix(&root)
            .map_err(|_| SyncError::Guard { path: file.clone() })?;
        let segments: Vec<_> = relative.components().collect();

        let first = match segments.first() {
            Some(Component::Normal(name)) => *name,
            other => {
                let message = format!("{:?} ({})", other, relative.display());
                warn!("[guard] 无效的一级路径: {}", message);
                return Err(SyncError::InvalidLayout(message));
            }
        };

        // 输出目录里的文件不再移动，否则会把目录移进自身
        let first_name = first.to_string_lossy();
        if first_name.eq_ignore_ascii_case(ARCHIVED_DIR)
            || first_name.eq_ignore_ascii_case(FAILED_DIR)
        {
            return Err(SyncError::InvalidLayout(format!(
                "文件已位于输出目录: {}",
                relative.display()
            )));
        }

        let target_dir = ensure_dir(&self.guard, &root.join(outcome.target_dir()))?;
        let source = root.join(first);
        let dest = self.guard.check_within(&target_dir, &target_dir.join(first))?;

        if segments.len() > 1 {
            debug!("移动整个子目录: {}", source.display());
        }

        // 先删除已存在的目标，保证移动后只剩一份
        if fs::symlink_metadata(&dest).is_ok() {
            self.guard.remove(&dest, self.removal)?;
        }

        let moved = self.guard.rename(&source, &dest)?;
        info!("已移动 {} -> {}", source.display(), moved.display());
        Ok(Some(moved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn relocator(root: &Path) -> FileRelocator {
        FileRelocator::new(root, RemovalPolicy::Permanent)
    }

    #[test]
    fn top_level_file_goes_to_archived() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::write(root.join("driver.ddd"), b"data").unwrap();

        let dest = relocator(root)
            .relocate(&root.join("driver.ddd"), SyncOutcome::Synced)
            .unwrap()
            .unwrap();

        assert!(dest.ends_with("Archived/driver.ddd"));
        assert!(!root.join("driver.ddd").exists());
        assert_eq!(fs::read(root.join("Archived/driver.ddd")).unwrap(), b"data");
    }

    #[test]
    fn nested_file_moves_whole_first_level_directory() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("sub/inner")).unwrap();
        fs::write(root.join("sub/inner/file.esm"), b"card").unwrap();
        fs::write(root.join("sub/sibling.ddd"), b"never uploaded").unwrap();

        relocator(root)
            .relocate(&root.join("sub/inner/file.esm"), SyncOutcome::NotSynced)
            .unwrap();

        assert!(!root.join("sub").exists());
        assert!(root.join("Failed/sub/inner/file.esm").is_file());
        assert!(root.join("Failed/sub/sibling.ddd").is_file());
        assert!(!root.join("Archived").exists());
    }

    #[test]
    fn existing_destination_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("Archived/batch")).unwrap();
        fs::write(root.join("Archived/batch/old.ddd"), b"old").unwrap();
        fs::create_dir(root.join("batch")).unwrap();
        fs::write(root.join("batch/new.ddd"), b"new").unwrap();
        fs::write(root.join("Archived/single.ddd"), b"old").unwrap();
        fs::write(root.join("single.ddd"), b"new").unwrap();

        let r = relocator(root);
        r.relocate(&root.join("batch/new.ddd"), SyncOutcome::Synced)
            .unwrap();
        r.relocate(&root.join("single.ddd"), SyncOutcome::Synced)
            .unwrap();

        assert!(root.join("Archived/batch/new.ddd").is_file());
        assert!(!root.join("Archived/batch/old.ddd").exists());
        assert_eq!(fs::read(root.join("Archived/single.ddd")).unwrap(), b"new");
        assert_eq!(fs::read_dir(root.join("Archived")).unwrap().count(), 2);
    }

    #[test]
    fn second_file_of_moved_directory_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir(root.join("pkg")).unwrap();
        fs::write(root.join("pkg/a.ddd"), b"a").unwrap();
        fs::write(root.join("pkg/b.ddd"), b"b").unwrap();

        let r = relocator(root);
        r.relocate(&root.join("pkg/a.ddd"), SyncOutcome::Synced)
            .unwrap();
        let second = r
            .relocate(&root.join("pkg/b.ddd"), SyncOutcome::NotSynced)
            .unwrap();

        assert!(second.is_none());
        assert!(root.join("Archived/pkg/b.ddd").is_file());
        assert!(!root.join("Failed").exists());
    }

    #[test]
    fn file_outside_root_is_refused() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir(&root).unwrap();
        let outside = tmp.path().join("outside.ddd");
        fs::write(&outside, b"x").unwrap();

        let err = relocator(&root)
            .relocate(&outside, SyncOutcome::Synced)
            .unwrap_err();

        assert!(matches!(err, SyncError::Guard { .. }));
        assert!(outside.exists());
        assert!(!root.join("Archived").exists());
    }

    #[test]
    fn root_itself_is_refused() {
        let tmp = TempDir::new().unwrap();
        assert!(relocator(tmp.path())
            .relocate(tmp.path(), SyncOutcome::Synced)
            .is_err());
    }
}
