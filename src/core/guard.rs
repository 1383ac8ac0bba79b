//! 路径守卫 - 所有删除、移动、覆盖操作之前的根目录包含检查
//!
//! 路径先经过 `canonicalize`（跟随符号链接）解析；解析失败时退回到词法规范化，
//! 并尽量用最近的已存在祖先目录的真实路径拼接剩余部分，保证检查只会变得更保守。
//! 检查通过后返回解析后的路径，调用方必须用这个路径执行实际操作。

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// 删除策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalPolicy {
    /// 移入系统回收站（可恢复）
    #[default]
    Trash,
    /// 直接删除
    Permanent,
}

/// 解析路径的真实位置，失败时回退到不跟随符号链接的解析
pub fn real_resolve(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| resolve_missing(path))
}

/// 纯词法规范化：补全为绝对路径，折叠 `.` 和 `..`
pub fn lexical_resolve(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn resolve_missing(path: &Path) -> PathBuf {
    let lexical = lexical_resolve(path);
    let mut tail: Vec<OsString> = Vec::new();
    let mut cursor = lexical.as_path();

    loop {
        if let Ok(real) = fs::canonicalize(cursor) {
            return tail.iter().rev().fold(real, |acc, name| acc.join(name));
        }
        match (cursor.parent(), cursor.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                cursor = parent;
            }
            _ => return lexical,
        }
    }
}

fn contains_resolved(root: &Path, candidate: &Path) -> bool {
    if root == candidate {
        return true;
    }
    match candidate.strip_prefix(root) {
        Ok(rel) => rel
            .components()
            .all(|c| matches!(c, Component::Normal(_))),
        Err(_) => false,
    }
}

/// `candidate` 是否等于 `root` 或位于其内部（两者均按真实路径比较）
pub fn is_inside(root: &Path, candidate: &Path) -> bool {
    contains_resolved(&real_resolve(root), &real_resolve(candidate))
}

/// 绑定到一个根目录的守卫
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    pub fn new(root: &Path) -> Self {
        Self {
            root: real_resolve(root),
        }
    }

    /// 解析后的根目录
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 检查 `candidate` 位于 `base` 内部（`base` 自身也必须在根目录内）
    pub fn check_within(&self, base: &Path, candidate: &Path) -> SyncResult<PathBuf> {
        let base = self.check(base)?;
        let resolved = real_resolve(candidate);
        if contains_resolved(&base, &resolved) && resolved != base {
            Ok(resolved)
        } else {
            warn!(
                "[guard] 拒绝越出目标目录的操作: {} (目标目录 {})",
                candidate.display(),
                base.display()
            );
            Err(SyncError::Guard {
                path: candidate.to_path_buf(),
            })
        }
    }

    /// 允许等于根目录本身
    pub fn check(&self, candidate: &Path) -> SyncResult<PathBuf> {
        let resolved = real_resolve(candidate);
        if contains_resolved(&self.root, &resolved) {
            Ok(resolved)
        } else {
            warn!("[guard] 拒绝根目录外的操作: {}", candidate.display());
            Err(SyncError::Guard {
                path: candidate.to_path_buf(),
            })
        }
    }

    /// 删除或移动的对象不能是根目录本身
    pub fn check_strict(&self, candidate: &Path) -> SyncResult<PathBuf> {
        let resolved = self.check(candidate)?;
        if resolved == self.root {
            warn!("[guard] 拒绝对根目录本身操作: {}", candidate.display());
            return Err(SyncError::Guard {
                path: candidate.to_path_buf(),
            });
        }
        Ok(resolved)
    }

    /// 删除文件或目录（递归）；目标不存在时视为成功
    pub fn remove(&self, target: &Path, policy: RemovalPolicy) -> SyncResult<()> {
        let resolved = self.check_strict(target)?;

        let metadata = match fs::symlink_metadata(&resolved) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(SyncError::io(&resolved, e)),
        };

        match policy {
            RemovalPolicy::Trash => {
                trash::delete(&resolved).map_err(|e| SyncError::Removal {
                    path: resolved.clone(),
                    reason: e.to_string(),
                })?;
                debug!("已移入回收站: {}", resolved.display());
            }
            RemovalPolicy::Permanent => {
                let result = if metadata.is_dir() {
                    fs::remove_dir_all(&resolved)
                } else {
                    fs::remove_file(&resolved)
                };
                result.map_err(|e| SyncError::io(&resolved, e))?;
                debug!("已删除: {}", resolved.display());
            }
        }

        Ok(())
    }

    /// 重命名；源和目标都必须在根目录内
    pub fn rename(&self, from: &Path, to: &Path) -> SyncResult<PathBuf> {
        let from = self.check_strict(from)?;
        let to = self.check_strict(to)?;
        fs::rename(&from, &to).map_err(|e| SyncError::io(&from, e))?;
        Ok(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn root_contains_itself_and_children() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir(root.join("sub")).unwrap();

        assert!(is_inside(root, root));
        assert!(is_inside(root, &root.join("sub")));
        assert!(is_inside(root, &root.join("sub/not-yet-created.ddd")));
    }

    #[test]
    fn parent_segments_escape_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir(&root).unwrap();

        assert!(!is_inside(&root, &root.join("../escape")));
        assert!(!is_inside(&root, &root.join("sub/../../escape")));
        assert!(is_inside(&root, &root.join("sub/../inner")));
    }

    #[test]
    fn sibling_with_common_prefix_is_outside() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("data");
        let sibling = tmp.path().join("data-old");
        fs::create_dir(&root).unwrap();
        fs::create_dir(&sibling).unwrap();

        assert!(!is_inside(&root, &sibling));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_pointing_outside_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let outside = tmp.path().join("outside");
        fs::create_dir(&root).unwrap();
        fs::create_dir(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        let guard = PathGuard::new(&root);
        assert!(guard.check(&root.join("link")).is_err());
        assert!(guard.check(&root.join("link/victim.ddd")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_root_is_resolved() {
        let tmp = TempDir::new().unwrap();
        let real = tmp.path().join("real");
        fs::create_dir(&real).unwrap();
        let link = tmp.path().join("alias");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        assert!(is_inside(&link, &real.join("file.esm")));
        assert!(is_inside(&real, &link.join("Archived/file.esm")));
    }

    #[test]
    fn remove_refuses_paths_outside_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir(&root).unwrap();
        let victim = tmp.path().join("victim.txt");
        fs::write(&victim, b"keep me").unwrap();

        let guard = PathGuard::new(&root);
        let err = guard
            .remove(&root.join("../victim.txt"), RemovalPolicy::Permanent)
            .unwrap_err();

        assert!(matches!(err, SyncError::Guard { .. }));
        assert!(victim.exists());
    }

    #[test]
    fn remove_refuses_root_itself() {
        let tmp = TempDir::new().unwrap();
        let guard = PathGuard::new(tmp.path());

        assert!(guard.remove(tmp.path(), RemovalPolicy::Permanent).is_err());
        assert!(tmp.path().exists());
    }

    #[test]
    fn remove_permanent_deletes_directories_recursively() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("pkg/nested");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("a.ddd"), b"x").unwrap();

        let guard = PathGuard::new(tmp.path());
        guard
            .remove(&tmp.path().join("pkg"), RemovalPolicy::Permanent)
            .unwrap();

        assert!(!tmp.path().join("pkg").exists());
        // 再次删除不存在的路径不报错
        guard
            .remove(&tmp.path().join("pkg"), RemovalPolicy::Permanent)
            .unwrap();
    }

    #[test]
    fn check_within_rejects_target_folder_itself() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("Archived");
        fs::create_dir(&target).unwrap();
        let guard = PathGuard::new(tmp.path());

        assert!(guard.check_within(&target, &target.join("a.ddd")).is_ok());
        assert!(guard.check_within(&target, &target).is_err());
        assert!(guard
            .check_within(&target, &tmp.path().join("b.ddd"))
            .is_err());
    }
}
