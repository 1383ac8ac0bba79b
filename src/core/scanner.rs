//! 带深度上限的目录扫描：就地解压压缩包，每个数据文件只上报一次

use crate::core::archive::{ArchiveExpander, ARCHIVED_DIR, FAILED_DIR};
use crate::core::guard::{real_resolve, PathGuard, RemovalPolicy};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 默认最大扫描深度（根目录为 0）
pub const MAX_SCAN_DEPTH: usize = 10;

/// 文件扫描器配置
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// 最大递归深度，超出的分支直接停止下探
    pub max_depth: usize,
    /// 需要上传的数据文件扩展名（不区分大小写，不带点）
    pub data_extensions: Vec<String>,
    /// 需要就地解压的压缩包扩展名
    pub archive_extension: String,
    /// 根目录下跳过的输出目录
    pub skip_dirs: Vec<String>,
    /// 清理残留、删除压缩包时使用的删除策略
    pub removal: RemovalPolicy,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_depth: MAX_SCAN_DEPTH,
            data_extensions: vec!["ddd".to_string(), "esm".to_string()],
            archive_extension: "zip".to_string(),
            skip_dirs: vec![ARCHIVED_DIR.to_string(), FAILED_DIR.to_string()],
            removal: RemovalPolicy::default(),
        }
    }
}

fn matches_extension(name: &str, wanted: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(wanted))
        .unwrap_or(false)
}

impl ScanConfig {
    pub fn is_data_file(&self, name: &str) -> bool {
        self.data_extensions
            .iter()
            .any(|ext| matches_extension(name, ext))
    }

    pub fn is_archive(&self, name: &str) -> bool {
        matches_extension(name, &self.archive_extension)
    }

    /// 仅在根目录（深度 0）生效
    pub fn is_skipped_dir(&self, name: &str) -> bool {
        self.skip_dirs.iter().any(|d| d.eq_ignore_ascii_case(name))
    }
}

/// 扫描发现的数据文件
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredFile {
    pub absolute_path: PathBuf,
    pub relative_path: PathBuf,
}

/// 文件扫描器
#[derive(Debug, Clone, Default)]
pub struct FileScanner {
    config: ScanConfig,
}

impl FileScanner {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    /// 从头开始扫描 `root`，返回惰性迭代器
    ///
    /// 遇到压缩包时会在原地解压，因此迭代过程会修改目录树。
    pub fn scan(&self, root: &Path) -> Scan<'_> {
        let root = real_resolve(root);
        info!("开始扫描目录: {}", root.display());

        let mut scan = Scan {
            config: &self.config,
            guard: PathGuard::new(&root),
            stack: Vec::new(),
            yielded: HashSet::new(),
            root,
        };
        let root = scan.root.clone();
        scan.push_dir(&root, 0);
        scan
    }
}

/// 待处理目录
struct Frame {
    dir: PathBuf,
    depth: usize,
    /// 按名称倒序存放，`pop` 即得到下一个条目
    pending: Vec<PathBuf>,
}

/// 一次扫描的状态：显式工作栈代替递归
pub struct Scan<'a> {
    config: &'a ScanConfig,
    guard: PathGuard,
    root: PathBuf,
    stack: Vec<Frame>,
    yielded: HashSet<PathBuf>,
}

impl Scan<'_> {
    fn push_dir(&mut self, dir: &Path, depth: usize) {
        if depth > self.config.max_depth {
            debug!("超过最大深度，停止下探: {}", dir.display());
            return;
        }

        let entries = match fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(e) => {
                warn!("读取目录失败 {}: {}", dir.display(), e);
                return;
            }
        };

        let mut pending: Vec<PathBuf> = Vec::new();
        for entry in entries {
            match entry {
                Ok(entry) => pending.push(entry.path()),
                Err(e) => {
                    warn!("读取目录失败 {}: {}", dir.display(), e);
                    return;
                }
            }
        }
        pending.sort_by(|a, b| b.cmp(a));

        self.stack.push(Frame {
            dir: dir.to_path_buf(),
            depth,
            pending,
        });
    }

    fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

impl Iterator for Scan<'_> {
    type Item = DiscoveredFile;

    fn next(&mut self) -> Option<DiscoveredFile> {
        loop {
            let frame = self.stack.last_mut()?;
            let Some(path) = frame.pending.pop() else {
                self.stack.pop();
                continue;
            };
            let dir = frame.dir.clone();
            let depth = frame.depth;

            // 之前的解压或重扫可能已经移走了这个条目
            let file_type = match fs::symlink_metadata(&path) {
                Ok(m) => m.file_type(),
                Err(_) => continue,
            };
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            if file_type.is_dir() {
                if depth == 0 && self.config.is_skipped_dir(&name) {
                    debug!("跳过输出目录: {}", path.display());
                    continue;
                }
                self.push_dir(&path, depth + 1);
                continue;
            }

            // 不跟随符号链接
            if !file_type.is_file() {
                continue;
            }

            if self.config.is_archive(&name) {
                let expander = ArchiveExpander::new(&self.guard, self.config.removal);
                match expander.expand(&path, &dir) {
                    // 解压可能产生新的压缩包或数据文件，按相同深度重扫当前目录
                    Ok(()) => self.push_dir(&dir, depth),
                    Err(e) => warn!("跳过压缩包 {}: {}", path.display(), e),
                }
                continue;
            }

            if self.config.is_data_file(&name) && self.yielded.insert(path.clone()) {
                let relative_path = self.relative(&path);
                debug!("发现文件: {}", relative_path.display());
                return Some(DiscoveredFile {
                    absolute_path: path,
                    relative_path,
                });
            }
        }
    }
}
