//! 文件系统能力抽象
//!
//! 引擎只通过 `FsCapability` 访问本地文件系统；具体实现
//! （本地磁盘、测试桩）在构造时选定。

pub mod local;
pub mod names;

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub use local::LocalFs;

use crate::error::SyncWarning;

/// 文件系统家族（决定大小写折叠、禁用字符、是否有稳定 ID）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsFamily {
    Ext,
    Apfs,
    Ntfs,
    Fat,
    Exfat,
    Hgfs,
    Unknown,
}

impl FsFamily {
    /// 名字比较是否大小写不敏感
    pub fn case_insensitive(self) -> bool {
        matches!(
            self,
            FsFamily::Apfs | FsFamily::Ntfs | FsFamily::Fat | FsFamily::Exfat | FsFamily::Hgfs
        )
    }

    /// 是否提供稳定文件 ID（FAT 系与 HGFS 没有）
    pub fn stable_ids(self) -> bool {
        !matches!(self, FsFamily::Fat | FsFamily::Exfat | FsFamily::Hgfs)
    }

    /// 家族对应的同步警告
    pub fn warning(self) -> SyncWarning {
        match self {
            FsFamily::Fat | FsFamily::Exfat => SyncWarning::LocalIsFat,
            FsFamily::Hgfs => SyncWarning::LocalIsHgfs,
            _ => SyncWarning::NoSyncWarning,
        }
    }

    /// 字节是否在该家族的文件名里被禁用
    ///
    /// 只对单字节 UTF-8 序列判断；多字节序列一律放行。
    pub fn forbidden_byte(self, c: u8) -> bool {
        if c < 0x20 {
            return true;
        }
        match self {
            FsFamily::Ntfs | FsFamily::Fat | FsFamily::Exfat | FsFamily::Hgfs => {
                matches!(c, b'\\' | b'/' | b':' | b'?' | b'"' | b'<' | b'>' | b'|' | b'*')
            }
            FsFamily::Ext | FsFamily::Apfs | FsFamily::Unknown => matches!(c, b'/'),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FsFamily::Ext => "ext",
            FsFamily::Apfs => "apfs",
            FsFamily::Ntfs => "ntfs",
            FsFamily::Fat => "fat",
            FsFamily::Exfat => "exfat",
            FsFamily::Hgfs => "hgfs",
            FsFamily::Unknown => "unknown",
        }
    }
}

/// 节点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    File,
    Folder,
}

/// stat 结果
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub node_type: NodeType,
    pub size: u64,
    pub mtime: i64,
    /// 稳定文件 ID（家族不支持时为 None）
    pub fsid: Option<u64>,
    /// 短名别名（8.3 之类；与主名相同则为 None）
    pub short_name: Option<String>,
}

/// 扫描快照记录（瞬态，每次扫描重建）
#[derive(Debug, Clone)]
pub struct FsNode {
    pub name: String,
    pub short_name: Option<String>,
    pub node_type: NodeType,
    pub size: u64,
    pub mtime: i64,
    pub fsid: Option<u64>,
}

/// 带 "stat 后未变" 约定的打开结果
#[derive(Debug)]
pub enum OpenOutcome {
    /// 文件内容（打开时 size/mtime 与 stat 一致）
    Data(Vec<u8>),
    /// stat 与 open 之间文件变了，调用方应稍后重试
    Stale,
}

/// 持有的锁文件句柄；Drop 时释放并删除
pub struct LockFile {
    path: PathBuf,
    _file: std::fs::File,
}

impl LockFile {
    pub(crate) fn new(path: PathBuf, file: std::fs::File) -> Self {
        Self { path, _file: file }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        local::release_lock(&self.path);
        let _ = std::fs::remove_file(&self.path);
    }
}

/// 文件系统能力接口
#[async_trait]
pub trait FsCapability: Send + Sync {
    /// 获取文件元数据；不存在返回 None
    async fn stat(&self, path: &Path) -> Result<Option<FileMeta>>;

    /// 读取整个文件；若 size/mtime 相对 `since` 已变化则返回 Stale
    async fn open_unchanged(&self, path: &Path, since: &FileMeta) -> Result<OpenOutcome>;

    /// 列出目录的直接子项，按大小写折叠后的名字排序（保证可复现的平局裁决）
    async fn list_dir(&self, path: &Path) -> Result<Vec<FsNode>>;

    /// 写入整个文件（临时文件写入后原子改名）
    async fn write(&self, path: &Path, data: Vec<u8>, mtime: Option<i64>) -> Result<()>;

    /// 创建目录（含父目录）
    async fn mkdir(&self, path: &Path) -> Result<()>;

    /// 同设备改名/移动
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// 删除文件或目录
    async fn remove(&self, path: &Path) -> Result<()>;

    /// 把文件移入同步的本地回收区 `<root>/.debris/YYYYMMDD/`，返回落点
    async fn move_to_debris(&self, path: &Path, sync_root: &Path) -> Result<PathBuf>;

    /// 在 debris 里持有 `tmp` 锁文件；同一根目录已被占用则失败
    async fn hold_debris_lock(&self, sync_root: &Path) -> Result<LockFile>;

    /// 本地根目录指纹（设备 + 根 ID），用于检测根被整体替换
    async fn root_fingerprint(&self, root: &Path) -> Result<u64>;

    /// 文件系统家族
    fn family(&self) -> FsFamily;

    /// 日志用名称
    fn name(&self) -> &str;
}
