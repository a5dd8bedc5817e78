//! 本地磁盘的 FsCapability 实现

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::names::casefold_cmp;
use super::{FileMeta, FsCapability, FsFamily, FsNode, LockFile, NodeType, OpenOutcome};

/// 进程内已持有 debris 锁的同步根目录
fn locked_roots() -> &'static Mutex<HashSet<PathBuf>> {
    static LOCKS: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    LOCKS.get_or_init(|| Mutex::new(HashSet::new()))
}

pub(crate) fn release_lock(lock_path: &Path) {
    if let Some(root) = lock_path.parent().and_then(|debris| debris.parent()) {
        locked_roots().lock().unwrap().remove(root);
    }
}

fn system_time_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

#[cfg(unix)]
fn meta_fsid(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn meta_fsid(_meta: &std::fs::Metadata) -> u64 {
    0
}

#[cfg(unix)]
fn meta_dev(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.dev()
}

#[cfg(not(unix))]
fn meta_dev(_meta: &std::fs::Metadata) -> u64 {
    0
}

pub struct LocalFs {
    family: FsFamily,
    name: String,
}

impl LocalFs {
    pub fn new() -> Self {
        Self::with_family(Self::detect_family())
    }

    /// 指定家族构造（测试里模拟 FAT 等场景）
    pub fn with_family(family: FsFamily) -> Self {
        let name = format!("local:{}", family.name());
        Self { family, name }
    }

    /// 按平台给出家族的尽力检测
    fn detect_family() -> FsFamily {
        if cfg!(target_os = "linux") {
            FsFamily::Ext
        } else if cfg!(target_os = "macos") {
            FsFamily::Apfs
        } else if cfg!(windows) {
            FsFamily::Ntfs
        } else {
            FsFamily::Unknown
        }
    }

    fn meta_to_filemeta(&self, meta: &std::fs::Metadata) -> FileMeta {
        let node_type = if meta.is_dir() {
            NodeType::Folder
        } else {
            NodeType::File
        };
        let mtime = meta.modified().map(system_time_secs).unwrap_or(0);
        let fsid = if self.family.stable_ids() {
            Some(meta_fsid(meta))
        } else {
            None
        };
        FileMeta {
            node_type,
            size: if meta.is_dir() { 0 } else { meta.len() },
            mtime,
            fsid,
            short_name: None,
        }
    }
}

impl Default for LocalFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FsCapability for LocalFs {
    async fn stat(&self, path: &Path) -> Result<Option<FileMeta>> {
        match fs::metadata(path).await {
            Ok(meta) => Ok(Some(self.meta_to_filemeta(&meta))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn open_unchanged(&self, path: &Path, since: &FileMeta) -> Result<OpenOutcome> {
        let mut file = fs::File::open(path).await?;
        let meta = file.metadata().await?;
        let now = self.meta_to_filemeta(&meta);

        // stat 与 open 之间变过就不读，快速失败优于读到半新半旧的内容
        if now.size != since.size || now.mtime != since.mtime {
            debug!("文件在 stat 与 open 之间发生变化: {:?}", path);
            return Ok(OpenOutcome::Stale);
        }

        let mut data = Vec::with_capacity(now.size as usize);
        file.read_to_end(&mut data).await?;
        Ok(OpenOutcome::Data(data))
    }

    async fn list_dir(&self, path: &Path) -> Result<Vec<FsNode>> {
        let mut entries = fs::read_dir(path).await?;
        let mut nodes = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            // 符号链接不参与同步
            if file_type.is_symlink() {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(m) => m,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let fm = self.meta_to_filemeta(&meta);
            let name = entry.file_name().to_string_lossy().into_owned();
            nodes.push(FsNode {
                name,
                short_name: None,
                node_type: fm.node_type,
                size: fm.size,
                mtime: fm.mtime,
                fsid: fm.fsid,
            });
        }

        // 确定性排序：折叠后的名字
        let ci = self.family.case_insensitive();
        nodes.sort_by(|a, b| casefold_cmp(&a.name, &b.name, ci));

        Ok(nodes)
    }

    async fn write(&self, path: &Path, data: Vec<u8>, mtime: Option<i64>) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 临时文件写入后原子改名
        let temp_path = path.with_extension("synctmp");
        fs::write(&temp_path, &data).await?;

        if let Some(secs) = mtime {
            let file = std::fs::OpenOptions::new().write(true).open(&temp_path)?;
            let t = if secs >= 0 {
                UNIX_EPOCH + std::time::Duration::from_secs(secs as u64)
            } else {
                UNIX_EPOCH
            };
            file.set_modified(t)?;
        }

        fs::rename(&temp_path, path).await?;
        Ok(())
    }

    async fn mkdir(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(from, to).await?;
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await?,
            Ok(_) => fs::remove_file(path).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn move_to_debris(&self, path: &Path, sync_root: &Path) -> Result<PathBuf> {
        let day = chrono::Local::now().format("%Y%m%d").to_string();
        let debris_dir = sync_root.join(".debris").join(day);
        fs::create_dir_all(&debris_dir).await?;

        let base_name = path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("无法取得文件名: {:?}", path))?
            .to_string_lossy()
            .into_owned();

        // 同日重复落点时追加序号
        let mut target = debris_dir.join(&base_name);
        let mut counter = 1u32;
        while fs::metadata(&target).await.is_ok() {
            target = debris_dir.join(format!("{}_{}", base_name, counter));
            counter += 1;
        }

        fs::rename(path, &target).await?;
        debug!("已移入本地回收区: {:?} -> {:?}", path, target);
        Ok(target)
    }

    async fn hold_debris_lock(&self, sync_root: &Path) -> Result<LockFile> {
        {
            let mut locks = locked_roots().lock().unwrap();
            if !locks.insert(sync_root.to_path_buf()) {
                anyhow::bail!("同步根目录已被另一个同步占用: {:?}", sync_root);
            }
        }

        let debris = sync_root.join(".debris");
        if let Err(e) = std::fs::create_dir_all(&debris) {
            locked_roots().lock().unwrap().remove(sync_root);
            return Err(e.into());
        }

        let lock_path = debris.join("tmp");
        // 磁盘上的残留（崩溃遗留）允许覆盖；进程内的并发由注册表拦截
        let file = match std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&lock_path)
        {
            Ok(f) => f,
            Err(e) => {
                locked_roots().lock().unwrap().remove(sync_root);
                return Err(e.into());
            }
        };

        Ok(LockFile::new(lock_path, file))
    }

    async fn root_fingerprint(&self, root: &Path) -> Result<u64> {
        let meta = fs::metadata(root).await?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(&meta_dev(&meta).to_le_bytes());
        hasher.update(&meta_fsid(&meta).to_le_bytes());
        if meta_dev(&meta) == 0 && meta_fsid(&meta) == 0 {
            // 平台拿不到设备号时退化为规范路径
            let canon = std::fs::canonicalize(root)?;
            hasher.update(canon.to_string_lossy().as_bytes());
        }
        let hash = hasher.finalize();
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&hash.as_bytes()[..8]);
        Ok(u64::from_le_bytes(buf))
    }

    fn family(&self) -> FsFamily {
        self.family
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stat_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let fs_cap = LocalFs::new();

        std::fs::write(dir.path().join("b.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("A.txt"), b"world").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let meta = fs_cap.stat(&dir.path().join("b.txt")).await.unwrap().unwrap();
        assert_eq!(meta.size, 5);
        assert_eq!(meta.node_type, NodeType::File);

        assert!(fs_cap.stat(&dir.path().join("missing")).await.unwrap().is_none());

        let children = fs_cap.list_dir(dir.path()).await.unwrap();
        assert_eq!(children.len(), 3);
        // 排序是确定性的
        let names: Vec<_> = children.iter().map(|c| c.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort_by(|a, b| casefold_cmp(a, b, fs_cap.family().case_insensitive()));
        assert_eq!(names, sorted);
    }

    #[tokio::test]
    async fn test_open_unchanged_detects_stale() {
        let dir = tempfile::tempdir().unwrap();
        let fs_cap = LocalFs::new();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"content").unwrap();

        let meta = fs_cap.stat(&path).await.unwrap().unwrap();

        match fs_cap.open_unchanged(&path, &meta).await.unwrap() {
            OpenOutcome::Data(data) => assert_eq!(data, b"content"),
            OpenOutcome::Stale => panic!("文件未变不应返回 Stale"),
        }

        // 伪造一个不同 size 的快照
        let mut stale_meta = meta.clone();
        stale_meta.size += 1;
        match fs_cap.open_unchanged(&path, &stale_meta).await.unwrap() {
            OpenOutcome::Stale => {}
            OpenOutcome::Data(_) => panic!("size 变化应返回 Stale"),
        }
    }

    #[tokio::test]
    async fn test_move_to_debris_uniquifies() {
        let dir = tempfile::tempdir().unwrap();
        let fs_cap = LocalFs::new();

        let a = dir.path().join("x.txt");
        std::fs::write(&a, b"1").unwrap();
        let first = fs_cap.move_to_debris(&a, dir.path()).await.unwrap();

        std::fs::write(&a, b"2").unwrap();
        let second = fs_cap.move_to_debris(&a, dir.path()).await.unwrap();

        assert_ne!(first, second);
        assert!(first.exists());
        assert!(second.exists());
    }

    #[tokio::test]
    async fn test_debris_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let fs_cap = LocalFs::new();

        let lock = fs_cap.hold_debris_lock(dir.path()).await.unwrap();
        assert!(lock.path().exists());

        // 同一根目录第二次持锁失败
        assert!(fs_cap.hold_debris_lock(dir.path()).await.is_err());

        drop(lock);
        // 释放后可以重新持有
        let again = fs_cap.hold_debris_lock(dir.path()).await.unwrap();
        drop(again);
    }

    #[tokio::test]
    async fn test_write_sets_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let fs_cap = LocalFs::new();
        let path = dir.path().join("t.bin");

        fs_cap.write(&path, b"data".to_vec(), Some(1_600_000_000)).await.unwrap();
        let meta = fs_cap.stat(&path).await.unwrap().unwrap();
        assert_eq!(meta.mtime, 1_600_000_000);
    }
}
