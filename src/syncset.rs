//! 同步集合：一个用户名下全部同步的总管
//!
//! 持有 (配置, 可选的运行实例) 对的列表和配置存储。负责新增、
//! 启停、移除、外置盘数据库的开合，以及把脏配置冲刷到盘上。

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cloud::{AppCallbacks, CloudTree};
use crate::config::store::ConfigStore;
use crate::config::SyncConfig;
use crate::core::engine::{Sync, SyncDeps};
use crate::db::SyncNodeCache;
use crate::error::SyncError;

/// 一条配置与它（可能在跑的）同步
pub struct UnifiedSync {
    pub config: SyncConfig,
    pub sync: Option<Sync>,
}

impl UnifiedSync {
    fn running(&self) -> bool {
        self.sync.is_some()
    }

    fn drive(&self) -> PathBuf {
        self.config
            .external_drive_path
            .clone()
            .unwrap_or_default()
    }
}

/// 同步集合
pub struct SyncSet {
    syncs: Vec<UnifiedSync>,
    store: ConfigStore,
    /// 每个同步的节点缓存文件放这里
    cache_dir: PathBuf,
    app: Arc<dyn AppCallbacks>,
}

impl SyncSet {
    pub fn new(store: ConfigStore, cache_dir: PathBuf, app: Arc<dyn AppCallbacks>) -> SyncSet {
        SyncSet {
            syncs: Vec::new(),
            store,
            cache_dir,
            app,
        }
    }

    /// 启动时从内部盘加载配置（不自动启用）
    pub fn load_internal(&mut self) -> Result<usize> {
        let configs = self.store.read(Path::new(""))?;
        let count = configs.len();
        for config in configs {
            self.syncs.push(UnifiedSync { config, sync: None });
        }
        Ok(count)
    }

    pub fn num_syncs(&self) -> usize {
        self.syncs.len()
    }

    pub fn num_running_syncs(&self) -> usize {
        self.syncs.iter().filter(|u| u.running()).count()
    }

    pub fn has_running_syncs(&self) -> bool {
        self.syncs.iter().any(|u| u.running())
    }

    pub fn first_running_sync(&mut self) -> Option<&mut Sync> {
        self.syncs.iter_mut().find_map(|u| u.sync.as_mut())
    }

    pub fn sync_by_backup_id(&mut self, backup_id: u64) -> Option<&mut Sync> {
        self.syncs
            .iter_mut()
            .filter(|u| u.config.backup_id == backup_id)
            .find_map(|u| u.sync.as_mut())
    }

    pub fn config_by_backup_id(&self, backup_id: u64) -> Option<&SyncConfig> {
        self.syncs
            .iter()
            .find(|u| u.config.backup_id == backup_id)
            .map(|u| &u.config)
    }

    pub fn all_configs(&self) -> Vec<SyncConfig> {
        self.syncs.iter().map(|u| u.config.clone()).collect()
    }

    pub fn configs_for_drive(&self, drive: &Path) -> Vec<SyncConfig> {
        self.syncs
            .iter()
            .filter(|u| u.drive() == drive)
            .map(|u| u.config.clone())
            .collect()
    }

    fn cache_path(&self, backup_id: u64) -> PathBuf {
        self.cache_dir
            .join(format!("syncnodes_{:016x}.db", backup_id))
    }

    /// 根重叠检查：本地路径与远端句柄两个维度
    fn check_overlap(&self, config: &SyncConfig, cloud: &CloudTree) -> SyncError {
        for other in &self.syncs {
            if !other.config.enabled || other.config.backup_id == config.backup_id {
                continue;
            }
            // 本地
            if other.config.local_path.starts_with(&config.local_path) {
                return SyncError::ActiveSyncBelowPath;
            }
            if config.local_path.starts_with(&other.config.local_path) {
                return SyncError::ActiveSyncAbovePath;
            }
            // 远端
            if cloud.is_below(other.config.remote_handle, config.remote_handle) {
                return SyncError::ActiveSyncBelowPath;
            }
            if cloud.is_below(config.remote_handle, other.config.remote_handle) {
                return SyncError::ActiveSyncAbovePath;
            }
        }
        SyncError::NoSyncError
    }

    /// 追加一条新配置并尝试启用
    pub async fn append_new_sync(
        &mut self,
        config: SyncConfig,
        deps: SyncDeps,
        cloud_snapshot: CloudTree,
    ) -> Result<u64> {
        if self
            .syncs
            .iter()
            .any(|u| u.config.backup_id == config.backup_id)
        {
            anyhow::bail!("备份 id 冲突: {:016x}", config.backup_id);
        }
        let backup_id = config.backup_id;
        self.syncs.push(UnifiedSync {
            config,
            sync: None,
        });
        self.mark_dirty_for(backup_id);

        self.enable_sync_by_backup_id(backup_id, false, deps, cloud_snapshot)
            .await?;
        Ok(backup_id)
    }

    /// 启用一条同步；resetFingerprint 在用户确认根目录被合法替换时传入
    pub async fn enable_sync_by_backup_id(
        &mut self,
        backup_id: u64,
        reset_fingerprint: bool,
        deps: SyncDeps,
        cloud_snapshot: CloudTree,
    ) -> Result<()> {
        let Some(index) = self
            .syncs
            .iter()
            .position(|u| u.config.backup_id == backup_id)
        else {
            anyhow::bail!("未知的备份 id: {:016x}", backup_id);
        };
        if self.syncs[index].running() {
            return Ok(());
        }

        let mut config = self.syncs[index].config.clone();
        if reset_fingerprint {
            config.local_fingerprint = 0;
        }

        // 外置备份的本地根必须在盘内
        if let Some(drive) = &config.external_drive_path {
            if !config.local_path.starts_with(drive) {
                return self.fail_enable(index, SyncError::BackupSourceNotBelowDrive);
            }
        }

        // 根重叠
        let overlap = self.check_overlap(&config, &cloud_snapshot);
        if overlap != SyncError::NoSyncError {
            return self.fail_enable(index, overlap);
        }

        config.enabled = true;
        config.error = SyncError::NoSyncError;

        let cache = match SyncNodeCache::open(&self.cache_path(backup_id)).await {
            Ok(c) => c,
            Err(e) => {
                warn!("打开节点缓存失败: {}", e);
                return self.fail_enable(index, SyncError::FailedWritingCache);
            }
        };

        match Sync::start(config, deps, cloud_snapshot, cache).await {
            Ok(sync) => {
                info!("同步已启用: {:016x}", backup_id);
                self.syncs[index].config = sync.config.clone();
                self.syncs[index].sync = Some(sync);
                self.notify_and_flush(index);
                Ok(())
            }
            Err(failure) => {
                warn!("同步启用失败: {:016x} - {}", backup_id, failure.error);
                self.syncs[index].config = failure.config;
                self.fail_enable(index, failure.error)
            }
        }
    }

    fn fail_enable(&mut self, index: usize, error: SyncError) -> Result<()> {
        self.syncs[index].config.error = error;
        self.syncs[index].config.enabled = false;
        self.notify_and_flush(index);
        anyhow::bail!("启用失败: {}", error)
    }

    /// (error, enabled) 有变化才通知应用；配置所在盘标脏并冲刷
    fn notify_and_flush(&mut self, index: usize) {
        if self.syncs[index].config.error_or_enabled_changed() {
            self.app.syncupdate_stateconfig(&self.syncs[index].config);
        }
        let drive = self.syncs[index].drive();
        self.store.mark_drive_dirty(&drive);
        if let Err(e) = self.flush_dirty() {
            warn!("配置冲刷失败: {}", e);
        }
    }

    /// 停掉选中的同步；配置保留
    pub async fn disable_selected_syncs<F>(
        &mut self,
        mut selector: F,
        error: SyncError,
        enabled: bool,
    ) where
        F: FnMut(&SyncConfig) -> bool,
    {
        for index in 0..self.syncs.len() {
            if !selector(&self.syncs[index].config) {
                continue;
            }
            if let Some(sync) = self.syncs[index].sync.take() {
                sync.cancel();
                self.syncs[index].config = sync.shutdown().await;
            }
            self.syncs[index].config.error = error;
            self.syncs[index].config.enabled = enabled;
            self.notify_and_flush(index);
        }
    }

    /// 移除选中的同步：停掉、删节点缓存、注销配置
    pub async fn remove_selected_syncs<F>(&mut self, mut selector: F)
    where
        F: FnMut(&SyncConfig) -> bool,
    {
        let mut index = 0;
        while index < self.syncs.len() {
            if !selector(&self.syncs[index].config) {
                index += 1;
                continue;
            }
            let mut entry = self.syncs.remove(index);
            if let Some(sync) = entry.sync.take() {
                sync.cancel();
                entry.config = sync.shutdown().await;
            }
            let cache_path = self.cache_path(entry.config.backup_id);
            if let Err(e) = std::fs::remove_file(&cache_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("删除节点缓存失败: {:?} - {}", cache_path, e);
                }
            }
            let drive = entry.drive();
            self.store.mark_drive_dirty(&drive);
            info!("同步已移除: {:016x}", entry.config.backup_id);
        }
        if let Err(e) = self.flush_dirty() {
            warn!("配置冲刷失败: {}", e);
        }
    }

    /// 清除全部备份配置（内存与存储一起）
    pub async fn purge_syncs(&mut self) {
        self.remove_selected_syncs(|c| c.is_backup()).await;
    }

    /// 打开外置盘：读出盘上数据库里的配置（不自动启用）
    pub fn backup_open_drive(&mut self, drive: &Path) -> Result<usize> {
        if self.store.drive_known(drive) {
            anyhow::bail!("盘已打开: {:?}", drive);
        }
        let configs = self.store.read(drive)?;
        let count = configs.len();
        for config in configs {
            if self
                .syncs
                .iter()
                .any(|u| u.config.backup_id == config.backup_id)
            {
                warn!("跳过重复的备份 id: {:016x}", config.backup_id);
                continue;
            }
            self.syncs.push(UnifiedSync { config, sync: None });
        }
        info!("外置盘已打开: {:?} ({} 条配置)", drive, count);
        Ok(count)
    }

    /// 关闭外置盘：有同步在跑则失败；冲刷后把配置卸出内存
    pub fn backup_close_drive(&mut self, drive: &Path) -> Result<()> {
        if !self.store.drive_known(drive) {
            anyhow::bail!("未知的盘: {:?}", drive);
        }
        let any_running = self
            .syncs
            .iter()
            .any(|u| u.drive() == drive && u.running());
        if any_running {
            anyhow::bail!("盘上还有同步在运行: {:?}", drive);
        }

        // 冲刷再卸载
        let configs = self.configs_for_drive(drive);
        self.store.write(drive, &configs)?;
        self.syncs.retain(|u| u.drive() != drive);
        self.store.remove_drive(drive);
        info!("外置盘已关闭: {:?}", drive);
        Ok(())
    }

    /// 保存一条配置（状态/错误更新后调用）；所在盘标脏
    pub fn save_sync_config(&mut self, config: &SyncConfig) {
        let drive = config
            .external_drive_path
            .clone()
            .unwrap_or_default();
        if let Some(entry) = self
            .syncs
            .iter_mut()
            .find(|u| u.config.backup_id == config.backup_id)
        {
            entry.config = config.clone();
        }
        self.store.mark_drive_dirty(&drive);
    }

    /// 是否有配置等待落盘
    pub fn config_store_dirty(&self) -> bool {
        self.store.dirty()
    }

    /// 把所有脏盘的配置写下去
    pub fn flush_dirty(&mut self) -> Result<()> {
        for drive in self.store.dirty_drives() {
            let configs = self.configs_for_drive(&drive);
            self.store.write(&drive, &configs)?;
        }
        Ok(())
    }

    fn mark_dirty_for(&mut self, backup_id: u64) {
        let drive = self
            .syncs
            .iter()
            .find(|u| u.config.backup_id == backup_id)
            .map(|u| u.drive())
            .unwrap_or_default();
        self.store.mark_drive_dirty(&drive);
    }
}
