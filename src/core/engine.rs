//! 同步引擎：单个同步的对账主循环
//!
//! 引擎在单一任务上协作式运行。一轮（pass）的结构：
//! 先收割完成的扫描、排空传输完成、云端变更、目录通知，然后从
//! 根开始遍历，按目录构建三元组：先跑移动检测（把"删除+新建"
//! 认成移动），再套用解析规则；轮末把节点缓存的插入/删除队列
//! 放进同一个事务冲刷。外部副作用只有云端调用、传输请求和本地
//! 文件操作三种，全部经协作方接口发出。
//!
//! 相位门：扫描不完整不认移动，移动没处理完不做删除/上传/下载；
//! 不满足时推迟到后续轮次，而不是冒险发错误操作。

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cloud::{
    AppCallbacks, CloudClient, CloudError, CloudEvent, CloudNode, CloudNodeType, CloudTree,
    DownloadRequest, NodeHandle, TransferEngine, TransferEvent, TransferId, TransferOutcome,
    UploadRequest,
};
use crate::config::{BackupState, SyncConfig};
use crate::core::fingerprint::Fingerprint;
use crate::core::moves::{detect_cloud_move, detect_local_move};
use crate::core::node::{NodeDbId, SyncTree, TreeState, ROOT_DBID};
use crate::core::notifier::DirNotifier;
use crate::core::scanner::{ScanRequest, ScanService};
use crate::core::state::{SyncState, SyncStateMachine};
use crate::core::triplet::{
    cloud_changed_since, cloud_eq_fs, compute_triplets, fs_changed_since, SyncRow,
};
use crate::core::waiter::Waiter;
use crate::db::{NodeRecord, SyncNodeCache};
use crate::error::SyncError;
use crate::fs::names::{escape_fs_incompatible, normalize_nfc, unescape_fs_incompatible};
use crate::fs::{FileMeta, FsCapability, FsNode, LockFile, NodeType, OpenOutcome};

/// 引擎参数
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// 本地文件操作的每轮重试上限
    pub max_fs_retries: u32,
    /// 重试基础延迟（毫秒，指数退避）
    pub retry_base_delay_ms: u64,
    /// 连续无进展轮数达到该值进入 stalled
    pub stall_limit: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_fs_retries: 3,
            retry_base_delay_ms: 50,
            stall_limit: 3,
        }
    }
}

/// 轮内相位门
#[derive(Debug, Default, Clone, Copy)]
struct SyncFlags {
    /// 扫描目标可达才允许考虑三元组
    scan_target_reachable: bool,
    /// 扫描完整才允许做移动检测
    scanning_was_complete: bool,
    /// 移动处理完才允许删除/上传/下载
    moves_were_complete: bool,
}

/// 卡住原因（按路径上报）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallReason {
    NameConflict,
    ParentMissing,
    DestinationBusy,
    LocalStale,
    UserIntervention,
}

impl std::fmt::Display for StallReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StallReason::NameConflict => "name conflict",
            StallReason::ParentMissing => "parent missing",
            StallReason::DestinationBusy => "destination busy",
            StallReason::LocalStale => "local file changing",
            StallReason::UserIntervention => "needs user intervention",
        };
        write!(f, "{}", s)
    }
}

/// 一轮的结果
#[derive(Debug, Default, Clone, Copy)]
pub struct PassOutcome {
    /// 发出的云端/本地外部变更数
    pub mutations: u32,
    /// 建立的配对数
    pub pairings: u32,
    /// 还有未完成的扫描/传输/重访
    pub pending: bool,
    /// 本轮写入缓存的行数
    pub cache_writes: usize,
}

impl PassOutcome {
    pub fn progressed(&self) -> bool {
        self.mutations > 0 || self.pairings > 0
    }
}

#[derive(Debug, Clone, Copy)]
enum TransferKind {
    Up,
    Down,
}

impl std::fmt::Display for TransferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferKind::Up => write!(f, "up"),
            TransferKind::Down => write!(f, "down"),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingTransfer {
    dbid: NodeDbId,
    kind: TransferKind,
    /// 下载时预期落地的指纹
    fingerprint: Option<Fingerprint>,
}

/// 启动失败：错误码与配置一起交还调用方
pub struct StartFailure {
    pub error: SyncError,
    pub config: SyncConfig,
    pub source: anyhow::Error,
}

impl std::fmt::Debug for StartFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StartFailure({}, {})", self.error, self.source)
    }
}

/// 引擎的外部协作方
pub struct SyncDeps {
    pub fs: Arc<dyn FsCapability>,
    pub cloud: Arc<dyn CloudClient>,
    pub transfers: Arc<dyn TransferEngine>,
    pub app: Arc<dyn AppCallbacks>,
    pub waiter: Arc<Waiter>,
    pub cloud_events: mpsc::UnboundedReceiver<CloudEvent>,
    pub transfer_events: mpsc::UnboundedReceiver<TransferEvent>,
}

/// 一个运行中的同步
pub struct Sync {
    pub config: SyncConfig,
    options: SyncOptions,
    machine: SyncStateMachine,
    tree: SyncTree,
    cloud_tree: CloudTree,
    cache: SyncNodeCache,
    fs: Arc<dyn FsCapability>,
    scan: ScanService,
    notifier: DirNotifier,
    waiter: Arc<Waiter>,
    cloud: Arc<dyn CloudClient>,
    transfers: Arc<dyn TransferEngine>,
    cloud_events: mpsc::UnboundedReceiver<CloudEvent>,
    transfer_events: mpsc::UnboundedReceiver<TransferEvent>,
    app: Arc<dyn AppCallbacks>,
    cancelled: Arc<AtomicBool>,
    _debris_lock: LockFile,

    flags: SyncFlags,
    pending_scans: HashMap<NodeDbId, Arc<ScanRequest>>,
    pending_transfers: HashMap<TransferId, PendingTransfer>,
    /// 自己发起的云端变更（回显事件按句柄吞掉）
    expected_cloud_events: HashSet<NodeHandle>,
    snapshots: HashMap<NodeDbId, Vec<FsNode>>,
    /// 有脏子树待处理（触发整树遍历）
    revisit: BTreeSet<NodeDbId>,

    /// 按目录记的名字冲突（目录重访时重建）
    name_conflicts: BTreeMap<NodeDbId, BTreeSet<String>>,
    conflicts_published: bool,
    /// 按目录记的卡住路径与原因
    stalled_paths: BTreeMap<NodeDbId, BTreeMap<String, StallReason>>,
    stalled_published: bool,
    scanning_published: bool,
    no_progress_count: u32,
    transient_error: bool,

    pass_mutations: u32,
    pass_pairings: u32,
    pass_tree_ops: u32,
}

impl Sync {
    /// 启动一个同步：校验根目录与远端、持有 debris 锁、重建缓存
    pub async fn start(
        mut config: SyncConfig,
        deps: SyncDeps,
        cloud_snapshot: CloudTree,
        cache: SyncNodeCache,
    ) -> std::result::Result<Sync, StartFailure> {
        let fail = |error: SyncError, config: SyncConfig, source: anyhow::Error| StartFailure {
            error,
            config,
            source,
        };

        // 本地根必须是目录
        match deps.fs.stat(&config.local_path).await {
            Ok(Some(meta)) if meta.node_type == NodeType::Folder => {}
            Ok(_) => {
                return Err(fail(
                    SyncError::InitialScanFailed,
                    config,
                    anyhow::anyhow!("本地根目录不存在或不是目录"),
                ))
            }
            Err(e) => return Err(fail(SyncError::InitialScanFailed, config, e)),
        }

        // 根指纹：检测换盘
        match deps.fs.root_fingerprint(&config.local_path).await {
            Ok(fsfp) => {
                if config.local_fingerprint != 0 && config.local_fingerprint != fsfp {
                    return Err(fail(
                        SyncError::LocalFingerprintMismatch,
                        config,
                        anyhow::anyhow!("本地根指纹不匹配"),
                    ));
                }
                config.local_fingerprint = fsfp;
            }
            Err(e) => return Err(fail(SyncError::InitialScanFailed, config, e)),
        }

        // 文件系统家族警告
        let family = deps.fs.family();
        config.warning = family.warning();

        // 远端根必须存在且是容器
        match cloud_snapshot.get(config.remote_handle) {
            Some(node) if node.node_type.is_container() => {}
            _ => {
                let remote_handle = config.remote_handle;
                return Err(fail(
                    SyncError::RemoteNodeNotFound,
                    config,
                    anyhow::anyhow!("远端根 {} 不存在", remote_handle),
                ))
            }
        }

        // debris 锁：同一根目录只允许一个同步
        let debris_lock = match deps.fs.hold_debris_lock(&config.local_path).await {
            Ok(lock) => lock,
            Err(e) => return Err(fail(SyncError::ActiveSyncBelowPath, config, e)),
        };

        // 缓存重建
        let (mut tree, _orphans) =
            match crate::db::load_tree(&cache, family.case_insensitive()).await {
                Ok(v) => v,
                Err(e) => return Err(fail(SyncError::FailedWritingCache, config, e)),
            };
        tree.pair(ROOT_DBID, config.remote_handle);

        let scan = ScanService::new(deps.waiter.clone(), deps.fs.clone());

        info!(
            "同步启动: {} ({:?} -> {}) 家族={}",
            config.name,
            config.local_path,
            config.remote_handle,
            family.name()
        );

        let mut revisit = BTreeSet::new();
        revisit.insert(ROOT_DBID);

        Ok(Sync {
            config,
            options: SyncOptions::default(),
            machine: SyncStateMachine::new(),
            tree,
            cloud_tree: cloud_snapshot,
            cache,
            fs: deps.fs,
            scan,
            notifier: DirNotifier::new(),
            waiter: deps.waiter,
            cloud: deps.cloud,
            transfers: deps.transfers,
            cloud_events: deps.cloud_events,
            transfer_events: deps.transfer_events,
            app: deps.app,
            cancelled: Arc::new(AtomicBool::new(false)),
            _debris_lock: debris_lock,
            flags: SyncFlags::default(),
            pending_scans: HashMap::new(),
            pending_transfers: HashMap::new(),
            expected_cloud_events: HashSet::new(),
            snapshots: HashMap::new(),
            revisit,
            name_conflicts: BTreeMap::new(),
            conflicts_published: false,
            stalled_paths: BTreeMap::new(),
            stalled_published: false,
            scanning_published: false,
            no_progress_count: 0,
            transient_error: false,
            pass_mutations: 0,
            pass_pairings: 0,
            pass_tree_ops: 0,
        })
    }

    pub fn state(&self) -> SyncState {
        self.machine.state()
    }

    pub fn backup_id(&self) -> u64 {
        self.config.backup_id
    }

    /// 当前未解决的名字冲突路径
    pub fn conflicts(&self) -> Vec<String> {
        self.name_conflicts
            .values()
            .flat_map(|set| set.iter().cloned())
            .collect()
    }

    /// 卡住路径与原因
    pub fn stalled_paths(&self) -> Vec<(String, StallReason)> {
        self.stalled_paths
            .values()
            .flat_map(|m| m.iter().map(|(p, r)| (p.clone(), *r)))
            .collect()
    }

    /// 外部（监视器）投递子树脏提示
    pub fn notify_subtree_dirty(&mut self, path: PathBuf) {
        let dbid = self.dbid_by_path(&path).unwrap_or(ROOT_DBID);
        self.notifier.notify_dirty(dbid, path);
        self.waiter.notify();
    }

    fn dbid_by_path(&self, path: &Path) -> Option<NodeDbId> {
        let rel = path.strip_prefix(&self.config.local_path).ok()?;
        let mut cur = ROOT_DBID;
        for comp in rel.components() {
            let name = comp.as_os_str().to_string_lossy();
            cur = self.tree.child_by_name(cur, &name)?;
        }
        Some(cur)
    }

    /// 取消（停用/移除路径上调用）；挂起点与每轮轮首检查
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.waiter.notify();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 暂停：仍然排空通知队列，但不做对账
    pub fn pause(&mut self) {
        self.machine.change_state(
            SyncState::Paused,
            &mut self.config,
            SyncError::NoSyncError,
            true,
            self.app.as_ref(),
            true,
        );
    }

    pub fn resume(&mut self) {
        self.machine.change_state(
            SyncState::Active,
            &mut self.config,
            SyncError::NoSyncError,
            true,
            self.app.as_ref(),
            true,
        );
        self.revisit.insert(ROOT_DBID);
        self.waiter.notify();
    }

    /// 备份的云端子树被外部修改：带专属错误停用
    fn backup_modified(&mut self) {
        warn!("备份 {} 的云端子树被外部修改，停用", self.config.name);
        self.disable(SyncError::BackupModified);
    }

    fn disable(&mut self, error: SyncError) {
        for id in self.pending_transfers.keys() {
            self.transfers.cancel(*id);
        }
        self.pending_transfers.clear();

        let new_state = if error == SyncError::FailedWritingCache {
            SyncState::Failed
        } else {
            SyncState::Disabled
        };
        self.machine.change_state(
            new_state,
            &mut self.config,
            error,
            false,
            self.app.as_ref(),
            true,
        );
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// 结束运行，交还配置（缓存先冲刷）
    pub async fn shutdown(mut self) -> SyncConfig {
        let _ = self.flush_cache().await;
        self.cache.close().await;
        self.config
    }

    // ============ 一轮 ============

    /// 执行一轮对账
    pub async fn sync_pass(&mut self) -> Result<PassOutcome> {
        if self.is_cancelled() {
            return Ok(PassOutcome::default());
        }

        self.pass_mutations = 0;
        self.pass_pairings = 0;
        self.pass_tree_ops = 0;
        self.transient_error = false;

        // 先收割已完成的扫描，再定相位门
        self.harvest_scans();
        self.flags.scanning_was_complete = self.pending_scans.is_empty()
            && !self.tree.iter().any(|n| n.is_folder() && n.needs_rescan);
        self.flags.moves_were_complete = self.flags.scanning_was_complete;
        self.flags.scan_target_reachable = true;

        // 事件排空顺序：传输完成 → 云端变更 → 目录通知
        self.drain_transfer_events();
        self.drain_cloud_events();
        self.drain_notifications();

        if self.is_cancelled() {
            return Ok(PassOutcome::default());
        }

        // 有脏子树就从根遍历一遍（移动检测需要全局视角）
        let has_work = !self.revisit.is_empty();
        self.revisit.clear();
        if has_work && self.machine.state() != SyncState::Paused {
            self.recursive_sync(ROOT_DBID).await?;
        }

        // 轮末：一个事务冲刷缓存
        let cache_writes = match self.flush_cache().await {
            Ok(n) => n,
            Err(e) => {
                warn!("写状态缓存失败: {}", e);
                self.disable(SyncError::FailedWritingCache);
                return Ok(PassOutcome {
                    mutations: self.pass_mutations,
                    pairings: self.pass_pairings,
                    pending: false,
                    cache_writes: 0,
                });
            }
        };

        let pending = !self.pending_scans.is_empty()
            || !self.pending_transfers.is_empty()
            || !self.revisit.is_empty()
            || self.notifier.has_pending()
            || self.transient_error;

        // 瞬时错误：下一轮重访
        if self.transient_error {
            self.revisit.insert(ROOT_DBID);
        }

        self.prune_dead_dirs();
        self.publish_edges();
        self.update_stall_state(pending);

        // 初扫完成 → ACTIVE
        if self.machine.state() == SyncState::InitialScan && !pending {
            self.machine.change_state(
                SyncState::Active,
                &mut self.config,
                SyncError::NoSyncError,
                true,
                self.app.as_ref(),
                true,
            );
        }

        // 备份镜像期收敛后进入监视期
        if self.config.is_backup()
            && self.config.backup_state == BackupState::Mirror
            && !pending
            && self.pass_mutations == 0
        {
            debug!("备份 {} 进入监视期", self.config.name);
            self.config.backup_state = BackupState::Monitor;
        }

        Ok(PassOutcome {
            mutations: self.pass_mutations,
            pairings: self.pass_pairings,
            pending,
            cache_writes,
        })
    }

    /// 收敛辅助：循环执行轮直到没有进展也没有挂起工作
    pub async fn run_until_idle(&mut self, max_passes: u32) -> Result<u32> {
        let mut passes = 0;
        loop {
            let outcome = self.sync_pass().await?;
            passes += 1;
            if self.is_cancelled() {
                return Ok(passes);
            }
            if !outcome.pending && !outcome.progressed() {
                return Ok(passes);
            }
            if passes >= max_passes {
                return Ok(passes);
            }
            // 挂起点：等扫描/传输回来或超时轮询
            self.waiter
                .wait_until(tokio::time::Instant::now() + Duration::from_millis(30))
                .await;
        }
    }

    // ============ 事件收割与排空 ============

    /// 把完成的扫描搬进快照表
    fn harvest_scans(&mut self) {
        let done: Vec<NodeDbId> = self
            .pending_scans
            .iter()
            .filter(|(_, req)| req.completed())
            .map(|(dbid, _)| *dbid)
            .collect();

        for dbid in done {
            let request = self.pending_scans.remove(&dbid).unwrap();
            if request.ok() {
                let dir_path = request.target_path().clone();
                let mut nodes = request.take_results();
                nodes.retain(|n| !self.excluded_below(&dir_path, &n.name));
                self.snapshots.insert(dbid, nodes);
                if let Some(node) = self.tree.get_mut(dbid) {
                    node.needs_rescan = false;
                }
                self.revisit.insert(dbid);
            } else {
                // 扫描失败：目标不可达，延后决策
                if self.machine.state() == SyncState::InitialScan && dbid == ROOT_DBID {
                    self.disable(SyncError::InitialScanFailed);
                    return;
                }
                self.transient_error = true;
                self.revisit.insert(dbid);
            }
        }
    }

    fn drain_transfer_events(&mut self) {
        let mut events = Vec::new();
        while let Ok(ev) = self.transfer_events.try_recv() {
            events.push(ev);
        }
        for ev in events {
            self.handle_transfer_event(ev);
        }
    }

    fn handle_transfer_event(&mut self, ev: TransferEvent) {
        let Some(pending) = self.pending_transfers.remove(&ev.id) else {
            return;
        };
        let dbid = pending.dbid;

        match ev.outcome {
            TransferOutcome::UploadDone { new_handle } => {
                self.expected_cloud_events.insert(new_handle);
                let Some(node) = self.tree.get_mut(dbid) else {
                    return;
                };
                node.transfer_active = None;
                let name = node.name.clone();
                let fingerprint = node.fingerprint;
                let parent = node.parent;

                self.tree.pair(dbid, new_handle);

                // 把新节点放进云端镜像（等价于回显通知的内容）
                let parent_handle = parent
                    .and_then(|p| self.tree.get(p))
                    .and_then(|p| p.cloud_handle);
                if let Some(fp) = fingerprint {
                    self.cloud_tree.insert(CloudNode {
                        handle: new_handle,
                        parent: parent_handle,
                        name: self.cloud_name_for(&name),
                        node_type: CloudNodeType::File,
                        fingerprint: Some(fp),
                        mtime: fp.mtime,
                        size: fp.size,
                        owner: None,
                    });
                }

                self.set_node_state(dbid, TreeState::Synced);
                self.pass_pairings += 1;
                self.pass_mutations += 1;
                debug!("上传完成并配对: dbid={} handle={}", dbid, new_handle);
            }
            TransferOutcome::DownloadDone => {
                let Some(node) = self.tree.get_mut(dbid) else {
                    return;
                };
                node.transfer_active = None;
                node.created_on_disk = true;
                node.self_notified = true;
                if let Some(fp) = pending.fingerprint {
                    node.fingerprint = Some(fp);
                }
                let parent = node.parent;
                self.tree.statecache_add(dbid);
                self.set_node_state(dbid, TreeState::Synced);
                self.pass_pairings += 1;
                self.pass_mutations += 1;

                // 父目录重扫一次，补上 fsid 等扫描属性
                if let Some(parent) = parent {
                    self.mark_needs_rescan(parent);
                }
                debug!("下载完成: dbid={}", dbid);
            }
            TransferOutcome::Failed { transient, message } => {
                warn!(
                    "传输失败 (kind={}, transient={}): {}",
                    pending.kind, transient, message
                );
                let parent = self
                    .tree
                    .get_mut(dbid)
                    .map(|node| {
                        node.transfer_active = None;
                        node.parent.unwrap_or(ROOT_DBID)
                    })
                    .unwrap_or(ROOT_DBID);
                self.revisit.insert(parent);
                self.transient_error = true;
                if !transient {
                    let path = self.tree.path_of(dbid, &self.config.local_path);
                    self.stalled_paths.entry(parent).or_default().insert(
                        path.to_string_lossy().into_owned(),
                        StallReason::DestinationBusy,
                    );
                }
            }
        }
    }

    fn drain_cloud_events(&mut self) {
        let mut events = Vec::new();
        while let Ok(ev) = self.cloud_events.try_recv() {
            events.push(ev);
        }
        for ev in events {
            self.handle_cloud_event(ev);
        }
    }

    fn handle_cloud_event(&mut self, ev: CloudEvent) {
        let handle = ev.node.handle;
        let self_caused = self.expected_cloud_events.remove(&handle);

        // 影响范围要在事件应用前判定（删除应用后链就断了）
        let under_root = self.cloud_tree.is_below(handle, self.config.remote_handle)
            || ev
                .node
                .parent
                .map(|p| self.cloud_tree.is_below(p, self.config.remote_handle))
                .unwrap_or(false);

        self.cloud_tree.apply_event(&ev);

        if self_caused || !under_root {
            return;
        }

        // 外部云端变更：新通知清零 stall 计数
        self.no_progress_count = 0;

        // 备份监视期：任何外部云端改动都停用
        if self.config.is_backup() && self.config.backup_state == BackupState::Monitor {
            self.backup_modified();
            return;
        }

        self.revisit.insert(ROOT_DBID);
        self.waiter.notify();
    }

    fn drain_notifications(&mut self) {
        let ready = self.notifier.drain_ready();
        if !ready.is_empty() {
            self.no_progress_count = 0;
        }
        for n in ready {
            // 自己造成的通知吞掉一次，防回环
            if let Some(node) = self.tree.get_mut(n.dbid) {
                if node.self_notified {
                    node.self_notified = false;
                    continue;
                }
            }
            self.mark_needs_rescan(n.dbid);
        }
    }

    fn mark_needs_rescan(&mut self, dbid: NodeDbId) {
        let dir = match self.tree.get(dbid) {
            Some(n) if n.is_folder() => dbid,
            Some(n) => n.parent.unwrap_or(ROOT_DBID),
            None => ROOT_DBID,
        };
        if let Some(node) = self.tree.get_mut(dir) {
            node.needs_rescan = true;
        }
        self.snapshots.remove(&dir);
        self.revisit.insert(dir);
    }

    // ============ 子树对账 ============

    async fn recursive_sync(&mut self, target: NodeDbId) -> Result<()> {
        let mut stack = vec![target];

        while let Some(dbid) = stack.pop() {
            if self.is_cancelled() {
                break;
            }
            let Some(node) = self.tree.get(dbid) else {
                continue;
            };
            if !node.is_folder() {
                continue;
            }
            let dir_path = self.tree.path_of(dbid, &self.config.local_path);

            // 快照没齐就先挂起这个子树
            let Some(fs_children) = self.get_snapshot(dbid) else {
                self.flags.scan_target_reachable = false;
                continue;
            };

            let rows = self.build_rows(dbid, &dir_path, &fs_children);

            // 移动阶段：认出的移动当场执行，然后把该目录推迟到
            // 重扫之后的轮次（快照已失效）
            if self.flags.scanning_was_complete {
                let moved = self.move_phase(&rows, dbid, &dir_path).await?;
                if moved > 0 {
                    continue;
                }
            }

            // 这个目录的冲突/卡住记录按本轮观察重建
            self.name_conflicts.remove(&dbid);
            self.stalled_paths.remove(&dbid);

            for row in rows {
                if self.is_cancelled() {
                    break;
                }
                if let Some(recurse) = self.sync_item(row, dbid, &dir_path).await? {
                    stack.push(recurse);
                }
            }
        }
        Ok(())
    }

    fn build_rows(&self, dbid: NodeDbId, dir_path: &Path, fs_children: &[FsNode]) -> Vec<SyncRow> {
        let cloud_children: Vec<CloudNode> = match self.tree.get(dbid).and_then(|n| n.cloud_handle)
        {
            Some(handle) => self
                .cloud_tree
                .children_of(handle)
                .into_iter()
                .filter(|c| !self.excluded_below(dir_path, &c.name))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        let cloud_refs: Vec<&CloudNode> = cloud_children.iter().collect();
        compute_triplets(&self.tree, dbid, &cloud_refs, fs_children, self.fs.family())
    }

    /// 两趟移动检测：本地侧按 fsid，云端侧按句柄/指纹
    async fn move_phase(
        &mut self,
        rows: &[SyncRow],
        parent: NodeDbId,
        dir_path: &Path,
    ) -> Result<u32> {
        let mut performed = 0u32;

        for row in rows {
            if row.has_clash() {
                continue;
            }
            match (row.cloud, row.sync, &row.fs) {
                // 云端新子项：可能是云端移动
                (Some(handle), None, None) => {
                    let Some(c) = self.cloud_tree.get(handle).cloned() else {
                        continue;
                    };
                    if let Some(source) = detect_cloud_move(&self.tree, &self.cloud_tree, &c, parent)
                    {
                        if self.perform_local_move(source, parent, &c, dir_path).await? {
                            performed += 1;
                        }
                    }
                }
                // 本地新子项：可能是本地移动
                (None, None, Some(f)) => {
                    if let Some(mv) = detect_local_move(&self.tree, parent, f) {
                        if self
                            .perform_cloud_move(mv.source, mv.paired, parent, f, dir_path)
                            .await?
                        {
                            performed += 1;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(performed)
    }

    /// 目录快照：优先复用，缺了就发异步扫描
    fn get_snapshot(&mut self, dbid: NodeDbId) -> Option<Vec<FsNode>> {
        let needs_rescan = self.tree.get(dbid).map(|n| n.needs_rescan).unwrap_or(true);
        if !needs_rescan {
            if let Some(snap) = self.snapshots.get(&dbid) {
                return Some(snap.clone());
            }
        }
        if self.pending_scans.contains_key(&dbid) {
            self.revisit.insert(dbid);
            return None;
        }
        let dir_path = self.tree.path_of(dbid, &self.config.local_path);
        let request = self.scan.scan(dbid, dir_path);
        self.pending_scans.insert(dbid, request);
        self.revisit.insert(dbid);
        None
    }

    fn excluded_below(&self, dir_path: &Path, name: &str) -> bool {
        let rel = dir_path
            .strip_prefix(&self.config.local_path)
            .unwrap_or(Path::new(""))
            .join(name);
        self.config
            .is_excluded(&rel.to_string_lossy().replace('\\', "/"))
    }

    fn rel_display(&self, dir_path: &Path, name: &str) -> String {
        let rel = dir_path
            .strip_prefix(&self.config.local_path)
            .unwrap_or(Path::new(""))
            .join(name);
        rel.to_string_lossy().replace('\\', "/")
    }

    /// 本地名跨到云端时的形式：先还原转义，再 NFC 归一化
    fn cloud_name_for(&self, local_name: &str) -> String {
        normalize_nfc(&unescape_fs_incompatible(local_name, self.fs.family()))
    }

    fn record_conflict(&mut self, dir: NodeDbId, display: String, reason: StallReason) {
        self.name_conflicts
            .entry(dir)
            .or_default()
            .insert(display.clone());
        self.stalled_paths
            .entry(dir)
            .or_default()
            .insert(display, reason);
    }

    fn record_stall(&mut self, dir: NodeDbId, display: String, reason: StallReason) {
        self.stalled_paths
            .entry(dir)
            .or_default()
            .insert(display, reason);
    }

    /// 这个 fsid 是否出现在别的目录的现行快照里（移动在途的信号）
    fn fsid_visible_elsewhere(&self, fsid: u64, excluding: NodeDbId) -> bool {
        self.snapshots.iter().any(|(dir, nodes)| {
            *dir != excluding && nodes.iter().any(|n| n.fsid == Some(fsid))
        })
    }

    // ============ 单个三元组 ============

    /// 解析一个三元组；返回需要递归的子目录
    async fn sync_item(
        &mut self,
        row: SyncRow,
        parent: NodeDbId,
        dir_path: &Path,
    ) -> Result<Option<NodeDbId>> {
        // 名字冲突：记录并阻止递归
        if row.has_clash() {
            let name = row.display_name(&self.tree);
            let display = self.rel_display(dir_path, &name);
            self.record_conflict(parent, display, StallReason::NameConflict);
            return Ok(None);
        }

        let cloud = row.cloud.and_then(|h| self.cloud_tree.get(h)).cloned();

        match (cloud, row.sync, row.fs) {
            (None, None, None) => Ok(None),

            // 双侧都消失：删除同步节点
            (None, Some(s), None) => {
                self.resolve_del_sync_node(s);
                Ok(None)
            }

            // 云端新出现
            (Some(c), None, None) => self.resolve_cloud_fresh(c, parent, dir_path).await,

            // 本地新出现
            (None, None, Some(f)) => self.resolve_fs_fresh(f, parent, dir_path).await,

            // 本地消失、云端还在
            (Some(c), Some(s), None) => self.resolve_fs_gone(c, s, parent, dir_path).await,

            // 云端消失、本地还在
            (None, Some(s), Some(f)) => self.resolve_cloud_gone(s, f, parent, dir_path).await,

            // 两侧都在但没配对过
            (Some(c), None, Some(f)) => self.resolve_adopt(c, f, parent, dir_path).await,

            // 三者齐全
            (Some(c), Some(s), Some(f)) => self.resolve_all(c, s, f, parent, dir_path).await,
        }
    }

    fn resolve_del_sync_node(&mut self, dbid: NodeDbId) {
        let created = self
            .tree
            .get(dbid)
            .map(|n| n.created_on_disk)
            .unwrap_or(false);
        if created {
            // 我们刚在本地落的盘，扫描快照还没追上，不删
            return;
        }
        debug!("双侧都已消失，删除同步节点 {}", dbid);
        self.tree.remove_subtree(dbid);
        self.pass_tree_ops += 1;
    }

    async fn resolve_cloud_fresh(
        &mut self,
        c: CloudNode,
        parent: NodeDbId,
        dir_path: &Path,
    ) -> Result<Option<NodeDbId>> {
        if !self.flags.scanning_was_complete {
            self.revisit.insert(parent);
            return Ok(None);
        }

        if self.config.is_backup() {
            return match self.config.backup_state {
                // 镜像期：云端多出来的内容被清掉
                BackupState::Mirror | BackupState::None => {
                    if !self.flags.moves_were_complete {
                        self.revisit.insert(parent);
                        return Ok(None);
                    }
                    self.cloud_delete(c.handle).await;
                    self.pass_mutations += 1;
                    Ok(None)
                }
                BackupState::Monitor => {
                    self.backup_modified();
                    Ok(None)
                }
            };
        }

        if !self.config.sync_type.syncs_down() {
            // 单向上行：云端多出的内容不动
            return Ok(None);
        }

        if !self.flags.moves_were_complete {
            self.revisit.insert(parent);
            return Ok(None);
        }

        // downsync：在本地物化（云端名转成本地形式）
        let local_name = escape_fs_incompatible(&c.name, self.fs.family());
        let path = dir_path.join(&local_name);

        if c.node_type.is_container() {
            if !self.retry_mkdir(&path).await {
                self.revisit.insert(parent);
                return Ok(None);
            }
            let Some(dbid) = self.tree.add_child(parent, NodeType::Folder, &local_name) else {
                return Ok(None);
            };
            self.tree.pair(dbid, c.handle);
            if let Some(node) = self.tree.get_mut(dbid) {
                node.created_on_disk = true;
                node.self_notified = true;
            }
            if let Ok(Some(meta)) = self.fs.stat(&path).await {
                self.tree.set_fsid(dbid, meta.fsid);
            }
            self.set_node_state(dbid, TreeState::Syncing);
            self.pass_mutations += 1;
            self.pass_pairings += 1;
            Ok(Some(dbid))
        } else {
            let Some(dbid) = self.tree.add_child(parent, NodeType::File, &local_name) else {
                return Ok(None);
            };
            self.tree.pair(dbid, c.handle);
            self.start_download(dbid, &c, path);
            Ok(None)
        }
    }

    async fn resolve_fs_fresh(
        &mut self,
        f: FsNode,
        parent: NodeDbId,
        dir_path: &Path,
    ) -> Result<Option<NodeDbId>> {
        if !self.flags.scanning_was_complete {
            self.revisit.insert(parent);
            return Ok(None);
        }

        if !self.config.sync_type.syncs_up() {
            // 单向下行：本地多出的内容不动
            return Ok(None);
        }

        // 父目录必须已经有云端对应
        let Some(parent_handle) = self.tree.get(parent).and_then(|n| n.cloud_handle) else {
            let display = self.rel_display(dir_path, &f.name);
            self.record_stall(parent, display, StallReason::ParentMissing);
            self.revisit.insert(parent);
            return Ok(None);
        };

        if !self.flags.moves_were_complete {
            self.revisit.insert(parent);
            return Ok(None);
        }

        let cloud_name = self.cloud_name_for(&f.name);

        if f.node_type == NodeType::Folder {
            // upsync 目录：云端建夹
            let cloud = self.cloud.clone();
            let result = cloud.put_folder(parent_handle, &cloud_name).await;
            let Some(handle) = self.cloud_op(result) else {
                self.revisit.insert(parent);
                return Ok(None);
            };
            self.expected_cloud_events.insert(handle);
            self.cloud_tree.insert(CloudNode {
                handle,
                parent: Some(parent_handle),
                name: cloud_name,
                node_type: CloudNodeType::Folder,
                fingerprint: None,
                mtime: f.mtime,
                size: 0,
                owner: None,
            });

            let Some(dbid) = self.tree.add_child(parent, NodeType::Folder, &f.name) else {
                return Ok(None);
            };
            self.tree.set_fsid(dbid, f.fsid);
            if f.short_name.is_some() {
                self.tree.set_short_name(dbid, f.short_name.clone());
            }
            self.tree.pair(dbid, handle);
            self.set_node_state(dbid, TreeState::Syncing);
            self.pass_mutations += 1;
            self.pass_pairings += 1;
            Ok(Some(dbid))
        } else {
            // upsync 文件：读内容算指纹后请求上传
            let Some(fingerprint) = self.read_fingerprint(&f, parent, dir_path).await else {
                return Ok(None);
            };

            let Some(dbid) = self.tree.add_child(parent, NodeType::File, &f.name) else {
                return Ok(None);
            };
            self.tree.set_fsid(dbid, f.fsid);
            if let Some(node) = self.tree.get_mut(dbid) {
                node.fingerprint = Some(fingerprint);
            }
            self.start_upload(
                dbid,
                parent_handle,
                dir_path.join(&f.name),
                cloud_name,
                fingerprint,
            );
            Ok(None)
        }
    }

    async fn resolve_fs_gone(
        &mut self,
        c: CloudNode,
        s: NodeDbId,
        parent: NodeDbId,
        dir_path: &Path,
    ) -> Result<Option<NodeDbId>> {
        let Some(node) = self.tree.get(s) else {
            return Ok(None);
        };
        // 行已过期（节点被本轮移动挪走）
        if node.parent != Some(parent) {
            return Ok(None);
        }
        if node.transfer_active.is_some() {
            // 下载在途，文件还没落地
            return Ok(None);
        }

        // 实体在别的目录的快照里出现：是移动不是删除，交给那边处理
        if let Some(fsid) = node.fsid {
            if self.fsid_visible_elsewhere(fsid, parent) {
                self.revisit.insert(parent);
                return Ok(None);
            }
        }

        let last_seen_mtime = node.fingerprint.map(|fp| fp.mtime);

        if !self.flags.moves_were_complete {
            self.revisit.insert(parent);
            return Ok(None);
        }

        // 云端在本地最后所见之后变过 → 云端赢，本地重建
        let cloud_is_newer = match last_seen_mtime {
            Some(seen) => c.mtime > seen + 1,
            None => false,
        };

        if cloud_is_newer || !self.config.sync_type.syncs_up() {
            debug!("本地消失但云端更新，重建本地: {}", c.name);
            let path = dir_path.join(escape_fs_incompatible(&c.name, self.fs.family()));
            if c.node_type.is_container() {
                if !self.retry_mkdir(&path).await {
                    self.revisit.insert(parent);
                    return Ok(None);
                }
                if let Some(node) = self.tree.get_mut(s) {
                    node.created_on_disk = true;
                    node.self_notified = true;
                }
                self.pass_mutations += 1;
                return Ok(Some(s));
            }
            self.start_download(s, &c, path);
            return Ok(None);
        }

        // 本地删除是权威：删云端
        debug!("本地删除传播到云端: {}", c.name);
        self.cloud_delete(c.handle).await;
        self.tree.remove_subtree(s);
        self.pass_mutations += 1;
        Ok(None)
    }

    async fn resolve_cloud_gone(
        &mut self,
        s: NodeDbId,
        f: FsNode,
        parent: NodeDbId,
        dir_path: &Path,
    ) -> Result<Option<NodeDbId>> {
        let Some(node) = self.tree.get(s) else {
            return Ok(None);
        };
        if node.parent != Some(parent) {
            return Ok(None);
        }
        if node.transfer_active.is_some() {
            // 上传在途，云端节点还没出现
            return Ok(None);
        }

        // 配对的云端节点还活着：被移走而非删除，交给新位置的行
        if let Some(handle) = node.cloud_handle {
            if self.cloud_tree.contains(handle) {
                self.revisit.insert(parent);
                return Ok(None);
            }
        }

        // 从没配对过：崩溃前的半次上传，按新建处理
        if node.cloud_handle.is_none() {
            self.tree.remove_subtree(s);
            self.pass_tree_ops += 1;
            return self.resolve_fs_fresh(f, parent, dir_path).await;
        }

        if !self.flags.moves_were_complete {
            self.revisit.insert(parent);
            return Ok(None);
        }

        let changed = fs_changed_since(&f, node);
        if !changed && self.config.sync_type.syncs_down() {
            // 本地未变：云端删除传播到本地（移入回收区，不直接销毁）
            debug!("云端删除传播到本地: {}", f.name);
            let path = dir_path.join(&f.name);
            if !self.retry_move_to_debris(&path).await {
                self.revisit.insert(parent);
                return Ok(None);
            }
            self.mark_needs_rescan(parent);
            self.tree.remove_subtree(s);
            self.pass_mutations += 1;
            return Ok(None);
        }

        // 本地变过（或单向上行）：本地赢，重新推上云端
        debug!("云端消失但本地有改动，重新上传: {}", f.name);
        self.tree.remove_subtree(s);
        self.pass_tree_ops += 1;
        self.resolve_fs_fresh(f, parent, dir_path).await
    }

    async fn resolve_adopt(
        &mut self,
        c: CloudNode,
        f: FsNode,
        parent: NodeDbId,
        dir_path: &Path,
    ) -> Result<Option<NodeDbId>> {
        // 目录对目录：认领配对
        if c.node_type.is_container() && f.node_type == NodeType::Folder {
            let Some(dbid) = self.tree.add_child(parent, NodeType::Folder, &f.name) else {
                return Ok(None);
            };
            self.tree.set_fsid(dbid, f.fsid);
            self.tree.pair(dbid, c.handle);
            self.set_node_state(dbid, TreeState::Syncing);
            self.pass_pairings += 1;
            return Ok(Some(dbid));
        }

        if c.node_type.is_container() || f.node_type == NodeType::Folder {
            // 类型不一致：需要用户干预
            let display = self.rel_display(dir_path, &f.name);
            self.record_conflict(parent, display, StallReason::UserIntervention);
            return Ok(None);
        }

        // 文件对文件：指纹一致就认领
        let path = dir_path.join(&f.name);
        let meta = FileMeta {
            node_type: NodeType::File,
            size: f.size,
            mtime: f.mtime,
            fsid: f.fsid,
            short_name: f.short_name.clone(),
        };
        let fs_fp = match self.fs.open_unchanged(&path, &meta).await {
            Ok(OpenOutcome::Data(data)) => Some(Fingerprint::from_bytes(&data, f.mtime)),
            Ok(OpenOutcome::Stale) => {
                let display = self.rel_display(dir_path, &f.name);
                self.record_stall(parent, display, StallReason::LocalStale);
                self.mark_needs_rescan(parent);
                return Ok(None);
            }
            Err(_) => None,
        };

        if cloud_eq_fs(&c, &f, fs_fp.as_ref(), self.fs.family()) {
            let Some(dbid) = self.tree.add_child(parent, NodeType::File, &f.name) else {
                return Ok(None);
            };
            self.tree.set_fsid(dbid, f.fsid);
            if let Some(node) = self.tree.get_mut(dbid) {
                node.fingerprint = fs_fp.or(c.fingerprint);
            }
            self.tree.pair(dbid, c.handle);
            self.set_node_state(dbid, TreeState::Synced);
            self.pass_pairings += 1;
            return Ok(None);
        }

        // 内容不同：双向要用户定夺，单向按方向覆盖
        if self.config.sync_type.syncs_up() && self.config.sync_type.syncs_down() {
            let display = self.rel_display(dir_path, &f.name);
            self.record_conflict(parent, display, StallReason::UserIntervention);
            return Ok(None);
        }
        if self.config.is_backup() && self.config.backup_state == BackupState::Monitor {
            self.backup_modified();
            return Ok(None);
        }
        if self.config.sync_type.syncs_up() {
            return self.resolve_fs_fresh(f, parent, dir_path).await;
        }
        self.resolve_cloud_fresh(c, parent, dir_path).await
    }

    async fn resolve_all(
        &mut self,
        c: CloudNode,
        s: NodeDbId,
        f: FsNode,
        parent: NodeDbId,
        dir_path: &Path,
    ) -> Result<Option<NodeDbId>> {
        let Some(node) = self.tree.get(s) else {
            return Ok(None);
        };
        if node.parent != Some(parent) {
            return Ok(None);
        }
        if node.transfer_active.is_some() {
            return Ok(None);
        }

        // 配对/fsid 修正（缓存重建后可能缺）
        if node.cloud_handle != Some(c.handle) {
            self.tree.pair(s, c.handle);
            self.pass_pairings += 1;
        }
        if self.tree.get(s).map(|n| n.fsid) != Some(f.fsid) {
            self.tree.set_fsid(s, f.fsid);
        }

        // 目录：没有内容可比，递归即可
        if f.node_type == NodeType::Folder {
            self.set_node_state(s, TreeState::Synced);
            return Ok(Some(s));
        }

        let Some(node) = self.tree.get(s) else {
            return Ok(None);
        };
        let f_changed = fs_changed_since(&f, node);
        let c_changed = cloud_changed_since(&c, node);

        match (f_changed, c_changed) {
            (false, false) => {
                if self.tree.get(s).and_then(|n| n.fingerprint).is_none() {
                    if let Some(node) = self.tree.get_mut(s) {
                        node.fingerprint = c.fingerprint;
                    }
                    self.tree.statecache_add(s);
                }
                self.set_node_state(s, TreeState::Synced);
                Ok(None)
            }
            (true, false) => {
                if !self.flags.moves_were_complete {
                    self.revisit.insert(parent);
                    return Ok(None);
                }
                if !self.config.sync_type.syncs_up() {
                    // 单向下行：云端是权威，拉回
                    self.start_download(s, &c, dir_path.join(&f.name));
                    return Ok(None);
                }
                // 本地变了：上行
                self.upload_over(s, parent, &f, dir_path).await
            }
            (false, true) => {
                if self.config.is_backup() {
                    return match self.config.backup_state {
                        BackupState::Monitor => {
                            self.backup_modified();
                            Ok(None)
                        }
                        // 镜像期本地是权威：把本地内容推回去
                        _ => self.upload_over(s, parent, &f, dir_path).await,
                    };
                }
                if !self.config.sync_type.syncs_down() {
                    return Ok(None);
                }
                if !self.flags.moves_were_complete {
                    self.revisit.insert(parent);
                    return Ok(None);
                }
                // 云端变了：下行
                self.start_download(s, &c, dir_path.join(&f.name));
                Ok(None)
            }
            (true, true) => {
                // 双侧都变：选赢家
                if !self.flags.moves_were_complete {
                    self.revisit.insert(parent);
                    return Ok(None);
                }
                if self.config.is_backup() || !self.config.sync_type.syncs_down() {
                    return self.upload_over(s, parent, &f, dir_path).await;
                }
                if !self.config.sync_type.syncs_up() {
                    self.start_download(s, &c, dir_path.join(&f.name));
                    return Ok(None);
                }

                let cloud_wins = match c.mtime.cmp(&f.mtime) {
                    std::cmp::Ordering::Greater => true,
                    std::cmp::Ordering::Less => false,
                    // mtime 平手：大的赢；再平手云端赢
                    std::cmp::Ordering::Equal => c.size >= f.size,
                };

                if cloud_wins {
                    debug!("双改冲突，云端胜出: {}", f.name);
                    // 败方本地版本进回收区留档
                    let path = dir_path.join(&f.name);
                    if !self.retry_move_to_debris(&path).await {
                        self.revisit.insert(parent);
                        return Ok(None);
                    }
                    self.mark_needs_rescan(parent);
                    self.start_download(s, &c, path);
                    Ok(None)
                } else {
                    debug!("双改冲突，本地胜出: {}", f.name);
                    self.upload_over(s, parent, &f, dir_path).await
                }
            }
        }
    }

    // ============ 传输与移动的发起 ============

    /// 读文件算完整指纹；stat 后被改则记 LocalStale 延后
    async fn read_fingerprint(
        &mut self,
        f: &FsNode,
        parent: NodeDbId,
        dir_path: &Path,
    ) -> Option<Fingerprint> {
        let path = dir_path.join(&f.name);
        let meta = FileMeta {
            node_type: NodeType::File,
            size: f.size,
            mtime: f.mtime,
            fsid: f.fsid,
            short_name: f.short_name.clone(),
        };
        match self.fs.open_unchanged(&path, &meta).await {
            Ok(OpenOutcome::Data(data)) => Some(Fingerprint::from_bytes(&data, f.mtime)),
            Ok(OpenOutcome::Stale) => {
                let display = self.rel_display(dir_path, &f.name);
                self.record_stall(parent, display, StallReason::LocalStale);
                self.mark_needs_rescan(parent);
                None
            }
            Err(e) => {
                warn!("读取本地文件失败: {:?} - {}", path, e);
                self.transient_error = true;
                self.revisit.insert(parent);
                None
            }
        }
    }

    fn start_upload(
        &mut self,
        dbid: NodeDbId,
        parent_handle: NodeHandle,
        path: PathBuf,
        cloud_name: String,
        fingerprint: Fingerprint,
    ) {
        let id = self.transfers.upload(UploadRequest {
            local_path: path,
            parent: parent_handle,
            name: cloud_name,
            fingerprint,
        });
        if let Some(node) = self.tree.get_mut(dbid) {
            node.transfer_active = Some(id);
        }
        self.pending_transfers.insert(
            id,
            PendingTransfer {
                dbid,
                kind: TransferKind::Up,
                fingerprint: None,
            },
        );
        self.set_node_state(dbid, TreeState::Syncing);
        self.pass_mutations += 1;
    }

    fn start_download(&mut self, dbid: NodeDbId, c: &CloudNode, path: PathBuf) {
        let id = self.transfers.download(DownloadRequest {
            handle: c.handle,
            target_path: path,
            mtime: c.mtime,
        });
        if let Some(node) = self.tree.get_mut(dbid) {
            node.transfer_active = Some(id);
        }
        self.pending_transfers.insert(
            id,
            PendingTransfer {
                dbid,
                kind: TransferKind::Down,
                fingerprint: c.fingerprint,
            },
        );
        self.set_node_state(dbid, TreeState::Syncing);
        self.pass_mutations += 1;
    }

    /// 覆盖式上行：读内容、发上传，完成时重新配对
    async fn upload_over(
        &mut self,
        s: NodeDbId,
        parent: NodeDbId,
        f: &FsNode,
        dir_path: &Path,
    ) -> Result<Option<NodeDbId>> {
        let Some(parent_handle) = self.tree.get(parent).and_then(|n| n.cloud_handle) else {
            let display = self.rel_display(dir_path, &f.name);
            self.record_stall(parent, display, StallReason::ParentMissing);
            return Ok(None);
        };

        let Some(fingerprint) = self.read_fingerprint(f, parent, dir_path).await else {
            return Ok(None);
        };

        if let Some(node) = self.tree.get_mut(s) {
            node.fingerprint = Some(fingerprint);
        }
        self.tree.statecache_add(s);
        self.start_upload(
            s,
            parent_handle,
            dir_path.join(&f.name),
            self.cloud_name_for(&f.name),
            fingerprint,
        );
        Ok(None)
    }

    /// 云端动了：在本地做等价移动（不重新下载）；成功返回 true
    async fn perform_local_move(
        &mut self,
        source: NodeDbId,
        new_parent: NodeDbId,
        c: &CloudNode,
        dir_path: &Path,
    ) -> Result<bool> {
        let local_name = escape_fs_incompatible(&c.name, self.fs.family());
        let from = self.tree.path_of(source, &self.config.local_path);
        let to = dir_path.join(&local_name);

        if !self.retry_rename(&from, &to).await {
            self.revisit.insert(new_parent);
            return Ok(false);
        }

        let old_parent = self.tree.get(source).and_then(|n| n.parent);
        self.tree.move_node(source, new_parent, &local_name);
        self.tree.pair(source, c.handle);
        if let Some(node) = self.tree.get_mut(source) {
            node.self_notified = true;
        }
        if let Some(p) = old_parent {
            self.mark_needs_rescan(p);
        }
        self.mark_needs_rescan(new_parent);
        self.pass_mutations += 1;
        info!("本地移动完成: {:?} -> {:?}", from, to);
        Ok(true)
    }

    /// 本地动了：让云端做等价移动（不重新上传）；成功返回 true
    async fn perform_cloud_move(
        &mut self,
        source: NodeDbId,
        paired: NodeHandle,
        new_parent: NodeDbId,
        f: &FsNode,
        dir_path: &Path,
    ) -> Result<bool> {
        let Some(new_parent_handle) = self.tree.get(new_parent).and_then(|n| n.cloud_handle)
        else {
            let display = self.rel_display(dir_path, &f.name);
            self.record_stall(new_parent, display, StallReason::ParentMissing);
            self.revisit.insert(new_parent);
            return Ok(false);
        };

        let old_parent = self.tree.get(source).and_then(|n| n.parent);
        let old_parent_handle = old_parent
            .and_then(|p| self.tree.get(p))
            .and_then(|n| n.cloud_handle);
        let old_name = self
            .tree
            .get(source)
            .map(|n| n.name.clone())
            .unwrap_or_default();

        // 跨目录才需要 move；同目录只要 rename
        if old_parent_handle != Some(new_parent_handle) {
            self.expected_cloud_events.insert(paired);
            let cloud = self.cloud.clone();
            let result = cloud.move_node(paired, new_parent_handle).await;
            if self.cloud_op(result).is_none() {
                self.revisit.insert(new_parent);
                return Ok(false);
            }
        }
        let cloud_name = self.cloud_name_for(&f.name);
        if old_name != f.name {
            self.expected_cloud_events.insert(paired);
            let cloud = self.cloud.clone();
            let result = cloud.rename_node(paired, &cloud_name).await;
            if self.cloud_op(result).is_none() {
                self.revisit.insert(new_parent);
                return Ok(false);
            }
        }

        // 同步云端镜像
        if let Some(mut cnode) = self.cloud_tree.get(paired).cloned() {
            cnode.parent = Some(new_parent_handle);
            cnode.name = cloud_name;
            self.cloud_tree.insert(cnode);
        }

        self.tree.move_node(source, new_parent, &f.name);
        self.tree.set_fsid(source, f.fsid);
        if let Some(p) = old_parent {
            self.mark_needs_rescan(p);
        }
        self.mark_needs_rescan(new_parent);
        self.pass_mutations += 1;
        info!("云端移动完成: {} -> {}", old_name, f.name);
        Ok(true)
    }

    // ============ 基础操作（重试与错误分类） ============

    /// 云端调用结果分类：瞬时→下轮重试，永久→停用
    fn cloud_op<T>(&mut self, result: std::result::Result<T, CloudError>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(CloudError::Transient(msg)) => {
                warn!("云端操作瞬时失败: {}", msg);
                self.transient_error = true;
                None
            }
            Err(CloudError::Permanent(code)) => {
                warn!("云端操作永久失败: {}", code);
                self.disable(code);
                None
            }
        }
    }

    async fn cloud_delete(&mut self, handle: NodeHandle) {
        self.expected_cloud_events.insert(handle);
        let cloud = self.cloud.clone();
        let result = cloud.delete_node(handle).await;
        if self.cloud_op(result).is_some() {
            self.cloud_tree.remove(handle);
        }
    }

    async fn retry_mkdir(&mut self, path: &Path) -> bool {
        for attempt in 0..=self.options.max_fs_retries {
            match self.fs.mkdir(path).await {
                Ok(_) => return true,
                Err(e) => {
                    warn!("创建目录失败 ({}): {:?} - {}", attempt, path, e);
                    self.backoff(attempt).await;
                }
            }
        }
        self.transient_error = true;
        false
    }

    async fn retry_rename(&mut self, from: &Path, to: &Path) -> bool {
        for attempt in 0..=self.options.max_fs_retries {
            match self.fs.rename(from, to).await {
                Ok(_) => return true,
                Err(e) => {
                    warn!("改名失败 ({}): {:?} - {}", attempt, from, e);
                    self.backoff(attempt).await;
                }
            }
        }
        self.transient_error = true;
        false
    }

    async fn retry_move_to_debris(&mut self, path: &Path) -> bool {
        for attempt in 0..=self.options.max_fs_retries {
            match self.fs.move_to_debris(path, &self.config.local_path).await {
                Ok(_) => return true,
                Err(e) => {
                    warn!("移入回收区失败 ({}): {:?} - {}", attempt, path, e);
                    self.backoff(attempt).await;
                }
            }
        }
        self.transient_error = true;
        false
    }

    async fn backoff(&self, attempt: u32) {
        let delay = self.options.retry_base_delay_ms * (1u64 << attempt.min(6));
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    fn set_node_state(&mut self, dbid: NodeDbId, state: TreeState) {
        if self.tree.set_tree_state(dbid, state) {
            let path = self.tree.path_of(dbid, &self.config.local_path);
            self.app
                .syncupdate_treestate(self.config.backup_id, &path, state);
        }
    }

    // ============ 轮末 ============

    async fn flush_cache(&mut self) -> Result<usize> {
        if self.tree.queues_empty() {
            return Ok(0);
        }
        let (insert_ids, deletes) = self.tree.take_queues();
        let inserts: Vec<NodeRecord> = insert_ids
            .iter()
            .filter_map(|dbid| self.tree.get(*dbid).map(NodeRecord::from_node))
            .collect();
        let count = inserts.len() + deletes.len();
        self.cache.flush(&inserts, &deletes).await?;
        Ok(count)
    }

    /// 被摘除目录残留的冲突/卡住记录清掉
    fn prune_dead_dirs(&mut self) {
        self.name_conflicts
            .retain(|dir, _| self.tree.get(*dir).is_some());
        self.stalled_paths
            .retain(|dir, _| self.tree.get(*dir).is_some());
    }

    fn publish_edges(&mut self) {
        let conflicts_present = self.name_conflicts.values().any(|s| !s.is_empty());
        if conflicts_present != self.conflicts_published {
            self.app.syncupdate_conflicts(conflicts_present);
            self.conflicts_published = conflicts_present;
        }

        let scanning = !self.pending_scans.is_empty();
        if scanning != self.scanning_published {
            self.app.syncupdate_scanning(scanning);
            self.scanning_published = scanning;
        }
    }

    fn update_stall_state(&mut self, pending: bool) {
        let progressed =
            self.pass_mutations > 0 || self.pass_pairings > 0 || self.pass_tree_ops > 0;
        let unresolved = self.stalled_paths.values().any(|m| !m.is_empty());

        if progressed || !unresolved {
            self.no_progress_count = 0;
            if self.stalled_published {
                self.app.syncupdate_stalled(false);
                self.stalled_published = false;
            }
            return;
        }

        // 目标不可达的轮不参与 stall 计数（信息不全不下结论）
        if !pending && self.flags.scan_target_reachable {
            self.no_progress_count += 1;
            if self.no_progress_count >= self.options.stall_limit && !self.stalled_published {
                info!(
                    "同步 {} 进入 stalled ({} 个未解决路径)",
                    self.config.name,
                    self.stalled_paths.values().map(|m| m.len()).sum::<usize>()
                );
                self.app.syncupdate_stalled(true);
                self.stalled_published = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::mock::MockWorld;
    use crate::config::SyncType;
    use crate::fs::{FsFamily, LocalFs};
    use std::sync::Mutex as StdMutex;

    struct TestApp {
        conflicts: StdMutex<Vec<bool>>,
        stalled: StdMutex<Vec<bool>>,
        stateconfig: StdMutex<Vec<(SyncError, bool)>>,
    }

    impl TestApp {
        fn new() -> Arc<TestApp> {
            Arc::new(TestApp {
                conflicts: StdMutex::new(Vec::new()),
                stalled: StdMutex::new(Vec::new()),
                stateconfig: StdMutex::new(Vec::new()),
            })
        }
    }

    impl AppCallbacks for TestApp {
        fn syncupdate_stateconfig(&self, config: &SyncConfig) {
            self.stateconfig
                .lock()
                .unwrap()
                .push((config.error, config.enabled));
        }
        fn syncupdate_treestate(&self, _backup_id: u64, _path: &Path, _state: TreeState) {}
        fn syncupdate_conflicts(&self, present: bool) {
            self.conflicts.lock().unwrap().push(present);
        }
        fn syncupdate_stalled(&self, stalled: bool) {
            self.stalled.lock().unwrap().push(stalled);
        }
        fn syncupdate_scanning(&self, _scanning: bool) {}
    }

    fn write_file_mtime(path: &Path, data: &[u8], mtime: i64) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, data).unwrap();
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(
            std::time::UNIX_EPOCH + std::time::Duration::from_secs(mtime as u64),
        )
        .unwrap();
    }

    async fn start_sync(
        local: &Path,
        world: &mut MockWorld,
        sync_type: SyncType,
        family: FsFamily,
        app: Arc<TestApp>,
    ) -> Sync {
        let config = SyncConfig::new(
            local.to_path_buf(),
            "测试同步".to_string(),
            world.root,
            "/".to_string(),
            sync_type,
        );
        let (cloud_events, transfer_events) = world.take_receivers();
        let deps = SyncDeps {
            fs: Arc::new(LocalFs::with_family(family)),
            cloud: world.client(),
            transfers: world.transfers(),
            app,
            waiter: Waiter::new(),
            cloud_events,
            transfer_events,
        };
        Sync::start(
            config,
            deps,
            world.snapshot(),
            SyncNodeCache::open_in_memory().await.unwrap(),
        )
        .await
        .unwrap()
    }

    fn debris_files(root: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        let debris = root.join(".debris");
        let Ok(days) = std::fs::read_dir(&debris) else {
            return out;
        };
        for day in days.flatten() {
            if day.path().is_dir() {
                if let Ok(files) = std::fs::read_dir(day.path()) {
                    out.extend(files.flatten().map(|f| f.path()));
                }
            }
        }
        out
    }

    // 场景 1：纯上传
    #[tokio::test]
    async fn test_pure_upload_converges() {
        let dir = tempfile::tempdir().unwrap();
        write_file_mtime(&dir.path().join("a/b.txt"), b"hello", 1000);

        let mut world = MockWorld::new();
        let app = TestApp::new();
        let mut sync = start_sync(dir.path(), &mut world, SyncType::TwoWay, FsFamily::Ext, app)
            .await;

        let passes = sync.run_until_idle(30).await.unwrap();
        // 收敛轮数有界（树深 2）
        assert!(passes <= 8, "收敛用了 {} 轮", passes);

        let b = world.find("a/b.txt").expect("云端应有 a/b.txt");
        assert_eq!(world.content_of(b).unwrap(), b"hello");
        assert_eq!(sync.state(), SyncState::Active);

        // 幂等：再跑一轮没有任何变更与缓存写入
        let outcome = sync.sync_pass().await.unwrap();
        assert_eq!(outcome.mutations, 0);
        assert_eq!(outcome.cache_writes, 0);
    }

    // 场景 2：纯下载
    #[tokio::test]
    async fn test_pure_download_converges() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = MockWorld::new();
        let x = world.setup_folder(world.root, "x");
        let data = vec![7u8; 1024];
        world.setup_file(x, "y.bin", &data, 2000);

        let app = TestApp::new();
        let mut sync = start_sync(dir.path(), &mut world, SyncType::TwoWay, FsFamily::Ext, app)
            .await;
        sync.run_until_idle(30).await.unwrap();

        let local_file = dir.path().join("x/y.bin");
        let meta = std::fs::metadata(&local_file).expect("本地应有 x/y.bin");
        assert_eq!(meta.len(), 1024);
        assert_eq!(std::fs::read(&local_file).unwrap(), data);

        // 幂等
        let outcome = sync.sync_pass().await.unwrap();
        assert_eq!(outcome.mutations, 0);
    }

    // 场景 3：本地改名 → 恰好一次云端 rename，零上传
    #[tokio::test]
    async fn test_local_rename_issues_cloud_rename() {
        let dir = tempfile::tempdir().unwrap();
        write_file_mtime(&dir.path().join("a/b.txt"), b"content", 1000);

        let mut world = MockWorld::new();
        let app = TestApp::new();
        let mut sync = start_sync(dir.path(), &mut world, SyncType::TwoWay, FsFamily::Ext, app)
            .await;
        sync.run_until_idle(30).await.unwrap();
        let (_, _, _, _, uploads_before, _) = world.counters();

        std::fs::rename(dir.path().join("a/b.txt"), dir.path().join("a/c.txt")).unwrap();
        sync.notify_subtree_dirty(dir.path().join("a"));
        sync.run_until_idle(30).await.unwrap();

        let (_, renames, _, _, uploads_after, _) = world.counters();
        assert_eq!(renames, 1);
        assert_eq!(uploads_after, uploads_before);
        assert!(world.find("a/c.txt").is_some());
        assert!(world.find("a/b.txt").is_none());
    }

    // 场景 4：云端移动 → 恰好一次本地改名，零下载
    #[tokio::test]
    async fn test_cloud_move_issues_local_rename() {
        let dir = tempfile::tempdir().unwrap();
        write_file_mtime(&dir.path().join("a/b.txt"), b"content", 1000);
        std::fs::create_dir_all(dir.path().join("z")).unwrap();

        let mut world = MockWorld::new();
        let app = TestApp::new();
        let mut sync = start_sync(dir.path(), &mut world, SyncType::TwoWay, FsFamily::Ext, app)
            .await;
        sync.run_until_idle(30).await.unwrap();
        let (_, _, _, _, _, downloads_before) = world.counters();

        let b = world.find("a/b.txt").unwrap();
        let z = world.find("z").unwrap();
        world.external_move(b, z);
        sync.run_until_idle(30).await.unwrap();

        assert!(dir.path().join("z/b.txt").exists(), "本地应跟随云端移动");
        assert!(!dir.path().join("a/b.txt").exists());
        let (_, _, _, _, _, downloads_after) = world.counters();
        assert_eq!(downloads_after, downloads_before, "移动不应触发下载");
    }

    // 场景 5：双侧编辑冲突，云端 mtime 更大 → 云端赢，本地旧版进回收区
    #[tokio::test]
    async fn test_conflicting_edit_cloud_wins() {
        let dir = tempfile::tempdir().unwrap();
        write_file_mtime(&dir.path().join("a/b.txt"), b"base", 1000);

        let mut world = MockWorld::new();
        let app = TestApp::new();
        let mut sync = start_sync(dir.path(), &mut world, SyncType::TwoWay, FsFamily::Ext, app)
            .await;
        sync.run_until_idle(30).await.unwrap();

        // 本地 mtime 1100，云端 mtime 2000
        write_file_mtime(&dir.path().join("a/b.txt"), b"local edit", 1100);
        let b = world.find("a/b.txt").unwrap();
        world.external_modify(b, b"cloud edit", 2000);
        sync.notify_subtree_dirty(dir.path().join("a"));
        sync.run_until_idle(30).await.unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("a/b.txt")).unwrap(),
            b"cloud edit"
        );
        assert_eq!(world.content_of(b).unwrap(), b"cloud edit");

        // 败方留档
        let debris = debris_files(dir.path());
        assert_eq!(debris.len(), 1);
        assert_eq!(std::fs::read(&debris[0]).unwrap(), b"local edit");
    }

    // 场景 6：大小写不敏感家族下云端同名两个子项 → 冲突，一个都不下载
    #[tokio::test]
    async fn test_name_clash_records_conflict_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = MockWorld::new();
        world.setup_file(world.root, "X", b"1", 0);
        world.setup_file(world.root, "x", b"2", 0);

        let app = TestApp::new();
        let mut sync = start_sync(
            dir.path(),
            &mut world,
            SyncType::TwoWay,
            FsFamily::Apfs,
            app.clone(),
        )
        .await;
        sync.run_until_idle(30).await.unwrap();

        assert!(!dir.path().join("X").exists());
        assert!(!dir.path().join("x").exists());
        assert_eq!(sync.conflicts().len(), 1);
        // 冲突集合的边沿恰好发布一次
        assert_eq!(app.conflicts.lock().unwrap().as_slice(), &[true]);
        let (_, _, _, _, _, downloads) = world.counters();
        assert_eq!(downloads, 0);
    }

    // 云端删除传播到本地：文件进回收区
    #[tokio::test]
    async fn test_cloud_delete_moves_local_to_debris() {
        let dir = tempfile::tempdir().unwrap();
        write_file_mtime(&dir.path().join("a/b.txt"), b"hello", 1000);

        let mut world = MockWorld::new();
        let app = TestApp::new();
        let mut sync = start_sync(dir.path(), &mut world, SyncType::TwoWay, FsFamily::Ext, app)
            .await;
        sync.run_until_idle(30).await.unwrap();

        world.external_delete(world.find("a/b.txt").unwrap());
        sync.run_until_idle(30).await.unwrap();

        assert!(!dir.path().join("a/b.txt").exists());
        let debris = debris_files(dir.path());
        assert_eq!(debris.len(), 1);
        assert_eq!(std::fs::read(&debris[0]).unwrap(), b"hello");
    }

    // 本地删除传播到云端
    #[tokio::test]
    async fn test_local_delete_propagates_to_cloud() {
        let dir = tempfile::tempdir().unwrap();
        write_file_mtime(&dir.path().join("a/b.txt"), b"hello", 1000);

        let mut world = MockWorld::new();
        let app = TestApp::new();
        let mut sync = start_sync(dir.path(), &mut world, SyncType::TwoWay, FsFamily::Ext, app)
            .await;
        sync.run_until_idle(30).await.unwrap();

        std::fs::remove_file(dir.path().join("a/b.txt")).unwrap();
        sync.notify_subtree_dirty(dir.path().join("a"));
        sync.run_until_idle(30).await.unwrap();

        assert!(world.find("a/b.txt").is_none());
        let (_, _, deletes, _, _, _) = world.counters();
        assert_eq!(deletes, 1);
    }

    // 备份：镜像收敛进入监视期，云端外部改动停用并带专属错误
    #[tokio::test]
    async fn test_backup_disabled_on_external_cloud_change() {
        let dir = tempfile::tempdir().unwrap();
        write_file_mtime(&dir.path().join("doc.txt"), b"mine", 1000);

        let mut world = MockWorld::new();
        let app = TestApp::new();
        let mut sync = start_sync(
            dir.path(),
            &mut world,
            SyncType::Backup,
            FsFamily::Ext,
            app.clone(),
        )
        .await;
        sync.run_until_idle(30).await.unwrap();
        assert_eq!(sync.config.backup_state, BackupState::Monitor);

        world.external_add_file(world.root, "intruder.txt", b"not mine", 0);
        sync.run_until_idle(10).await.unwrap();

        assert_eq!(sync.state(), SyncState::Disabled);
        assert_eq!(sync.config.error, SyncError::BackupModified);
        assert!(!sync.config.enabled);
        let events = app.stateconfig.lock().unwrap();
        assert!(events.contains(&(SyncError::BackupModified, false)));
    }

    // 自通知不回环：引擎自己的变更重放回来不再引发第二次变更
    #[tokio::test]
    async fn test_no_self_notification_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = MockWorld::new();
        world.setup_file(world.root, "f.txt", b"data", 1500);

        let app = TestApp::new();
        let mut sync = start_sync(dir.path(), &mut world, SyncType::TwoWay, FsFamily::Ext, app)
            .await;
        sync.run_until_idle(30).await.unwrap();
        assert!(dir.path().join("f.txt").exists());

        let counters_before = world.counters();
        // 把引擎刚下载的文件当作监视器通知重放
        sync.notify_subtree_dirty(dir.path().join("f.txt"));
        sync.run_until_idle(10).await.unwrap();

        assert_eq!(world.counters(), counters_before);
    }

    // 冲突静置若干轮后进入 stalled，原因带路径
    #[tokio::test]
    async fn test_stall_after_unresolved_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let mut world = MockWorld::new();
        world.setup_file(world.root, "X", b"1", 0);
        world.setup_file(world.root, "x", b"2", 0);

        let app = TestApp::new();
        let mut sync = start_sync(
            dir.path(),
            &mut world,
            SyncType::TwoWay,
            FsFamily::Apfs,
            app.clone(),
        )
        .await;
        sync.run_until_idle(30).await.unwrap();

        // 无进展轮累计
        for _ in 0..3 {
            sync.sync_pass().await.unwrap();
        }
        assert_eq!(app.stalled.lock().unwrap().as_slice(), &[true]);
        let stalls = sync.stalled_paths();
        assert!(stalls
            .iter()
            .any(|(_, reason)| *reason == StallReason::NameConflict));
    }

    // 不相交改名的交换律：两种顺序收敛到同一云端状态
    #[tokio::test]
    async fn test_disjoint_renames_commute() {
        async fn final_listing(order: [(&str, &str); 2]) -> Vec<String> {
            let dir = tempfile::tempdir().unwrap();
            write_file_mtime(&dir.path().join("f1.txt"), b"one", 1000);
            write_file_mtime(&dir.path().join("f2.txt"), b"two", 1000);

            let mut world = MockWorld::new();
            let app = TestApp::new();
            let mut sync =
                start_sync(dir.path(), &mut world, SyncType::TwoWay, FsFamily::Ext, app).await;
            sync.run_until_idle(30).await.unwrap();

            for (from, to) in order {
                std::fs::rename(dir.path().join(from), dir.path().join(to)).unwrap();
            }
            sync.notify_subtree_dirty(dir.path().to_path_buf());
            sync.run_until_idle(30).await.unwrap();

            world.children_names(world.root)
        }

        let a = final_listing([("f1.txt", "g1.txt"), ("f2.txt", "g2.txt")]).await;
        let b = final_listing([("f2.txt", "g2.txt"), ("f1.txt", "g1.txt")]).await;
        assert_eq!(a, b);
        assert_eq!(a, vec!["g1.txt".to_string(), "g2.txt".to_string()]);
    }

    // 重启恢复：磁盘缓存重建后不重传已同步内容
    #[tokio::test]
    async fn test_cache_restart_recovers_without_retransfer() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache_path = cache_dir.path().join("nodes.db");
        write_file_mtime(&dir.path().join("a/b.txt"), b"hello", 1000);

        let mut world = MockWorld::new();
        let app = TestApp::new();

        let saved_config;
        {
            let config = SyncConfig::new(
                dir.path().to_path_buf(),
                "重启测试".to_string(),
                world.root,
                "/".to_string(),
                SyncType::TwoWay,
            );
            let (cloud_events, transfer_events) = world.take_receivers();
            let deps = SyncDeps {
                fs: Arc::new(LocalFs::with_family(FsFamily::Ext)),
                cloud: world.client(),
                transfers: world.transfers(),
                app: app.clone(),
                waiter: Waiter::new(),
                cloud_events,
                transfer_events,
            };
            let mut sync = Sync::start(
                config,
                deps,
                world.snapshot(),
                SyncNodeCache::open(&cache_path).await.unwrap(),
            )
            .await
            .unwrap();
            sync.run_until_idle(30).await.unwrap();
            saved_config = sync.shutdown().await;
        }

        let uploads_before = world.counters().4;

        // 重启：同一缓存文件、同一配置
        let (cloud_events, transfer_events) = world.reset_channels();
        let deps = SyncDeps {
            fs: Arc::new(LocalFs::with_family(FsFamily::Ext)),
            cloud: world.client(),
            transfers: world.transfers(),
            app: app.clone(),
            waiter: Waiter::new(),
            cloud_events,
            transfer_events,
        };
        let mut sync = Sync::start(
            saved_config,
            deps,
            world.snapshot(),
            SyncNodeCache::open(&cache_path).await.unwrap(),
        )
        .await
        .unwrap();
        sync.run_until_idle(30).await.unwrap();

        assert_eq!(world.counters().4, uploads_before, "重启不应重传");
        assert_eq!(sync.state(), SyncState::Active);
    }
}
