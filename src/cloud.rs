//! 云端节点模型与协作方接口
//!
//! 云端状态真正的所有者在外部（RPC 客户端线程）；核心只持有一棵
//! 只读镜像树 `CloudTree`，通过变更通知在同步线程上更新。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::core::fingerprint::Fingerprint;
use crate::core::node::TreeState;
use crate::error::SyncError;

/// 云端节点的稳定 8 字节句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeHandle(pub u64);

impl NodeHandle {
    /// 大端十六进制（配置文件里的 "rh" 等字段用这个形式）
    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn from_hex(s: &str) -> Option<NodeHandle> {
        u64::from_str_radix(s, 16).ok().map(NodeHandle)
    }
}

impl std::fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// 云端节点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudNodeType {
    File,
    Folder,
    Root,
    Vault,
    Rubbish,
    Other,
}

impl CloudNodeType {
    pub fn is_container(self) -> bool {
        matches!(
            self,
            CloudNodeType::Folder | CloudNodeType::Root | CloudNodeType::Vault | CloudNodeType::Rubbish
        )
    }
}

/// 云端节点（镜像副本）
#[derive(Debug, Clone)]
pub struct CloudNode {
    pub handle: NodeHandle,
    pub parent: Option<NodeHandle>,
    pub name: String,
    pub node_type: CloudNodeType,
    /// 文件才有内容指纹
    pub fingerprint: Option<Fingerprint>,
    pub mtime: i64,
    pub size: u64,
    pub owner: Option<NodeHandle>,
}

/// 变更通知的逐字段掩码
#[derive(Debug, Clone, Copy, Default)]
pub struct CloudChanges {
    pub name: bool,
    pub parent: bool,
    pub fingerprint: bool,
    pub attrs: bool,
    /// 节点被删除（node 字段携带最后已知状态）
    pub removed: bool,
    /// 新出现的节点
    pub fresh: bool,
}

/// 云端变更通知
#[derive(Debug, Clone)]
pub struct CloudEvent {
    pub node: CloudNode,
    pub changes: CloudChanges,
}

/// 子树统计（files, folders, 存储字节）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCounter {
    pub files: u64,
    pub folders: u64,
    pub storage: u64,
}

impl std::ops::AddAssign for NodeCounter {
    fn add_assign(&mut self, o: NodeCounter) {
        self.files += o.files;
        self.folders += o.folders;
        self.storage += o.storage;
    }
}

/// 云端子树镜像；仅同步线程修改
#[derive(Debug, Default)]
pub struct CloudTree {
    nodes: HashMap<NodeHandle, CloudNode>,
    children: HashMap<NodeHandle, HashSet<NodeHandle>>,
}

impl CloudTree {
    pub fn new() -> CloudTree {
        CloudTree::default()
    }

    pub fn get(&self, handle: NodeHandle) -> Option<&CloudNode> {
        self.nodes.get(&handle)
    }

    pub fn contains(&self, handle: NodeHandle) -> bool {
        self.nodes.contains_key(&handle)
    }

    /// 插入或更新一个镜像节点（初始填充、通知应用共用）
    pub fn insert(&mut self, node: CloudNode) {
        let old_parent = self.nodes.get(&node.handle).and_then(|n| n.parent);
        if old_parent != node.parent {
            if let Some(p) = old_parent {
                if let Some(set) = self.children.get_mut(&p) {
                    set.remove(&node.handle);
                }
            }
        }
        if let Some(parent) = node.parent {
            self.children.entry(parent).or_default().insert(node.handle);
        }
        self.nodes.insert(node.handle, node);
    }

    pub fn remove(&mut self, handle: NodeHandle) {
        if let Some(node) = self.nodes.remove(&handle) {
            if let Some(parent) = node.parent {
                if let Some(set) = self.children.get_mut(&parent) {
                    set.remove(&handle);
                }
            }
        }
        // 子孙一并摘除
        if let Some(kids) = self.children.remove(&handle) {
            for kid in kids {
                self.remove(kid);
            }
        }
    }

    /// 应用一条变更通知
    pub fn apply_event(&mut self, event: &CloudEvent) {
        if event.changes.removed {
            self.remove(event.node.handle);
        } else {
            self.insert(event.node.clone());
        }
    }

    /// 目录的直接子节点
    pub fn children_of(&self, handle: NodeHandle) -> Vec<&CloudNode> {
        match self.children.get(&handle) {
            Some(set) => {
                let mut out: Vec<&CloudNode> =
                    set.iter().filter_map(|h| self.nodes.get(h)).collect();
                out.sort_by(|a, b| a.name.cmp(&b.name).then(a.handle.cmp(&b.handle)));
                out
            }
            None => Vec::new(),
        }
    }

    /// `descendant` 是否位于 `ancestor` 之下（含相等）
    pub fn is_below(&self, descendant: NodeHandle, ancestor: NodeHandle) -> bool {
        let mut cur = Some(descendant);
        while let Some(h) = cur {
            if h == ancestor {
                return true;
            }
            cur = self.nodes.get(&h).and_then(|n| n.parent);
        }
        false
    }

    /// 子树统计，用于超储判定
    pub fn counter(&self, handle: NodeHandle) -> NodeCounter {
        let mut total = NodeCounter::default();
        let Some(node) = self.nodes.get(&handle) else {
            return total;
        };
        match node.node_type {
            CloudNodeType::File => {
                total.files += 1;
                total.storage += node.size;
            }
            _ => total.folders += 1,
        }
        if let Some(kids) = self.children.get(&handle) {
            for kid in kids.clone() {
                total += self.counter(kid);
            }
        }
        total
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// 云端操作失败的分类
#[derive(Debug, Clone)]
pub enum CloudError {
    /// 瞬时失败：下一轮重试
    Transient(String),
    /// 永久失败：携带映射好的停用原因
    Permanent(SyncError),
}

impl std::fmt::Display for CloudError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloudError::Transient(msg) => write!(f, "transient cloud error: {}", msg),
            CloudError::Permanent(err) => write!(f, "permanent cloud error: {}", err),
        }
    }
}

impl std::error::Error for CloudError {}

pub type CloudResult<T> = std::result::Result<T, CloudError>;

/// 云端 RPC 客户端（外部实现）
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// 移动节点到新父目录
    async fn move_node(&self, handle: NodeHandle, new_parent: NodeHandle) -> CloudResult<()>;

    /// 重命名节点
    async fn rename_node(&self, handle: NodeHandle, new_name: &str) -> CloudResult<()>;

    /// 删除节点（含子树）
    async fn delete_node(&self, handle: NodeHandle) -> CloudResult<()>;

    /// 新建云端目录
    async fn put_folder(&self, parent: NodeHandle, name: &str) -> CloudResult<NodeHandle>;

    /// 更新节点属性（mtime 等）
    async fn set_attr(&self, handle: NodeHandle, mtime: i64) -> CloudResult<()>;
}

pub type TransferId = u64;

/// 上传请求
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub local_path: PathBuf,
    pub parent: NodeHandle,
    pub name: String,
    pub fingerprint: Fingerprint,
}

/// 下载请求
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub handle: NodeHandle,
    pub target_path: PathBuf,
    pub mtime: i64,
}

/// 传输完成结果
#[derive(Debug, Clone)]
pub enum TransferOutcome {
    /// 上传完成，云端节点已建立
    UploadDone { new_handle: NodeHandle },
    /// 下载完成，文件已写到目标路径
    DownloadDone,
    Failed { transient: bool, message: String },
}

/// 传输完成事件（由传输引擎投递到引擎的事件通道）
#[derive(Debug, Clone)]
pub struct TransferEvent {
    pub id: TransferId,
    pub outcome: TransferOutcome,
}

/// 传输引擎（外部实现）：只发请求、观察完成
pub trait TransferEngine: Send + Sync {
    fn upload(&self, req: UploadRequest) -> TransferId;
    fn download(&self, req: DownloadRequest) -> TransferId;
    fn cancel(&self, id: TransferId);
}

/// 应用回调
pub trait AppCallbacks: Send + Sync {
    /// (error, enabled) 组合变化时恰好回调一次
    fn syncupdate_stateconfig(&self, config: &crate::config::SyncConfig);
    fn syncupdate_treestate(&self, backup_id: u64, path: &Path, state: TreeState);
    /// 冲突集合在有/无之间翻转时回调
    fn syncupdate_conflicts(&self, present: bool);
    fn syncupdate_stalled(&self, stalled: bool);
    fn syncupdate_scanning(&self, scanning: bool);
}

/// 缺省空回调
pub struct NullCallbacks;

impl AppCallbacks for NullCallbacks {
    fn syncupdate_stateconfig(&self, _config: &crate::config::SyncConfig) {}
    fn syncupdate_treestate(&self, _backup_id: u64, _path: &Path, _state: TreeState) {}
    fn syncupdate_conflicts(&self, _present: bool) {}
    fn syncupdate_stalled(&self, _stalled: bool) {}
    fn syncupdate_scanning(&self, _scanning: bool) {}
}


#[cfg(test)]
mod tests {
    use super::*;

    fn folder(handle: u64, parent: Option<u64>, name: &str) -> CloudNode {
        CloudNode {
            handle: NodeHandle(handle),
            parent: parent.map(NodeHandle),
            name: name.to_string(),
            node_type: CloudNodeType::Folder,
            fingerprint: None,
            mtime: 0,
            size: 0,
            owner: None,
        }
    }

    fn file(handle: u64, parent: u64, name: &str, data: &[u8], mtime: i64) -> CloudNode {
        CloudNode {
            handle: NodeHandle(handle),
            parent: Some(NodeHandle(parent)),
            name: name.to_string(),
            node_type: CloudNodeType::File,
            fingerprint: Some(Fingerprint::from_bytes(data, mtime)),
            mtime,
            size: data.len() as u64,
            owner: None,
        }
    }

    #[test]
    fn test_handle_hex_roundtrip() {
        let h = NodeHandle(0xdead_beef_0042);
        assert_eq!(NodeHandle::from_hex(&h.to_hex()), Some(h));
        assert!(NodeHandle::from_hex("zz").is_none());
    }

    #[test]
    fn test_tree_children_and_ancestry() {
        let mut tree = CloudTree::new();
        tree.insert(folder(1, None, "root"));
        tree.insert(folder(2, Some(1), "a"));
        tree.insert(file(3, 2, "b.txt", b"hello", 100));

        let kids = tree.children_of(NodeHandle(2));
        assert_eq!(kids.len(), 1);
        assert_eq!(kids[0].name, "b.txt");

        assert!(tree.is_below(NodeHandle(3), NodeHandle(1)));
        assert!(!tree.is_below(NodeHandle(1), NodeHandle(3)));
    }

    #[test]
    fn test_remove_drops_subtree() {
        let mut tree = CloudTree::new();
        tree.insert(folder(1, None, "root"));
        tree.insert(folder(2, Some(1), "a"));
        tree.insert(file(3, 2, "b.txt", b"x", 0));

        tree.remove(NodeHandle(2));
        assert!(!tree.contains(NodeHandle(2)));
        assert!(!tree.contains(NodeHandle(3)));
        assert!(tree.contains(NodeHandle(1)));
    }

    #[test]
    fn test_apply_move_event() {
        let mut tree = CloudTree::new();
        tree.insert(folder(1, None, "root"));
        tree.insert(folder(2, Some(1), "a"));
        tree.insert(folder(4, Some(1), "z"));
        tree.insert(file(3, 2, "b.txt", b"x", 0));

        let mut moved = tree.get(NodeHandle(3)).unwrap().clone();
        moved.parent = Some(NodeHandle(4));
        tree.apply_event(&CloudEvent {
            node: moved,
            changes: CloudChanges {
                parent: true,
                ..Default::default()
            },
        });

        assert!(tree.children_of(NodeHandle(2)).is_empty());
        assert_eq!(tree.children_of(NodeHandle(4)).len(), 1);
    }

    #[test]
    fn test_counter() {
        let mut tree = CloudTree::new();
        tree.insert(folder(1, None, "root"));
        tree.insert(file(2, 1, "a", b"12345", 0));
        tree.insert(file(3, 1, "b", b"123", 0));

        let counter = tree.counter(NodeHandle(1));
        assert_eq!(counter.files, 2);
        assert_eq!(counter.folders, 1);
        assert_eq!(counter.storage, 8);
    }
}
