//! 同步节点树
//!
//! 同步节点是本地子树与云端配对关系的缓存镜像。整棵树归同步
//! 线程独占；用稠密 32 位 dbid 的节点表表达父子与配对关系，
//! 双向配对只存一份（节点里的云端句柄），反查走 `cloud_index`。

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::cloud::{NodeHandle, TransferId};
use crate::core::fingerprint::Fingerprint;
use crate::fs::names::fold_name;
use crate::fs::NodeType;

pub type NodeDbId = u32;

/// 子树同步状态（向上聚合后报给应用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeState {
    None,
    Synced,
    Syncing,
    Pending,
}

/// 一个同步节点
#[derive(Debug, Clone)]
pub struct SyncNode {
    pub dbid: NodeDbId,
    pub node_type: NodeType,
    pub name: String,
    /// 大小写不敏感文件系统上的短名别名（与主名相同则不存）
    pub short_name: Option<String>,
    /// 文件的内容指纹
    pub fingerprint: Option<Fingerprint>,
    /// 稳定文件 ID（文件系统支持才有）
    pub fsid: Option<u64>,
    pub parent: Option<NodeDbId>,
    /// 配对的云端节点句柄（零或一个）
    pub cloud_handle: Option<NodeHandle>,
    /// 本地条目是本引擎刚创建的
    pub created_on_disk: bool,
    pub deletion_pending: bool,
    pub needs_rescan: bool,
    /// 已看到自己造成的通知（用于抑制自通知回环）
    pub self_notified: bool,
    /// 进行中的传输
    pub transfer_active: Option<TransferId>,
    pub tree_state: TreeState,
    children: HashMap<String, NodeDbId>,
    children_short: HashMap<String, NodeDbId>,
}

impl SyncNode {
    pub fn new(dbid: NodeDbId, node_type: NodeType, name: String) -> SyncNode {
        SyncNode {
            dbid,
            node_type,
            name,
            short_name: None,
            fingerprint: None,
            fsid: None,
            parent: None,
            cloud_handle: None,
            created_on_disk: false,
            deletion_pending: false,
            needs_rescan: true,
            self_notified: false,
            transfer_active: None,
            tree_state: TreeState::Pending,
            children: HashMap::new(),
            children_short: HashMap::new(),
        }
    }

    pub fn is_folder(&self) -> bool {
        self.node_type == NodeType::Folder
    }
}

pub const ROOT_DBID: NodeDbId = 1;

/// 同步节点树（含 fsid / 云端句柄两个反查索引和缓存队列）
pub struct SyncTree {
    arena: HashMap<NodeDbId, SyncNode>,
    next_dbid: NodeDbId,
    case_insensitive: bool,
    fsid_index: HashMap<u64, NodeDbId>,
    cloud_index: HashMap<NodeHandle, NodeDbId>,
    /// 本轮要写入缓存的节点
    insertq: HashSet<NodeDbId>,
    /// 本轮要从缓存删除的节点
    deleteq: HashSet<NodeDbId>,
}

impl SyncTree {
    pub fn new(case_insensitive: bool) -> SyncTree {
        let mut tree = SyncTree {
            arena: HashMap::new(),
            next_dbid: ROOT_DBID + 1,
            case_insensitive,
            fsid_index: HashMap::new(),
            cloud_index: HashMap::new(),
            insertq: HashSet::new(),
            deleteq: HashSet::new(),
        };
        let mut root = SyncNode::new(ROOT_DBID, NodeType::Folder, String::new());
        root.tree_state = TreeState::Pending;
        tree.arena.insert(ROOT_DBID, root);
        tree.statecache_add(ROOT_DBID);
        tree
    }

    pub fn case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    pub fn root(&self) -> NodeDbId {
        ROOT_DBID
    }

    pub fn get(&self, dbid: NodeDbId) -> Option<&SyncNode> {
        self.arena.get(&dbid)
    }

    pub fn get_mut(&mut self, dbid: NodeDbId) -> Option<&mut SyncNode> {
        self.arena.get_mut(&dbid)
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncNode> {
        self.arena.values()
    }

    fn fold(&self, name: &str) -> String {
        fold_name(name, self.case_insensitive)
    }

    /// 在 parent 下新建节点
    pub fn add_child(
        &mut self,
        parent: NodeDbId,
        node_type: NodeType,
        name: &str,
    ) -> Option<NodeDbId> {
        if !self.arena.contains_key(&parent) {
            return None;
        }
        let dbid = self.next_dbid;
        self.next_dbid += 1;

        let mut node = SyncNode::new(dbid, node_type, name.to_string());
        node.parent = Some(parent);
        self.arena.insert(dbid, node);

        let key = self.fold(name);
        self.arena
            .get_mut(&parent)
            .map(|p| p.children.insert(key, dbid));
        self.statecache_add(dbid);
        Some(dbid)
    }

    /// 按折叠名查子节点
    pub fn child_by_name(&self, parent: NodeDbId, name: &str) -> Option<NodeDbId> {
        let key = self.fold(name);
        let parent = self.arena.get(&parent)?;
        parent
            .children
            .get(&key)
            .or_else(|| parent.children_short.get(&key))
            .copied()
    }

    pub fn children_of(&self, parent: NodeDbId) -> Vec<NodeDbId> {
        match self.arena.get(&parent) {
            Some(p) => {
                let mut ids: Vec<NodeDbId> = p.children.values().copied().collect();
                ids.sort_unstable();
                ids
            }
            None => Vec::new(),
        }
    }

    /// 改名（维护父节点的两个名字映射）
    pub fn rename(&mut self, dbid: NodeDbId, new_name: &str) {
        let Some((parent, old_name)) = self
            .arena
            .get(&dbid)
            .map(|n| (n.parent, n.name.clone()))
        else {
            return;
        };

        if let Some(parent) = parent {
            let old_key = self.fold(&old_name);
            let new_key = self.fold(new_name);
            if let Some(p) = self.arena.get_mut(&parent) {
                p.children.remove(&old_key);
                p.children.insert(new_key, dbid);
            }
        }
        if let Some(n) = self.arena.get_mut(&dbid) {
            n.name = new_name.to_string();
        }
        self.statecache_add(dbid);
    }

    /// 设置短名别名
    pub fn set_short_name(&mut self, dbid: NodeDbId, short: Option<String>) {
        let Some((parent, old_short)) = self
            .arena
            .get(&dbid)
            .map(|n| (n.parent, n.short_name.clone()))
        else {
            return;
        };

        if let Some(parent) = parent {
            if let Some(old) = old_short {
                let key = self.fold(&old);
                if let Some(p) = self.arena.get_mut(&parent) {
                    p.children_short.remove(&key);
                }
            }
            if let Some(ref s) = short {
                let key = self.fold(s);
                if let Some(p) = self.arena.get_mut(&parent) {
                    p.children_short.insert(key, dbid);
                }
            }
        }
        if let Some(n) = self.arena.get_mut(&dbid) {
            n.short_name = short;
        }
        self.statecache_add(dbid);
    }

    /// 移动到新父目录（可同时改名）
    pub fn move_node(&mut self, dbid: NodeDbId, new_parent: NodeDbId, new_name: &str) {
        let Some((old_parent, old_name, old_short)) = self
            .arena
            .get(&dbid)
            .map(|n| (n.parent, n.name.clone(), n.short_name.clone()))
        else {
            return;
        };

        if let Some(op) = old_parent {
            let key = self.fold(&old_name);
            if let Some(p) = self.arena.get_mut(&op) {
                p.children.remove(&key);
            }
            if let Some(short) = old_short {
                let key = self.fold(&short);
                if let Some(p) = self.arena.get_mut(&op) {
                    p.children_short.remove(&key);
                }
            }
        }

        let new_key = self.fold(new_name);
        if let Some(p) = self.arena.get_mut(&new_parent) {
            p.children.insert(new_key, dbid);
        }
        if let Some(n) = self.arena.get_mut(&dbid) {
            n.parent = Some(new_parent);
            n.name = new_name.to_string();
            n.short_name = None;
        }
        self.statecache_add(dbid);
    }

    /// 摘除整棵子树（索引、队列一并处理）
    pub fn remove_subtree(&mut self, dbid: NodeDbId) {
        let child_ids: Vec<NodeDbId> = self
            .arena
            .get(&dbid)
            .map(|n| n.children.values().copied().collect())
            .unwrap_or_default();
        for child in child_ids {
            self.remove_subtree(child);
        }

        if let Some(node) = self.arena.remove(&dbid) {
            if let Some(parent) = node.parent {
                let key = self.fold(&node.name);
                if let Some(p) = self.arena.get_mut(&parent) {
                    p.children.remove(&key);
                }
                if let Some(short) = &node.short_name {
                    let key = self.fold(short);
                    if let Some(p) = self.arena.get_mut(&parent) {
                        p.children_short.remove(&key);
                    }
                }
            }
            if let Some(fsid) = node.fsid {
                self.fsid_index.remove(&fsid);
            }
            if let Some(handle) = node.cloud_handle {
                self.cloud_index.remove(&handle);
            }
            self.statecache_del(dbid);
        }
    }

    /// 设置稳定文件 ID；维护 fsid 索引唯一性
    pub fn set_fsid(&mut self, dbid: NodeDbId, fsid: Option<u64>) {
        let old = self.arena.get(&dbid).and_then(|n| n.fsid);
        if old == fsid {
            return;
        }
        if let Some(old_id) = old {
            self.fsid_index.remove(&old_id);
        }
        if let Some(new_id) = fsid {
            // 新 ID 已被别的节点占用时，旧主失去 ID（inode 已被复用）
            if let Some(prev) = self.fsid_index.insert(new_id, dbid) {
                if prev != dbid {
                    if let Some(n) = self.arena.get_mut(&prev) {
                        n.fsid = None;
                    }
                    self.statecache_add(prev);
                }
            }
        }
        if let Some(n) = self.arena.get_mut(&dbid) {
            n.fsid = fsid;
        }
        self.statecache_add(dbid);
    }

    pub fn node_by_fsid(&self, fsid: u64) -> Option<NodeDbId> {
        self.fsid_index.get(&fsid).copied()
    }

    /// 建立配对；云端反向链接（索引）同时更新
    pub fn pair(&mut self, dbid: NodeDbId, handle: NodeHandle) {
        let old = self.arena.get(&dbid).and_then(|n| n.cloud_handle);
        if let Some(old_handle) = old {
            self.cloud_index.remove(&old_handle);
        }
        if let Some(prev) = self.cloud_index.insert(handle, dbid) {
            if prev != dbid {
                if let Some(n) = self.arena.get_mut(&prev) {
                    n.cloud_handle = None;
                }
                self.statecache_add(prev);
            }
        }
        if let Some(n) = self.arena.get_mut(&dbid) {
            n.cloud_handle = Some(handle);
        }
        self.statecache_add(dbid);
    }

    pub fn unpair(&mut self, dbid: NodeDbId) {
        if let Some(handle) = self.arena.get(&dbid).and_then(|n| n.cloud_handle) {
            self.cloud_index.remove(&handle);
        }
        if let Some(n) = self.arena.get_mut(&dbid) {
            n.cloud_handle = None;
        }
        self.statecache_add(dbid);
    }

    pub fn node_by_handle(&self, handle: NodeHandle) -> Option<NodeDbId> {
        self.cloud_index.get(&handle).copied()
    }

    /// dbid 的本地路径
    pub fn path_of(&self, dbid: NodeDbId, root_path: &Path) -> PathBuf {
        let mut components = Vec::new();
        let mut cur = Some(dbid);
        while let Some(id) = cur {
            if id == ROOT_DBID {
                break;
            }
            match self.arena.get(&id) {
                Some(node) => {
                    components.push(node.name.clone());
                    cur = node.parent;
                }
                None => break,
            }
        }
        let mut path = root_path.to_path_buf();
        for name in components.iter().rev() {
            path.push(name);
        }
        path
    }

    /// descendant 是否在 ancestor 之下（含相等）
    pub fn is_below(&self, descendant: NodeDbId, ancestor: NodeDbId) -> bool {
        let mut cur = Some(descendant);
        while let Some(id) = cur {
            if id == ancestor {
                return true;
            }
            cur = self.arena.get(&id).and_then(|n| n.parent);
        }
        false
    }

    /// 设置节点状态并向上聚合；返回根到该节点链路上是否有变化
    pub fn set_tree_state(&mut self, dbid: NodeDbId, state: TreeState) -> bool {
        let mut changed = false;
        if let Some(n) = self.arena.get_mut(&dbid) {
            if n.tree_state != state {
                n.tree_state = state;
                changed = true;
            }
        }

        // 父链向上重算
        let mut cur = self.arena.get(&dbid).and_then(|n| n.parent);
        while let Some(id) = cur {
            let agg = self.aggregate_children_state(id);
            let node_changed = match self.arena.get_mut(&id) {
                Some(n) if n.tree_state != agg => {
                    n.tree_state = agg;
                    true
                }
                _ => false,
            };
            if !node_changed {
                break;
            }
            changed = true;
            cur = self.arena.get(&id).and_then(|n| n.parent);
        }
        changed
    }

    fn aggregate_children_state(&self, dbid: NodeDbId) -> TreeState {
        let Some(node) = self.arena.get(&dbid) else {
            return TreeState::None;
        };
        let mut agg = TreeState::Synced;
        for child in node.children.values() {
            match self.arena.get(child).map(|c| c.tree_state) {
                Some(TreeState::Syncing) => return TreeState::Syncing,
                Some(TreeState::Pending) => agg = TreeState::Pending,
                _ => {}
            }
        }
        agg
    }

    /// 标记节点待写入缓存（从删除队列摘除）
    pub fn statecache_add(&mut self, dbid: NodeDbId) {
        self.deleteq.remove(&dbid);
        self.insertq.insert(dbid);
    }

    /// 标记节点待从缓存删除（从插入队列摘除）
    pub fn statecache_del(&mut self, dbid: NodeDbId) {
        self.insertq.remove(&dbid);
        self.deleteq.insert(dbid);
    }

    /// 取走两个队列（每轮结束时在一个事务里冲刷）
    pub fn take_queues(&mut self) -> (Vec<NodeDbId>, Vec<NodeDbId>) {
        let mut inserts: Vec<NodeDbId> = self.insertq.drain().collect();
        let mut deletes: Vec<NodeDbId> = self.deleteq.drain().collect();
        inserts.sort_unstable();
        deletes.sort_unstable();
        (inserts, deletes)
    }

    pub fn queues_empty(&self) -> bool {
        self.insertq.is_empty() && self.deleteq.is_empty()
    }

    /// 缓存重建用：按既有 dbid 放回节点并接好父子映射
    pub(crate) fn insert_restored(&mut self, node: SyncNode) {
        let dbid = node.dbid;
        if dbid >= self.next_dbid {
            self.next_dbid = dbid + 1;
        }
        if let Some(parent) = node.parent {
            let key = self.fold(&node.name);
            if let Some(p) = self.arena.get_mut(&parent) {
                p.children.insert(key, dbid);
            }
            if let Some(short) = &node.short_name {
                let key = self.fold(short);
                if let Some(p) = self.arena.get_mut(&parent) {
                    p.children_short.insert(key, dbid);
                }
            }
        }
        if let Some(fsid) = node.fsid {
            self.fsid_index.insert(fsid, dbid);
        }
        if let Some(handle) = node.cloud_handle {
            self.cloud_index.insert(handle, dbid);
        }
        self.arena.insert(dbid, node);
    }

    /// 重建后用根可达性丢弃孤儿；返回丢掉的个数
    pub(crate) fn discard_orphans(&mut self) -> usize {
        let mut reachable = HashSet::new();
        let mut stack = vec![ROOT_DBID];
        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(node) = self.arena.get(&id) {
                stack.extend(node.children.values().copied());
            }
        }

        let orphan_ids: Vec<NodeDbId> = self
            .arena
            .keys()
            .filter(|id| !reachable.contains(id))
            .copied()
            .collect();
        for id in &orphan_ids {
            if let Some(node) = self.arena.remove(id) {
                if let Some(fsid) = node.fsid {
                    self.fsid_index.remove(&fsid);
                }
                if let Some(handle) = node.cloud_handle {
                    self.cloud_index.remove(&handle);
                }
                // 缓存里也要清掉
                self.statecache_del(*id);
            }
        }
        orphan_ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_lookup_child() {
        let mut tree = SyncTree::new(true);
        let a = tree.add_child(tree.root(), NodeType::Folder, "Docs").unwrap();
        let b = tree.add_child(a, NodeType::File, "Note.TXT").unwrap();

        // 大小写不敏感查找
        assert_eq!(tree.child_by_name(a, "note.txt"), Some(b));
        assert_eq!(tree.child_by_name(tree.root(), "docs"), Some(a));
        assert_eq!(tree.child_by_name(tree.root(), "nothing"), None);
    }

    #[test]
    fn test_rename_updates_parent_map() {
        let mut tree = SyncTree::new(false);
        let a = tree.add_child(tree.root(), NodeType::File, "old").unwrap();
        tree.rename(a, "new");

        assert_eq!(tree.child_by_name(tree.root(), "new"), Some(a));
        assert_eq!(tree.child_by_name(tree.root(), "old"), None);
        assert_eq!(tree.get(a).unwrap().name, "new");
    }

    #[test]
    fn test_move_node() {
        let mut tree = SyncTree::new(false);
        let a = tree.add_child(tree.root(), NodeType::Folder, "a").unwrap();
        let z = tree.add_child(tree.root(), NodeType::Folder, "z").unwrap();
        let f = tree.add_child(a, NodeType::File, "b.txt").unwrap();

        tree.move_node(f, z, "b.txt");

        assert_eq!(tree.child_by_name(a, "b.txt"), None);
        assert_eq!(tree.child_by_name(z, "b.txt"), Some(f));
        assert!(tree.is_below(f, z));
        assert!(!tree.is_below(f, a));
    }

    #[test]
    fn test_fsid_index_unique() {
        let mut tree = SyncTree::new(false);
        let a = tree.add_child(tree.root(), NodeType::File, "a").unwrap();
        let b = tree.add_child(tree.root(), NodeType::File, "b").unwrap();

        tree.set_fsid(a, Some(42));
        assert_eq!(tree.node_by_fsid(42), Some(a));

        // inode 复用：新主接管，旧主清空
        tree.set_fsid(b, Some(42));
        assert_eq!(tree.node_by_fsid(42), Some(b));
        assert_eq!(tree.get(a).unwrap().fsid, None);
    }

    #[test]
    fn test_pairing_back_link() {
        let mut tree = SyncTree::new(false);
        let a = tree.add_child(tree.root(), NodeType::File, "a").unwrap();
        let h = NodeHandle(7);

        tree.pair(a, h);
        assert_eq!(tree.node_by_handle(h), Some(a));
        assert_eq!(tree.get(a).unwrap().cloud_handle, Some(h));

        tree.unpair(a);
        assert_eq!(tree.node_by_handle(h), None);
    }

    #[test]
    fn test_remove_subtree_cleans_indexes() {
        let mut tree = SyncTree::new(false);
        let a = tree.add_child(tree.root(), NodeType::Folder, "a").unwrap();
        let f = tree.add_child(a, NodeType::File, "f").unwrap();
        tree.set_fsid(f, Some(9));
        tree.pair(f, NodeHandle(3));

        tree.remove_subtree(a);

        assert!(tree.get(a).is_none());
        assert!(tree.get(f).is_none());
        assert_eq!(tree.node_by_fsid(9), None);
        assert_eq!(tree.node_by_handle(NodeHandle(3)), None);
    }

    #[test]
    fn test_path_of() {
        let mut tree = SyncTree::new(false);
        let a = tree.add_child(tree.root(), NodeType::Folder, "a").unwrap();
        let b = tree.add_child(a, NodeType::File, "b.txt").unwrap();

        let path = tree.path_of(b, Path::new("/root/sync"));
        assert_eq!(path, PathBuf::from("/root/sync/a/b.txt"));
    }

    #[test]
    fn test_queues_drain_once() {
        let mut tree = SyncTree::new(false);
        let a = tree.add_child(tree.root(), NodeType::File, "a").unwrap();
        tree.statecache_del(a);
        // 删除把插入顶掉
        let (inserts, deletes) = tree.take_queues();
        assert!(!inserts.contains(&a));
        assert!(deletes.contains(&a));
        assert!(tree.queues_empty());
    }

    #[test]
    fn test_tree_state_propagation() {
        let mut tree = SyncTree::new(false);
        let a = tree.add_child(tree.root(), NodeType::Folder, "a").unwrap();
        let f = tree.add_child(a, NodeType::File, "f").unwrap();

        tree.set_tree_state(f, TreeState::Syncing);
        assert_eq!(tree.get(a).unwrap().tree_state, TreeState::Syncing);

        tree.set_tree_state(f, TreeState::Synced);
        assert_eq!(tree.get(a).unwrap().tree_state, TreeState::Synced);
    }

    #[test]
    fn test_discard_orphans() {
        let mut tree = SyncTree::new(false);
        let a = tree.add_child(tree.root(), NodeType::Folder, "a").unwrap();

        // 手工放回一个父不存在的节点
        let mut orphan = SyncNode::new(99, NodeType::File, "ghost".into());
        orphan.parent = Some(77);
        tree.insert_restored(orphan);

        let dropped = tree.discard_orphans();
        assert_eq!(dropped, 1);
        assert!(tree.get(99).is_none());
        assert!(tree.get(a).is_some());
    }
}
