//! 移动/改名检测
//!
//! 在套用解析规则表之前先认移动，否则一次移动会被看成
//! 删除加新建，变成多余的重传。本地侧用稳定文件 ID 匹配，
//! 云端侧优先句柄匹配、退化为指纹匹配。

use tracing::debug;

use crate::cloud::{CloudNode, CloudTree, NodeHandle};
use crate::core::node::{NodeDbId, SyncTree};
use crate::fs::names::names_equal;
use crate::fs::FsNode;

/// 认定的本地移动
#[derive(Debug, Clone, Copy)]
pub struct LocalMove {
    /// 移动源（树里别处的同步节点）
    pub source: NodeDbId,
    /// 源配对的云端句柄（让云端做等价移动）
    pub paired: NodeHandle,
}

/// 本地移动检测：新出现的本地子项，其稳定 ID 命中树里别处的节点
pub fn detect_local_move(
    tree: &SyncTree,
    parent: NodeDbId,
    fs: &FsNode,
) -> Option<LocalMove> {
    let fsid = fs.fsid?;
    let source = tree.node_by_fsid(fsid)?;
    let node = tree.get(source)?;

    if node.node_type != fs.node_type {
        return None;
    }
    // 已经在本目录且同名：不是移动
    if node.parent == Some(parent)
        && names_equal(&node.name, &fs.name, tree.case_insensitive())
    {
        return None;
    }
    // 没配对的节点移动与否无关紧要，按新建处理
    let paired = node.cloud_handle?;

    debug!(
        "本地移动检测命中: fsid={} 源节点 {} -> 父 {}",
        fsid, source, parent
    );
    Some(LocalMove { source, paired })
}

/// 云端移动检测
///
/// 新出现的云端子项：句柄已配对到树里别处 ⇒ 确定是移动。
/// 否则按内容指纹在"云端对应已消失"的配对节点里找候选；
/// 多候选时先取父未变的，再取名字相等的，仍然多就放弃
/// （宁可重传，不可错挪）。
pub fn detect_cloud_move(
    tree: &SyncTree,
    cloud_tree: &CloudTree,
    cloud: &CloudNode,
    parent: NodeDbId,
) -> Option<NodeDbId> {
    // 句柄直接命中
    if let Some(dbid) = tree.node_by_handle(cloud.handle) {
        let node = tree.get(dbid)?;
        let same_place = node.parent == Some(parent)
            && names_equal(&node.name, &cloud.name, tree.case_insensitive());
        if !same_place {
            debug!("云端移动检测命中(句柄): {} -> 父 {}", cloud.handle, parent);
            return Some(dbid);
        }
        return None;
    }

    // 指纹退化匹配
    let fingerprint = cloud.fingerprint?;
    let mut candidates: Vec<NodeDbId> = tree
        .iter()
        .filter(|n| {
            n.node_type == crate::fs::NodeType::File
                && n.fingerprint
                    .map(|fp| fp.equals_tolerant(&fingerprint))
                    .unwrap_or(false)
                && n.cloud_handle
                    .map(|h| !cloud_tree.contains(h))
                    .unwrap_or(false)
        })
        .map(|n| n.dbid)
        .collect();
    candidates.sort_unstable();

    if candidates.len() > 1 {
        // 先留下父未变的候选（纯改名：候选父的配对句柄就是新子项的父）
        let parent_unchanged: Vec<NodeDbId> = candidates
            .iter()
            .copied()
            .filter(|dbid| {
                tree.get(*dbid)
                    .and_then(|n| n.parent)
                    .and_then(|p| tree.get(p))
                    .and_then(|p| p.cloud_handle)
                    == cloud.parent
            })
            .collect();
        if !parent_unchanged.is_empty() {
            candidates = parent_unchanged;
        }
    }
    if candidates.len() > 1 {
        let name_equal: Vec<NodeDbId> = candidates
            .iter()
            .copied()
            .filter(|dbid| {
                tree.get(*dbid)
                    .map(|n| names_equal(&n.name, &cloud.name, tree.case_insensitive()))
                    .unwrap_or(false)
            })
            .collect();
        if !name_equal.is_empty() {
            candidates = name_equal;
        }
    }

    match candidates.as_slice() {
        [one] => {
            debug!("云端移动检测命中(指纹): {} -> 父 {}", cloud.handle, parent);
            Some(*one)
        }
        [] => None,
        _ => {
            // 歧义：放弃检测
            debug!("云端移动检测歧义，放弃: {}", cloud.handle);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::CloudNodeType;
    use crate::core::fingerprint::Fingerprint;
    use crate::fs::NodeType;

    fn fs_file(name: &str, fsid: u64) -> FsNode {
        FsNode {
            name: name.to_string(),
            short_name: None,
            node_type: NodeType::File,
            size: 1,
            mtime: 0,
            fsid: Some(fsid),
        }
    }

    fn cloud_file(handle: u64, parent: u64, name: &str, data: &[u8]) -> CloudNode {
        CloudNode {
            handle: NodeHandle(handle),
            parent: Some(NodeHandle(parent)),
            name: name.to_string(),
            node_type: CloudNodeType::File,
            fingerprint: Some(Fingerprint::from_bytes(data, 0)),
            mtime: 0,
            size: data.len() as u64,
            owner: None,
        }
    }

    #[test]
    fn test_local_move_by_fsid() {
        let mut tree = SyncTree::new(false);
        let a = tree.add_child(tree.root(), NodeType::Folder, "a").unwrap();
        let z = tree.add_child(tree.root(), NodeType::Folder, "z").unwrap();
        let f = tree.add_child(a, NodeType::File, "b.txt").unwrap();
        tree.set_fsid(f, Some(42));
        tree.pair(f, NodeHandle(100));

        // b.txt 出现在 z 下，fsid 相同 → 是移动
        let hit = detect_local_move(&tree, z, &fs_file("b.txt", 42)).unwrap();
        assert_eq!(hit.source, f);
        assert_eq!(hit.paired, NodeHandle(100));

        // 原地同名不算移动
        assert!(detect_local_move(&tree, a, &fs_file("b.txt", 42)).is_none());

        // 同目录改名也是移动
        let renamed = detect_local_move(&tree, a, &fs_file("c.txt", 42)).unwrap();
        assert_eq!(renamed.source, f);
    }

    #[test]
    fn test_local_move_requires_pairing() {
        let mut tree = SyncTree::new(false);
        let z = tree.add_child(tree.root(), NodeType::Folder, "z").unwrap();
        let f = tree.add_child(tree.root(), NodeType::File, "x").unwrap();
        tree.set_fsid(f, Some(7));

        assert!(detect_local_move(&tree, z, &fs_file("x", 7)).is_none());
    }

    #[test]
    fn test_cloud_move_by_handle() {
        let mut tree = SyncTree::new(false);
        let a = tree.add_child(tree.root(), NodeType::Folder, "a").unwrap();
        let z = tree.add_child(tree.root(), NodeType::Folder, "z").unwrap();
        let f = tree.add_child(a, NodeType::File, "b.txt").unwrap();
        tree.pair(f, NodeHandle(100));
        tree.pair(z, NodeHandle(20));

        let cloud_tree = CloudTree::new();
        let moved = cloud_file(100, 20, "b.txt", b"x");

        // 句柄配对在别处 → 移动源就是那个节点
        assert_eq!(
            detect_cloud_move(&tree, &cloud_tree, &moved, z),
            Some(f)
        );
        // 原地不算
        assert_eq!(detect_cloud_move(&tree, &cloud_tree, &moved, a), None);
    }

    #[test]
    fn test_cloud_move_by_fingerprint_with_tie_breaks() {
        let mut tree = SyncTree::new(false);
        let a = tree.add_child(tree.root(), NodeType::Folder, "a").unwrap();
        tree.pair(a, NodeHandle(10));

        // 两个内容相同的旧节点，云端对应都已消失
        let f1 = tree.add_child(a, NodeType::File, "same.txt").unwrap();
        let f2 = tree.add_child(tree.root(), NodeType::File, "other.txt").unwrap();
        let fp = Fingerprint::from_bytes(b"dup", 0);
        for (dbid, handle) in [(f1, 101u64), (f2, 102u64)] {
            tree.get_mut(dbid).unwrap().fingerprint = Some(fp);
            tree.pair(dbid, NodeHandle(handle));
        }

        let cloud_tree = CloudTree::new(); // 101/102 都不在 → 都是候选

        // 新云端子项挂在 a 配对的句柄之下且与 f1 同名 → 父未变裁决选 f1
        let fresh = cloud_file(200, 10, "same.txt", b"dup");
        assert_eq!(detect_cloud_move(&tree, &cloud_tree, &fresh, a), Some(f1));

        // 两个候选父都不匹配、名字也都不匹配 → 放弃
        let ambiguous = cloud_file(201, 99, "new.txt", b"dup");
        assert_eq!(detect_cloud_move(&tree, &cloud_tree, &ambiguous, a), None);
    }

    #[test]
    fn test_cloud_move_skips_live_pairings() {
        let mut tree = SyncTree::new(false);
        let f = tree.add_child(tree.root(), NodeType::File, "f").unwrap();
        let fp = Fingerprint::from_bytes(b"data", 0);
        tree.get_mut(f).unwrap().fingerprint = Some(fp);
        tree.pair(f, NodeHandle(50));

        // 云端对应还在 → 不是移动候选
        let mut cloud_tree = CloudTree::new();
        cloud_tree.insert(cloud_file(50, 1, "f", b"data"));

        let fresh = cloud_file(60, 1, "f2", b"data");
        assert_eq!(detect_cloud_move(&tree, &cloud_tree, &fresh, tree.root()), None);
    }
}
