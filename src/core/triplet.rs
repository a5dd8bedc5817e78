//! 三元组构建与相等判定
//!
//! 一轮对账把目标目录按名字分组成 `(云端?, 同步节点?, 文件系统?)`
//! 三元组。分组用所在文件系统家族的大小写折叠；同一折叠名出现
//! 多个云端或本地子项即为名字冲突，挂在三元组上并阻止解析。

use std::collections::BTreeMap;

use crate::cloud::{CloudNode, NodeHandle};
use crate::core::fingerprint::Fingerprint;
use crate::core::node::{NodeDbId, SyncNode, SyncTree};
use crate::fs::names::{fold_name, names_equal, normalize_nfc, unescape_fs_incompatible};
use crate::fs::{FsFamily, FsNode, NodeType};

/// 本地名的规范形式：还原转义后做 NFC 归一化（与云端名同一口径）
pub fn canon_local(name: &str, family: FsFamily) -> String {
    normalize_nfc(&unescape_fs_incompatible(name, family))
}

/// 一个待解析的三元组
#[derive(Debug, Default)]
pub struct SyncRow {
    pub cloud: Option<NodeHandle>,
    pub sync: Option<NodeDbId>,
    pub fs: Option<FsNode>,
    /// 同折叠名的多余云端子项
    pub cloud_clashes: Vec<NodeHandle>,
    /// 同折叠名的多余本地子项
    pub fs_clashes: Vec<FsNode>,
}

impl SyncRow {
    pub fn has_clash(&self) -> bool {
        !self.cloud_clashes.is_empty() || !self.fs_clashes.is_empty()
    }

    /// 日志 / 冲突记录用的代表名
    pub fn display_name(&self, tree: &SyncTree) -> String {
        if let Some(fs) = &self.fs {
            return fs.name.clone();
        }
        if let Some(dbid) = self.sync {
            if let Some(node) = tree.get(dbid) {
                return node.name.clone();
            }
        }
        String::new()
    }
}

/// 按折叠名分组三侧的子项
///
/// 云端名先做 NFC 归一化再折叠（本地名在扫描时已是平台形式）。
/// 返回顺序是折叠名的字典序，保证逐轮平局裁决可复现。
pub fn compute_triplets(
    tree: &SyncTree,
    parent: NodeDbId,
    cloud_children: &[&CloudNode],
    fs_nodes: &[FsNode],
    family: FsFamily,
) -> Vec<SyncRow> {
    let ci = family.case_insensitive();
    let mut rows: BTreeMap<String, SyncRow> = BTreeMap::new();

    for cloud in cloud_children {
        let key = fold_name(&normalize_nfc(&cloud.name), ci);
        let row = rows.entry(key).or_default();
        if row.cloud.is_none() {
            row.cloud = Some(cloud.handle);
        } else {
            row.cloud_clashes.push(cloud.handle);
        }
    }

    for dbid in tree.children_of(parent) {
        let Some(node) = tree.get(dbid) else {
            continue;
        };
        let key = fold_name(&canon_local(&node.name, family), ci);
        // 同步节点的名字在父内折叠唯一（树的不变式），不会冲突
        rows.entry(key).or_default().sync = Some(dbid);
    }

    for fs in fs_nodes {
        let key = fold_name(&canon_local(&fs.name, family), ci);
        let row = rows.entry(key).or_default();
        if row.fs.is_none() {
            row.fs = Some(fs.clone());
        } else {
            row.fs_clashes.push(fs.clone());
        }
    }

    rows.into_values().collect()
}

/// 云端 ⇔ 本地快照：指纹相等且归一化名相等
///
/// 快照记录只携带 (size, mtime)；调用方读过文件内容时传入完整
/// 指纹 `fs_crc`，否则退化为 size/mtime 比较。
pub fn cloud_eq_fs(
    cloud: &CloudNode,
    fs: &FsNode,
    fs_crc: Option<&Fingerprint>,
    family: FsFamily,
) -> bool {
    let case_insensitive = family.case_insensitive();
    let name_ok = names_equal(
        &canon_local(&fs.name, family),
        &normalize_nfc(&cloud.name),
        case_insensitive,
    );
    if !name_ok {
        return false;
    }

    match fs.node_type {
        NodeType::Folder => cloud.node_type.is_container(),
        NodeType::File => {
            if cloud.node_type.is_container() {
                return false;
            }
            match (&cloud.fingerprint, fs_crc) {
                (Some(cf), Some(ff)) => cf.equals_tolerant(ff),
                (Some(cf), None) => {
                    cf.size == fs.size && (cf.mtime - fs.mtime).abs() <= 1
                }
                _ => false,
            }
        }
    }
}

/// 云端 ⇔ 同步节点：配对句柄相等且当前名相等
pub fn cloud_eq_sync(cloud: &CloudNode, node: &SyncNode, family: FsFamily) -> bool {
    node.cloud_handle == Some(cloud.handle)
        && names_equal(
            &canon_local(&node.name, family),
            &normalize_nfc(&cloud.name),
            family.case_insensitive(),
        )
}

/// 本地快照 ⇔ 同步节点：有稳定 ID 比 ID，否则比 (size, mtime, name)
pub fn fs_eq_sync(fs: &FsNode, node: &SyncNode, case_insensitive: bool) -> bool {
    if let (Some(a), Some(b)) = (fs.fsid, node.fsid) {
        return a == b;
    }
    if !names_equal(&fs.name, &node.name, case_insensitive) {
        return false;
    }
    match node.fingerprint {
        Some(fp) => fp.size == fs.size && (fp.mtime - fs.mtime).abs() <= 1,
        None => fs.node_type == NodeType::Folder,
    }
}

/// 本地内容相对同步节点的最近已知状态是否变化
pub fn fs_changed_since(fs: &FsNode, node: &SyncNode) -> bool {
    match (fs.node_type, node.fingerprint) {
        (NodeType::Folder, _) => false,
        (NodeType::File, Some(fp)) => fp.size != fs.size || (fp.mtime - fs.mtime).abs() > 1,
        (NodeType::File, None) => true,
    }
}

/// 云端内容相对同步节点的最近已知状态是否变化
pub fn cloud_changed_since(cloud: &CloudNode, node: &SyncNode) -> bool {
    if cloud.node_type.is_container() {
        return false;
    }
    match (cloud.fingerprint, node.fingerprint) {
        (Some(cf), Some(nf)) => !cf.equals_tolerant(&nf),
        (None, None) => false,
        _ => true,
    }
}
