//! 同步节点的缓存记录编解码
//!
//! 定长字段在前，末尾是扩展标志字节，向前兼容地追加新字段。

use crate::cloud::NodeHandle;
use crate::core::fingerprint::{Fingerprint, FINGERPRINT_BYTES};
use crate::core::node::{NodeDbId, SyncNode, TreeState};
use crate::fs::NodeType;

/// 一行缓存记录（dbid 和 parent_dbid 单独成列，便于重建时连接）
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub dbid: NodeDbId,
    pub parent_dbid: NodeDbId,
    pub node_type: NodeType,
    pub name: String,
    pub fingerprint: Option<Fingerprint>,
    pub fsid: Option<u64>,
    pub cloud_handle: Option<NodeHandle>,
    pub created_on_disk: bool,
    pub short_name: Option<String>,
}

const FLAG_FINGERPRINT: u8 = 1 << 0;
const FLAG_FSID: u8 = 1 << 1;
const FLAG_HANDLE: u8 = 1 << 2;
const FLAG_CREATED: u8 = 1 << 3;

/// 扩展标志位 0：短名存在
const EXP_SHORT_NAME: u8 = 1 << 0;

impl NodeRecord {
    pub fn from_node(node: &SyncNode) -> NodeRecord {
        NodeRecord {
            dbid: node.dbid,
            parent_dbid: node.parent.unwrap_or(0),
            node_type: node.node_type,
            name: node.name.clone(),
            fingerprint: node.fingerprint,
            fsid: node.fsid,
            cloud_handle: node.cloud_handle,
            created_on_disk: node.created_on_disk,
            short_name: node.short_name.clone(),
        }
    }

    /// 还原成内存节点；缓存只是重建提示，子树一律标记待重扫
    pub fn into_node(self) -> SyncNode {
        let mut node = SyncNode::new(self.dbid, self.node_type, self.name);
        node.parent = if self.parent_dbid == 0 {
            None
        } else {
            Some(self.parent_dbid)
        };
        node.fingerprint = self.fingerprint;
        node.fsid = self.fsid;
        node.cloud_handle = self.cloud_handle;
        node.created_on_disk = self.created_on_disk;
        node.short_name = self.short_name;
        node.needs_rescan = true;
        node.tree_state = TreeState::Pending;
        node
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.name.len());

        out.push(match self.node_type {
            NodeType::File => 0u8,
            NodeType::Folder => 1u8,
        });

        let mut flags = 0u8;
        if self.fingerprint.is_some() {
            flags |= FLAG_FINGERPRINT;
        }
        if self.fsid.is_some() {
            flags |= FLAG_FSID;
        }
        if self.cloud_handle.is_some() {
            flags |= FLAG_HANDLE;
        }
        if self.created_on_disk {
            flags |= FLAG_CREATED;
        }
        out.push(flags);

        out.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());

        if let Some(fp) = &self.fingerprint {
            out.extend_from_slice(&fp.to_bytes());
        }
        if let Some(fsid) = self.fsid {
            out.extend_from_slice(&fsid.to_le_bytes());
        }
        if let Some(handle) = self.cloud_handle {
            out.extend_from_slice(&handle.0.to_le_bytes());
        }

        // 扩展区：1 个标志字节 + 按位追加的字段
        let mut exp = 0u8;
        if self.short_name.is_some() {
            exp |= EXP_SHORT_NAME;
        }
        out.push(1u8);
        out.push(exp);
        if let Some(short) = &self.short_name {
            out.extend_from_slice(&(short.len() as u16).to_le_bytes());
            out.extend_from_slice(short.as_bytes());
        }

        out
    }

    pub fn decode(dbid: NodeDbId, parent_dbid: NodeDbId, data: &[u8]) -> Option<NodeRecord> {
        fn take<'a>(data: &'a [u8], pos: &mut usize, n: usize) -> Option<&'a [u8]> {
            if *pos + n > data.len() {
                return None;
            }
            let slice = &data[*pos..*pos + n];
            *pos += n;
            Some(slice)
        }

        let mut pos = 0usize;

        let node_type = match take(data, &mut pos, 1)?[0] {
            0 => NodeType::File,
            1 => NodeType::Folder,
            _ => return None,
        };
        let flags = take(data, &mut pos, 1)?[0];

        let name_len = u16::from_le_bytes(take(data, &mut pos, 2)?.try_into().ok()?) as usize;
        let name = String::from_utf8(take(data, &mut pos, name_len)?.to_vec()).ok()?;

        let fingerprint = if flags & FLAG_FINGERPRINT != 0 {
            Some(Fingerprint::from_cache_bytes(take(data, &mut pos, FINGERPRINT_BYTES)?)?)
        } else {
            None
        };
        let fsid = if flags & FLAG_FSID != 0 {
            Some(u64::from_le_bytes(take(data, &mut pos, 8)?.try_into().ok()?))
        } else {
            None
        };
        let cloud_handle = if flags & FLAG_HANDLE != 0 {
            Some(NodeHandle(u64::from_le_bytes(
                take(data, &mut pos, 8)?.try_into().ok()?,
            )))
        } else {
            None
        };

        // 扩展区可以整体缺失（更老版本写的记录）
        let mut short_name = None;
        if pos < data.len() {
            let exp_count = take(data, &mut pos, 1)?[0] as usize;
            let exp_flags = take(data, &mut pos, exp_count.max(1))?;
            if exp_flags[0] & EXP_SHORT_NAME != 0 {
                let len = u16::from_le_bytes(take(data, &mut pos, 2)?.try_into().ok()?) as usize;
                short_name = Some(String::from_utf8(take(data, &mut pos, len)?.to_vec()).ok()?);
            }
        }

        Some(NodeRecord {
            dbid,
            parent_dbid,
            node_type,
            name,
            fingerprint,
            fsid,
            cloud_handle,
            created_on_disk: flags & FLAG_CREATED != 0,
            short_name,
        })
    }
}
