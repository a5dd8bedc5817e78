//! 同步节点状态缓存
//!
//! 每个同步一个 SQLite 文件。每轮产生的插入/删除队列在
//! 轮末的同一个事务里冲刷；启动时读出全部行按 parent_dbid
//! 连接重建内存树，孤儿行丢弃。

pub mod models;

pub use models::NodeRecord;

use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::core::node::{NodeDbId, SyncTree, ROOT_DBID};

/// 状态缓存
pub struct SyncNodeCache {
    pool: SqlitePool,
}

impl SyncNodeCache {
    /// 打开（或创建）缓存文件
    pub async fn open(path: &Path) -> Result<SyncNodeCache> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // SQLite 连接字符串里的 Windows 反斜杠要换成正斜杠
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("缓存路径不是合法 UTF-8: {:?}", path))?
            .replace('\\', "/");

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&format!("sqlite:{}?mode=rwc", path_str))
            .await?;

        Self::init_schema(&pool).await?;
        Ok(SyncNodeCache { pool })
    }

    /// 内存缓存（测试用）
    pub async fn open_in_memory() -> Result<SyncNodeCache> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::init_schema(&pool).await?;
        Ok(SyncNodeCache { pool })
    }

    async fn init_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS sync_nodes (
                dbid INTEGER PRIMARY KEY,
                parent_dbid INTEGER NOT NULL,
                payload BLOB NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// 读出全部记录（解码失败的行当作损坏丢弃）
    pub async fn read_all(&self) -> Result<Vec<NodeRecord>> {
        let rows = sqlx::query("SELECT dbid, parent_dbid, payload FROM sync_nodes")
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let dbid: i64 = row.get("dbid");
            let parent_dbid: i64 = row.get("parent_dbid");
            let payload: Vec<u8> = row.get("payload");
            match NodeRecord::decode(dbid as NodeDbId, parent_dbid as NodeDbId, &payload) {
                Some(rec) => records.push(rec),
                None => warn!("缓存记录损坏，丢弃 dbid={}", dbid),
            }
        }
        Ok(records)
    }

    /// 在一个事务里冲刷两个队列
    pub async fn flush(&self, inserts: &[NodeRecord], deletes: &[NodeDbId]) -> Result<()> {
        if inserts.is_empty() && deletes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for dbid in deletes {
            sqlx::query("DELETE FROM sync_nodes WHERE dbid = ?")
                .bind(*dbid as i64)
                .execute(&mut *tx)
                .await?;
        }

        for rec in inserts {
            sqlx::query(
                r#"INSERT INTO sync_nodes (dbid, parent_dbid, payload)
                   VALUES (?, ?, ?)
                   ON CONFLICT(dbid) DO UPDATE SET
                       parent_dbid = excluded.parent_dbid,
                       payload = excluded.payload"#,
            )
            .bind(rec.dbid as i64)
            .bind(rec.parent_dbid as i64)
            .bind(rec.encode())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("缓存冲刷完成: {} 插入, {} 删除", inserts.len(), deletes.len());
        Ok(())
    }

    /// 清空缓存（移除同步时用）
    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM sync_nodes")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// 从缓存重建同步节点树
///
/// 返回 (树, 丢弃的孤儿行数)。缓存只是重建提示：恢复出的节点
/// 全部带 needs_rescan，第一轮会重新核对两侧。
pub async fn load_tree(
    cache: &SyncNodeCache,
    case_insensitive: bool,
) -> Result<(SyncTree, usize)> {
    let records = cache.read_all().await?;
    let mut tree = SyncTree::new(case_insensitive);

    let mut by_parent: HashMap<NodeDbId, Vec<NodeRecord>> = HashMap::new();
    let mut root_record = None;
    for rec in records {
        if rec.dbid == ROOT_DBID {
            root_record = Some(rec);
        } else {
            by_parent.entry(rec.parent_dbid).or_default().push(rec);
        }
    }

    // 根行只恢复配对句柄（名字恒为空，路径由配置给出）
    if let Some(rec) = root_record {
        if let Some(handle) = rec.cloud_handle {
            tree.pair(ROOT_DBID, handle);
        }
    }

    // 广度优先挂接，保证父先于子
    let mut queue = vec![ROOT_DBID];
    let mut restored = 0usize;
    while let Some(parent) = queue.pop() {
        let Some(children) = by_parent.remove(&parent) else {
            continue;
        };
        for rec in children {
            let dbid = rec.dbid;
            tree.insert_restored(rec.into_node());
            restored += 1;
            queue.push(dbid);
        }
    }

    // 挂不上的行是孤儿：从缓存里删掉
    let mut orphans = 0usize;
    for (_, leftovers) in by_parent {
        for rec in leftovers {
            tree.statecache_del(rec.dbid);
            orphans += 1;
        }
    }

    if restored > 0 || orphans > 0 {
        info!("缓存重建完成: {} 节点, {} 孤儿", restored, orphans);
    }
    Ok((tree, orphans))
}
