//! synccore - 双向文件树同步引擎核心
//!
//! 给定 (本地根, 云端根) 一对，持续检测两侧变化并用最小的
//! 云端/本地操作集让两侧一致；容忍重启、半途失败与并发编辑。
//! 云端 RPC、传输引擎、平台监视器与应用界面都是外部协作方，
//! 通过 `cloud` 模块里的接口接入。

pub mod cloud;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod fs;
pub mod logging;
pub mod syncset;

pub use cloud::{
    AppCallbacks, CloudClient, CloudEvent, CloudNode, CloudTree, NodeHandle, TransferEngine,
    TransferEvent,
};
pub use config::store::ConfigStore;
pub use config::{BackupState, SyncConfig, SyncType};
pub use crate::core::{PassOutcome, Sync, SyncDeps, SyncState, TreeState, Waiter};
pub use db::SyncNodeCache;
pub use error::{SyncError, SyncWarning};
pub use fs::{FsCapability, FsFamily, LocalFs};
pub use syncset::SyncSet;
