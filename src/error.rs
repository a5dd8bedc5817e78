//! 同步错误与警告代码
//!
//! 这些是携带在配置与状态迁移里的领域代码，不是 Rust 错误类型；
//! 内部失败传播统一走 anyhow。

use serde::{Deserialize, Serialize};

/// 同步错误代码（出现错误即停用该同步）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncError {
    NoSyncError,
    /// 目标路径之下已有启用的同步
    ActiveSyncBelowPath,
    /// 目标路径之上已有启用的同步
    ActiveSyncAbovePath,
    RemoteNodeNotFound,
    InitialScanFailed,
    /// 本地根目录指纹变化（例如可移动盘被换掉）
    LocalFingerprintMismatch,
    LocalFilesystemMismatch,
    /// 备份的云端子树被外部修改
    BackupModified,
    ForeignTargetOverstorage,
    UnsupportedFileSystem,
    StorageOverquota,
    BackupSourceNotBelowDrive,
    /// 写状态缓存失败（本次会话内致命）
    FailedWritingCache,
    /// 瞬时错误，下一轮重访
    TransientError,
}

impl SyncError {
    /// 稳定整数代码，用于配置文件的 "et" 字段
    pub fn code(self) -> u32 {
        match self {
            SyncError::NoSyncError => 0,
            SyncError::ActiveSyncBelowPath => 1,
            SyncError::ActiveSyncAbovePath => 2,
            SyncError::RemoteNodeNotFound => 3,
            SyncError::InitialScanFailed => 4,
            SyncError::LocalFingerprintMismatch => 5,
            SyncError::LocalFilesystemMismatch => 6,
            SyncError::BackupModified => 7,
            SyncError::ForeignTargetOverstorage => 8,
            SyncError::UnsupportedFileSystem => 9,
            SyncError::StorageOverquota => 10,
            SyncError::BackupSourceNotBelowDrive => 11,
            SyncError::FailedWritingCache => 12,
            SyncError::TransientError => 13,
        }
    }

    pub fn from_code(code: u32) -> SyncError {
        match code {
            1 => SyncError::ActiveSyncBelowPath,
            2 => SyncError::ActiveSyncAbovePath,
            3 => SyncError::RemoteNodeNotFound,
            4 => SyncError::InitialScanFailed,
            5 => SyncError::LocalFingerprintMismatch,
            6 => SyncError::LocalFilesystemMismatch,
            7 => SyncError::BackupModified,
            8 => SyncError::ForeignTargetOverstorage,
            9 => SyncError::UnsupportedFileSystem,
            10 => SyncError::StorageOverquota,
            11 => SyncError::BackupSourceNotBelowDrive,
            12 => SyncError::FailedWritingCache,
            13 => SyncError::TransientError,
            _ => SyncError::NoSyncError,
        }
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncError::NoSyncError => "no error",
            SyncError::ActiveSyncBelowPath => "active sync below path",
            SyncError::ActiveSyncAbovePath => "active sync above path",
            SyncError::RemoteNodeNotFound => "remote node not found",
            SyncError::InitialScanFailed => "initial scan failed",
            SyncError::LocalFingerprintMismatch => "local fingerprint mismatch",
            SyncError::LocalFilesystemMismatch => "local filesystem mismatch",
            SyncError::BackupModified => "backup modified externally",
            SyncError::ForeignTargetOverstorage => "foreign target over storage",
            SyncError::UnsupportedFileSystem => "unsupported file system",
            SyncError::StorageOverquota => "storage over quota",
            SyncError::BackupSourceNotBelowDrive => "backup source not below drive",
            SyncError::FailedWritingCache => "failed writing state cache",
            SyncError::TransientError => "transient error",
        };
        write!(f, "{}", s)
    }
}

impl Default for SyncError {
    fn default() -> Self {
        SyncError::NoSyncError
    }
}

/// 同步警告（仅提示，不停用同步）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncWarning {
    NoSyncWarning,
    /// FAT 系文件系统没有稳定文件 ID
    LocalIsFat,
    /// HGFS（虚拟机共享目录）没有稳定文件 ID
    LocalIsHgfs,
}

impl SyncWarning {
    /// 稳定整数代码，用于配置文件的 "wt" 字段
    pub fn code(self) -> u32 {
        match self {
            SyncWarning::NoSyncWarning => 0,
            SyncWarning::LocalIsFat => 1,
            SyncWarning::LocalIsHgfs => 2,
        }
    }

    pub fn from_code(code: u32) -> SyncWarning {
        match code {
            1 => SyncWarning::LocalIsFat,
            2 => SyncWarning::LocalIsHgfs,
            _ => SyncWarning::NoSyncWarning,
        }
    }
}

impl Default for SyncWarning {
    fn default() -> Self {
        SyncWarning::NoSyncWarning
    }
}
