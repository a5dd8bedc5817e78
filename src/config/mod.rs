//! 同步配置
//!
//! 每条配置对应一个（可能未运行的）同步。配置以短键 JSON 形式
//! 持久化到认证加密的槽文件里（见 store 模块）：整数写成十进制
//! 字符串，句柄写成大端十六进制，路径按平台字节 base64 包装。

pub mod store;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cloud::NodeHandle;
use crate::error::{SyncError, SyncWarning};

/// 同步方向类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    /// 本地到云端单向
    Up,
    /// 云端到本地单向
    Down,
    /// 双向
    TwoWay,
    /// 备份：单向上行，云端被外部改动即自动停用
    Backup,
}

impl SyncType {
    pub fn code(self) -> u32 {
        match self {
            SyncType::Up => 1,
            SyncType::Down => 2,
            SyncType::TwoWay => 3,
            SyncType::Backup => 4,
        }
    }

    pub fn from_code(code: u32) -> SyncType {
        match code {
            1 => SyncType::Up,
            2 => SyncType::Down,
            4 => SyncType::Backup,
            _ => SyncType::TwoWay,
        }
    }

    /// 是否把本地变化推上云端
    pub fn syncs_up(self) -> bool {
        matches!(self, SyncType::Up | SyncType::TwoWay | SyncType::Backup)
    }

    /// 是否把云端变化拉到本地
    pub fn syncs_down(self) -> bool {
        matches!(self, SyncType::Down | SyncType::TwoWay)
    }
}

/// 备份所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupState {
    /// 非备份同步
    None,
    /// 镜像期：本地是权威，云端差异被覆盖
    Mirror,
    /// 监视期：只跟随本地增量
    Monitor,
}

impl BackupState {
    pub fn code(self) -> u32 {
        match self {
            BackupState::None => 0,
            BackupState::Mirror => 1,
            BackupState::Monitor => 2,
        }
    }

    pub fn from_code(code: u32) -> BackupState {
        match code {
            1 => BackupState::Mirror,
            2 => BackupState::Monitor,
            _ => BackupState::None,
        }
    }
}

/// 一条同步配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 8 字节备份 id，也是同步的稳定标识
    pub backup_id: u64,
    /// 本地根目录
    pub local_path: PathBuf,
    /// 展示名
    pub name: String,
    /// 云端根句柄
    pub remote_handle: NodeHandle,
    /// 最近一次已知的云端路径（仅参考）
    pub remote_path: String,
    /// 本地根目录指纹，检测根被整体替换
    pub local_fingerprint: u64,
    /// 排除通配符
    pub exclusions: Vec<String>,
    pub sync_type: SyncType,
    pub error: SyncError,
    pub warning: SyncWarning,
    pub backup_state: BackupState,
    pub enabled: bool,
    /// 外置盘路径（便携备份；不序列化，由所在数据库推断）
    pub external_drive_path: Option<PathBuf>,

    // 应用最近被告知的 (error, enabled)；变化才重新通知
    known_error: SyncError,
    known_enabled: bool,
}

impl SyncConfig {
    pub fn new(
        local_path: PathBuf,
        name: String,
        remote_handle: NodeHandle,
        remote_path: String,
        sync_type: SyncType,
    ) -> SyncConfig {
        SyncConfig {
            backup_id: rand::random(),
            local_path,
            name,
            remote_handle,
            remote_path,
            local_fingerprint: 0,
            exclusions: Vec::new(),
            sync_type,
            error: SyncError::NoSyncError,
            warning: SyncWarning::NoSyncWarning,
            backup_state: if sync_type == SyncType::Backup {
                BackupState::Mirror
            } else {
                BackupState::None
            },
            enabled: true,
            external_drive_path: None,
            known_error: SyncError::NoSyncError,
            known_enabled: false,
        }
    }

    pub fn is_backup(&self) -> bool {
        self.sync_type == SyncType::Backup
    }

    pub fn is_external(&self) -> bool {
        self.external_drive_path.is_some()
    }

    /// (error, enabled) 相对上次通知是否变化；变化则记住新值
    pub fn error_or_enabled_changed(&mut self) -> bool {
        if self.known_error != self.error || self.known_enabled != self.enabled {
            self.known_error = self.error;
            self.known_enabled = self.enabled;
            true
        } else {
            false
        }
    }

    /// 相对根的路径是否命中排除通配符
    pub fn is_excluded(&self, rel_path: &str) -> bool {
        self.exclusions
            .iter()
            .any(|pattern| matches_pattern(rel_path, pattern))
    }
}

/// 简单通配符匹配（`**` 跨层，`*` 单层），大小写不敏感
fn matches_pattern(path: &str, pattern: &str) -> bool {
    let path = path.to_lowercase();
    let pattern = pattern.to_lowercase();

    if pattern.contains("**") {
        let parts: Vec<&str> = pattern.split("**").collect();
        if parts.len() == 2 {
            let prefix = parts[0].trim_end_matches('/');
            let suffix = parts[1].trim_start_matches('/');

            if prefix.is_empty() && suffix.is_empty() {
                return true;
            }
            if !prefix.is_empty() {
                // 前缀必须落在路径分层边界上（".git" 不许命中 ".github/…"）
                let at_boundary =
                    path == prefix || path.starts_with(&format!("{}/", prefix));
                if !at_boundary {
                    return false;
                }
            }
            if !suffix.is_empty() && !path.ends_with(suffix) {
                return false;
            }
            return true;
        }
    }

    if pattern.contains('*') {
        let leaf_re = regex::Regex::new(&format!(
            "^{}$",
            pattern.replace('.', "\\.").replace('*', "[^/]*")
        ));
        if let Ok(re) = leaf_re {
            if re.is_match(&path) {
                return true;
            }
            // 纯文件名模式也匹配任意一层下的文件名
            if !pattern.contains('/') {
                if let Some(leaf) = path.rsplit('/').next() {
                    return re.is_match(leaf);
                }
            }
        }
        return false;
    }

    path == pattern || path.ends_with(&format!("/{}", pattern))
}

/// 相等比较忽略两个影子字段
impl PartialEq for SyncConfig {
    fn eq(&self, other: &Self) -> bool {
        self.backup_id == other.backup_id
            && self.local_path == other.local_path
            && self.name == other.name
            && self.remote_handle == other.remote_handle
            && self.remote_path == other.remote_path
            && self.local_fingerprint == other.local_fingerprint
            && self.exclusions == other.exclusions
            && self.sync_type == other.sync_type
            && self.error == other.error
            && self.warning == other.warning
            && self.backup_state == other.backup_state
            && self.enabled == other.enabled
            && self.external_drive_path == other.external_drive_path
    }
}

impl Eq for SyncConfig {}

fn path_to_base64(path: &Path) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        BASE64.encode(path.as_os_str().as_bytes())
    }
    #[cfg(not(unix))]
    {
        BASE64.encode(path.to_string_lossy().as_bytes())
    }
}

fn path_from_base64(s: &str) -> Result<PathBuf> {
    let bytes = BASE64.decode(s)?;
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        Ok(PathBuf::from(std::ffi::OsStr::from_bytes(&bytes)))
    }
    #[cfg(not(unix))]
    {
        Ok(PathBuf::from(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

/// 槽文件里的单条配置（短键形式）
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ConfigJson {
    id: String,
    lp: String,
    sn: String,
    rh: String,
    rp: String,
    lf: String,
    re: Vec<String>,
    et: String,
    wt: String,
    sy: String,
    bs: String,
    ed: String,
}

impl From<&SyncConfig> for ConfigJson {
    fn from(config: &SyncConfig) -> ConfigJson {
        ConfigJson {
            id: format!("{:016x}", config.backup_id),
            lp: path_to_base64(&config.local_path),
            sn: config.name.clone(),
            rh: config.remote_handle.to_hex(),
            rp: config.remote_path.clone(),
            lf: config.local_fingerprint.to_string(),
            re: config.exclusions.clone(),
            et: config.error.code().to_string(),
            wt: config.warning.code().to_string(),
            sy: config.sync_type.code().to_string(),
            bs: config.backup_state.code().to_string(),
            ed: if config.enabled { "1" } else { "0" }.to_string(),
        }
    }
}

impl TryFrom<ConfigJson> for SyncConfig {
    type Error = anyhow::Error;

    fn try_from(json: ConfigJson) -> Result<SyncConfig> {
        let backup_id = u64::from_str_radix(&json.id, 16)?;
        let remote_handle = NodeHandle::from_hex(&json.rh)
            .ok_or_else(|| anyhow::anyhow!("非法的远端句柄: {}", json.rh))?;

        Ok(SyncConfig {
            backup_id,
            local_path: path_from_base64(&json.lp)?,
            name: json.sn,
            remote_path: json.rp,
            remote_handle,
            local_fingerprint: json.lf.parse()?,
            exclusions: json.re,
            sync_type: SyncType::from_code(json.sy.parse()?),
            error: SyncError::from_code(json.et.parse()?),
            warning: SyncWarning::from_code(json.wt.parse()?),
            backup_state: BackupState::from_code(json.bs.parse()?),
            enabled: json.ed == "1",
            external_drive_path: None,
            known_error: SyncError::NoSyncError,
            known_enabled: false,
        })
    }
}
