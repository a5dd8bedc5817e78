//! 单个同步的生命周期状态机

use serde::Serialize;
use tracing::info;

use crate::cloud::AppCallbacks;
use crate::config::SyncConfig;
use crate::error::SyncError;

/// 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// 初扫中（首轮完整遍历）
    InitialScan,
    Active,
    Paused,
    /// 本会话内不再运行；配置保留，可恢复
    Disabled,
    Failed,
}

impl SyncState {
    /// 终态释放运行资源（根节点、debris 锁），配置留在盘上
    pub fn is_terminal(self) -> bool {
        matches!(self, SyncState::Disabled | SyncState::Failed)
    }

    pub fn name(self) -> &'static str {
        match self {
            SyncState::InitialScan => "initialscan",
            SyncState::Active => "active",
            SyncState::Paused => "paused",
            SyncState::Disabled => "disabled",
            SyncState::Failed => "failed",
        }
    }
}

/// 状态机：迁移携带 (error, enabled)，只在组合相对上次通知
/// 发生变化时回调应用，振荡期间不产生重复回调。
pub struct SyncStateMachine {
    state: SyncState,
}

impl SyncStateMachine {
    pub fn new() -> SyncStateMachine {
        SyncStateMachine {
            state: SyncState::InitialScan,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// 执行迁移；返回是否触发了应用回调
    pub fn change_state(
        &mut self,
        new_state: SyncState,
        config: &mut SyncConfig,
        error: SyncError,
        enabled: bool,
        app: &dyn AppCallbacks,
        notify_app: bool,
    ) -> bool {
        if self.state != new_state {
            info!(
                "同步状态迁移: {} -> {} (error={}, enabled={})",
                self.state.name(),
                new_state.name(),
                error,
                enabled
            );
            self.state = new_state;
        }

        config.error = error;
        config.enabled = enabled;

        if notify_app && config.error_or_enabled_changed() {
            app.syncupdate_stateconfig(config);
            return true;
        }
        false
    }
}

impl Default for SyncStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
