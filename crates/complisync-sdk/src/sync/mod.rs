/// 同步控制模块
///
/// 职责：
/// - 决定什么时候回放待同步日志（重连、周期轮询、手动触发、外部唤醒）
/// - 对展示层暴露 `is_online / pending_count / is_syncing / last_sync_time`
pub mod controller;

pub use controller::{
    ControllerConfig, MutationOutcome, SyncController, SyncTrigger, WakeMessage, WakeSender,
};

/// 默认的同步完成时间键
pub const DEFAULT_SYNC_KEY: &str = "default";

/// 控制器状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SyncPhase {
    /// 空闲
    Idle,
    /// 正在回放
    Syncing,
}

/// 展示层绑定的同步状态快照
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub pending_count: usize,
    pub phase: SyncPhase,
    /// 最近一次有变更成功同步的时间（UTC 毫秒）
    pub last_sync_time: Option<i64>,
}

impl SyncStatus {
    pub fn is_syncing(&self) -> bool {
        self.phase == SyncPhase::Syncing
    }

    /// 是否需要显示待同步角标
    pub fn has_pending(&self) -> bool {
        self.pending_count > 0
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            is_online: false,
            pending_count: 0,
            phase: SyncPhase::Idle,
            last_sync_time: None,
        }
    }
}
