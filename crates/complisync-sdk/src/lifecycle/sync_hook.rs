//! 同步模块生命周期 Hook
//!
//! App 回到前台时补一次回放，切到后台前刷新待同步数量。

use crate::error::Result;
use crate::lifecycle::LifecycleHook;
use crate::sync::{SyncController, SyncTrigger};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct SyncLifecycleHook {
    controller: Arc<SyncController>,
}

impl SyncLifecycleHook {
    pub fn new(controller: Arc<SyncController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl LifecycleHook for SyncLifecycleHook {
    fn name(&self) -> &str {
        "sync"
    }

    async fn on_background(&self) -> Result<()> {
        let pending = self.controller.refresh_pending_count().await;
        info!("[Sync Hook] App 切换到后台，待同步 {} 条", pending);
        Ok(())
    }

    /// 后台期间可能错过了网络恢复事件，这里主动补一次
    async fn on_foreground(&self) -> Result<()> {
        match self.controller.request_sync(SyncTrigger::Foreground).await {
            Some(summary) => info!(
                "[Sync Hook] 前台回放完成: synced={}, failed={}",
                summary.synced, summary.failed
            ),
            None => info!("[Sync Hook] 离线或回放进行中，跳过前台回放"),
        }
        Ok(())
    }
}
