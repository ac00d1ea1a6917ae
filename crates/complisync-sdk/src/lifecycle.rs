//! SDK 生命周期管理
//!
//! 管理 App 前后台切换等一级生命周期事件，统一触发各模块的状态切换。

use crate::error::{Result, SyncSDKError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// App 前后台切换
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppPhase {
    Background,
    Foreground,
}

/// 生命周期回调 Hook
///
/// 回放、缓存等模块实现此 trait，在前后台切换时做补偿动作
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// 出现在日志和聚合错误里的名字
    fn name(&self) -> &str;

    /// App 切换到后台时调用
    async fn on_background(&self) -> Result<()>;

    /// App 切换到前台时调用
    async fn on_foreground(&self) -> Result<()>;
}

/// 生命周期管理器
pub struct LifecycleManager {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    pub fn register_hook(&mut self, hook: Arc<dyn LifecycleHook>) {
        info!("生命周期 Hook `{}` 已注册", hook.name());
        self.hooks.push(hook);
    }

    pub async fn notify_background(&self) -> Result<()> {
        self.notify(AppPhase::Background).await
    }

    pub async fn notify_foreground(&self) -> Result<()> {
        self.notify(AppPhase::Foreground).await
    }

    /// 依次调用全部 Hook，失败不会中断后续 Hook
    ///
    /// 只有一个 Hook 失败时原样返回它的错误；多个失败时合并成一个
    /// [`SyncSDKError::Runtime`]，逐条列出 Hook 名和原因。
    pub async fn notify(&self, phase: AppPhase) -> Result<()> {
        debug!("App 切换到 {:?}，通知 {} 个 Hook", phase, self.hooks.len());

        let mut failures: Vec<(&str, SyncSDKError)> = Vec::new();
        for hook in &self.hooks {
            let result = match phase {
                AppPhase::Background => hook.on_background().await,
                AppPhase::Foreground => hook.on_foreground().await,
            };
            if let Err(e) = result {
                warn!("Hook `{}` 处理 {:?} 失败: {}", hook.name(), phase, e);
                failures.push((hook.name(), e));
            }
        }

        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0).1),
            n => {
                let detail = failures
                    .iter()
                    .map(|(name, e)| format!("{}: {}", name, e))
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(SyncSDKError::Runtime(format!(
                    "{} 个 Hook 处理 {:?} 失败 ({})",
                    n, phase, detail
                )))
            }
        }
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

// 同步模块 Hook（SDK 内部自动注册）
mod sync_hook;
pub use sync_hook::SyncLifecycleHook;
