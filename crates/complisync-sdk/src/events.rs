//! 事件系统模块 - 向展示层推送同步相关事件
//!
//! 功能包括：
//! - 网络状态变更
//! - 变更入队、待同步数量变化
//! - 回放开始/完成/失败（UI 角标与提示条的数据来源）
//! - 事件广播和订阅机制

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info};

use crate::network::NetworkStatus;
use crate::storage::queue::{MutationOperation, SyncSummary};

/// SDK 事件类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 网络状态变更
    ConnectivityChanged {
        old_status: NetworkStatus,
        new_status: NetworkStatus,
        timestamp: i64,
    },
    /// 变更已写入待同步日志
    MutationQueued {
        mutation_id: String,
        table: String,
        operation: MutationOperation,
        timestamp: i64,
    },
    /// 变更未能持久化（降级模式）
    MutationNotPersisted {
        table: String,
        operation: MutationOperation,
        applied_live: bool,
        reason: String,
        timestamp: i64,
    },
    /// 待同步数量变化
    PendingCountChanged {
        pending_count: usize,
        timestamp: i64,
    },
    /// 回放开始
    SyncStarted { timestamp: i64 },
    /// 回放完成
    SyncCompleted {
        summary: SyncSummary,
        timestamp: i64,
    },
    /// 回放任务异常，需要提示用户（短暂提示）
    SyncFailed { error: String, timestamp: i64 },
}

impl SyncEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::ConnectivityChanged { .. } => "connectivity_changed",
            SyncEvent::MutationQueued { .. } => "mutation_queued",
            SyncEvent::MutationNotPersisted { .. } => "mutation_not_persisted",
            SyncEvent::PendingCountChanged { .. } => "pending_count_changed",
            SyncEvent::SyncStarted { .. } => "sync_started",
            SyncEvent::SyncCompleted { .. } => "sync_completed",
            SyncEvent::SyncFailed { .. } => "sync_failed",
        }
    }

    /// 获取事件时间戳（毫秒）
    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::ConnectivityChanged { timestamp, .. }
            | SyncEvent::MutationQueued { timestamp, .. }
            | SyncEvent::MutationNotPersisted { timestamp, .. }
            | SyncEvent::PendingCountChanged { timestamp, .. }
            | SyncEvent::SyncStarted { timestamp }
            | SyncEvent::SyncCompleted { timestamp, .. }
            | SyncEvent::SyncFailed { timestamp, .. } => *timestamp,
        }
    }

    /// 面向用户的提示文案（回放完成/失败时），其余事件返回 None
    pub fn user_message(&self) -> Option<String> {
        match self {
            SyncEvent::SyncCompleted { summary, .. } if summary.failed > 0 => Some(format!(
                "{} changes failed to sync, will retry",
                summary.failed
            )),
            SyncEvent::SyncCompleted { summary, .. } if summary.synced > 0 => {
                Some(format!("{} changes synced", summary.synced))
            }
            SyncEvent::SyncFailed { error, .. } => Some(format!("Sync failed: {}", error)),
            _ => None,
        }
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 监听器数量
    pub listener_count: usize,
    /// 最后事件时间
    pub last_event_time: Option<i64>,
}

/// 事件管理器
pub struct EventManager {
    /// 广播发送器
    sender: broadcast::Sender<SyncEvent>,
    /// 事件监听器映射，`*` 表示监听全部事件
    listeners: Arc<RwLock<HashMap<String, Vec<EventListener>>>>,
    /// 事件统计
    stats: Arc<RwLock<EventStats>>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventManager {
    /// 创建新的事件管理器
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));

        Self {
            sender,
            listeners: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 会失败，属正常场景（无 UI 的宿主）
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read().await;
        let matching = listeners
            .get(event.event_type())
            .into_iter()
            .chain(listeners.get("*"))
            .flatten();
        for listener in matching {
            // 宿主回调 panic 不能带走调用方所在的后台任务
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!("Event listener panicked on {}", event.event_type());
            }
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 添加事件监听器
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(event_type.to_string())
            .or_insert_with(Vec::new)
            .push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    /// 移除所有监听器
    pub async fn clear_listeners(&self) {
        let mut listeners = self.listeners.write().await;
        listeners.clear();

        let mut stats = self.stats.write().await;
        stats.listener_count = 0;

        info!("Cleared all event listeners");
    }

    /// 获取事件统计
    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_emit_reaches_subscribers_and_listeners() {
        let manager = EventManager::new(16);
        let mut rx = manager.subscribe();

        let completed = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));
        let c = completed.clone();
        manager
            .add_listener("sync_completed", move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        let a = all.clone();
        manager
            .add_listener("*", move |_| {
                a.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        manager.emit(SyncEvent::SyncStarted { timestamp: 1 }).await;
        manager
            .emit(SyncEvent::SyncCompleted {
                summary: SyncSummary { synced: 1, failed: 0 },
                timestamp: 2,
            })
            .await;

        assert_eq!(rx.recv().await.unwrap().event_type(), "sync_started");
        assert_eq!(rx.recv().await.unwrap().event_type(), "sync_completed");
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);

        let stats = manager.get_stats().await;
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.listener_count, 2);
        assert_eq!(stats.last_event_time, Some(2));

        manager.clear_listeners().await;
        assert_eq!(manager.get_stats().await.listener_count, 0);
    }

    #[tokio::test]
    async fn test_panicking_listener_is_isolated() {
        let manager = EventManager::new(16);
        let calls = Arc::new(AtomicUsize::new(0));

        manager
            .add_listener("sync_started", |_| panic!("ui callback blew up"))
            .await;
        let c = calls.clone();
        manager
            .add_listener("*", move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        manager.emit(SyncEvent::SyncStarted { timestamp: 1 }).await;
        manager.emit(SyncEvent::SyncStarted { timestamp: 2 }).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.get_stats().await.total_events, 2);
    }

    #[test]
    fn test_user_messages() {
        let failed = SyncEvent::SyncCompleted {
            summary: SyncSummary { synced: 1, failed: 2 },
            timestamp: 0,
        };
        assert_eq!(
            failed.user_message().as_deref(),
            Some("2 changes failed to sync, will retry")
        );

        let ok = SyncEvent::SyncCompleted {
            summary: SyncSummary { synced: 3, failed: 0 },
            timestamp: 0,
        };
        assert_eq!(ok.user_message().as_deref(), Some("3 changes synced"));

        let empty = SyncEvent::SyncCompleted {
            summary: SyncSummary::default(),
            timestamp: 0,
        };
        assert!(empty.user_message().is_none());
        assert!(SyncEvent::SyncStarted { timestamp: 0 }.user_message().is_none());
    }
}
