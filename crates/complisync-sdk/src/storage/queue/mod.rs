use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, SyncSDKError};
use crate::remote::{ApplyRequest, RemoteApply};
use crate::storage::local_store::LocalStore;
use crate::utils::Clock;

pub mod mutation;
pub mod retry_policy;

pub use mutation::{MutationOperation, QueuedMutation};
pub use retry_policy::{ApplyFailure, RetryPolicy};

/// 一轮回放的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub synced: usize,
    pub failed: usize,
}

impl SyncSummary {
    pub fn attempted(&self) -> usize {
        self.synced + self.failed
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// 入队结果
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// 已持久化进待同步日志
    Queued(QueuedMutation),
    /// 本地存储不可用，变更没有被记录
    NotPersisted { request: ApplyRequest, reason: String },
}

/// 队列统计信息
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub pending: usize,
    pub total_attempts: u64,
    pub oldest_enqueued_at: Option<i64>,
    pub by_table: HashMap<String, usize>,
}

/// 回放统计（进程内，重启清零）
#[derive(Debug, Clone, Default)]
pub struct ReplayMetrics {
    pub passes_total: u64,
    pub apply_attempt_total: u64,
    pub apply_success_total: u64,
    pub apply_failure_total: u64,
    pub joined_passes_total: u64,
}

impl ReplayMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.apply_attempt_total == 0 {
            0.0
        } else {
            self.apply_success_total as f64 / self.apply_attempt_total as f64
        }
    }
}

pub type SyncListener = Arc<dyn Fn(&SyncSummary) + Send + Sync>;

#[derive(Default)]
struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(u64, SyncListener)>>,
}

impl ListenerRegistry {
    fn notify(&self, summary: &SyncSummary) {
        // 复制一份再调用，回调里可以安全地取消订阅
        let listeners: Vec<SyncListener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(summary))).is_err() {
                error!("sync-complete listener panicked");
            }
        }
    }
}

/// `on_sync_complete` 返回的订阅句柄
pub struct SyncListenerHandle {
    id: u64,
    registry: Weak<ListenerRegistry>,
}

impl SyncListenerHandle {
    /// 取消订阅，返回监听器是否仍处于注册状态
    pub fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => {
                let mut listeners = registry.listeners.write();
                let before = listeners.len();
                listeners.retain(|(id, _)| *id != self.id);
                listeners.len() != before
            }
            None => false,
        }
    }
}

type SharedPass = Shared<BoxFuture<'static, Result<SyncSummary>>>;

/// 回放任务用到的共享状态
#[derive(Clone)]
struct PassContext {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteApply>,
    apply_timeout: Duration,
    listeners: Arc<ListenerRegistry>,
    metrics: Arc<RwLock<ReplayMetrics>>,
}

impl PassContext {
    async fn apply_with_timeout(
        &self,
        request: &ApplyRequest,
    ) -> std::result::Result<(), ApplyFailure> {
        match timeout(self.apply_timeout, self.remote.apply(request)).await {
            Ok(result) => result,
            Err(_) => Err(ApplyFailure::Timeout),
        }
    }

    async fn run_pass(&self) -> SyncSummary {
        let mutations = self.store.load_mutations().await;
        let mut summary = SyncSummary::default();

        if mutations.is_empty() {
            debug!("No pending mutations to replay");
            self.metrics.write().passes_total += 1;
            return summary;
        }

        info!("Replaying {} pending mutations", mutations.len());

        for mut mutation in mutations {
            let request = ApplyRequest::from(&mutation);
            let outcome = self.apply_with_timeout(&request).await;

            match outcome {
                Ok(()) => {
                    summary.synced += 1;
                    debug!(
                        "Applied mutation {} ({} {})",
                        mutation.id(),
                        mutation.operation(),
                        mutation.table()
                    );
                    if let Err(e) = self.store.remove_mutation(&mutation).await {
                        // 远端已成功，本地删除失败：下一轮会再提交一次
                        error!(
                            "Applied mutation {} but failed to remove it from the log: {}",
                            mutation.id(),
                            e
                        );
                    }
                }
                Err(failure) => {
                    summary.failed += 1;
                    mutation.record_attempt();
                    if failure.is_retryable() {
                        warn!(
                            "Mutation {} on {} failed (attempt {}): {}",
                            mutation.id(),
                            mutation.table(),
                            mutation.attempts(),
                            failure
                        );
                    } else {
                        error!(
                            "Mutation {} on {} failed (attempt {}), retry is unlikely to help: {}",
                            mutation.id(),
                            mutation.table(),
                            mutation.attempts(),
                            failure
                        );
                    }
                    if let Err(e) = self.store.save_mutation(&mutation).await {
                        warn!("Failed to persist attempts for {}: {}", mutation.id(), e);
                    }
                }
            }
        }

        {
            let mut m = self.metrics.write();
            m.passes_total += 1;
            m.apply_attempt_total += summary.attempted() as u64;
            m.apply_success_total += summary.synced as u64;
            m.apply_failure_total += summary.failed as u64;
        }

        info!(
            "Replay pass finished: synced={}, failed={}",
            summary.synced, summary.failed
        );
        summary
    }
}

/// 回放任务结束（包括 panic）时清空在途标记
struct InFlightReset(Arc<Mutex<Option<SharedPass>>>);

impl Drop for InFlightReset {
    fn drop(&mut self) {
        self.0.lock().take();
    }
}

/// 同步队列
///
/// 负责待同步日志的生命周期：入队、按序回放、逐条记账，并在每轮结束后通知监听器。
/// 同一时间最多只有一轮回放；重叠的调用会加入正在进行的那一轮并拿到同一个结果。
pub struct SyncQueue {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteApply>,
    clock: Arc<dyn Clock>,
    apply_timeout: Duration,
    listeners: Arc<ListenerRegistry>,
    metrics: Arc<RwLock<ReplayMetrics>>,
    in_flight: Arc<Mutex<Option<SharedPass>>>,
}

impl std::fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncQueue")
            .field("apply_timeout", &self.apply_timeout)
            .field("in_flight", &self.is_replaying())
            .finish()
    }
}

impl SyncQueue {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteApply>,
        clock: Arc<dyn Clock>,
        apply_timeout: Duration,
    ) -> Self {
        Self {
            store,
            remote,
            clock,
            apply_timeout,
            listeners: Arc::new(ListenerRegistry::default()),
            metrics: Arc::new(RwLock::new(ReplayMetrics::default())),
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    fn pass_context(&self) -> PassContext {
        PassContext {
            store: self.store.clone(),
            remote: self.remote.clone(),
            apply_timeout: self.apply_timeout,
            listeners: self.listeners.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// 校验并追加一条变更
    ///
    /// 参数非法（表名为空、载荷为 null、远端校验不通过）时返回错误；
    /// 本地存储不可用时返回 [`EnqueueOutcome::NotPersisted`]，由调用方决定如何降级。
    /// 本方法不会触发网络回放。
    #[instrument(skip(self, data))]
    pub async fn queue_mutation(
        &self,
        table: &str,
        operation: MutationOperation,
        data: serde_json::Value,
    ) -> Result<EnqueueOutcome> {
        mutation::validate_table(table)?;
        if data.is_null() {
            return Err(SyncSDKError::InvalidArgument(format!(
                "{} {} 的载荷不能为 null",
                operation, table
            )));
        }

        let request = ApplyRequest::new(table, operation, data);
        self.remote.validate(&request)?;

        let enqueued_at = self.clock.now_millis();
        match self
            .store
            .append_mutation(table, operation, request.payload.clone(), enqueued_at)
            .await
        {
            Ok(mutation) => {
                debug!("Queued mutation {} ({} {})", mutation.id(), operation, table);
                Ok(EnqueueOutcome::Queued(mutation))
            }
            Err(e) => {
                warn!("Mutation {} {} not persisted: {}", operation, table, e);
                Ok(EnqueueOutcome::NotPersisted {
                    request,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// 绕过日志直接提交（降级模式使用）
    pub async fn apply_live(&self, request: &ApplyRequest) -> std::result::Result<(), ApplyFailure> {
        self.pass_context().apply_with_timeout(request).await
    }

    /// 当前待同步数量，直接由日志计算
    pub async fn pending_count(&self) -> usize {
        self.store.pending_mutation_count().await
    }

    /// 按回放顺序列出待同步变更
    pub async fn pending_mutations(&self) -> Vec<QueuedMutation> {
        self.store.load_mutations().await
    }

    pub async fn stats(&self) -> QueueStats {
        let mutations = self.store.load_mutations().await;
        let mut stats = QueueStats {
            pending: mutations.len(),
            ..QueueStats::default()
        };
        for m in &mutations {
            stats.total_attempts += m.attempts() as u64;
            *stats.by_table.entry(m.table().to_string()).or_insert(0) += 1;
            stats.oldest_enqueued_at = Some(match stats.oldest_enqueued_at {
                Some(oldest) => oldest.min(m.enqueued_at()),
                None => m.enqueued_at(),
            });
        }
        stats
    }

    pub fn metrics(&self) -> ReplayMetrics {
        self.metrics.read().clone()
    }

    /// 是否有回放正在进行
    pub fn is_replaying(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// 执行一轮回放
    ///
    /// 回放在独立的任务上运行，调用方的 future 被丢弃也不会中断它。
    /// 只有回放任务本身异常退出（远端实现 panic）时才返回错误。
    pub async fn sync_pending_mutations(&self) -> Result<SyncSummary> {
        let pass = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(pass) => {
                    debug!("Replay pass already in flight, joining it");
                    self.metrics.write().joined_passes_total += 1;
                    pass.clone()
                }
                None => {
                    let ctx = self.pass_context();
                    let reset = InFlightReset(self.in_flight.clone());
                    let handle = tokio::spawn(async move {
                        let _reset = reset;
                        let summary = ctx.run_pass().await;
                        ctx.listeners.notify(&summary);
                        summary
                    });
                    let pass: SharedPass = async move {
                        handle
                            .await
                            .map_err(|e| SyncSDKError::Runtime(format!("replay pass aborted: {}", e)))
                    }
                    .boxed()
                    .shared();
                    *slot = Some(pass.clone());
                    pass
                }
            }
        };
        pass.await
    }

    /// 注册回放完成监听器，每轮回放结束后都会收到 `{synced, failed}`
    pub fn on_sync_complete<F>(&self, listener: F) -> SyncListenerHandle
    where
        F: Fn(&SyncSummary) + Send + Sync + 'static,
    {
        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.listeners.write().push((id, Arc::new(listener)));
        SyncListenerHandle {
            id,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.listeners.read().len()
    }
}
