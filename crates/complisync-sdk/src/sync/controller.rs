use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use super::{SyncPhase, SyncStatus, DEFAULT_SYNC_KEY};
use crate::error::{Result, SyncSDKError};
use crate::events::{EventManager, SyncEvent};
use crate::network::{NetworkMonitor, NetworkStatusEvent};
use crate::storage::local_store::LocalStore;
use crate::storage::queue::{
    EnqueueOutcome, MutationOperation, QueuedMutation, RetryPolicy, SyncQueue, SyncSummary,
};
use crate::utils::Clock;

/// 控制器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// 轮询间隔：刷新待同步数量，在线时按需自动回放
    pub poll_interval: Duration,
    /// 在线且有待同步变更时是否由轮询自动回放
    pub auto_retry: bool,
    /// 自动回放的退避策略
    pub retry_policy: RetryPolicy,
    /// 同步完成时间的存储键
    pub sync_key: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            auto_retry: true,
            retry_policy: RetryPolicy::default(),
            sync_key: DEFAULT_SYNC_KEY.to_string(),
        }
    }
}

/// 回放触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// UI 手动触发
    Manual,
    /// 离线恢复在线
    Reconnect,
    /// 外部唤醒（后台 service worker 等）
    Wake,
    /// 周期轮询
    Poll,
    /// 在线时新变更入队
    Enqueue,
    /// App 回到前台
    Foreground,
}

/// 外部唤醒消息，JSON 形如 `{"type": "SYNC_REQUESTED"}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WakeMessage {
    SyncRequested,
}

impl WakeMessage {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| SyncSDKError::InvalidArgument(format!("无法识别的唤醒消息 {}: {}", raw, e)))
    }
}

/// 外部唤醒通道的发送端
#[derive(Debug, Clone)]
pub struct WakeSender {
    tx: mpsc::UnboundedSender<WakeMessage>,
}

impl WakeSender {
    /// 投递消息，控制器已销毁时返回 false
    pub fn send(&self, message: WakeMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn request_sync(&self) -> bool {
        self.send(WakeMessage::SyncRequested)
    }

    /// 解析并投递原始 JSON 消息
    pub fn deliver_json(&self, raw: &str) -> Result<bool> {
        Ok(self.send(WakeMessage::from_json(raw)?))
    }
}

/// 控制器层面的入队结果
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// 已写入待同步日志
    Queued(QueuedMutation),
    /// 本地存储不可用，已直接提交远端
    AppliedLive,
    /// 本地存储不可用且无法直接提交，变更没有被记录
    Dropped { reason: String },
}

#[derive(Debug, Default)]
struct RetryState {
    failed_passes: u32,
    next_retry_at: Option<i64>,
}

/// 回放结束（或 future 被丢弃）时回到 Idle
struct SyncingGuard<'a> {
    controller: &'a SyncController,
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.controller.status.write().phase = SyncPhase::Idle;
        self.controller.syncing.store(false, Ordering::SeqCst);
    }
}

/// 网络感知的同步控制器
///
/// 状态机只有 `Idle` 和 `Syncing` 两个状态；已在 `Syncing` 时收到的触发不会并发执行，
/// 而是合并为本轮结束后的一次补跑（轮询触发除外，它受退避控制）。
/// 控制器从不直接写待同步日志，只通过 [`SyncQueue`] 读取派生状态。
pub struct SyncController {
    me: Weak<SyncController>,
    queue: Arc<SyncQueue>,
    store: Arc<LocalStore>,
    network: Arc<NetworkMonitor>,
    events: Arc<EventManager>,
    clock: Arc<dyn Clock>,
    config: ControllerConfig,
    status: RwLock<SyncStatus>,
    syncing: AtomicBool,
    rerun: Mutex<Option<SyncTrigger>>,
    retry_state: Mutex<RetryState>,
    wake_tx: mpsc::UnboundedSender<WakeMessage>,
    wake_rx: Mutex<Option<mpsc::UnboundedReceiver<WakeMessage>>>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncController")
            .field("status", &*self.status.read())
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}

impl SyncController {
    pub fn new(
        queue: Arc<SyncQueue>,
        store: Arc<LocalStore>,
        network: Arc<NetworkMonitor>,
        events: Arc<EventManager>,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
    ) -> Arc<Self> {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            queue,
            store,
            network,
            events,
            clock,
            config,
            status: RwLock::new(SyncStatus::default()),
            syncing: AtomicBool::new(false),
            rerun: Mutex::new(None),
            retry_state: Mutex::new(RetryState::default()),
            wake_tx,
            wake_rx: Mutex::new(Some(wake_rx)),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// 启动网络监听、轮询和外部唤醒三个后台任务
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SyncSDKError::Runtime("Sync controller already running".to_string()));
        }

        // 先订阅再读取初始状态，避免漏掉中间的状态变化
        let network_events = self.network.subscribe();
        let is_online = self.network.is_online().await;
        let last_sync_time = self.store.get_last_sync_time(&self.config.sync_key).await;
        {
            let mut status = self.status.write();
            status.is_online = is_online;
            status.last_sync_time = last_sync_time;
        }
        self.refresh_pending_count().await;

        let mut handles = vec![
            self.spawn_network_loop(network_events),
            self.spawn_poll_loop(),
        ];
        if let Some(wake_rx) = self.wake_rx.lock().take() {
            handles.push(self.spawn_wake_loop(wake_rx));
        }
        self.tasks.lock().extend(handles);

        info!(
            "Sync controller started (online={}, poll every {:?})",
            is_online, self.config.poll_interval
        );

        // 上次退出时留下的变更，启动时已在线就不必等重连或轮询
        if is_online && self.pending_count() > 0 {
            info!("Starting online with pending mutations, replaying");
            self.spawn_sync(SyncTrigger::Reconnect);
        }
        Ok(())
    }

    /// 停止后台任务；正在进行的回放会在自己的任务里跑完
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        info!("Sync controller stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn spawn_network_loop(
        &self,
        mut network_events: broadcast::Receiver<NetworkStatusEvent>,
    ) -> JoinHandle<()> {
        let weak = self.me.clone();
        tokio::spawn(async move {
            loop {
                match network_events.recv().await {
                    Ok(event) => {
                        let Some(this) = weak.upgrade() else { break };
                        this.handle_network_event(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Missed {} network events, resyncing connectivity", n);
                        let Some(this) = weak.upgrade() else { break };
                        this.resync_connectivity().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("network loop exited");
        })
    }

    fn spawn_poll_loop(&self) -> JoinHandle<()> {
        let weak = self.me.clone();
        let period = self.config.poll_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // 第一次 tick 立即返回
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else { break };
                this.poll_once().await;
            }
            debug!("poll loop exited");
        })
    }

    fn spawn_wake_loop(&self, mut wake_rx: mpsc::UnboundedReceiver<WakeMessage>) -> JoinHandle<()> {
        let weak = self.me.clone();
        tokio::spawn(async move {
            while let Some(message) = wake_rx.recv().await {
                let Some(this) = weak.upgrade() else { break };
                match message {
                    WakeMessage::SyncRequested => {
                        debug!("External sync request received");
                        this.request_sync(SyncTrigger::Wake).await;
                    }
                }
            }
            debug!("wake loop exited");
        })
    }

    async fn handle_network_event(&self, event: NetworkStatusEvent) {
        self.status.write().is_online = event.new_status.is_online();
        self.events
            .emit(SyncEvent::ConnectivityChanged {
                old_status: event.old_status,
                new_status: event.new_status,
                timestamp: self.clock.now_millis(),
            })
            .await;

        if event.is_reconnect() {
            info!("Back online, replaying pending mutations");
            self.request_sync(SyncTrigger::Reconnect).await;
        }
    }

    /// 丢失网络事件后按当前状态校正；期间发生过离线到在线的变化时补一次重连回放
    async fn resync_connectivity(&self) {
        let online = self.network.is_online().await;
        let was_online = std::mem::replace(&mut self.status.write().is_online, online);
        if online && !was_online {
            info!("Back online after missed network events, replaying pending mutations");
            self.request_sync(SyncTrigger::Reconnect).await;
        }
    }

    /// 一次轮询：刷新待同步数量，需要时自动回放
    async fn poll_once(&self) {
        let pending = self.refresh_pending_count().await;
        let online = self.network.is_online().await;
        self.status.write().is_online = online;

        if self.config.auto_retry && online && pending > 0 && self.retry_due() {
            self.request_sync(SyncTrigger::Poll).await;
        }
    }

    /// 上一轮有失败时，退避时间是否已到
    fn retry_due(&self) -> bool {
        match self.retry_state.lock().next_retry_at {
            Some(at) => self.clock.now_millis() >= at,
            None => true,
        }
    }

    fn record_pass(&self, summary: Option<&SyncSummary>) {
        let now = self.clock.now_millis();
        let mut state = self.retry_state.lock();
        match summary {
            Some(s) if s.is_clean() => {
                state.failed_passes = 0;
                state.next_retry_at = None;
            }
            _ => {
                state.failed_passes = state.failed_passes.saturating_add(1);
                let at = self.config.retry_policy.next_retry_at(now, state.failed_passes);
                state.next_retry_at = Some(at);
                debug!(
                    "Pass #{} with failures, next automatic retry at {}",
                    state.failed_passes, at
                );
            }
        }
    }

    /// 手动触发一次回放
    ///
    /// 离线或已有回放进行中时返回 `None`。
    pub async fn trigger_sync(&self) -> Option<SyncSummary> {
        self.request_sync(SyncTrigger::Manual).await
    }

    /// 按指定来源触发回放
    pub async fn request_sync(&self, trigger: SyncTrigger) -> Option<SyncSummary> {
        if !self.network.is_online().await {
            debug!("Ignoring {:?} sync trigger while offline", trigger);
            return None;
        }
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            if trigger != SyncTrigger::Poll {
                debug!("{:?} sync trigger arrived mid-pass, scheduling a follow-up", trigger);
                self.rerun.lock().get_or_insert(trigger);
            }
            return None;
        }

        let outcome = {
            let _guard = SyncingGuard { controller: self };
            self.status.write().phase = SyncPhase::Syncing;
            info!("Sync triggered by {:?}", trigger);
            self.events
                .emit(SyncEvent::SyncStarted {
                    timestamp: self.clock.now_millis(),
                })
                .await;

            let result = self.queue.sync_pending_mutations().await;
            match &result {
                Ok(summary) => {
                    if summary.synced > 0 {
                        let now = self.clock.now_millis();
                        self.status.write().last_sync_time = Some(now);
                        self.store.set_last_sync_time(&self.config.sync_key, now).await;
                    }
                    self.record_pass(Some(summary));
                }
                Err(e) => {
                    error!("Replay pass failed: {}", e);
                    self.record_pass(None);
                }
            }
            self.refresh_pending_count().await;
            result
        };

        // 本轮期间到达的触发可能带来了本轮没扫到的变更
        let rerun = self.rerun.lock().take();
        if let Some(next) = rerun {
            if self.queue.pending_count().await > 0 {
                self.spawn_sync(next);
            }
        }

        let now = self.clock.now_millis();
        match outcome {
            Ok(summary) => {
                self.events
                    .emit(SyncEvent::SyncCompleted {
                        summary,
                        timestamp: now,
                    })
                    .await;
                Some(summary)
            }
            Err(e) => {
                self.events
                    .emit(SyncEvent::SyncFailed {
                        error: e.to_string(),
                        timestamp: now,
                    })
                    .await;
                None
            }
        }
    }

    fn spawn_sync(&self, trigger: SyncTrigger) {
        if let Some(this) = self.me.upgrade() {
            tokio::spawn(async move {
                this.request_sync(trigger).await;
            });
        }
    }

    /// 记录一条本地变更
    ///
    /// 在线时会在后台立即尝试回放。本地存储不可用时降级为直接提交远端，
    /// 这种情况下没有持久化保证。只有参数非法时返回错误。
    pub async fn queue_mutation(
        &self,
        table: &str,
        operation: MutationOperation,
        data: serde_json::Value,
    ) -> Result<MutationOutcome> {
        let online = self.network.is_online().await;

        match self.queue.queue_mutation(table, operation, data).await? {
            EnqueueOutcome::Queued(mutation) => {
                self.events
                    .emit(SyncEvent::MutationQueued {
                        mutation_id: mutation.id().to_string(),
                        table: table.to_string(),
                        operation,
                        timestamp: self.clock.now_millis(),
                    })
                    .await;
                self.refresh_pending_count().await;
                if online {
                    self.spawn_sync(SyncTrigger::Enqueue);
                }
                Ok(MutationOutcome::Queued(mutation))
            }
            EnqueueOutcome::NotPersisted { request, reason } => {
                let (applied_live, reason) = if online {
                    match self.queue.apply_live(&request).await {
                        Ok(()) => (true, reason),
                        Err(failure) => {
                            warn!("Live apply of {} {} failed: {}", operation, table, failure);
                            (false, failure.to_string())
                        }
                    }
                } else {
                    (false, format!("offline and local storage unavailable: {}", reason))
                };

                let outcome = if applied_live {
                    MutationOutcome::AppliedLive
                } else {
                    MutationOutcome::Dropped {
                        reason: reason.clone(),
                    }
                };
                self.events
                    .emit(SyncEvent::MutationNotPersisted {
                        table: table.to_string(),
                        operation,
                        applied_live,
                        reason,
                        timestamp: self.clock.now_millis(),
                    })
                    .await;
                Ok(outcome)
            }
        }
    }

    /// 重新从日志计算待同步数量，有变化时发出事件
    pub async fn refresh_pending_count(&self) -> usize {
        let count = self.queue.pending_count().await;
        let changed = {
            let mut status = self.status.write();
            let changed = status.pending_count != count;
            status.pending_count = count;
            changed
        };
        if changed {
            self.events
                .emit(SyncEvent::PendingCountChanged {
                    pending_count: count,
                    timestamp: self.clock.now_millis(),
                })
                .await;
        }
        count
    }

    pub async fn cache_data<T: Serialize>(&self, table: &str, rows: &[T]) {
        self.store.set_cached_data(table, rows).await;
    }

    pub async fn get_cached_data<T: DeserializeOwned>(&self, table: &str) -> Vec<T> {
        self.store.get_cached_data(table).await
    }

    pub fn status(&self) -> SyncStatus {
        self.status.read().clone()
    }

    pub fn is_online(&self) -> bool {
        self.status.read().is_online
    }

    pub fn pending_count(&self) -> usize {
        self.status.read().pending_count
    }

    pub fn is_syncing(&self) -> bool {
        self.status.read().is_syncing()
    }

    pub fn last_sync_time(&self) -> Option<i64> {
        self.status.read().last_sync_time
    }

    pub fn wake_sender(&self) -> WakeSender {
        WakeSender {
            tx: self.wake_tx.clone(),
        }
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ManualNetworkStatusListener, NetworkStatus};
    use crate::remote::{ApplyRequest, RemoteApply};
    use crate::storage::kv::MemoryKvBackend;
    use crate::storage::queue::ApplyFailure;
    use crate::utils::ManualClock;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct TestRemote {
        calls: Mutex<Vec<ApplyRequest>>,
        fail: AtomicBool,
        panic_on_apply: AtomicBool,
        delay_ms: u64,
    }

    impl TestRemote {
        fn calls(&self) -> Vec<ApplyRequest> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl RemoteApply for TestRemote {
        async fn apply(&self, request: &ApplyRequest) -> std::result::Result<(), ApplyFailure> {
            if self.panic_on_apply.load(Ordering::SeqCst) {
                panic!("remote threw");
            }
            self.calls.lock().push(request.clone());
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                Err(ApplyFailure::Network("connection reset".into()))
            } else {
                Ok(())
            }
        }
    }

    struct Fixture {
        controller: Arc<SyncController>,
        remote: Arc<TestRemote>,
        network: Arc<NetworkMonitor>,
        events: Arc<EventManager>,
        clock: Arc<ManualClock>,
    }

    async fn fixture_with(remote: TestRemote, backend: MemoryKvBackend, config: ControllerConfig) -> Fixture {
        let remote = Arc::new(remote);
        let store = Arc::new(LocalStore::new(Arc::new(backend)));
        store.init().await;
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let queue = Arc::new(SyncQueue::new(
            store.clone(),
            remote.clone(),
            clock.clone(),
            Duration::from_secs(2),
        ));
        let network = Arc::new(NetworkMonitor::new(Arc::new(ManualNetworkStatusListener::new(
            NetworkStatus::Offline,
        ))));
        let events = Arc::new(EventManager::new(64));
        let controller = SyncController::new(
            queue,
            store,
            network.clone(),
            events.clone(),
            clock.clone(),
            config,
        );
        Fixture {
            controller,
            remote,
            network,
            events,
            clock,
        }
    }

    fn quiet_config() -> ControllerConfig {
        ControllerConfig {
            poll_interval: Duration::from_secs(3600),
            auto_retry: false,
            ..ControllerConfig::default()
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(TestRemote::default(), MemoryKvBackend::new(), quiet_config()).await
    }

    async fn wait_for_pending(controller: &SyncController, expected: usize) {
        for _ in 0..200 {
            if controller.refresh_pending_count().await == expected && !controller.is_syncing() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "pending count never reached {} (now {})",
            expected,
            controller.pending_count()
        );
    }

    #[tokio::test]
    async fn test_offline_enqueue_then_reconnect_scenario() {
        let f = fixture().await;
        f.controller.start().await.unwrap();

        let summaries = Arc::new(Mutex::new(Vec::new()));
        let s = summaries.clone();
        let _handle = f.controller.queue().on_sync_complete(move |summary| s.lock().push(*summary));

        let payload = json!({"id": "t1", "status": "complete"});
        let outcome = f
            .controller
            .queue_mutation("tasks", MutationOperation::Update, payload.clone())
            .await
            .unwrap();
        assert!(matches!(outcome, MutationOutcome::Queued(_)));
        assert_eq!(f.controller.pending_count(), 1);
        assert!(!f.controller.is_online());
        assert!(f.remote.calls().is_empty());

        f.network.set_status(NetworkStatus::Online).await;
        wait_for_pending(&f.controller, 0).await;

        assert_eq!(
            f.remote.calls(),
            vec![ApplyRequest::new("tasks", MutationOperation::Update, payload)]
        );
        assert_eq!(*summaries.lock(), vec![SyncSummary { synced: 1, failed: 0 }]);
        assert!(f.controller.is_online());
        f.controller.stop().await;
    }

    #[tokio::test]
    async fn test_reconnect_updates_last_sync_time() {
        let f = fixture().await;
        f.controller.start().await.unwrap();

        for id in ["a", "b", "c"] {
            f.controller
                .queue_mutation("policies", MutationOperation::Insert, json!({"id": id}))
                .await
                .unwrap();
        }
        assert_eq!(f.controller.pending_count(), 3);
        assert_eq!(f.controller.last_sync_time(), None);

        let transition_time = f.clock.advance(60_000);
        f.network.set_status(NetworkStatus::Online).await;
        wait_for_pending(&f.controller, 0).await;

        let last = f.controller.last_sync_time().expect("last sync time set");
        assert!(last >= transition_time);
        assert_eq!(f.remote.calls().len(), 3);
        f.controller.stop().await;
    }

    #[tokio::test]
    async fn test_manual_trigger_ignored_offline() {
        let f = fixture().await;
        f.controller
            .queue_mutation("tasks", MutationOperation::Insert, json!({"id": "x"}))
            .await
            .unwrap();
        assert!(f.controller.trigger_sync().await.is_none());
        assert!(f.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_triggers_run_one_pass() {
        let f = fixture_with(
            TestRemote {
                delay_ms: 30,
                ..TestRemote::default()
            },
            MemoryKvBackend::new(),
            quiet_config(),
        )
        .await;
        f.network.set_status(NetworkStatus::Online).await;
        // 直接通过队列入队，不触发后台回放
        for id in ["1", "2"] {
            f.controller
                .queue()
                .queue_mutation("complaints", MutationOperation::Insert, json!({"id": id}))
                .await
                .unwrap();
        }

        let (a, b) = tokio::join!(f.controller.trigger_sync(), f.controller.trigger_sync());
        let ran: Vec<_> = [a, b].into_iter().flatten().collect();
        assert_eq!(ran, vec![SyncSummary { synced: 2, failed: 0 }]);
        assert_eq!(f.remote.calls().len(), 2);
        assert!(!f.controller.is_syncing());
    }

    #[tokio::test]
    async fn test_enqueue_during_pass_is_replayed_afterwards() {
        let f = fixture_with(
            TestRemote {
                delay_ms: 100,
                ..TestRemote::default()
            },
            MemoryKvBackend::new(),
            quiet_config(),
        )
        .await;
        f.network.set_status(NetworkStatus::Online).await;
        f.controller.start().await.unwrap();

        f.controller
            .queue_mutation("tasks", MutationOperation::Insert, json!({"id": "first"}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.controller.is_syncing());
        f.controller
            .queue_mutation("tasks", MutationOperation::Insert, json!({"id": "second"}))
            .await
            .unwrap();

        wait_for_pending(&f.controller, 0).await;
        let ids: Vec<_> = f.remote.calls().iter().map(|c| c.payload["id"].clone()).collect();
        assert_eq!(ids, vec![json!("first"), json!("second")]);
        f.controller.stop().await;
    }

    #[tokio::test]
    async fn test_start_online_replays_leftover_log() {
        let f = fixture().await;
        f.network.set_status(NetworkStatus::Online).await;
        // 模拟上次进程退出前留下的日志
        for id in ["left-1", "left-2"] {
            f.controller
                .queue()
                .queue_mutation("audits", MutationOperation::Insert, json!({"id": id}))
                .await
                .unwrap();
        }

        f.controller.start().await.unwrap();
        wait_for_pending(&f.controller, 0).await;
        assert_eq!(f.remote.calls().len(), 2);
        assert!(f.controller.last_sync_time().is_some());
        f.controller.stop().await;
    }

    #[tokio::test]
    async fn test_resync_after_missed_events_replays_on_reconnect() {
        let f = fixture().await;
        f.controller
            .queue()
            .queue_mutation("tasks", MutationOperation::Update, json!({"id": "m"}))
            .await
            .unwrap();
        assert!(!f.controller.is_online());

        // 控制器未启动，不会收到这次状态变化
        f.network.set_status(NetworkStatus::Online).await;
        f.controller.resync_connectivity().await;
        assert!(f.controller.is_online());
        assert_eq!(f.remote.calls().len(), 1);
        assert_eq!(f.controller.pending_count(), 0);

        // 已经在线时校正不会再触发回放
        f.controller
            .queue()
            .queue_mutation("tasks", MutationOperation::Update, json!({"id": "n"}))
            .await
            .unwrap();
        f.controller.resync_connectivity().await;
        assert_eq!(f.remote.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_event_listener_does_not_break_replay() {
        let f = fixture().await;
        f.events
            .add_listener("sync_started", |_| panic!("badge renderer crashed"))
            .await;
        f.network.set_status(NetworkStatus::Online).await;
        f.controller.start().await.unwrap();

        f.controller
            .queue_mutation("tasks", MutationOperation::Insert, json!({"id": "p1"}))
            .await
            .unwrap();
        wait_for_pending(&f.controller, 0).await;

        f.network.set_status(NetworkStatus::Offline).await;
        f.controller
            .queue_mutation("tasks", MutationOperation::Insert, json!({"id": "p2"}))
            .await
            .unwrap();
        f.network.set_status(NetworkStatus::Online).await;
        wait_for_pending(&f.controller, 0).await;

        assert_eq!(f.remote.calls().len(), 2);
        assert_eq!(f.controller.status().phase, SyncPhase::Idle);
        f.controller.stop().await;
    }

    #[tokio::test]
    async fn test_pass_panic_returns_to_idle_with_error_event() {
        let f = fixture().await;
        f.network.set_status(NetworkStatus::Online).await;
        f.remote.panic_on_apply.store(true, Ordering::SeqCst);
        f.controller
            .queue()
            .queue_mutation("audits", MutationOperation::Insert, json!({"id": "fire-1"}))
            .await
            .unwrap();

        let mut rx = f.events.subscribe();
        assert!(f.controller.trigger_sync().await.is_none());
        assert!(!f.controller.is_syncing());
        assert_eq!(f.controller.status().phase, SyncPhase::Idle);

        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::SyncFailed { .. } = event {
                assert!(event.user_message().is_some());
                saw_failure = true;
            }
        }
        assert!(saw_failure);

        // 之后还能正常回放
        f.remote.panic_on_apply.store(false, Ordering::SeqCst);
        let summary = f.controller.trigger_sync().await.unwrap();
        assert_eq!(summary.synced, 1);
    }

    #[tokio::test]
    async fn test_completion_event_reports_failures() {
        let f = fixture().await;
        f.network.set_status(NetworkStatus::Online).await;
        f.remote.fail.store(true, Ordering::SeqCst);
        f.controller
            .queue()
            .queue_mutation("claims", MutationOperation::Update, json!({"id": "c9"}))
            .await
            .unwrap();

        let toasts = Arc::new(Mutex::new(Vec::new()));
        let t = toasts.clone();
        f.events
            .add_listener("sync_completed", move |event| {
                if let Some(msg) = event.user_message() {
                    t.lock().push(msg);
                }
            })
            .await;

        let summary = f.controller.trigger_sync().await.unwrap();
        assert_eq!(summary, SyncSummary { synced: 0, failed: 1 });
        assert_eq!(f.controller.pending_count(), 1);
        assert_eq!(f.controller.last_sync_time(), None);
        assert_eq!(*toasts.lock(), vec!["1 changes failed to sync, will retry".to_string()]);
    }

    #[tokio::test]
    async fn test_backoff_after_failed_pass() {
        let f = fixture().await;
        f.network.set_status(NetworkStatus::Online).await;
        f.remote.fail.store(true, Ordering::SeqCst);
        f.controller
            .queue()
            .queue_mutation("training", MutationOperation::Insert, json!({"id": "t"}))
            .await
            .unwrap();

        assert!(f.controller.retry_due());
        f.controller.trigger_sync().await.unwrap();
        assert!(!f.controller.retry_due());

        // 默认基础延迟 1s，抖动 ±5%
        f.clock.advance(1_100);
        assert!(f.controller.retry_due());

        f.remote.fail.store(false, Ordering::SeqCst);
        f.controller.trigger_sync().await.unwrap();
        assert!(f.controller.retry_due());
        assert_eq!(f.controller.retry_state.lock().failed_passes, 0);
    }

    #[tokio::test]
    async fn test_poll_refreshes_pending_and_auto_replays() {
        let config = ControllerConfig {
            poll_interval: Duration::from_millis(20),
            auto_retry: false,
            ..ControllerConfig::default()
        };
        let f = fixture_with(TestRemote::default(), MemoryKvBackend::new(), config).await;
        f.controller.start().await.unwrap();

        // 绕过控制器直接入队，只有轮询能发现它
        f.controller
            .queue()
            .queue_mutation("tasks", MutationOperation::Insert, json!({"id": "p"}))
            .await
            .unwrap();
        for _ in 0..100 {
            if f.controller.pending_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.controller.pending_count(), 1);
        f.controller.stop().await;

        // 开启自动回放后，在线时轮询会把它同步掉
        let config = ControllerConfig {
            poll_interval: Duration::from_millis(20),
            auto_retry: true,
            ..ControllerConfig::default()
        };
        let f = fixture_with(TestRemote::default(), MemoryKvBackend::new(), config).await;
        f.network.set_status(NetworkStatus::Online).await;
        f.controller.start().await.unwrap();
        f.controller
            .queue()
            .queue_mutation("tasks", MutationOperation::Insert, json!({"id": "q"}))
            .await
            .unwrap();
        wait_for_pending(&f.controller, 0).await;
        assert_eq!(f.remote.calls().len(), 1);
        f.controller.stop().await;
    }

    #[tokio::test]
    async fn test_wake_message_triggers_sync() {
        let f = fixture().await;
        f.network.set_status(NetworkStatus::Online).await;
        f.controller.start().await.unwrap();
        f.controller
            .queue()
            .queue_mutation("policies", MutationOperation::Delete, json!({"id": "old"}))
            .await
            .unwrap();
        assert!(f.remote.calls().is_empty());

        let wake = f.controller.wake_sender();
        assert!(wake.deliver_json(r#"{"type":"SYNC_REQUESTED"}"#).unwrap());
        wait_for_pending(&f.controller, 0).await;
        assert_eq!(f.remote.calls().len(), 1);

        assert!(wake.deliver_json(r#"{"type":"SOMETHING_ELSE"}"#).is_err());
        f.controller.stop().await;
    }

    #[tokio::test]
    async fn test_online_enqueue_replays_in_background() {
        let f = fixture().await;
        f.network.set_status(NetworkStatus::Online).await;
        f.controller.start().await.unwrap();

        f.controller
            .queue_mutation("tasks", MutationOperation::Insert, json!({"id": "now"}))
            .await
            .unwrap();
        wait_for_pending(&f.controller, 0).await;
        assert_eq!(f.remote.calls().len(), 1);
        f.controller.stop().await;
    }

    #[tokio::test]
    async fn test_degraded_mode() {
        let f = fixture_with(TestRemote::default(), MemoryKvBackend::unavailable(), quiet_config()).await;

        let outcome = f
            .controller
            .queue_mutation("tasks", MutationOperation::Insert, json!({"id": "d1"}))
            .await
            .unwrap();
        assert!(matches!(outcome, MutationOutcome::Dropped { .. }));
        assert!(f.remote.calls().is_empty());

        f.network.set_status(NetworkStatus::Online).await;
        let outcome = f
            .controller
            .queue_mutation("tasks", MutationOperation::Insert, json!({"id": "d2"}))
            .await
            .unwrap();
        assert_eq!(outcome, MutationOutcome::AppliedLive);
        assert_eq!(f.remote.calls().len(), 1);
        assert_eq!(f.controller.pending_count(), 0);

        // 缓存接口在降级模式下是空操作
        f.controller.cache_data("tasks", &[json!({"id": 1})]).await;
        let cached: Vec<serde_json::Value> = f.controller.get_cached_data("tasks").await;
        assert!(cached.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_arguments_propagate() {
        let f = fixture().await;
        let err = f
            .controller
            .queue_mutation("", MutationOperation::Insert, json!({}))
            .await
            .unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[tokio::test]
    async fn test_start_twice_fails_and_restores_last_sync() {
        let backend = MemoryKvBackend::new();
        let f = fixture_with(TestRemote::default(), backend, quiet_config()).await;
        f.controller.store.set_last_sync_time(DEFAULT_SYNC_KEY, 42).await;

        f.controller.start().await.unwrap();
        assert_eq!(f.controller.last_sync_time(), Some(42));
        assert!(f.controller.start().await.is_err());
        f.controller.stop().await;
        assert!(!f.controller.is_running());
    }

    #[tokio::test]
    async fn test_pending_count_events() {
        let f = fixture().await;
        let counts = Arc::new(AtomicUsize::new(0));
        let c = counts.clone();
        f.events
            .add_listener("pending_count_changed", move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        f.controller
            .queue_mutation("tasks", MutationOperation::Insert, json!({"id": 1}))
            .await
            .unwrap();
        f.controller.refresh_pending_count().await;
        assert_eq!(counts.load(Ordering::SeqCst), 1);
    }
}
