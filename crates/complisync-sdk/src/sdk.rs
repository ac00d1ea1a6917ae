//! 统一 SDK 接口 - OfflineSyncSDK 主入口
//!
//! 分层架构设计：
//! ```text
//! OfflineSyncSDK (展示层契约)
//!   ├── SyncController (同步控制层)
//!   ├── SyncQueue (待同步队列)
//!   ├── LocalStore (本地存储层)
//!   ├── EventManager (事件系统层)
//!   └── NetworkMonitor (网络监控层)
//! ```
//!
//! 设计原则：
//! - 异步优先：主要 API 使用 async/await
//! - 离线优先：写入先落本地日志，联网后按序回放
//! - 事件驱动：统一的事件回调机制

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::error::{Result, SyncSDKError};
use crate::events::{EventManager, SyncEvent};
use crate::lifecycle::{LifecycleManager, SyncLifecycleHook};
use crate::network::{NetworkMonitor, NetworkStatusListener};
use crate::remote::RemoteApply;
use crate::storage::kv::{KvBackend, SledKvBackend};
use crate::storage::local_store::LocalStore;
use crate::storage::queue::{
    MutationOperation, QueueStats, RetryPolicy, SyncListenerHandle, SyncQueue, SyncSummary,
};
use crate::sync::{ControllerConfig, MutationOutcome, SyncController, SyncStatus, WakeSender};
use crate::utils::{Clock, SystemClock};

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(30),
        }
    }
}

/// 自动回放的重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy {
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            backoff_factor: config.backoff_factor,
            jitter_factor: config.jitter_factor,
        }
    }
}

/// 事件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// 事件缓冲区大小
    pub buffer_size: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { buffer_size: 1000 }
    }
}

/// SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 数据存储目录
    pub data_dir: PathBuf,
    /// 存储命名空间（每个诊所/用户一份独立的待同步日志）
    pub namespace: String,
    /// 轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 单条写入的远端超时（毫秒）
    pub apply_timeout_ms: u64,
    /// 在线且有待同步变更时是否自动回放
    pub auto_retry: bool,
    /// 重试配置
    pub retry_config: RetryConfig,
    /// 事件配置
    pub event_config: EventConfig,
    /// HTTP 客户端配置
    pub http_client_config: HttpClientConfig,
    /// 调试模式
    pub debug_mode: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            namespace: "default".to_string(),
            poll_interval_ms: 5000,
            apply_timeout_ms: 30000,
            auto_retry: true,
            retry_config: RetryConfig::default(),
            event_config: EventConfig::default(),
            http_client_config: HttpClientConfig::default(),
            debug_mode: false,
        }
    }
}

/// 获取默认数据目录 ~/.complisync/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".complisync")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        // Windows 支持
        home_dir.join(".complisync")
    } else {
        PathBuf::from("./complisync_data")
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(SyncSDKError::Config("数据目录不能为空".to_string()));
        }
        if self.namespace.trim().is_empty() {
            return Err(SyncSDKError::Config("命名空间不能为空".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(SyncSDKError::Config("轮询间隔不能为0".to_string()));
        }
        if self.apply_timeout_ms == 0 {
            return Err(SyncSDKError::Config("远端写入超时不能为0".to_string()));
        }
        if self.event_config.buffer_size == 0 {
            return Err(SyncSDKError::Config("事件缓冲区大小不能为0".to_string()));
        }
        if self.retry_config.backoff_factor < 1.0 {
            return Err(SyncSDKError::Config("退避因子不能小于1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.retry_config.jitter_factor) {
            return Err(SyncSDKError::Config("抖动因子必须在 0.0-1.0 之间".to_string()));
        }
        Ok(())
    }

    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            auto_retry: self.auto_retry,
            retry_policy: RetryPolicy::from(&self.retry_config),
            sync_key: self.namespace.clone(),
        }
    }
}

/// SDK 配置构建器
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    pub fn poll_interval_ms(mut self, interval: u64) -> Self {
        self.config.poll_interval_ms = interval;
        self
    }

    pub fn apply_timeout_ms(mut self, timeout: u64) -> Self {
        self.config.apply_timeout_ms = timeout;
        self
    }

    pub fn auto_retry(mut self, enabled: bool) -> Self {
        self.config.auto_retry = enabled;
        self
    }

    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.config.retry_config = config;
        self
    }

    pub fn event_config(mut self, config: EventConfig) -> Self {
        self.config.event_config = config;
        self
    }

    pub fn http_client_config(mut self, config: HttpClientConfig) -> Self {
        self.config.http_client_config = config;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 安装全局 fmt 日志订阅者，已安装过时返回 false
///
/// 库本身不会调用它，由宿主程序决定。
pub fn init_tracing(debug_mode: bool) -> bool {
    let level = if debug_mode {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .is_ok()
}

/// 离线同步 SDK 主接口
///
/// 对展示层只暴露 `is_online / pending_count / is_syncing / last_sync_time`
/// 以及 `queue_mutation / trigger_sync / cache_data / get_cached_data`。
pub struct OfflineSyncSDK {
    config: SyncConfig,
    store: Arc<LocalStore>,
    queue: Arc<SyncQueue>,
    network: Arc<NetworkMonitor>,
    event_manager: Arc<EventManager>,
    controller: Arc<SyncController>,
    lifecycle_manager: Arc<RwLock<LifecycleManager>>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for OfflineSyncSDK {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineSyncSDK")
            .field("namespace", &self.config.namespace)
            .field("controller", &self.controller)
            .finish()
    }
}

impl OfflineSyncSDK {
    /// 异步初始化 SDK
    ///
    /// 分层初始化顺序：
    /// 1. 存储层 → 2. 队列 → 3. 网络层 → 4. 事件层 → 5. 控制层
    pub async fn initialize(
        config: SyncConfig,
        remote: Arc<dyn RemoteApply>,
        network_listener: Arc<dyn NetworkStatusListener>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let backend = Arc::new(SledKvBackend::new(&config.data_dir, &config.namespace));
        Self::initialize_with(config, backend, remote, network_listener, Arc::new(SystemClock)).await
    }

    /// 使用自定义存储后端和时钟初始化
    pub async fn initialize_with(
        config: SyncConfig,
        backend: Arc<dyn KvBackend>,
        remote: Arc<dyn RemoteApply>,
        network_listener: Arc<dyn NetworkStatusListener>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        info!(
            "正在初始化 OfflineSyncSDK {} (namespace={})...",
            crate::version::user_agent(),
            config.namespace
        );
        config.validate()?;

        // === 第1层：本地存储 ===
        // 不可用时进入降级模式，不阻止初始化
        let store = Arc::new(LocalStore::new(backend));
        if !store.init().await {
            warn!("⚠️ 本地存储不可用，写入将不会被持久化");
        }

        // === 第2层：待同步队列 ===
        let queue = Arc::new(SyncQueue::new(
            store.clone(),
            remote,
            clock.clone(),
            Duration::from_millis(config.apply_timeout_ms),
        ));

        // === 第3层：网络监控 ===
        let network = Arc::new(NetworkMonitor::new(network_listener));
        network.start().await?;

        // === 第4层：事件管理器 ===
        let event_manager = Arc::new(EventManager::new(config.event_config.buffer_size));

        // === 第5层：同步控制器 ===
        let controller = SyncController::new(
            queue.clone(),
            store.clone(),
            network.clone(),
            event_manager.clone(),
            clock,
            config.controller_config(),
        );
        controller.start().await?;

        // === 生命周期 Hook ===
        let mut lifecycle = LifecycleManager::new();
        lifecycle.register_hook(Arc::new(SyncLifecycleHook::new(controller.clone())));

        let sdk = Arc::new(Self {
            config,
            store,
            queue,
            network,
            event_manager,
            controller,
            lifecycle_manager: Arc::new(RwLock::new(lifecycle)),
            shutting_down: AtomicBool::new(false),
        });

        info!("✅ OfflineSyncSDK 初始化完成");
        Ok(sdk)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SyncSDKError::ShuttingDown("SDK 已关闭".to_string()));
        }
        Ok(())
    }

    /// 记录一条变更；在线时会立即在后台尝试回放
    pub async fn queue_mutation(
        &self,
        table: &str,
        operation: MutationOperation,
        data: serde_json::Value,
    ) -> Result<MutationOutcome> {
        self.ensure_running()?;
        self.controller.queue_mutation(table, operation, data).await
    }

    /// 手动触发回放，离线或已有回放进行中时返回 `None`
    pub async fn trigger_sync(&self) -> Option<SyncSummary> {
        if self.ensure_running().is_err() {
            return None;
        }
        self.controller.trigger_sync().await
    }

    /// 覆盖某张表的读缓存
    pub async fn cache_data<T: Serialize>(&self, table: &str, rows: &[T]) {
        self.controller.cache_data(table, rows).await;
    }

    /// 读取某张表的读缓存，没有时返回空
    pub async fn get_cached_data<T: DeserializeOwned>(&self, table: &str) -> Vec<T> {
        self.controller.get_cached_data(table).await
    }

    pub fn is_online(&self) -> bool {
        self.controller.is_online()
    }

    pub fn pending_count(&self) -> usize {
        self.controller.pending_count()
    }

    pub fn is_syncing(&self) -> bool {
        self.controller.is_syncing()
    }

    pub fn last_sync_time(&self) -> Option<i64> {
        self.controller.last_sync_time()
    }

    pub fn status(&self) -> SyncStatus {
        self.controller.status()
    }

    /// 订阅 SDK 事件
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_manager.subscribe()
    }

    pub fn event_manager(&self) -> &Arc<EventManager> {
        &self.event_manager
    }

    /// 注册回放完成监听器
    pub fn on_sync_complete<F>(&self, listener: F) -> SyncListenerHandle
    where
        F: Fn(&SyncSummary) + Send + Sync + 'static,
    {
        self.queue.on_sync_complete(listener)
    }

    /// 外部唤醒通道（后台任务、推送等）
    pub fn wake_sender(&self) -> WakeSender {
        self.controller.wake_sender()
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    /// 本地存储是否可用（false 表示降级模式）
    pub fn is_storage_ready(&self) -> bool {
        self.store.is_ready()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// App 切换到前台
    pub async fn on_app_foreground(&self) -> Result<()> {
        self.ensure_running()?;
        self.lifecycle_manager.read().await.notify_foreground().await
    }

    /// App 切换到后台
    pub async fn on_app_background(&self) -> Result<()> {
        self.ensure_running()?;
        self.lifecycle_manager.read().await.notify_background().await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// 关闭 SDK：停止后台任务并刷盘
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("正在关闭 OfflineSyncSDK...");
        self.controller.stop().await;
        self.network.stop().await;
        if !self.store.flush().await && self.store.is_ready() {
            warn!("关闭时刷盘失败，最近的缓存写入可能丢失");
        }
        self.event_manager.clear_listeners().await;
        info!("✅ OfflineSyncSDK 已关闭");
        Ok(())
    }
}
