//! CompliSync SDK - 离线优先的变更队列与同步引擎
//!
//! 本 SDK 为合规管理类应用提供离线写入能力，包括：
//! - 💾 本地持久化：读缓存 + 待同步日志（sled）
//! - 📤 待同步队列：按入队顺序回放，至少一次投递，逐条记账
//! - 📡 网络感知：恢复在线、周期轮询、外部唤醒时自动回放
//! - ⚙️ 事件系统：待同步角标、同步提示条所需的全部状态
//! - 🧵 并发安全：同一时间只有一轮回放，重叠调用共享结果
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use complisync_sdk::{
//!     HttpRemoteApply, ManualNetworkStatusListener, MutationOperation, NetworkStatus,
//!     OfflineSyncSDK, SyncConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .namespace("practice-42")
//!         .build();
//!
//!     let remote = Arc::new(HttpRemoteApply::new(
//!         &config.http_client_config,
//!         "https://api.example.com/rest/v1",
//!         Some("anon-key".to_string()),
//!     )?);
//!     let network = Arc::new(ManualNetworkStatusListener::new(NetworkStatus::Offline));
//!
//!     let sdk = OfflineSyncSDK::initialize(config, remote, network.clone()).await?;
//!
//!     // 离线写入先落本地日志
//!     sdk.queue_mutation(
//!         "tasks",
//!         MutationOperation::Update,
//!         serde_json::json!({"id": "t1", "status": "complete"}),
//!     )
//!     .await?;
//!     println!("待同步: {}", sdk.pending_count());
//!
//!     // 平台层通知恢复在线后自动回放
//!     network.push(NetworkStatus::Online).await;
//!
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod error;
pub mod version;
pub mod utils;
pub mod storage;
pub mod remote;
pub mod network;
pub mod events;
pub mod sync;
pub mod lifecycle;
pub mod http_client;
pub mod sdk;

// 重新导出核心类型，方便使用
pub use error::{Result, SyncSDKError};
pub use events::{EventManager, EventStats, SyncEvent};
pub use http_client::{HttpRemoteApply, RequestPlan};
pub use lifecycle::{AppPhase, LifecycleHook, LifecycleManager};
pub use network::{
    ManualNetworkStatusListener, NetworkMonitor, NetworkStatus, NetworkStatusEvent,
    NetworkStatusListener,
};
pub use remote::{ApplyRequest, RemoteApply};
pub use sdk::{
    init_tracing, EventConfig, HttpClientConfig, OfflineSyncSDK, RetryConfig, SyncConfig,
    SyncConfigBuilder,
};
pub use storage::queue::{
    ApplyFailure, EnqueueOutcome, MutationOperation, QueueStats, QueuedMutation, ReplayMetrics,
    RetryPolicy, SyncListenerHandle, SyncQueue, SyncSummary,
};
pub use storage::{KvBackend, LocalStore, MemoryKvBackend, SledKvBackend};
pub use sync::{
    MutationOutcome, SyncController, SyncPhase, SyncStatus, SyncTrigger, WakeMessage, WakeSender,
};
pub use utils::{Clock, ManualClock, SystemClock};
pub use version::SDK_VERSION;
