use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::Result;

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
    /// 网络受限（弱网、强制门户等），仍尝试提交
    Limited,
}

impl NetworkStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, NetworkStatus::Online | NetworkStatus::Limited)
    }
}

/// 网络状态变化事件
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: i64,
}

impl NetworkStatusEvent {
    /// 离线之后恢复在线（`was_offline && is_online`）
    pub fn is_reconnect(&self) -> bool {
        !self.old_status.is_online() && self.new_status.is_online()
    }

    pub fn is_disconnect(&self) -> bool {
        self.old_status.is_online() && !self.new_status.is_online()
    }
}

/// 网络状态监听器 trait（由平台层实现，如浏览器 online/offline 事件、Android/iOS 网络回调）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatus>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 由宿主代码手动推送状态的监听器
///
/// 平台桥接层在收到系统回调时调用 [`ManualNetworkStatusListener::push`]。
#[derive(Debug)]
pub struct ManualNetworkStatusListener {
    status: RwLock<NetworkStatus>,
    sender: broadcast::Sender<NetworkStatus>,
}

impl ManualNetworkStatusListener {
    pub fn new(initial: NetworkStatus) -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            status: RwLock::new(initial),
            sender,
        }
    }

    pub async fn push(&self, status: NetworkStatus) {
        *self.status.write().await = status;
        // 没有订阅者时发送失败属正常
        let _ = self.sender.send(status);
    }
}

#[async_trait]
impl NetworkStatusListener for ManualNetworkStatusListener {
    async fn get_current_status(&self) -> NetworkStatus {
        *self.status.read().await
    }

    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatus>> {
        Ok(self.sender.subscribe())
    }

    async fn stop_monitoring(&self) {}
}

/// 网络监控管理器
///
/// 维护当前状态，并把"真正发生变化"的状态以 [`NetworkStatusEvent`] 广播出去。
#[derive(Debug)]
pub struct NetworkMonitor {
    listener: Arc<dyn NetworkStatusListener>,
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<RwLock<NetworkStatus>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    pub fn new(listener: Arc<dyn NetworkStatusListener>) -> Self {
        let (status_sender, _) = broadcast::channel(100);

        Self {
            listener,
            status_sender,
            current_status: Arc::new(RwLock::new(NetworkStatus::Offline)),
            forwarder: Mutex::new(None),
        }
    }

    /// 启动网络监控：读取初始状态并转发后续变化
    pub async fn start(&self) -> Result<()> {
        let initial = self.listener.get_current_status().await;
        Self::apply_status(&self.current_status, &self.status_sender, initial).await;

        let mut receiver = self.listener.start_monitoring().await?;
        let status_sender = self.status_sender.clone();
        let current_status = self.current_status.clone();

        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(status) => {
                        Self::apply_status(&current_status, &status_sender, status).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("network listener lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.forwarder.lock().replace(handle) {
            previous.abort();
        }

        Ok(())
    }

    /// 停止监听并结束转发任务，之后平台推送的状态不再生效
    pub async fn stop(&self) {
        let forwarder = self.forwarder.lock().take();
        if let Some(handle) = forwarder {
            handle.abort();
        }
        self.listener.stop_monitoring().await;
        debug!("Network monitor stopped");
    }

    async fn apply_status(
        current_status: &RwLock<NetworkStatus>,
        status_sender: &broadcast::Sender<NetworkStatusEvent>,
        new_status: NetworkStatus,
    ) {
        let old_status = {
            let mut status = current_status.write().await;
            let old = *status;
            *status = new_status;
            old
        };

        if old_status == new_status {
            return;
        }

        info!("Network status changed: {:?} -> {:?}", old_status, new_status);
        let event = NetworkStatusEvent {
            old_status,
            new_status,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let _ = status_sender.send(event);
    }

    /// 获取当前网络状态
    pub async fn get_status(&self) -> NetworkStatus {
        *self.current_status.read().await
    }

    /// 手动设置网络状态
    pub async fn set_status(&self, new_status: NetworkStatus) {
        Self::apply_status(&self.current_status, &self.status_sender, new_status).await;
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }

    pub async fn is_online(&self) -> bool {
        self.get_status().await.is_online()
    }
}
