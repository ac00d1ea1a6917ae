//! 本地持久存储
//!
//! 在 [`KvBackend`] 之上划出两个逻辑区域：
//! - 待同步变更日志（`pending:{sequence}`）
//! - 按表的读缓存快照（`cache:{table}`）
//!
//! 对外的缓存/同步时间接口全部是尽力而为：持久化失败只记录日志，不向上抛出。
//! 如果平台拒绝存储，`init` 之后处于"未就绪"状态，所有操作退化为空操作。

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use super::kv::KvBackend;
use super::queue::mutation::{MutationOperation, QueuedMutation};
use crate::error::{Result, SyncSDKError};

/// 键前缀常量
pub mod keys {
    /// 待同步变更日志
    pub const PENDING: &str = "pending:";
    /// 读缓存快照
    pub const CACHE: &str = "cache:";
    /// 同步完成时间
    pub const LAST_SYNC: &str = "last_sync:";
}

/// 本地持久存储
#[derive(Debug)]
pub struct LocalStore {
    backend: Arc<dyn KvBackend>,
    ready: OnceCell<bool>,
}

impl LocalStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            ready: OnceCell::new(),
        }
    }

    /// 初始化底层存储，返回是否就绪
    ///
    /// 并发调用只会真正初始化一次；失败后停留在未就绪状态，不再重试。
    pub async fn init(&self) -> bool {
        *self
            .ready
            .get_or_init(|| async {
                match self.backend.init().await {
                    Ok(()) => {
                        info!("✅ 本地存储已就绪");
                        true
                    }
                    Err(e) => {
                        warn!("⚠️ 本地存储不可用，进入降级模式: {}", e);
                        false
                    }
                }
            })
            .await
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.ready.get(), Some(true))
    }

    fn pending_key(sequence: u64) -> String {
        format!("{}{:020}", keys::PENDING, sequence)
    }

    fn cache_key(table: &str) -> String {
        format!("{}{}", keys::CACHE, table)
    }

    fn last_sync_key(key: &str) -> String {
        format!("{}{}", keys::LAST_SYNC, key)
    }

    /// 覆盖写入某张表的缓存快照（后写覆盖，不做合并）
    pub async fn set_cached_data<T: Serialize>(&self, table: &str, rows: &[T]) {
        if !self.is_ready() {
            debug!("store not ready, skip caching {}", table);
            return;
        }
        let bytes = match serde_json::to_vec(rows) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("序列化缓存失败 table={}: {}", table, e);
                return;
            }
        };
        if let Err(e) = self.backend.set(&Self::cache_key(table), bytes).await {
            error!("写入缓存失败 table={}: {}", table, e);
        }
    }

    /// 读取某张表最近一次的缓存快照，不存在时返回空列表
    pub async fn get_cached_data<T: DeserializeOwned>(&self, table: &str) -> Vec<T> {
        if !self.is_ready() {
            return Vec::new();
        }
        match self.backend.get(&Self::cache_key(table)).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("缓存数据无法解析 table={}: {}", table, e);
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                error!("读取缓存失败 table={}: {}", table, e);
                Vec::new()
            }
        }
    }

    pub async fn get_last_sync_time(&self, key: &str) -> Option<i64> {
        if !self.is_ready() {
            return None;
        }
        match self.backend.get(&Self::last_sync_key(key)).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).ok(),
            Ok(None) => None,
            Err(e) => {
                error!("读取同步时间失败 key={}: {}", key, e);
                None
            }
        }
    }

    pub async fn set_last_sync_time(&self, key: &str, timestamp: i64) {
        if !self.is_ready() {
            return;
        }
        let bytes = match serde_json::to_vec(&timestamp) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("序列化同步时间失败: {}", e);
                return;
            }
        };
        if let Err(e) = self.backend.set(&Self::last_sync_key(key), bytes).await {
            error!("写入同步时间失败 key={}: {}", key, e);
        }
    }

    /// 把缓存和同步时间等未刷盘的写入落盘，返回是否成功
    pub async fn flush(&self) -> bool {
        if !self.is_ready() {
            return false;
        }
        match self.backend.flush().await {
            Ok(()) => true,
            Err(e) => {
                error!("刷盘失败: {}", e);
                false
            }
        }
    }

    // ===== 待同步日志 =====

    /// 追加一条变更并刷盘，返回后即使进程崩溃记录仍在
    pub(crate) async fn append_mutation(
        &self,
        table: &str,
        operation: MutationOperation,
        payload: serde_json::Value,
        enqueued_at: i64,
    ) -> Result<QueuedMutation> {
        if !self.is_ready() {
            return Err(SyncSDKError::NotInitialized("本地存储未就绪".to_string()));
        }
        let sequence = self.backend.generate_id().await?;
        let mutation =
            QueuedMutation::new(sequence, table.to_string(), operation, payload, enqueued_at);
        self.save_mutation(&mutation).await?;
        self.backend.flush().await?;
        Ok(mutation)
    }

    /// 按入队顺序读取全部待同步变更；无法解析的记录跳过并告警
    pub(crate) async fn load_mutations(&self) -> Vec<QueuedMutation> {
        if !self.is_ready() {
            return Vec::new();
        }
        let entries = match self.backend.scan_prefix(keys::PENDING).await {
            Ok(entries) => entries,
            Err(e) => {
                error!("读取待同步日志失败: {}", e);
                return Vec::new();
            }
        };

        let mut mutations: Vec<QueuedMutation> = entries
            .into_iter()
            .filter_map(|(key, bytes)| match serde_json::from_slice(&bytes) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!("跳过无法解析的待同步记录 {}: {}", key, e);
                    None
                }
            })
            .collect();
        // 键已按序号字典序排列，这里再按序号排一次以防后端不保证顺序
        mutations.sort_by_key(|m| m.sequence());
        mutations
    }

    pub(crate) async fn save_mutation(&self, mutation: &QueuedMutation) -> Result<()> {
        let bytes = serde_json::to_vec(mutation)?;
        self.backend
            .set(&Self::pending_key(mutation.sequence()), bytes)
            .await
    }

    pub(crate) async fn remove_mutation(&self, mutation: &QueuedMutation) -> Result<()> {
        self.backend
            .remove(&Self::pending_key(mutation.sequence()))
            .await?;
        self.backend.flush().await
    }

    /// 从日志直接计算待同步数量
    pub async fn pending_mutation_count(&self) -> usize {
        if !self.is_ready() {
            return 0;
        }
        match self.backend.count_prefix(keys::PENDING).await {
            Ok(count) => count,
            Err(e) => {
                error!("统计待同步数量失败: {}", e);
                0
            }
        }
    }
}
