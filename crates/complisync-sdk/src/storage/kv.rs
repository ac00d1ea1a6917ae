//! KV 存储后端 - 本地持久层的最底层
//!
//! 本模块提供：
//! - [`KvBackend`] trait：`init/get/set/remove/scan_prefix` 等最小键值接口
//! - [`SledKvBackend`]：基于 sled 的持久化实现，按命名空间隔离 Tree
//! - [`MemoryKvBackend`]：内存实现，用于测试以及模拟平台拒绝存储的场景

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use sled::{Db, Tree};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncSDKError};

/// 键值存储后端
///
/// 所有键都是 UTF-8 字符串，值为任意字节。`scan_prefix` 必须按键的字典序返回。
#[async_trait]
pub trait KvBackend: Send + Sync + Debug {
    /// 打开底层存储，可重复调用
    async fn init(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// 按字典序返回指定前缀下的所有键值对
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// 统计指定前缀下的键数量
    async fn count_prefix(&self, prefix: &str) -> Result<usize> {
        Ok(self.scan_prefix(prefix).await?.len())
    }

    /// 生成单调递增的唯一 ID（跨重启仍然递增）
    async fn generate_id(&self) -> Result<u64>;

    /// 将已写入的数据刷到磁盘
    async fn flush(&self) -> Result<()>;
}

/// 基于 sled 的 KV 存储
#[derive(Debug)]
pub struct SledKvBackend {
    base_path: PathBuf,
    namespace: String,
    handles: OnceCell<SledHandles>,
}

#[derive(Debug)]
struct SledHandles {
    db: Db,
    tree: Tree,
}

impl SledKvBackend {
    /// 创建后端，真正的打开动作延迟到 `init`
    ///
    /// 数据位于 `{base_path}/kv`，每个命名空间（诊所/用户）一棵独立的 Tree。
    pub fn new(base_path: &Path, namespace: &str) -> Self {
        Self {
            base_path: base_path.to_path_buf(),
            namespace: namespace.to_string(),
            handles: OnceCell::new(),
        }
    }

    fn tree_name(&self) -> String {
        format!("ns_{}", self.namespace)
    }

    async fn open(&self) -> Result<SledHandles> {
        let kv_path = self.base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| SyncSDKError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 旧实例可能刚释放文件锁，带退避重试
        const MAX_OPEN_RETRIES: u32 = 6;
        const RETRY_DELAY_MS: u64 = 100;
        let mut last_err: Option<sled::Error> = None;
        let mut db_opt: Option<Db> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(db) => {
                    db_opt = Some(db);
                    break;
                }
                Err(e) => {
                    let msg = e.to_string();
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        debug!("sled locked, retrying open in {}ms", delay_ms);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }

        let db = db_opt.ok_or_else(|| {
            SyncSDKError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        let tree = db
            .open_tree(self.tree_name())
            .map_err(|e| SyncSDKError::KvStore(format!("打开命名空间 Tree 失败: {}", e)))?;

        info!("KV store opened: {} (namespace={})", kv_path.display(), self.namespace);

        Ok(SledHandles { db, tree })
    }

    fn handles(&self) -> Result<&SledHandles> {
        self.handles
            .get()
            .ok_or_else(|| SyncSDKError::NotInitialized("KV 存储尚未初始化".to_string()))
    }
}

#[async_trait]
impl KvBackend for SledKvBackend {
    async fn init(&self) -> Result<()> {
        self.handles.get_or_try_init(|| self.open()).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let tree = &self.handles()?.tree;
        let value = tree
            .get(key)
            .map_err(|e| SyncSDKError::KvStore(format!("获取键值对失败: {}", e)))?;
        Ok(value.map(|v| v.to_vec()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let tree = &self.handles()?.tree;
        tree.insert(key, value)
            .map_err(|e| SyncSDKError::KvStore(format!("设置键值对失败: {}", e)))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let tree = &self.handles()?.tree;
        tree.remove(key)
            .map_err(|e| SyncSDKError::KvStore(format!("删除键值对失败: {}", e)))?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let tree = &self.handles()?.tree;
        let mut results = Vec::new();

        for item in tree.scan_prefix(prefix) {
            let (key, value) =
                item.map_err(|e| SyncSDKError::KvStore(format!("扫描前缀失败: {}", e)))?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| SyncSDKError::KvStore(format!("键不是合法 UTF-8: {}", e)))?;
            results.push((key, value.to_vec()));
        }

        Ok(results)
    }

    async fn count_prefix(&self, prefix: &str) -> Result<usize> {
        let tree = &self.handles()?.tree;
        let mut count = 0;
        for item in tree.scan_prefix(prefix).keys() {
            item.map_err(|e| SyncSDKError::KvStore(format!("扫描前缀失败: {}", e)))?;
            count += 1;
        }
        Ok(count)
    }

    async fn generate_id(&self) -> Result<u64> {
        let db = &self.handles()?.db;
        db.generate_id()
            .map_err(|e| SyncSDKError::KvStore(format!("生成 ID 失败: {}", e)))
    }

    async fn flush(&self) -> Result<()> {
        let tree = &self.handles()?.tree;
        tree.flush_async()
            .await
            .map_err(|e| SyncSDKError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }
}

/// 内存 KV 存储
///
/// `unavailable()` 构造的实例在 `init` 时失败，用来模拟浏览器/设备拒绝本地存储。
#[derive(Debug)]
pub struct MemoryKvBackend {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    next_id: AtomicU64,
    available: bool,
    fail_writes: AtomicBool,
}

impl MemoryKvBackend {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            available: true,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// 初始化总是失败的后端
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    /// 打开后让所有写操作失败（磁盘满、配额用尽等）
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(SyncSDKError::KvStore("存储不可用".to_string()))
        }
    }

    fn check_writable(&self) -> Result<()> {
        self.check_available()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            warn!("memory backend rejecting write");
            return Err(SyncSDKError::KvStore("写入被拒绝".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryKvBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for MemoryKvBackend {
    async fn init(&self) -> Result<()> {
        self.check_available()
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        Ok(self.data.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check_writable()?;
        self.data.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.check_writable()?;
        self.data.write().remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.check_available()?;
        let data = self.data.read();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn generate_id(&self) -> Result<u64> {
        self.check_available()?;
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn flush(&self) -> Result<()> {
        self.check_available()
    }
}
