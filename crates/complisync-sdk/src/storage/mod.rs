//! 存储模块 - 离线同步的数据持久化层
//!
//! 分层：
//! - KvBackend: 底层 KV 存储（sled / 内存）
//! - LocalStore: 读缓存、同步时间、待同步日志
//! - queue: 待同步队列与回放

pub mod kv;
pub mod local_store;
pub mod queue;

pub use kv::{KvBackend, MemoryKvBackend, SledKvBackend};
pub use local_store::LocalStore;
