//! 时间工具模块
//!
//! 所有时间字段统一使用 UTC 毫秒时间戳（i64）。
//! 时钟通过 [`Clock`] 注入，测试中可以用 [`ManualClock`] 精确控制。

use chrono::{TimeZone, Utc};
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};

/// 时钟抽象
pub trait Clock: Send + Sync + Debug {
    /// 当前 UTC 毫秒时间戳
    fn now_millis(&self) -> i64;
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// 手动时钟，只在调用 `advance`/`set` 时前进
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    /// 前进 `delta_millis` 毫秒，返回前进后的时间
    pub fn advance(&self, delta_millis: i64) -> i64 {
        self.now.fetch_add(delta_millis, Ordering::SeqCst) + delta_millis
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// 将毫秒时间戳格式化为 RFC 3339（UTC），用于日志
pub fn format_millis(millis: i64) -> String {
    match Utc.timestamp_millis_opt(millis).single() {
        Some(dt) => dt.to_rfc3339(),
        None => format!("invalid({})", millis),
    }
}
