use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 远端写入失败原因分类
///
/// 分类只影响日志和退避节奏：无论哪种原因，变更都会留在日志里等待下一轮回放。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ApplyFailure {
    /// 超时
    Timeout,
    /// 网络不可用、连接被拒绝等
    Network(String),
    /// 服务端 5xx
    ServerError(u16),
    /// 服务端拒绝（4xx）
    Rejected(u16),
    /// 载荷无法映射为远端请求
    InvalidPayload(String),
    /// 未知错误
    Unknown(String),
}

impl ApplyFailure {
    /// 重试是否有可能成功
    pub fn is_retryable(&self) -> bool {
        match self {
            ApplyFailure::Timeout => true,
            ApplyFailure::Network(_) => true,
            ApplyFailure::ServerError(_) => true,
            // 408 请求超时、429 限流可以重试，其余 4xx 需要人工处理
            ApplyFailure::Rejected(code) => *code == 408 || *code == 429,
            ApplyFailure::InvalidPayload(_) => false,
            ApplyFailure::Unknown(_) => true,
        }
    }

    /// 根据 HTTP 状态码分类
    pub fn from_status(status: u16) -> Self {
        if status >= 500 {
            ApplyFailure::ServerError(status)
        } else {
            ApplyFailure::Rejected(status)
        }
    }
}

impl fmt::Display for ApplyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyFailure::Timeout => write!(f, "timeout"),
            ApplyFailure::Network(e) => write!(f, "network error: {}", e),
            ApplyFailure::ServerError(code) => write!(f, "server error {}", code),
            ApplyFailure::Rejected(code) => write!(f, "rejected with {}", code),
            ApplyFailure::InvalidPayload(e) => write!(f, "invalid payload: {}", e),
            ApplyFailure::Unknown(e) => write!(f, "unknown error: {}", e),
        }
    }
}

/// 自动重试的退避策略
///
/// 只作用于控制器的周期性自动回放；手动触发、重连和外部唤醒不受退避限制。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// 连续 `failed_passes` 轮回放有失败之后，下一次自动回放前的等待时间
    pub fn delay_for(&self, failed_passes: u32) -> Duration {
        if failed_passes == 0 {
            return Duration::ZERO;
        }

        // 基础延迟 = base_delay * (backoff_factor ^ (failed_passes - 1))
        let exponent = (failed_passes - 1).min(32) as f64;
        let base_delay = self.base_delay_ms as f64 * self.backoff_factor.powf(exponent);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let jitter = capped_delay * self.jitter_factor * (rand::random::<f64>() - 0.5);
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    /// 计算下一次自动回放的时间戳（毫秒）
    pub fn next_retry_at(&self, now_millis: i64, failed_passes: u32) -> i64 {
        now_millis + self.delay_for(failed_passes).as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_retryable() {
        assert!(ApplyFailure::Timeout.is_retryable());
        assert!(ApplyFailure::Network("refused".into()).is_retryable());
        assert!(ApplyFailure::ServerError(503).is_retryable());
        assert!(ApplyFailure::Rejected(429).is_retryable());
        assert!(!ApplyFailure::Rejected(404).is_retryable());
        assert!(!ApplyFailure::InvalidPayload("missing id".into()).is_retryable());
    }

    #[test]
    fn test_from_status() {
        assert_eq!(ApplyFailure::from_status(500), ApplyFailure::ServerError(500));
        assert_eq!(ApplyFailure::from_status(409), ApplyFailure::Rejected(409));
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(20), Duration::from_millis(30_000));
        assert_eq!(policy.next_retry_at(10_000, 1), 11_000);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let d = policy.delay_for(1).as_millis();
            assert!((950..=1050).contains(&d), "delay {} out of bounds", d);
        }
    }
}
