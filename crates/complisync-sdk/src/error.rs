use thiserror::Error;

/// SDK 错误类型
///
/// 只有调用方的契约违规（参数非法）会以错误的形式从公开 API 抛出；
/// 存储与网络这类环境性失败在各自边界被吸收，体现为返回值或状态。
#[derive(Debug, Clone, Error)]
pub enum SyncSDKError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("KV store error: {0}")]
    KvStore(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    IO(String),
    #[error("Not initialized: {0}")]
    NotInitialized(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Config error: {0}")]
    Config(String),
    /// 运行时错误（例如同步任务 panic）
    #[error("Runtime error: {0}")]
    Runtime(String),
    #[error("Shutting down: {0}")]
    ShuttingDown(String),
}

impl From<serde_json::Error> for SyncSDKError {
    fn from(error: serde_json::Error) -> Self {
        SyncSDKError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for SyncSDKError {
    fn from(error: std::io::Error) -> Self {
        SyncSDKError::IO(error.to_string())
    }
}

impl From<sled::Error> for SyncSDKError {
    fn from(error: sled::Error) -> Self {
        SyncSDKError::KvStore(error.to_string())
    }
}

impl From<reqwest::Error> for SyncSDKError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            SyncSDKError::Timeout(error.to_string())
        } else {
            SyncSDKError::Transport(error.to_string())
        }
    }
}

impl SyncSDKError {
    /// 是否为调用方的编程错误（唯一允许向外抛出的一类）
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, SyncSDKError::InvalidArgument(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncSDKError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = SyncSDKError::InvalidArgument("table 不能为空".to_string());
        assert_eq!(e.to_string(), "Invalid argument: table 不能为空");
        assert!(e.is_contract_violation());
        assert!(!SyncSDKError::KvStore("x".into()).is_contract_violation());
    }

    #[test]
    fn test_from_serde_json() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let e: SyncSDKError = err.into();
        assert!(matches!(e, SyncSDKError::Serialization(_)));
    }
}
