//! 远端写入接口
//!
//! 队列本身不知道后端长什么样，只通过 [`RemoteApply`] 把一条变更交给后端数据层。
//! 实现必须可以安全重试：队列提供的是至少一次（at-least-once）而非恰好一次的投递，
//! 若服务端已落库但确认在返回途中丢失，同一条变更会在下一轮再次提交。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::queue::mutation::{MutationOperation, QueuedMutation};
use crate::storage::queue::retry_policy::ApplyFailure;

/// 提交给远端的一条写入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyRequest {
    pub table: String,
    pub operation: MutationOperation,
    pub payload: serde_json::Value,
}

impl ApplyRequest {
    pub fn new(table: impl Into<String>, operation: MutationOperation, payload: serde_json::Value) -> Self {
        Self {
            table: table.into(),
            operation,
            payload,
        }
    }
}

impl From<&QueuedMutation> for ApplyRequest {
    fn from(mutation: &QueuedMutation) -> Self {
        Self {
            table: mutation.table().to_string(),
            operation: mutation.operation(),
            payload: mutation.payload().clone(),
        }
    }
}

/// 远端写入函数，由宿主应用的数据访问层实现
#[async_trait]
pub trait RemoteApply: Send + Sync {
    /// 执行一次写入，`Ok(())` 表示远端已确认
    async fn apply(&self, request: &ApplyRequest) -> std::result::Result<(), ApplyFailure>;

    /// 入队前校验载荷，返回错误表示调用方的编程错误
    ///
    /// 默认不做任何检查。
    fn validate(&self, _request: &ApplyRequest) -> Result<()> {
        Ok(())
    }
}
