use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncSDKError};

/// 变更操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOperation {
    Insert,
    Update,
    Delete,
}

impl MutationOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOperation::Insert => "insert",
            MutationOperation::Update => "update",
            MutationOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationOperation {
    type Err = SyncSDKError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(MutationOperation::Insert),
            "update" => Ok(MutationOperation::Update),
            "delete" => Ok(MutationOperation::Delete),
            other => Err(SyncSDKError::InvalidArgument(format!(
                "未知的操作类型: {:?}（只允许 insert/update/delete）",
                other
            ))),
        }
    }
}

/// 待同步的本地变更
///
/// 入队后只有 `attempts` 会变化；`payload` 对队列是不透明的，原样交给远端。
/// 回放顺序由 `sequence` 决定，它在入队时由存储后端单调分配。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    id: String,
    sequence: u64,
    table: String,
    operation: MutationOperation,
    payload: serde_json::Value,
    enqueued_at: i64,
    attempts: u32,
}

impl QueuedMutation {
    pub(crate) fn new(
        sequence: u64,
        table: String,
        operation: MutationOperation,
        payload: serde_json::Value,
        enqueued_at: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sequence,
            table,
            operation,
            payload,
            enqueued_at,
            attempts: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn operation(&self) -> MutationOperation {
        self.operation
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn enqueued_at(&self) -> i64 {
        self.enqueued_at
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    /// 入队后等待了多久（毫秒）
    pub fn age_ms(&self, now_millis: i64) -> i64 {
        (now_millis - self.enqueued_at).max(0)
    }
}

/// 校验表名：非空，且不含键分隔符
pub(crate) fn validate_table(table: &str) -> Result<()> {
    if table.trim().is_empty() {
        return Err(SyncSDKError::InvalidArgument("table 不能为空".to_string()));
    }
    if table.contains(':') {
        return Err(SyncSDKError::InvalidArgument(format!(
            "table 名不能包含 ':': {}",
            table
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_parse() {
        assert_eq!("insert".parse::<MutationOperation>().unwrap(), MutationOperation::Insert);
        assert_eq!("update".parse::<MutationOperation>().unwrap(), MutationOperation::Update);
        assert_eq!("delete".parse::<MutationOperation>().unwrap(), MutationOperation::Delete);

        let err = "upsert".parse::<MutationOperation>().unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_operation_serde_is_lowercase() {
        assert_eq!(serde_json::to_string(&MutationOperation::Delete).unwrap(), "\"delete\"");
    }

    #[test]
    fn test_mutation_attempts() {
        let mut m = QueuedMutation::new(
            7,
            "tasks".to_string(),
            MutationOperation::Update,
            json!({"id": "t1", "status": "complete"}),
            1_000,
        );
        assert_eq!(m.attempts(), 0);
        assert_eq!(m.sequence(), 7);
        m.record_attempt();
        m.record_attempt();
        assert_eq!(m.attempts(), 2);
        assert_eq!(m.age_ms(1_500), 500);
        assert_eq!(m.age_ms(500), 0);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = QueuedMutation::new(1, "tasks".into(), MutationOperation::Insert, json!({}), 0);
        let b = QueuedMutation::new(2, "tasks".into(), MutationOperation::Insert, json!({}), 0);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_validate_table() {
        assert!(validate_table("policies").is_ok());
        assert!(validate_table("").is_err());
        assert!(validate_table("  ").is_err());
        assert!(validate_table("a:b").is_err());
    }
}
