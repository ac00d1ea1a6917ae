//! 离线写入与恢复在线回放演示
//!
//! 本示例模拟一台诊所终端：断网时记录任务和审计变更，恢复网络后自动回放。

use async_trait::async_trait;
use complisync_sdk::{
    init_tracing, ApplyFailure, ApplyRequest, ManualNetworkStatusListener, MutationOperation,
    NetworkStatus, OfflineSyncSDK, RemoteApply, SyncConfig,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// 打印请求的远端；`audits` 表第一次写入会失败
#[derive(Default)]
struct ConsoleRemote {
    audits_failed_once: AtomicBool,
}

#[async_trait]
impl RemoteApply for ConsoleRemote {
    async fn apply(&self, request: &ApplyRequest) -> Result<(), ApplyFailure> {
        sleep(Duration::from_millis(50)).await;
        if request.table == "audits" && !self.audits_failed_once.swap(true, Ordering::SeqCst) {
            println!("  ❌ {} {} -> 503", request.operation, request.table);
            return Err(ApplyFailure::ServerError(503));
        }
        println!("  ✅ {} {} {}", request.operation, request.table, request.payload);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(false);

    let data_dir = tempfile::tempdir()?;
    let config = SyncConfig::builder()
        .data_dir(data_dir.path())
        .namespace("demo-practice")
        .poll_interval_ms(500)
        .build();

    let network = Arc::new(ManualNetworkStatusListener::new(NetworkStatus::Offline));
    let sdk = OfflineSyncSDK::initialize(config, Arc::new(ConsoleRemote::default()), network.clone()).await?;

    let _listener = sdk.on_sync_complete(|summary| {
        println!("📊 本轮回放: synced={}, failed={}", summary.synced, summary.failed);
    });

    println!("\n📴 离线记录变更");
    sdk.queue_mutation(
        "tasks",
        MutationOperation::Update,
        json!({"id": "t1", "status": "complete"}),
    )
    .await?;
    sdk.queue_mutation(
        "audits",
        MutationOperation::Insert,
        json!({"id": "a7", "kind": "fire_safety", "score": 92}),
    )
    .await?;
    sdk.queue_mutation("policies", MutationOperation::Delete, json!({"id": "p-old"}))
        .await?;
    println!("  待同步: {}", sdk.pending_count());

    println!("\n📶 恢复在线");
    network.push(NetworkStatus::Online).await;

    // 失败的那条会在退避后由轮询自动重试
    for _ in 0..50 {
        if sdk.pending_count() == 0 && !sdk.is_syncing() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }

    println!("\n📋 最终状态: {:?}", sdk.status());
    sdk.shutdown().await?;
    Ok(())
}
