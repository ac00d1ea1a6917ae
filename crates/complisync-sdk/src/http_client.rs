//! HTTP 远端写入 - PostgREST 风格的 REST 接口
//!
//! 变更与请求的对应关系：
//! - insert → `POST /{table}`，请求体为完整载荷
//! - update → `PATCH /{table}?id=eq.{id}`，请求体为完整载荷
//! - delete → `DELETE /{table}?id=eq.{id}`
//!
//! 使用 reqwest 作为底层 HTTP 客户端。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use tracing::{debug, error, info};

use crate::error::{Result, SyncSDKError};
use crate::remote::{ApplyRequest, RemoteApply};
use crate::sdk::HttpClientConfig;
use crate::storage::queue::{ApplyFailure, MutationOperation};

/// 一次写入对应的 HTTP 请求
#[derive(Debug, Clone, PartialEq)]
pub struct RequestPlan {
    pub method: Method,
    /// 相对 base_url 的路径，如 `/tasks`
    pub path: String,
    /// PostgREST 过滤条件，如 `("id", "eq.t1")`
    pub filter: Option<(String, String)>,
    pub body: Option<serde_json::Value>,
}

/// 基于 HTTP 的远端写入实现
pub struct HttpRemoteApply {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    id_field: String,
}

impl std::fmt::Debug for HttpRemoteApply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemoteApply")
            .field("base_url", &self.base_url)
            .field("id_field", &self.id_field)
            .field("has_api_key", &self.api_key.is_some())
            .finish()
    }
}

impl HttpRemoteApply {
    /// 创建 HTTP 远端写入客户端
    pub fn new(config: &HttpClientConfig, base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(SyncSDKError::Config("base_url 不能为空".to_string()));
        }

        let mut builder = Client::builder().user_agent(crate::version::user_agent());
        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }
        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }
        let client = builder
            .build()
            .map_err(|e| SyncSDKError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!("✅ HTTP 远端写入客户端已创建 (base_url: {})", base_url);

        Ok(Self {
            client,
            base_url,
            api_key,
            id_field: "id".to_string(),
        })
    }

    /// 指定主键字段名（默认 `id`）
    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// 把一条写入映射成 HTTP 请求，不发起网络调用
    pub fn plan(&self, request: &ApplyRequest) -> std::result::Result<RequestPlan, ApplyFailure> {
        let path = format!("/{}", request.table);
        match request.operation {
            MutationOperation::Insert => Ok(RequestPlan {
                method: Method::POST,
                path,
                filter: None,
                body: Some(request.payload.clone()),
            }),
            MutationOperation::Update => Ok(RequestPlan {
                method: Method::PATCH,
                path,
                filter: Some(self.id_filter(request)?),
                body: Some(request.payload.clone()),
            }),
            MutationOperation::Delete => Ok(RequestPlan {
                method: Method::DELETE,
                path,
                filter: Some(self.id_filter(request)?),
                body: None,
            }),
        }
    }

    fn id_filter(&self, request: &ApplyRequest) -> std::result::Result<(String, String), ApplyFailure> {
        let id = match request.payload.get(&self.id_field) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => {
                return Err(ApplyFailure::InvalidPayload(format!(
                    "{} {} 缺少主键字段 `{}`",
                    request.operation, request.table, self.id_field
                )))
            }
        };
        Ok((self.id_field.clone(), format!("eq.{}", id)))
    }

    fn map_transport_error(e: reqwest::Error) -> ApplyFailure {
        if e.is_timeout() {
            ApplyFailure::Timeout
        } else if e.is_connect() || e.is_request() {
            ApplyFailure::Network(e.to_string())
        } else {
            ApplyFailure::Unknown(e.to_string())
        }
    }
}

#[async_trait]
impl RemoteApply for HttpRemoteApply {
    async fn apply(&self, request: &ApplyRequest) -> std::result::Result<(), ApplyFailure> {
        let plan = self.plan(request)?;
        let url = format!("{}{}", self.base_url, plan.path);
        debug!("➡️ {} {} {:?}", plan.method, url, plan.filter);

        let mut builder = self.client.request(plan.method.clone(), &url);
        if let Some((field, condition)) = &plan.filter {
            builder = builder.query(&[(field.as_str(), condition.as_str())]);
        }
        if let Some(api_key) = &self.api_key {
            builder = builder.header("apikey", api_key).bearer_auth(api_key);
        }
        if let Some(body) = &plan.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(Self::map_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "无法读取错误信息".to_string());
        error!(
            "❌ 远端写入失败: {} {} -> HTTP {} ({})",
            plan.method, url, status, error_text
        );
        Err(ApplyFailure::from_status(status.as_u16()))
    }

    fn validate(&self, request: &ApplyRequest) -> Result<()> {
        self.plan(request)
            .map(|_| ())
            .map_err(|e| SyncSDKError::InvalidArgument(e.to_string()))
    }
}
