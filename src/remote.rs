//! 远端存储接口
//!
//! 同步引擎只通过 [`RemoteStore`] 访问权威存储，通过 [`IdentityProvider`] 获取当前用户。
//! [`HttpRemoteStore`] 是基于 HTTP 同步接口的实现。

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::RwLock;
use thiserror::Error;

use crate::config::SyncConfig;
use crate::storage::{EntityType, NaturalKey};

/// 远端调用错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("网络错误: {0}")]
    Network(String),

    #[error("数据校验失败: {0}")]
    Validation(String),

    #[error("远端冲突: {0}")]
    Conflict(String),

    #[error("远端记录不存在: {0}")]
    NotFound(String),

    #[error("序列化错误: {0}")]
    Serialization(String),
}

/// 远端记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    #[serde(rename = "id")]
    pub remote_id: String,
    pub fields: Value,
}

/// 权威远端存储
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 按业务唯一键（含 user_id）查找
    async fn find_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<RemoteRecord>, RemoteError>;

    async fn insert(
        &self,
        entity_type: EntityType,
        fields: &Value,
    ) -> Result<RemoteRecord, RemoteError>;

    async fn update(
        &self,
        entity_type: EntityType,
        remote_id: &str,
        patch: &Value,
    ) -> Result<(), RemoteError>;

    /// 按业务唯一键删除，记录不存在时返回 `RemoteError::NotFound`
    async fn delete(&self, key: &NaturalKey) -> Result<(), RemoteError>;
}

/// 当前登录用户
pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> Option<String>;
}

/// 由宿主应用在登录/登出时更新的身份
#[derive(Debug, Default)]
pub struct SessionIdentity {
    user_id: RwLock<Option<String>>,
}

impl SessionIdentity {
    pub fn new(user_id: Option<String>) -> Self {
        Self {
            user_id: RwLock::new(user_id),
        }
    }

    pub fn set(&self, user_id: Option<String>) {
        if let Ok(mut guard) = self.user_id.write() {
            *guard = user_id;
        }
    }
}

impl IdentityProvider for SessionIdentity {
    fn current_user_id(&self) -> Option<String> {
        self.user_id.read().ok().and_then(|guard| guard.clone())
    }
}

// ============================================================
// HttpRemoteStore
// ============================================================

/// 基于 `/api/sync/{table}` 接口的远端存储
pub struct HttpRemoteStore {
    client: Client,
    api_base_url: String,
    auth_token: Option<String>,
}

impl HttpRemoteStore {
    pub fn new(config: &SyncConfig) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RemoteError::Network(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
        })
    }

    fn collection_url(&self, entity_type: EntityType) -> String {
        format!("{}/api/sync/{}", self.api_base_url, entity_type.table_name())
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, RemoteError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, body))
    }
}

fn status_error(status: StatusCode, body: String) -> RemoteError {
    let message = if body.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, body)
    };

    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            RemoteError::Validation(message)
        }
        StatusCode::NOT_FOUND => RemoteError::NotFound(message),
        StatusCode::CONFLICT => RemoteError::Conflict(message),
        _ => RemoteError::Network(message),
    }
}

fn query_pairs(key: &NaturalKey) -> Vec<(String, String)> {
    key.fields
        .iter()
        .map(|(name, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (name.clone(), value)
        })
        .collect()
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn find_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<RemoteRecord>, RemoteError> {
        let request = self
            .client
            .get(self.collection_url(key.entity_type))
            .query(&query_pairs(key));

        let response = match self.send(request).await {
            Ok(response) => response,
            Err(RemoteError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut records: Vec<RemoteRecord> = response
            .json()
            .await
            .map_err(|e| RemoteError::Serialization(e.to_string()))?;

        if records.is_empty() {
            Ok(None)
        } else {
            Ok(Some(records.swap_remove(0)))
        }
    }

    async fn insert(
        &self,
        entity_type: EntityType,
        fields: &Value,
    ) -> Result<RemoteRecord, RemoteError> {
        let request = self.client.post(self.collection_url(entity_type)).json(fields);

        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Serialization(e.to_string()))
    }

    async fn update(
        &self,
        entity_type: EntityType,
        remote_id: &str,
        patch: &Value,
    ) -> Result<(), RemoteError> {
        let url = format!("{}/{}", self.collection_url(entity_type), remote_id);
        self.send(self.client.patch(url).json(patch)).await?;
        Ok(())
    }

    async fn delete(&self, key: &NaturalKey) -> Result<(), RemoteError> {
        let request = self
            .client
            .delete(self.collection_url(key.entity_type))
            .query(&query_pairs(key));

        self.send(request).await?;
        Ok(())
    }
}
