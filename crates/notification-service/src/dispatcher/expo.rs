//! Expo 推送传输
//!
//! 通过 Expo Push API 批量发送，单批最多 100 个 token。
//! 每个 token 对应响应中的一张 ticket，`DeviceNotRegistered` 表示 token 已失效。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{NotificationError, Result};

/// Expo 单条推送消息
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpoMessage {
    pub to: String,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    pub sound: Option<String>,
    /// default / normal / high
    pub priority: String,
}

/// Expo 返回的 ticket
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExpoTicket {
    pub status: String,
    pub id: Option<String>,
    pub message: Option<String>,
    pub details: Option<ExpoTicketDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExpoTicketDetails {
    pub error: Option<String>,
}

impl ExpoTicket {
    pub fn ok(id: &str) -> Self {
        Self {
            status: "ok".to_string(),
            id: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn error(message: &str, code: Option<&str>) -> Self {
        Self {
            status: "error".to_string(),
            id: None,
            message: Some(message.to_string()),
            details: Some(ExpoTicketDetails {
                error: code.map(str::to_string),
            }),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    /// token 已失效，设备应被停用
    pub fn is_device_not_registered(&self) -> bool {
        self.details
            .as_ref()
            .and_then(|d| d.error.as_deref())
            .is_some_and(|e| e == "DeviceNotRegistered")
    }

    pub fn error_reason(&self) -> String {
        self.details
            .as_ref()
            .and_then(|d| d.error.clone())
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "unknown expo error".to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ExpoResponse {
    #[serde(default)]
    data: Vec<ExpoTicket>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

/// Expo 传输接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExpoTransport: Send + Sync {
    /// 发送一批消息，返回与输入一一对应的 ticket
    async fn send_batch(&self, messages: &[ExpoMessage]) -> Result<Vec<ExpoTicket>>;
}

/// 基于 reqwest 的 Expo HTTP 客户端
pub struct ExpoHttpClient {
    client: reqwest::Client,
    endpoint: String,
    access_token: Option<String>,
}

impl ExpoHttpClient {
    pub fn new(endpoint: &str, access_token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| delivery_error(format!("创建 HTTP 客户端失败: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            access_token,
        })
    }
}

fn delivery_error(reason: String) -> NotificationError {
    NotificationError::Delivery {
        channel: "expo".to_string(),
        reason,
    }
}

#[async_trait]
impl ExpoTransport for ExpoHttpClient {
    async fn send_batch(&self, messages: &[ExpoMessage]) -> Result<Vec<ExpoTicket>> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Accept", "application/json")
            .json(messages);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| delivery_error(format!("请求 Expo 失败: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(delivery_error(format!("Expo 返回 {status}: {body}")));
        }

        let parsed: ExpoResponse = response
            .json()
            .await
            .map_err(|e| delivery_error(format!("解析 Expo 响应失败: {e}")))?;

        if parsed.data.is_empty() && !parsed.errors.is_empty() {
            return Err(delivery_error(format!(
                "Expo 请求级错误: {}",
                serde_json::Value::Array(parsed.errors)
            )));
        }

        debug!(count = parsed.data.len(), "收到 Expo tickets");
        Ok(parsed.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_parsing() {
        let json = r#"{"data":[
            {"status":"ok","id":"XXXX-1"},
            {"status":"error","message":"not registered","details":{"error":"DeviceNotRegistered"}},
            {"status":"error","message":"too big","details":{"error":"MessageTooBig"}}
        ]}"#;
        let resp: ExpoResponse = serde_json::from_str(json).unwrap();
        assert!(resp.data[0].is_ok());
        assert!(resp.data[1].is_device_not_registered());
        assert!(!resp.data[2].is_device_not_registered());
        assert_eq!(resp.data[2].error_reason(), "MessageTooBig");
    }

    #[test]
    fn test_message_serialization() {
        let msg = ExpoMessage {
            to: "ExponentPushToken[a]".to_string(),
            title: "t".to_string(),
            body: "b".to_string(),
            data: serde_json::json!({"k": 1}),
            sound: Some("default".to_string()),
            priority: "high".to_string(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["to"], "ExponentPushToken[a]");
        assert_eq!(value["priority"], "high");
    }
}
