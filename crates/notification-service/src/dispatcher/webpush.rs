//! Web Push 传输
//!
//! 使用 VAPID 签名，逐个订阅发送。端点返回 404/410 时视为订阅已失效。

use std::path::Path;

use async_trait::async_trait;
use web_push::{
    ContentEncoding, IsahcWebPushClient, PartialVapidSignatureBuilder, SubscriptionInfo,
    VapidSignatureBuilder, WebPushClient, WebPushError, WebPushMessageBuilder,
};

use crate::error::{NotificationError, Result};
use crate::models::WebPushSubscription;

/// 单次 Web Push 发送失败的分类
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebPushFailure {
    /// 订阅已失效，设备应被停用
    Expired(String),
    Failed(String),
}

/// Web Push 传输接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebPushTransport: Send + Sync {
    async fn send(
        &self,
        subscription: &WebPushSubscription,
        payload: &[u8],
    ) -> std::result::Result<(), WebPushFailure>;
}

/// 基于 VAPID 的 Web Push 客户端
pub struct VapidWebPushClient {
    client: IsahcWebPushClient,
    signer: PartialVapidSignatureBuilder,
    subject: String,
    ttl_secs: u32,
}

impl VapidWebPushClient {
    /// 从 PEM 私钥文件创建客户端
    pub fn from_pem_file(path: &Path, subject: &str, ttl_secs: u32) -> Result<Self> {
        let pem = std::fs::read(path).map_err(|e| config_error(format!("读取 VAPID 私钥失败: {e}")))?;
        let signer = VapidSignatureBuilder::from_pem_no_sub(pem.as_slice())
            .map_err(|e| config_error(format!("解析 VAPID 私钥失败: {e}")))?;
        let client =
            IsahcWebPushClient::new().map_err(|e| config_error(format!("创建 Web Push 客户端失败: {e}")))?;
        Ok(Self {
            client,
            signer,
            subject: subject.to_string(),
            ttl_secs,
        })
    }
}

fn config_error(reason: String) -> NotificationError {
    NotificationError::Delivery {
        channel: "web_push".to_string(),
        reason,
    }
}

/// 把 web-push 错误映射为失效或普通失败
pub fn classify_error(error: &WebPushError) -> WebPushFailure {
    match error {
        WebPushError::EndpointNotValid { .. } | WebPushError::EndpointNotFound { .. } => {
            WebPushFailure::Expired(format!("subscription expired: {error}"))
        }
        other => WebPushFailure::Failed(other.to_string()),
    }
}

#[async_trait]
impl WebPushTransport for VapidWebPushClient {
    async fn send(
        &self,
        subscription: &WebPushSubscription,
        payload: &[u8],
    ) -> std::result::Result<(), WebPushFailure> {
        let info = SubscriptionInfo::new(
            &subscription.endpoint,
            &subscription.keys.p256dh,
            &subscription.keys.auth,
        );

        let mut signature = self.signer.clone().add_sub_info(&info);
        signature.add_claim("sub", self.subject.as_str());
        let signature = signature
            .build()
            .map_err(|e| WebPushFailure::Failed(format!("VAPID 签名失败: {e}")))?;

        let mut builder = WebPushMessageBuilder::new(&info);
        builder.set_payload(ContentEncoding::Aes128Gcm, payload);
        builder.set_vapid_signature(signature);
        builder.set_ttl(self.ttl_secs);
        let message = builder
            .build()
            .map_err(|e| WebPushFailure::Failed(format!("构建 Web Push 消息失败: {e}")))?;

        self.client.send(message).await.map_err(|e| classify_error(&e))
    }
}
