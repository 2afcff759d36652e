//! 推送分发器
//!
//! 按凭证形态把一组设备拆分到 Expo 和 Web Push 两个传输通道，
//! 返回与输入顺序一致的逐设备结果。单个 token 的失败只体现在结果里，从不向上抛出。

mod expo;
mod webpush;

pub use expo::{ExpoHttpClient, ExpoMessage, ExpoTicket, ExpoTicketDetails, ExpoTransport};
pub use webpush::{VapidWebPushClient, WebPushFailure, WebPushTransport, classify_error};

#[cfg(test)]
pub use expo::MockExpoTransport;
#[cfg(test)]
pub use webpush::MockWebPushTransport;

use std::sync::Arc;
use std::time::Instant;

use notify_shared::observability::metrics;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{DeviceTarget, LocalizedText, Priority, PushCredential, WebPushSubscription};

/// Expo 单批最大 token 数
pub const DEFAULT_EXPO_BATCH_SIZE: usize = 100;

/// 待推送的消息内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub title: LocalizedText,
    pub body: LocalizedText,
    pub data: serde_json::Value,
    pub priority: Priority,
}

/// 单个设备的投递结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success { ticket_id: Option<String> },
    Failure { reason: String },
    /// token 已失效，调用方应停用该设备
    Expired { reason: String },
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Failure { .. } => "failure",
            Self::Expired { .. } => "expired",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { reason } | Self::Expired { reason } => Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub device_id: String,
    pub channel: &'static str,
    pub outcome: DeliveryOutcome,
}

impl DeliveryResult {
    fn new(target: &DeviceTarget, outcome: DeliveryOutcome) -> Self {
        Self {
            device_id: target.device_id.clone(),
            channel: target.credential.channel(),
            outcome,
        }
    }
}

/// 推送分发器
pub struct Dispatcher {
    expo: Arc<dyn ExpoTransport>,
    web_push: Option<Arc<dyn WebPushTransport>>,
    batch_size: usize,
    default_language: String,
}

impl Dispatcher {
    pub fn new(
        expo: Arc<dyn ExpoTransport>,
        web_push: Option<Arc<dyn WebPushTransport>>,
        batch_size: usize,
        default_language: &str,
    ) -> Self {
        Self {
            expo,
            web_push,
            batch_size: batch_size.clamp(1, DEFAULT_EXPO_BATCH_SIZE),
            default_language: default_language.to_string(),
        }
    }

    pub fn with_defaults(expo: Arc<dyn ExpoTransport>) -> Self {
        Self::new(expo, None, DEFAULT_EXPO_BATCH_SIZE, "vi")
    }

    /// 向一组设备推送同一条消息
    ///
    /// 结果与 `targets` 一一对应；某一批 Expo 请求整体失败时该批所有 token 记为失败。
    pub async fn send(&self, targets: &[DeviceTarget], message: &PushMessage) -> Vec<DeliveryResult> {
        let mut results: Vec<Option<DeliveryResult>> = vec![None; targets.len()];
        let mut expo_indices = Vec::new();
        let mut web_indices = Vec::new();

        for (idx, target) in targets.iter().enumerate() {
            match &target.credential {
                PushCredential::Expo(_) => expo_indices.push(idx),
                PushCredential::WebPush(_) => web_indices.push(idx),
                PushCredential::Unrecognized(_) => {
                    results[idx] = Some(DeliveryResult::new(
                        target,
                        DeliveryOutcome::Failure {
                            reason: "unrecognized token format".to_string(),
                        },
                    ));
                }
            }
        }

        for chunk in expo_indices.chunks(self.batch_size) {
            for (idx, outcome) in self.send_expo_batch(targets, chunk, message).await {
                results[idx] = Some(DeliveryResult::new(&targets[idx], outcome));
            }
        }

        for idx in web_indices {
            let outcome = self.send_web_push(&targets[idx], message).await;
            results[idx] = Some(DeliveryResult::new(&targets[idx], outcome));
        }

        results
            .into_iter()
            .zip(targets)
            .map(|(result, target)| {
                result.unwrap_or_else(|| {
                    DeliveryResult::new(
                        target,
                        DeliveryOutcome::Failure {
                            reason: "no delivery attempted".to_string(),
                        },
                    )
                })
            })
            .inspect(|r| metrics::record_push_delivery(r.channel, r.outcome.as_str()))
            .collect()
    }

    async fn send_expo_batch(
        &self,
        targets: &[DeviceTarget],
        indices: &[usize],
        message: &PushMessage,
    ) -> Vec<(usize, DeliveryOutcome)> {
        let messages: Vec<ExpoMessage> = indices
            .iter()
            .filter_map(|&idx| {
                let target = &targets[idx];
                let PushCredential::Expo(token) = &target.credential else {
                    return None;
                };
                Some(self.expo_message(token, target.language.as_deref(), message))
            })
            .collect();

        let started = Instant::now();
        let response = self.expo.send_batch(&messages).await;
        metrics::record_push_batch("expo", started.elapsed().as_secs_f64());

        match response {
            Ok(tickets) => {
                if tickets.len() != indices.len() {
                    warn!(
                        expected = indices.len(),
                        received = tickets.len(),
                        "Expo ticket 数量与请求不一致"
                    );
                }
                indices
                    .iter()
                    .enumerate()
                    .map(|(pos, &idx)| {
                        let outcome = match tickets.get(pos) {
                            Some(ticket) if ticket.is_ok() => DeliveryOutcome::Success {
                                ticket_id: ticket.id.clone(),
                            },
                            Some(ticket) if ticket.is_device_not_registered() => {
                                DeliveryOutcome::Expired {
                                    reason: ticket.error_reason(),
                                }
                            }
                            Some(ticket) => DeliveryOutcome::Failure {
                                reason: ticket.error_reason(),
                            },
                            None => DeliveryOutcome::Failure {
                                reason: "missing expo ticket".to_string(),
                            },
                        };
                        (idx, outcome)
                    })
                    .collect()
            }
            Err(e) => {
                warn!(batch = indices.len(), error = %e, "Expo 批量推送失败");
                let reason = e.to_string();
                indices
                    .iter()
                    .map(|&idx| {
                        (
                            idx,
                            DeliveryOutcome::Failure {
                                reason: reason.clone(),
                            },
                        )
                    })
                    .collect()
            }
        }
    }

    fn expo_message(&self, token: &str, language: Option<&str>, message: &PushMessage) -> ExpoMessage {
        let priority = match message.priority {
            Priority::High | Priority::Urgent => "high",
            Priority::Medium | Priority::Low => "default",
        };
        ExpoMessage {
            to: token.to_string(),
            title: message
                .title
                .resolve(language, &self.default_language)
                .to_string(),
            body: message
                .body
                .resolve(language, &self.default_language)
                .to_string(),
            data: message.data.clone(),
            sound: Some("default".to_string()),
            priority: priority.to_string(),
        }
    }

    async fn send_web_push(&self, target: &DeviceTarget, message: &PushMessage) -> DeliveryOutcome {
        let PushCredential::WebPush(subscription) = &target.credential else {
            return DeliveryOutcome::Failure {
                reason: "not a web push subscription".to_string(),
            };
        };
        let Some(transport) = &self.web_push else {
            return DeliveryOutcome::Failure {
                reason: "web push is not configured".to_string(),
            };
        };

        let payload = self.web_payload(target.language.as_deref(), message);
        let started = Instant::now();
        let result = transport.send(subscription, &payload).await;
        metrics::record_push_batch("web_push", started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                debug!(device_id = %target.device_id, endpoint = %short_endpoint(subscription), "Web Push 已发送");
                DeliveryOutcome::Success { ticket_id: None }
            }
            Err(WebPushFailure::Expired(reason)) => DeliveryOutcome::Expired { reason },
            Err(WebPushFailure::Failed(reason)) => DeliveryOutcome::Failure { reason },
        }
    }

    fn web_payload(&self, language: Option<&str>, message: &PushMessage) -> Vec<u8> {
        serde_json::json!({
            "title": message.title.resolve(language, &self.default_language),
            "body": message.body.resolve(language, &self.default_language),
            "data": message.data,
        })
        .to_string()
        .into_bytes()
    }
}

fn short_endpoint(subscription: &WebPushSubscription) -> &str {
    let end = subscription
        .endpoint
        .char_indices()
        .nth(48)
        .map(|(i, _)| i)
        .unwrap_or(subscription.endpoint.len());
    &subscription.endpoint[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotificationError;
    use crate::models::WebPushKeys;

    fn expo(id: &str, n: usize) -> DeviceTarget {
        DeviceTarget::new(id, PushCredential::Expo(format!("ExponentPushToken[{n}]")))
    }

    fn web(id: &str) -> DeviceTarget {
        DeviceTarget::new(
            id,
            PushCredential::WebPush(WebPushSubscription {
                endpoint: "https://push.example.com/sub/1".to_string(),
                keys: WebPushKeys {
                    p256dh: "p".to_string(),
                    auth: "a".to_string(),
                },
                expiration_time: None,
            }),
        )
    }

    fn message() -> PushMessage {
        PushMessage {
            title: LocalizedText::localized([("vi", "Chào"), ("en", "Hello")]),
            body: "body".into(),
            data: serde_json::json!({"notificationId": "n1"}),
            priority: Priority::High,
        }
    }

    #[tokio::test]
    async fn test_results_follow_input_order() {
        let mut transport = MockExpoTransport::new();
        transport.expect_send_batch().times(1).returning(|msgs| {
            assert_eq!(msgs.len(), 2);
            Ok(vec![
                ExpoTicket::ok("t-1"),
                ExpoTicket::error("gone", Some("DeviceNotRegistered")),
            ])
        });

        let dispatcher = Dispatcher::with_defaults(Arc::new(transport));
        let targets = vec![
            expo("a", 1),
            DeviceTarget::new("b", PushCredential::Unrecognized("junk".to_string())),
            expo("c", 2),
        ];
        let results = dispatcher.send(&targets, &message()).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].device_id, "a");
        assert_eq!(
            results[0].outcome,
            DeliveryOutcome::Success {
                ticket_id: Some("t-1".to_string())
            }
        );
        assert!(matches!(results[1].outcome, DeliveryOutcome::Failure { .. }));
        assert!(matches!(results[2].outcome, DeliveryOutcome::Expired { .. }));
    }

    #[tokio::test]
    async fn test_mixed_credentials_yield_one_result_each_in_order() {
        let mut expo_transport = MockExpoTransport::new();
        expo_transport.expect_send_batch().times(1).returning(|msgs| {
            assert_eq!(msgs.len(), 2);
            Ok(vec![ExpoTicket::ok("t-1"), ExpoTicket::ok("t-2")])
        });
        let mut web_transport = MockWebPushTransport::new();
        web_transport.expect_send().times(2).returning(|_, _| Ok(()));

        let dispatcher = Dispatcher::new(
            Arc::new(expo_transport),
            Some(Arc::new(web_transport)),
            100,
            "vi",
        );
        let targets = vec![
            web("w1"),
            expo("e1", 1),
            DeviceTarget::new("x1", PushCredential::Unrecognized("junk".to_string())),
            web("w2"),
            expo("e2", 2),
        ];
        let results = dispatcher.send(&targets, &message()).await;

        assert_eq!(results.len(), targets.len());
        let ids: Vec<&str> = results.iter().map(|r| r.device_id.as_str()).collect();
        assert_eq!(ids, vec!["w1", "e1", "x1", "w2", "e2"]);
        let channels: Vec<&str> = results.iter().map(|r| r.channel).collect();
        assert_eq!(
            channels,
            vec!["web_push", "expo", "unrecognized", "web_push", "expo"]
        );
        assert_eq!(
            results[4].outcome,
            DeliveryOutcome::Success {
                ticket_id: Some("t-2".to_string())
            }
        );
        assert!(matches!(results[2].outcome, DeliveryOutcome::Failure { .. }));
        assert!(results[0].outcome.is_success() && results[3].outcome.is_success());
    }

    #[tokio::test]
    async fn test_expo_batches_of_configured_size() {
        let mut transport = MockExpoTransport::new();
        transport
            .expect_send_batch()
            .times(3)
            .returning(|msgs| Ok(msgs.iter().map(|_| ExpoTicket::ok("t")).collect()));

        let dispatcher = Dispatcher::new(Arc::new(transport), None, 2, "vi");
        let targets: Vec<_> = (0..5).map(|n| expo(&format!("d{n}"), n)).collect();
        let results = dispatcher.send(&targets, &message()).await;
        assert!(results.iter().all(|r| r.outcome.is_success()));
    }

    #[tokio::test]
    async fn test_failed_batch_fails_every_token_in_it() {
        let mut transport = MockExpoTransport::new();
        transport.expect_send_batch().returning(|_| {
            Err(NotificationError::Delivery {
                channel: "expo".to_string(),
                reason: "503".to_string(),
            })
        });

        let dispatcher = Dispatcher::with_defaults(Arc::new(transport));
        let results = dispatcher.send(&[expo("a", 1), expo("b", 2)], &message()).await;
        assert!(results
            .iter()
            .all(|r| matches!(r.outcome, DeliveryOutcome::Failure { .. })));
    }

    #[tokio::test]
    async fn test_message_uses_device_language() {
        let mut transport = MockExpoTransport::new();
        transport.expect_send_batch().returning(|msgs| {
            assert_eq!(msgs[0].title, "Hello");
            assert_eq!(msgs[0].priority, "high");
            Ok(vec![ExpoTicket::ok("t")])
        });

        let dispatcher = Dispatcher::with_defaults(Arc::new(transport));
        let mut target = expo("a", 1);
        target.language = Some("en".to_string());
        dispatcher.send(&[target], &message()).await;
    }

    #[tokio::test]
    async fn test_web_push_expired_and_unconfigured() {
        let mut web_transport = MockWebPushTransport::new();
        web_transport
            .expect_send()
            .returning(|_, _| Err(WebPushFailure::Expired("410 Gone".to_string())));

        let dispatcher = Dispatcher::new(
            Arc::new(MockExpoTransport::new()),
            Some(Arc::new(web_transport)),
            100,
            "vi",
        );
        let results = dispatcher.send(&[web("w1")], &message()).await;
        assert_eq!(results[0].channel, "web_push");
        assert!(matches!(results[0].outcome, DeliveryOutcome::Expired { .. }));

        let dispatcher = Dispatcher::with_defaults(Arc::new(MockExpoTransport::new()));
        let results = dispatcher.send(&[web("w1")], &message()).await;
        assert!(matches!(results[0].outcome, DeliveryOutcome::Failure { .. }));
    }
}
