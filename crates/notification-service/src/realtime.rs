//! 实时事件发布
//!
//! 通知创建后向 socket 层广播一条简短事件，socket 层本身不在本服务内。

use async_trait::async_trait;
use notify_shared::redis_client::RedisClient;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

/// 发布到实时频道的事件
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeEvent<'a> {
    pub event: &'static str,
    pub notification_id: Uuid,
    pub recipients: &'a [String],
}

/// 实时事件出口，发布失败只记录日志
#[async_trait]
pub trait RealtimeSink: Send + Sync {
    async fn notification_created(&self, notification_id: Uuid, recipients: &[String]);
}

/// 通过 Redis pub/sub 发布
pub struct RedisRealtimeSink {
    redis: RedisClient,
    channel: String,
}

impl RedisRealtimeSink {
    pub fn new(redis: RedisClient, channel: &str) -> Self {
        Self {
            redis,
            channel: channel.to_string(),
        }
    }
}

#[async_trait]
impl RealtimeSink for RedisRealtimeSink {
    async fn notification_created(&self, notification_id: Uuid, recipients: &[String]) {
        let event = RealtimeEvent {
            event: "new_notification",
            notification_id,
            recipients,
        };
        let payload = match serde_json::to_string(&event) {
            Ok(p) => p,
            Err(e) => {
                warn!(%notification_id, error = %e, "实时事件序列化失败");
                return;
            }
        };
        match self.redis.publish(&self.channel, &payload).await {
            Ok(receivers) => debug!(%notification_id, receivers, "实时事件已发布"),
            Err(e) => warn!(%notification_id, channel = %self.channel, error = %e, "实时事件发布失败"),
        }
    }
}

/// 不发布任何事件
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRealtimeSink;

#[async_trait]
impl RealtimeSink for NoopRealtimeSink {
    async fn notification_created(&self, _notification_id: Uuid, _recipients: &[String]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_shape() {
        let id = Uuid::now_v7();
        let recipients = vec!["a".to_string()];
        let value = serde_json::to_value(RealtimeEvent {
            event: "new_notification",
            notification_id: id,
            recipients: &recipients,
        })
        .unwrap();
        assert_eq!(value["event"], "new_notification");
        assert_eq!(value["notificationId"], id.to_string());
        assert_eq!(value["recipients"][0], "a");
    }
}
