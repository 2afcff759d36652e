//! Redis pub/sub 订阅任务
//!
//! 独占一条 pub/sub 连接，把消息解析为 [`EventEnvelope`] 后写入有界通道。
//! 连接断开时按固定间隔重连；通道满时等待路由任务消费（背压）。

use std::time::Duration;

use futures::StreamExt;
use notify_shared::observability::metrics;
use notify_shared::redis_client::RedisClient;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::EventEnvelope;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// 事件订阅任务
pub struct EventSubscriber {
    redis: RedisClient,
    channels: Vec<String>,
}

/// 单次订阅会话的结束原因
enum SessionEnd {
    Shutdown,
    Disconnected,
}

impl EventSubscriber {
    pub fn new(redis: RedisClient, channels: Vec<String>) -> Self {
        Self { redis, channels }
    }

    /// 主循环，收到关闭信号或下游通道关闭后退出
    pub async fn run(&self, tx: mpsc::Sender<EventEnvelope>, mut shutdown: watch::Receiver<bool>) {
        info!(channels = ?self.channels, "EventSubscriber 已启动");

        loop {
            match self.session(&tx, &mut shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Disconnected) => warn!("pub/sub 连接已断开，准备重连"),
                Err(e) => error!(error = %e, "pub/sub 订阅失败，准备重连"),
            }
            if tx.is_closed() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("EventSubscriber 已停止");
    }

    async fn session(
        &self,
        tx: &mpsc::Sender<EventEnvelope>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> redis::RedisResult<SessionEnd> {
        let mut pubsub = self.redis.raw_client().get_async_pubsub().await?;
        pubsub.subscribe(&self.channels).await?;
        info!(channels = ?self.channels, "已订阅事件频道");

        let mut messages = pubsub.on_message();
        loop {
            let msg = tokio::select! {
                msg = messages.next() => msg,
                _ = shutdown.changed() => return Ok(SessionEnd::Shutdown),
            };
            let Some(msg) = msg else {
                return Ok(SessionEnd::Disconnected);
            };

            let channel = msg.get_channel_name().to_string();
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "消息体不是字符串，已忽略");
                    continue;
                }
            };

            match EventEnvelope::parse(&payload) {
                Ok(envelope) => {
                    debug!(channel = %channel, service = %envelope.service, event = envelope.event.name(), "收到事件");
                    if tx.send(envelope).await.is_err() {
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                Err(e) => {
                    warn!(channel = %channel, error = %e, payload = %payload, "无法识别的事件，已忽略");
                    metrics::record_inbound_event("unknown", "rejected");
                }
            }
        }
    }
}
