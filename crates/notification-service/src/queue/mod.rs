//! 延迟通知队列
//!
//! 生产者 `LPUSH` 入队，轮询器 `RPOP` 出队。`RPOP` 在多实例间原子，同一元素只会被一个实例取走。
//! 元素为 [`CreateNotificationRequest`](crate::models::CreateNotificationRequest) 的 JSON。

mod poller;

pub use poller::{PollReport, QueuePoller};

use std::collections::VecDeque;

use async_trait::async_trait;
use notify_shared::error::Result;
use notify_shared::redis_client::RedisClient;
use parking_lot::Mutex;

/// 通知队列
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationQueue: Send + Sync {
    async fn push(&self, item: &str) -> Result<()>;
    async fn pop(&self) -> Result<Option<String>>;
    async fn len(&self) -> Result<u64>;
}

/// 基于 Redis 列表的队列
pub struct RedisNotificationQueue {
    redis: RedisClient,
    key: String,
}

impl RedisNotificationQueue {
    pub fn new(redis: RedisClient, key: &str) -> Self {
        Self {
            redis,
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl NotificationQueue for RedisNotificationQueue {
    async fn push(&self, item: &str) -> Result<()> {
        self.redis.lpush(&self.key, item).await.map(|_| ())
    }

    async fn pop(&self) -> Result<Option<String>> {
        self.redis.rpop(&self.key).await
    }

    async fn len(&self) -> Result<u64> {
        self.redis.llen(&self.key).await
    }
}

/// 内存队列，语义与 Redis 列表一致：头部入队，尾部出队
#[derive(Default)]
pub struct MemoryNotificationQueue {
    items: Mutex<VecDeque<String>>,
}

impl MemoryNotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationQueue for MemoryNotificationQueue {
    async fn push(&self, item: &str) -> Result<()> {
        self.items.lock().push_front(item.to_string());
        Ok(())
    }

    async fn pop(&self) -> Result<Option<String>> {
        Ok(self.items.lock().pop_back())
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.items.lock().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_queue_is_fifo() {
        let queue = MemoryNotificationQueue::new();
        tokio_test::assert_ok!(queue.push("a").await);
        tokio_test::assert_ok!(queue.push("b").await);
        assert_eq!(queue.len().await.unwrap(), 2);
        assert_eq!(queue.pop().await.unwrap().as_deref(), Some("a"));
        assert_eq!(queue.pop().await.unwrap().as_deref(), Some("b"));
        assert_eq!(queue.pop().await.unwrap(), None);
    }
}
