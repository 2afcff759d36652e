//! 通知读缓存
//!
//! 短 TTL 的读穿透缓存，位于追踪存储之前。缓存内容可以随时丢弃：
//! 后端出错或超时一律视为未命中或空操作，只记录告警和指标，从不影响调用方。
//! 用户自己的读状态变更（已读、删除）在返回前调用 [`FeedCache::invalidate`]；
//! 新通知涉及的接收人由后台推送任务以有界并发批量失效，不占用创建请求的时间。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use notify_shared::config::CacheConfig;
use notify_shared::error::Result;
use notify_shared::observability::metrics;
use notify_shared::redis_client::{RedisClient, escape_glob};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::error::NotificationError;

/// 缓存后端
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn delete(&self, keys: &[String]) -> Result<u64>;
    /// 删除所有以 `prefix` 开头的键（`prefix` 为字面量）
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;
}

/// Redis 缓存后端
pub struct RedisCacheBackend {
    redis: RedisClient,
}

impl RedisCacheBackend {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.redis.get_string(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.redis.set_string(key, value, ttl).await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.redis.delete(keys).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        self.redis
            .delete_pattern(&format!("{}*", escape_glob(prefix)))
            .await
    }
}

/// 内存缓存后端，过期按单调时钟判断
#[derive(Default)]
pub struct MemoryCacheBackend {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let value = self
            .entries
            .get(key)
            .filter(|entry| entry.1 > now)
            .map(|entry| entry.0.clone());
        if value.is_none() {
            self.entries.remove_if(key, |_, (_, expires)| *expires <= now);
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        Ok(keys
            .iter()
            .filter(|k| self.entries.remove(k.as_str()).is_some())
            .count() as u64)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let before = self.entries.len();
        self.entries.retain(|k, _| !k.starts_with(prefix));
        Ok((before - self.entries.len()) as u64)
    }
}

/// 缓存条目的作用域
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheScope {
    Feed {
        user: String,
        page: u32,
        page_size: u32,
    },
    UnreadCount {
        user: String,
    },
}

impl CacheScope {
    pub fn feed(user: &str, page: u32, page_size: u32) -> Self {
        Self::Feed {
            user: user.to_string(),
            page,
            page_size,
        }
    }

    pub fn unread(user: &str) -> Self {
        Self::UnreadCount {
            user: user.to_string(),
        }
    }

    pub fn key(&self) -> String {
        match self {
            Self::Feed {
                user,
                page,
                page_size,
            } => format!("{}page{page}:limit{page_size}", feed_prefix(user)),
            Self::UnreadCount { user } => unread_key(user),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Feed { .. } => "feed",
            Self::UnreadCount { .. } => "unread",
        }
    }
}

fn feed_prefix(user: &str) -> String {
    format!("cache:notifications:user:{user}:")
}

fn unread_key(user: &str) -> String {
    format!("cache:unread:{user}")
}

/// 批量失效时同时进行的用户数
pub const INVALIDATE_CONCURRENCY: usize = 32;

/// 通知列表与未读数缓存
pub struct FeedCache {
    backend: Arc<dyn CacheBackend>,
    feed_ttl: Duration,
    unread_ttl: Duration,
    op_timeout: Duration,
}

impl FeedCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self {
            backend,
            feed_ttl: Duration::from_secs(config.feed_ttl_secs),
            unread_ttl: Duration::from_secs(config.unread_ttl_secs),
            op_timeout: Duration::from_millis(config.op_timeout_ms),
        }
    }

    pub fn with_defaults(backend: Arc<dyn CacheBackend>) -> Self {
        Self::new(backend, &CacheConfig::default())
    }

    /// 作用域对应的默认 TTL
    pub fn ttl_for(&self, scope: &CacheScope) -> Duration {
        match scope {
            CacheScope::Feed { .. } => self.feed_ttl,
            CacheScope::UnreadCount { .. } => self.unread_ttl,
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, scope: &CacheScope) -> Option<T> {
        let key = scope.key();
        let raw = match tokio::time::timeout(self.op_timeout, self.backend.get(&key)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                degrade("get", &key, NotificationError::from(e));
                return None;
            }
            Err(_) => {
                degrade("get", &key, timeout_error(self.op_timeout));
                return None;
            }
        };

        match raw.map(|s| serde_json::from_str::<T>(&s)) {
            Some(Ok(value)) => {
                metrics::record_cache_operation(scope.kind(), "hit");
                Some(value)
            }
            Some(Err(e)) => {
                degrade("decode", &key, NotificationError::from(e));
                None
            }
            None => {
                metrics::record_cache_operation(scope.kind(), "miss");
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, scope: &CacheScope, value: &T, ttl: Duration) {
        let key = scope.key();
        let payload = match serde_json::to_string(value) {
            Ok(p) => p,
            Err(e) => {
                degrade("encode", &key, NotificationError::from(e));
                return;
            }
        };
        match tokio::time::timeout(self.op_timeout, self.backend.set(&key, &payload, ttl)).await {
            Ok(Ok(())) => debug!(key, ttl_secs = ttl.as_secs(), "缓存已写入"),
            Ok(Err(e)) => degrade("set", &key, NotificationError::from(e)),
            Err(_) => degrade("set", &key, timeout_error(self.op_timeout)),
        }
    }

    /// 清除用户所有列表分页和未读数，两类键并行删除
    pub async fn invalidate(&self, user_id: &str) {
        let prefix = feed_prefix(user_id);
        let keys = [unread_key(user_id)];
        let (pages, unread) = tokio::join!(
            tokio::time::timeout(self.op_timeout, self.backend.delete_prefix(&prefix)),
            tokio::time::timeout(self.op_timeout, self.backend.delete(&keys)),
        );

        match pages {
            Ok(Ok(removed)) => debug!(user_id, removed, "列表缓存已清除"),
            Ok(Err(e)) => degrade("invalidate", &prefix, NotificationError::from(e)),
            Err(_) => degrade("invalidate", &prefix, timeout_error(self.op_timeout)),
        }
        match unread {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => degrade("invalidate", &keys[0], NotificationError::from(e)),
            Err(_) => degrade("invalidate", &keys[0], timeout_error(self.op_timeout)),
        }
        metrics::record_cache_operation("invalidate", "ok");
    }

    /// 批量失效，最多 [`INVALIDATE_CONCURRENCY`] 个用户同时进行
    pub async fn invalidate_many(&self, user_ids: &[String]) {
        stream::iter(user_ids)
            .for_each_concurrent(INVALIDATE_CONCURRENCY, |user_id| self.invalidate(user_id))
            .await;
    }
}

fn timeout_error(timeout: Duration) -> NotificationError {
    NotificationError::CacheUnavailable(format!("操作超时 {}ms", timeout.as_millis()))
}

fn degrade(op: &str, key: &str, error: NotificationError) {
    warn!(op, key, error = %error, "缓存不可用，已降级");
    metrics::record_cache_operation(op, "error");
}
