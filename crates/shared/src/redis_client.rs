//! Redis 客户端模块
//!
//! 提供 Redis 连接管理和常用命令封装（字符串、哈希、列表、发布订阅）。
//! 所有命令都带统一的超时，超时返回 `HubError::RedisTimeout`，由调用方决定降级策略。

use crate::config::RedisConfig;
use crate::error::{HubError, Result};
use redis::aio::MultiplexedConnection;
use redis::{Client, FromRedisValue};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, instrument};

/// SCAN 每页的提示数量
const SCAN_COUNT: u64 = 200;

/// 哈希字段比较并替换：当前值等于 ARGV[2] 时写入 ARGV[3]
const HASH_CAS_SCRIPT: &str = r#"
local cur = redis.call('HGET', KEYS[1], ARGV[1])
if cur == ARGV[2] then
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
    return 1
end
return 0
"#;

/// Redis 客户端
///
/// 内部复用同一个多路复用连接，克隆代价很低。
#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    conn: std::sync::Arc<OnceCell<MultiplexedConnection>>,
    command_timeout: Duration,
}

impl RedisClient {
    /// 创建 Redis 客户端（连接在首次使用时建立）
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        info!("Redis 客户端已创建");
        Ok(Self {
            client,
            conn: std::sync::Arc::new(OnceCell::new()),
            command_timeout: config.command_timeout(),
        })
    }

    /// 原始客户端，用于建立独立的 pub/sub 连接
    pub fn raw_client(&self) -> &Client {
        &self.client
    }

    async fn get_conn(&self) -> Result<MultiplexedConnection> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(HubError::from)
            })
            .await?;
        Ok(conn.clone())
    }

    /// 执行单条命令，统一施加超时
    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd, operation: &str) -> Result<T> {
        let fut = async {
            let mut conn = self.get_conn().await?;
            cmd.query_async::<T>(&mut conn).await.map_err(HubError::from)
        };
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(HubError::RedisTimeout {
                operation: operation.to_string(),
            }),
        }
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        self.query::<String>(&redis::cmd("PING"), "PING")
            .await
            .map(|_| ())
    }

    // ==================== 字符串 ====================

    /// 获取原始字符串值
    pub async fn get_string(&self, key: &str) -> Result<Option<String>> {
        self.query(redis::cmd("GET").arg(key), "GET").await
    }

    /// 设置字符串值并指定 TTL
    pub async fn set_string(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let _: () = self
            .query(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl.as_millis() as u64),
                "SET",
            )
            .await?;
        Ok(())
    }

    /// 获取 JSON 值
    #[instrument(skip(self))]
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_string(key).await? {
            Some(v) => Ok(Some(serde_json::from_str(&v)?)),
            None => Ok(None),
        }
    }

    /// 设置 JSON 值
    #[instrument(skip(self, value))]
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let serialized = serde_json::to_string(value)?;
        self.set_string(key, &serialized, ttl).await
    }

    /// 删除若干键，返回实际删除的数量
    pub async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.query(redis::cmd("DEL").arg(keys), "DEL").await
    }

    /// 按模式删除键，逐页 SCAN 并删除，返回删除数量
    #[instrument(skip(self))]
    pub async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        let mut cursor = 0u64;
        let mut removed = 0u64;
        loop {
            let (next, keys) = self.scan_page(cursor, pattern).await?;
            removed += self.delete(&keys).await?;
            if next == 0 {
                return Ok(removed);
            }
            cursor = next;
        }
    }

    /// 按模式列出键（SCAN 游标遍历，不阻塞服务端）
    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut cursor = 0u64;
        let mut found = Vec::new();
        loop {
            let (next, keys) = self.scan_page(cursor, pattern).await?;
            found.extend(keys);
            if next == 0 {
                // SCAN 在 rehash 期间可能重复返回同一个键
                found.sort_unstable();
                found.dedup();
                return Ok(found);
            }
            cursor = next;
        }
    }

    async fn scan_page(&self, cursor: u64, pattern: &str) -> Result<(u64, Vec<String>)> {
        self.query(
            redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT),
            "SCAN",
        )
        .await
    }

    /// 检查键是否存在
    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.query(redis::cmd("EXISTS").arg(key), "EXISTS").await
    }

    /// 原子性地仅在 key 不存在时设置值，并指定毫秒级 TTL
    ///
    /// 基于 Redis SET NX PX 实现。返回 true 表示设置成功（key 不存在），false 表示 key 已存在。
    pub async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let result: Option<String> = self
            .query(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl.as_millis().max(1) as u64),
                "SET NX",
            )
            .await?;
        Ok(result.is_some())
    }

    // ==================== 哈希 ====================

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.query(redis::cmd("HGETALL").arg(key), "HGETALL").await
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.query(redis::cmd("HGET").arg(key).arg(field), "HGET")
            .await
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let _: i64 = self
            .query(redis::cmd("HSET").arg(key).arg(field).arg(value), "HSET")
            .await?;
        Ok(())
    }

    /// 删除哈希字段，返回是否存在
    pub async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let removed: i64 = self
            .query(redis::cmd("HDEL").arg(key).arg(field), "HDEL")
            .await?;
        Ok(removed > 0)
    }

    /// 仅当字段当前值等于 `expected` 时写入 `value`，字段不存在视为不相等
    pub async fn hcompare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        value: &str,
    ) -> Result<bool> {
        let swapped: i64 = self
            .query(
                redis::cmd("EVAL")
                    .arg(HASH_CAS_SCRIPT)
                    .arg(1)
                    .arg(key)
                    .arg(field)
                    .arg(expected)
                    .arg(value),
                "EVAL hash cas",
            )
            .await?;
        Ok(swapped == 1)
    }

    pub async fn hlen(&self, key: &str) -> Result<u64> {
        self.query(redis::cmd("HLEN").arg(key), "HLEN").await
    }

    // ==================== 列表 ====================

    pub async fn lpush(&self, key: &str, value: &str) -> Result<u64> {
        self.query(redis::cmd("LPUSH").arg(key).arg(value), "LPUSH")
            .await
    }

    /// 从队尾弹出一个元素，多实例并发时每个元素只会被一个实例取到
    pub async fn rpop(&self, key: &str) -> Result<Option<String>> {
        self.query(redis::cmd("RPOP").arg(key), "RPOP").await
    }

    pub async fn llen(&self, key: &str) -> Result<u64> {
        self.query(redis::cmd("LLEN").arg(key), "LLEN").await
    }

    // ==================== 发布订阅 ====================

    /// 发布消息，返回收到消息的订阅者数量
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        self.query(redis::cmd("PUBLISH").arg(channel).arg(payload), "PUBLISH")
            .await
    }
}

/// 将字符串中的 glob 元字符转义，用于拼接 SCAN MATCH 模式
pub fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("user-1"), "user-1");
        assert_eq!(escape_glob("a*b?[c]"), "a\\*b\\?\\[c\\]");
    }

    #[tokio::test]
    #[ignore] // 需要 Redis 连接
    async fn test_set_nx_roundtrip() {
        let config = RedisConfig {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| RedisConfig::default().url),
            ..Default::default()
        };
        let redis = RedisClient::new(&config).unwrap();
        let key = format!("test:set_nx:{}", std::process::id());

        assert!(redis.set_nx(&key, "1", Duration::from_secs(5)).await.unwrap());
        assert!(!redis.set_nx(&key, "1", Duration::from_secs(5)).await.unwrap());
        redis.delete(&[key]).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // 需要 Redis 连接
    async fn test_scan_and_hash_cas() {
        let config = RedisConfig {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| RedisConfig::default().url),
            ..Default::default()
        };
        let redis = RedisClient::new(&config).unwrap();
        let prefix = format!("test:scan:{}:", std::process::id());
        for i in 0..450 {
            redis
                .set_string(&format!("{prefix}{i}"), "1", Duration::from_secs(30))
                .await
                .unwrap();
        }
        let pattern = format!("{}*", escape_glob(&prefix));
        assert_eq!(redis.keys(&pattern).await.unwrap().len(), 450);
        assert_eq!(redis.delete_pattern(&pattern).await.unwrap(), 450);
        assert!(redis.keys(&pattern).await.unwrap().is_empty());

        let hash = format!("test:cas:{}", std::process::id());
        redis.hset(&hash, "f", "a").await.unwrap();
        assert!(!redis.hcompare_and_set(&hash, "f", "x", "b").await.unwrap());
        assert!(redis.hcompare_and_set(&hash, "f", "a", "b").await.unwrap());
        assert!(!redis.hcompare_and_set(&hash, "missing", "a", "b").await.unwrap());
        assert_eq!(redis.hget(&hash, "f").await.unwrap().as_deref(), Some("b"));
        redis.delete(&[hash]).await.unwrap();
    }
}
