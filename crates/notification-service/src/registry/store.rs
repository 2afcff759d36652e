//! 设备条目存储
//!
//! 以 `user_id -> device_id -> 原始值` 的形式保存设备条目。
//! 编解码由注册表负责，存储层只处理字符串。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use notify_shared::error::Result;
use notify_shared::redis_client::RedisClient;

/// Redis 中每个用户设备哈希的键前缀
pub const PUSH_TOKENS_PREFIX: &str = "push_tokens:";

/// 设备存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// 读取用户的全部设备条目
    async fn load_all(&self, user_id: &str) -> Result<HashMap<String, String>>;
    async fn load(&self, user_id: &str, device_id: &str) -> Result<Option<String>>;
    async fn save(&self, user_id: &str, device_id: &str, raw: &str) -> Result<()>;
    /// 条目当前值等于 `expected` 时原子替换为 `raw`，返回是否替换
    ///
    /// 条目不存在时返回 false。
    async fn compare_and_swap(
        &self,
        user_id: &str,
        device_id: &str,
        expected: &str,
        raw: &str,
    ) -> Result<bool>;
    /// 删除条目，返回是否存在
    async fn delete(&self, user_id: &str, device_id: &str) -> Result<bool>;
    /// 删除用户的全部条目，返回删除的条目数
    async fn delete_user(&self, user_id: &str) -> Result<u64>;
    /// 列出存在设备条目的用户
    async fn users(&self) -> Result<Vec<String>>;
    /// 用户没有任何条目时移除其容器，返回是否移除
    async fn drop_if_empty(&self, user_id: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// Redis 实现
// ---------------------------------------------------------------------------

/// 基于 Redis 哈希 `push_tokens:{user_id}` 的设备存储
pub struct RedisDeviceStore {
    redis: RedisClient,
}

impl RedisDeviceStore {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }

    fn key(user_id: &str) -> String {
        format!("{PUSH_TOKENS_PREFIX}{user_id}")
    }
}

#[async_trait]
impl DeviceStore for RedisDeviceStore {
    async fn load_all(&self, user_id: &str) -> Result<HashMap<String, String>> {
        self.redis.hgetall(&Self::key(user_id)).await
    }

    async fn load(&self, user_id: &str, device_id: &str) -> Result<Option<String>> {
        self.redis.hget(&Self::key(user_id), device_id).await
    }

    async fn save(&self, user_id: &str, device_id: &str, raw: &str) -> Result<()> {
        self.redis.hset(&Self::key(user_id), device_id, raw).await
    }

    async fn compare_and_swap(
        &self,
        user_id: &str,
        device_id: &str,
        expected: &str,
        raw: &str,
    ) -> Result<bool> {
        self.redis
            .hcompare_and_set(&Self::key(user_id), device_id, expected, raw)
            .await
    }

    async fn delete(&self, user_id: &str, device_id: &str) -> Result<bool> {
        self.redis.hdel(&Self::key(user_id), device_id).await
    }

    async fn delete_user(&self, user_id: &str) -> Result<u64> {
        let key = Self::key(user_id);
        let count = self.redis.hlen(&key).await?;
        self.redis.delete(&[key]).await?;
        Ok(count)
    }

    async fn users(&self) -> Result<Vec<String>> {
        let keys = self.redis.keys(&format!("{PUSH_TOKENS_PREFIX}*")).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(PUSH_TOKENS_PREFIX).map(str::to_string))
            .collect())
    }

    async fn drop_if_empty(&self, user_id: &str) -> Result<bool> {
        // Redis 在哈希最后一个字段被删除时会自动移除键，这里只做兜底
        let key = Self::key(user_id);
        if self.redis.hlen(&key).await? == 0 {
            return Ok(self.redis.delete(&[key]).await? > 0);
        }
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// 内存实现
// ---------------------------------------------------------------------------

/// 基于 DashMap 的内存设备存储，适用于测试和单机运行
#[derive(Default, Clone)]
pub struct MemoryDeviceStore {
    data: Arc<DashMap<String, HashMap<String, String>>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否存在用户容器（包括空容器）
    pub fn has_container(&self, user_id: &str) -> bool {
        self.data.contains_key(user_id)
    }

    /// 直接写入原始值，便于构造遗留数据
    pub fn insert_raw(&self, user_id: &str, device_id: &str, raw: &str) {
        self.data
            .entry(user_id.to_string())
            .or_default()
            .insert(device_id.to_string(), raw.to_string());
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn load_all(&self, user_id: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .data
            .get(user_id)
            .map(|m| m.value().clone())
            .unwrap_or_default())
    }

    async fn load(&self, user_id: &str, device_id: &str) -> Result<Option<String>> {
        Ok(self
            .data
            .get(user_id)
            .and_then(|m| m.get(device_id).cloned()))
    }

    async fn save(&self, user_id: &str, device_id: &str, raw: &str) -> Result<()> {
        self.insert_raw(user_id, device_id, raw);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        user_id: &str,
        device_id: &str,
        expected: &str,
        raw: &str,
    ) -> Result<bool> {
        let Some(mut devices) = self.data.get_mut(user_id) else {
            return Ok(false);
        };
        match devices.get_mut(device_id) {
            Some(current) if current.as_str() == expected => {
                *current = raw.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, user_id: &str, device_id: &str) -> Result<bool> {
        Ok(self
            .data
            .get_mut(user_id)
            .and_then(|mut m| m.remove(device_id))
            .is_some())
    }

    async fn delete_user(&self, user_id: &str) -> Result<u64> {
        Ok(self
            .data
            .remove(user_id)
            .map(|(_, m)| m.len() as u64)
            .unwrap_or(0))
    }

    async fn users(&self) -> Result<Vec<String>> {
        Ok(self.data.iter().map(|e| e.key().clone()).collect())
    }

    async fn drop_if_empty(&self, user_id: &str) -> Result<bool> {
        Ok(self.data.remove_if(user_id, |_, m| m.is_empty()).is_some())
    }
}
