//! 去重与限流守卫
//!
//! 把同一物理事件在短时间内的重复触发（例如刷脸机一秒内读到两次）合并为一条通知。
//! 提供两种相互独立的策略：
//!
//! - 固定窗口：首次调用设置带过期时间的标记，窗口内的后续调用被抑制
//! - 自然日首次：按配置时区的日期设置标记，到当地零点过期，用于区分当天第一次与后续事件
//!
//! 标记存储不可用时两种策略都放行（fail open）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Days, FixedOffset, NaiveDate, Offset, TimeZone, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use notify_shared::error::Result;
use notify_shared::observability::metrics;
use notify_shared::redis_client::RedisClient;
use tracing::{debug, info, warn};

/// 去重标记存储
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarkerStore: Send + Sync {
    /// 原子地在 key 不存在时设置标记，返回是否设置成功
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool>;
}

/// 基于 Redis `SET NX PX` 的标记存储
pub struct RedisMarkerStore {
    redis: RedisClient,
}

impl RedisMarkerStore {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl MarkerStore for RedisMarkerStore {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool> {
        let stamp = Utc::now().timestamp_millis().to_string();
        self.redis.set_nx(key, &stamp, ttl).await
    }
}

/// 内存标记数达到该值后，写入前先清掉已过期的标记
pub const MEMORY_MARKER_PRUNE_AT: usize = 1024;

/// 内存标记存储，过期按单调时钟判断
///
/// 标记数达到 [`MEMORY_MARKER_PRUNE_AT`] 时顺带清理过期标记，常驻数量受活跃窗口内的 key 数约束。
#[derive(Default)]
pub struct MemoryMarkerStore {
    markers: DashMap<String, Instant>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前保存的标记数（包括尚未清理的过期标记）
    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    fn prune_expired(&self, now: Instant) {
        let before = self.markers.len();
        self.markers.retain(|_, expires_at| *expires_at > now);
        debug!(removed = before.saturating_sub(self.markers.len()), "已清理过期去重标记");
    }
}

#[async_trait]
impl MarkerStore for MemoryMarkerStore {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        // retain 会锁住所有分片，必须在持有 entry 之前完成
        if self.markers.len() >= MEMORY_MARKER_PRUNE_AT {
            self.prune_expired(now);
        }
        let inserted = match self.markers.entry(key.to_string()) {
            Entry::Occupied(mut marker) => {
                if *marker.get() <= now {
                    marker.insert(now + ttl);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now + ttl);
                true
            }
        };
        Ok(inserted)
    }
}

/// 去重守卫
pub struct DedupGuard {
    store: Arc<dyn MarkerStore>,
    offset: FixedOffset,
}

impl DedupGuard {
    /// `utc_offset_hours` 决定自然日策略使用的当地日期
    pub fn new(store: Arc<dyn MarkerStore>, utc_offset_hours: i32) -> Self {
        let offset = FixedOffset::east_opt(utc_offset_hours * 3600).unwrap_or(Utc.fix());
        Self { store, offset }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// 固定窗口策略：窗口内首次调用返回 true，后续返回 false
    pub async fn should_proceed(&self, scope: &str, entity_id: &str, window: Duration) -> bool {
        let key = format!("dedup:{scope}:{entity_id}");
        self.check("window", &key, window).await
    }

    /// 自然日首次策略：当地日期内首次事件返回 true
    pub async fn first_of_day(&self, scope: &str, entity_id: &str, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.offset);
        let day = local.date_naive();
        let key = format!("dedup:{scope}:{entity_id}:{}", day.format("%Y-%m-%d"));
        let ttl = until_next_midnight(day, at, self.offset);
        self.check("calendar_day", &key, ttl).await
    }

    async fn check(&self, policy: &str, key: &str, ttl: Duration) -> bool {
        match self.store.set_if_absent(key, ttl).await {
            Ok(true) => {
                debug!(key, policy, "去重标记已设置，放行");
                metrics::record_dedup_decision(policy, "proceed");
                true
            }
            Ok(false) => {
                info!(key, policy, outcome = "suppressed", "重复事件已抑制");
                metrics::record_dedup_decision(policy, "suppressed");
                false
            }
            Err(e) => {
                warn!(key, policy, error = %e, "去重存储不可用，按首次事件放行");
                metrics::record_dedup_decision(policy, "fail_open");
                true
            }
        }
    }
}

/// 距离当地下一个零点的时长，至少 1 秒
fn until_next_midnight(day: NaiveDate, at: DateTime<Utc>, offset: FixedOffset) -> Duration {
    let next_midnight = day
        .checked_add_days(Days::new(1))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|naive| offset.from_local_datetime(&naive).single());

    next_midnight
        .map(|m| (m.with_timezone(&Utc) - at).num_seconds())
        .filter(|secs| *secs > 0)
        .map(|secs| Duration::from_secs(secs as u64))
        .unwrap_or(Duration::from_secs(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_shared::error::HubError;

    fn guard() -> DedupGuard {
        DedupGuard::new(Arc::new(MemoryMarkerStore::new()), 7)
    }

    #[tokio::test]
    async fn test_window_suppresses_within_window() {
        let guard = guard();
        let window = Duration::from_secs(300);
        assert!(guard.should_proceed("attendance", "S001", window).await);
        assert!(!guard.should_proceed("attendance", "S001", window).await);
        // 不同实体互不影响
        assert!(guard.should_proceed("attendance", "S002", window).await);
    }

    #[tokio::test]
    async fn test_window_reopens_after_expiry() {
        let guard = guard();
        let window = Duration::from_millis(30);
        assert!(guard.should_proceed("attendance", "S001", window).await);
        assert!(!guard.should_proceed("attendance", "S001", window).await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(guard.should_proceed("attendance", "S001", window).await);
    }

    #[tokio::test]
    async fn test_memory_store_prunes_expired_markers() {
        let store = MemoryMarkerStore::new();
        assert!(store.set_if_absent("live", Duration::from_secs(60)).await.unwrap());
        // 零 TTL 的标记写入即过期
        for i in 1..MEMORY_MARKER_PRUNE_AT {
            assert!(store.set_if_absent(&format!("k{i}"), Duration::ZERO).await.unwrap());
        }
        assert_eq!(store.len(), MEMORY_MARKER_PRUNE_AT);

        assert!(store.set_if_absent("fresh", Duration::from_secs(60)).await.unwrap());
        assert_eq!(store.len(), 2);
        assert!(!store.set_if_absent("live", Duration::from_secs(60)).await.unwrap());
        assert!(!store.set_if_absent("fresh", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_first_of_day_uses_local_date() {
        let guard = guard();
        // 2024-05-01 16:30 UTC = 2024-05-01 23:30 +07:00
        let evening = Utc.with_ymd_and_hms(2024, 5, 1, 16, 30, 0).unwrap();
        // 2024-05-01 17:10 UTC = 2024-05-02 00:10 +07:00，已是新的一天
        let after_midnight = Utc.with_ymd_and_hms(2024, 5, 1, 17, 10, 0).unwrap();

        assert!(guard.first_of_day("staff", "E01", evening).await);
        assert!(!guard.first_of_day("staff", "E01", evening).await);
        assert!(guard.first_of_day("staff", "E01", after_midnight).await);
    }

    #[test]
    fn test_until_next_midnight() {
        let offset = FixedOffset::east_opt(7 * 3600).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 16, 30, 0).unwrap();
        let day = at.with_timezone(&offset).date_naive();
        assert_eq!(until_next_midnight(day, at, offset), Duration::from_secs(30 * 60));
    }

    #[tokio::test]
    async fn test_fail_open_on_store_error() {
        let mut store = MockMarkerStore::new();
        store
            .expect_set_if_absent()
            .times(2)
            .returning(|_, _| Err(HubError::RedisTimeout { operation: "SET NX".to_string() }));

        let guard = DedupGuard::new(Arc::new(store), 7);
        assert!(guard.should_proceed("attendance", "S001", Duration::from_secs(300)).await);
        assert!(guard.first_of_day("staff", "E01", Utc::now()).await);
    }
}
