//! 存储 Trait 定义
//!
//! 编排器和追踪服务只依赖这里的接口，Postgres 与内存实现可以互换，也便于 mock 测试。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{FeedPage, Notification, NotificationCounters, TrackerRecord, Transition};

/// 通知仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn insert_notification(&self, notification: &Notification) -> Result<()>;
    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>>;

    // 计数对账
    /// 追踪记录在 `since` 之后有变化的通知
    async fn touched_since(&self, since: DateTime<Utc>) -> Result<Vec<Uuid>>;
    /// 根据追踪记录重新计算并写回计数，通知不存在时返回 None
    async fn recompute_counters(&self, id: Uuid) -> Result<Option<NotificationCounters>>;
}

/// 追踪记录仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackerRepository: Send + Sync {
    /// 批量创建记录，已存在的 (通知, 用户) 跳过，返回实际新建的数量
    async fn insert_records(
        &self,
        notification_id: Uuid,
        user_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<u64>;

    // 状态迁移
    async fn mark_delivered(
        &self,
        notification_id: Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition>;
    async fn mark_failed(
        &self,
        notification_id: Uuid,
        user_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition>;
    async fn mark_read(
        &self,
        notification_id: Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition>;
    async fn mark_all_read(&self, user_id: &str, now: DateTime<Utc>) -> Result<u64>;

    /// 软删除；记录不存在时以已删除状态插入
    async fn soft_delete(
        &self,
        notification_id: Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition>;
    async fn soft_delete_all(&self, user_id: &str, now: DateTime<Utc>) -> Result<u64>;

    // 查询
    async fn unread_count(&self, user_id: &str) -> Result<u64>;
    async fn feed(&self, user_id: &str, page: u32, page_size: u32) -> Result<FeedPage>;
    async fn records_for_notification(&self, notification_id: Uuid) -> Result<Vec<TrackerRecord>>;
    async fn records_for_user(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<TrackerRecord>>;
}
