//! 投递与阅读状态追踪服务
//!
//! 状态机：`sent -> delivered`，`sent -> failed`（终态），已读与投递状态正交。
//! 迁移本身不更新通知上的计数，计数由对账任务统一重算。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::traits::{NotificationRepository, TrackerRepository};
use crate::error::{NotificationError, Result};
use crate::models::{DeliveryReport, FeedPage, Transition, UserReadingStats};

/// 投递追踪服务
pub struct DeliveryTracker {
    notifications: Arc<dyn NotificationRepository>,
    records: Arc<dyn TrackerRepository>,
}

impl DeliveryTracker {
    pub fn new(
        notifications: Arc<dyn NotificationRepository>,
        records: Arc<dyn TrackerRepository>,
    ) -> Self {
        Self {
            notifications,
            records,
        }
    }

    /// 为每个接收人创建一条记录，重复调用不会产生重复记录
    pub async fn create_records(&self, notification_id: Uuid, recipients: &[String]) -> Result<u64> {
        let inserted = self
            .records
            .insert_records(notification_id, recipients, Utc::now())
            .await?;
        debug!(%notification_id, inserted, "追踪记录已创建");
        Ok(inserted)
    }

    pub async fn mark_delivered(&self, notification_id: Uuid, user_id: &str) -> Result<Transition> {
        let transition = self
            .records
            .mark_delivered(notification_id, user_id, Utc::now())
            .await?;
        require_record(transition, notification_id, user_id)
    }

    pub async fn mark_failed(
        &self,
        notification_id: Uuid,
        user_id: &str,
        reason: &str,
    ) -> Result<Transition> {
        let transition = self
            .records
            .mark_failed(notification_id, user_id, reason, Utc::now())
            .await?;
        require_record(transition, notification_id, user_id)
    }

    /// 标记已读，幂等，阅读时间只记录第一次
    pub async fn mark_read(&self, notification_id: Uuid, user_id: &str) -> Result<Transition> {
        let transition = self
            .records
            .mark_read(notification_id, user_id, Utc::now())
            .await?;
        require_record(transition, notification_id, user_id)
    }

    #[instrument(skip(self))]
    pub async fn mark_all_read(&self, user_id: &str) -> Result<u64> {
        let count = self.records.mark_all_read(user_id, Utc::now()).await?;
        info!(user_id, count, "全部标记为已读");
        Ok(count)
    }

    /// 软删除；用户必须是该通知的接收人
    pub async fn delete(&self, notification_id: Uuid, user_id: &str) -> Result<Transition> {
        let notification = self
            .notifications
            .get_notification(notification_id)
            .await?
            .ok_or_else(|| NotificationError::not_found("Notification", notification_id))?;

        if !notification.recipients.iter().any(|r| r == user_id) {
            return Err(NotificationError::not_found(
                "NotificationRead",
                format!("{notification_id}/{user_id}"),
            ));
        }

        self.records
            .soft_delete(notification_id, user_id, Utc::now())
            .await
    }

    #[instrument(skip(self))]
    pub async fn delete_all(&self, user_id: &str) -> Result<u64> {
        let count = self.records.soft_delete_all(user_id, Utc::now()).await?;
        info!(user_id, count, "已删除用户全部通知");
        Ok(count)
    }

    pub async fn unread_count(&self, user_id: &str) -> Result<u64> {
        self.records.unread_count(user_id).await
    }

    pub async fn paginated_feed(&self, user_id: &str, page: u32, page_size: u32) -> Result<FeedPage> {
        self.records.feed(user_id, page.max(1), page_size).await
    }

    pub async fn delivery_status(&self, notification_id: Uuid) -> Result<DeliveryReport> {
        let notification = self
            .notifications
            .get_notification(notification_id)
            .await?
            .ok_or_else(|| NotificationError::not_found("Notification", notification_id))?;
        let records = self.records.records_for_notification(notification_id).await?;
        Ok(DeliveryReport::build(&notification, &records))
    }

    pub async fn reading_stats(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<UserReadingStats> {
        let records = self.records.records_for_user(user_id, since).await?;
        Ok(UserReadingStats::from_records(&records))
    }
}

fn require_record(transition: Transition, notification_id: Uuid, user_id: &str) -> Result<Transition> {
    match transition {
        Transition::Missing => Err(NotificationError::not_found(
            "NotificationRead",
            format!("{notification_id}/{user_id}"),
        )),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreateNotificationRequest, DeliveryStatus, Notification, NotificationType};
    use crate::tracker::MemoryNotificationStore;
    use crate::tracker::MockTrackerRepository;

    async fn setup(recipients: &[&str]) -> (DeliveryTracker, MemoryNotificationStore, Notification) {
        let store = MemoryNotificationStore::new();
        let tracker = DeliveryTracker::new(Arc::new(store.clone()), Arc::new(store.clone()));
        let request = CreateNotificationRequest::new(
            "t",
            "m",
            recipients.iter().map(|s| s.to_string()).collect(),
            NotificationType::System,
        );
        let notification = Notification::from_request(&request, Utc::now());
        store.insert_notification(&notification).await.unwrap();
        tracker
            .create_records(notification.id, &notification.recipients)
            .await
            .unwrap();
        (tracker, store, notification)
    }

    #[tokio::test]
    async fn test_create_records_is_idempotent() {
        let (tracker, store, n) = setup(&["a", "b"]).await;
        assert_eq!(tracker.create_records(n.id, &n.recipients).await.unwrap(), 0);
        assert_eq!(store.record_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_is_terminal() {
        let (tracker, _, n) = setup(&["a"]).await;
        assert_eq!(
            tracker.mark_failed(n.id, "a", "No push tokens found").await.unwrap(),
            Transition::Applied
        );
        assert_eq!(
            tracker.mark_delivered(n.id, "a").await.unwrap(),
            Transition::Unchanged
        );
        let report = tracker.delivery_status(n.id).await.unwrap();
        assert_eq!(report.recipients["a"].status, DeliveryStatus::Failed);
        assert_eq!(report.recipients["a"].error.as_deref(), Some("No push tokens found"));
    }

    #[tokio::test]
    async fn test_mark_read_keeps_first_timestamp() {
        let (tracker, store, n) = setup(&["a"]).await;
        assert!(tracker.mark_read(n.id, "a").await.unwrap().applied());
        let first = store.record(n.id, "a").unwrap().read_at;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(tracker.mark_read(n.id, "a").await.unwrap(), Transition::Unchanged);
        assert_eq!(store.record(n.id, "a").unwrap().read_at, first);
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let (tracker, _, n) = setup(&["a"]).await;
        let err = tracker.mark_read(n.id, "stranger").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        let err = tracker.delete(n.id, "stranger").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        let err = tracker.delivery_status(Uuid::now_v7()).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_delete_hides_from_feed_and_unread() {
        let (tracker, _, n) = setup(&["a"]).await;
        assert_eq!(tracker.unread_count("a").await.unwrap(), 1);
        assert!(tracker.delete(n.id, "a").await.unwrap().applied());
        assert_eq!(tracker.unread_count("a").await.unwrap(), 0);
        let page = tracker.paginated_feed("a", 1, 20).await.unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.pagination.total, 0);
    }

    #[tokio::test]
    async fn test_store_error_propagates() {
        let mut records = MockTrackerRepository::new();
        records
            .expect_unread_count()
            .returning(|_| Err(NotificationError::StoreUnavailable("down".to_string())));
        let tracker = DeliveryTracker::new(Arc::new(MemoryNotificationStore::new()), Arc::new(records));
        let err = tracker.unread_count("a").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
