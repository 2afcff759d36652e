//! 内存存储实现，供测试与无数据库的单机运行使用

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::traits::{NotificationRepository, TrackerRepository};
use crate::error::Result;
use crate::models::{
    DeliveryStatus, FeedItem, FeedPage, Notification, NotificationCounters, Pagination,
    TrackerRecord, Transition,
};

#[derive(Default)]
struct Tables {
    notifications: HashMap<Uuid, Notification>,
    records: HashMap<(Uuid, String), TrackerRecord>,
}

/// 内存通知存储
#[derive(Clone, Default)]
pub struct MemoryNotificationStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录总数，含已删除
    pub fn record_count(&self) -> usize {
        self.tables.read().records.len()
    }

    pub fn record(&self, notification_id: Uuid, user_id: &str) -> Option<TrackerRecord> {
        self.tables
            .read()
            .records
            .get(&(notification_id, user_id.to_string()))
            .cloned()
    }

    /// 对单条记录执行迁移，`apply` 返回是否改变了状态
    fn transition<F>(&self, notification_id: Uuid, user_id: &str, apply: F) -> Transition
    where
        F: FnOnce(&mut TrackerRecord) -> bool,
    {
        let mut tables = self.tables.write();
        match tables.records.get_mut(&(notification_id, user_id.to_string())) {
            None => Transition::Missing,
            Some(record) => {
                if apply(record) {
                    Transition::Applied
                } else {
                    Transition::Unchanged
                }
            }
        }
    }
}

#[async_trait]
impl NotificationRepository for MemoryNotificationStore {
    async fn insert_notification(&self, notification: &Notification) -> Result<()> {
        self.tables
            .write()
            .notifications
            .insert(notification.id, notification.clone());
        Ok(())
    }

    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>> {
        Ok(self.tables.read().notifications.get(&id).cloned())
    }

    async fn touched_since(&self, since: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let tables = self.tables.read();
        let mut ids: Vec<Uuid> = tables
            .records
            .values()
            .filter(|r| r.updated_at > since)
            .map(|r| r.notification_id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn recompute_counters(&self, id: Uuid) -> Result<Option<NotificationCounters>> {
        let mut tables = self.tables.write();
        let counters = NotificationCounters::from_records(
            tables.records.values().filter(|r| r.notification_id == id),
        );
        let Some(notification) = tables.notifications.get_mut(&id) else {
            return Ok(None);
        };
        notification.sent_count = counters.sent_count;
        notification.delivered_count = counters.delivered_count;
        notification.read_count = counters.read_count;
        notification.updated_at = Utc::now();
        Ok(Some(counters))
    }
}

#[async_trait]
impl TrackerRepository for MemoryNotificationStore {
    async fn insert_records(
        &self,
        notification_id: Uuid,
        user_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tables = self.tables.write();
        let mut inserted = 0;
        for user_id in user_ids {
            let key = (notification_id, user_id.clone());
            if !tables.records.contains_key(&key) {
                tables
                    .records
                    .insert(key, TrackerRecord::new(notification_id, user_id, now));
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn mark_delivered(
        &self,
        notification_id: Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        Ok(self.transition(notification_id, user_id, |r| {
            if r.delivery_status != DeliveryStatus::Sent {
                return false;
            }
            r.delivery_status = DeliveryStatus::Delivered;
            r.delivered_at = Some(now);
            r.updated_at = now;
            true
        }))
    }

    async fn mark_failed(
        &self,
        notification_id: Uuid,
        user_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        Ok(self.transition(notification_id, user_id, |r| {
            if r.delivery_status != DeliveryStatus::Sent {
                return false;
            }
            r.delivery_status = DeliveryStatus::Failed;
            r.error_message = Some(reason.to_string());
            r.updated_at = now;
            true
        }))
    }

    async fn mark_read(
        &self,
        notification_id: Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        Ok(self.transition(notification_id, user_id, |r| {
            if r.read {
                return false;
            }
            r.read = true;
            r.read_at = Some(now);
            r.updated_at = now;
            true
        }))
    }

    async fn mark_all_read(&self, user_id: &str, now: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write();
        let mut updated = 0;
        for record in tables
            .records
            .values_mut()
            .filter(|r| r.user_id == user_id && !r.read && !r.deleted)
        {
            record.read = true;
            record.read_at = Some(now);
            record.updated_at = now;
            updated += 1;
        }
        Ok(updated)
    }

    async fn soft_delete(
        &self,
        notification_id: Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let mut tables = self.tables.write();
        let record = tables
            .records
            .entry((notification_id, user_id.to_string()))
            .or_insert_with(|| TrackerRecord::new(notification_id, user_id, now));
        if record.deleted {
            return Ok(Transition::Unchanged);
        }
        record.deleted = true;
        record.deleted_at = Some(now);
        record.updated_at = now;
        Ok(Transition::Applied)
    }

    async fn soft_delete_all(&self, user_id: &str, now: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write();
        let mut updated = 0;
        for record in tables
            .records
            .values_mut()
            .filter(|r| r.user_id == user_id && !r.deleted)
        {
            record.deleted = true;
            record.deleted_at = Some(now);
            record.updated_at = now;
            updated += 1;
        }
        Ok(updated)
    }

    async fn unread_count(&self, user_id: &str) -> Result<u64> {
        let tables = self.tables.read();
        Ok(tables
            .records
            .values()
            .filter(|r| r.user_id == user_id && !r.read && !r.deleted)
            .count() as u64)
    }

    async fn feed(&self, user_id: &str, page: u32, page_size: u32) -> Result<FeedPage> {
        let tables = self.tables.read();
        let mut visible: Vec<FeedItem> = tables
            .notifications
            .values()
            .filter(|n| n.recipients.iter().any(|r| r == user_id))
            .filter_map(|n| {
                let record = tables.records.get(&(n.id, user_id.to_string()));
                if record.is_some_and(|r| r.deleted) {
                    return None;
                }
                Some(FeedItem {
                    notification: n.clone(),
                    read: record.is_some_and(|r| r.read),
                    read_at: record.and_then(|r| r.read_at),
                    delivery_status: record.map(|r| r.delivery_status),
                })
            })
            .collect();
        visible.sort_by(|a, b| b.notification.created_at.cmp(&a.notification.created_at));

        let total = visible.len() as u64;
        let items = visible
            .into_iter()
            .skip(Pagination::offset(page, page_size) as usize)
            .take(page_size as usize)
            .collect();

        Ok(FeedPage {
            items,
            pagination: Pagination::new(page, page_size, total),
        })
    }

    async fn records_for_notification(&self, notification_id: Uuid) -> Result<Vec<TrackerRecord>> {
        let tables = self.tables.read();
        let mut records: Vec<TrackerRecord> = tables
            .records
            .values()
            .filter(|r| r.notification_id == notification_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(records)
    }

    async fn records_for_user(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<TrackerRecord>> {
        let tables = self.tables.read();
        let mut records: Vec<TrackerRecord> = tables
            .records
            .values()
            .filter(|r| r.user_id == user_id)
            .filter(|r| since.is_none_or(|s| r.created_at >= s))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}
