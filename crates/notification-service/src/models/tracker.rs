//! 投递追踪记录及查询结果

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Notification;

/// 投递状态
///
/// `sent -> delivered`，或 `sent -> failed`（终态）。已读标记与投递状态正交。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum DeliveryStatus {
    #[default]
    Sent,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

/// 单个 (通知, 接收人) 的状态记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TrackerRecord {
    pub notification_id: Uuid,
    pub user_id: String,
    pub delivery_status: DeliveryStatus,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackerRecord {
    pub fn new(notification_id: Uuid, user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            notification_id,
            user_id: user_id.to_string(),
            delivery_status: DeliveryStatus::Sent,
            read: false,
            read_at: None,
            delivered_at: None,
            error_message: None,
            deleted: false,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 状态迁移的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// 状态已改变
    Applied,
    /// 记录存在，但当前状态不允许或已处于目标状态
    Unchanged,
    /// 记录不存在
    Missing,
}

impl Transition {
    pub fn applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// 用户通知列表中的一项
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub notification: Notification,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub delivery_status: Option<DeliveryStatus>,
}

/// 分页信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub pages: u64,
}

impl Pagination {
    pub fn new(page: u32, page_size: u32, total: u64) -> Self {
        let pages = if page_size == 0 {
            0
        } else {
            total.div_ceil(page_size as u64)
        };
        Self {
            page,
            page_size,
            total,
            pages,
        }
    }

    /// 以 1 为起始页的偏移量
    pub fn offset(page: u32, page_size: u32) -> u64 {
        (page.max(1) as u64 - 1) * page_size as u64
    }
}

/// 分页后的通知列表
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPage {
    pub items: Vec<FeedItem>,
    pub pagination: Pagination,
}

/// 带未读数的通知列表
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedResponse {
    #[serde(flatten)]
    pub page: FeedPage,
    pub unread_count: u64,
}

/// 通知的聚合计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationCounters {
    pub sent_count: i32,
    pub delivered_count: i32,
    pub read_count: i32,
}

impl NotificationCounters {
    /// 根据追踪记录计算计数：delivered 为非 failed 的记录数
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a TrackerRecord>) -> Self {
        records
            .into_iter()
            .fold(Self::default(), |mut acc, r| {
                acc.sent_count += 1;
                if r.delivery_status != DeliveryStatus::Failed {
                    acc.delivered_count += 1;
                }
                if r.read {
                    acc.read_count += 1;
                }
                acc
            })
    }
}

/// 单个接收人的投递情况
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientStatus {
    pub status: DeliveryStatus,
    pub read: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub deleted: bool,
}

impl From<&TrackerRecord> for RecipientStatus {
    fn from(r: &TrackerRecord) -> Self {
        Self {
            status: r.delivery_status,
            read: r.read,
            delivered_at: r.delivered_at,
            read_at: r.read_at,
            error: r.error_message.clone(),
            deleted: r.deleted,
        }
    }
}

/// 通知投递状态报告
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    pub notification_id: Uuid,
    pub total_recipients: i32,
    pub recipients: BTreeMap<String, RecipientStatus>,
    /// 按投递状态聚合的记录数
    pub by_status: BTreeMap<String, u64>,
    pub read: u64,
    /// 通知上保存的计数（可能滞后于追踪记录）
    pub stored_counters: NotificationCounters,
}

impl DeliveryReport {
    pub fn build(notification: &Notification, records: &[TrackerRecord]) -> Self {
        let mut by_status = BTreeMap::new();
        for status in [
            DeliveryStatus::Sent,
            DeliveryStatus::Delivered,
            DeliveryStatus::Failed,
        ] {
            by_status.insert(status.as_str().to_string(), 0u64);
        }
        let mut read = 0;
        let mut recipients = BTreeMap::new();

        for record in records {
            *by_status
                .entry(record.delivery_status.as_str().to_string())
                .or_default() += 1;
            if record.read {
                read += 1;
            }
            recipients.insert(record.user_id.clone(), RecipientStatus::from(record));
        }

        Self {
            notification_id: notification.id,
            total_recipients: notification.total_recipients,
            recipients,
            by_status,
            read,
            stored_counters: NotificationCounters {
                sent_count: notification.sent_count,
                delivered_count: notification.delivered_count,
                read_count: notification.read_count,
            },
        }
    }
}

/// 用户阅读统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserReadingStats {
    pub total: u64,
    pub read: u64,
    pub delivered: u64,
    pub failed: u64,
    /// 从创建到阅读的平均耗时（秒）
    pub avg_read_seconds: Option<f64>,
    /// 阅读率（百分比）
    pub reading_rate: f64,
    /// 送达率（百分比）
    pub delivery_rate: f64,
}

impl UserReadingStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a TrackerRecord>) -> Self {
        let mut stats = Self::default();
        let mut read_seconds = Vec::new();

        for r in records {
            stats.total += 1;
            match r.delivery_status {
                DeliveryStatus::Delivered => stats.delivered += 1,
                DeliveryStatus::Failed => stats.failed += 1,
                DeliveryStatus::Sent => {}
            }
            if r.read {
                stats.read += 1;
                if let Some(read_at) = r.read_at {
                    read_seconds.push((read_at - r.created_at).num_milliseconds() as f64 / 1000.0);
                }
            }
        }

        if !read_seconds.is_empty() {
            stats.avg_read_seconds =
                Some(read_seconds.iter().sum::<f64>() / read_seconds.len() as f64);
        }
        stats.finish_rates();
        stats
    }

    /// 根据计数计算百分比
    pub fn finish_rates(&mut self) {
        if self.total > 0 {
            self.reading_rate = self.read as f64 * 100.0 / self.total as f64;
            self.delivery_rate = self.delivered as f64 * 100.0 / self.total as f64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: DeliveryStatus, read: bool) -> TrackerRecord {
        let mut r = TrackerRecord::new(Uuid::now_v7(), "u1", Utc::now());
        r.delivery_status = status;
        r.read = read;
        r
    }

    #[test]
    fn test_counters_from_records() {
        let records = vec![
            record(DeliveryStatus::Delivered, true),
            record(DeliveryStatus::Sent, false),
            record(DeliveryStatus::Failed, false),
        ];
        let counters = NotificationCounters::from_records(&records);
        assert_eq!(
            counters,
            NotificationCounters {
                sent_count: 3,
                delivered_count: 2,
                read_count: 1,
            }
        );
    }

    #[test]
    fn test_pagination() {
        let p = Pagination::new(2, 20, 45);
        assert_eq!(p.pages, 3);
        assert_eq!(Pagination::offset(1, 20), 0);
        assert_eq!(Pagination::offset(3, 20), 40);
        assert_eq!(Pagination::offset(0, 20), 0);
    }

    #[test]
    fn test_reading_stats_rates() {
        let records = vec![
            record(DeliveryStatus::Delivered, true),
            record(DeliveryStatus::Delivered, false),
            record(DeliveryStatus::Failed, false),
            record(DeliveryStatus::Sent, true),
        ];
        let stats = UserReadingStats::from_records(&records);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.read, 2);
        assert_eq!(stats.failed, 1);
        assert!((stats.reading_rate - 50.0).abs() < f64::EPSILON);
        assert!((stats.delivery_rate - 50.0).abs() < f64::EPSILON);
    }
}
