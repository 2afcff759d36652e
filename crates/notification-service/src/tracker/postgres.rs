//! Postgres 存储实现
//!
//! 状态迁移依靠带条件的 `UPDATE ... WHERE` 保证原子性，批量插入依靠 `ON CONFLICT DO NOTHING` 保证幂等。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use super::traits::{NotificationRepository, TrackerRepository};
use crate::error::Result;
use crate::models::{
    FeedItem, FeedPage, Notification, NotificationCounters, Pagination, TrackerRecord, Transition,
};

const NOTIFICATION_COLUMNS: &str = r#"
    n.id, n.title, n.message, n.notification_type, n.priority, n.channel, n.data,
    n.recipients, n.total_recipients, n.sent_count, n.delivered_count, n.read_count,
    n.created_by, n.created_at, n.updated_at
"#;

const RECORD_COLUMNS: &str = r#"
    notification_id, user_id, delivery_status, read, read_at, delivered_at,
    error_message, deleted, deleted_at, created_at, updated_at
"#;

/// 基于 Postgres 的通知与追踪记录存储
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 未命中更新时区分“记录不存在”和“状态不允许”
    async fn classify_noop(&self, notification_id: Uuid, user_id: &str) -> Result<Transition> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM notification_reads
                WHERE notification_id = $1 AND user_id = $2
            )
            "#,
        )
        .bind(notification_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(if exists {
            Transition::Unchanged
        } else {
            Transition::Missing
        })
    }

    async fn finish_transition(
        &self,
        rows_affected: u64,
        notification_id: Uuid,
        user_id: &str,
    ) -> Result<Transition> {
        if rows_affected > 0 {
            Ok(Transition::Applied)
        } else {
            self.classify_noop(notification_id, user_id).await
        }
    }
}

#[async_trait]
impl NotificationRepository for PgNotificationStore {
    async fn insert_notification(&self, n: &Notification) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, title, message, notification_type, priority, channel, data,
                recipients, total_recipients, sent_count, delivered_count, read_count,
                created_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(n.id)
        .bind(Json(&n.title))
        .bind(Json(&n.message))
        .bind(n.notification_type)
        .bind(n.priority)
        .bind(n.channel)
        .bind(&n.data)
        .bind(&n.recipients)
        .bind(n.total_recipients)
        .bind(n.sent_count)
        .bind(n.delivered_count)
        .bind(n.read_count)
        .bind(&n.created_by)
        .bind(n.created_at)
        .bind(n.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>> {
        let sql = format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications n WHERE n.id = $1");
        let notification = sqlx::query_as::<_, Notification>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(notification)
    }

    async fn touched_since(&self, since: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT DISTINCT notification_id
            FROM notification_reads
            WHERE updated_at > $1
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn recompute_counters(&self, id: Uuid) -> Result<Option<NotificationCounters>> {
        let row = sqlx::query_as::<_, (i32, i32, i32)>(
            r#"
            UPDATE notifications n
            SET sent_count = c.sent,
                delivered_count = c.delivered,
                read_count = c.read,
                updated_at = NOW()
            FROM (
                SELECT COUNT(*)::int AS sent,
                       COUNT(*) FILTER (WHERE delivery_status <> 'failed')::int AS delivered,
                       COUNT(*) FILTER (WHERE read)::int AS read
                FROM notification_reads
                WHERE notification_id = $1
            ) c
            WHERE n.id = $1
            RETURNING n.sent_count, n.delivered_count, n.read_count
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(sent_count, delivered_count, read_count)| NotificationCounters {
            sent_count,
            delivered_count,
            read_count,
        }))
    }
}

#[async_trait]
impl TrackerRepository for PgNotificationStore {
    async fn insert_records(
        &self,
        notification_id: Uuid,
        user_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            INSERT INTO notification_reads (
                notification_id, user_id, delivery_status, read, deleted, created_at, updated_at
            )
            SELECT $1, u, 'sent', false, false, $3, $3
            FROM UNNEST($2::text[]) AS u
            ON CONFLICT (notification_id, user_id) DO NOTHING
            "#,
        )
        .bind(notification_id)
        .bind(user_ids)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn mark_delivered(
        &self,
        notification_id: Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let result = sqlx::query(
            r#"
            UPDATE notification_reads
            SET delivery_status = 'delivered', delivered_at = $3, updated_at = $3
            WHERE notification_id = $1 AND user_id = $2 AND delivery_status = 'sent'
            "#,
        )
        .bind(notification_id)
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.finish_transition(result.rows_affected(), notification_id, user_id)
            .await
    }

    async fn mark_failed(
        &self,
        notification_id: Uuid,
        user_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let result = sqlx::query(
            r#"
            UPDATE notification_reads
            SET delivery_status = 'failed', error_message = $3, updated_at = $4
            WHERE notification_id = $1 AND user_id = $2 AND delivery_status = 'sent'
            "#,
        )
        .bind(notification_id)
        .bind(user_id)
        .bind(reason)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.finish_transition(result.rows_affected(), notification_id, user_id)
            .await
    }

    async fn mark_read(
        &self,
        notification_id: Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let result = sqlx::query(
            r#"
            UPDATE notification_reads
            SET read = true, read_at = $3, updated_at = $3
            WHERE notification_id = $1 AND user_id = $2 AND read = false
            "#,
        )
        .bind(notification_id)
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.finish_transition(result.rows_affected(), notification_id, user_id)
            .await
    }

    async fn mark_all_read(&self, user_id: &str, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE notification_reads
            SET read = true, read_at = $2, updated_at = $2
            WHERE user_id = $1 AND read = false AND deleted = false
            "#,
        )
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn soft_delete(
        &self,
        notification_id: Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let result = sqlx::query(
            r#"
            INSERT INTO notification_reads (
                notification_id, user_id, delivery_status, read, deleted, deleted_at,
                created_at, updated_at
            )
            VALUES ($1, $2, 'sent', false, true, $3, $3, $3)
            ON CONFLICT (notification_id, user_id) DO UPDATE
            SET deleted = true, deleted_at = EXCLUDED.deleted_at, updated_at = EXCLUDED.updated_at
            WHERE notification_reads.deleted = false
            "#,
        )
        .bind(notification_id)
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() > 0 {
            Transition::Applied
        } else {
            Transition::Unchanged
        })
    }

    async fn soft_delete_all(&self, user_id: &str, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE notification_reads
            SET deleted = true, deleted_at = $2, updated_at = $2
            WHERE user_id = $1 AND deleted = false
            "#,
        )
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn unread_count(&self, user_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM notification_reads
            WHERE user_id = $1 AND read = false AND deleted = false
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn feed(&self, user_id: &str, page: u32, page_size: u32) -> Result<FeedPage> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM notifications n
            LEFT JOIN notification_reads r
                ON r.notification_id = n.id AND r.user_id = $1
            WHERE $1 = ANY(n.recipients) AND COALESCE(r.deleted, false) = false
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let sql = format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS},
                   COALESCE(r.read, false) AS read,
                   r.read_at,
                   r.delivery_status
            FROM notifications n
            LEFT JOIN notification_reads r
                ON r.notification_id = n.id AND r.user_id = $1
            WHERE $1 = ANY(n.recipients) AND COALESCE(r.deleted, false) = false
            ORDER BY n.created_at DESC
            LIMIT $2 OFFSET $3
            "#
        );
        let items = sqlx::query_as::<_, FeedItem>(&sql)
            .bind(user_id)
            .bind(page_size as i64)
            .bind(Pagination::offset(page, page_size) as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(FeedPage {
            items,
            pagination: Pagination::new(page, page_size, total.max(0) as u64),
        })
    }

    async fn records_for_notification(&self, notification_id: Uuid) -> Result<Vec<TrackerRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM notification_reads WHERE notification_id = $1 ORDER BY user_id"
        );
        let records = sqlx::query_as::<_, TrackerRecord>(&sql)
            .bind(notification_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn records_for_user(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<TrackerRecord>> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM notification_reads
            WHERE user_id = $1 AND ($2::timestamptz IS NULL OR created_at >= $2)
            ORDER BY created_at DESC
            "#
        );
        let records = sqlx::query_as::<_, TrackerRecord>(&sql)
            .bind(user_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }
}
