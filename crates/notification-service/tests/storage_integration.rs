//! 存储集成测试
//!
//! 使用真实 PostgreSQL 和 Redis 验证追踪记录的原子迁移与设备注册表的持久化格式。
//!
//! ## 运行方式
//!
//! ```bash
//! DATABASE_URL=postgres://... REDIS_URL=redis://... \
//!   cargo test --test storage_integration -- --ignored
//! ```

use std::sync::Arc;

use chrono::Utc;
use notify_shared::config::RedisConfig;
use notify_shared::redis_client::RedisClient;
use sqlx::PgPool;

use notification_service::{
    db::NotificationDb,
    models::{CreateNotificationRequest, Notification, NotificationType, RegisterDeviceRequest, Transition},
    registry::{DeviceRegistry, RedisDeviceStore},
    tracker::{NotificationRepository, PgNotificationStore, TrackerRepository},
};

// ==================== 辅助函数 ====================

fn database_url() -> String {
    std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests")
}

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

async fn setup_store() -> PgNotificationStore {
    let pool = PgPool::connect(&database_url()).await.expect("连接数据库失败");
    let db = NotificationDb::from_pool(pool);
    db.migrate().await.expect("执行迁移失败");
    db.health_check().await.expect("表结构检查失败");
    PgNotificationStore::new(db.pool().clone())
}

async fn seed_notification(store: &PgNotificationStore, recipients: &[&str]) -> Notification {
    let request = CreateNotificationRequest::new(
        "Kiểm thử",
        "Nội dung kiểm thử",
        recipients.iter().map(|s| s.to_string()).collect(),
        NotificationType::System,
    );
    let notification = Notification::from_request(&request, Utc::now());
    store.insert_notification(&notification).await.unwrap();
    store
        .insert_records(notification.id, &notification.recipients, Utc::now())
        .await
        .unwrap();
    notification
}

// ==================== PostgreSQL ====================

#[tokio::test]
#[ignore = "需要 PostgreSQL 数据库连接"]
async fn test_insert_records_is_idempotent() {
    let store = setup_store().await;
    let n = seed_notification(&store, &["it-u1", "it-u2"]).await;

    let inserted = store
        .insert_records(n.id, &n.recipients, Utc::now())
        .await
        .unwrap();
    assert_eq!(inserted, 0);
    assert_eq!(store.records_for_notification(n.id).await.unwrap().len(), 2);
}

#[tokio::test]
#[ignore = "需要 PostgreSQL 数据库连接"]
async fn test_failed_is_terminal() {
    let store = setup_store().await;
    let n = seed_notification(&store, &["it-u1"]).await;

    let t = store.mark_failed(n.id, "it-u1", "boom", Utc::now()).await.unwrap();
    assert_eq!(t, Transition::Applied);
    let t = store.mark_delivered(n.id, "it-u1", Utc::now()).await.unwrap();
    assert_eq!(t, Transition::Unchanged);
    let t = store.mark_delivered(n.id, "nobody", Utc::now()).await.unwrap();
    assert_eq!(t, Transition::Missing);
}

#[tokio::test]
#[ignore = "需要 PostgreSQL 数据库连接"]
async fn test_recompute_counters() {
    let store = setup_store().await;
    let n = seed_notification(&store, &["it-u1", "it-u2", "it-u3"]).await;
    store.mark_delivered(n.id, "it-u1", Utc::now()).await.unwrap();
    store.mark_failed(n.id, "it-u2", "No push tokens found", Utc::now()).await.unwrap();
    store.mark_read(n.id, "it-u1", Utc::now()).await.unwrap();

    let counters = store.recompute_counters(n.id).await.unwrap().unwrap();
    assert_eq!(counters.sent_count, 3);
    assert_eq!(counters.delivered_count, 2);
    assert_eq!(counters.read_count, 1);
}

// ==================== Redis ====================

#[tokio::test]
#[ignore = "需要 Redis"]
async fn test_registry_round_trip_in_redis() {
    let redis = RedisClient::new(&RedisConfig {
        url: redis_url(),
        ..Default::default()
    })
    .expect("创建 Redis 客户端失败");
    let registry = DeviceRegistry::with_defaults(Arc::new(RedisDeviceStore::new(redis)));

    let user = format!("it-user-{}", uuid::Uuid::now_v7());
    let device_id = registry
        .register(
            &user,
            Some("it-phone"),
            DeviceRegistry::payload_from_request(&RegisterDeviceRequest {
                platform: "expo".to_string(),
                device_token: Some("ExponentPushToken[integration]".to_string()),
                ..Default::default()
            })
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(device_id, "it-phone");
    assert_eq!(registry.active_tokens(&user).await.len(), 1);

    assert_eq!(registry.remove_all(&user).await, 1);
    assert!(registry.active_tokens(&user).await.is_empty());
}
