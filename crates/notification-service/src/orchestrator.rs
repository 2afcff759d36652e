//! 通知编排器
//!
//! 串联校验、持久化、追踪记录、缓存失效与推送分发。
//! `create_notification` 在持久化成功后立即返回，缓存失效与推送都在后台任务中按接收人有界并发执行；
//! 单个 token 或接收人的推送失败只记录在追踪记录上，不会影响其他接收人。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use notify_shared::observability::metrics;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::cache::{CacheScope, FeedCache};
use crate::dispatcher::{DeliveryOutcome, Dispatcher, PushMessage};
use crate::error::{NotificationError, Result};
use crate::models::{
    CreateNotificationRequest, CreateNotificationResponse, DeliveryReport, DeviceSummary,
    DeviceTarget, DeviceUpdate, FeedPage, FeedResponse, Notification, RegisterDeviceRequest,
    Transition, UserReadingStats,
};
use crate::realtime::{NoopRealtimeSink, RealtimeSink};
use crate::registry::DeviceRegistry;
use crate::tracker::{DeliveryTracker, NotificationRepository};

/// 没有可用设备时写入追踪记录的失败原因
pub const NO_PUSH_TOKENS: &str = "No push tokens found";

/// 单页最大条数
pub const MAX_PAGE_SIZE: u32 = 100;

/// 单个接收人的推送结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientOutcome {
    Delivered,
    Failed,
    NoTokens,
}

/// 一次分发的汇总
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub delivered: usize,
    pub failed: usize,
    pub no_tokens: usize,
}

impl DispatchSummary {
    fn record(&mut self, outcome: RecipientOutcome) {
        match outcome {
            RecipientOutcome::Delivered => self.delivered += 1,
            RecipientOutcome::Failed => self.failed += 1,
            RecipientOutcome::NoTokens => self.no_tokens += 1,
        }
    }
}

/// 后台推送流水线，可在 spawn 的任务中独立运行
#[derive(Clone)]
struct DeliveryPipeline {
    tracker: Arc<DeliveryTracker>,
    registry: Arc<DeviceRegistry>,
    dispatcher: Arc<Dispatcher>,
    cache: Arc<FeedCache>,
    max_concurrency: usize,
}

impl DeliveryPipeline {
    async fn run(&self, notification: Arc<Notification>) -> DispatchSummary {
        let message = Arc::new(push_message(&notification));

        let pipeline = self.clone();
        let shared = notification.clone();
        let deliveries = stream::iter(notification.recipients.clone())
            .map(move |user_id| {
                let pipeline = pipeline.clone();
                let notification = shared.clone();
                let message = message.clone();
                async move { pipeline.deliver_to(&notification, &message, &user_id).await }
            })
            .buffer_unordered(self.max_concurrency)
            .collect::<Vec<RecipientOutcome>>();

        // 新通知进入列表与未读数，先让接收人的缓存失效，与推送并行进行
        let ((), outcomes) = tokio::join!(
            self.cache.invalidate_many(&notification.recipients),
            deliveries
        );

        let summary = outcomes
            .into_iter()
            .fold(DispatchSummary::default(), |mut acc, o| {
                acc.record(o);
                acc
            });

        // 列表中带有投递状态，推送结束后需要再清一次
        self.cache.invalidate_many(&notification.recipients).await;

        info!(
            notification_id = %notification.id,
            delivered = summary.delivered,
            failed = summary.failed,
            no_tokens = summary.no_tokens,
            "通知推送完成"
        );
        summary
    }

    async fn deliver_to(
        &self,
        notification: &Notification,
        message: &PushMessage,
        user_id: &str,
    ) -> RecipientOutcome {
        let targets: Vec<DeviceTarget> = self
            .registry
            .active_tokens(user_id)
            .await
            .into_values()
            .collect();

        if targets.is_empty() {
            debug!(notification_id = %notification.id, user_id, "接收人没有可用设备");
            self.record_failure(notification.id, user_id, NO_PUSH_TOKENS)
                .await;
            return RecipientOutcome::NoTokens;
        }

        let results = self.dispatcher.send(&targets, message).await;

        let mut reasons = Vec::new();
        let mut any_success = false;
        for result in &results {
            match &result.outcome {
                DeliveryOutcome::Success { .. } => any_success = true,
                DeliveryOutcome::Expired { reason } => {
                    info!(user_id, device_id = %result.device_id, reason = %reason, "推送 token 已失效，停用设备");
                    self.registry.deactivate(user_id, &result.device_id).await;
                    reasons.push(format!("{}: {reason}", result.device_id));
                }
                DeliveryOutcome::Failure { reason } => {
                    reasons.push(format!("{}: {reason}", result.device_id));
                }
            }
            self.registry
                .record_send_result(user_id, &result.device_id, result.outcome.is_success())
                .await;
        }

        if any_success {
            if let Err(e) = self.tracker.mark_delivered(notification.id, user_id).await {
                warn!(notification_id = %notification.id, user_id, error = %e, "更新送达状态失败");
            }
            RecipientOutcome::Delivered
        } else {
            self.record_failure(notification.id, user_id, &reasons.join("; "))
                .await;
            RecipientOutcome::Failed
        }
    }

    async fn record_failure(&self, notification_id: Uuid, user_id: &str, reason: &str) {
        if let Err(e) = self.tracker.mark_failed(notification_id, user_id, reason).await {
            warn!(%notification_id, user_id, error = %e, "更新失败状态失败");
        }
    }
}

/// 推送内容：附带通知 ID 与类型，便于客户端跳转
fn push_message(notification: &Notification) -> PushMessage {
    let mut data = match &notification.data {
        serde_json::Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    data.insert(
        "notificationId".to_string(),
        serde_json::Value::String(notification.id.to_string()),
    );
    data.insert(
        "type".to_string(),
        serde_json::Value::String(notification.notification_type.as_str().to_string()),
    );

    PushMessage {
        title: notification.title.clone(),
        body: notification.message.clone(),
        data: serde_json::Value::Object(data),
        priority: notification.priority,
    }
}

/// 通知编排器
pub struct NotificationOrchestrator {
    notifications: Arc<dyn NotificationRepository>,
    realtime: Arc<dyn RealtimeSink>,
    pipeline: DeliveryPipeline,
}

impl NotificationOrchestrator {
    pub fn new(
        notifications: Arc<dyn NotificationRepository>,
        tracker: Arc<DeliveryTracker>,
        registry: Arc<DeviceRegistry>,
        dispatcher: Arc<Dispatcher>,
        cache: Arc<FeedCache>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            notifications,
            realtime: Arc::new(NoopRealtimeSink),
            pipeline: DeliveryPipeline {
                tracker,
                registry,
                dispatcher,
                cache,
                max_concurrency: max_concurrency.max(1),
            },
        }
    }

    pub fn with_realtime(mut self, realtime: Arc<dyn RealtimeSink>) -> Self {
        self.realtime = realtime;
        self
    }

    fn tracker(&self) -> &DeliveryTracker {
        &self.pipeline.tracker
    }

    fn cache(&self) -> &FeedCache {
        &self.pipeline.cache
    }

    fn registry(&self) -> &DeviceRegistry {
        &self.pipeline.registry
    }

    // ==================== 创建与分发 ====================

    /// 创建通知并在后台推送
    pub async fn create_notification(
        &self,
        request: CreateNotificationRequest,
    ) -> Result<CreateNotificationResponse> {
        let notification = self.persist(request, Utc::now()).await?;
        let response = CreateNotificationResponse {
            notification_id: notification.id,
            recipient_count: notification.recipients.len(),
        };

        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            pipeline.run(notification).await;
        });

        Ok(response)
    }

    /// 创建通知并等待推送完成，返回推送汇总
    pub async fn create_and_dispatch(
        &self,
        request: CreateNotificationRequest,
    ) -> Result<(CreateNotificationResponse, DispatchSummary)> {
        let notification = self.persist(request, Utc::now()).await?;
        let response = CreateNotificationResponse {
            notification_id: notification.id,
            recipient_count: notification.recipients.len(),
        };
        let summary = self.pipeline.run(notification).await;
        Ok((response, summary))
    }

    /// 校验并持久化，完成后通知实时频道
    #[instrument(skip(self, request), fields(notification_type = ?request.notification_type))]
    async fn persist(
        &self,
        request: CreateNotificationRequest,
        now: DateTime<Utc>,
    ) -> Result<Arc<Notification>> {
        request.validate()?;

        let notification = Notification::from_request(&request, now);
        self.notifications
            .insert_notification(&notification)
            .await
            .inspect_err(|e| error!(error = %e, "通知持久化失败"))?;

        self.tracker()
            .create_records(notification.id, &notification.recipients)
            .await?;

        self.realtime
            .notification_created(notification.id, &notification.recipients)
            .await;

        metrics::record_notification_created(
            notification.notification_type.as_str(),
            notification.recipients.len(),
        );
        info!(
            notification_id = %notification.id,
            recipients = notification.recipients.len(),
            "通知已创建"
        );
        Ok(Arc::new(notification))
    }

    // ==================== 读状态 ====================

    pub async fn mark_read(&self, notification_id: Uuid, user_id: &str) -> Result<Transition> {
        let transition = self.tracker().mark_read(notification_id, user_id).await?;
        self.cache().invalidate(user_id).await;
        Ok(transition)
    }

    pub async fn mark_all_read(&self, user_id: &str) -> Result<u64> {
        let count = self.tracker().mark_all_read(user_id).await?;
        self.cache().invalidate(user_id).await;
        Ok(count)
    }

    pub async fn delete_notification(&self, notification_id: Uuid, user_id: &str) -> Result<Transition> {
        let transition = self.tracker().delete(notification_id, user_id).await?;
        self.cache().invalidate(user_id).await;
        Ok(transition)
    }

    pub async fn delete_all(&self, user_id: &str) -> Result<u64> {
        let count = self.tracker().delete_all(user_id).await?;
        self.cache().invalidate(user_id).await;
        Ok(count)
    }

    // ==================== 查询 ====================

    /// 分页列表，每页条数限制在 1..=100
    pub async fn get_feed(&self, user_id: &str, page: u32, page_size: u32) -> Result<FeedResponse> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let scope = CacheScope::feed(user_id, page, page_size);

        let feed = match self.cache().get::<FeedPage>(&scope).await {
            Some(cached) => cached,
            None => {
                let fresh = self
                    .tracker()
                    .paginated_feed(user_id, page, page_size)
                    .await?;
                self.cache()
                    .set(&scope, &fresh, self.cache().ttl_for(&scope))
                    .await;
                fresh
            }
        };

        let unread_count = self.unread_count(user_id).await?;
        Ok(FeedResponse {
            page: feed,
            unread_count,
        })
    }

    pub async fn unread_count(&self, user_id: &str) -> Result<u64> {
        let scope = CacheScope::unread(user_id);
        if let Some(count) = self.cache().get::<u64>(&scope).await {
            return Ok(count);
        }
        let count = self.tracker().unread_count(user_id).await?;
        self.cache()
            .set(&scope, &count, self.cache().ttl_for(&scope))
            .await;
        Ok(count)
    }

    pub async fn delivery_status(&self, notification_id: Uuid) -> Result<DeliveryReport> {
        self.tracker().delivery_status(notification_id).await
    }

    pub async fn reading_stats(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<UserReadingStats> {
        self.tracker().reading_stats(user_id, since).await
    }

    // ==================== 设备 ====================

    pub async fn register_device(&self, user_id: &str, request: RegisterDeviceRequest) -> Result<String> {
        let payload = DeviceRegistry::payload_from_request(&request)?;
        self.registry()
            .register(user_id, request.device_id.as_deref(), payload)
            .await
    }

    pub async fn list_devices(&self, user_id: &str) -> Vec<DeviceSummary> {
        self.registry().list_devices(user_id).await
    }

    pub async fn update_device(
        &self,
        user_id: &str,
        device_id: &str,
        update: &DeviceUpdate,
    ) -> Result<DeviceSummary> {
        self.registry().update_device(user_id, device_id, update).await
    }

    pub async fn touch_device(&self, user_id: &str, device_id: &str) -> Result<()> {
        if self.registry().touch(user_id, device_id).await {
            Ok(())
        } else {
            Err(NotificationError::not_found("Device", device_id))
        }
    }

    /// 注销设备；不指定设备 ID 时注销该用户全部设备，返回删除数量
    pub async fn unregister_device(&self, user_id: &str, device_id: Option<&str>) -> Result<u64> {
        match device_id {
            Some(id) => {
                if self.registry().remove(user_id, id).await {
                    Ok(1)
                } else {
                    Err(NotificationError::not_found("Device", id))
                }
            }
            None => Ok(self.registry().remove_all(user_id).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;

    use crate::cache::{CacheBackend, MemoryCacheBackend};
    use crate::dispatcher::{ExpoTicket, MockExpoTransport};
    use crate::models::{NotificationType, Priority};
    use crate::registry::MemoryDeviceStore;
    use crate::tracker::{MemoryNotificationStore, MockNotificationRepository};

    /// 删除操作固定耗时 20ms 的缓存后端
    #[derive(Default)]
    struct SlowCacheBackend {
        inner: MemoryCacheBackend,
    }

    #[async_trait]
    impl CacheBackend for SlowCacheBackend {
        async fn get(&self, key: &str) -> notify_shared::error::Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Duration) -> notify_shared::error::Result<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, keys: &[String]) -> notify_shared::error::Result<u64> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.inner.delete(keys).await
        }

        async fn delete_prefix(&self, prefix: &str) -> notify_shared::error::Result<u64> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.inner.delete_prefix(prefix).await
        }
    }

    fn slow_cache_orchestrator() -> NotificationOrchestrator {
        let store = MemoryNotificationStore::new();
        NotificationOrchestrator::new(
            Arc::new(store.clone()),
            Arc::new(DeliveryTracker::new(Arc::new(store.clone()), Arc::new(store))),
            Arc::new(DeviceRegistry::with_defaults(Arc::new(MemoryDeviceStore::new()))),
            Arc::new(Dispatcher::with_defaults(Arc::new(MockExpoTransport::new()))),
            Arc::new(FeedCache::with_defaults(Arc::new(SlowCacheBackend::default()))),
            16,
        )
    }

    fn many_users(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("user-{i}")).collect()
    }

    fn orchestrator(transport: MockExpoTransport) -> (NotificationOrchestrator, Arc<DeviceRegistry>) {
        let store = MemoryNotificationStore::new();
        let registry = Arc::new(DeviceRegistry::with_defaults(Arc::new(MemoryDeviceStore::new())));
        let orchestrator = NotificationOrchestrator::new(
            Arc::new(store.clone()),
            Arc::new(DeliveryTracker::new(Arc::new(store.clone()), Arc::new(store))),
            registry.clone(),
            Arc::new(Dispatcher::with_defaults(Arc::new(transport))),
            Arc::new(FeedCache::with_defaults(Arc::new(MemoryCacheBackend::new()))),
            4,
        );
        (orchestrator, registry)
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected_before_persistence() {
        let mut repo = MockNotificationRepository::new();
        repo.expect_insert_notification().never();

        let store = MemoryNotificationStore::new();
        let orchestrator = NotificationOrchestrator::new(
            Arc::new(repo),
            Arc::new(DeliveryTracker::new(Arc::new(store.clone()), Arc::new(store))),
            Arc::new(DeviceRegistry::with_defaults(Arc::new(MemoryDeviceStore::new()))),
            Arc::new(Dispatcher::with_defaults(Arc::new(MockExpoTransport::new()))),
            Arc::new(FeedCache::with_defaults(Arc::new(MemoryCacheBackend::new()))),
            4,
        );

        let request = CreateNotificationRequest::new("t", "m", vec![], NotificationType::System);
        let err = orchestrator.create_notification(request).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_create_does_not_wait_for_cache() {
        let orchestrator = slow_cache_orchestrator();
        let request =
            CreateNotificationRequest::new("t", "m", many_users(100), NotificationType::System);

        let started = Instant::now();
        let created = orchestrator.create_notification(request).await.unwrap();

        assert_eq!(created.recipient_count, 100);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_background_invalidation_is_concurrent() {
        let orchestrator = slow_cache_orchestrator();
        let request =
            CreateNotificationRequest::new("t", "m", many_users(100), NotificationType::System);

        // 逐个串行失效需要 100 x 2 x 20ms x 2 轮
        let started = Instant::now();
        let (_, summary) = orchestrator.create_and_dispatch(request).await.unwrap();

        assert_eq!(summary.no_tokens, 100);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_push_message_carries_id_and_type() {
        let request = CreateNotificationRequest::new("t", "m", vec!["u".to_string()], NotificationType::Chat)
            .with_priority(Priority::Low)
            .with_data(serde_json::json!({"ticketCode": "T-1"}));
        let notification = Notification::from_request(&request, Utc::now());
        let message = push_message(&notification);
        assert_eq!(message.data["ticketCode"], "T-1");
        assert_eq!(message.data["type"], "chat");
        assert_eq!(message.data["notificationId"], notification.id.to_string());
        assert_eq!(message.priority, Priority::Low);
    }

    #[tokio::test]
    async fn test_feed_is_cached_until_invalidated() {
        let (orchestrator, _) = orchestrator(MockExpoTransport::new());
        let request = CreateNotificationRequest::new("t", "m", vec!["u1".to_string()], NotificationType::System);
        let (created, summary) = orchestrator.create_and_dispatch(request).await.unwrap();
        assert_eq!(summary.no_tokens, 1);

        let feed = orchestrator.get_feed("u1", 1, 500).await.unwrap();
        assert_eq!(feed.page.pagination.page_size, MAX_PAGE_SIZE);
        assert_eq!(feed.page.items.len(), 1);
        assert_eq!(feed.unread_count, 1);

        orchestrator.mark_read(created.notification_id, "u1").await.unwrap();
        let feed = orchestrator.get_feed("u1", 1, 500).await.unwrap();
        assert!(feed.page.items[0].read);
        assert_eq!(feed.unread_count, 0);
    }

    #[tokio::test]
    async fn test_expired_device_is_deactivated() {
        let mut transport = MockExpoTransport::new();
        transport
            .expect_send_batch()
            .returning(|_| Ok(vec![ExpoTicket::error("gone", Some("DeviceNotRegistered"))]));
        let (orchestrator, registry) = orchestrator(transport);

        let device = RegisterDeviceRequest {
            platform: "expo".to_string(),
            device_token: Some("ExponentPushToken[abc]".to_string()),
            device_id: Some("phone".to_string()),
            ..Default::default()
        };
        orchestrator.register_device("u1", device).await.unwrap();

        let request = CreateNotificationRequest::new("t", "m", vec!["u1".to_string()], NotificationType::System);
        let (_, summary) = orchestrator.create_and_dispatch(request).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert!(registry.active_tokens("u1").await.is_empty());

        let devices = orchestrator.list_devices("u1").await;
        assert_eq!(devices[0].failure_count, 1);
        assert!(!devices[0].is_active);
    }

    #[tokio::test]
    async fn test_unregister_unknown_device_is_not_found() {
        let (orchestrator, _) = orchestrator(MockExpoTransport::new());
        let err = orchestrator
            .unregister_device("u1", Some("nope"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        assert_eq!(orchestrator.unregister_device("u1", None).await.unwrap(), 0);
    }
}
