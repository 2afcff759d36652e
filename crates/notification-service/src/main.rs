//! 通知中心服务入口
//!
//! 装配存储、推送通道、缓存与后台任务：延迟队列轮询、跨服务事件订阅、
//! 设备注册表清理和通知计数对账。收到 Ctrl+C 或 SIGTERM 后通知所有后台任务退出。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use notify_shared::{config::AppConfig, observability, redis_client::RedisClient};
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use notification_service::{
    cache::{FeedCache, RedisCacheBackend},
    db::NotificationDb,
    dedup::{DedupGuard, RedisMarkerStore},
    directory::PassthroughDirectory,
    dispatcher::{Dispatcher, ExpoHttpClient, VapidWebPushClient, WebPushTransport},
    events::{AttendancePolicy, EventRouter, EventSubscriber},
    orchestrator::NotificationOrchestrator,
    queue::{QueuePoller, RedisNotificationQueue},
    realtime::RedisRealtimeSink,
    registry::{DeviceRegistry, RedisDeviceStore},
    tracker::{DeliveryTracker, PgNotificationStore},
    workers::{CounterReconciler, RegistrySweeper},
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置
    let config = AppConfig::load("notification-service").unwrap_or_else(|e| {
        eprintln!("配置加载失败，使用默认配置: {e}");
        AppConfig {
            service_name: "notification-service".to_string(),
            ..Default::default()
        }
    });

    // 2. 可观测性
    let obs_config = config.observability.clone().with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    info!("Starting notification-service...");
    info!(environment = %config.environment, "Configuration loaded");

    // 3. 数据库、迁移与表结构检查
    let db = NotificationDb::open(&config.database).await?;
    let pool = db.pool().clone();

    // 4. Redis
    let redis = RedisClient::new(&config.redis)?;
    redis.health_check().await?;
    info!("Redis connection established");

    // 5. 存储与领域组件
    let store = Arc::new(PgNotificationStore::new(pool.clone()));
    let tracker = Arc::new(DeliveryTracker::new(store.clone(), store.clone()));
    let registry = Arc::new(DeviceRegistry::new(
        Arc::new(RedisDeviceStore::new(redis.clone())),
        config.registry.stale_after_days,
    ));
    let dedup = Arc::new(DedupGuard::new(
        Arc::new(RedisMarkerStore::new(redis.clone())),
        config.dedup.utc_offset_hours,
    ));
    let cache = Arc::new(FeedCache::new(
        Arc::new(RedisCacheBackend::new(redis.clone())),
        &config.cache,
    ));

    // 6. 推送通道
    let expo = Arc::new(ExpoHttpClient::new(
        &config.push.expo_endpoint,
        config.push.expo_access_token.clone(),
        config.push.request_timeout(),
    )?);
    let web_push: Option<Arc<dyn WebPushTransport>> = match &config.push.vapid_private_key_path {
        Some(path) => {
            let client = VapidWebPushClient::from_pem_file(
                Path::new(path),
                &config.push.vapid_subject,
                config.push.web_push_ttl_secs,
            )?;
            info!("Web Push 已启用");
            Some(Arc::new(client))
        }
        None => {
            warn!("未配置 VAPID 私钥，Web Push 订阅将记为投递失败");
            None
        }
    };
    let dispatcher = Arc::new(Dispatcher::new(
        expo,
        web_push,
        config.push.expo_batch_size,
        &config.push.default_language,
    ));

    // 7. 编排器
    let orchestrator = Arc::new(
        NotificationOrchestrator::new(
            store.clone(),
            tracker,
            registry.clone(),
            dispatcher,
            cache,
            config.dispatch.max_concurrency,
        )
        .with_realtime(Arc::new(RedisRealtimeSink::new(
            redis.clone(),
            &config.events.realtime_channel,
        ))),
    );
    info!("Notification orchestrator initialized");

    // 8. 后台任务
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    let poller = QueuePoller::new(
        Arc::new(RedisNotificationQueue::new(redis.clone(), &config.queue.key)),
        orchestrator.clone(),
        &config.queue,
    );
    let rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move { poller.run(rx).await }));

    if config.events.enabled {
        let (event_tx, event_rx) = mpsc::channel(config.events.buffer_size.max(1));

        let subscriber = EventSubscriber::new(redis.clone(), config.events.channels.clone());
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { subscriber.run(event_tx, rx).await }));

        let attendance = AttendancePolicy::new(
            dedup,
            Arc::new(PassthroughDirectory),
            Duration::from_secs(config.dedup.attendance_window_secs),
            &config.events.guardian_email_domain,
        );
        let router = EventRouter::new(orchestrator.clone(), attendance);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { router.run(event_rx, rx).await }));
    } else {
        info!("跨服务事件订阅未启用");
    }

    let sweeper = RegistrySweeper::new(registry, config.registry.sweep_interval_secs);
    let rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move { sweeper.run(rx).await }));

    let reconciler = CounterReconciler::new(store, &config.tracker);
    let rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move { reconciler.run(rx).await }));

    info!(tasks = tasks.len(), "notification-service 已启动");

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "后台任务异常退出");
        }
    }

    db.close().await;
    info!("notification-service 已停止");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("注册 Ctrl+C 处理器失败");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("注册 SIGTERM 处理器失败")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到 Ctrl+C，开始优雅关闭"),
        _ = terminate => info!("收到 SIGTERM，开始优雅关闭"),
    }
}
