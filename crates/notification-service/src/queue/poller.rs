//! 队列轮询 Worker

use std::sync::Arc;
use std::time::Duration;

use notify_shared::config::QueueConfig;
use notify_shared::observability::metrics;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::NotificationQueue;
use crate::models::CreateNotificationRequest;
use crate::orchestrator::NotificationOrchestrator;

/// 单次轮询的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub created: usize,
    pub dropped: usize,
    pub failed: usize,
}

/// 队列轮询 Worker
///
/// 以固定间隔从队列取出元素，走与直接创建相同的路径。
/// 无法解析的元素记录日志后丢弃。
pub struct QueuePoller {
    queue: Arc<dyn NotificationQueue>,
    orchestrator: Arc<NotificationOrchestrator>,
    poll_interval: Duration,
    max_items_per_tick: usize,
}

impl QueuePoller {
    pub fn new(
        queue: Arc<dyn NotificationQueue>,
        orchestrator: Arc<NotificationOrchestrator>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            max_items_per_tick: config.max_items_per_tick.max(1),
        }
    }

    /// 主循环，收到关闭信号后退出
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval = ?self.poll_interval,
            max_items_per_tick = self.max_items_per_tick,
            "QueuePoller 已启动"
        );

        loop {
            let report = self.poll_once().await;
            if report.created + report.dropped + report.failed > 0 {
                info!(
                    created = report.created,
                    dropped = report.dropped,
                    failed = report.failed,
                    "队列轮询完成"
                );
            }
            metrics::set_worker_last_run("queue_poller");

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("QueuePoller 已停止");
    }

    /// 取出并处理至多 `max_items_per_tick` 个元素
    pub async fn poll_once(&self) -> PollReport {
        let mut report = PollReport::default();

        for _ in 0..self.max_items_per_tick {
            let raw = match self.queue.pop().await {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "读取通知队列失败");
                    break;
                }
            };

            let request = match serde_json::from_str::<CreateNotificationRequest>(&raw) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, item = %raw, "队列元素无法解析，已丢弃");
                    metrics::record_queue_item("dropped");
                    report.dropped += 1;
                    continue;
                }
            };

            match self.orchestrator.create_notification(request).await {
                Ok(created) => {
                    debug!(notification_id = %created.notification_id, "队列通知已创建");
                    metrics::record_queue_item("created");
                    report.created += 1;
                }
                Err(e) => {
                    warn!(error = %e, code = e.code(), "队列通知创建失败");
                    metrics::record_queue_item("failed");
                    report.failed += 1;
                }
            }
        }

        report
    }
}
