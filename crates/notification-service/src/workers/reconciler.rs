//! 通知计数对账 Worker
//!
//! 状态迁移不会实时更新通知上的计数。本 Worker 周期性找出追踪记录有变化的通知，
//! 按记录重新计算 `sent_count`、`delivered_count`、`read_count`，再推进水位。
//! 某次对账失败时水位不动，下一轮会重新覆盖同一时间窗。
//!
//! 追踪记录的 `updated_at` 在写入提交之前就已确定，提交可能晚于本轮查询。
//! 因此每轮从 `水位 - grace` 开始查询，重叠部分会被重复重算，重算是幂等的。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify_shared::config::TrackerConfig;
use notify_shared::observability::metrics;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::tracker::NotificationRepository;

/// 单次对账的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub touched: usize,
    pub updated: usize,
    pub missing: usize,
}

/// 计数对账 Worker
pub struct CounterReconciler {
    notifications: Arc<dyn NotificationRepository>,
    interval: Duration,
    grace: chrono::Duration,
    watermark: Mutex<DateTime<Utc>>,
}

impl CounterReconciler {
    pub fn new(notifications: Arc<dyn NotificationRepository>, config: &TrackerConfig) -> Self {
        let watermark = Utc::now() - chrono::Duration::seconds(config.reconcile_lookback_secs.max(0));
        Self {
            notifications,
            interval: Duration::from_secs(config.reconcile_interval_secs.max(1)),
            grace: chrono::Duration::seconds(config.reconcile_grace_secs.max(0)),
            watermark: Mutex::new(watermark),
        }
    }

    pub fn with_defaults(notifications: Arc<dyn NotificationRepository>) -> Self {
        Self::new(notifications, &TrackerConfig::default())
    }

    pub fn watermark(&self) -> DateTime<Utc> {
        *self.watermark.lock()
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "CounterReconciler 已启动");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => break,
            }

            match self.reconcile_once().await {
                Ok(report) if report.touched > 0 => info!(
                    touched = report.touched,
                    updated = report.updated,
                    missing = report.missing,
                    "通知计数对账完成"
                ),
                Ok(_) => debug!("没有需要对账的通知"),
                Err(e) => error!(error = %e, "通知计数对账失败，下一轮重试"),
            }
            metrics::set_worker_last_run("counter_reconciler");
        }
        info!("CounterReconciler 已停止");
    }

    /// 执行一轮对账，全部成功后推进水位
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        // 先取时间再查询，查询期间发生的变化留给下一轮
        let started = Utc::now();
        let since = self.watermark() - self.grace;

        let ids = self.notifications.touched_since(since).await?;
        let mut report = ReconcileReport {
            touched: ids.len(),
            ..Default::default()
        };

        for id in ids {
            match self.notifications.recompute_counters(id).await? {
                Some(counters) => {
                    debug!(notification_id = %id, ?counters, "计数已重算");
                    report.updated += 1;
                }
                None => {
                    warn!(notification_id = %id, "追踪记录对应的通知不存在");
                    report.missing += 1;
                }
            }
        }

        *self.watermark.lock() = started;
        Ok(report)
    }
}
