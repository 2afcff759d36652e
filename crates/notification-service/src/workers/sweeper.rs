//! 设备注册表清理 Worker
//!
//! 定期移除遗留格式条目和长期不活跃的设备，清空后的用户容器一并删除。

use std::sync::Arc;
use std::time::Duration;

use notify_shared::observability::metrics;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::registry::DeviceRegistry;

/// 注册表清理 Worker
pub struct RegistrySweeper {
    registry: Arc<DeviceRegistry>,
    /// 清理间隔（默认每天一次）
    interval: Duration,
}

impl RegistrySweeper {
    pub fn new(registry: Arc<DeviceRegistry>, interval_secs: u64) -> Self {
        Self {
            registry,
            interval: Duration::from_secs(interval_secs.max(1)),
        }
    }

    pub fn with_defaults(registry: Arc<DeviceRegistry>) -> Self {
        Self::new(registry, 86_400)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "RegistrySweeper 已启动");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => break,
            }

            let report = self.registry.sweep().await;
            debug!(removed = report.total_removed(), "RegistrySweeper 本轮结束");
            metrics::set_worker_last_run("registry_sweeper");
        }
        info!("RegistrySweeper 已停止");
    }
}
