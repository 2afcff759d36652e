//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册指标描述，出现在 /metrics 的 HELP 注释中
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "notifications_created_total",
        "Total number of notifications persisted"
    );
    metrics::describe_counter!(
        "push_deliveries_total",
        "Push delivery results by channel and outcome"
    );
    metrics::describe_histogram!(
        "push_batch_duration_seconds",
        "Duration of a single provider batch call"
    );
    metrics::describe_counter!("dedup_decisions_total", "Dedup guard decisions");
    metrics::describe_counter!("cache_operations_total", "Feed cache operations by result");
    metrics::describe_counter!(
        "registry_sweep_removed_total",
        "Device entries removed by the registry sweep"
    );
    metrics::describe_counter!("queue_items_total", "Deferred queue items by result");
    metrics::describe_counter!("inbound_events_total", "Inbound pub/sub events by outcome");
    metrics::describe_gauge!("worker_last_run_timestamp", "Last run of a periodic worker");

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录通知创建
#[inline]
pub fn record_notification_created(notification_type: &str, recipients: usize) {
    metrics::counter!(
        "notifications_created_total",
        "type" => notification_type.to_string()
    )
    .increment(1);
    metrics::histogram!("notification_recipients").record(recipients as f64);
}

/// 记录单个 token 的推送结果
#[inline]
pub fn record_push_delivery(channel: &str, outcome: &str) {
    metrics::counter!(
        "push_deliveries_total",
        "channel" => channel.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// 记录一次推送服务商批量调用的耗时
#[inline]
pub fn record_push_batch(channel: &str, duration_secs: f64) {
    metrics::histogram!(
        "push_batch_duration_seconds",
        "channel" => channel.to_string()
    )
    .record(duration_secs);
}

/// 记录去重判定（proceed / suppressed / fail_open）
#[inline]
pub fn record_dedup_decision(policy: &str, decision: &str) {
    metrics::counter!(
        "dedup_decisions_total",
        "policy" => policy.to_string(),
        "decision" => decision.to_string()
    )
    .increment(1);
}

/// 记录缓存操作（hit / miss / error / invalidate）
#[inline]
pub fn record_cache_operation(op: &str, result: &str) {
    metrics::counter!(
        "cache_operations_total",
        "op" => op.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// 记录注册表清理移除的条目
#[inline]
pub fn record_sweep_removed(kind: &str, count: u64) {
    metrics::counter!(
        "registry_sweep_removed_total",
        "kind" => kind.to_string()
    )
    .increment(count);
}

/// 记录延迟队列条目处理结果
#[inline]
pub fn record_queue_item(result: &str) {
    metrics::counter!("queue_items_total", "result" => result.to_string()).increment(1);
}

/// 记录跨服务事件处理结果
#[inline]
pub fn record_inbound_event(event: &str, outcome: &str) {
    metrics::counter!(
        "inbound_events_total",
        "event" => event.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// 记录周期任务的最近运行时间
#[inline]
pub fn set_worker_last_run(worker: &str) {
    metrics::gauge!(
        "worker_last_run_timestamp",
        "worker" => worker.to_string()
    )
    .set(chrono::Utc::now().timestamp() as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_do_not_panic() {
        // 未安装 recorder 时这些函数也不应 panic
        record_notification_created("ticket", 3);
        record_push_delivery("expo", "success");
        record_push_batch("expo", 0.2);
        record_dedup_decision("window", "suppressed");
        record_cache_operation("feed", "hit");
        record_sweep_removed("legacy", 2);
        record_queue_item("processed");
        record_inbound_event("ticket_created", "handled");
        set_worker_last_run("registry_sweeper");
    }
}
