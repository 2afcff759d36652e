//! 事件路由任务
//!
//! 从通道中逐条取出事件，按事件类型匹配处理器并创建通知。
//! 单个事件处理失败只记录日志，不影响后续事件。

use std::sync::Arc;

use notify_shared::observability::metrics;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use super::attendance::{AttendanceDecision, AttendancePolicy};
use super::{EventEnvelope, EventOutcome, InboundEvent, templates};
use crate::error::Result;
use crate::models::CreateNotificationRequest;
use crate::orchestrator::NotificationOrchestrator;

/// 事件路由器
pub struct EventRouter {
    orchestrator: Arc<NotificationOrchestrator>,
    attendance: AttendancePolicy,
}

impl EventRouter {
    pub fn new(orchestrator: Arc<NotificationOrchestrator>, attendance: AttendancePolicy) -> Self {
        Self {
            orchestrator,
            attendance,
        }
    }

    /// 主循环，通道关闭或收到关闭信号后退出
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<EventEnvelope>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("EventRouter 已启动");
        loop {
            let envelope = tokio::select! {
                envelope = events.recv() => envelope,
                _ = shutdown.changed() => break,
            };
            let Some(envelope) = envelope else {
                break;
            };

            let name = envelope.event.name();
            match self.handle(envelope).await {
                Ok(outcome) => {
                    metrics::record_inbound_event(name, outcome.as_str());
                    match outcome {
                        EventOutcome::Handled { notification_id } => {
                            info!(event = name, %notification_id, "事件已处理")
                        }
                        EventOutcome::Suppressed { reason } => {
                            info!(event = name, reason = %reason, outcome = "suppressed", "事件未生成通知")
                        }
                    }
                }
                Err(e) => {
                    metrics::record_inbound_event(name, "error");
                    warn!(event = name, error = %e, code = e.code(), "事件处理失败");
                }
            }
        }
        info!("EventRouter 已停止");
    }

    /// 处理单个事件
    pub async fn handle(&self, envelope: EventEnvelope) -> Result<EventOutcome> {
        let request = match &envelope.event {
            InboundEvent::StaffAttendance(event) => match self.attendance.staff(event).await? {
                AttendanceDecision::Notify(request) => request,
                AttendanceDecision::Skip(reason) => return Ok(EventOutcome::suppressed(reason)),
            },
            InboundEvent::StudentAttendance(event) => match self.attendance.student(event).await? {
                AttendanceDecision::Notify(request) => request,
                AttendanceDecision::Skip(reason) => return Ok(EventOutcome::suppressed(reason)),
            },
            InboundEvent::SendNotification(request) => request.clone(),
            other => match templates::render(other) {
                Some(request) => request,
                None => return Ok(EventOutcome::suppressed("no template")),
            },
        };

        self.create(request).await
    }

    async fn create(&self, request: CreateNotificationRequest) -> Result<EventOutcome> {
        if request.recipients.is_empty() {
            return Ok(EventOutcome::suppressed("no recipients"));
        }
        let created = self.orchestrator.create_notification(request).await?;
        Ok(EventOutcome::Handled {
            notification_id: created.notification_id,
        })
    }
}
