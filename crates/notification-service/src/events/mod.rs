//! 跨服务事件
//!
//! 上游服务通过 Redis pub/sub 发布事件，订阅任务把原始消息解析为封闭的 [`InboundEvent`]
//! 枚举后写入有界通道，由独立的路由任务逐条处理。未知事件在解析阶段即被拒绝并记录日志。

mod attendance;
mod router;
mod subscriber;
mod templates;

pub use attendance::{
    AttendanceDecision, AttendancePolicy, LocalizedLocation, StaffWindow, localize_location,
    parse_device_location, staff_window,
};
pub use router::EventRouter;
pub use subscriber::EventSubscriber;
pub use templates::render;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::CreateNotificationRequest;

/// 消息信封：`{service, event, data, timestamp}`
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub service: String,
    pub timestamp: Option<String>,
    pub event: InboundEvent,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    service: String,
    event: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    timestamp: Option<serde_json::Value>,
}

impl EventEnvelope {
    /// 解析 pub/sub 消息体
    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        let raw: RawEnvelope = serde_json::from_str(payload)?;
        let event = serde_json::from_value::<InboundEvent>(serde_json::json!({
            "event": raw.event,
            "data": raw.data,
        }))?;
        let timestamp = raw.timestamp.map(|t| match t {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });
        Ok(Self {
            service: raw.service,
            timestamp,
            event,
        })
    }
}

/// 上游事件
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    TicketCreated(TicketCreated),
    TicketUpdated(TicketUpdated),
    TicketAssigned(TicketAssigned),
    TicketStatusChanged(TicketStatusChanged),
    TicketFeedback(TicketFeedback),
    MessageSent(MessageSent),
    SystemMaintenance(SystemMaintenance),
    EmergencyNotification(EmergencyNotification),
    ServiceStatus(ServiceStatus),
    StaffAttendance(AttendanceEvent),
    StudentAttendance(AttendanceEvent),
    SendNotification(CreateNotificationRequest),
}

impl InboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TicketCreated(_) => "ticket_created",
            Self::TicketUpdated(_) => "ticket_updated",
            Self::TicketAssigned(_) => "ticket_assigned",
            Self::TicketStatusChanged(_) => "ticket_status_changed",
            Self::TicketFeedback(_) => "ticket_feedback",
            Self::MessageSent(_) => "message_sent",
            Self::SystemMaintenance(_) => "system_maintenance",
            Self::EmergencyNotification(_) => "emergency_notification",
            Self::ServiceStatus(_) => "service_status",
            Self::StaffAttendance(_) => "staff_attendance",
            Self::StudentAttendance(_) => "student_attendance",
            Self::SendNotification(_) => "send_notification",
        }
    }
}

// ---------------------------------------------------------------------------
// 工单事件
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketCreated {
    #[serde(default)]
    pub ticket_id: Option<String>,
    pub ticket_code: String,
    #[serde(default)]
    pub creator_id: Option<String>,
    #[serde(default)]
    pub creator_name: Option<String>,
    #[serde(default)]
    pub admin_users: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketUpdated {
    #[serde(default)]
    pub ticket_id: Option<String>,
    pub ticket_code: String,
    #[serde(default)]
    pub updated_by: Option<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketAssigned {
    #[serde(default)]
    pub ticket_id: Option<String>,
    pub ticket_code: String,
    pub assigned_to_id: String,
    #[serde(default)]
    pub assigned_to_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketStatusChanged {
    #[serde(default)]
    pub ticket_id: Option<String>,
    pub ticket_code: String,
    #[serde(default)]
    pub old_status: Option<String>,
    pub new_status: String,
    #[serde(default)]
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketFeedback {
    #[serde(default)]
    pub ticket_id: Option<String>,
    pub ticket_code: String,
    pub rating: f64,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSent {
    #[serde(default)]
    pub ticket_id: Option<String>,
    pub ticket_code: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
}

// ---------------------------------------------------------------------------
// 广播事件
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMaintenance {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub maintenance_time: Option<String>,
    #[serde(default)]
    pub duration: Option<serde_json::Value>,
    #[serde(default)]
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyNotification {
    pub message: String,
    #[serde(default)]
    pub emergency_type: Option<String>,
    #[serde(default)]
    pub action_required: Option<serde_json::Value>,
    #[serde(default)]
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub service: String,
    pub status: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
    #[serde(default)]
    pub recipients: Vec<String>,
}

// ---------------------------------------------------------------------------
// 考勤事件
// ---------------------------------------------------------------------------

/// 刷脸机考勤事件，员工与学生共用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceEvent {
    /// 员工编号或学生编号
    pub employee_code: String,
    #[serde(default)]
    pub employee_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub check_in_time: Option<String>,
    #[serde(default)]
    pub check_out_time: Option<String>,
}

/// 事件处理结果；被去重抑制不是错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Handled { notification_id: Uuid },
    Suppressed { reason: String },
}

impl EventOutcome {
    pub fn suppressed(reason: impl Into<String>) -> Self {
        Self::Suppressed {
            reason: reason.into(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handled { .. } => "handled",
            Self::Suppressed { .. } => "suppressed",
        }
    }
}
