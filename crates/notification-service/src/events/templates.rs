//! 事件通知模板
//!
//! 把工单、聊天与广播事件渲染为创建通知请求。标题固定，便于客户端聚合同类通知；
//! 正文从事件字段填充，缺失字段使用占位符。

use serde_json::json;

use super::InboundEvent;
use crate::models::{CreateNotificationRequest, NotificationType, Priority};

/// 渲染事件；考勤与直接发送事件不走模板，返回 None
pub fn render(event: &InboundEvent) -> Option<CreateNotificationRequest> {
    let request = match event {
        InboundEvent::TicketCreated(e) => CreateNotificationRequest::new(
            "Ticket mới được tạo",
            format!(
                "Ticket #{} đã được tạo bởi {}",
                e.ticket_code,
                or_unknown(e.creator_name.as_deref())
            ),
            e.admin_users.clone(),
            NotificationType::Ticket,
        )
        .with_priority(Priority::High)
        .with_data(json!({
            "event": event.name(),
            "ticketId": e.ticket_id,
            "ticketCode": e.ticket_code,
            "creatorId": e.creator_id,
        })),

        InboundEvent::TicketUpdated(e) => CreateNotificationRequest::new(
            "Ticket đã được cập nhật",
            format!("Ticket #{} đã được cập nhật", e.ticket_code),
            e.recipients.clone(),
            NotificationType::Ticket,
        )
        .with_data(json!({
            "event": event.name(),
            "ticketId": e.ticket_id,
            "ticketCode": e.ticket_code,
            "updatedBy": e.updated_by,
        })),

        InboundEvent::TicketAssigned(e) => CreateNotificationRequest::new(
            "Ticket đã được gán",
            format!(
                "Ticket #{} đã được gán cho {}",
                e.ticket_code,
                or_unknown(e.assigned_to_name.as_deref())
            ),
            vec![e.assigned_to_id.clone()],
            NotificationType::Ticket,
        )
        .with_priority(Priority::High)
        .with_data(json!({
            "event": event.name(),
            "ticketId": e.ticket_id,
            "ticketCode": e.ticket_code,
            "assignedToId": e.assigned_to_id,
        })),

        InboundEvent::TicketStatusChanged(e) => CreateNotificationRequest::new(
            "Trạng thái ticket đã thay đổi",
            format!("Ticket #{} {}", e.ticket_code, status_phrase(&e.new_status)),
            e.recipients.clone(),
            NotificationType::Ticket,
        )
        .with_data(json!({
            "event": event.name(),
            "ticketId": e.ticket_id,
            "ticketCode": e.ticket_code,
            "oldStatus": e.old_status,
            "newStatus": e.new_status,
        })),

        InboundEvent::TicketFeedback(e) => CreateNotificationRequest::new(
            "Ticket đã nhận đánh giá",
            format!(
                "Ticket #{} đã được đánh giá {}/5 sao",
                e.ticket_code, e.rating
            ),
            e.recipients.clone(),
            NotificationType::Ticket,
        )
        .with_data(json!({
            "event": event.name(),
            "ticketId": e.ticket_id,
            "ticketCode": e.ticket_code,
            "rating": e.rating,
            "comment": e.comment,
        })),

        InboundEvent::MessageSent(e) => CreateNotificationRequest::new(
            "Tin nhắn mới trong ticket",
            format!("Có tin nhắn mới trong ticket #{}", e.ticket_code),
            e.recipients.clone(),
            NotificationType::Chat,
        )
        .with_priority(Priority::Low)
        .with_data(json!({
            "event": event.name(),
            "ticketId": e.ticket_id,
            "ticketCode": e.ticket_code,
            "messageId": e.message_id,
            "senderId": e.sender_id,
        })),

        InboundEvent::SystemMaintenance(e) => CreateNotificationRequest::new(
            "Bảo trì hệ thống",
            e.message
                .clone()
                .unwrap_or_else(|| "Hệ thống sẽ bảo trì trong thời gian sắp tới".to_string()),
            e.recipients.clone(),
            NotificationType::System,
        )
        .with_priority(Priority::High)
        .with_data(json!({
            "event": event.name(),
            "maintenanceTime": e.maintenance_time,
            "duration": e.duration,
        })),

        InboundEvent::EmergencyNotification(e) => CreateNotificationRequest::new(
            "Thông báo khẩn cấp",
            e.message.clone(),
            e.recipients.clone(),
            NotificationType::System,
        )
        .with_priority(Priority::Urgent)
        .with_data(json!({
            "event": event.name(),
            "emergencyType": e.emergency_type,
            "actionRequired": e.action_required,
        })),

        InboundEvent::ServiceStatus(e) => CreateNotificationRequest::new(
            "Trạng thái dịch vụ",
            format!("Dịch vụ {} {}", e.service, e.status),
            e.recipients.clone(),
            NotificationType::System,
        )
        .with_data(json!({
            "event": event.name(),
            "service": e.service,
            "status": e.status,
            "details": e.details,
        })),

        InboundEvent::StaffAttendance(_)
        | InboundEvent::StudentAttendance(_)
        | InboundEvent::SendNotification(_) => return None,
    };
    Some(request)
}

/// 工单状态的越南语描述，未知状态原样返回
fn status_phrase(status: &str) -> &str {
    match status {
        "Processing" | "In Progress" => "đang được xử lý",
        "Done" | "Completed" => "đã hoàn thành",
        "Closed" => "đã đóng",
        "Cancelled" => "đã bị hủy",
        other => other,
    }
}

fn or_unknown(value: Option<&str>) -> &str {
    value.filter(|v| !v.trim().is_empty()).unwrap_or("N/A")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{TicketFeedback, TicketStatusChanged};
    use crate::models::LocalizedText;

    #[test]
    fn test_status_changed_is_translated() {
        let event = InboundEvent::TicketStatusChanged(TicketStatusChanged {
            ticket_id: Some("t1".to_string()),
            ticket_code: "T-7".to_string(),
            old_status: Some("Assigned".to_string()),
            new_status: "Done".to_string(),
            recipients: vec!["u1".to_string()],
        });
        let request = render(&event).unwrap();
        assert_eq!(request.message, LocalizedText::from("Ticket #T-7 đã hoàn thành"));
        assert_eq!(request.notification_type, NotificationType::Ticket);
        assert_eq!(request.data["newStatus"], "Done");
    }

    #[test]
    fn test_unknown_status_is_kept() {
        assert_eq!(status_phrase("Waiting"), "Waiting");
    }

    #[test]
    fn test_feedback_rating() {
        let event = InboundEvent::TicketFeedback(TicketFeedback {
            ticket_id: None,
            ticket_code: "T-9".to_string(),
            rating: 4.0,
            comment: None,
            recipients: vec!["u1".to_string()],
        });
        let request = render(&event).unwrap();
        assert_eq!(
            request.message,
            LocalizedText::from("Ticket #T-9 đã được đánh giá 4/5 sao")
        );
    }
}
