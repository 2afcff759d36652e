//! 考勤通知策略
//!
//! 员工：按当地时间划分时段，午休时段（12:00 到 13:00 整）不发通知；
//! 当天第一次刷脸发送“Check-in”，之后的刷脸发送“FaceID ghi nhận”。
//! 学生：同一学生 5 分钟内只通知一次，通知发给所有家长，内容为越南语与英语双语。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use super::AttendanceEvent;
use crate::dedup::DedupGuard;
use crate::directory::DirectoryLookup;
use crate::error::Result;
use crate::models::{CreateNotificationRequest, LocalizedText, NotificationType, Priority};

const STAFF_SCOPE: &str = "staff_attendance";
const STUDENT_SCOPE: &str = "student_attendance";
const UNKNOWN_DEVICE: &str = "Unknown Device";
const DEFAULT_LOCATION: &str = "cổng trường";

/// 员工考勤时段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaffWindow {
    CheckIn,
    Lunch,
    CheckOut,
}

impl StaffWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckIn => "checkin",
            Self::Lunch => "lunch",
            Self::CheckOut => "checkout",
        }
    }
}

/// 按当地时间判断时段：12 点整点小时内以及 13:00 整属于午休
pub fn staff_window<T: Timelike>(local: &T) -> StaffWindow {
    match (local.hour(), local.minute()) {
        (12, _) | (13, 0) => StaffWindow::Lunch,
        (h, _) if h < 12 => StaffWindow::CheckIn,
        _ => StaffWindow::CheckOut,
    }
}

/// 解析设备名，`"Gate 2 - Check In"` 拆为位置与动作
pub fn parse_device_location(device_name: Option<&str>) -> (String, Option<String>) {
    let Some(name) = device_name.map(str::trim).filter(|n| !n.is_empty()) else {
        return (DEFAULT_LOCATION.to_string(), None);
    };
    match name.split_once(" - ") {
        Some((location, action)) => {
            let action = action.split(" - ").next().unwrap_or(action).trim();
            (location.trim().to_string(), Some(action.to_string()))
        }
        None => (name.to_string(), None),
    }
}

/// 双语位置名
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalizedLocation {
    pub vi: String,
    pub en: String,
}

const LOCATION_TRANSLATIONS: &[(&str, &str, &str)] = &[
    ("Gate 2", "Cổng 2", "Gate 2"),
    ("Gate 5", "Cổng 5", "Gate 5"),
    ("Main Gate", "Cổng chính", "Main Gate"),
    ("School Entrance", "Lối vào trường", "School Entrance"),
    ("Front Gate", "Cổng trước", "Front Gate"),
    ("Back Gate", "Cổng sau", "Back Gate"),
    ("Cổng 2", "Cổng 2", "Gate 2"),
    ("Cổng 5", "Cổng 5", "Gate 5"),
    ("Cổng chính", "Cổng chính", "Main Gate"),
    ("Lối vào trường", "Lối vào trường", "School Entrance"),
    ("Cổng trước", "Cổng trước", "Front Gate"),
    ("Cổng sau", "Cổng sau", "Back Gate"),
];

/// 查翻译表，先精确匹配再忽略大小写，查不到时两种语言都用原文
pub fn localize_location(location: &str) -> LocalizedLocation {
    let found = LOCATION_TRANSLATIONS
        .iter()
        .find(|(key, _, _)| *key == location)
        .or_else(|| {
            let lower = location.to_lowercase();
            LOCATION_TRANSLATIONS
                .iter()
                .find(|(key, _, _)| key.to_lowercase() == lower)
        });

    match found {
        Some((_, vi, en)) => LocalizedLocation {
            vi: vi.to_string(),
            en: en.to_string(),
        },
        None => LocalizedLocation {
            vi: location.to_string(),
            en: location.to_string(),
        },
    }
}

/// 考勤事件的处理结论
#[derive(Debug, Clone, PartialEq)]
pub enum AttendanceDecision {
    Notify(CreateNotificationRequest),
    Skip(String),
}

/// 考勤通知策略
pub struct AttendancePolicy {
    dedup: Arc<DedupGuard>,
    directory: Arc<dyn DirectoryLookup>,
    student_window: Duration,
    guardian_email_domain: String,
}

impl AttendancePolicy {
    pub fn new(
        dedup: Arc<DedupGuard>,
        directory: Arc<dyn DirectoryLookup>,
        student_window: Duration,
        guardian_email_domain: &str,
    ) -> Self {
        Self {
            dedup,
            directory,
            student_window,
            guardian_email_domain: guardian_email_domain.to_string(),
        }
    }

    fn local(&self, at: DateTime<Utc>) -> DateTime<FixedOffset> {
        at.with_timezone(&self.dedup.offset())
    }

    /// 员工考勤
    pub async fn staff(&self, event: &AttendanceEvent) -> Result<AttendanceDecision> {
        let local = self.local(event.timestamp);
        let window = staff_window(&local);
        if window == StaffWindow::Lunch {
            info!(employee_code = %event.employee_code, time = %local.format("%H:%M"), outcome = "suppressed", "午休时段，跳过考勤通知");
            return Ok(AttendanceDecision::Skip("lunch break".to_string()));
        }

        let first_of_day = self
            .dedup
            .first_of_day(STAFF_SCOPE, &event.employee_code, event.timestamp)
            .await;

        let user_id = self
            .directory
            .resolve_employee(&event.employee_code)
            .await?
            .unwrap_or_else(|| event.employee_code.clone());

        let device = event
            .device_name
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or(UNKNOWN_DEVICE);
        let time = local.format("%H:%M %d/%m");
        let message = if first_of_day {
            format!("Check-in lúc {time} tại {device}")
        } else {
            format!("FaceID ghi nhận lúc {time} tại {device}")
        };

        debug!(employee_code = %event.employee_code, user_id = %user_id, window = window.as_str(), first_of_day, "生成员工考勤通知");

        let request = CreateNotificationRequest::new(
            "Chấm công",
            message,
            vec![user_id],
            NotificationType::Attendance,
        )
        .with_data(json!({
            "employeeCode": event.employee_code,
            "employeeName": event.employee_name,
            "timestamp": event.timestamp.to_rfc3339(),
            "deviceName": event.device_name,
            "timeWindow": window.as_str(),
            "isFirstOfDay": first_of_day,
            "type": STAFF_SCOPE,
        }));
        Ok(AttendanceDecision::Notify(request))
    }

    /// 学生考勤，通知家长
    pub async fn student(&self, event: &AttendanceEvent) -> Result<AttendanceDecision> {
        if !self
            .dedup
            .should_proceed(STUDENT_SCOPE, &event.employee_code, self.student_window)
            .await
        {
            return Ok(AttendanceDecision::Skip(format!(
                "duplicate within {}s",
                self.student_window.as_secs()
            )));
        }

        let Some(student) = self.directory.find_student(&event.employee_code).await? else {
            info!(student_code = %event.employee_code, "目录中没有该学生，跳过");
            return Ok(AttendanceDecision::Skip("unknown student".to_string()));
        };
        if student.guardian_ids.is_empty() {
            info!(student_code = %student.code, "学生没有家长账号，跳过");
            return Ok(AttendanceDecision::Skip("no guardians".to_string()));
        }

        let recipients: Vec<String> = student
            .guardian_ids
            .iter()
            .map(|id| format!("{id}@{}", self.guardian_email_domain))
            .collect();

        let (location, action) = parse_device_location(event.device_name.as_deref());
        let localized = localize_location(&location);
        let time = self.local(event.timestamp).format("%H:%M %d/%m").to_string();

        let title = LocalizedText::localized([("vi", "Điểm danh"), ("en", "Attendance")]);
        let message = LocalizedText::localized([
            ("vi", format!("{} đã qua {} vào {time}", student.name, localized.vi)),
            ("en", format!("{} passed {} at {time}", student.name, localized.en)),
        ]);

        let request = CreateNotificationRequest::new(
            title,
            message,
            recipients,
            NotificationType::Attendance,
        )
        .with_priority(Priority::High)
        .with_data(json!({
            "studentId": student.id,
            "studentCode": student.code,
            "studentName": student.name,
            "time": time,
            "location": localized,
            "action": action,
            "timestamp": event.timestamp.to_rfc3339(),
            "deviceName": event.device_name,
            "checkInTime": event.check_in_time,
            "checkOutTime": event.check_out_time,
            "notificationType": STUDENT_SCOPE,
        }));
        Ok(AttendanceDecision::Notify(request))
    }
}
