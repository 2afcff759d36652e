//! 通知实体与创建请求

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// 通知创建者的默认标识
pub const DEFAULT_CREATED_BY: &str = "notification-service";

/// 单条通知允许的最大接收人数
pub const MAX_RECIPIENTS: usize = 10_000;

/// 纯文本或按语言区分的多语言文本
///
/// JSON 中表现为字符串或 `{"vi": "...", "en": "..."}` 对象。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LocalizedText {
    Plain(String),
    Localized(BTreeMap<String, String>),
}

impl LocalizedText {
    /// 按 设备语言 -> 默认语言 -> 任意语言 的顺序取文本
    pub fn resolve<'a>(&'a self, language: Option<&str>, default_language: &str) -> &'a str {
        match self {
            Self::Plain(text) => text,
            Self::Localized(variants) => language
                .and_then(|lang| variants.get(lang))
                .or_else(|| variants.get(default_language))
                .or_else(|| variants.values().next())
                .map(String::as_str)
                .unwrap_or_default(),
        }
    }

    /// 没有任何非空文本时视为空
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Plain(text) => text.trim().is_empty(),
            Self::Localized(variants) => variants.values().all(|v| v.trim().is_empty()),
        }
    }

    pub fn localized<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::Localized(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<&str> for LocalizedText {
    fn from(value: &str) -> Self {
        Self::Plain(value.to_string())
    }
}

impl From<String> for LocalizedText {
    fn from(value: String) -> Self {
        Self::Plain(value)
    }
}

/// 通知分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum NotificationType {
    Attendance,
    Ticket,
    Chat,
    System,
    Post,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attendance => "attendance",
            Self::Ticket => "ticket",
            Self::Chat => "chat",
            Self::System => "system",
            Self::Post => "post",
        }
    }
}

/// 通知优先级
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// 通知渠道提示
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum DeliveryChannel {
    #[default]
    Push,
    Email,
    System,
}

/// 通知
///
/// 由编排器创建一次；计数字段由对账任务根据追踪记录重新计算，本身不作为权威数据。
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    #[sqlx(json)]
    pub title: LocalizedText,
    #[sqlx(json)]
    pub message: LocalizedText,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub priority: Priority,
    pub channel: DeliveryChannel,
    pub data: serde_json::Value,
    pub recipients: Vec<String>,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub delivered_count: i32,
    pub read_count: i32,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    /// 从已校验的创建请求构造通知实体
    ///
    /// 接收人按首次出现顺序去重；`data.timestamp` 存在时作为事件发生时间，晚于当前时间的按当前时间处理。
    pub fn from_request(request: &CreateNotificationRequest, now: DateTime<Utc>) -> Self {
        let recipients = dedup_recipients(&request.recipients);
        let created_at = event_time(&request.data, now);
        let data = if request.data.is_null() {
            serde_json::json!({})
        } else {
            request.data.clone()
        };

        Self {
            id: Uuid::now_v7(),
            title: request.title.clone(),
            message: request.message.clone(),
            notification_type: request.notification_type,
            priority: request.priority,
            channel: request.channel,
            data,
            total_recipients: recipients.len() as i32,
            recipients,
            sent_count: 0,
            delivered_count: 0,
            read_count: 0,
            created_by: DEFAULT_CREATED_BY.to_string(),
            created_at,
            updated_at: now,
        }
    }
}

fn dedup_recipients(recipients: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    recipients
        .iter()
        .map(|r| r.trim())
        .filter(|r| seen.insert(r.to_string()))
        .map(str::to_string)
        .collect()
}

/// 解析事件发生时间
pub fn event_time(data: &serde_json::Value, now: DateTime<Utc>) -> DateTime<Utc> {
    data.get("timestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .map(|t| if t > now { now } else { t })
        .unwrap_or(now)
}

/// 创建通知请求
///
/// 同时也是延迟队列中元素的 JSON 结构。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateNotificationRequest {
    #[validate(custom(function = "validate_text"))]
    pub title: LocalizedText,
    #[validate(custom(function = "validate_text"))]
    pub message: LocalizedText,
    #[validate(custom(function = "validate_recipients"))]
    pub recipients: Vec<String>,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub channel: DeliveryChannel,
    #[serde(default)]
    #[validate(custom(function = "validate_data"))]
    pub data: serde_json::Value,
}

impl CreateNotificationRequest {
    pub fn new(
        title: impl Into<LocalizedText>,
        message: impl Into<LocalizedText>,
        recipients: Vec<String>,
        notification_type: NotificationType,
    ) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            recipients,
            notification_type,
            priority: Priority::default(),
            channel: DeliveryChannel::default(),
            data: serde_json::json!({}),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

fn validation_error(code: &'static str, message: &'static str) -> ValidationError {
    ValidationError::new(code).with_message(Cow::Borrowed(message))
}

fn validate_text(text: &LocalizedText) -> Result<(), ValidationError> {
    if text.is_blank() {
        return Err(validation_error("blank", "标题和内容不能为空"));
    }
    Ok(())
}

fn validate_recipients(recipients: &Vec<String>) -> Result<(), ValidationError> {
    if recipients.is_empty() {
        return Err(validation_error("empty", "接收人不能为空"));
    }
    if recipients.len() > MAX_RECIPIENTS {
        return Err(validation_error("too_many", "接收人数量超过上限"));
    }
    if recipients.iter().any(|r| r.trim().is_empty()) {
        return Err(validation_error("blank_recipient", "接收人 ID 不能为空"));
    }
    Ok(())
}

fn validate_data(data: &serde_json::Value) -> Result<(), ValidationError> {
    if data.is_object() || data.is_null() {
        Ok(())
    } else {
        Err(validation_error("not_object", "data 必须是 JSON 对象"))
    }
}

/// 创建通知的返回
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNotificationResponse {
    pub notification_id: Uuid,
    pub recipient_count: usize,
}
