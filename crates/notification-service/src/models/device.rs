//! 推送设备模型
//!
//! 注册表中每个设备条目要么是历史遗留的裸 token 字符串，要么是带元数据的结构化 JSON。
//! 两种形态在读取时一次性解码为 [`StoredDevice`]，之后不再重复判断。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 遗留 Expo token 的固定前缀
pub const LEGACY_EXPO_PREFIX: &str = "ExponentPushToken[";
const EXPO_PREFIXES: [&str; 2] = ["ExponentPushToken[", "ExpoPushToken["];

/// 设备平台
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Expo,
    Web,
    Legacy,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expo => "expo",
            Self::Web => "web",
            Self::Legacy => "legacy",
        }
    }
}

/// Web Push 订阅的密钥
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebPushKeys {
    pub p256dh: String,
    pub auth: String,
}

/// 浏览器返回的 Web Push 订阅
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebPushSubscription {
    pub endpoint: String,
    pub keys: WebPushKeys,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<i64>,
}

/// 推送凭证，按形态分类
///
/// JSON 中 Expo token 是字符串，Web Push 是订阅对象。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum PushCredential {
    Expo(String),
    WebPush(WebPushSubscription),
    Unrecognized(String),
}

impl PushCredential {
    /// 对字符串形式的凭证分类
    pub fn classify(raw: &str) -> Self {
        let trimmed = raw.trim();
        if is_expo_token(trimmed) {
            return Self::Expo(trimmed.to_string());
        }
        if trimmed.starts_with('{') && trimmed.contains("endpoint") {
            if let Ok(sub) = serde_json::from_str::<WebPushSubscription>(trimmed) {
                return Self::WebPush(sub);
            }
        }
        Self::Unrecognized(raw.to_string())
    }

    /// 对任意 JSON 形式的凭证分类
    pub fn classify_value(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => Self::classify(s),
            serde_json::Value::Object(map) if map.contains_key("endpoint") => {
                serde_json::from_value::<WebPushSubscription>(value.clone())
                    .map(Self::WebPush)
                    .unwrap_or_else(|_| Self::Unrecognized(value.to_string()))
            }
            other => Self::Unrecognized(other.to_string()),
        }
    }

    pub fn channel(&self) -> &'static str {
        match self {
            Self::Expo(_) => "expo",
            Self::WebPush(_) => "web_push",
            Self::Unrecognized(_) => "unrecognized",
        }
    }
}

impl From<serde_json::Value> for PushCredential {
    fn from(value: serde_json::Value) -> Self {
        Self::classify_value(&value)
    }
}

impl From<PushCredential> for serde_json::Value {
    fn from(credential: PushCredential) -> Self {
        match credential {
            PushCredential::Expo(token) | PushCredential::Unrecognized(token) => {
                serde_json::Value::String(token)
            }
            PushCredential::WebPush(sub) => {
                serde_json::to_value(sub).unwrap_or(serde_json::Value::Null)
            }
        }
    }
}

/// 判断是否为 Expo 推送 token
///
/// 支持 `ExponentPushToken[...]`、`ExpoPushToken[...]` 以及裸 UUID 形式。
pub fn is_expo_token(token: &str) -> bool {
    let bracketed = EXPO_PREFIXES.iter().any(|prefix| {
        token
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(']'))
            .is_some_and(|inner| !inner.is_empty() && !inner.contains(']'))
    });
    bracketed || is_uuid_like(token)
}

/// 8-4-4-4-12 的十六进制分组，大小写均可
fn is_uuid_like(token: &str) -> bool {
    let groups: Vec<&str> = token.split('-').collect();
    groups.len() == 5
        && groups
            .iter()
            .zip([8, 4, 4, 4, 12])
            .all(|(g, len)| g.len() == len && g.chars().all(|c| c.is_ascii_hexdigit()))
}

/// 设备描述信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    pub device_name: Option<String>,
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub browser: Option<String>,
    pub app_version: Option<String>,
    pub language: Option<String>,
    pub timezone: Option<String>,
    pub user_agent: Option<String>,
    pub is_pwa: bool,
}

impl DeviceInfo {
    /// 补齐默认的语言与时区
    pub fn with_defaults(mut self) -> Self {
        if self.language.as_deref().is_none_or(str::is_empty) {
            self.language = Some("en".to_string());
        }
        if self.timezone.as_deref().is_none_or(str::is_empty) {
            self.timezone = Some("UTC".to_string());
        }
        self
    }
}

/// 结构化设备条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEntry {
    pub token: PushCredential,
    pub platform: Platform,
    #[serde(default)]
    pub device_info: DeviceInfo,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
}

fn default_true() -> bool {
    true
}

impl DeviceEntry {
    /// 超过保留期无活动，或已停用
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        !self.is_active || now - self.last_active > stale_after
    }
}

/// 从存储中读出的设备条目
#[derive(Debug, Clone, PartialEq)]
pub enum StoredDevice {
    Legacy(String),
    Structured(DeviceEntry),
}

impl StoredDevice {
    /// 解码存储的原始值；无法解析的 JSON 按遗留条目处理
    pub fn decode(raw: &str) -> Self {
        if raw.trim_start().starts_with('{') {
            if let Ok(entry) = serde_json::from_str::<DeviceEntry>(raw) {
                return Self::Structured(entry);
            }
        }
        Self::Legacy(raw.to_string())
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Legacy(raw) => Ok(raw.clone()),
            Self::Structured(entry) => serde_json::to_string(entry),
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            Self::Legacy(_) => true,
            Self::Structured(entry) => entry.is_active,
        }
    }

    /// 转为推送目标
    pub fn to_target(&self, device_id: &str) -> DeviceTarget {
        match self {
            Self::Legacy(raw) => DeviceTarget {
                device_id: device_id.to_string(),
                platform: Platform::Legacy,
                credential: PushCredential::classify(raw),
                language: None,
                device_name: None,
            },
            Self::Structured(entry) => DeviceTarget {
                device_id: device_id.to_string(),
                platform: entry.platform,
                credential: entry.token.clone(),
                language: entry.device_info.language.clone(),
                device_name: entry.device_info.device_name.clone(),
            },
        }
    }
}

/// 一个可推送的设备
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTarget {
    pub device_id: String,
    pub platform: Platform,
    pub credential: PushCredential,
    pub language: Option<String>,
    pub device_name: Option<String>,
}

impl DeviceTarget {
    pub fn new(device_id: impl Into<String>, credential: PushCredential) -> Self {
        let platform = match credential {
            PushCredential::WebPush(_) => Platform::Web,
            _ => Platform::Expo,
        };
        Self {
            device_id: device_id.into(),
            platform,
            credential,
            language: None,
            device_name: None,
        }
    }
}

/// 设备列表中的摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub device_id: String,
    pub platform: Platform,
    pub is_active: bool,
    pub device_info: DeviceInfo,
    pub created_at: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub failure_count: u64,
}

impl DeviceSummary {
    pub fn from_stored(device_id: &str, stored: &StoredDevice) -> Self {
        match stored {
            StoredDevice::Legacy(_) => Self {
                device_id: device_id.to_string(),
                platform: Platform::Legacy,
                is_active: true,
                device_info: DeviceInfo::default(),
                created_at: None,
                last_active: None,
                success_count: 0,
                failure_count: 0,
            },
            StoredDevice::Structured(e) => Self {
                device_id: device_id.to_string(),
                platform: e.platform,
                is_active: e.is_active,
                device_info: e.device_info.clone(),
                created_at: Some(e.created_at),
                last_active: Some(e.last_active),
                success_count: e.success_count,
                failure_count: e.failure_count,
            },
        }
    }
}

/// 注册载荷：遗留裸字符串或结构化凭证
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationPayload {
    Legacy(String),
    Structured {
        platform: Platform,
        credential: PushCredential,
        device_info: DeviceInfo,
    },
}

/// 注册设备请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceRequest {
    /// expo 或 web
    pub platform: String,
    /// Expo token（platform = expo）
    pub device_token: Option<String>,
    /// Web Push 订阅（platform = web）
    pub subscription: Option<serde_json::Value>,
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_info: DeviceInfo,
}

/// 可修改的设备字段
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUpdate {
    pub device_name: Option<String>,
    pub app_version: Option<String>,
    pub language: Option<String>,
    pub timezone: Option<String>,
}

impl DeviceUpdate {
    pub fn is_empty(&self) -> bool {
        self.device_name.is_none()
            && self.app_version.is_none()
            && self.language.is_none()
            && self.timezone.is_none()
    }

    pub fn apply(&self, info: &mut DeviceInfo) {
        if let Some(v) = &self.device_name {
            info.device_name = Some(v.clone());
        }
        if let Some(v) = &self.app_version {
            info.app_version = Some(v.clone());
        }
        if let Some(v) = &self.language {
            info.language = Some(v.clone());
        }
        if let Some(v) = &self.timezone {
            info.timezone = Some(v.clone());
        }
    }
}
