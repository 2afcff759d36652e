//! 通知服务错误类型
//!
//! 定义通知创建、投递追踪、设备注册等场景的错误分类，
//! 便于上层根据错误类型决定上报调用方还是就地记录。
//!
//! - `Validation`：输入不合法，在任何持久化之前拒绝
//! - `NotFound`：通知、设备或追踪记录不存在
//! - `Delivery`：单个 token 推送失败，只记录在追踪记录上
//! - `StoreUnavailable`：权威存储不可用，写操作必须上报
//! - `CacheUnavailable`：缓存不可用，只用于日志，从不返回给调用方

use notify_shared::error::HubError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("参数验证失败: {0}")]
    Validation(String),

    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: String, id: String },

    #[error("推送失败: 渠道={channel}, 原因={reason}")]
    Delivery { channel: String, reason: String },

    #[error("存储不可用: {0}")]
    StoreUnavailable(String),

    #[error("缓存不可用: {0}")]
    CacheUnavailable(String),

    #[error("序列化失败: {0}")]
    Serialization(String),

    #[error(transparent)]
    Shared(HubError),
}

pub type Result<T> = std::result::Result<T, NotificationError>;

impl NotificationError {
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Delivery { .. } => "DELIVERY_ERROR",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::CacheUnavailable(_) => "CACHE_UNAVAILABLE",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Shared(e) => e.code(),
        }
    }

    /// 是否为可重试错误
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StoreUnavailable(_) | Self::CacheUnavailable(_) => true,
            Self::Shared(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<HubError> for NotificationError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::NotFound { entity, id } => Self::NotFound { entity, id },
            HubError::Validation(msg) => Self::Validation(msg),
            HubError::Serialization(msg) => Self::Serialization(msg),
            HubError::Database(e) => e.into(),
            HubError::Redis(e) => Self::StoreUnavailable(e.to_string()),
            e @ HubError::RedisTimeout { .. } => Self::StoreUnavailable(e.to_string()),
            other => Self::Shared(other),
        }
    }
}

impl From<sqlx::Error> for NotificationError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound {
                entity: "row".to_string(),
                id: "-".to_string(),
            },
            other => Self::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for NotificationError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<serde_json::Error> for NotificationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
