//! 投递与阅读追踪
//!
//! 每个 (通知, 接收人) 一条状态记录，支撑分页列表、未读数和投递分析。

mod memory;
mod postgres;
mod service;
mod traits;

pub use memory::MemoryNotificationStore;
pub use postgres::PgNotificationStore;
pub use service::DeliveryTracker;
pub use traits::*;
