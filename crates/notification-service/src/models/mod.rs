//! 领域模型
//!
//! 通知、投递追踪记录与推送设备的实体和 DTO 定义

mod device;
mod notification;
mod tracker;

pub use device::*;
pub use notification::*;
pub use tracker::*;
