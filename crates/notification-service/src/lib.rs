//! 通知中心服务
//!
//! 接收通知创建请求（直接调用、延迟队列、跨服务事件），持久化通知与逐接收人追踪记录，
//! 通过 Expo 和 Web Push 推送到用户设备，并维护设备注册表、通知列表缓存与实时广播。
//!
//! 推送采用"创建即返回、后台投递"的方式，单个设备或接收人的失败只记录在追踪记录上，
//! 不影响同一通知的其他接收人。

pub mod cache;
pub mod db;
pub mod dedup;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod realtime;
pub mod registry;
pub mod tracker;
pub mod workers;
