//! 推送设备注册表
//!
//! 管理每个用户、每台设备的推送凭证及其生命周期：注册、查询可用 token、停用、删除与周期清理。
//!
//! 读操作在存储不可用时降级为空结果并记录日志，不会把错误抛给请求路径；
//! 写操作（注册、更新设备信息）需要让调用方知道是否持久化成功，因此会返回错误。

mod store;

pub use store::{DeviceStore, MemoryDeviceStore, PUSH_TOKENS_PREFIX, RedisDeviceStore};
#[cfg(test)]
pub use store::MockDeviceStore;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use notify_shared::observability::metrics;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{NotificationError, Result};
use crate::models::{
    DeviceEntry, DeviceInfo, DeviceSummary, DeviceTarget, DeviceUpdate, LEGACY_EXPO_PREFIX,
    Platform, PushCredential, RegisterDeviceRequest, RegistrationPayload, StoredDevice,
};

/// 遗留 token 未指定设备 ID 时使用的字段名
pub const LEGACY_DEVICE_ID: &str = "expo";

/// 单个条目比较替换的最大尝试次数
pub const MAX_MODIFY_ATTEMPTS: usize = 5;

/// 一次清理的统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub users_scanned: u64,
    pub legacy_removed: u64,
    pub stale_removed: u64,
    pub containers_removed: u64,
    pub failed_users: u64,
}

impl SweepReport {
    pub fn total_removed(&self) -> u64 {
        self.legacy_removed + self.stale_removed
    }
}

/// 设备注册表
pub struct DeviceRegistry {
    store: Arc<dyn DeviceStore>,
    stale_after: Duration,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn DeviceStore>, stale_after_days: i64) -> Self {
        Self {
            store,
            stale_after: Duration::days(stale_after_days),
        }
    }

    /// 使用默认的 30 天保留期
    pub fn with_defaults(store: Arc<dyn DeviceStore>) -> Self {
        Self::new(store, 30)
    }

    // ==================== 注册 ====================

    /// 校验注册请求并转换为注册载荷
    ///
    /// - web 平台必须携带包含 endpoint 与 keys 的订阅
    /// - expo 平台必须携带合法的 Expo token
    /// - legacy 平台只接受 `ExponentPushToken[` 前缀的裸字符串
    pub fn payload_from_request(request: &RegisterDeviceRequest) -> Result<RegistrationPayload> {
        match request.platform.to_ascii_lowercase().as_str() {
            "web" => {
                let subscription = request.subscription.as_ref().ok_or_else(|| {
                    NotificationError::Validation("web 平台需要提供 subscription".to_string())
                })?;
                match PushCredential::classify_value(subscription) {
                    credential @ PushCredential::WebPush(_) => Ok(RegistrationPayload::Structured {
                        platform: Platform::Web,
                        credential,
                        device_info: request.device_info.clone(),
                    }),
                    _ => Err(NotificationError::Validation(
                        "subscription 缺少 endpoint 或 keys".to_string(),
                    )),
                }
            }
            "expo" | "ios" | "android" => {
                let token = request.device_token.as_deref().ok_or_else(|| {
                    NotificationError::Validation("需要提供 deviceToken".to_string())
                })?;
                match PushCredential::classify(token) {
                    credential @ PushCredential::Expo(_) => Ok(RegistrationPayload::Structured {
                        platform: Platform::Expo,
                        credential,
                        device_info: request.device_info.clone(),
                    }),
                    _ => Err(NotificationError::Validation(format!(
                        "无效的 Expo push token: {token}"
                    ))),
                }
            }
            "legacy" => match request.device_token.as_deref() {
                Some(token) if token.starts_with(LEGACY_EXPO_PREFIX) => {
                    Ok(RegistrationPayload::Legacy(token.to_string()))
                }
                _ => Err(NotificationError::Validation(
                    "遗留 token 必须以 ExponentPushToken[ 开头".to_string(),
                )),
            },
            other => Err(NotificationError::Validation(format!(
                "不支持的平台: {other}"
            ))),
        }
    }

    /// 注册设备，返回设备 ID
    ///
    /// 同一设备 ID 重复注册会覆盖条目并刷新 `lastActive`，保留首次创建时间与计数。
    #[instrument(skip(self, payload))]
    pub async fn register(
        &self,
        user_id: &str,
        device_id: Option<&str>,
        payload: RegistrationPayload,
    ) -> Result<String> {
        let now = Utc::now();

        let (device_id, stored) = match payload {
            RegistrationPayload::Legacy(token) => (
                device_id.unwrap_or(LEGACY_DEVICE_ID).to_string(),
                StoredDevice::Legacy(token),
            ),
            RegistrationPayload::Structured {
                platform,
                credential,
                device_info,
            } => {
                let device_id = device_id
                    .map(str::to_string)
                    .unwrap_or_else(|| generate_device_id(platform));

                let previous = self.load_structured(user_id, &device_id).await;
                let entry = DeviceEntry {
                    token: credential,
                    platform,
                    device_info: device_info.with_defaults(),
                    is_active: true,
                    created_at: previous.as_ref().map(|p| p.created_at).unwrap_or(now),
                    last_active: now,
                    success_count: previous.as_ref().map(|p| p.success_count).unwrap_or(0),
                    failure_count: previous.as_ref().map(|p| p.failure_count).unwrap_or(0),
                };
                (device_id, StoredDevice::Structured(entry))
            }
        };

        self.store
            .save(user_id, &device_id, &stored.encode()?)
            .await?;

        info!(user_id, device_id = %device_id, "设备已注册");
        Ok(device_id)
    }

    // ==================== 查询 ====================

    /// 读取并解码用户的全部设备；存储失败时返回空集合
    async fn load_decoded(&self, user_id: &str) -> BTreeMap<String, StoredDevice> {
        match self.store.load_all(user_id).await {
            Ok(raw) => raw
                .into_iter()
                .map(|(device_id, value)| (device_id, StoredDevice::decode(&value)))
                .collect(),
            Err(e) => {
                warn!(user_id, error = %e, "读取设备列表失败，按无设备处理");
                BTreeMap::new()
            }
        }
    }

    async fn load_structured(&self, user_id: &str, device_id: &str) -> Option<DeviceEntry> {
        match self.store.load(user_id, device_id).await {
            Ok(Some(raw)) => match StoredDevice::decode(&raw) {
                StoredDevice::Structured(entry) => Some(entry),
                StoredDevice::Legacy(_) => None,
            },
            Ok(None) => None,
            Err(e) => {
                warn!(user_id, device_id, error = %e, "读取设备失败");
                None
            }
        }
    }

    /// 用户当前可推送的设备
    ///
    /// 只返回未被显式停用的条目，遗留条目视为一直可用。
    pub async fn active_tokens(&self, user_id: &str) -> BTreeMap<String, DeviceTarget> {
        self.load_decoded(user_id)
            .await
            .into_iter()
            .filter(|(_, stored)| stored.is_active())
            .map(|(device_id, stored)| {
                let target = stored.to_target(&device_id);
                (device_id, target)
            })
            .collect()
    }

    /// 用户的全部设备（包括已停用的）
    pub async fn list_devices(&self, user_id: &str) -> Vec<DeviceSummary> {
        self.load_decoded(user_id)
            .await
            .iter()
            .map(|(device_id, stored)| DeviceSummary::from_stored(device_id, stored))
            .collect()
    }

    // ==================== 状态变更 ====================

    /// 读取、修改并以比较替换写回一个设备条目
    ///
    /// 写回时条目已被其他实例改动则基于新值重做修改，最多尝试 [`MAX_MODIFY_ATTEMPTS`] 次。
    /// 遗留条目会先转换为结构化条目再修改。返回 Ok(false) 表示设备不存在。
    async fn modify<F>(&self, user_id: &str, device_id: &str, f: F) -> Result<bool>
    where
        F: Fn(&mut DeviceEntry),
    {
        for attempt in 1..=MAX_MODIFY_ATTEMPTS {
            let Some(raw) = self.store.load(user_id, device_id).await? else {
                return Ok(false);
            };
            let mut entry = match StoredDevice::decode(&raw) {
                StoredDevice::Structured(entry) => entry,
                StoredDevice::Legacy(token) => legacy_to_entry(&token, Utc::now()),
            };
            f(&mut entry);
            let encoded = StoredDevice::Structured(entry).encode()?;
            if self
                .store
                .compare_and_swap(user_id, device_id, &raw, &encoded)
                .await?
            {
                return Ok(true);
            }
            debug!(user_id, device_id, attempt, "设备条目被并发修改，重新读取");
        }
        Err(NotificationError::StoreUnavailable(format!(
            "设备 {device_id} 并发修改冲突，重试 {MAX_MODIFY_ATTEMPTS} 次后放弃"
        )))
    }

    /// 停用设备，保留条目用于排查；重复调用无副作用
    pub async fn deactivate(&self, user_id: &str, device_id: &str) {
        match self
            .modify(user_id, device_id, |entry| entry.is_active = false)
            .await
        {
            Ok(true) => info!(user_id, device_id, "设备已停用"),
            Ok(false) => debug!(user_id, device_id, "停用的设备不存在"),
            Err(e) => warn!(user_id, device_id, error = %e, "停用设备失败"),
        }
    }

    /// 刷新设备活跃时间
    pub async fn touch(&self, user_id: &str, device_id: &str) -> bool {
        let now = Utc::now();
        match self
            .modify(user_id, device_id, |entry| entry.last_active = now)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                warn!(user_id, device_id, error = %e, "刷新设备活跃时间失败");
                false
            }
        }
    }

    /// 记录一次推送结果
    pub async fn record_send_result(&self, user_id: &str, device_id: &str, success: bool) {
        let now = Utc::now();
        let result = self
            .modify(user_id, device_id, |entry| {
                if success {
                    entry.success_count += 1;
                    entry.last_active = now;
                } else {
                    entry.failure_count += 1;
                }
            })
            .await;
        if let Err(e) = result {
            warn!(user_id, device_id, error = %e, "记录推送结果失败");
        }
    }

    /// 更新设备描述信息，只允许修改设备名、应用版本、语言与时区
    pub async fn update_device(
        &self,
        user_id: &str,
        device_id: &str,
        update: &DeviceUpdate,
    ) -> Result<DeviceSummary> {
        if update.is_empty() {
            return Err(NotificationError::Validation(
                "没有可更新的字段".to_string(),
            ));
        }

        let now = Utc::now();
        let found = self
            .modify(user_id, device_id, |entry| {
                update.apply(&mut entry.device_info);
                entry.last_active = now;
            })
            .await?;
        if !found {
            return Err(NotificationError::not_found("Device", device_id));
        }

        let raw = self
            .store
            .load(user_id, device_id)
            .await?
            .ok_or_else(|| NotificationError::not_found("Device", device_id))?;
        Ok(DeviceSummary::from_stored(
            device_id,
            &StoredDevice::decode(&raw),
        ))
    }

    /// 物理删除设备，返回是否存在
    pub async fn remove(&self, user_id: &str, device_id: &str) -> bool {
        match self.store.delete(user_id, device_id).await {
            Ok(existed) => {
                if existed {
                    info!(user_id, device_id, "设备已删除");
                    if let Err(e) = self.store.drop_if_empty(user_id).await {
                        warn!(user_id, error = %e, "移除空设备容器失败");
                    }
                }
                existed
            }
            Err(e) => {
                warn!(user_id, device_id, error = %e, "删除设备失败");
                false
            }
        }
    }

    /// 删除用户的全部设备
    pub async fn remove_all(&self, user_id: &str) -> u64 {
        match self.store.delete_user(user_id).await {
            Ok(count) => count,
            Err(e) => {
                warn!(user_id, error = %e, "删除用户设备失败");
                0
            }
        }
    }

    // ==================== 清理 ====================

    /// 周期清理
    ///
    /// - 移除所有遗留条目（没有任何过期信息）
    /// - 移除已停用或超过保留期无活动的结构化条目
    /// - 移除清空后的用户容器
    ///
    /// 单个用户清理失败只记录，不影响其他用户。
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let users = match self.store.users().await {
            Ok(users) => users,
            Err(e) => {
                warn!(error = %e, "列出设备用户失败，跳过本次清理");
                return report;
            }
        };

        for user_id in users {
            report.users_scanned += 1;
            if let Err(e) = self.sweep_user(&user_id, now, &mut report).await {
                report.failed_users += 1;
                warn!(user_id = %user_id, error = %e, "清理用户设备失败");
            }
        }

        metrics::record_sweep_removed("legacy", report.legacy_removed);
        metrics::record_sweep_removed("stale", report.stale_removed);
        info!(
            users = report.users_scanned,
            legacy_removed = report.legacy_removed,
            stale_removed = report.stale_removed,
            containers_removed = report.containers_removed,
            failed_users = report.failed_users,
            "设备清理完成"
        );
        report
    }

    async fn sweep_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<()> {
        let entries = self.store.load_all(user_id).await?;

        for (device_id, raw) in entries {
            match StoredDevice::decode(&raw) {
                StoredDevice::Legacy(_) => {
                    if self.store.delete(user_id, &device_id).await? {
                        report.legacy_removed += 1;
                    }
                }
                StoredDevice::Structured(entry) if entry.is_stale(now, self.stale_after) => {
                    if self.store.delete(user_id, &device_id).await? {
                        report.stale_removed += 1;
                    }
                }
                StoredDevice::Structured(_) => {}
            }
        }

        if self.store.drop_if_empty(user_id).await? {
            report.containers_removed += 1;
        }
        Ok(())
    }
}

fn generate_device_id(platform: Platform) -> String {
    let id = Uuid::now_v7().simple().to_string();
    format!("{}_{}", platform.as_str(), id)
}

fn legacy_to_entry(token: &str, now: DateTime<Utc>) -> DeviceEntry {
    DeviceEntry {
        token: PushCredential::classify(token),
        platform: Platform::Legacy,
        device_info: DeviceInfo::default(),
        is_active: true,
        created_at: now,
        last_active: now,
        success_count: 0,
        failure_count: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use notify_shared::error::HubError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    const TOKEN: &str = "ExponentPushToken[abc123]";

    fn registry() -> (DeviceRegistry, MemoryDeviceStore) {
        let store = MemoryDeviceStore::new();
        (
            DeviceRegistry::with_defaults(Arc::new(store.clone())),
            store,
        )
    }

    fn expo_payload() -> RegistrationPayload {
        RegistrationPayload::Structured {
            platform: Platform::Expo,
            credential: PushCredential::Expo(TOKEN.to_string()),
            device_info: DeviceInfo {
                device_name: Some("iPhone".to_string()),
                ..Default::default()
            },
        }
    }

    fn structured_raw(last_active: DateTime<Utc>, is_active: bool) -> String {
        let mut entry = legacy_to_entry(TOKEN, last_active);
        entry.platform = Platform::Expo;
        entry.is_active = is_active;
        StoredDevice::Structured(entry).encode().unwrap()
    }

    #[test]
    fn test_payload_validation() {
        let web_without_sub = RegisterDeviceRequest {
            platform: "web".to_string(),
            ..Default::default()
        };
        assert!(DeviceRegistry::payload_from_request(&web_without_sub).is_err());

        let web_bad_sub = RegisterDeviceRequest {
            platform: "web".to_string(),
            subscription: Some(serde_json::json!({"endpoint": "https://x"})),
            ..Default::default()
        };
        assert!(DeviceRegistry::payload_from_request(&web_bad_sub).is_err());

        let expo_bad = RegisterDeviceRequest {
            platform: "expo".to_string(),
            device_token: Some("not-a-token".to_string()),
            ..Default::default()
        };
        assert!(DeviceRegistry::payload_from_request(&expo_bad).is_err());

        let expo_ok = RegisterDeviceRequest {
            platform: "expo".to_string(),
            device_token: Some(TOKEN.to_string()),
            ..Default::default()
        };
        assert!(matches!(
            DeviceRegistry::payload_from_request(&expo_ok),
            Ok(RegistrationPayload::Structured { platform: Platform::Expo, .. })
        ));

        let legacy = RegisterDeviceRequest {
            platform: "legacy".to_string(),
            device_token: Some(TOKEN.to_string()),
            ..Default::default()
        };
        assert_eq!(
            DeviceRegistry::payload_from_request(&legacy).unwrap(),
            RegistrationPayload::Legacy(TOKEN.to_string())
        );
    }

    #[tokio::test]
    async fn test_register_generates_id_and_is_idempotent() {
        let (registry, _) = registry();

        let generated = registry.register("u1", None, expo_payload()).await.unwrap();
        assert!(generated.starts_with("expo_"));

        let id = registry
            .register("u1", Some("phone"), expo_payload())
            .await
            .unwrap();
        let first = registry.list_devices("u1").await;
        registry
            .register("u1", Some("phone"), expo_payload())
            .await
            .unwrap();
        let second = registry.list_devices("u1").await;

        assert_eq!(id, "phone");
        assert_eq!(second.len(), 2);
        let before = first.iter().find(|d| d.device_id == "phone").unwrap();
        let after = second.iter().find(|d| d.device_id == "phone").unwrap();
        assert_eq!(before.created_at, after.created_at);
        assert!(after.last_active >= before.last_active);
        assert_eq!(after.device_info.language.as_deref(), Some("en"));
    }

    #[tokio::test]
    async fn test_active_tokens_filters_inactive_and_keeps_legacy() {
        let (registry, store) = registry();
        store.insert_raw("u1", "expo", TOKEN);
        registry
            .register("u1", Some("d1"), expo_payload())
            .await
            .unwrap();
        registry
            .register("u1", Some("d2"), expo_payload())
            .await
            .unwrap();
        registry.deactivate("u1", "d2").await;
        registry.deactivate("u1", "d2").await;

        let active = registry.active_tokens("u1").await;
        assert_eq!(active.len(), 2);
        assert_eq!(active["expo"].platform, Platform::Legacy);
        assert!(matches!(active["d1"].credential, PushCredential::Expo(_)));
        assert_eq!(active["d1"].device_name.as_deref(), Some("iPhone"));

        // 停用的设备仍然保留
        assert_eq!(registry.list_devices("u1").await.len(), 3);
    }

    #[tokio::test]
    async fn test_remove_reports_existence() {
        let (registry, store) = registry();
        registry
            .register("u1", Some("d1"), expo_payload())
            .await
            .unwrap();

        assert!(registry.remove("u1", "d1").await);
        assert!(!registry.remove("u1", "d1").await);
        assert!(!store.has_container("u1"));
    }

    #[tokio::test]
    async fn test_update_device() {
        let (registry, _) = registry();
        registry
            .register("u1", Some("d1"), expo_payload())
            .await
            .unwrap();

        let update = DeviceUpdate {
            language: Some("vi".to_string()),
            ..Default::default()
        };
        let summary = registry.update_device("u1", "d1", &update).await.unwrap();
        assert_eq!(summary.device_info.language.as_deref(), Some("vi"));
        assert_eq!(summary.device_info.device_name.as_deref(), Some("iPhone"));

        let missing = registry.update_device("u1", "nope", &update).await;
        assert!(matches!(missing, Err(NotificationError::NotFound { .. })));

        let empty = registry
            .update_device("u1", "d1", &DeviceUpdate::default())
            .await;
        assert!(matches!(empty, Err(NotificationError::Validation(_))));
    }

    #[tokio::test]
    async fn test_record_send_result_updates_counters() {
        let (registry, _) = registry();
        registry
            .register("u1", Some("d1"), expo_payload())
            .await
            .unwrap();
        registry.record_send_result("u1", "d1", true).await;
        registry.record_send_result("u1", "d1", false).await;
        registry.record_send_result("u1", "d1", false).await;

        let device = &registry.list_devices("u1").await[0];
        assert_eq!(device.success_count, 1);
        assert_eq!(device.failure_count, 2);
    }

    /// 首次读取后立即写入另一个值，模拟另一实例在读改写之间完成了修改
    struct InterleavingStore {
        inner: MemoryDeviceStore,
        interleaved: AtomicBool,
        concurrent_value: String,
    }

    #[async_trait]
    impl DeviceStore for InterleavingStore {
        async fn load_all(&self, user_id: &str) -> notify_shared::error::Result<HashMap<String, String>> {
            self.inner.load_all(user_id).await
        }

        async fn load(&self, user_id: &str, device_id: &str) -> notify_shared::error::Result<Option<String>> {
            let raw = self.inner.load(user_id, device_id).await?;
            if !self.interleaved.swap(true, Ordering::SeqCst) {
                self.inner
                    .save(user_id, device_id, &self.concurrent_value)
                    .await?;
            }
            Ok(raw)
        }

        async fn save(&self, user_id: &str, device_id: &str, raw: &str) -> notify_shared::error::Result<()> {
            self.inner.save(user_id, device_id, raw).await
        }

        async fn compare_and_swap(
            &self,
            user_id: &str,
            device_id: &str,
            expected: &str,
            raw: &str,
        ) -> notify_shared::error::Result<bool> {
            self.inner
                .compare_and_swap(user_id, device_id, expected, raw)
                .await
        }

        async fn delete(&self, user_id: &str, device_id: &str) -> notify_shared::error::Result<bool> {
            self.inner.delete(user_id, device_id).await
        }

        async fn delete_user(&self, user_id: &str) -> notify_shared::error::Result<u64> {
            self.inner.delete_user(user_id).await
        }

        async fn users(&self) -> notify_shared::error::Result<Vec<String>> {
            self.inner.users().await
        }

        async fn drop_if_empty(&self, user_id: &str) -> notify_shared::error::Result<bool> {
            self.inner.drop_if_empty(user_id).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_deactivate_survives_send_result() {
        let now = Utc::now();
        let inner = MemoryDeviceStore::new();
        inner.insert_raw("u1", "d1", &structured_raw(now, true));
        let store = InterleavingStore {
            inner: inner.clone(),
            interleaved: AtomicBool::new(false),
            concurrent_value: structured_raw(now, false),
        };
        let registry = DeviceRegistry::with_defaults(Arc::new(store));

        registry.record_send_result("u1", "d1", true).await;

        let device = &registry.list_devices("u1").await[0];
        assert!(!device.is_active);
        assert_eq!(device.success_count, 1);
    }

    #[tokio::test]
    async fn test_modify_gives_up_after_repeated_conflicts() {
        let mut store = MockDeviceStore::new();
        store
            .expect_load()
            .times(MAX_MODIFY_ATTEMPTS)
            .returning(|_, _| Ok(Some(TOKEN.to_string())));
        store
            .expect_compare_and_swap()
            .times(MAX_MODIFY_ATTEMPTS)
            .returning(|_, _, _, _| Ok(false));

        let registry = DeviceRegistry::with_defaults(Arc::new(store));
        let update = DeviceUpdate {
            language: Some("vi".to_string()),
            ..Default::default()
        };
        let result = registry.update_device("u1", "expo", &update).await;
        assert!(matches!(result, Err(NotificationError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_modify_missing_after_conflict_is_not_found() {
        let mut store = MockDeviceStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_load()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Some(TOKEN.to_string())));
        store
            .expect_compare_and_swap()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(false));
        store
            .expect_load()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(None));

        let registry = DeviceRegistry::with_defaults(Arc::new(store));
        assert!(!registry.touch("u1", "expo").await);
    }

    #[tokio::test]
    async fn test_remove_tolerates_container_cleanup_failure() {
        let mut store = MockDeviceStore::new();
        store.expect_delete().returning(|_, _| Ok(true));
        store
            .expect_drop_if_empty()
            .times(1)
            .returning(|_| Err(HubError::Internal("down".to_string())));

        let registry = DeviceRegistry::with_defaults(Arc::new(store));
        assert!(registry.remove("u1", "d1").await);
    }

    #[tokio::test]
    async fn test_sweep_removes_legacy_and_stale() {
        let (registry, store) = registry();
        let now = Utc::now();

        store.insert_raw("u1", "expo", TOKEN);
        store.insert_raw("u1", "old", &structured_raw(now - Duration::days(40), true));
        store.insert_raw("u1", "fresh", &structured_raw(now - Duration::days(5), true));
        store.insert_raw("u2", "off", &structured_raw(now, false));

        let report = registry.sweep_at(now).await;

        assert_eq!(report.users_scanned, 2);
        assert_eq!(report.legacy_removed, 1);
        assert_eq!(report.stale_removed, 2);
        assert_eq!(report.containers_removed, 1);
        let remaining = registry.list_devices("u1").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].device_id, "fresh");
        assert!(!store.has_container("u2"));
    }

    #[tokio::test]
    async fn test_sweep_continues_after_user_failure() {
        let mut store = MockDeviceStore::new();
        store
            .expect_users()
            .returning(|| Ok(vec!["bad".to_string(), "good".to_string()]));
        store.expect_load_all().returning(|user_id| {
            if user_id == "bad" {
                Err(HubError::Internal("connection reset".to_string()))
            } else {
                Ok([("expo".to_string(), TOKEN.to_string())].into_iter().collect())
            }
        });
        store.expect_delete().times(1).returning(|_, _| Ok(true));
        store.expect_drop_if_empty().returning(|_| Ok(true));

        let registry = DeviceRegistry::with_defaults(Arc::new(store));
        let report = registry.sweep().await;

        assert_eq!(report.failed_users, 1);
        assert_eq!(report.legacy_removed, 1);
        assert_eq!(report.containers_removed, 1);
    }

    #[tokio::test]
    async fn test_reads_degrade_on_store_failure() {
        let mut store = MockDeviceStore::new();
        store
            .expect_load_all()
            .returning(|_| Err(HubError::Internal("down".to_string())));
        store
            .expect_delete()
            .returning(|_, _| Err(HubError::Internal("down".to_string())));

        let registry = DeviceRegistry::with_defaults(Arc::new(store));
        assert!(registry.active_tokens("u1").await.is_empty());
        assert!(!registry.remove("u1", "d1").await);
    }

    #[tokio::test]
    async fn test_register_propagates_store_failure() {
        let mut store = MockDeviceStore::new();
        store.expect_load().returning(|_, _| Ok(None));
        store
            .expect_save()
            .returning(|_, _, _| Err(HubError::Internal("down".to_string())));

        let registry = DeviceRegistry::with_defaults(Arc::new(store));
        assert!(registry.register("u1", Some("d1"), expo_payload()).await.is_err());
    }
}
