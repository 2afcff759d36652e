//! 可观测性模块集成测试
//!
//! 未安装全局 recorder 时，各指标记录函数必须是无副作用的空操作。

// ============================================================================
// 指标记录测试
// ============================================================================

mod metrics_tests {
    use notify_shared::observability::metrics::{
        get_handle, record_cache_operation, record_dedup_decision, record_inbound_event,
        record_notification_created, record_push_batch, record_push_delivery, record_queue_item,
        record_sweep_removed, set_worker_last_run,
    };

    #[test]
    fn test_record_notification_pipeline() {
        record_notification_created("attendance", 2);
        record_notification_created("ticket", 0);
        record_push_delivery("expo", "success");
        record_push_delivery("expo", "expired");
        record_push_delivery("web_push", "failure");
        record_push_batch("expo", 0.12);
    }

    #[test]
    fn test_record_guards_and_workers() {
        record_dedup_decision("window", "suppressed");
        record_dedup_decision("calendar_day", "fail_open");
        record_cache_operation("get", "hit");
        record_cache_operation("invalidate", "error");
        record_sweep_removed("legacy", 3);
        record_sweep_removed("stale", 0);
        record_queue_item("dropped");
        record_inbound_event("ticket_created", "handled");
        set_worker_last_run("registry_sweeper");
    }

    #[test]
    fn test_metrics_with_edge_cases() {
        // 空标签与超长标签
        record_push_delivery("", "");
        let long_event = "event_".to_string() + &"x".repeat(1000);
        record_inbound_event(&long_event, "error");

        // 极端数值
        record_push_batch("expo", 999.99);
        record_notification_created("system", usize::MAX);
        record_sweep_removed("stale", u64::MAX);
    }

    #[test]
    fn test_handle_absent_before_init() {
        assert!(get_handle().is_none());
    }
}

// ============================================================================
// 配置测试
// ============================================================================

mod config_tests {
    use notify_shared::observability::ObservabilityConfig;

    #[test]
    fn test_default_config() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.service_name, "unknown-service");
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.log_level, "info");
        assert!(config.metrics_enabled);
        assert!(!config.json_logs());
    }

    #[test]
    fn test_with_service_name() {
        let config = ObservabilityConfig::default().with_service_name("notification-service");
        assert_eq!(config.service_name, "notification-service");
    }

    #[test]
    fn test_custom_config() {
        let config = ObservabilityConfig {
            service_name: "my-service".to_string(),
            log_level: "debug".to_string(),
            log_format: "json".to_string(),
            metrics_enabled: false,
            metrics_port: 9091,
        };

        assert_eq!(config.metrics_port, 9091);
        assert!(config.json_logs());
        assert!(!config.metrics_enabled);
    }
}

// ============================================================================
// Guard 测试
// ============================================================================

mod guard_tests {
    use notify_shared::observability::ObservabilityGuard;

    #[test]
    fn test_empty_guard() {
        let guard = ObservabilityGuard::empty();
        drop(guard);
    }

    #[test]
    fn test_guard_drop() {
        for _ in 0..10 {
            let guard = ObservabilityGuard::empty();
            drop(guard);
        }
    }
}
