//! 通知库连接与 schema 管理
//!
//! 连接池在启动时创建一次。迁移脚本位于 crate 的 `migrations/` 目录，编译期嵌入二进制；
//! 关闭自动迁移时，启动检查会确认通知表与追踪记录表已经存在。

use std::time::Duration;

use notify_shared::config::DatabaseConfig;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, instrument};

use crate::error::{NotificationError, Result};

/// 嵌入的迁移脚本
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// 服务依赖的数据表
pub const REQUIRED_TABLES: &[&str] = &["notifications", "notification_reads"];

/// 通知库连接池
#[derive(Clone)]
pub struct NotificationDb {
    pool: PgPool,
}

impl NotificationDb {
    /// 只建立连接池，不做迁移和检查
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await?;

        info!("通知库连接池已创建");
        Ok(Self { pool })
    }

    /// 启动入口：连接，按配置执行迁移，再检查表结构
    pub async fn open(config: &DatabaseConfig) -> Result<Self> {
        let db = Self::connect(config).await?;
        if config.run_migrations {
            db.migrate().await?;
        } else {
            info!("已跳过数据库迁移");
        }
        db.health_check().await?;
        Ok(db)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 执行尚未应用的迁移
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| NotificationError::StoreUnavailable(format!("数据库迁移失败: {e}")))?;
        info!(latest_version = ?latest_version(), "数据库迁移已执行");
        Ok(())
    }

    /// 连通性与表结构检查，缺表时返回错误
    pub async fn health_check(&self) -> Result<()> {
        let tables: Vec<String> = REQUIRED_TABLES.iter().map(|t| t.to_string()).collect();
        let missing: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT t
            FROM UNNEST($1::text[]) AS t
            WHERE to_regclass(t) IS NULL
            "#,
        )
        .bind(&tables)
        .fetch_all(&self.pool)
        .await?;

        if missing.is_empty() {
            Ok(())
        } else {
            Err(NotificationError::StoreUnavailable(format!(
                "缺少数据表: {}",
                missing.join(", ")
            )))
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("通知库连接池已关闭");
    }
}

/// 嵌入迁移中的最新版本号
pub fn latest_version() -> Option<i64> {
    MIGRATOR.iter().map(|m| m.version).max()
}
