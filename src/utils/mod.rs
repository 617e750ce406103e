//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 统一工具模块
//!
//! 提供运行时和测试共用的工具函数，包括：
//! - 日志设置工具
//! - Redis连接检查工具
//! - 实例构造工具

pub mod redaction;

use crate::model::{HealthCheck, HealthCheckType, Instance};
use std::sync::Once;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn setup_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_span_events(FmtSpan::CLOSE)
            .with_env_filter(EnvFilter::new("debug"))
            .try_init()
            .ok();
    });
}

/// 按指定级别初始化日志，`RUST_LOG`优先
pub fn init_logging(level: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .ok();
    });
}

/// 检查Redis是否可用
pub fn is_redis_available() -> bool {
    std::env::var("OXCHECK_SKIP_REDIS_TESTS").is_err()
}

/// 检查指定URL的Redis是否可用
pub async fn is_redis_available_url(url: &str) -> bool {
    let client = match redis::Client::open(url) {
        Ok(c) => c,
        Err(_) => return false,
    };

    matches!(
        tokio::time::timeout(
            Duration::from_secs(1),
            client.get_multiplexed_async_connection(),
        )
        .await,
        Ok(Ok(_))
    )
}

/// 生成唯一的键前缀
pub fn generate_unique_key_prefix(base: &str) -> String {
    format!("{}:{}:", base, uuid::Uuid::new_v4().simple())
}

/// 构造一个开启心跳检查的健康实例
pub fn heartbeat_instance(id: &str, host: &str, port: u32, ttl_sec: u32) -> Instance {
    Instance {
        id: id.to_string(),
        service: "default-service".to_string(),
        namespace: "default".to_string(),
        host: host.to_string(),
        port,
        weight: 100,
        healthy: true,
        isolate: false,
        enable_health_check: true,
        health_check: Some(HealthCheck {
            check_type: HealthCheckType::Heartbeat,
            ttl_sec,
        }),
        metadata: Default::default(),
        revision: uuid::Uuid::new_v4().to_string(),
    }
}
