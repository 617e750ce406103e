//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 服务生命周期与心跳入口集成测试

use oxcheck::cache_provider::CacheListener;
use oxcheck::checker::memory::MemoryHealthChecker;
use oxcheck::config::Config;
use oxcheck::error::CheckError;
use oxcheck::server::{Heartbeat, HealthCheckServer};
use oxcheck::store::MemoryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

#[path = "../common/mod.rs"]
mod common;

use common::{heartbeat_instance, tokio_clock, MockChecker, BASE_TIME_SEC};

fn memory_server(config: Config) -> Arc<HealthCheckServer> {
    common::setup_logging();
    HealthCheckServer::builder(
        config,
        Arc::new(MemoryStore::with_clock(tokio_clock(BASE_TIME_SEC))),
    )
    .checker(Arc::new(MemoryHealthChecker::with_start_time_sec(0)))
    .local_clock(tokio_clock(BASE_TIME_SEC))
    .build()
    .unwrap()
}

fn heartbeat(id: &str) -> Heartbeat {
    Heartbeat {
        instance_id: id.to_string(),
        count: 1,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_start_twice_fails() {
    let server = memory_server(Config::default());
    server.start().await.unwrap();

    let err = server.start().await.unwrap_err();
    assert!(matches!(err, CheckError::ConfigError(_)));

    server.shutdown(true).await;
}

#[tokio::test(start_paused = true)]
async fn test_disabled_server_does_not_schedule() {
    let mut config = Config::default();
    config.health_check.enable = false;
    let server = memory_server(config);
    server
        .cache_provider()
        .on_created(&heartbeat_instance("ins-1", "10.0.0.1", 8080, 5));

    server.start().await.unwrap();
    server.start().await.unwrap();
    sleep(Duration::from_secs(10)).await;

    assert_eq!(server.scheduler().scheduled_count(), 0);
    server.shutdown(true).await;
}

#[tokio::test(start_paused = true)]
async fn test_report_routing() {
    let server = memory_server(Config::default());
    let cache = server.cache_provider();

    cache.on_created(&heartbeat_instance("ins-1", "10.0.0.1", 8080, 5));
    let mut disabled = heartbeat_instance("ins-2", "10.0.0.2", 8080, 5);
    disabled.enable_health_check = false;
    cache.on_created(&disabled);
    let mut peer = heartbeat_instance("checker-1", "10.0.0.9", 8091, 5);
    peer.metadata
        .insert("polaris_service".to_string(), "polaris.checker".to_string());
    cache.on_created(&peer);

    server.report(&heartbeat("ins-1")).await.unwrap();
    let last = server.last_heartbeat("ins-1").await.unwrap();
    assert!(last.exists);
    assert_eq!(last.last_heartbeat_sec, BASE_TIME_SEC);

    assert!(matches!(
        server.report(&heartbeat("ins-2")).await,
        Err(CheckError::HeartbeatOnDisabledInstance(_))
    ));
    assert!(matches!(
        server.report(&heartbeat("unknown")).await,
        Err(CheckError::NotFound(_))
    ));
    assert!(matches!(
        server.last_heartbeat("unknown").await,
        Err(CheckError::NotFound(_))
    ));

    // 检查节点自身的实例同样可以上报心跳
    server.report(&heartbeat("checker-1")).await.unwrap();
}

#[tokio::test]
async fn test_build_rejects_invalid_checker_sets() {
    let duplicated = HealthCheckServer::builder(Config::default(), Arc::new(MemoryStore::new()))
        .checker(Arc::new(MemoryHealthChecker::new()))
        .checker(MockChecker::new())
        .build();
    assert!(matches!(duplicated, Err(CheckError::ConfigError(_))));

    let empty = HealthCheckServer::builder(Config::default(), Arc::new(MemoryStore::new())).build();
    assert!(matches!(empty, Err(CheckError::ConfigError(_))));

    let mut config = Config::default();
    config.health_check.min_check_interval_sec = 0;
    let invalid = HealthCheckServer::builder(config, Arc::new(MemoryStore::new()))
        .checker(Arc::new(MemoryHealthChecker::new()))
        .build();
    assert!(matches!(invalid, Err(CheckError::ConfigError(_))));
}

/// 等待关闭时，正在执行的检查会先完成
#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_running_checks() {
    common::setup_logging();
    let checker = MockChecker::new();
    checker.set_check_delay(Duration::from_secs(5));
    let server = HealthCheckServer::builder(
        Config::default(),
        Arc::new(MemoryStore::with_clock(tokio_clock(BASE_TIME_SEC))),
    )
    .checker(checker.clone())
    .local_clock(tokio_clock(BASE_TIME_SEC))
    .build()
    .unwrap();
    server
        .cache_provider()
        .on_created(&heartbeat_instance("ins-1", "10.0.0.1", 8080, 5));
    server.start().await.unwrap();

    sleep(Duration::from_millis(2500)).await;
    assert_eq!(checker.check_count("ins-1"), 1);

    let started = Instant::now();
    server.shutdown(true).await;
    assert!(started.elapsed() >= Duration::from_secs(4));
    assert_eq!(checker.check_count("ins-1"), 1);
}
