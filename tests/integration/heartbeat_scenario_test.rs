//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 心跳场景集成测试：完整服务 + 内存检查器 + 内存存储

use oxcheck::cache_provider::CacheListener;
use oxcheck::checker::memory::MemoryHealthChecker;
use oxcheck::config::Config;
use oxcheck::server::{Heartbeat, HealthCheckServer};
use oxcheck::store::MemoryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[path = "../common/mod.rs"]
mod common;

use common::{heartbeat_instance, tokio_clock, BASE_TIME_SEC};

const STORE_LAG_SEC: i64 = 5;

struct Scenario {
    server: Arc<HealthCheckServer>,
    store: Arc<MemoryStore>,
}

async fn scenario(checker: MemoryHealthChecker) -> Scenario {
    common::setup_logging();
    let store = Arc::new(MemoryStore::with_clock(tokio_clock(BASE_TIME_SEC)));
    store.set_clock_offset(-STORE_LAG_SEC);
    let server = HealthCheckServer::builder(Config::default(), store.clone())
        .checker(Arc::new(checker))
        .local_clock(tokio_clock(BASE_TIME_SEC))
        .build()
        .unwrap();
    common::spawn_registry_mirror(server.scheduler(), server.cache_provider().clone());
    server
        .cache_provider()
        .on_created(&heartbeat_instance("ins-1", "10.0.0.1", 8080, 5));
    server.start().await.unwrap();
    Scenario { server, store }
}

async fn heartbeat_for(server: &HealthCheckServer, instance_id: &str, secs: u64) {
    let heartbeat = Heartbeat {
        instance_id: instance_id.to_string(),
        ..Default::default()
    };
    for _ in 0..secs / 2 {
        server.report(&heartbeat).await.unwrap();
        sleep(Duration::from_secs(2)).await;
    }
}

/// 规律上报心跳的实例保持健康，不产生任何写入
#[tokio::test(start_paused = true)]
async fn test_regular_heartbeats_stay_healthy() {
    let s = scenario(MemoryHealthChecker::with_start_time_sec(0)).await;
    let mut events = s.server.subscribe_events();

    heartbeat_for(&s.server, "ins-1", 60).await;

    assert!(s.server.scheduler().is_scheduled("ins-1"));
    assert_eq!(s.store.write_count(), 0);
    assert!(events.try_recv().is_err());
    assert!(s.server.cache_provider().get_instance("ins-1").unwrap().healthy);

    s.server.shutdown(true).await;
}

/// 心跳停止后变为不健康，恢复上报后重新变为健康
#[tokio::test(start_paused = true)]
async fn test_missed_heartbeats_then_recovery() {
    let s = scenario(MemoryHealthChecker::with_start_time_sec(0)).await;
    let mut events = s.server.subscribe_events();

    heartbeat_for(&s.server, "ins-1", 10).await;
    sleep(Duration::from_secs(40)).await;

    let record = events.try_recv().unwrap();
    assert_eq!(record.instance_id, "ins-1");
    assert!(!record.healthy);
    assert!(record.persisted);
    assert!(events.try_recv().is_err());
    assert_eq!(s.store.status_of("ins-1").unwrap().status, 0);
    assert!(!s.server.cache_provider().get_instance("ins-1").unwrap().healthy);

    heartbeat_for(&s.server, "ins-1", 40).await;

    let record = events.try_recv().unwrap();
    assert!(record.healthy);
    assert!(events.try_recv().is_err());
    assert_eq!(s.store.status_of("ins-1").unwrap().status, 1);
    assert_eq!(s.store.write_count(), 2);

    s.server.shutdown(true).await;
}

/// 检查使用与存储层对齐的时间
#[tokio::test(start_paused = true)]
async fn test_time_diff_applied() {
    let s = scenario(MemoryHealthChecker::with_start_time_sec(0)).await;
    assert_eq!(s.server.time_adjuster().get_diff(), STORE_LAG_SEC);

    s.server
        .report(&Heartbeat {
            instance_id: "ins-1".to_string(),
            count: 7,
            ..Default::default()
        })
        .await
        .unwrap();
    let last = s.server.last_heartbeat("ins-1").await.unwrap();
    assert!(last.exists);
    assert_eq!(last.count, 7);
    assert_eq!(last.last_heartbeat_sec, BASE_TIME_SEC - STORE_LAG_SEC);
    assert_eq!(last.server, "127.0.0.1");

    s.server.shutdown(true).await;
}

/// 检查器启动后的宽限期内不判定，宽限期过后从未上报的实例变为不健康
///
/// 宽限期从首次检查的校正时间开始计算，与本机时钟无关
#[tokio::test(start_paused = true)]
async fn test_startup_grace_period() {
    let s = scenario(MemoryHealthChecker::new()).await;
    assert_ne!(s.server.time_adjuster().get_diff(), 0);
    let mut events = s.server.subscribe_events();

    sleep(Duration::from_secs(10)).await;
    assert!(events.try_recv().is_err());

    sleep(Duration::from_secs(20)).await;
    let record = events.try_recv().unwrap();
    assert!(!record.healthy);
    assert_eq!(s.store.status_of("ins-1").unwrap().status, 0);

    s.server.shutdown(true).await;
}
