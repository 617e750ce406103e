//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 调度器集成测试

use oxcheck::cache_provider::CacheListener;
use oxcheck::config::HealthCheckConfig;
use std::time::Duration;
use tokio::time::sleep;

#[path = "../common/mod.rs"]
mod common;

use common::{heartbeat_instance, tokio_clock, Harness, MockChecker, BASE_TIME_SEC};

fn harness(checker: &std::sync::Arc<MockChecker>) -> Harness {
    common::setup_logging();
    Harness::new(
        checker.clone(),
        &HealthCheckConfig::default(),
        tokio_clock(BASE_TIME_SEC),
    )
}

/// 首次检查在最小间隔加抖动之后触发
#[tokio::test(start_paused = true)]
async fn test_first_check_after_min_interval() {
    let checker = MockChecker::new();
    let h = harness(&checker);
    h.scheduler.start();

    h.add(&heartbeat_instance("ins-1", "10.0.0.1", 8080, 5)).await;
    assert!(h.scheduler.is_scheduled("ins-1"));

    sleep(Duration::from_millis(1500)).await;
    assert_eq!(checker.check_count("ins-1"), 0);

    sleep(Duration::from_millis(1000)).await;
    assert_eq!(checker.check_count("ins-1"), 1);

    h.scheduler.stop(true).await;
}

/// 健康实例按过期时间重新调度，时间轮上始终只有一个待触发任务
#[tokio::test(start_paused = true)]
async fn test_healthy_instance_rescheduled_with_single_task() {
    let checker = MockChecker::new();
    let h = harness(&checker);
    h.scheduler.start();
    h.add(&heartbeat_instance("ins-1", "10.0.0.1", 8080, 5)).await;

    for _ in 0..120 {
        sleep(Duration::from_millis(500)).await;
        assert!(h.scheduler.pending_checks() <= 1);
    }
    // 首次检查在2秒，之后每次间隔 TTL*3 + 1 个指针间隔
    assert_eq!(checker.check_count("ins-1"), 4);
    assert_eq!(checker.max_in_flight(), 1);

    h.scheduler.stop(true).await;
}

/// 移出调度后不再检查，残留任务触发后直接结束
#[tokio::test(start_paused = true)]
async fn test_del_instance_stops_checks() {
    let checker = MockChecker::new();
    let h = harness(&checker);
    h.scheduler.start();
    h.add(&heartbeat_instance("ins-1", "10.0.0.1", 8080, 5)).await;

    sleep(Duration::from_millis(2500)).await;
    assert_eq!(checker.check_count("ins-1"), 1);

    h.del("ins-1").await;
    assert!(!h.scheduler.is_scheduled("ins-1"));
    sleep(Duration::from_secs(60)).await;

    assert_eq!(checker.check_count("ins-1"), 1);
    assert_eq!(h.scheduler.pending_checks(), 0);

    h.scheduler.stop(true).await;
}

/// 删除后立即重新加入，只保留一条检查链
#[tokio::test(start_paused = true)]
async fn test_readd_keeps_single_chain() {
    let checker = MockChecker::new();
    checker.set_check_delay(Duration::from_millis(300));
    let h = harness(&checker);
    h.scheduler.start();

    let instance = heartbeat_instance("ins-1", "10.0.0.1", 8080, 5);
    h.add(&instance).await;
    h.del("ins-1").await;
    h.add(&instance).await;

    sleep(Duration::from_millis(60_500)).await;
    assert_eq!(checker.check_count("ins-1"), 4);
    assert_eq!(checker.max_in_flight(), 1);
    assert_eq!(h.scheduler.pending_checks(), 1);

    h.scheduler.stop(true).await;
}

/// 慢检查不会导致同一实例的检查重叠
#[tokio::test(start_paused = true)]
async fn test_slow_checks_never_overlap() {
    let checker = MockChecker::new();
    checker.set_check_delay(Duration::from_secs(20));
    let h = harness(&checker);
    h.scheduler.start();

    for i in 0..10 {
        h.add(&heartbeat_instance(&format!("ins-{}", i), "10.0.0.1", 8080, 1))
            .await;
    }
    sleep(Duration::from_secs(120)).await;

    assert!(checker.total_checks() >= 30);
    assert_eq!(checker.max_in_flight(), 1);

    h.scheduler.stop(false).await;
}

/// 缓存中消失的实例跳过检查，但仍按不健康路径重新调度
#[tokio::test(start_paused = true)]
async fn test_vanished_instance_skips_check_but_stays_scheduled() {
    let checker = MockChecker::new();
    let h = harness(&checker);
    h.scheduler.start();
    let instance = heartbeat_instance("ins-1", "10.0.0.1", 8080, 5);
    h.add(&instance).await;

    sleep(Duration::from_millis(2500)).await;
    assert_eq!(checker.check_count("ins-1"), 1);

    h.cache.on_deleted(&instance);
    sleep(Duration::from_secs(60)).await;

    assert_eq!(checker.check_count("ins-1"), 1);
    assert!(h.scheduler.is_scheduled("ins-1"));
    assert_eq!(h.scheduler.pending_checks(), 1);

    h.scheduler.stop(true).await;
}

/// 健康状态变化只持久化一次
#[tokio::test(start_paused = true)]
async fn test_transition_persisted_once() {
    let checker = MockChecker::new();
    let h = harness(&checker);
    let mut events = h.scheduler.subscribe_events();
    let _mirror = common::spawn_registry_mirror(&h.scheduler, h.cache.clone());
    h.scheduler.start();

    h.add(&heartbeat_instance("ins-1", "10.0.0.1", 8080, 5)).await;
    checker.set_verdict("ins-1", false);

    sleep(Duration::from_secs(60)).await;

    assert!(checker.check_count("ins-1") >= 3);
    assert_eq!(h.store.write_count(), 1);
    assert_eq!(h.store.status_of("ins-1").unwrap().status, 0);

    let record = events.try_recv().unwrap();
    assert_eq!(record.instance_id, "ins-1");
    assert!(!record.healthy);
    assert!(record.persisted);
    assert!(events.try_recv().is_err());

    h.scheduler.stop(true).await;
}

/// 重复加入不会重复调度
#[tokio::test(start_paused = true)]
async fn test_add_is_idempotent() {
    let checker = MockChecker::new();
    let h = harness(&checker);
    h.scheduler.start();

    let instance = heartbeat_instance("ins-1", "10.0.0.1", 8080, 5);
    h.add(&instance).await;
    let iwc = h.cache.get_instance_with_checker("ins-1").unwrap();
    assert!(!h.scheduler.add_instance(&iwc).await);
    assert_eq!(h.scheduler.scheduled_count(), 1);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(checker.add_calls(), vec![vec!["ins-1".to_string()]]);
    assert_eq!(h.scheduler.pending_checks(), 1);

    h.scheduler.stop(true).await;
}

/// 更新实例不会产生新的检查任务
#[tokio::test(start_paused = true)]
async fn test_upsert_updates_in_place() {
    let checker = MockChecker::new();
    let h = harness(&checker);
    h.scheduler.start();

    let mut instance = heartbeat_instance("ins-1", "10.0.0.1", 8080, 5);
    h.add(&instance).await;

    instance.port = 9090;
    instance.revision = "r2".to_string();
    h.cache.on_updated(&instance);
    let iwc = h.cache.get_instance_with_checker("ins-1").unwrap();
    assert!(!h.scheduler.upsert_instance(&iwc).await);

    assert_eq!(h.scheduler.pending_checks(), 1);
    sleep(Duration::from_secs(20)).await;
    assert_eq!(checker.check_count("ins-1"), 2);

    h.scheduler.stop(true).await;
}
