//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 批量领养集成测试

use oxcheck::config::HealthCheckConfig;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[path = "../common/mod.rs"]
mod common;

use common::{heartbeat_instance, tokio_clock, Harness, MockChecker, BASE_TIME_SEC};

fn harness(checker: &Arc<MockChecker>) -> Harness {
    common::setup_logging();
    let h = Harness::new(
        checker.clone(),
        &HealthCheckConfig::default(),
        tokio_clock(BASE_TIME_SEC),
    );
    h.scheduler.start();
    h
}

/// 窗口内的少量加入合并为一次提交
#[tokio::test(start_paused = true)]
async fn test_adds_flushed_by_interval() {
    let checker = MockChecker::new();
    let h = harness(&checker);

    for i in 0..10 {
        h.add(&heartbeat_instance(&format!("ins-{:02}", i), "10.0.0.1", 8080, 5))
            .await;
    }
    assert!(checker.add_calls().is_empty());

    sleep(Duration::from_millis(50)).await;
    let calls = checker.add_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].len(), 10);
    assert_eq!(calls[0][0], "ins-00");

    h.scheduler.stop(true).await;
}

/// 达到批量阈值立即提交
#[tokio::test(start_paused = true)]
async fn test_adds_flushed_by_count() {
    let checker = MockChecker::new();
    let h = harness(&checker);

    for i in 0..45 {
        h.add(&heartbeat_instance(&format!("ins-{}", i), "10.0.0.1", 8080, 5))
            .await;
    }
    tokio::task::yield_now().await;
    sleep(Duration::from_millis(50)).await;

    let sizes: Vec<usize> = checker.add_calls().iter().map(|c| c.len()).collect();
    assert_eq!(sizes.iter().sum::<usize>(), 45);
    assert!(sizes.iter().all(|s| *s <= 30));
    assert!(sizes.contains(&30));

    h.scheduler.stop(true).await;
}

/// 窗口内先加入后删除的实例不产生任何调用
#[tokio::test(start_paused = true)]
async fn test_add_then_del_within_window_nets_out() {
    let checker = MockChecker::new();
    let h = harness(&checker);

    h.add(&heartbeat_instance("ins-1", "10.0.0.1", 8080, 5)).await;
    h.del("ins-1").await;
    h.add(&heartbeat_instance("ins-2", "10.0.0.1", 8080, 5)).await;

    sleep(Duration::from_millis(100)).await;
    assert_eq!(checker.add_calls(), vec![vec!["ins-2".to_string()]]);
    assert!(checker.remove_calls().is_empty());

    h.scheduler.stop(true).await;
}

/// 删除在之后的窗口中批量提交
#[tokio::test(start_paused = true)]
async fn test_removes_batched() {
    let checker = MockChecker::new();
    let h = harness(&checker);

    for i in 0..5 {
        h.add(&heartbeat_instance(&format!("ins-{}", i), "10.0.0.1", 8080, 5))
            .await;
    }
    sleep(Duration::from_millis(100)).await;
    for i in 0..5 {
        h.del(&format!("ins-{}", i)).await;
    }
    sleep(Duration::from_millis(100)).await;

    assert_eq!(checker.add_calls().len(), 1);
    let removes = checker.remove_calls();
    assert_eq!(removes.len(), 1);
    assert_eq!(removes[0].len(), 5);
    assert_eq!(h.scheduler.scheduled_count(), 0);

    h.scheduler.stop(true).await;
}

/// 提交失败的集合保留到下一次
#[tokio::test(start_paused = true)]
async fn test_failed_adoption_retried() {
    let checker = MockChecker::new();
    checker.fail_adopt.store(true, Ordering::SeqCst);
    let h = harness(&checker);

    h.add(&heartbeat_instance("ins-1", "10.0.0.1", 8080, 5)).await;
    sleep(Duration::from_millis(200)).await;
    assert!(checker.add_calls().is_empty());

    checker.fail_adopt.store(false, Ordering::SeqCst);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(checker.added_ids(), vec!["ins-1".to_string()]);

    h.scheduler.stop(true).await;
}
