//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 健康状态批量写入集成测试

use oxcheck::cache_provider::CacheListener;
use oxcheck::config::Config;
use oxcheck::model::Instance;
use oxcheck::server::HealthCheckServer;
use oxcheck::store::MemoryStore;
use oxcheck::sync::common::{BatchController, HeartbeatFuture, WriteCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

#[path = "../common/mod.rs"]
mod common;

use common::{heartbeat_instance, tokio_clock, MockChecker, BASE_TIME_SEC};

/// 记录提交内容的批量写入控制器
#[derive(Default)]
struct RecordingController {
    open: AtomicBool,
    submitted: Mutex<Vec<(String, bool)>>,
}

impl BatchController for RecordingController {
    fn heartbeat_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn async_heartbeat(&self, instance: &Instance, healthy: bool) -> HeartbeatFuture {
        self.submitted
            .lock()
            .unwrap()
            .push((instance.id.clone(), healthy));
        HeartbeatFuture::ready(WriteCode::ExecuteSuccess)
    }
}

fn store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::with_clock(tokio_clock(BASE_TIME_SEC)))
}

async fn start_with_unhealthy_instance(server: &Arc<HealthCheckServer>, checker: &MockChecker) {
    checker.set_verdict("ins-1", false);
    server
        .cache_provider()
        .on_created(&heartbeat_instance("ins-1", "10.0.0.1", 8080, 5));
    server.start().await.unwrap();
}

/// 开启批量写入时，状态变更经由内置批量写入器落盘
#[tokio::test(start_paused = true)]
async fn test_transition_written_through_batch_writer() {
    common::setup_logging();
    let store = store();
    let checker = MockChecker::new();
    let mut config = Config::default();
    config.batch_write.enable = true;
    let server = HealthCheckServer::builder(config, store.clone())
        .checker(checker.clone())
        .local_clock(tokio_clock(BASE_TIME_SEC))
        .build()
        .unwrap();
    let mut events = server.subscribe_events();

    start_with_unhealthy_instance(&server, &checker).await;
    sleep(Duration::from_secs(5)).await;

    let record = events.try_recv().unwrap();
    assert!(!record.healthy);
    assert!(record.persisted);
    assert_eq!(store.batch_write_count(), 1);
    assert_eq!(store.status_of("ins-1").unwrap().status, 0);

    server.shutdown(true).await;
}

/// 批量写入失败时，变更记录标记为未持久化
#[tokio::test(start_paused = true)]
async fn test_batch_write_failure_reported_in_record() {
    common::setup_logging();
    let store = store();
    store.set_fail_writes(true);
    let checker = MockChecker::new();
    let mut config = Config::default();
    config.batch_write.enable = true;
    let server = HealthCheckServer::builder(config, store.clone())
        .checker(checker.clone())
        .local_clock(tokio_clock(BASE_TIME_SEC))
        .build()
        .unwrap();
    let mut events = server.subscribe_events();

    start_with_unhealthy_instance(&server, &checker).await;
    sleep(Duration::from_secs(5)).await;

    let record = events.try_recv().unwrap();
    assert!(!record.healthy);
    assert!(!record.persisted);
    assert!(store.status_of("ins-1").is_none());

    server.shutdown(true).await;
}

/// 外部控制器开启时接管写入，不再直接写存储层
#[tokio::test(start_paused = true)]
async fn test_external_controller_takes_over_writes() {
    common::setup_logging();
    let store = store();
    let checker = MockChecker::new();
    let controller = Arc::new(RecordingController::default());
    controller.open.store(true, Ordering::SeqCst);
    let server = HealthCheckServer::builder(Config::default(), store.clone())
        .checker(checker.clone())
        .batch_controller(controller.clone())
        .local_clock(tokio_clock(BASE_TIME_SEC))
        .build()
        .unwrap();

    start_with_unhealthy_instance(&server, &checker).await;
    sleep(Duration::from_secs(5)).await;

    assert_eq!(
        *controller.submitted.lock().unwrap(),
        vec![("ins-1".to_string(), false)]
    );
    assert_eq!(store.write_count(), 0);

    server.shutdown(true).await;
}

/// 外部控制器关闭时回退到逐条写入
#[tokio::test(start_paused = true)]
async fn test_closed_controller_falls_back_to_direct_write() {
    common::setup_logging();
    let store = store();
    let checker = MockChecker::new();
    let controller = Arc::new(RecordingController::default());
    let server = HealthCheckServer::builder(Config::default(), store.clone())
        .checker(checker.clone())
        .batch_controller(controller.clone())
        .local_clock(tokio_clock(BASE_TIME_SEC))
        .build()
        .unwrap();

    start_with_unhealthy_instance(&server, &checker).await;
    sleep(Duration::from_secs(5)).await;

    assert!(controller.submitted.lock().unwrap().is_empty());
    assert_eq!(store.write_count(), 1);
    assert_eq!(store.batch_write_count(), 0);
    assert_eq!(store.status_of("ins-1").unwrap().status, 0);

    server.shutdown(true).await;
}
