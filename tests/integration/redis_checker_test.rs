//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! Redis心跳检查器集成测试，Redis不可用时跳过

use oxcheck::checker::redis::RedisHealthChecker;
use oxcheck::checker::{
    AdoptRequest, BatchQueryRequest, CheckRequest, HealthChecker, QueryRequest, ReportRequest,
};
use oxcheck::config::RedisCheckerConfig;
use oxcheck::utils::generate_unique_key_prefix;
use secrecy::SecretString;
use serial_test::serial;
use std::sync::Arc;

#[path = "../common/mod.rs"]
mod common;

async fn connect() -> Option<(RedisHealthChecker, redis::aio::MultiplexedConnection)> {
    common::setup_logging();
    if !common::is_redis_available().await {
        println!("Redis not available, skipping test");
        return None;
    }
    let config = RedisCheckerConfig {
        connection_string: SecretString::new(common::redis_url().into()),
        key_prefix: generate_unique_key_prefix("oxcheck_test"),
        ..Default::default()
    };
    let checker = RedisHealthChecker::connect(&config).await.unwrap();
    let conn = redis::Client::open(common::redis_url())
        .unwrap()
        .get_multiplexed_async_connection()
        .await
        .unwrap();
    Some((checker, conn))
}

fn query(id: &str, healthy: bool) -> QueryRequest {
    QueryRequest {
        instance_id: id.to_string(),
        host: "10.0.0.1".to_string(),
        port: 8080,
        healthy,
    }
}

fn check_request(id: &str, healthy: bool, now: i64) -> CheckRequest {
    CheckRequest {
        query: query(id, healthy),
        expire_duration_sec: 15,
        cur_time_sec: Arc::new(move || now),
    }
}

async fn report(checker: &RedisHealthChecker, id: &str, at: i64, count: i64) {
    checker
        .report(&ReportRequest {
            instance_id: id.to_string(),
            host: "10.0.0.1".to_string(),
            port: 8080,
            local_host: "127.0.0.1".to_string(),
            cur_time_sec: at,
            count,
        })
        .await
        .unwrap();
}

#[tokio::test]
#[serial]
async fn test_report_and_query() {
    let Some((checker, _conn)) = connect().await else {
        return;
    };

    let missing = checker.query(&query("ins-1", true)).await.unwrap();
    assert!(!missing.exists);

    report(&checker, "ins-1", 1_700_000_000, 3).await;
    let found = checker.query(&query("ins-1", true)).await.unwrap();
    assert!(found.exists);
    assert_eq!(found.last_heartbeat_sec, 1_700_000_000);
    assert_eq!(found.count, 3);
    assert_eq!(found.server, "127.0.0.1");

    let batch = checker
        .batch_query(&BatchQueryRequest {
            requests: vec![query("ins-1", true), query("ins-2", true)],
        })
        .await
        .unwrap();
    assert!(batch.responses["ins-1"].exists);
    assert!(!batch.responses["ins-2"].exists);

    checker.delete("ins-1").await.unwrap();
    assert!(!checker.query(&query("ins-1", true)).await.unwrap().exists);
}

#[tokio::test]
#[serial]
async fn test_check_detects_expiry() {
    let Some((checker, _conn)) = connect().await else {
        return;
    };
    let now = 1_700_000_000;
    report(&checker, "ins-1", now, 1).await;

    let resp = checker.check(&check_request("ins-1", true, now + 5)).await.unwrap();
    assert!(resp.healthy);
    assert!(resp.stay_unchanged);
    assert!(resp.regular);

    let resp = checker
        .check(&check_request("ins-1", true, now + 15))
        .await
        .unwrap();
    assert!(!resp.healthy);
    assert!(!resp.stay_unchanged);
    assert_eq!(resp.last_heartbeat_time_sec, now);

    checker.delete("ins-1").await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_first_check_seeds_record() {
    let Some((checker, _conn)) = connect().await else {
        return;
    };
    let now = 1_700_000_000;

    let resp = checker.check(&check_request("ins-1", true, now)).await.unwrap();
    assert!(resp.healthy);
    assert_eq!(resp.last_heartbeat_time_sec, now);

    let seeded = checker.query(&query("ins-1", true)).await.unwrap();
    assert!(seeded.exists);
    assert_eq!(seeded.last_heartbeat_sec, now);
    assert_eq!(seeded.count, 0);

    checker.delete("ins-1").await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_unhealthy_without_record_is_not_seeded() {
    let Some((checker, _conn)) = connect().await else {
        return;
    };
    let now = 1_700_000_000;

    let resp = checker.check(&check_request("ins-1", false, now)).await.unwrap();
    assert!(!resp.healthy);
    assert!(resp.stay_unchanged);
    assert_eq!(resp.last_heartbeat_time_sec, 0);
    assert!(!checker.query(&query("ins-1", false)).await.unwrap().exists);

    report(&checker, "ins-1", now + 1, 1).await;
    let resp = checker
        .check(&check_request("ins-1", false, now + 2))
        .await
        .unwrap();
    assert!(resp.healthy);
    assert!(!resp.stay_unchanged);

    checker.delete("ins-1").await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_adoption_set() {
    let Some((checker, mut conn)) = connect().await else {
        return;
    };
    let key = checker.adopt_key("10.0.0.1");
    let request = AdoptRequest {
        instances: vec!["ins-1".to_string(), "ins-2".to_string()],
        local_host: "10.0.0.1".to_string(),
    };

    checker.add_to_check(&request).await.unwrap();
    checker.add_to_check(&request).await.unwrap();
    let mut members: Vec<String> = redis::cmd("SMEMBERS")
        .arg(&key)
        .query_async(&mut conn)
        .await
        .unwrap();
    members.sort();
    assert_eq!(members, request.instances);

    checker
        .remove_from_check(&AdoptRequest {
            instances: vec!["ins-1".to_string()],
            local_host: "10.0.0.1".to_string(),
        })
        .await
        .unwrap();
    let members: Vec<String> = redis::cmd("SMEMBERS")
        .arg(&key)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(members, vec!["ins-2".to_string()]);

    let _: i64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await.unwrap();
}
