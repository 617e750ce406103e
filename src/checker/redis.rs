//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块实现了基于Redis的心跳检查器，多个调度节点可共享同一个后端。

use super::{
    judge, system_time_sec, AdoptRequest, BatchQueryRequest, BatchQueryResponse, CheckRequest,
    CheckResponse, HealthChecker, HeartbeatRecord, QueryRequest, QueryResponse, ReportRequest,
};
use crate::config::RedisCheckerConfig;
use crate::error::{CheckError, Result};
use crate::model::HealthCheckType;
use crate::utils::redaction::redact_connection_string;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

pub const PLUGIN_NAME: &str = "heartbeatRedis";

/// 编码心跳记录
pub fn encode_record(record: &HeartbeatRecord) -> Result<String> {
    Ok(serde_json::to_string(record)?)
}

/// 解码心跳记录
pub fn decode_record(value: &str) -> Result<HeartbeatRecord> {
    Ok(serde_json::from_str(value)?)
}

/// 没有心跳记录且已知不健康的实例的检查结果
fn missing_record_response() -> CheckResponse {
    CheckResponse {
        healthy: false,
        last_heartbeat_time_sec: 0,
        stay_unchanged: true,
        regular: true,
    }
}

/// 批量查询中单条记录的结果，无法解码的记录视为不存在
fn query_response_of(instance_id: &str, value: Option<&str>) -> QueryResponse {
    let Some(value) = value else {
        return QueryResponse::default();
    };
    match decode_record(value) {
        Ok(record) => QueryResponse {
            server: record.server,
            last_heartbeat_sec: record.cur_time_sec,
            count: record.count,
            exists: true,
        },
        Err(e) => {
            warn!(instance = instance_id, error = %e, "RedisCheck: undecodable heartbeat record");
            QueryResponse::default()
        }
    }
}

/// Redis心跳检查器
///
/// 心跳记录以JSON形式保存在`{prefix}{instance_id}`键下，领养关系保存在
/// `{prefix}adopt:{local_host}`集合中。Redis从故障中恢复后的一个过期周期内，
/// 检查结果保持不变，避免因故障期间丢失的心跳误判实例不健康。
pub struct RedisHealthChecker {
    manager: ConnectionManager,
    key_prefix: String,
    command_timeout: Duration,
    available: AtomicBool,
    recover_time_sec: AtomicI64,
}

impl RedisHealthChecker {
    /// 连接Redis并创建检查器
    #[instrument(skip(config), level = "info", name = "init_redis_checker")]
    pub async fn connect(config: &RedisCheckerConfig) -> Result<Self> {
        let client = Client::open(config.connection_string.expose_secret())?;
        let manager = timeout(
            Duration::from_millis(config.connection_timeout_ms),
            client.get_connection_manager(),
        )
        .await
        .map_err(|_| {
            CheckError::Timeout(format!(
                "Redis connection timed out after {}ms",
                config.connection_timeout_ms
            ))
        })??;
        info!(
            url = %redact_connection_string(config.connection_string.expose_secret()),
            prefix = %config.key_prefix,
            "RedisCheck: connected"
        );
        Ok(Self::with_manager(manager, config))
    }

    /// 使用已有的连接管理器创建检查器
    pub fn with_manager(manager: ConnectionManager, config: &RedisCheckerConfig) -> Self {
        Self {
            manager,
            key_prefix: config.key_prefix.clone(),
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            available: AtomicBool::new(true),
            recover_time_sec: AtomicI64::new(0),
        }
    }

    fn record_key(&self, instance_id: &str) -> String {
        format!("{}{}", self.key_prefix, instance_id)
    }

    /// 领养集合的键
    pub fn adopt_key(&self, local_host: &str) -> String {
        format!("{}adopt:{}", self.key_prefix, local_host)
    }

    /// 最近一次从故障中恢复的时间（秒），0表示未发生过故障
    pub fn recover_time_sec(&self) -> i64 {
        self.recover_time_sec.load(Ordering::Acquire)
    }

    async fn run<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match timeout(self.command_timeout, fut).await {
            Ok(Ok(value)) => {
                if !self.available.swap(true, Ordering::AcqRel) {
                    let now = system_time_sec();
                    self.recover_time_sec.store(now, Ordering::Release);
                    info!(recover_time_sec = now, "RedisCheck: backend recovered");
                }
                Ok(value)
            }
            Ok(Err(e)) => {
                if self.available.swap(false, Ordering::AcqRel) {
                    warn!(op, error = %e, "RedisCheck: backend unavailable");
                }
                Err(CheckError::RedisError(e))
            }
            Err(_) => {
                if self.available.swap(false, Ordering::AcqRel) {
                    warn!(op, "RedisCheck: backend command timed out");
                }
                Err(CheckError::Timeout(format!(
                    "redis {} timed out after {}ms",
                    op,
                    self.command_timeout.as_millis()
                )))
            }
        }
    }

    fn in_recover_window(&self, expire_duration_sec: u32) -> bool {
        let recover_time_sec = self.recover_time_sec();
        if recover_time_sec == 0 {
            return false;
        }
        let now = system_time_sec();
        now >= recover_time_sec && now - recover_time_sec < expire_duration_sec as i64
    }

    async fn load(&self, instance_id: &str) -> Result<Option<HeartbeatRecord>> {
        let mut conn = self.manager.clone();
        let key = self.record_key(instance_id);
        let value: Option<String> = self
            .run("GET", redis::cmd("GET").arg(&key).query_async(&mut conn))
            .await?;
        value.map(|v| decode_record(&v)).transpose()
    }
}

#[async_trait]
impl HealthChecker for RedisHealthChecker {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn check_type(&self) -> HealthCheckType {
        HealthCheckType::Heartbeat
    }

    async fn report(&self, request: &ReportRequest) -> Result<()> {
        let value = encode_record(&HeartbeatRecord {
            server: request.local_host.clone(),
            cur_time_sec: request.cur_time_sec,
            count: request.count,
        })?;
        let mut conn = self.manager.clone();
        let key = self.record_key(&request.instance_id);
        let _: () = self
            .run(
                "SET",
                redis::cmd("SET").arg(&key).arg(value).query_async(&mut conn),
            )
            .await?;
        debug!(instance = %request.instance_id, "RedisCheck: heartbeat reported");
        Ok(())
    }

    async fn check(&self, request: &CheckRequest) -> Result<CheckResponse> {
        let instance_id = &request.query.instance_id;
        let record = match self.load(instance_id).await {
            Ok(record) => record,
            Err(e) => {
                debug!(instance = %instance_id, error = %e, "RedisCheck: query failed");
                return Err(e);
            }
        };

        let last_heartbeat_sec = match record {
            Some(record) => record.cur_time_sec,
            None if !request.query.healthy => {
                debug!(instance = %instance_id, "RedisCheck: no heartbeat, stay unhealthy");
                return Ok(missing_record_response());
            }
            None => {
                // 首次观测到实例时以当前时间开启TTL窗口
                let cur_time_sec = (request.cur_time_sec)();
                let seed = encode_record(&HeartbeatRecord {
                    server: String::new(),
                    cur_time_sec,
                    count: 0,
                })?;
                let mut conn = self.manager.clone();
                let key = self.record_key(instance_id);
                let _: Option<String> = self
                    .run(
                        "SET",
                        redis::cmd("SET")
                            .arg(&key)
                            .arg(seed)
                            .arg("NX")
                            .query_async(&mut conn),
                    )
                    .await?;
                cur_time_sec
            }
        };

        if self.in_recover_window(request.expire_duration_sec) {
            debug!(
                instance = %instance_id,
                recover_time_sec = self.recover_time_sec(),
                "RedisCheck: within recovery window, skip"
            );
            return Ok(CheckResponse {
                healthy: request.query.healthy,
                last_heartbeat_time_sec: last_heartbeat_sec,
                stay_unchanged: true,
                regular: false,
            });
        }

        let response = judge(request, last_heartbeat_sec);
        if !response.stay_unchanged {
            info!(
                instance = %instance_id,
                last_heartbeat_sec,
                expire_duration_sec = request.expire_duration_sec,
                healthy = response.healthy,
                "RedisCheck: health status changed"
            );
        }
        Ok(response)
    }

    async fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        Ok(match self.load(&request.instance_id).await? {
            Some(record) => QueryResponse {
                server: record.server,
                last_heartbeat_sec: record.cur_time_sec,
                count: record.count,
                exists: true,
            },
            None => QueryResponse::default(),
        })
    }

    async fn batch_query(&self, request: &BatchQueryRequest) -> Result<BatchQueryResponse> {
        if request.requests.is_empty() {
            return Ok(BatchQueryResponse::default());
        }
        let keys: Vec<String> = request
            .requests
            .iter()
            .map(|q| self.record_key(&q.instance_id))
            .collect();
        let mut conn = self.manager.clone();
        let values: Vec<Option<String>> = self
            .run("MGET", redis::cmd("MGET").arg(&keys).query_async(&mut conn))
            .await?;

        let mut responses = HashMap::with_capacity(values.len());
        for (query, value) in request.requests.iter().zip(values) {
            responses.insert(
                query.instance_id.clone(),
                query_response_of(&query.instance_id, value.as_deref()),
            );
        }
        Ok(BatchQueryResponse { responses })
    }

    async fn add_to_check(&self, request: &AdoptRequest) -> Result<()> {
        if request.instances.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let key = self.adopt_key(&request.local_host);
        let _: i64 = self
            .run(
                "SADD",
                redis::cmd("SADD")
                    .arg(&key)
                    .arg(&request.instances)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn remove_from_check(&self, request: &AdoptRequest) -> Result<()> {
        if request.instances.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let key = self.adopt_key(&request.local_host);
        let _: i64 = self
            .run(
                "SREM",
                redis::cmd("SREM")
                    .arg(&key)
                    .arg(&request.instances)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, instance_id: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let key = self.record_key(instance_id);
        let _: i64 = self
            .run("DEL", redis::cmd("DEL").arg(&key).query_async(&mut conn))
            .await?;
        Ok(())
    }
}
