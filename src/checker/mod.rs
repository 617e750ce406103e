//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了可插拔的健康检查器接口，以及内存和Redis两种心跳检查器实现。

pub mod memory;
pub mod redis;

use crate::config::CheckerConfig;
use crate::error::Result;
use crate::model::HealthCheckType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// 当前时间函数（秒级Unix时间戳）
pub type TimeFn = Arc<dyn Fn() -> i64 + Send + Sync>;

/// 系统时钟的秒级Unix时间戳
pub fn system_time_sec() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// 心跳上报请求
#[derive(Debug, Clone, Default)]
pub struct ReportRequest {
    pub instance_id: String,
    pub host: String,
    pub port: u32,
    pub local_host: String,
    pub cur_time_sec: i64,
    pub count: i64,
}

/// 心跳查询请求
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub instance_id: String,
    pub host: String,
    pub port: u32,
    /// 调用方当前已知的健康状态
    pub healthy: bool,
}

/// 心跳查询结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResponse {
    /// 最近一次上报心跳的节点
    pub server: String,
    /// 最近一次心跳时间（秒），0表示从未上报
    pub last_heartbeat_sec: i64,
    pub count: i64,
    /// 记录是否存在
    pub exists: bool,
}

/// 批量心跳查询请求
#[derive(Debug, Clone, Default)]
pub struct BatchQueryRequest {
    pub requests: Vec<QueryRequest>,
}

/// 批量心跳查询结果
#[derive(Debug, Clone, Default)]
pub struct BatchQueryResponse {
    pub responses: HashMap<String, QueryResponse>,
}

/// 健康检查请求
#[derive(Clone)]
pub struct CheckRequest {
    pub query: QueryRequest,
    pub expire_duration_sec: u32,
    pub cur_time_sec: TimeFn,
}

impl fmt::Debug for CheckRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckRequest")
            .field("query", &self.query)
            .field("expire_duration_sec", &self.expire_duration_sec)
            .finish()
    }
}

/// 健康检查结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckResponse {
    pub healthy: bool,
    pub last_heartbeat_time_sec: i64,
    /// 健康状态无需变更
    pub stay_unchanged: bool,
    /// 是否为真实的心跳观测（而不是后端恢复期的宽限结果）
    pub regular: bool,
}

/// 领养请求
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdoptRequest {
    pub instances: Vec<String>,
    pub local_host: String,
}

/// 后端存储的心跳记录
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatRecord {
    pub server: String,
    pub cur_time_sec: i64,
    pub count: i64,
}

/// 健康检查器插件
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// 插件名称
    fn name(&self) -> &str;

    /// 插件负责的检查类型
    fn check_type(&self) -> HealthCheckType;

    /// 上报心跳
    async fn report(&self, request: &ReportRequest) -> Result<()>;

    /// 执行一次健康检查
    async fn check(&self, request: &CheckRequest) -> Result<CheckResponse>;

    /// 查询心跳记录
    async fn query(&self, request: &QueryRequest) -> Result<QueryResponse>;

    /// 批量查询心跳记录
    async fn batch_query(&self, request: &BatchQueryRequest) -> Result<BatchQueryResponse> {
        let mut responses = HashMap::with_capacity(request.requests.len());
        for query in &request.requests {
            responses.insert(query.instance_id.clone(), self.query(query).await?);
        }
        Ok(BatchQueryResponse { responses })
    }

    /// 声明本节点负责检查这些实例，必须幂等
    async fn add_to_check(&self, request: &AdoptRequest) -> Result<()>;

    /// 声明本节点不再负责检查这些实例，必须幂等
    async fn remove_from_check(&self, request: &AdoptRequest) -> Result<()>;

    /// 删除实例的心跳记录
    async fn delete(&self, instance_id: &str) -> Result<()>;
}

/// 根据上次心跳时间得出检查结果
///
/// 两种后端共用的判定逻辑：超过过期时间视为不健康，否则视为健康；
/// 与已知状态一致时标记为无需变更。
pub(crate) fn judge(request: &CheckRequest, last_heartbeat_sec: i64) -> CheckResponse {
    let cur_time_sec = (request.cur_time_sec)();
    let expired = cur_time_sec > last_heartbeat_sec
        && cur_time_sec - last_heartbeat_sec >= request.expire_duration_sec as i64;
    let known_healthy = request.query.healthy;
    CheckResponse {
        healthy: !expired,
        last_heartbeat_time_sec: last_heartbeat_sec,
        stay_unchanged: expired != known_healthy,
        regular: true,
    }
}

/// 根据配置构建检查器
pub async fn build_checkers(configs: &[CheckerConfig]) -> Result<Vec<Arc<dyn HealthChecker>>> {
    let mut checkers: Vec<Arc<dyn HealthChecker>> = Vec::with_capacity(configs.len());
    for config in configs {
        match config {
            CheckerConfig::Memory => {
                checkers.push(Arc::new(memory::MemoryHealthChecker::new()));
            }
            CheckerConfig::Redis(redis_config) => {
                checkers.push(Arc::new(
                    redis::RedisHealthChecker::connect(redis_config).await?,
                ));
            }
        }
    }
    Ok(checkers)
}
