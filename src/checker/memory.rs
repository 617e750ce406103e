//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块实现了基于进程内存的心跳检查器，适用于单节点或不共享后端的部署。

use super::{
    judge, AdoptRequest, CheckRequest, CheckResponse, HealthChecker,
    HeartbeatRecord, QueryRequest, QueryResponse, ReportRequest,
};
use crate::error::Result;
use crate::model::HealthCheckType;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::OnceLock;
use tracing::{debug, info};

pub const PLUGIN_NAME: &str = "heartbeatMemory";

/// 内存心跳检查器
///
/// 心跳记录保存在本地并发哈希表中。进程重启后记录丢失，因此启动后的
/// 一个过期周期内检查结果保持不变，等待客户端重新上报。
///
/// 启动时间取自第一次请求携带的时间，与检查使用同一个校准后的时钟。
pub struct MemoryHealthChecker {
    records: DashMap<String, HeartbeatRecord>,
    start_time_sec: OnceLock<i64>,
}

impl MemoryHealthChecker {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            start_time_sec: OnceLock::new(),
        }
    }

    /// 以指定的启动时间创建检查器
    pub fn with_start_time_sec(start_time_sec: i64) -> Self {
        Self {
            records: DashMap::new(),
            start_time_sec: OnceLock::from(start_time_sec),
        }
    }

    /// 启动时间（秒），尚未收到任何请求时返回None
    pub fn start_time_sec(&self) -> Option<i64> {
        self.start_time_sec.get().copied()
    }

    /// 当前保存的心跳记录数
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    fn start_time_or_init(&self, cur_time_sec: i64) -> i64 {
        *self.start_time_sec.get_or_init(|| cur_time_sec)
    }

}

fn in_grace_period(start_time_sec: i64, cur_time_sec: i64, expire_duration_sec: u32) -> bool {
    cur_time_sec >= start_time_sec && cur_time_sec - start_time_sec < expire_duration_sec as i64
}

impl Default for MemoryHealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthChecker for MemoryHealthChecker {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn check_type(&self) -> HealthCheckType {
        HealthCheckType::Heartbeat
    }

    async fn report(&self, request: &ReportRequest) -> Result<()> {
        self.start_time_or_init(request.cur_time_sec);
        debug!(
            instance = %request.instance_id,
            cur_time_sec = request.cur_time_sec,
            "MemoryCheck: heartbeat reported"
        );
        self.records.insert(
            request.instance_id.clone(),
            HeartbeatRecord {
                server: request.local_host.clone(),
                cur_time_sec: request.cur_time_sec,
                count: request.count,
            },
        );
        Ok(())
    }

    async fn check(&self, request: &CheckRequest) -> Result<CheckResponse> {
        let cur_time_sec = (request.cur_time_sec)();
        let start_time_sec = self.start_time_or_init(cur_time_sec);
        let known_healthy = request.query.healthy;

        // 没有记录时，已知不健康的实例保持不健康；
        // 已知健康的实例以当前时间开启TTL窗口
        let existing = self
            .records
            .get(&request.query.instance_id)
            .map(|record| record.cur_time_sec);
        let last_heartbeat_sec = match existing {
            Some(last_heartbeat_sec) => last_heartbeat_sec,
            None if !known_healthy => {
                debug!(instance = %request.query.instance_id, "MemoryCheck: no heartbeat, stay unhealthy");
                return Ok(CheckResponse {
                    healthy: false,
                    last_heartbeat_time_sec: 0,
                    stay_unchanged: true,
                    regular: true,
                });
            }
            None => {
                self.records
                    .entry(request.query.instance_id.clone())
                    .or_insert_with(|| HeartbeatRecord {
                        server: String::new(),
                        cur_time_sec,
                        count: 0,
                    })
                    .cur_time_sec
            }
        };

        if in_grace_period(start_time_sec, cur_time_sec, request.expire_duration_sec) {
            debug!(
                instance = %request.query.instance_id,
                start_time_sec,
                cur_time_sec,
                "MemoryCheck: within startup grace period, skip"
            );
            return Ok(CheckResponse {
                healthy: known_healthy,
                last_heartbeat_time_sec: last_heartbeat_sec,
                stay_unchanged: true,
                regular: false,
            });
        }

        let response = judge(request, last_heartbeat_sec);
        if !response.stay_unchanged {
            info!(
                instance = %request.query.instance_id,
                last_heartbeat_sec,
                cur_time_sec,
                expire_duration_sec = request.expire_duration_sec,
                healthy = response.healthy,
                "MemoryCheck: health status changed"
            );
        }
        Ok(response)
    }

    async fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        Ok(match self.records.get(&request.instance_id) {
            Some(record) => QueryResponse {
                server: record.server.clone(),
                last_heartbeat_sec: record.cur_time_sec,
                count: record.count,
                exists: true,
            },
            None => QueryResponse::default(),
        })
    }

    async fn add_to_check(&self, _request: &AdoptRequest) -> Result<()> {
        Ok(())
    }

    async fn remove_from_check(&self, _request: &AdoptRequest) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, instance_id: &str) -> Result<()> {
        self.records.remove(instance_id);
        Ok(())
    }
}
