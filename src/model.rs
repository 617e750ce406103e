//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了注册中心实例模型，以及与检查器绑定后的实例快照。

use crate::checker::HealthChecker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// 健康检查类型
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    /// 未知类型
    #[default]
    Unknown,
    /// 心跳检查
    Heartbeat,
}

impl fmt::Display for HealthCheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthCheckType::Unknown => write!(f, "unknown"),
            HealthCheckType::Heartbeat => write!(f, "heartbeat"),
        }
    }
}

/// 实例声明的健康检查配置
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HealthCheck {
    /// 检查类型
    #[serde(rename = "type")]
    pub check_type: HealthCheckType,
    /// 心跳有效期（秒）
    pub ttl_sec: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            check_type: HealthCheckType::Heartbeat,
            ttl_sec: 5,
        }
    }
}

/// 服务实例
///
/// 实例由外部的发现缓存持有，这里只读取其快照
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Instance {
    pub id: String,
    pub service: String,
    pub namespace: String,
    pub host: String,
    pub port: u32,
    pub weight: u32,
    pub healthy: bool,
    pub isolate: bool,
    pub enable_health_check: bool,
    pub health_check: Option<HealthCheck>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub revision: String,
}

impl Instance {
    /// 是否开启了健康检查
    pub fn health_check_enabled(&self) -> bool {
        self.enable_health_check && self.health_check.is_some()
    }

    /// 声明的健康检查类型
    pub fn health_check_type(&self) -> HealthCheckType {
        self.health_check
            .as_ref()
            .map(|hc| hc.check_type)
            .unwrap_or_default()
    }

    /// 心跳TTL（秒），未声明时返回0
    pub fn ttl_sec(&self) -> u32 {
        self.health_check.as_ref().map(|hc| hc.ttl_sec).unwrap_or(0)
    }

    /// 健康状态的整数表示（1: 健康, 0: 不健康）
    pub fn status_of(healthy: bool) -> i32 {
        if healthy {
            1
        } else {
            0
        }
    }
}

/// 绑定了检查器的实例快照
///
/// 由CacheProvider在实例创建或修订号变化时生成
#[derive(Clone)]
pub struct InstanceWithChecker {
    instance: Arc<Instance>,
    checker: Arc<dyn HealthChecker>,
    hash_value: u32,
}

impl InstanceWithChecker {
    pub fn new(instance: Arc<Instance>, checker: Arc<dyn HealthChecker>) -> Self {
        let hash_value = hash_of(&instance.id);
        Self {
            instance,
            checker,
            hash_value,
        }
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn checker(&self) -> &Arc<dyn HealthChecker> {
        &self.checker
    }

    /// 实例ID的哈希值，用于一致性哈希分发
    pub fn hash_value(&self) -> u32 {
        self.hash_value
    }
}

impl fmt::Debug for InstanceWithChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceWithChecker")
            .field("instance", &self.instance.id)
            .field("revision", &self.instance.revision)
            .field("checker", &self.checker.name())
            .finish()
    }
}

/// 健康状态变更的审计记录
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct InstanceEventRecord {
    pub instance_id: String,
    pub service: String,
    pub namespace: String,
    pub host: String,
    pub port: u32,
    /// 变更后的健康状态
    pub healthy: bool,
    pub last_heartbeat_sec: i64,
    /// 执行检查的节点
    pub local_host: String,
    /// 状态是否成功写入存储层
    pub persisted: bool,
    pub create_time: DateTime<Utc>,
}

/// 计算字符串的murmur3哈希
pub fn hash_of(value: &str) -> u32 {
    let mut bytes = value.as_bytes();
    murmur3::murmur3_32(&mut bytes, 0).unwrap_or(0)
}
