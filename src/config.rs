//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了健康检查系统的配置结构和解析逻辑。

use crate::error::Result;
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

pub const CONFIG_VERSION: u32 = 1;

/// 默认的过期倍数，实例过期时间 = TTL × 倍数
pub const DEFAULT_EXPIRE_MULTIPLIER: u32 = 3;

/// 自身服务实例的元数据键
pub const DEFAULT_SELF_SERVICE_KEY: &str = "polaris_service";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub config_version: Option<u32>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub time_adjust: TimeAdjustConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub batch_write: BatchWriteConfig,
    #[serde(default = "default_checkers")]
    pub checkers: Vec<CheckerConfig>,
}

fn default_checkers() -> Vec<CheckerConfig> {
    vec![CheckerConfig::Memory]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: Some(CONFIG_VERSION),
            health_check: HealthCheckConfig::default(),
            time_adjust: TimeAdjustConfig::default(),
            dispatch: DispatchConfig::default(),
            batch_write: BatchWriteConfig::default(),
            checkers: default_checkers(),
        }
    }
}

/// 健康检查配置
///
/// 定义调度器的核心参数
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// 是否开启健康检查
    pub enable: bool,
    /// 本节点地址，用于领养声明和一致性哈希
    pub local_host: String,
    /// 健康检查服务自身的服务名
    pub self_service: String,
    /// 标识自身服务实例的元数据键
    pub self_service_key: String,
    /// 最小检查间隔（秒）
    pub min_check_interval_sec: u64,
    /// 最大检查间隔（秒），0表示不限制
    pub max_check_interval_sec: u64,
    /// 过期倍数
    pub expire_multiplier: u32,
    /// 时间轮配置
    pub time_wheel: TimeWheelConfig,
    /// 批量领养配置
    pub adoption: AdoptionConfig,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enable: true,
            local_host: "127.0.0.1".to_string(),
            self_service: "polaris.checker".to_string(),
            self_service_key: DEFAULT_SELF_SERVICE_KEY.to_string(),
            min_check_interval_sec: 1,
            max_check_interval_sec: 30,
            expire_multiplier: DEFAULT_EXPIRE_MULTIPLIER,
            time_wheel: TimeWheelConfig::default(),
            adoption: AdoptionConfig::default(),
        }
    }
}

/// 时间轮配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct TimeWheelConfig {
    /// 指针移动间隔（毫秒）
    pub interval_ms: u64,
    /// 槽位数量
    pub slot_num: usize,
}

impl Default for TimeWheelConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            slot_num: 360,
        }
    }
}

/// 批量领养配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct AdoptionConfig {
    /// 单批最大实例数
    pub batch_count: usize,
    /// 刷新间隔（毫秒）
    pub batch_interval_ms: u64,
    /// 领养事件通道容量
    pub channel_capacity: usize,
}

impl Default for AdoptionConfig {
    fn default() -> Self {
        Self {
            batch_count: 30,
            batch_interval_ms: 30,
            channel_capacity: 1024,
        }
    }
}

/// 时钟校准配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct TimeAdjustConfig {
    /// 校准间隔（秒）
    pub interval_sec: u64,
}

impl Default for TimeAdjustConfig {
    fn default() -> Self {
        Self { interval_sec: 10 }
    }
}

/// 实例分发配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DispatchConfig {
    /// 事件处理间隔（毫秒）
    pub event_interval_ms: u64,
    /// 全量对账间隔（秒）
    pub ensure_interval_sec: u64,
    /// 检查器后端是否被多个节点共享（共享时本节点负责全部实例）
    pub shared_checker: bool,
    /// 每个节点在哈希环上的虚拟节点数（按权重等比放大）
    pub virtual_nodes: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            event_interval_ms: 5000,
            ensure_interval_sec: 61,
            shared_checker: false,
            virtual_nodes: 160,
        }
    }
}

/// 批量写入配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BatchWriteConfig {
    /// 是否启用批量写入
    pub enable: bool,
    /// 最大批量大小
    pub max_batch_size: usize,
    /// 刷新间隔（毫秒）
    pub flush_interval_ms: u64,
}

impl Default for BatchWriteConfig {
    fn default() -> Self {
        Self {
            enable: false,
            max_batch_size: 32,
            flush_interval_ms: 50,
        }
    }
}

/// 检查器插件配置
#[derive(Deserialize, Clone, Debug)]
#[serde(tag = "name")]
pub enum CheckerConfig {
    /// 内存心跳检查器
    #[serde(rename = "heartbeatMemory")]
    Memory,
    /// Redis心跳检查器
    #[serde(rename = "heartbeatRedis")]
    Redis(RedisCheckerConfig),
}

impl CheckerConfig {
    /// 插件名称
    pub fn name(&self) -> &'static str {
        match self {
            CheckerConfig::Memory => crate::checker::memory::PLUGIN_NAME,
            CheckerConfig::Redis(_) => crate::checker::redis::PLUGIN_NAME,
        }
    }
}

/// Redis检查器配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RedisCheckerConfig {
    /// 连接字符串
    pub connection_string: SecretString,
    /// 连接超时时间（毫秒）
    pub connection_timeout_ms: u64,
    /// 命令执行超时时间（毫秒）
    pub command_timeout_ms: u64,
    /// 键前缀
    pub key_prefix: String,
}

impl Default for RedisCheckerConfig {
    fn default() -> Self {
        Self {
            connection_string: SecretString::new("redis://localhost:6379".to_string().into()),
            connection_timeout_ms: 5000,
            command_timeout_ms: 3000,
            key_prefix: "oxcheck:hb:".to_string(),
        }
    }
}

impl Config {
    /// 从TOML字符串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// 从TOML文件加载配置
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// 验证配置
    ///
    /// 检查配置的有效性，确保所有必需的字段都已设置，并且值在合理范围内
    pub fn validate(&self) -> std::result::Result<(), String> {
        if let Some(version) = &self.config_version {
            if *version > CONFIG_VERSION {
                return Err(format!(
                    "Configuration version {} is not supported. Current version is {}.",
                    version, CONFIG_VERSION
                ));
            }
        }

        let hc = &self.health_check;
        if hc.local_host.is_empty() {
            return Err("health_check.local_host cannot be empty".to_string());
        }

        if hc.self_service.is_empty() {
            return Err("health_check.self_service cannot be empty".to_string());
        }

        if hc.min_check_interval_sec == 0 {
            return Err("health_check.min_check_interval_sec cannot be zero".to_string());
        }

        if hc.max_check_interval_sec > 0 && hc.max_check_interval_sec < hc.min_check_interval_sec
        {
            return Err(format!(
                "health_check.max_check_interval_sec ({}) must be >= min_check_interval_sec ({})",
                hc.max_check_interval_sec, hc.min_check_interval_sec
            ));
        }

        if !(1..=10).contains(&hc.expire_multiplier) {
            return Err("health_check.expire_multiplier must be between 1 and 10".to_string());
        }

        if hc.time_wheel.interval_ms == 0 {
            return Err("health_check.time_wheel.interval_ms cannot be zero".to_string());
        }

        if hc.time_wheel.slot_num == 0 || hc.time_wheel.slot_num > 86400 {
            return Err("health_check.time_wheel.slot_num must be between 1 and 86400".to_string());
        }

        if hc.adoption.batch_count == 0 {
            return Err("health_check.adoption.batch_count cannot be zero".to_string());
        }

        if hc.adoption.batch_interval_ms == 0 {
            return Err("health_check.adoption.batch_interval_ms cannot be zero".to_string());
        }

        if hc.adoption.channel_capacity == 0 {
            return Err("health_check.adoption.channel_capacity cannot be zero".to_string());
        }

        if self.time_adjust.interval_sec == 0 || self.time_adjust.interval_sec > 3600 {
            return Err("time_adjust.interval_sec must be between 1 and 3600 seconds".to_string());
        }

        if self.dispatch.event_interval_ms == 0 {
            return Err("dispatch.event_interval_ms cannot be zero".to_string());
        }

        if self.dispatch.ensure_interval_sec == 0 {
            return Err("dispatch.ensure_interval_sec cannot be zero".to_string());
        }

        if self.dispatch.virtual_nodes == 0 {
            return Err("dispatch.virtual_nodes cannot be zero".to_string());
        }

        if self.batch_write.enable {
            if self.batch_write.max_batch_size == 0 {
                return Err("batch_write.max_batch_size cannot be zero".to_string());
            }
            if self.batch_write.flush_interval_ms == 0 {
                return Err("batch_write.flush_interval_ms cannot be zero".to_string());
            }
        }

        if hc.enable && self.checkers.is_empty() {
            return Err("at least one checker must be configured when health check is enabled"
                .to_string());
        }

        let mut names = HashSet::new();
        for checker in &self.checkers {
            if !names.insert(checker.name()) {
                return Err(format!("checker '{}' is configured twice", checker.name()));
            }
            if let CheckerConfig::Redis(redis) = checker {
                if !(100..=30000).contains(&redis.connection_timeout_ms) {
                    return Err(
                        "heartbeatRedis connection_timeout_ms must be between 100 and 30000 ms"
                            .to_string(),
                    );
                }
                if !(100..=60000).contains(&redis.command_timeout_ms) {
                    return Err(
                        "heartbeatRedis command_timeout_ms must be between 100 and 60000 ms"
                            .to_string(),
                    );
                }
            }
        }

        Ok(())
    }
}
