//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了健康检查系统的错误类型和处理机制。

use thiserror::Error;

/// 健康检查系统错误类型枚举
///
/// 定义了健康检查系统中可能发生的各种错误类型
#[derive(Error, Debug)]
pub enum CheckError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// 检查器后端错误
    #[error("Checker error: {0}")]
    CheckerError(String),

    /// 存储层错误
    #[error("Store error: {0}")]
    StoreError(String),

    /// 实例不存在
    #[error("Instance not found: {0}")]
    NotFound(String),

    /// 对未开启健康检查的实例上报心跳
    #[error("Heartbeat on disabled instance: {0}")]
    HeartbeatOnDisabledInstance(String),

    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 配置文件解析错误
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Redis错误
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    /// IO错误
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// 超时错误
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// 关闭错误
    #[error("Shutdown error: {0}")]
    ShutdownError(String),
}

/// 健康检查操作结果类型别名
pub type Result<T> = std::result::Result<T, CheckError>;
