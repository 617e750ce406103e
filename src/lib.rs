//! oxcheck - 分布式健康检查调度引擎
//!
//! 为服务注册中心提供基于心跳的实例健康检查：
//! 时间轮调度、按检查器批量领养、多节点一致性哈希分发，
//! 以及本地时钟与存储层时钟的校准。

#![doc(html_root_url = "https://docs.rs/oxcheck/0.1.0")]

pub use tokio;

pub mod cache_provider;
pub mod checker;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod model;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod sync;
pub mod time_adjust;
pub mod timewheel;
pub mod utils;

// Re-export commonly used items
pub use cache_provider::{CacheEvent, CacheListener, CacheProvider};
pub use checker::HealthChecker;
pub use config::Config;
pub use error::{CheckError, Result};
pub use model::{Instance, InstanceWithChecker};
pub use scheduler::CheckScheduler;
pub use server::{Heartbeat, HealthCheckServer};
pub use store::Store;
pub use time_adjust::TimeAdjuster;
pub use timewheel::TimeWheel;

/// oxcheck 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
