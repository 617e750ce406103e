//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了健康检查引擎依赖的存储层接口。

pub mod memory;

use crate::error::Result;
use async_trait::async_trait;

/// 存储层接口
///
/// 提供权威时钟和实例健康状态的持久化
#[async_trait]
pub trait Store: Send + Sync {
    /// 获取存储层的当前时间（秒级Unix时间戳）
    async fn get_now(&self) -> Result<i64>;

    /// 设置实例健康状态
    ///
    /// # 参数
    ///
    /// * `instance_id` - 实例ID
    /// * `status` - 健康状态（1: 健康, 0: 不健康）
    /// * `revision` - 新的修订号
    async fn set_instance_health_status(
        &self,
        instance_id: &str,
        status: i32,
        revision: &str,
    ) -> Result<()>;

    /// 批量设置实例健康状态
    async fn batch_set_instance_health_status(
        &self,
        instance_ids: &[String],
        status: i32,
        revision: &str,
    ) -> Result<()> {
        for instance_id in instance_ids {
            self.set_instance_health_status(instance_id, status, revision)
                .await?;
        }
        Ok(())
    }
}

pub use memory::MemoryStore;
