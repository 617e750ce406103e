//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块实现了基于内存的存储层，用于单机运行和测试。

use super::Store;
use crate::checker::{system_time_sec, TimeFn};
use crate::error::{CheckError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// 存储中的健康状态记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub status: i32,
    pub revision: String,
}

/// 内存存储
pub struct MemoryStore {
    statuses: DashMap<String, StatusRecord>,
    clock: TimeFn,
    clock_offset_sec: AtomicI64,
    fail_get_now: AtomicBool,
    fail_writes: AtomicBool,
    write_count: AtomicU64,
    batch_write_count: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(system_time_sec))
    }

    /// 使用指定时钟创建存储
    pub fn with_clock(clock: TimeFn) -> Self {
        Self {
            statuses: DashMap::new(),
            clock,
            clock_offset_sec: AtomicI64::new(0),
            fail_get_now: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            write_count: AtomicU64::new(0),
            batch_write_count: AtomicU64::new(0),
        }
    }

    /// 设置存储时钟相对于基准时钟的偏移（秒）
    pub fn set_clock_offset(&self, offset_sec: i64) {
        self.clock_offset_sec.store(offset_sec, Ordering::SeqCst);
    }

    /// 让获取时间的调用失败
    pub fn set_fail_get_now(&self, fail: bool) {
        self.fail_get_now.store(fail, Ordering::SeqCst);
    }

    /// 让写入调用失败
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// 实例当前的健康状态记录
    pub fn status_of(&self, instance_id: &str) -> Option<StatusRecord> {
        self.statuses.get(instance_id).map(|r| r.value().clone())
    }

    /// 成功写入的实例状态数
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::SeqCst)
    }

    /// 批量写入调用次数
    pub fn batch_write_count(&self) -> u64 {
        self.batch_write_count.load(Ordering::SeqCst)
    }

    fn write(&self, instance_id: &str, status: i32, revision: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CheckError::StoreError(format!(
                "write health status of {} rejected",
                instance_id
            )));
        }
        self.statuses.insert(
            instance_id.to_string(),
            StatusRecord {
                status,
                revision: revision.to_string(),
            },
        );
        self.write_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_now(&self) -> Result<i64> {
        if self.fail_get_now.load(Ordering::SeqCst) {
            return Err(CheckError::StoreError("clock source unavailable".to_string()));
        }
        Ok((self.clock)() + self.clock_offset_sec.load(Ordering::SeqCst))
    }

    async fn set_instance_health_status(
        &self,
        instance_id: &str,
        status: i32,
        revision: &str,
    ) -> Result<()> {
        self.write(instance_id, status, revision)
    }

    async fn batch_set_instance_health_status(
        &self,
        instance_ids: &[String],
        status: i32,
        revision: &str,
    ) -> Result<()> {
        self.batch_write_count.fetch_add(1, Ordering::SeqCst);
        for instance_id in instance_ids {
            self.write(instance_id, status, revision)?;
        }
        Ok(())
    }
}
